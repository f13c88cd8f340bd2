mod client;

pub use client::{
    AccountInfo, AccountSettings, ApiErrorClass, DiskInfo, FilePage, FileRecord, FileType,
    PutioClient, PutioError, ROOT_FOLDER_ID, TransferPage, TransferRecord, TransferStatus,
};
