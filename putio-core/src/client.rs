use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const DEFAULT_BASE_URL: &str = "https://api.put.io";
const DEFAULT_UPLOAD_URL: &str = "https://upload.put.io/v2/files/upload";

/// Id of the account's root folder. Top-level files report it as their parent.
pub const ROOT_FOLDER_ID: u64 = 0;

#[derive(Debug, Error)]
pub enum PutioError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("api response missing field `{0}`")]
    MissingField(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

#[derive(Clone)]
pub struct PutioClient {
    http: Client,
    base_url: Url,
    upload_url: Url,
    token: String,
}

impl PutioClient {
    pub fn new(token: impl Into<String>) -> Result<Self, PutioError> {
        Self::with_urls(DEFAULT_BASE_URL, DEFAULT_UPLOAD_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, PutioError> {
        let base = Url::parse(base_url)?;
        let upload = base.join("/v2/files/upload")?;
        Ok(Self {
            http: Client::new(),
            base_url: base,
            upload_url: upload,
            token: token.into(),
        })
    }

    pub fn with_urls(
        base_url: &str,
        upload_url: &str,
        token: impl Into<String>,
    ) -> Result<Self, PutioError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            upload_url: Url::parse(upload_url)?,
            token: token.into(),
        })
    }

    pub async fn account_info(&self) -> Result<AccountInfo, PutioError> {
        let url = self.endpoint("/v2/account/info")?;
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        let payload: InfoResponse = Self::handle_response(response).await?;
        Ok(payload.info)
    }

    pub async fn account_settings(&self) -> Result<AccountSettings, PutioError> {
        let url = self.endpoint("/v2/account/settings")?;
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        let payload: SettingsResponse = Self::handle_response(response).await?;
        Ok(payload.settings)
    }

    /// First page of every file in the account, flat and parent-linked.
    pub async fn list_files(&self, per_page: u32) -> Result<FilePage, PutioError> {
        let mut url = self.endpoint("/v2/files/list")?;
        url.query_pairs_mut()
            .append_pair("parent_id", "-1")
            .append_pair("per_page", &per_page.max(1).to_string());
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Ok(Self::handle_response::<FilePage>(response).await?.normalized())
    }

    pub async fn continue_files(&self, cursor: &str, per_page: u32) -> Result<FilePage, PutioError> {
        let url = self.endpoint("/v2/files/list/continue")?;
        let per_page = per_page.max(1).to_string();
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .form(&[("cursor", cursor), ("per_page", per_page.as_str())])
            .send()
            .await?;
        Ok(Self::handle_response::<FilePage>(response).await?.normalized())
    }

    /// Direct children of a single folder. Not paginated past the first page.
    pub async fn list_folder(&self, folder_id: u64) -> Result<Vec<FileRecord>, PutioError> {
        let mut url = self.endpoint("/v2/files/list")?;
        url.query_pairs_mut()
            .append_pair("parent_id", &folder_id.to_string());
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        let page: FilePage = Self::handle_response(response).await?;
        Ok(page.files)
    }

    pub async fn delete_files(&self, ids: &[u64]) -> Result<(), PutioError> {
        let url = self.endpoint("/v2/files/delete")?;
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .form(&[("file_ids", join_ids(ids))])
            .send()
            .await?;
        Self::handle_empty(response).await
    }

    /// Time-limited direct download URL for a file.
    pub async fn file_url(&self, file_id: u64) -> Result<Url, PutioError> {
        let url = self.endpoint(&format!("/v2/files/{file_id}/url"))?;
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        let payload: UrlResponse = Self::handle_response(response).await?;
        Ok(payload.url)
    }

    pub async fn list_transfers(&self, per_page: u32) -> Result<TransferPage, PutioError> {
        let mut url = self.endpoint("/v2/transfers/list")?;
        url.query_pairs_mut()
            .append_pair("per_page", &per_page.max(1).to_string());
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Ok(Self::handle_response::<TransferPage>(response)
            .await?
            .normalized())
    }

    pub async fn continue_transfers(
        &self,
        cursor: &str,
        per_page: u32,
    ) -> Result<TransferPage, PutioError> {
        let url = self.endpoint("/v2/transfers/list/continue")?;
        let per_page = per_page.max(1).to_string();
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .form(&[("cursor", cursor), ("per_page", per_page.as_str())])
            .send()
            .await?;
        Ok(Self::handle_response::<TransferPage>(response)
            .await?
            .normalized())
    }

    pub async fn get_transfer(&self, id: u64) -> Result<TransferRecord, PutioError> {
        let url = self.endpoint(&format!("/v2/transfers/{id}"))?;
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        let payload: TransferResponse = Self::handle_response(response).await?;
        payload.transfer.ok_or(PutioError::MissingField("transfer"))
    }

    /// Starts a transfer from a magnet or http URL.
    pub async fn add_transfer(&self, source_url: &str) -> Result<TransferRecord, PutioError> {
        let url = self.endpoint("/v2/transfers/add")?;
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .form(&[("url", source_url)])
            .send()
            .await?;
        let payload: TransferResponse = Self::handle_response(response).await?;
        payload.transfer.ok_or(PutioError::MissingField("transfer"))
    }

    /// Uploads a .torrent file; put.io answers with the transfer it created.
    pub async fn upload_torrent(
        &self,
        bytes: Vec<u8>,
        filename: &str,
    ) -> Result<TransferRecord, PutioError> {
        let part = Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str("application/octet-stream")?;
        let form = Form::new()
            .part("file", part)
            .text("filename", filename.to_string());
        let response = self
            .http
            .post(self.upload_url.clone())
            .header("Authorization", self.auth_header_value())
            .multipart(form)
            .send()
            .await?;
        let payload: TransferResponse = Self::handle_response(response).await?;
        payload.transfer.ok_or(PutioError::MissingField("transfer"))
    }

    pub async fn remove_transfers(&self, ids: &[u64]) -> Result<(), PutioError> {
        let url = self.endpoint("/v2/transfers/remove")?;
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .form(&[("transfer_ids", join_ids(ids))])
            .send()
            .await?;
        Self::handle_empty(response).await
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn endpoint(&self, path: &str) -> Result<Url, PutioError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, PutioError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(PutioError::Api { status, body })
        }
    }

    async fn handle_empty(response: reqwest::Response) -> Result<(), PutioError> {
        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(PutioError::Api { status, body })
        }
    }
}

impl PutioError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            PutioError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_EARLY
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

fn join_ids(ids: &[u64]) -> String {
    ids.iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn non_empty(cursor: Option<String>) -> Option<String> {
    cursor.filter(|c| !c.is_empty())
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AccountInfo {
    #[serde(default)]
    pub username: String,
    pub disk: DiskInfo,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct DiskInfo {
    #[serde(default)]
    pub avail: u64,
    #[serde(default)]
    pub used: u64,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AccountSettings {
    #[serde(default)]
    pub callback_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct FileRecord {
    pub id: u64,
    #[serde(default)]
    pub parent_id: Option<u64>,
    pub name: String,
    pub file_type: FileType,
    #[serde(default)]
    pub size: u64,
}

impl FileRecord {
    pub fn is_folder(&self) -> bool {
        self.file_type == FileType::Folder
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileType {
    Folder,
    File,
    Video,
    Audio,
    Image,
    Text,
    Pdf,
    Archive,
    Swf,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct TransferRecord {
    pub id: u64,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub file_id: Option<u64>,
    pub status: TransferStatus,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub downloaded: u64,
    #[serde(default)]
    pub percent_done: Option<u8>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl TransferRecord {
    /// True once put.io reports the transfer completed and every byte is present remotely.
    pub fn is_fully_downloaded(&self) -> bool {
        self.status == TransferStatus::Completed && self.downloaded == self.size
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStatus {
    InQueue,
    Waiting,
    PreparingDownload,
    Downloading,
    Completing,
    Seeding,
    Completed,
    Error,
    #[serde(other)]
    Unknown,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::InQueue => "in_queue",
            TransferStatus::Waiting => "waiting",
            TransferStatus::PreparingDownload => "preparing_download",
            TransferStatus::Downloading => "downloading",
            TransferStatus::Completing => "completing",
            TransferStatus::Seeding => "seeding",
            TransferStatus::Completed => "completed",
            TransferStatus::Error => "error",
            TransferStatus::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FilePage {
    #[serde(default)]
    pub files: Vec<FileRecord>,
    #[serde(default)]
    pub cursor: Option<String>,
}

impl FilePage {
    fn normalized(mut self) -> Self {
        self.cursor = non_empty(self.cursor);
        self
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TransferPage {
    #[serde(default)]
    pub transfers: Vec<TransferRecord>,
    #[serde(default)]
    pub cursor: Option<String>,
}

impl TransferPage {
    fn normalized(mut self) -> Self {
        self.cursor = non_empty(self.cursor);
        self
    }
}

#[derive(Debug, Deserialize)]
struct InfoResponse {
    info: AccountInfo,
}

#[derive(Debug, Deserialize)]
struct SettingsResponse {
    settings: AccountSettings,
}

#[derive(Debug, Deserialize)]
struct TransferResponse {
    #[serde(default)]
    transfer: Option<TransferRecord>,
}

#[derive(Debug, Deserialize)]
struct UrlResponse {
    url: Url,
}
