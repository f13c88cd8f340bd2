pub mod descriptor;
pub mod engine;
pub mod events;
pub mod local_watcher;
pub mod paths;
pub mod refresh;
pub mod remote;
pub mod report;
#[cfg(test)]
pub(crate) mod testing;
pub mod transfer;
pub mod transfers;
pub mod tree;
