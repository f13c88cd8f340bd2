use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use putio_core::PutioClient;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::sync::engine::{EngineOutputs, SyncEngine};
use crate::sync::events::{Downloadable, LocalComplete, LocalDrop, TransferReported};
use crate::sync::local_watcher::{DropWatcher, start_notify_watcher};
use crate::sync::refresh::fetch_snapshot;
use crate::sync::remote::{LoggingRemote, PutioRemote, RemoteService};
use crate::sync::report::StatusReport;
use crate::sync::transfer::{DownloadDirs, Downloader};
use crate::telemetry::LogFormat;
use crate::webhook;

pub const DEFAULT_API_URL: &str = "https://api.put.io";
pub const DEFAULT_UPLOAD_URL: &str = "https://upload.put.io/v2/files/upload";
pub const DEFAULT_WEBHOOK_HOST: &str = "0.0.0.0";
pub const DEFAULT_WEBHOOK_PORT: u16 = 8121;
pub const DEFAULT_WEBHOOK_BASE_PATH: &str = "/putio";

const TOKEN_VAR: &str = "METTRE_PUTIO_TOKEN";
const WATCH_DIR_VAR: &str = "METTRE_WATCH_DIR";
const INCOMPLETE_DIR_VAR: &str = "METTRE_INCOMPLETE_DIR";
const COMPLETE_DIR_VAR: &str = "METTRE_COMPLETE_DIR";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("watch, incomplete and complete directories must all differ")]
    SameDirectories,
    #[error("{name} has an invalid value `{value}`")]
    Invalid { name: &'static str, value: String },
}

#[derive(Clone)]
pub struct DaemonConfig {
    pub token: String,
    pub watch_dir: PathBuf,
    pub incomplete_dir: PathBuf,
    pub complete_dir: PathBuf,
    pub api_url: String,
    pub upload_url: String,
    pub webhook_host: String,
    pub webhook_port: u16,
    pub webhook_base_path: String,
    pub refresh_debounce: Duration,
    pub finalize_retry: Duration,
    pub page_size: u32,
    pub download_concurrency: usize,
    pub trace_remote: bool,
    pub log_format: LogFormat,
}

impl fmt::Debug for DaemonConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DaemonConfig")
            .field("token", &"<redacted>")
            .field("watch_dir", &self.watch_dir)
            .field("incomplete_dir", &self.incomplete_dir)
            .field("complete_dir", &self.complete_dir)
            .field("api_url", &self.api_url)
            .field("upload_url", &self.upload_url)
            .field("webhook_host", &self.webhook_host)
            .field("webhook_port", &self.webhook_port)
            .field("webhook_base_path", &self.webhook_base_path)
            .field("refresh_debounce", &self.refresh_debounce)
            .field("finalize_retry", &self.finalize_retry)
            .field("page_size", &self.page_size)
            .field("download_concurrency", &self.download_concurrency)
            .field("trace_remote", &self.trace_remote)
            .field("log_format", &self.log_format)
            .finish()
    }
}

impl DaemonConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let home = dirs::home_dir();
        Self::from_lookup(|name| env::var(name).ok(), home.as_deref())
    }

    /// Builds the config from any variable source; `home` resolves leading `~`.
    pub fn from_lookup<F>(lookup: F, home: Option<&Path>) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let token = read_required(&lookup, TOKEN_VAR)?;
        let watch_dir = read_dir(&lookup, WATCH_DIR_VAR, home)?;
        let incomplete_dir = read_dir(&lookup, INCOMPLETE_DIR_VAR, home)?;
        let complete_dir = read_dir(&lookup, COMPLETE_DIR_VAR, home)?;
        ensure_distinct(&[&watch_dir, &incomplete_dir, &complete_dir])?;

        let webhook_port = match non_blank(lookup("METTRE_WEBHOOK_PORT")) {
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
                name: "METTRE_WEBHOOK_PORT",
                value,
            })?,
            None => DEFAULT_WEBHOOK_PORT,
        };
        let log_format = match non_blank(lookup("METTRE_LOG_FORMAT")) {
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
                name: "METTRE_LOG_FORMAT",
                value,
            })?,
            None => LogFormat::default(),
        };

        Ok(Self {
            token,
            watch_dir,
            incomplete_dir,
            complete_dir,
            api_url: read_string(&lookup, "METTRE_PUTIO_API_URL", DEFAULT_API_URL),
            upload_url: read_string(&lookup, "METTRE_PUTIO_UPLOAD_URL", DEFAULT_UPLOAD_URL),
            webhook_host: read_string(&lookup, "METTRE_WEBHOOK_HOST", DEFAULT_WEBHOOK_HOST),
            webhook_port,
            webhook_base_path: read_string(
                &lookup,
                "METTRE_WEBHOOK_BASE_PATH",
                DEFAULT_WEBHOOK_BASE_PATH,
            ),
            refresh_debounce: Duration::from_millis(read_u64(
                &lookup,
                "METTRE_REFRESH_DEBOUNCE_MS",
                1000,
            )),
            finalize_retry: Duration::from_millis(read_u64(
                &lookup,
                "METTRE_FINALIZE_RETRY_MS",
                2000,
            )),
            page_size: read_u64(&lookup, "METTRE_PAGE_SIZE", 500).min(u64::from(u32::MAX)) as u32,
            download_concurrency: read_u64(&lookup, "METTRE_DOWNLOAD_CONCURRENCY", 4) as usize,
            trace_remote: read_bool(&lookup, "METTRE_TRACE_REMOTE", false),
            log_format,
        })
    }

    pub fn download_dirs(&self) -> DownloadDirs {
        DownloadDirs {
            incomplete: self.incomplete_dir.clone(),
            complete: self.complete_dir.clone(),
        }
    }
}

/// Receiving ends of the channels the engine writes to.
struct EngineChannels {
    downloads: mpsc::UnboundedReceiver<Downloadable>,
    discards: mpsc::UnboundedReceiver<PathBuf>,
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    client: PutioClient,
    engine: Arc<SyncEngine>,
    channels: EngineChannels,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        for dir in [&config.watch_dir, &config.incomplete_dir, &config.complete_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        let client = build_client(&config)?;
        let remote = build_remote(&config, client.clone());

        let (downloads_tx, downloads) = mpsc::unbounded_channel();
        let (discards_tx, discards) = mpsc::unbounded_channel();
        let engine = SyncEngine::with_timing(
            remote,
            EngineOutputs {
                downloads: downloads_tx,
                discards: discards_tx,
            },
            config.refresh_debounce,
            config.finalize_retry,
        );
        tracing::info!(
            watch = %config.watch_dir.display(),
            incomplete = %config.incomplete_dir.display(),
            complete = %config.complete_dir.display(),
            "daemon configured"
        );

        Ok(Self {
            config,
            client,
            engine: Arc::new(engine),
            channels: EngineChannels { downloads, discards },
        })
    }

    pub fn engine(&self) -> Arc<SyncEngine> {
        Arc::clone(&self.engine)
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let DaemonRuntime {
            config,
            client,
            engine,
            channels,
        } = self;

        match client.account_settings().await {
            Ok(settings) => match settings.callback_url.as_deref().filter(|url| !url.is_empty()) {
                Some(url) => tracing::info!(callback_url = url, "put.io callback configured"),
                None => tracing::warn!(
                    "put.io account has no callback URL, transfers will only be picked up on restart"
                ),
            },
            Err(err) => tracing::warn!(error = %err, "could not read put.io account settings"),
        }

        let (drops_tx, drops) = mpsc::unbounded_channel::<LocalDrop>();
        let (reports_tx, reports) = mpsc::unbounded_channel::<TransferReported>();
        let (completions_tx, completions) = mpsc::unbounded_channel::<LocalComplete>();

        let listener = TcpListener::bind((config.webhook_host.as_str(), config.webhook_port))
            .await
            .with_context(|| {
                format!(
                    "failed to bind webhook listener on {}:{}",
                    config.webhook_host, config.webhook_port
                )
            })?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let router = webhook::router(&config.webhook_base_path, reports_tx);
        let webhook_task = tokio::spawn(async move {
            let shutdown = async {
                let _ = shutdown_rx.await;
            };
            if let Err(err) = webhook::serve(listener, router, shutdown).await {
                tracing::error!(error = %err, "webhook server stopped");
            }
        });

        let (_watcher, events) = start_notify_watcher(&config.watch_dir)
            .with_context(|| format!("failed to watch {}", config.watch_dir.display()))?;
        let watcher_task = tokio::spawn(
            DropWatcher::new(config.watch_dir.clone(), drops_tx).run(events, channels.discards),
        );
        let downloader = Downloader::new(
            config.download_dirs(),
            config.download_concurrency,
            completions_tx,
        );
        let downloader_task = tokio::spawn(downloader.run(channels.downloads));

        let drop_task = spawn_dispatch(drops, Arc::clone(&engine), |engine, dropped| async move {
            let path = dropped.path.clone();
            if let Err(err) = engine.submit(dropped).await {
                tracing::error!(path = %path.display(), error = %err, transient = err.is_transient(), "submission failed");
            }
        });
        let report_task = spawn_dispatch(reports, Arc::clone(&engine), |engine, report| async move {
            let hash = report.hash.clone();
            if let Err(err) = engine.on_transfer_reported(report).await {
                tracing::error!(%hash, error = %err, transient = err.is_transient(), "transfer report not processed");
            }
        });
        let completion_task =
            spawn_dispatch(completions, Arc::clone(&engine), |engine, done| async move {
                if let Err(err) = engine.on_local_complete(&done.path).await {
                    tracing::error!(path = %done.path, error = %err, "local completion not processed");
                }
            });

        let resume_engine = Arc::clone(&engine);
        let resume_task = tokio::spawn(async move {
            match resume_engine.resume_completed().await {
                Ok(0) => {}
                Ok(count) => tracing::info!(count, "resumed transfers finished while offline"),
                Err(err) => tracing::warn!(error = %err, "could not resume finished transfers"),
            }
        });

        tracing::info!("mettre daemon started");
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for shutdown signal")?;
        tracing::info!("shutdown requested");

        let _ = shutdown_tx.send(());
        for handle in [
            resume_task,
            drop_task,
            report_task,
            completion_task,
            watcher_task,
            downloader_task,
        ] {
            handle.abort();
        }
        if let Err(err) = webhook_task.await
            && !err.is_cancelled()
        {
            tracing::warn!(error = %err, "webhook task ended abnormally");
        }
        Ok(())
    }
}

/// One refresh against put.io, summarised for `--status`.
pub async fn status_report(config: &DaemonConfig) -> anyhow::Result<StatusReport> {
    let client = build_client(config)?;
    let remote = build_remote(config, client);
    let snapshot = fetch_snapshot(remote.as_ref())
        .await
        .context("failed to read put.io state")?;
    Ok(StatusReport::from(&snapshot))
}

fn build_client(config: &DaemonConfig) -> anyhow::Result<PutioClient> {
    PutioClient::with_urls(&config.api_url, &config.upload_url, config.token.clone())
        .context("invalid put.io endpoint URL")
}

fn build_remote(config: &DaemonConfig, client: PutioClient) -> Arc<dyn RemoteService> {
    let remote = PutioRemote::new(client, config.page_size);
    if config.trace_remote {
        Arc::new(LoggingRemote::new(remote))
    } else {
        Arc::new(remote)
    }
}

fn spawn_dispatch<T, F, Fut>(
    mut rx: mpsc::UnboundedReceiver<T>,
    engine: Arc<SyncEngine>,
    handler: F,
) -> JoinHandle<()>
where
    T: Send + 'static,
    F: Fn(Arc<SyncEngine>, T) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            tokio::spawn(handler(Arc::clone(&engine), item));
        }
    })
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
