//! Staging-area I/O for Marquee: bounded stage runner, archive fetch,
//! decompression and pre-run cleanup.

use std::collections::BTreeMap;
use std::fs::File;
use std::future::Future;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use flate2::read::MultiGzDecoder;
use marquee_core::{DatasetKind, DatasetSource, PipelineError, Stage};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "marquee-storage";

/// Worker cap shared by the fetch, decompress and load pools.
pub const DEFAULT_STAGE_CONCURRENCY: usize = 6;

/// Run one task per dataset with at most `concurrency` in flight.
///
/// Every task is driven to completion before the stage result is decided.
/// If any task failed, all failures are returned together.
pub async fn run_stage<T, Fut, I>(
    stage: Stage,
    concurrency: usize,
    tasks: I,
) -> Result<BTreeMap<DatasetKind, T>, PipelineError>
where
    I: IntoIterator<Item = (DatasetKind, Fut)>,
    Fut: Future<Output = Result<T, PipelineError>> + Send + 'static,
    T: Send + 'static,
{
    let limit = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut set = JoinSet::new();
    for (dataset, task) in tasks {
        let limit = Arc::clone(&limit);
        set.spawn(async move {
            let result = match limit.acquire_owned().await {
                Ok(permit) => {
                    let out = task.await;
                    drop(permit);
                    out
                }
                Err(err) => Err(PipelineError::Task {
                    stage,
                    message: err.to_string(),
                }),
            };
            (dataset, result)
        });
    }

    let mut done = BTreeMap::new();
    let mut failures = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((dataset, Ok(value))) => {
                done.insert(dataset, value);
            }
            Ok((dataset, Err(err))) => {
                warn!(%stage, %dataset, error = %err, "stage task failed");
                failures.push(err);
            }
            Err(join_err) => {
                warn!(%stage, error = %join_err, "stage task aborted");
                failures.push(PipelineError::Task {
                    stage,
                    message: join_err.to_string(),
                });
            }
        }
    }

    if failures.is_empty() {
        Ok(done)
    } else {
        Err(PipelineError::StageFailed { stage, failures })
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// `None` keeps the request open for as long as the server streams.
    pub timeout: Option<Duration>,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            user_agent: Some("marquee/0.1".to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("url {0} has no file name segment")]
    NoFileName(String),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl FetchError {
    fn io(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> FetchError {
        let context = context.into();
        move |source| FetchError::Io { context, source }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedArchive {
    pub url: String,
    pub path: PathBuf,
    pub bytes: u64,
}

/// Final path segment of a URL, used as the local archive name.
pub fn file_name_from_url(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let name = parsed.path_segments()?.next_back()?;
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    /// Stream `url` into `dir/<last url segment>`, replacing any existing file.
    ///
    /// The body lands in a hidden temp file first and is renamed into place
    /// only after the last chunk has been flushed.
    pub async fn download_to_dir(
        &self,
        url: &str,
        dir: &Path,
    ) -> Result<FetchedArchive, FetchError> {
        let file_name =
            file_name_from_url(url).ok_or_else(|| FetchError::NoFileName(url.to_string()))?;
        let target = dir.join(&file_name);

        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }

        let temp_path = dir.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));
        let bytes = match stream_body(resp, &temp_path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                return Err(err);
            }
        };

        if let Err(err) = fs::rename(&temp_path, &target).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(FetchError::Io {
                context: format!(
                    "renaming {} -> {}",
                    temp_path.display(),
                    target.display()
                ),
                source: err,
            });
        }

        Ok(FetchedArchive {
            url: url.to_string(),
            path: target,
            bytes,
        })
    }
}

async fn stream_body(mut resp: reqwest::Response, temp_path: &Path) -> Result<u64, FetchError> {
    let mut file = fs::File::create(temp_path)
        .await
        .map_err(FetchError::io(format!("creating {}", temp_path.display())))?;
    let mut bytes = 0u64;
    while let Some(chunk) = resp.chunk().await? {
        file.write_all(&chunk)
            .await
            .map_err(FetchError::io(format!("writing {}", temp_path.display())))?;
        bytes += chunk.len() as u64;
    }
    file.flush()
        .await
        .map_err(FetchError::io(format!("flushing {}", temp_path.display())))?;
    Ok(bytes)
}

/// Fetch every archive, at most `concurrency` at a time.
pub async fn fetch_all(
    fetcher: Arc<HttpFetcher>,
    run_id: Uuid,
    sources: &[DatasetSource],
    concurrency: usize,
) -> Result<BTreeMap<DatasetKind, FetchedArchive>, PipelineError> {
    let tasks = sources.iter().cloned().map(|source| {
        let fetcher = Arc::clone(&fetcher);
        let span = info_span!(
            "fetch",
            %run_id,
            stage = %Stage::Fetch,
            dataset = %source.kind,
            url = %source.url
        );
        let task = async move {
            let dir = staging_dir_of(&source.archive_path);
            let fetched = fetcher
                .download_to_dir(&source.url, &dir)
                .await
                .map_err(|err| PipelineError::acquisition(source.kind, Stage::Fetch, err))?;
            info!(bytes = fetched.bytes, path = %fetched.path.display(), "archive fetched");
            Ok(fetched)
        }
        .instrument(span);
        (source.kind, task)
    });
    run_stage(Stage::Fetch, concurrency, tasks).await
}

fn staging_dir_of(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Gunzip `archive` into `output`, truncating any previous output.
pub fn decompress_archive(archive: &Path, output: &Path) -> anyhow::Result<u64> {
    let input = File::open(archive).with_context(|| format!("opening {}", archive.display()))?;
    let mut decoder = MultiGzDecoder::new(BufReader::new(input));
    let file = File::create(output).with_context(|| format!("creating {}", output.display()))?;
    let mut writer = BufWriter::new(file);
    let written = std::io::copy(&mut decoder, &mut writer)
        .with_context(|| format!("decompressing {} -> {}", archive.display(), output.display()))?;
    writer
        .flush()
        .with_context(|| format!("flushing {}", output.display()))?;
    Ok(written)
}

/// Decompress every staged archive into its table path.
pub async fn decompress_all(
    run_id: Uuid,
    sources: &[DatasetSource],
    concurrency: usize,
) -> Result<BTreeMap<DatasetKind, u64>, PipelineError> {
    let tasks = sources.iter().cloned().map(|source| {
        let span = info_span!(
            "decompress",
            %run_id,
            stage = %Stage::Decompress,
            dataset = %source.kind
        );
        let task = async move {
            let kind = source.kind;
            let written = tokio::task::spawn_blocking(move || {
                decompress_archive(&source.archive_path, &source.table_path)
            })
            .await
            .map_err(|err| PipelineError::Task {
                stage: Stage::Decompress,
                message: err.to_string(),
            })?
            .map_err(|err| PipelineError::acquisition(kind, Stage::Decompress, err))?;
            info!(bytes = written, "archive decompressed");
            Ok(written)
        }
        .instrument(span);
        (source.kind, task)
    });
    run_stage(Stage::Decompress, concurrency, tasks).await
}

/// Remove staged archives and tables left by a previous run.
///
/// Only a missing file is tolerated; any other I/O failure aborts.
pub async fn clear_staging(sources: &[DatasetSource]) -> Result<usize, PipelineError> {
    let mut removed = 0usize;
    for source in sources {
        for path in [&source.archive_path, &source.table_path] {
            match fs::remove_file(path).await {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(PipelineError::acquisition(
                        source.kind,
                        Stage::Cleanup,
                        anyhow!(err).context(format!("removing {}", path.display())),
                    ));
                }
            }
        }
    }
    Ok(removed)
}
