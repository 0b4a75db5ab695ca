//! Run orchestration: configuration, staged execution and partitioned export.

use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use marquee_core::{
    resolve_sources, DatasetKind, DatasetSource, MovieRecord, PipelineError, RoleCategory, Stage,
};
use marquee_loader::load_all;
use marquee_publish::{ExportArtifact, NoopSink, PublishSink};
use marquee_storage::{
    clear_staging, decompress_all, fetch_all, HttpClientConfig, HttpFetcher,
    DEFAULT_STAGE_CONCURRENCY,
};
use marquee_transform::{curate, RuntimeHours, TransformOptions};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "marquee-sync";

pub const DEFAULT_BASE_URL: &str = "https://datasets.imdbws.com/";
pub const DEFAULT_PARTS: usize = 5;
pub const MANIFEST_FILE: &str = "manifest.json";

/// Business-facing column names, in write order.
pub const EXPORT_HEADERS: [&str; 23] = [
    "Id",
    "Title",
    "Year",
    "Runtime",
    "FullRuntime",
    "RuntimeCategory",
    "Rating",
    "CategoryRating",
    "NumofVotes",
    "CategoryVotes",
    "Genres",
    "Genre 1",
    "Genre 2",
    "Genre 3",
    "Actor",
    "Actress",
    "Writer",
    "Director",
    "Producer",
    "Editor",
    "Composer",
    "Cinematographer",
    "Hyperlink",
];

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub base_url: String,
    pub workdir: PathBuf,
    pub export_dir: PathBuf,
    pub parts: usize,
    pub concurrency: usize,
    pub http_timeout_secs: Option<u64>,
    pub user_agent: String,
    pub runtime_hours: RuntimeHours,
    pub export_include_id: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let workdir = lookup("MARQUEE_WORKDIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            base_url: lookup("MARQUEE_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            export_dir: lookup("MARQUEE_EXPORT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| workdir.clone()),
            workdir,
            parts: lookup("MARQUEE_PARTS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_PARTS),
            concurrency: lookup("MARQUEE_CONCURRENCY")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_STAGE_CONCURRENCY),
            http_timeout_secs: lookup("MARQUEE_HTTP_TIMEOUT_SECS").and_then(|v| v.parse().ok()),
            user_agent: lookup("MARQUEE_USER_AGENT").unwrap_or_else(|| "marquee/0.1".to_string()),
            runtime_hours: lookup("MARQUEE_RUNTIME_HOURS")
                .and_then(|v| RuntimeHours::parse(&v))
                .unwrap_or_default(),
            export_include_id: lookup("MARQUEE_EXPORT_INCLUDE_ID")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
        }
    }

    pub fn sources(&self) -> Vec<DatasetSource> {
        resolve_sources(&self.base_url, &self.workdir)
    }
}

/// Contiguous, order-preserving ranges covering `rows`; the last range takes
/// the remainder.
pub fn partition_bounds(rows: usize, parts: usize) -> Vec<Range<usize>> {
    if parts == 0 {
        return Vec::new();
    }
    let part_size = rows / parts;
    (0..parts)
        .map(|i| {
            let start = i * part_size;
            let end = if i + 1 < parts { (i + 1) * part_size } else { rows };
            start..end
        })
        .collect()
}

pub fn part_file_name(index: usize) -> String {
    format!("movies_part{}.csv", index + 1)
}

/// Render a real number with `,` as the decimal separator.
pub fn format_decimal(value: f64) -> String {
    format!("{value:?}").replace('.', ",")
}

fn record_fields(record: &MovieRecord) -> Vec<String> {
    let mut fields = vec![
        record.id.clone(),
        record.title.clone(),
        record.year.clone(),
        record.runtime.to_string(),
        record.full_runtime.clone(),
        record.runtime_category.label().to_string(),
        format_decimal(record.rating),
        record.category_rating.label().to_string(),
        record.num_votes.to_string(),
        record.category_votes.label().to_string(),
        record.genres.clone(),
    ];
    fields.extend(record.genre_slots.iter().cloned());
    fields.extend(
        RoleCategory::EXPORT_ORDER
            .iter()
            .map(|role| record.cast.get(*role).unwrap_or_default().to_string()),
    );
    fields.push(record.hyperlink.clone());
    fields
}

/// Serialize rows as `;`-separated text with the business header.
pub fn render_partition(rows: &[MovieRecord], include_id: bool) -> Result<Vec<u8>, csv::Error> {
    let skip = usize::from(!include_id);
    let mut wtr = csv::WriterBuilder::new()
        .delimiter(b';')
        .from_writer(Vec::new());
    wtr.write_record(EXPORT_HEADERS.iter().skip(skip))?;
    for row in rows {
        wtr.write_record(record_fields(row).iter().skip(skip))?;
    }
    wtr.into_inner().map_err(|err| err.into_error().into())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportedPart {
    pub name: String,
    pub path: PathBuf,
    pub rows: usize,
    pub bytes: u64,
    pub sha256: String,
}

impl ExportedPart {
    pub fn artifact(&self) -> ExportArtifact {
        ExportArtifact {
            name: self.name.clone(),
            path: self.path.clone(),
        }
    }
}

/// Split `records` into `parts` files under `dir`.
pub fn export_partitions(
    records: &[MovieRecord],
    dir: &Path,
    parts: usize,
    include_id: bool,
) -> Result<Vec<ExportedPart>, PipelineError> {
    if parts == 0 {
        return Err(PipelineError::export(dir, "partition count must be at least 1"));
    }
    std::fs::create_dir_all(dir).map_err(|err| PipelineError::export(dir, err))?;

    partition_bounds(records.len(), parts)
        .into_iter()
        .enumerate()
        .map(|(i, range)| {
            let name = part_file_name(i);
            let path = dir.join(&name);
            let rows = range.len();
            let bytes = render_partition(&records[range], include_id)
                .map_err(|err| PipelineError::export(&path, err))?;
            std::fs::write(&path, &bytes).map_err(|err| PipelineError::export(&path, err))?;
            info!(file = %name, rows, "partition written");
            Ok(ExportedPart {
                name,
                rows,
                bytes: bytes.len() as u64,
                sha256: hex::encode(Sha256::digest(&bytes)),
                path,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub total_rows: usize,
    pub files: Vec<ExportedPart>,
}

pub fn write_manifest(dir: &Path, manifest: &ExportManifest) -> Result<PathBuf, PipelineError> {
    let path = dir.join(MANIFEST_FILE);
    let bytes =
        serde_json::to_vec_pretty(manifest).map_err(|err| PipelineError::export(&path, err))?;
    std::fs::write(&path, bytes).map_err(|err| PipelineError::export(&path, err))?;
    Ok(path)
}

/// Outcome of the local half of a run: decompress, load, curate, export.
#[derive(Debug, Clone, Serialize)]
pub struct BuildOutput {
    pub movies: usize,
    pub partitions: Vec<ExportedPart>,
    pub manifest: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub datasets: Vec<DatasetKind>,
    pub fetched_bytes: u64,
    pub movies: usize,
    pub partitions: Vec<ExportedPart>,
    pub export_dir: String,
    pub manifest: String,
    pub published: usize,
}

pub struct SyncPipeline {
    config: SyncConfig,
    http: Arc<HttpFetcher>,
    sink: Box<dyn PublishSink>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout_secs.map(Duration::from_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        Ok(Self {
            config,
            http: Arc::new(http),
            sink: Box::<NoopSink>::default(),
        })
    }

    pub fn with_sink(mut self, sink: Box<dyn PublishSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Delete staged archives and tables from earlier runs.
    pub async fn clean(&self) -> Result<usize> {
        let removed = clear_staging(&self.config.sources()).await?;
        info!(removed, "staging area cleared");
        Ok(removed)
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let sources = self.config.sources();

        fs::create_dir_all(&self.config.workdir)
            .await
            .with_context(|| format!("creating {}", self.config.workdir.display()))?;
        let removed = clear_staging(&sources).await?;
        info!(%run_id, removed, "staging area cleared");

        let fetched = fetch_all(
            Arc::clone(&self.http),
            run_id,
            &sources,
            self.config.concurrency,
        )
        .await?;
        let fetched_bytes: u64 = fetched.values().map(|a| a.bytes).sum();

        let build = self.build_from_archives(run_id, &sources).await?;

        let artifacts: Vec<ExportArtifact> =
            build.partitions.iter().map(ExportedPart::artifact).collect();
        let published = self
            .sink
            .publish(&artifacts)
            .instrument(info_span!(
                "publish",
                %run_id,
                stage = %Stage::Publish,
                sink = self.sink.name()
            ))
            .await
            .with_context(|| format!("publishing via {} sink", self.sink.name()))?;

        let finished_at = Utc::now();
        let elapsed_minutes = (finished_at - started_at).num_milliseconds() as f64 / 60_000.0;
        info!(
            %run_id,
            movies = build.movies,
            published,
            elapsed_minutes,
            "run complete"
        );

        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            datasets: sources.iter().map(|s| s.kind).collect(),
            fetched_bytes,
            movies: build.movies,
            partitions: build.partitions,
            export_dir: self.config.export_dir.display().to_string(),
            manifest: build.manifest.display().to_string(),
            published,
        })
    }

    /// Everything after the fetch barrier, starting from archives already
    /// staged at each source's archive path.
    pub async fn build_from_archives(
        &self,
        run_id: Uuid,
        sources: &[DatasetSource],
    ) -> Result<BuildOutput> {
        decompress_all(run_id, sources, self.config.concurrency).await?;
        let tables = load_all(run_id, sources, self.config.concurrency).await?;

        let options = TransformOptions {
            runtime_hours: self.config.runtime_hours,
        };
        let records = {
            let _span = info_span!("transform", %run_id, stage = %Stage::Transform).entered();
            curate(&tables, &options)?
        };
        drop(tables);

        let partitions = {
            let _span = info_span!("export", %run_id, stage = %Stage::Export).entered();
            export_partitions(
                &records,
                &self.config.export_dir,
                self.config.parts,
                self.config.export_include_id,
            )?
        };
        let manifest = write_manifest(
            &self.config.export_dir,
            &ExportManifest {
                schema_version: 1,
                run_id,
                generated_at: Utc::now(),
                total_rows: records.len(),
                files: partitions.clone(),
            },
        )?;

        Ok(BuildOutput {
            movies: records.len(),
            partitions,
            manifest,
        })
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    SyncPipeline::new(SyncConfig::from_env())?.run_once().await
}
