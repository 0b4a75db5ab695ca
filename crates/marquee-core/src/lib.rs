//! Core domain model, dataset resolution and error taxonomy for Marquee.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "marquee-core";

/// Escape token the raw dumps use for a missing scalar.
pub const SENTINEL: &str = r"\N";

/// Replacement label for missing text values in curated output.
pub const UNKNOWN: &str = "Unknown";

/// The four raw relations a run is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DatasetKind {
    NameBasics,
    TitleBasics,
    TitlePrincipals,
    TitleRatings,
}

impl DatasetKind {
    pub const ALL: [DatasetKind; 4] = [
        DatasetKind::NameBasics,
        DatasetKind::TitleBasics,
        DatasetKind::TitlePrincipals,
        DatasetKind::TitleRatings,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetKind::NameBasics => "name.basics",
            DatasetKind::TitleBasics => "title.basics",
            DatasetKind::TitlePrincipals => "title.principals",
            DatasetKind::TitleRatings => "title.ratings",
        }
    }

    pub fn table_file_name(&self) -> String {
        format!("{}.tsv", self.as_str())
    }

    pub fn archive_file_name(&self) -> String {
        format!("{}.gz", self.table_file_name())
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where one dataset comes from and where its staged files land.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetSource {
    pub kind: DatasetKind,
    pub url: String,
    pub archive_path: PathBuf,
    pub table_path: PathBuf,
}

/// Resolve every dataset to its fetch URL and local staging paths.
///
/// Pure lookup: the archive name is the final segment of the URL and the
/// table name is the archive name without its `.gz` suffix.
pub fn resolve_sources(base_url: &str, staging_dir: &Path) -> Vec<DatasetSource> {
    let base = base_url.trim_end_matches('/');
    DatasetKind::ALL
        .iter()
        .map(|&kind| DatasetSource {
            kind,
            url: format!("{base}/{}", kind.archive_file_name()),
            archive_path: staging_dir.join(kind.archive_file_name()),
            table_path: staging_dir.join(kind.table_file_name()),
        })
        .collect()
}

/// Pipeline stages, used for error context and log spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    Cleanup,
    Fetch,
    Decompress,
    Load,
    Transform,
    Export,
    Publish,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Cleanup => "cleanup",
            Stage::Fetch => "fetch",
            Stage::Decompress => "decompress",
            Stage::Load => "load",
            Stage::Transform => "transform",
            Stage::Export => "export",
            Stage::Publish => "publish",
        };
        f.write_str(name)
    }
}

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{stage} of {dataset} failed: {source}")]
    Acquisition {
        dataset: DatasetKind,
        stage: Stage,
        #[source]
        source: BoxError,
    },
    #[error("could not parse {dataset} from {}: {message}", path.display())]
    Parse {
        dataset: DatasetKind,
        path: PathBuf,
        message: String,
    },
    #[error("{dataset} failed validation: {message}")]
    Validation { dataset: DatasetKind, message: String },
    #[error("writing export {} failed: {source}", path.display())]
    Export {
        path: PathBuf,
        #[source]
        source: BoxError,
    },
    #[error("{stage} task did not complete: {message}")]
    Task { stage: Stage, message: String },
    #[error(
        "{stage} stage failed for {} task(s); first: {}",
        failures.len(),
        first_failure(failures)
    )]
    StageFailed {
        stage: Stage,
        failures: Vec<PipelineError>,
    },
}

fn first_failure(failures: &[PipelineError]) -> String {
    failures
        .first()
        .map(ToString::to_string)
        .unwrap_or_else(|| "none recorded".to_string())
}

impl PipelineError {
    pub fn acquisition(
        dataset: DatasetKind,
        stage: Stage,
        source: impl Into<BoxError>,
    ) -> Self {
        PipelineError::Acquisition {
            dataset,
            stage,
            source: source.into(),
        }
    }

    pub fn export(path: impl Into<PathBuf>, source: impl Into<BoxError>) -> Self {
        PipelineError::Export {
            path: path.into(),
            source: source.into(),
        }
    }
}

/// A relation exactly as it was read from disk: header names plus text cells.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RawTable {
    pub fn new(headers: Vec<String>) -> Self {
        Self {
            headers,
            rows: Vec::new(),
        }
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    pub id: String,
    pub primary_name: String,
    pub birth_year: String,
    pub death_year: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TitleParticipation {
    pub title_id: String,
    pub person_id: String,
    pub category: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TitleBasic {
    pub id: String,
    pub title_type: String,
    pub primary_title: String,
    pub original_title: String,
    pub is_adult: String,
    pub start_year: String,
    pub end_year: String,
    pub runtime_minutes: String,
    pub genres: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TitleRating {
    pub title_id: String,
    pub average_rating: f64,
    pub num_votes: u64,
}

/// The four loaded relations of one run, owned in one place and lent to
/// each transform stage.
#[derive(Debug, Clone, Default)]
pub struct SourceTables {
    pub persons: Vec<Person>,
    pub titles: Vec<TitleBasic>,
    pub participations: Vec<TitleParticipation>,
    pub ratings: Vec<TitleRating>,
}

/// Closed set of participation roles kept in the cast pivot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoleCategory {
    Actor,
    Actress,
    Director,
    Producer,
    Writer,
    Editor,
    Cinematographer,
    Composer,
}

impl RoleCategory {
    pub const COUNT: usize = 8;

    /// Column order of cast roles in the curated record.
    pub const EXPORT_ORDER: [RoleCategory; RoleCategory::COUNT] = [
        RoleCategory::Actor,
        RoleCategory::Actress,
        RoleCategory::Writer,
        RoleCategory::Director,
        RoleCategory::Producer,
        RoleCategory::Editor,
        RoleCategory::Composer,
        RoleCategory::Cinematographer,
    ];

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "actor" => Some(RoleCategory::Actor),
            "actress" => Some(RoleCategory::Actress),
            "director" => Some(RoleCategory::Director),
            "producer" => Some(RoleCategory::Producer),
            "writer" => Some(RoleCategory::Writer),
            "editor" => Some(RoleCategory::Editor),
            "cinematographer" => Some(RoleCategory::Cinematographer),
            "composer" => Some(RoleCategory::Composer),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RoleCategory::Actor => "actor",
            RoleCategory::Actress => "actress",
            RoleCategory::Director => "director",
            RoleCategory::Producer => "producer",
            RoleCategory::Writer => "writer",
            RoleCategory::Editor => "editor",
            RoleCategory::Cinematographer => "cinematographer",
            RoleCategory::Composer => "composer",
        }
    }

    pub fn header(&self) -> &'static str {
        match self {
            RoleCategory::Actor => "Actor",
            RoleCategory::Actress => "Actress",
            RoleCategory::Director => "Director",
            RoleCategory::Producer => "Producer",
            RoleCategory::Writer => "Writer",
            RoleCategory::Editor => "Editor",
            RoleCategory::Cinematographer => "Cinematographer",
            RoleCategory::Composer => "Composer",
        }
    }

    fn slot(&self) -> usize {
        match self {
            RoleCategory::Actor => 0,
            RoleCategory::Actress => 1,
            RoleCategory::Writer => 2,
            RoleCategory::Director => 3,
            RoleCategory::Producer => 4,
            RoleCategory::Editor => 5,
            RoleCategory::Composer => 6,
            RoleCategory::Cinematographer => 7,
        }
    }
}

/// One optional name per role category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CastNames([Option<String>; RoleCategory::COUNT]);

impl CastNames {
    pub fn get(&self, role: RoleCategory) -> Option<&str> {
        self.0[role.slot()].as_deref()
    }

    pub fn set(&mut self, role: RoleCategory, name: impl Into<String>) {
        self.0[role.slot()] = Some(name.into());
    }

    pub fn is_set(&self, role: RoleCategory) -> bool {
        self.0[role.slot()].is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RatingCategory {
    Bad,
    Ok,
    Good,
    VeryGood,
}

impl RatingCategory {
    pub fn label(&self) -> &'static str {
        match self {
            RatingCategory::Bad => "Bad",
            RatingCategory::Ok => "Ok",
            RatingCategory::Good => "Good",
            RatingCategory::VeryGood => "Very good",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VoteCategory {
    UpTo5K,
    UpTo10K,
    UpTo50K,
    UpTo100K,
    UpTo500K,
    UpTo1M,
    Over1M,
}

impl VoteCategory {
    pub fn label(&self) -> &'static str {
        match self {
            VoteCategory::UpTo5K => "<=5000",
            VoteCategory::UpTo10K => "> 5000 and <= 10,000",
            VoteCategory::UpTo50K => "> 10,000 and <= 50,000",
            VoteCategory::UpTo100K => "> 50,000 and <= 100,000",
            VoteCategory::UpTo500K => "> 100,000 and <= 500,000",
            VoteCategory::UpTo1M => "> 500,000 and <= 1,000,000",
            VoteCategory::Over1M => "> 1,000,000",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RuntimeCategory {
    UpTo1h15m,
    UpTo1h45m,
    UpTo2h,
    UpTo2h30m,
    Over2h30m,
}

impl RuntimeCategory {
    pub fn label(&self) -> &'static str {
        match self {
            RuntimeCategory::UpTo1h15m => "≤1h15m",
            RuntimeCategory::UpTo1h45m => "1h15m–1h45m",
            RuntimeCategory::UpTo2h => "1h45m–2h0m",
            RuntimeCategory::UpTo2h30m => "2h0m–2h30m",
            RuntimeCategory::Over2h30m => ">2h30m",
        }
    }
}

/// Final denormalized movie row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovieRecord {
    pub id: String,
    pub title: String,
    pub year: String,
    pub runtime: u32,
    pub full_runtime: String,
    pub runtime_category: RuntimeCategory,
    pub rating: f64,
    pub category_rating: RatingCategory,
    pub num_votes: u64,
    pub category_votes: VoteCategory,
    pub genres: String,
    pub genre_slots: [String; 3],
    /// Left empty for titles without any qualifying participation.
    pub cast: CastNames,
    pub hyperlink: String,
}
