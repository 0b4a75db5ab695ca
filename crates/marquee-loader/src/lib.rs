//! Tabular loading of the decompressed dumps into typed relations.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{bail, Context, Result};
use marquee_core::{
    DatasetKind, DatasetSource, Person, PipelineError, RawTable, SourceTables, Stage,
    TitleBasic, TitleParticipation, TitleRating,
};
use marquee_storage::run_stage;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "marquee-loader";

const DELIMITER: u8 = b'\t';

/// Parse a tab-separated file, every cell kept as text.
///
/// The columnar `csv` reader runs first. Any error there triggers exactly one
/// retry with a line-oriented reader that tolerates short rows and invalid
/// UTF-8; if that fails too the dataset cannot be loaded.
pub fn load_table(dataset: DatasetKind, path: &Path) -> Result<RawTable, PipelineError> {
    match read_columnar(path) {
        Ok(table) => Ok(table),
        Err(columnar_err) => {
            let reason = format!("{columnar_err:#}");
            warn!(%dataset, error = %reason, "columnar parse failed; retrying line by line");
            read_lines(path).map_err(|line_err| PipelineError::Parse {
                dataset,
                path: path.to_path_buf(),
                message: format!("columnar reader: {columnar_err:#}; line reader: {line_err:#}"),
            })
        }
    }
}

fn read_columnar(path: &Path) -> Result<RawTable> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(DELIMITER)
        .quoting(false)
        .has_headers(true)
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let headers = rdr
        .headers()
        .with_context(|| format!("reading header of {}", path.display()))?
        .iter()
        .map(str::to_string)
        .collect();
    let mut table = RawTable::new(headers);
    for (i, rec) in rdr.records().enumerate() {
        let rec = rec.with_context(|| format!("parse record #{}", i + 1))?;
        table.rows.push(rec.iter().map(str::to_string).collect());
    }
    Ok(table)
}

fn read_lines(path: &Path) -> Result<RawTable> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut lines = BufReader::new(file).split(b'\n').enumerate();

    let headers: Vec<String> = match lines.next() {
        Some((_, line)) => split_line(&line.context("reading header line")?),
        None => bail!("{} is empty", path.display()),
    };
    let mut table = RawTable::new(headers);

    for (i, line) in lines {
        let line = line.with_context(|| format!("reading line {}", i + 1))?;
        if line.is_empty() || line == b"\r" {
            continue;
        }
        let mut fields = split_line(&line);
        if fields.len() > table.headers.len() {
            bail!(
                "line {}: expected {} fields, found {}",
                i + 1,
                table.headers.len(),
                fields.len()
            );
        }
        fields.resize(table.headers.len(), String::new());
        table.rows.push(fields);
    }
    Ok(table)
}

fn split_line(line: &[u8]) -> Vec<String> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line)
        .split(DELIMITER as char)
        .map(str::to_string)
        .collect()
}

fn require_columns<const N: usize>(
    dataset: DatasetKind,
    table: &RawTable,
    names: [&str; N],
) -> Result<[usize; N], PipelineError> {
    let mut idx = [0usize; N];
    for (slot, name) in idx.iter_mut().zip(names) {
        *slot = table.column(name).ok_or_else(|| PipelineError::Validation {
            dataset,
            message: format!("missing column {name}"),
        })?;
    }
    Ok(idx)
}

fn take(row: &mut [String], idx: usize) -> String {
    std::mem::take(&mut row[idx])
}

/// The `*_from` extractors consume the raw table and move the wanted cells
/// into typed rows; columns nothing downstream reads are dropped row by row.
pub fn persons_from(table: RawTable) -> Result<Vec<Person>, PipelineError> {
    let [id, name, birth, death] = require_columns(
        DatasetKind::NameBasics,
        &table,
        ["nconst", "primaryName", "birthYear", "deathYear"],
    )?;
    Ok(table
        .rows
        .into_iter()
        .map(|mut row| Person {
            id: take(&mut row, id),
            primary_name: take(&mut row, name),
            birth_year: take(&mut row, birth),
            death_year: take(&mut row, death),
        })
        .collect())
}

pub fn participations_from(table: RawTable) -> Result<Vec<TitleParticipation>, PipelineError> {
    let [title, person, category] = require_columns(
        DatasetKind::TitlePrincipals,
        &table,
        ["tconst", "nconst", "category"],
    )?;
    Ok(table
        .rows
        .into_iter()
        .map(|mut row| TitleParticipation {
            title_id: take(&mut row, title),
            person_id: take(&mut row, person),
            category: take(&mut row, category),
        })
        .collect())
}

pub fn titles_from(table: RawTable) -> Result<Vec<TitleBasic>, PipelineError> {
    let [id, kind, primary, original, adult, start, end, runtime, genres] = require_columns(
        DatasetKind::TitleBasics,
        &table,
        [
            "tconst",
            "titleType",
            "primaryTitle",
            "originalTitle",
            "isAdult",
            "startYear",
            "endYear",
            "runtimeMinutes",
            "genres",
        ],
    )?;
    Ok(table
        .rows
        .into_iter()
        .map(|mut row| TitleBasic {
            id: take(&mut row, id),
            title_type: take(&mut row, kind),
            primary_title: take(&mut row, primary),
            original_title: take(&mut row, original),
            is_adult: take(&mut row, adult),
            start_year: take(&mut row, start),
            end_year: take(&mut row, end),
            runtime_minutes: take(&mut row, runtime),
            genres: take(&mut row, genres),
        })
        .collect())
}

/// Ratings are the one relation coerced at load: both measures are numeric.
pub fn ratings_from(table: RawTable) -> Result<Vec<TitleRating>, PipelineError> {
    let dataset = DatasetKind::TitleRatings;
    let [id, rating, votes] =
        require_columns(dataset, &table, ["tconst", "averageRating", "numVotes"])?;
    table
        .rows
        .into_iter()
        .enumerate()
        .map(|(i, mut row)| {
            let average_rating = row[rating]
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|r| r.is_finite())
                .ok_or_else(|| PipelineError::Validation {
                    dataset,
                    message: format!(
                        "row {}: averageRating {:?} is not a number",
                        i + 1,
                        row[rating]
                    ),
                })?;
            let num_votes = row[votes].trim().parse::<u64>().map_err(|_| {
                PipelineError::Validation {
                    dataset,
                    message: format!("row {}: numVotes {:?} is not a count", i + 1, row[votes]),
                }
            })?;
            Ok(TitleRating {
                title_id: take(&mut row, id),
                average_rating,
                num_votes,
            })
        })
        .collect()
}

#[derive(Debug)]
enum Relation {
    Persons(Vec<Person>),
    Titles(Vec<TitleBasic>),
    Participations(Vec<TitleParticipation>),
    Ratings(Vec<TitleRating>),
}

fn load_relation(dataset: DatasetKind, path: &Path) -> Result<Relation, PipelineError> {
    let table = load_table(dataset, path)?;
    if table.is_empty() {
        warn!(%dataset, "table has a header but no rows");
    }
    info!(%dataset, rows = table.len(), "table parsed");
    Ok(match dataset {
        DatasetKind::NameBasics => Relation::Persons(persons_from(table)?),
        DatasetKind::TitleBasics => Relation::Titles(titles_from(table)?),
        DatasetKind::TitlePrincipals => Relation::Participations(participations_from(table)?),
        DatasetKind::TitleRatings => Relation::Ratings(ratings_from(table)?),
    })
}

/// Load all decompressed tables, at most `concurrency` at a time, and bind
/// each result to the dataset it was read for.
pub async fn load_all(
    run_id: Uuid,
    sources: &[DatasetSource],
    concurrency: usize,
) -> Result<SourceTables, PipelineError> {
    let tasks = sources.iter().cloned().map(|source| {
        let span = info_span!("load", %run_id, stage = %Stage::Load, dataset = %source.kind);
        let task = async move {
            let dataset = source.kind;
            let relation = tokio::task::spawn_blocking(move || {
                load_relation(dataset, &source.table_path)
            })
            .await
            .map_err(|err| PipelineError::Task {
                stage: Stage::Load,
                message: err.to_string(),
            })??;
            info!("relation loaded");
            Ok(relation)
        }
        .instrument(span);
        (source.kind, task)
    });

    let loaded = run_stage(Stage::Load, concurrency, tasks).await?;
    let mut tables = SourceTables::default();
    for relation in loaded.into_values() {
        match relation {
            Relation::Persons(rows) => tables.persons = rows,
            Relation::Titles(rows) => tables.titles = rows,
            Relation::Participations(rows) => tables.participations = rows,
            Relation::Ratings(rows) => tables.ratings = rows,
        }
    }
    info!(
        persons = tables.persons.len(),
        titles = tables.titles.len(),
        participations = tables.participations.len(),
        ratings = tables.ratings.len(),
        "source relations ready"
    );
    Ok(tables)
}
