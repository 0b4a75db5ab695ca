//! Pure transforms from the four source relations to curated movie records.

use std::collections::{BTreeMap, HashMap, HashSet};

use marquee_core::{
    CastNames, DatasetKind, MovieRecord, Person, PipelineError, RatingCategory, RoleCategory,
    RuntimeCategory, SourceTables, TitleBasic, TitleParticipation, TitleRating, VoteCategory,
    SENTINEL, UNKNOWN,
};
use tracing::info;

pub const CRATE_NAME: &str = "marquee-transform";

pub const HYPERLINK_PREFIX: &str = "https://www.imdb.com/title/";

/// How the hour part of a humanized runtime is derived.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RuntimeHours {
    /// `minutes / 60` and `minutes % 60`.
    #[default]
    IntegerDivision,
    /// Bit-compatible with the legacy export: the hour is the leading digit
    /// of the decimal hour count and the minutes come from a float ceiling.
    /// Wrong for runtimes of 600 minutes and more.
    LegacyLeadingDigit,
}

impl RuntimeHours {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "integer" | "integer-division" => Some(RuntimeHours::IntegerDivision),
            "legacy" | "leading-digit" => Some(RuntimeHours::LegacyLeadingDigit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransformOptions {
    pub runtime_hours: RuntimeHours,
}

/// Render a runtime in minutes as `{h}h:{m}m`.
pub fn humanize_runtime(minutes: u32, mode: RuntimeHours) -> String {
    if minutes == 60 {
        return "1h:0m".to_string();
    }
    if minutes < 60 {
        return format!("0h:{minutes}m");
    }
    match mode {
        RuntimeHours::IntegerDivision => format!("{}h:{}m", minutes / 60, minutes % 60),
        RuntimeHours::LegacyLeadingDigit => {
            let full = f64::from(minutes) / 60.0;
            let hours = (minutes / 60)
                .to_string()
                .chars()
                .next()
                .unwrap_or('0');
            let remaining = ((full - full.trunc()) * 60.0).ceil() as u32;
            format!("{hours}h:{remaining}m")
        }
    }
}

pub fn categorize_rating(rating: f64) -> RatingCategory {
    if rating <= 5.0 {
        RatingCategory::Bad
    } else if rating <= 6.5 {
        RatingCategory::Ok
    } else if rating <= 7.5 {
        RatingCategory::Good
    } else {
        RatingCategory::VeryGood
    }
}

pub fn categorize_votes(votes: u64) -> VoteCategory {
    match votes {
        0..=5_000 => VoteCategory::UpTo5K,
        5_001..=10_000 => VoteCategory::UpTo10K,
        10_001..=50_000 => VoteCategory::UpTo50K,
        50_001..=100_000 => VoteCategory::UpTo100K,
        100_001..=500_000 => VoteCategory::UpTo500K,
        500_001..=1_000_000 => VoteCategory::UpTo1M,
        _ => VoteCategory::Over1M,
    }
}

pub fn categorize_runtime(minutes: u32) -> RuntimeCategory {
    match minutes {
        0..=75 => RuntimeCategory::UpTo1h15m,
        76..=105 => RuntimeCategory::UpTo1h45m,
        106..=120 => RuntimeCategory::UpTo2h,
        121..=150 => RuntimeCategory::UpTo2h30m,
        _ => RuntimeCategory::Over2h30m,
    }
}

/// A non-adult movie title with a known runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateMovie {
    pub id: String,
    pub title_type: String,
    pub title: String,
    pub year: String,
    pub status: String,
    pub runtime: u32,
    pub full_runtime: String,
    pub genres: String,
}

pub fn normalize_titles(
    titles: &[TitleBasic],
    mode: RuntimeHours,
) -> Result<Vec<CandidateMovie>, PipelineError> {
    let mut out = Vec::new();
    for title in titles
        .iter()
        .filter(|t| t.is_adult == "0" && t.title_type == "movie")
    {
        let raw = if title.runtime_minutes == SENTINEL {
            "0"
        } else {
            title.runtime_minutes.as_str()
        };
        let runtime = raw.trim().parse::<u32>().map_err(|_| PipelineError::Validation {
            dataset: DatasetKind::TitleBasics,
            message: format!("{}: runtimeMinutes {raw:?} is not an integer", title.id),
        })?;
        if runtime == 0 {
            continue;
        }
        out.push(CandidateMovie {
            id: title.id.clone(),
            title_type: title.title_type.clone(),
            title: title.primary_title.clone(),
            year: title.start_year.clone(),
            status: title.end_year.clone(),
            runtime,
            full_runtime: humanize_runtime(runtime, mode),
            genres: title.genres.clone(),
        });
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Movie {
    pub id: String,
    pub title: String,
    pub year: String,
    pub runtime: u32,
    pub full_runtime: String,
    pub genres: String,
}

fn unknown_if_sentinel(value: String) -> String {
    if value == SENTINEL {
        UNKNOWN.to_string()
    } else {
        value
    }
}

pub fn split_titles(candidates: Vec<CandidateMovie>) -> Vec<Movie> {
    candidates
        .into_iter()
        .map(|c| Movie {
            id: c.id,
            title: c.title,
            year: unknown_if_sentinel(c.year),
            runtime: c.runtime,
            full_runtime: c.full_runtime,
            genres: unknown_if_sentinel(c.genres),
        })
        .collect()
}

/// A participation row enriched with the person it names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CastCredit {
    pub title_id: String,
    pub person_id: String,
    pub category: String,
    pub primary_name: Option<String>,
    pub birth_year: String,
    pub death_year: String,
}

fn known_year(year: Option<&str>) -> String {
    match year {
        Some(y) if y != SENTINEL => y.to_string(),
        _ => UNKNOWN.to_string(),
    }
}

/// Persons by identifier; the first row for an id wins.
fn index_persons(persons: &[Person]) -> HashMap<&str, &Person> {
    let mut by_id: HashMap<&str, &Person> = HashMap::with_capacity(persons.len());
    for person in persons {
        by_id.entry(person.id.as_str()).or_insert(person);
    }
    by_id
}

/// Left join participations to persons, keeping participation order.
pub fn join_credits(participations: &[TitleParticipation], persons: &[Person]) -> Vec<CastCredit> {
    let by_id = index_persons(persons);
    participations
        .iter()
        .map(|p| {
            let person = by_id.get(p.person_id.as_str());
            CastCredit {
                title_id: p.title_id.clone(),
                person_id: p.person_id.clone(),
                category: p.category.clone(),
                primary_name: person.map(|person| person.primary_name.clone()),
                birth_year: known_year(person.map(|person| person.birth_year.as_str())),
                death_year: known_year(person.map(|person| person.death_year.as_str())),
            }
        })
        .collect()
}

/// One row per title with a name per recognized role.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CastPivot {
    rows: BTreeMap<String, CastNames>,
}

impl CastPivot {
    pub fn get(&self, title_id: &str) -> Option<&CastNames> {
        self.rows.get(title_id)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Pivot named credits of the closed role set into per-title columns.
///
/// Participations are walked once in relation order, each resolved against
/// the person index as it is visited. The first credit wins a (title, role)
/// cell. Credits whose person is unknown carry no name and are skipped. A
/// role seen for any title is filled with `Unknown` on titles that lack it;
/// a role seen nowhere stays empty.
pub fn build_cast_pivot(participations: &[TitleParticipation], persons: &[Person]) -> CastPivot {
    let by_id = index_persons(persons);
    let mut rows: BTreeMap<String, CastNames> = BTreeMap::new();
    let mut seen_roles: HashSet<RoleCategory> = HashSet::new();

    for credit in participations {
        let Some(role) = RoleCategory::parse(&credit.category) else {
            continue;
        };
        let Some(person) = by_id.get(credit.person_id.as_str()) else {
            continue;
        };
        seen_roles.insert(role);
        match rows.get_mut(credit.title_id.as_str()) {
            Some(cast) if cast.is_set(role) => {}
            Some(cast) => cast.set(role, person.primary_name.as_str()),
            None => {
                let mut cast = CastNames::default();
                cast.set(role, person.primary_name.as_str());
                rows.insert(credit.title_id.clone(), cast);
            }
        }
    }

    for cast in rows.values_mut() {
        for role in &seen_roles {
            if !cast.is_set(*role) {
                cast.set(*role, UNKNOWN);
            }
        }
    }
    CastPivot { rows }
}

/// Up to three genres in order, padded with `Unknown`.
pub fn split_genres(genres: &str) -> [String; 3] {
    let mut parts = genres.split(',').filter(|g| !g.is_empty());
    std::array::from_fn(|_| parts.next().unwrap_or(UNKNOWN).to_string())
}

pub fn hyperlink(title_id: &str) -> String {
    format!("{HYPERLINK_PREFIX}{title_id}/")
}

/// Join movies with ratings and cast, then derive every categorical column.
///
/// Titles without both a non-zero rating and a non-zero vote count are
/// dropped. Titles missing from the pivot keep empty cast columns.
pub fn assemble(
    movies: Vec<Movie>,
    ratings: &[TitleRating],
    pivot: &CastPivot,
) -> Vec<MovieRecord> {
    let mut by_title: HashMap<&str, &TitleRating> = HashMap::with_capacity(ratings.len());
    for rating in ratings {
        by_title.entry(rating.title_id.as_str()).or_insert(rating);
    }

    let mut records: Vec<MovieRecord> = movies
        .into_iter()
        .filter_map(|movie| {
            let (rating, votes) = by_title
                .get(movie.id.as_str())
                .map(|r| (r.average_rating, r.num_votes))
                .unwrap_or((0.0, 0));
            if rating == 0.0 || votes == 0 {
                return None;
            }
            let cast = pivot.get(&movie.id).cloned().unwrap_or_default();
            Some(MovieRecord {
                hyperlink: hyperlink(&movie.id),
                runtime_category: categorize_runtime(movie.runtime),
                category_rating: categorize_rating(rating),
                category_votes: categorize_votes(votes),
                genre_slots: split_genres(&movie.genres),
                id: movie.id,
                title: movie.title,
                year: movie.year,
                runtime: movie.runtime,
                full_runtime: movie.full_runtime,
                rating,
                num_votes: votes,
                genres: movie.genres,
                cast,
            })
        })
        .collect();

    records.sort_by(|a, b| a.id.cmp(&b.id));
    records
}

/// Run every transform over one run's source relations.
pub fn curate(
    tables: &SourceTables,
    options: &TransformOptions,
) -> Result<Vec<MovieRecord>, PipelineError> {
    let candidates = normalize_titles(&tables.titles, options.runtime_hours)?;
    info!(candidates = candidates.len(), "titles normalized");
    let movies = split_titles(candidates);

    let pivot = build_cast_pivot(&tables.participations, &tables.persons);
    info!(titles_with_cast = pivot.len(), "cast pivot built");

    let records = assemble(movies, &tables.ratings, &pivot);
    info!(movies = records.len(), "movie records assembled");
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn title(id: &str, kind: &str, adult: &str, runtime: &str, genres: &str) -> TitleBasic {
        TitleBasic {
            id: id.to_string(),
            title_type: kind.to_string(),
            primary_title: format!("Primary {id}"),
            original_title: format!("Original {id}"),
            is_adult: adult.to_string(),
            start_year: "1999".to_string(),
            end_year: SENTINEL.to_string(),
            runtime_minutes: runtime.to_string(),
            genres: genres.to_string(),
        }
    }

    fn person(id: &str, name: &str) -> Person {
        Person {
            id: id.to_string(),
            primary_name: name.to_string(),
            birth_year: "1970".to_string(),
            death_year: SENTINEL.to_string(),
        }
    }

    fn credit(title_id: &str, person_id: &str, category: &str) -> TitleParticipation {
        TitleParticipation {
            title_id: title_id.to_string(),
            person_id: person_id.to_string(),
            category: category.to_string(),
        }
    }

    fn rating(title_id: &str, average_rating: f64, num_votes: u64) -> TitleRating {
        TitleRating {
            title_id: title_id.to_string(),
            average_rating,
            num_votes,
        }
    }

    fn movie(id: &str, runtime: u32, genres: &str) -> Movie {
        Movie {
            id: id.to_string(),
            title: format!("Title {id}"),
            year: "2001".to_string(),
            runtime,
            full_runtime: humanize_runtime(runtime, RuntimeHours::IntegerDivision),
            genres: genres.to_string(),
        }
    }

    #[test]
    fn short_runtimes_have_zero_hours() {
        for m in 1..60 {
            assert_eq!(humanize_runtime(m, RuntimeHours::IntegerDivision), format!("0h:{m}m"));
            assert_eq!(humanize_runtime(m, RuntimeHours::LegacyLeadingDigit), format!("0h:{m}m"));
        }
        assert_eq!(humanize_runtime(60, RuntimeHours::IntegerDivision), "1h:0m");
        assert_eq!(humanize_runtime(60, RuntimeHours::LegacyLeadingDigit), "1h:0m");
    }

    #[test]
    fn integer_division_hours_hold_past_ten_hours() {
        let mode = RuntimeHours::IntegerDivision;
        assert_eq!(humanize_runtime(90, mode), "1h:30m");
        assert_eq!(humanize_runtime(125, mode), "2h:5m");
        assert_eq!(humanize_runtime(600, mode), "10h:0m");
        assert_eq!(humanize_runtime(615, mode), "10h:15m");
        assert_eq!(humanize_runtime(1439, mode), "23h:59m");
    }

    #[test]
    fn legacy_hours_take_the_leading_digit() {
        let mode = RuntimeHours::LegacyLeadingDigit;
        assert_eq!(humanize_runtime(90, mode), "1h:30m");
        assert_eq!(humanize_runtime(600, mode), "1h:0m");
        assert_eq!(humanize_runtime(615, mode), "1h:15m");
        assert_eq!(humanize_runtime(605, mode), "1h:6m");
        // float ceiling rounds some exact minute counts up
        assert_eq!(humanize_runtime(125, mode), "2h:6m");
        assert_eq!(humanize_runtime(1439, mode), "2h:60m");
    }

    #[test]
    fn runtime_mode_parses_from_config_text() {
        assert_eq!(RuntimeHours::parse("legacy"), Some(RuntimeHours::LegacyLeadingDigit));
        assert_eq!(RuntimeHours::parse(" Integer "), Some(RuntimeHours::IntegerDivision));
        assert_eq!(RuntimeHours::parse("rounded"), None);
    }

    #[test]
    fn rating_buckets_include_their_upper_bound() {
        assert_eq!(categorize_rating(1.0), RatingCategory::Bad);
        assert_eq!(categorize_rating(5.0), RatingCategory::Bad);
        assert_eq!(categorize_rating(5.01), RatingCategory::Ok);
        assert_eq!(categorize_rating(6.5), RatingCategory::Ok);
        assert_eq!(categorize_rating(6.6), RatingCategory::Good);
        assert_eq!(categorize_rating(7.5), RatingCategory::Good);
        assert_eq!(categorize_rating(7.51), RatingCategory::VeryGood);
        assert_eq!(categorize_rating(7.51).label(), "Very good");
    }

    #[test]
    fn vote_buckets_follow_fixed_boundaries() {
        assert_eq!(categorize_votes(5000).label(), "<=5000");
        assert_eq!(categorize_votes(5001), VoteCategory::UpTo10K);
        assert_eq!(categorize_votes(10_000), VoteCategory::UpTo10K);
        assert_eq!(categorize_votes(50_001), VoteCategory::UpTo100K);
        assert_eq!(categorize_votes(500_000), VoteCategory::UpTo500K);
        assert_eq!(categorize_votes(1_000_000).label(), "> 500,000 and <= 1,000,000");
        assert_eq!(categorize_votes(1_000_001).label(), "> 1,000,000");
    }

    #[test]
    fn runtime_buckets_follow_fixed_boundaries() {
        assert_eq!(categorize_runtime(75), RuntimeCategory::UpTo1h15m);
        assert_eq!(categorize_runtime(76), RuntimeCategory::UpTo1h45m);
        assert_eq!(categorize_runtime(105), RuntimeCategory::UpTo1h45m);
        assert_eq!(categorize_runtime(120), RuntimeCategory::UpTo2h);
        assert_eq!(categorize_runtime(125).label(), "2h0m–2h30m");
        assert_eq!(categorize_runtime(151), RuntimeCategory::Over2h30m);
    }

    #[test]
    fn normalizer_keeps_non_adult_movies_with_runtime() {
        let titles = vec![
            title("tt1", "movie", "0", "95", "Drama"),
            title("tt2", "movie", "0", SENTINEL, "Drama"),
            title("tt3", "movie", "1", "80", "Drama"),
            title("tt4", "tvSeries", "0", "45", "Drama"),
            title("tt5", "movie", "0", "0", "Drama"),
        ];
        let candidates =
            normalize_titles(&titles, RuntimeHours::IntegerDivision).expect("normalize");
        assert_eq!(candidates.len(), 1);
        let only = &candidates[0];
        assert_eq!(only.id, "tt1");
        assert_eq!(only.title, "Primary tt1");
        assert_eq!(only.runtime, 95);
        assert_eq!(only.full_runtime, "1h:35m");
    }

    #[test]
    fn non_numeric_runtime_is_a_validation_error() {
        let titles = vec![title("tt1", "movie", "0", "ninety", "Drama")];
        let err =
            normalize_titles(&titles, RuntimeHours::IntegerDivision).expect_err("bad runtime");
        assert!(matches!(
            err,
            PipelineError::Validation {
                dataset: DatasetKind::TitleBasics,
                ..
            }
        ));
    }

    #[test]
    fn split_replaces_sentinels_in_year_and_genres() {
        let mut t = title("tt1", "movie", "0", "95", SENTINEL);
        t.start_year = SENTINEL.to_string();
        let candidates = normalize_titles(&[t], RuntimeHours::IntegerDivision).expect("normalize");
        let movies = split_titles(candidates);
        assert_eq!(movies[0].year, UNKNOWN);
        assert_eq!(movies[0].genres, UNKNOWN);
    }

    #[test]
    fn genre_slots_pad_with_unknown() {
        assert_eq!(split_genres("Action,Drama"), ["Action", "Drama", "Unknown"]);
        assert_eq!(split_genres(""), ["Unknown", "Unknown", "Unknown"]);
        assert_eq!(split_genres("A,B,C,D"), ["A", "B", "C"]);
    }

    #[test]
    fn first_participant_in_relation_order_wins_the_role() {
        let persons = vec![person("nm1", "First Lead"), person("nm2", "Second Lead")];
        let participations = vec![credit("tt1", "nm2", "actor"), credit("tt1", "nm1", "actor")];
        let pivot = build_cast_pivot(&participations, &persons);
        assert_eq!(
            pivot.get("tt1").and_then(|c| c.get(RoleCategory::Actor)),
            Some("Second Lead")
        );
    }

    #[test]
    fn pivot_fills_missing_seen_roles_with_unknown() {
        let persons = vec![person("nm1", "Dir"), person("nm2", "Star"), person("nm3", "Self")];
        let participations = vec![
            credit("tt1", "nm1", "director"),
            credit("tt2", "nm2", "actress"),
            credit("tt3", "nm3", "self"),
            credit("tt2", "nm404", "composer"),
        ];
        let pivot = build_cast_pivot(&participations, &persons);

        assert_eq!(pivot.len(), 2);
        assert!(pivot.get("tt3").is_none());
        let tt1 = pivot.get("tt1").expect("tt1 row");
        assert_eq!(tt1.get(RoleCategory::Director), Some("Dir"));
        assert_eq!(tt1.get(RoleCategory::Actress), Some(UNKNOWN));
        assert_eq!(tt1.get(RoleCategory::Composer), None);
    }

    #[test]
    fn pivot_skips_unknown_persons_and_keeps_first_person_row() {
        let persons = vec![
            person("nm1", "Listed Twice"),
            person("nm1", "Shadowed"),
            person("nm2", "Backup"),
        ];
        let participations = vec![
            credit("tt1", "nm404", "actor"),
            credit("tt1", "nm1", "actor"),
            credit("tt1", "nm2", "actor"),
            credit("tt2", "nm2", "writer"),
        ];
        let pivot = build_cast_pivot(&participations, &persons);

        let tt1 = pivot.get("tt1").expect("tt1 row");
        assert_eq!(tt1.get(RoleCategory::Actor), Some("Listed Twice"));
        assert_eq!(tt1.get(RoleCategory::Writer), Some(UNKNOWN));
        let tt2 = pivot.get("tt2").expect("tt2 row");
        assert_eq!(tt2.get(RoleCategory::Writer), Some("Backup"));
        assert_eq!(tt2.get(RoleCategory::Actor), Some(UNKNOWN));
    }

    #[test]
    fn joined_credits_normalize_year_sentinels() {
        let persons = vec![person("nm1", "Someone")];
        let participations = [credit("tt1", "nm1", "writer"), credit("tt1", "nm9", "editor")];
        let credits = join_credits(&participations, &persons);
        assert_eq!(credits[0].birth_year, "1970");
        assert_eq!(credits[0].death_year, UNKNOWN);
        assert_eq!(credits[1].primary_name, None);
        assert_eq!(credits[1].birth_year, UNKNOWN);
    }

    #[test]
    fn titles_without_rating_signal_are_excluded() {
        let movies = vec![
            movie("tt3", 90, "Drama"),
            movie("tt1", 90, "Drama"),
            movie("tt2", 90, "Drama"),
        ];
        let ratings = vec![
            rating("tt1", 6.0, 10),
            rating("tt2", 7.0, 0),
            rating("tt3", 8.0, 2_000),
        ];
        let records = assemble(movies, &ratings, &CastPivot::default());
        let ids: Vec<_> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["tt1", "tt3"]);
    }

    #[test]
    fn titles_absent_from_pivot_keep_empty_cast() {
        let persons = vec![person("nm1", "Dir")];
        let pivot = build_cast_pivot(&[credit("tt1", "nm1", "director")], &persons);
        let movies = vec![movie("tt1", 90, "Drama"), movie("tt2", 90, "Drama")];
        let ratings = vec![rating("tt1", 6.0, 10), rating("tt2", 6.0, 10)];

        let records = assemble(movies, &ratings, &pivot);
        assert_eq!(records[0].cast.get(RoleCategory::Director), Some("Dir"));
        assert_eq!(records[1].cast.get(RoleCategory::Director), None);
        assert_eq!(records[1].genre_slots, ["Drama", "Unknown", "Unknown"]);
    }

    #[test]
    fn single_movie_scenario_derives_expected_categories() {
        let tables = SourceTables {
            persons: vec![person("nm1", "Lead")],
            titles: vec![title("tt0000125", "movie", "0", "125", "Action,Drama")],
            participations: vec![credit("tt0000125", "nm1", "actor")],
            ratings: vec![rating("tt0000125", 8.0, 2000)],
        };
        let records = curate(&tables, &TransformOptions::default()).expect("curate");
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.runtime_category.label(), "2h0m–2h30m");
        assert_eq!(r.category_rating.label(), "Very good");
        assert_eq!(r.category_votes.label(), "<=5000");
        assert_eq!(r.full_runtime, "2h:5m");
        assert_eq!(r.hyperlink, "https://www.imdb.com/title/tt0000125/");
        assert_eq!(r.cast.get(RoleCategory::Actor), Some("Lead"));
        assert_eq!(r.genre_slots, ["Action", "Drama", "Unknown"]);
    }
}
