//! Core domain model for jobwatch: listings, per-user schedules and search requests.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "jobwatch-core";

/// Owning user of listings and schedules (the bot chat id).
pub type UserId = i64;

pub const DEFAULT_DAYS: u32 = 1;
/// Longest lookback the listing API accepts for `period`.
pub const MAX_LOOKBACK_DAYS: u32 = 30;
pub const DEFAULT_INTERVAL_MINUTES: u32 = 30;
pub const JITTER_PERCENT: u32 = 20;

pub const EMPLOYER_PLACEHOLDER: &str = "Employer not specified";
pub const SALARY_PLACEHOLDER: &str = "Salary not specified";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ListingStatus {
    #[default]
    New,
    Viewed,
    Applied,
    Ignored,
}

impl ListingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Viewed => "VIEWED",
            Self::Applied => "APPLIED",
            Self::Ignored => "IGNORED",
        }
    }
}

impl fmt::Display for ListingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown listing status `{}`", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for ListingStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NEW" => Ok(Self::New),
            "VIEWED" => Ok(Self::Viewed),
            "APPLIED" => Ok(Self::Applied),
            "IGNORED" => Ok(Self::Ignored),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

/// Mapped listing as handed over by a source adapter, before it is owned by a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingDraft {
    pub external_id: String,
    pub title: String,
    pub employer: String,
    pub location: Option<String>,
    pub work_format: Option<String>,
    pub salary: String,
    pub published_at: DateTime<Utc>,
    pub url: Option<String>,
}

/// Persisted listing as seen by one user. `(external_id, user_id)` is unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub external_id: String,
    pub user_id: UserId,
    pub title: String,
    pub employer: String,
    pub location: Option<String>,
    pub work_format: Option<String>,
    pub salary: String,
    pub published_at: DateTime<Utc>,
    pub url: Option<String>,
    pub loaded_at: DateTime<Utc>,
    pub status: ListingStatus,
    pub delivered: bool,
}

impl ListingRecord {
    /// Stamp a draft for first ingestion: status NEW, not yet delivered.
    pub fn ingest(draft: ListingDraft, user_id: UserId, loaded_at: DateTime<Utc>) -> Self {
        Self {
            external_id: draft.external_id,
            user_id,
            title: draft.title,
            employer: draft.employer,
            location: draft.location,
            work_format: draft.work_format,
            salary: draft.salary,
            published_at: draft.published_at,
            url: draft.url,
            loaded_at,
            status: ListingStatus::New,
            delivered: false,
        }
    }
}

/// Stored search preferences of a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchPreferences {
    pub query: String,
    pub days: u32,
    pub exclude_keywords: String,
    pub work_types: Vec<String>,
    pub countries: Vec<String>,
    pub notify_enabled: bool,
}

impl Default for SearchPreferences {
    fn default() -> Self {
        Self {
            query: String::new(),
            days: DEFAULT_DAYS,
            exclude_keywords: String::new(),
            work_types: Vec::new(),
            countries: Vec::new(),
            notify_enabled: true,
        }
    }
}

/// One row per user: preferences plus auto-update scheduling state.
///
/// `next_due_at` is `None` exactly when auto-update is disabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSchedule {
    pub user_id: UserId,
    pub preferences: SearchPreferences,
    pub auto_update_enabled: bool,
    pub interval_minutes: u32,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_due_at: Option<DateTime<Utc>>,
}

impl UserSchedule {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            preferences: SearchPreferences::default(),
            auto_update_enabled: false,
            interval_minutes: DEFAULT_INTERVAL_MINUTES,
            last_run_at: None,
            next_due_at: None,
        }
    }

    /// Fields written after a dispatch: last run stamp and the next jittered due time.
    pub fn next_run<R: Rng + ?Sized>(&self, now: DateTime<Utc>, rng: &mut R) -> RunStamp {
        let next_due_at = self
            .auto_update_enabled
            .then(|| jittered_due_at(now, self.interval_minutes, rng));
        RunStamp {
            last_run_at: now,
            next_due_at,
        }
    }

    /// Apply a partial preference update and recompute the due time in the same step.
    pub fn apply_update<R: Rng + ?Sized>(
        &mut self,
        update: &PreferencesUpdate,
        now: DateTime<Utc>,
        rng: &mut R,
    ) {
        let prefs = &mut self.preferences;
        if let Some(query) = &update.query {
            prefs.query = query.clone();
        }
        if let Some(days) = update.days {
            prefs.days = clamp_days(days);
        }
        if let Some(exclude) = &update.exclude_keywords {
            prefs.exclude_keywords = exclude.clone();
        }
        if let Some(work_types) = &update.work_types {
            prefs.work_types = work_types.clone();
        }
        if let Some(countries) = &update.countries {
            prefs.countries = countries.clone();
        }
        if let Some(notify) = update.notify_enabled {
            prefs.notify_enabled = notify;
        }
        if let Some(enabled) = update.auto_update_enabled {
            self.auto_update_enabled = enabled;
        }
        if let Some(interval) = update.interval_minutes {
            self.interval_minutes = interval.max(1);
        }

        self.next_due_at = self
            .auto_update_enabled
            .then(|| jittered_due_at(now, self.interval_minutes, rng));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunStamp {
    pub last_run_at: DateTime<Utc>,
    pub next_due_at: Option<DateTime<Utc>>,
}

/// Partial update of a user's preferences; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferencesUpdate {
    pub query: Option<String>,
    pub days: Option<u32>,
    pub exclude_keywords: Option<String>,
    pub work_types: Option<Vec<String>>,
    pub countries: Option<Vec<String>>,
    pub notify_enabled: Option<bool>,
    pub auto_update_enabled: Option<bool>,
    pub interval_minutes: Option<u32>,
}

/// `base + interval + uniform(0, interval * 20%)`, interval clamped to at least one minute.
///
/// Jitter is drawn in whole seconds so the result never exceeds `1.2 * interval`.
pub fn jittered_due_at<R: Rng + ?Sized>(
    base: DateTime<Utc>,
    interval_minutes: u32,
    rng: &mut R,
) -> DateTime<Utc> {
    let interval_secs = i64::from(interval_minutes.max(1)) * 60;
    let max_jitter_secs = interval_secs * i64::from(JITTER_PERCENT) / 100;
    let jitter_secs = rng.random_range(0..=max_jitter_secs);
    base + Duration::seconds(interval_secs + jitter_secs)
}

/// Ad-hoc search request. Omitted fields fall back to stored preferences.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequest {
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub days: Option<u32>,
    #[serde(default)]
    pub exclude_keywords: Option<String>,
    #[serde(default)]
    pub work_types: Option<Vec<String>>,
    #[serde(default)]
    pub countries: Option<Vec<String>>,
}

impl SearchRequest {
    /// Request built purely from stored preferences, as the scheduler issues it.
    pub fn from_preferences(prefs: &SearchPreferences) -> Self {
        Self {
            query: Some(prefs.query.clone()),
            days: Some(prefs.days),
            exclude_keywords: Some(prefs.exclude_keywords.clone()),
            work_types: Some(prefs.work_types.clone()),
            countries: Some(prefs.countries.clone()),
        }
    }

    /// Request fields win; blank or empty fields are filled from `prefs`.
    pub fn merged_with(&self, prefs: &SearchPreferences) -> EffectiveSearch {
        let query = self
            .query
            .as_deref()
            .filter(|q| !q.trim().is_empty())
            .unwrap_or(&prefs.query)
            .to_string();
        let exclude_keywords = self
            .exclude_keywords
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .unwrap_or(&prefs.exclude_keywords)
            .to_string();
        let work_types = self
            .work_types
            .clone()
            .filter(|w| !w.is_empty())
            .unwrap_or_else(|| prefs.work_types.clone());
        let countries = self
            .countries
            .clone()
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| prefs.countries.clone());

        EffectiveSearch {
            query,
            days: clamp_days(self.days.unwrap_or(prefs.days)),
            exclude_keywords,
            work_types,
            countries,
        }
    }
}

/// Fully resolved search parameters for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EffectiveSearch {
    pub query: String,
    pub days: u32,
    pub exclude_keywords: String,
    pub work_types: Vec<String>,
    pub countries: Vec<String>,
}

impl EffectiveSearch {
    pub fn sub_queries(&self) -> Vec<String> {
        split_csv(&self.query)
    }

    pub fn exclude_list(&self) -> Vec<String> {
        split_csv(&self.exclude_keywords)
            .into_iter()
            .map(|k| k.to_lowercase())
            .collect()
    }
}

pub fn clamp_days(days: u32) -> u32 {
    days.clamp(1, MAX_LOOKBACK_DAYS)
}

/// Split on commas, trimming and dropping blank segments.
pub fn split_csv(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Case-insensitive substring match of any lowercase keyword against the title.
pub fn title_is_excluded(title: &str, lowercase_keywords: &[String]) -> bool {
    if lowercase_keywords.is_empty() {
        return false;
    }
    let title = title.to_lowercase();
    lowercase_keywords.iter().any(|k| title.contains(k.as_str()))
}
