//! Listing source contracts plus the paginated hh.ru adapter.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use jobwatch_core::{ListingDraft, EMPLOYER_PLACEHOLDER, SALARY_PLACEHOLDER};
use jobwatch_storage::{FetchError, HttpFetcher};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "jobwatch-adapters";

pub const HH_SOURCE_ID: &str = "hh";
pub const DEFAULT_PAGE_SIZE: u32 = 100;
pub const DEFAULT_MAX_PAGES: u32 = 20;

/// One sub-query as sent to a listing source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceQuery {
    pub text: String,
    pub days: u32,
    pub countries: Vec<String>,
    pub work_types: Vec<String>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid source url: {0}")]
    InvalidUrl(String),
    #[error("unexpected response shape: {0}")]
    UnexpectedShape(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ItemError {
    #[error("item is missing required field `{0}`")]
    MissingField(&'static str),
}

/// One decoded page of search results before item mapping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawPage {
    pub items: Option<Vec<JsonValue>>,
    pub pages: Option<u32>,
    pub found: Option<u64>,
}

impl RawPage {
    pub fn from_json(body: &JsonValue) -> Result<Self, AdapterError> {
        if !body.is_object() {
            return Err(AdapterError::UnexpectedShape(
                "search response is not an object".to_string(),
            ));
        }
        Ok(Self {
            items: body.get("items").and_then(JsonValue::as_array).cloned(),
            pages: body
                .get("pages")
                .and_then(JsonValue::as_u64)
                .map(|p| p.min(u64::from(u32::MAX)) as u32),
            found: body.get("found").and_then(JsonValue::as_u64),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The source reported no further pages.
    Exhausted,
    MaxPages,
    /// A page held nothing published after the cutoff.
    StalePage,
    /// The page had no items array, or an empty one.
    EmptyPage,
    RequestFailed,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exhausted => "exhausted",
            Self::MaxPages => "max_pages",
            Self::StalePage => "stale_page",
            Self::EmptyPage => "empty_page",
            Self::RequestFailed => "request_failed",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one paginated fetch. Listings gathered before a failure are kept.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutcome {
    pub drafts: Vec<ListingDraft>,
    pub pages_fetched: u32,
    pub mapped: u32,
    pub malformed: u32,
    pub skipped_stale: u32,
    pub stop: StopReason,
    pub error: Option<String>,
}

impl FetchOutcome {
    fn empty() -> Self {
        Self {
            drafts: Vec::new(),
            pages_fetched: 0,
            mapped: 0,
            malformed: 0,
            skipped_stale: 0,
            stop: StopReason::Exhausted,
            error: None,
        }
    }
}

#[async_trait]
pub trait ListingSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Never fails outright; request errors end pagination and are reported on the outcome.
    async fn fetch(&self, query: &SourceQuery, now: DateTime<Utc>) -> FetchOutcome;
}

#[async_trait]
impl<T: ListingSource + ?Sized> ListingSource for Arc<T> {
    fn source_id(&self) -> &'static str {
        (**self).source_id()
    }

    async fn fetch(&self, query: &SourceQuery, now: DateTime<Utc>) -> FetchOutcome {
        (**self).fetch(query, now).await
    }
}

/// Fetches a single zero-based result page.
#[async_trait]
pub trait PageClient: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_page(&self, query: &SourceQuery, page: u32) -> Result<RawPage, AdapterError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaginationConfig {
    pub max_pages: u32,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            max_pages: DEFAULT_MAX_PAGES,
        }
    }
}

/// Walks result pages newest-first and stops once a page is entirely older than the cutoff.
#[derive(Debug)]
pub struct PaginatedSource<C> {
    client: C,
    config: PaginationConfig,
}

impl<C: PageClient> PaginatedSource<C> {
    pub fn new(client: C, config: PaginationConfig) -> Self {
        Self { client, config }
    }

    pub fn client(&self) -> &C {
        &self.client
    }
}

#[async_trait]
impl<C: PageClient> ListingSource for PaginatedSource<C> {
    fn source_id(&self) -> &'static str {
        self.client.source_id()
    }

    async fn fetch(&self, query: &SourceQuery, now: DateTime<Utc>) -> FetchOutcome {
        let cutoff = lookback_cutoff(now, query.days);
        let mut outcome = FetchOutcome::empty();
        let mut total_pages: Option<u32> = None;
        let mut page: u32 = 0;

        loop {
            if total_pages.is_some_and(|total| page >= total) {
                outcome.stop = StopReason::Exhausted;
                break;
            }
            if page >= self.config.max_pages {
                outcome.stop = StopReason::MaxPages;
                break;
            }

            let raw = match self.client.fetch_page(query, page).await {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(
                        source_id = self.source_id(),
                        page,
                        timeout = matches!(&err, AdapterError::Fetch(e) if e.is_timeout()),
                        error = %err,
                        "page request failed; keeping listings gathered so far"
                    );
                    outcome.stop = StopReason::RequestFailed;
                    outcome.error = Some(err.to_string());
                    break;
                }
            };
            outcome.pages_fetched += 1;
            if let Some(pages) = raw.pages {
                total_pages = Some(pages);
            }

            let items = match raw.items {
                Some(items) if !items.is_empty() => items,
                _ => {
                    outcome.stop = StopReason::EmptyPage;
                    break;
                }
            };

            let mut page_has_fresh = false;
            for item in &items {
                let published = published_at_of(item);
                if published.is_some_and(|at| at >= cutoff) {
                    page_has_fresh = true;
                }
                match map_item(item, now) {
                    Ok(draft) => {
                        outcome.mapped += 1;
                        if published.is_some_and(|at| at < cutoff) {
                            outcome.skipped_stale += 1;
                        } else {
                            outcome.drafts.push(draft);
                        }
                    }
                    Err(err) => {
                        debug!(page, error = %err, "skipping malformed item");
                        outcome.malformed += 1;
                    }
                }
            }

            if !page_has_fresh {
                outcome.stop = StopReason::StalePage;
                break;
            }
            page += 1;
        }

        info!(
            source_id = self.source_id(),
            query = %query.text,
            pages = outcome.pages_fetched,
            listings = outcome.drafts.len(),
            malformed = outcome.malformed,
            stale = outcome.skipped_stale,
            stop = %outcome.stop,
            "source fetch finished"
        );
        outcome
    }
}

/// `now - days`, saturating at the earliest representable instant.
pub fn lookback_cutoff(now: DateTime<Utc>, days: u32) -> DateTime<Utc> {
    Duration::try_days(i64::from(days.max(1)))
        .and_then(|span| now.checked_sub_signed(span))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// hh.ru `/vacancies` page client.
#[derive(Debug, Clone)]
pub struct HhPageClient {
    fetcher: Arc<HttpFetcher>,
    base_url: Url,
    page_size: u32,
}

impl HhPageClient {
    pub fn new(fetcher: Arc<HttpFetcher>, base_url: &str, page_size: u32) -> Result<Self, AdapterError> {
        let base_url = Url::parse(base_url).map_err(|e| AdapterError::InvalidUrl(e.to_string()))?;
        Ok(Self {
            fetcher,
            base_url,
            page_size: page_size.max(1),
        })
    }
}

#[async_trait]
impl PageClient for HhPageClient {
    fn source_id(&self) -> &'static str {
        HH_SOURCE_ID
    }

    async fn fetch_page(&self, query: &SourceQuery, page: u32) -> Result<RawPage, AdapterError> {
        let url = build_search_url(&self.base_url, query, page, self.page_size)?;
        let fetched = self.fetcher.get_json(HH_SOURCE_ID, url, None).await?;
        RawPage::from_json(&fetched.body)
    }
}

pub fn build_search_url(
    base: &Url,
    query: &SourceQuery,
    page: u32,
    page_size: u32,
) -> Result<Url, AdapterError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| AdapterError::InvalidUrl(base.to_string()))?
        .pop_if_empty()
        .push("vacancies");
    {
        let mut pairs = url.query_pairs_mut();
        pairs
            .append_pair("text", &query.text)
            .append_pair("period", &query.days.max(1).to_string())
            .append_pair("per_page", &page_size.to_string())
            .append_pair("page", &page.to_string())
            .append_pair("only_with_salary", "false")
            .append_pair("search_field", "name");
        for country in &query.countries {
            match area_code(country) {
                Some(code) => {
                    pairs.append_pair("area", &code.to_string());
                }
                None => debug!(country = %country, "ignoring unknown country"),
            }
        }
        for work_type in &query.work_types {
            match work_format_code(work_type) {
                Some(code) => {
                    pairs.append_pair("work_format", code);
                }
                None => debug!(work_type = %work_type, "ignoring unknown work type"),
            }
        }
    }
    Ok(url)
}

pub fn area_code(country: &str) -> Option<u32> {
    match country.trim().to_lowercase().as_str() {
        "russia" => Some(113),
        "ukraine" => Some(5),
        "kazakhstan" => Some(40),
        "belarus" => Some(16),
        _ => None,
    }
}

pub fn work_format_code(work_type: &str) -> Option<&'static str> {
    match work_type.trim().to_lowercase().as_str() {
        "remote" => Some("REMOTE"),
        "hybrid" => Some("HYBRID"),
        "office" | "onsite" | "on_site" => Some("ON_SITE"),
        _ => None,
    }
}

/// Maps one raw hh.ru item. Only `id` and `name` are required; everything else degrades.
pub fn map_item(item: &JsonValue, fetched_at: DateTime<Utc>) -> Result<ListingDraft, ItemError> {
    let external_id = match item.get("id") {
        Some(JsonValue::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(JsonValue::Number(n)) => n.to_string(),
        _ => return Err(ItemError::MissingField("id")),
    };
    let title = json_str(item, &["name"])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(ItemError::MissingField("name"))?
        .to_string();

    let employer = json_str(item, &["employer", "name"])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(EMPLOYER_PLACEHOLDER)
        .to_string();

    Ok(ListingDraft {
        external_id,
        title,
        employer,
        location: json_str(item, &["area", "name"]).map(ToString::to_string),
        work_format: work_format_label(item),
        salary: format_salary(item.get("salary")),
        published_at: published_at_of(item).unwrap_or(fetched_at),
        url: json_str(item, &["alternate_url"]).map(ToString::to_string),
    })
}

pub fn published_at_of(item: &JsonValue) -> Option<DateTime<Utc>> {
    json_str(item, &["published_at"]).and_then(parse_published_at)
}

/// Accepts RFC 3339, a colon-less `+HHMM` offset, or no offset (read as UTC).
pub fn parse_published_at(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z"))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
                .ok()
                .map(|naive| naive.and_utc())
        })
}

fn work_format_label(item: &JsonValue) -> Option<String> {
    if let Some(formats) = item.get("work_format").and_then(JsonValue::as_array) {
        let labels: Vec<&str> = formats
            .iter()
            .filter_map(|f| json_str(f, &["id"]))
            .map(|id| match id {
                "REMOTE" => "Remote",
                "HYBRID" => "Hybrid",
                "ON_SITE" => "On-site",
                other => other,
            })
            .collect();
        if !labels.is_empty() {
            return Some(labels.join(", "));
        }
    }

    let schedule = json_str(item, &["schedule", "name"])?.to_lowercase();
    if schedule.contains("удал") || schedule.contains("remote") {
        Some("Remote".to_string())
    } else {
        Some("On-site".to_string())
    }
}

pub fn format_salary(salary: Option<&JsonValue>) -> String {
    let Some(salary) = salary.filter(|s| s.is_object()) else {
        return SALARY_PLACEHOLDER.to_string();
    };
    let from = salary.get("from").and_then(format_amount);
    let to = salary.get("to").and_then(format_amount);
    let currency = json_str(salary, &["currency"]).unwrap_or_default();

    let text = match (from, to) {
        (Some(from), Some(to)) => format!("{from} - {to} {currency}"),
        (Some(from), None) => format!("from {from} {currency}"),
        (None, Some(to)) => format!("up to {to} {currency}"),
        (None, None) => return SALARY_PLACEHOLDER.to_string(),
    };
    text.trim_end().to_string()
}

fn format_amount(value: &JsonValue) -> Option<String> {
    if let Some(n) = value.as_i64() {
        return Some(n.to_string());
    }
    value.as_f64().map(|n| {
        if n.fract() == 0.0 {
            format!("{n:.0}")
        } else {
            n.to_string()
        }
    })
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

pub const AREA_CACHE_TTL: std::time::Duration = std::time::Duration::from_secs(24 * 60 * 60);

/// Leaf area of the source's region tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct City {
    pub id: String,
    pub name: String,
    pub country_id: String,
}

/// Raw region tree: countries with nested `areas` arrays.
#[async_trait]
pub trait AreaTreeClient: Send + Sync {
    async fn fetch_areas(&self) -> Result<JsonValue, AdapterError>;
}

#[async_trait]
pub trait CityDirectory: Send + Sync {
    /// Cities of the named countries. Unknown or empty country lists return every city.
    async fn cities(&self, countries: &[String]) -> Vec<City>;
}

/// hh.ru `/areas` client.
#[derive(Debug, Clone)]
pub struct HhAreaClient {
    fetcher: Arc<HttpFetcher>,
    base_url: Url,
}

impl HhAreaClient {
    pub fn new(fetcher: Arc<HttpFetcher>, base_url: &str) -> Result<Self, AdapterError> {
        let base_url = Url::parse(base_url).map_err(|e| AdapterError::InvalidUrl(e.to_string()))?;
        Ok(Self { fetcher, base_url })
    }
}

#[async_trait]
impl AreaTreeClient for HhAreaClient {
    async fn fetch_areas(&self) -> Result<JsonValue, AdapterError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| AdapterError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .push("areas");
        let fetched = self.fetcher.get_json(HH_SOURCE_ID, url, None).await?;
        Ok(fetched.body)
    }
}

#[derive(Debug)]
struct CachedCities {
    cities: Arc<Vec<City>>,
    loaded_at: Instant,
}

/// City list flattened from the region tree and cached for `ttl`.
///
/// A failed refresh keeps serving the previous list (empty before the first success).
#[derive(Debug)]
pub struct AreaDirectory<C> {
    client: C,
    ttl: std::time::Duration,
    cache: Mutex<Option<CachedCities>>,
}

impl<C: AreaTreeClient> AreaDirectory<C> {
    pub fn new(client: C) -> Self {
        Self::with_ttl(client, AREA_CACHE_TTL)
    }

    pub fn with_ttl(client: C, ttl: std::time::Duration) -> Self {
        Self {
            client,
            ttl,
            cache: Mutex::new(None),
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    async fn all_cities(&self) -> Arc<Vec<City>> {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if cached.loaded_at.elapsed() < self.ttl && !cached.cities.is_empty() {
                return Arc::clone(&cached.cities);
            }
        }

        match self.client.fetch_areas().await {
            Ok(tree) => {
                let cities = Arc::new(flatten_cities(&tree));
                info!(cities = cities.len(), "area directory refreshed");
                *cache = Some(CachedCities {
                    cities: Arc::clone(&cities),
                    loaded_at: Instant::now(),
                });
                cities
            }
            Err(err) => {
                warn!(error = %err, "area directory refresh failed; serving cached list");
                cache
                    .as_ref()
                    .map(|cached| Arc::clone(&cached.cities))
                    .unwrap_or_default()
            }
        }
    }
}

#[async_trait]
impl<C: AreaTreeClient> CityDirectory for AreaDirectory<C> {
    async fn cities(&self, countries: &[String]) -> Vec<City> {
        let cities = self.all_cities().await;
        let wanted: Vec<String> = countries
            .iter()
            .filter_map(|c| area_code(c))
            .map(|code| code.to_string())
            .collect();
        if wanted.is_empty() {
            return cities.as_ref().clone();
        }
        cities
            .iter()
            .filter(|city| wanted.contains(&city.country_id))
            .cloned()
            .collect()
    }
}

/// Walks every country down to areas whose own `areas` array is empty.
pub fn flatten_cities(tree: &JsonValue) -> Vec<City> {
    let mut out = Vec::new();
    for country in tree.as_array().into_iter().flatten() {
        let Some(country_id) = json_id(country) else {
            continue;
        };
        if let Some(areas) = country.get("areas").and_then(JsonValue::as_array) {
            collect_leaf_areas(&country_id, areas, &mut out);
        }
    }
    out
}

fn collect_leaf_areas(country_id: &str, areas: &[JsonValue], out: &mut Vec<City>) {
    for area in areas {
        let Some(children) = area.get("areas").and_then(JsonValue::as_array) else {
            continue;
        };
        if !children.is_empty() {
            collect_leaf_areas(country_id, children, out);
            continue;
        }
        if let (Some(id), Some(name)) = (json_id(area), json_str(area, &["name"])) {
            out.push(City {
                id,
                name: name.to_string(),
                country_id: country_id.to_string(),
            });
        }
    }
}

fn json_id(value: &JsonValue) -> Option<String> {
    match value.get("id")? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
