//! Ranking page sources and the tolerant ranking-page parser.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rankfeed_core::{is_valid_character_name, CharacterRecord, JobClass, World, MAX_LEVEL};
use rankfeed_storage::{
    browser_headers, random_identity, FetchError, HttpFetcher, SessionContext, ACCEPT_JSON,
};
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "rankfeed-adapters";

/// One upstream ranking entry before code translation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RawRankingEntry {
    #[serde(rename = "characterName", default)]
    pub character_name: String,
    #[serde(default)]
    pub level: i64,
    #[serde(rename = "jobID", default)]
    pub job_id: Option<i64>,
    #[serde(rename = "worldID", default)]
    pub world_id: Option<i64>,
    #[serde(rename = "characterImgURL", default)]
    pub character_img_url: Option<String>,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed ranking JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unexpected ranking envelope: {0}")]
    Envelope(String),
}

/// Parses one ranking page body. A well-formed envelope without entries yields an
/// empty vec; individual bad entries are dropped without failing the page.
pub fn parse_ranking_page(
    body: &[u8],
    scraped_at: DateTime<Utc>,
) -> Result<Vec<CharacterRecord>, ParseError> {
    let value: JsonValue = serde_json::from_slice(body)?;
    let JsonValue::Object(envelope) = value else {
        return Err(ParseError::Envelope("top-level value is not an object".into()));
    };

    let entries = match envelope.get("ranks") {
        None | Some(JsonValue::Null) => return Ok(Vec::new()),
        Some(JsonValue::Array(entries)) => entries,
        Some(other) => {
            return Err(ParseError::Envelope(format!(
                "`ranks` is {}, expected an array",
                json_kind(other)
            )))
        }
    };

    let mut records = Vec::with_capacity(entries.len());
    for (position, entry) in entries.iter().enumerate() {
        match RawRankingEntry::deserialize(entry) {
            Ok(raw) => {
                if let Some(record) = translate_entry(raw, scraped_at) {
                    records.push(record);
                }
            }
            Err(err) => warn!(position, error = %err, "skipping undecodable ranking entry"),
        }
    }
    Ok(records)
}

/// Resolves codes through the lookup tables; returns `None` for entries that violate
/// the record constraints.
pub fn translate_entry(raw: RawRankingEntry, scraped_at: DateTime<Utc>) -> Option<CharacterRecord> {
    let name = raw.character_name.trim().to_string();
    if !is_valid_character_name(&name) {
        warn!(name = %raw.character_name, "skipping entry with invalid character name");
        return None;
    }
    let level = match u32::try_from(raw.level) {
        Ok(level) if (1..=MAX_LEVEL).contains(&level) => level,
        _ => {
            warn!(%name, level = raw.level, "skipping entry with invalid level");
            return None;
        }
    };

    let job = JobClass::from_raw(raw.job_id);
    if job.is_unknown() {
        debug!(%name, code = ?raw.job_id, "unrecognized job code");
    }
    let world = World::from_raw(raw.world_id);
    if world.is_unknown() {
        debug!(%name, code = ?raw.world_id, "unrecognized world code");
    }

    Some(CharacterRecord {
        name,
        level,
        job,
        world,
        image_ref: raw
            .character_img_url
            .as_deref()
            .map(image_ref_from_url)
            .unwrap_or_default(),
        scraped_at,
    })
}

/// Extracts the avatar hash from `.../Character/<hash>.png`, falling back to the URL.
pub fn image_ref_from_url(url: &str) -> String {
    let trimmed = url.trim();
    let path = trimmed.split(['?', '#']).next().unwrap_or_default();
    let last_segment = path.rsplit('/').next().unwrap_or_default();
    match last_segment.strip_suffix(".png") {
        Some(hash) if !hash.is_empty() && hash.chars().all(|c| c.is_ascii_alphanumeric()) => {
            hash.to_string()
        }
        _ => trimmed.to_string(),
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

#[derive(Debug, Error)]
pub enum PageError {
    #[error(transparent)]
    Transport(#[from] FetchError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("reading fixture page: {0}")]
    Fixture(#[from] std::io::Error),
}

#[derive(Debug)]
pub enum PageOutcome {
    Success(Vec<CharacterRecord>),
    /// Well-formed page with no entries: the feed has ended.
    Empty,
    Failed(PageError),
}

impl PageOutcome {
    fn from_parsed(result: Result<Vec<CharacterRecord>, ParseError>) -> Self {
        match result {
            Ok(records) if records.is_empty() => Self::Empty,
            Ok(records) => Self::Success(records),
            Err(err) => Self::Failed(err.into()),
        }
    }
}

/// A way of retrieving ranking pages. Page indices are zero-based.
#[async_trait]
pub trait PageSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_page(&self, index: usize, session: &SessionContext) -> PageOutcome;

    async fn fetch_character(
        &self,
        name: &str,
        session: &SessionContext,
    ) -> Result<Option<CharacterRecord>, PageError>;
}

/// Direct JSON ranking API.
#[derive(Debug, Clone)]
pub struct RankingApiSource {
    http: Arc<HttpFetcher>,
    api_base: String,
    referer: String,
}

impl RankingApiSource {
    pub fn new(http: Arc<HttpFetcher>, api_base: impl Into<String>, referer: impl Into<String>) -> Self {
        Self {
            http,
            api_base: api_base.into(),
            referer: referer.into(),
        }
    }

    /// Upstream pages are one-based.
    pub fn page_url(&self, index: usize) -> Result<Url, FetchError> {
        let page_index = (index + 1).to_string();
        Url::parse_with_params(
            &self.api_base,
            &[
                ("type", "overall"),
                ("id", "weekly"),
                ("reboot_index", "0"),
                ("page_index", page_index.as_str()),
            ],
        )
        .map_err(|err| FetchError::InvalidUrl(format!("{}: {err}", self.api_base)))
    }

    pub fn character_url(&self, name: &str) -> Result<Url, FetchError> {
        Url::parse_with_params(
            &self.api_base,
            &[
                ("type", "overall"),
                ("id", "weekly"),
                ("reboot_index", "0"),
                ("page_index", "1"),
                ("character_name", name),
            ],
        )
        .map_err(|err| FetchError::InvalidUrl(format!("{}: {err}", self.api_base)))
    }

    async fn get_body(&self, url: Url, session: &SessionContext) -> Result<Vec<u8>, FetchError> {
        // Each request draws its own identity; only the cookie comes from the session.
        let identity = random_identity();
        let headers = browser_headers(&identity, ACCEPT_JSON, &self.referer, Some(&session.cookie))?;
        let resp = self.http.get(url.as_str(), headers).await?;
        Ok(resp.body)
    }
}

#[async_trait]
impl PageSource for RankingApiSource {
    fn source_id(&self) -> &'static str {
        "ranking-api"
    }

    async fn fetch_page(&self, index: usize, session: &SessionContext) -> PageOutcome {
        let url = match self.page_url(index) {
            Ok(url) => url,
            Err(err) => return PageOutcome::Failed(err.into()),
        };
        let body = match self
            .get_body(url, session)
            .instrument(info_span!("ranking_api_page", page = index))
            .await
        {
            Ok(body) => body,
            Err(err) => return PageOutcome::Failed(err.into()),
        };
        PageOutcome::from_parsed(parse_ranking_page(&body, Utc::now()))
    }

    async fn fetch_character(
        &self,
        name: &str,
        session: &SessionContext,
    ) -> Result<Option<CharacterRecord>, PageError> {
        let url = self.character_url(name)?;
        let body = self
            .get_body(url, session)
            .instrument(info_span!("ranking_api_character", name))
            .await?;
        let records = parse_ranking_page(&body, Utc::now())?;
        Ok(find_by_name(records, name))
    }
}

fn find_by_name(records: Vec<CharacterRecord>, name: &str) -> Option<CharacterRecord> {
    let wanted = name.trim();
    records
        .into_iter()
        .find(|r| r.name.eq_ignore_ascii_case(wanted))
}

/// Offline source reading `page-<index>.json` files from a directory. A missing file
/// reads as the end of the feed.
#[derive(Debug, Clone)]
pub struct FixturePageSource {
    dir: PathBuf,
}

impl FixturePageSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn page_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("page-{index}.json"))
    }

    async fn read_page(&self, index: usize) -> Result<Option<Vec<u8>>, std::io::Error> {
        match fs::read(self.page_path(index)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl PageSource for FixturePageSource {
    fn source_id(&self) -> &'static str {
        "fixtures"
    }

    async fn fetch_page(&self, index: usize, _session: &SessionContext) -> PageOutcome {
        match self.read_page(index).await {
            Ok(Some(body)) => PageOutcome::from_parsed(parse_ranking_page(&body, Utc::now())),
            Ok(None) => PageOutcome::Empty,
            Err(err) => PageOutcome::Failed(err.into()),
        }
    }

    async fn fetch_character(
        &self,
        name: &str,
        _session: &SessionContext,
    ) -> Result<Option<CharacterRecord>, PageError> {
        let mut index = 0;
        while let Some(body) = self.read_page(index).await? {
            let records = parse_ranking_page(&body, Utc::now())?;
            if let Some(found) = find_by_name(records, name) {
                return Ok(Some(found));
            }
            index += 1;
        }
        Ok(None)
    }
}
