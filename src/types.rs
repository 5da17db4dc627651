use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A library entry for one (source, url) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Work {
    pub id: i64,
    pub source_id: i64,
    pub url: String,
    pub title: String,
    pub favorite: bool,
    pub date_added: i64,
    pub episode_flags: i64,
    /// Days between expected updates. Zero means never computed, negative is user-fixed.
    pub fetch_interval: i32,
    pub next_update: i64,
    /// Last time the episode list changed structurally (epoch millis).
    pub last_update: i64,
    pub last_fetched_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub id: i64,
    pub work_id: i64,
    pub url: String,
    pub name: String,
    pub scanlator: Option<String>,
    pub number: Option<f64>,
    pub source_order: i64,
    pub date_fetch: i64,
    pub date_upload: i64,
    pub read: bool,
    pub bookmark: bool,
    pub last_position: Option<i64>,
    pub version: i64,
}

impl Episode {
    /// Fields that make up the on-disk directory name of a downloaded episode.
    pub fn dir_name_changed(&self, other: &Episode) -> bool {
        self.name != other.name || self.scanlator != other.scanlator
    }
}

/// Progress left behind by an episode removed from its source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct RemovedMarker {
    pub number: f64,
    pub read: bool,
    pub bookmark: bool,
    pub date_fetch: i64,
}

impl RemovedMarker {
    pub fn from_episode(e: &Episode) -> Option<Self> {
        e.number.map(|number| RemovedMarker {
            number,
            read: e.read,
            bookmark: e.bookmark,
            date_fetch: e.date_fetch,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct History {
    pub id: i64,
    pub episode_id: i64,
    pub last_read: Option<i64>,
    pub time_read: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub sort: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupeMode {
    #[default]
    #[serde(rename = "none")]
    NoDedupe,
    Priority,
    MostEpisodes,
    HighestEpisodeNumber,
}

impl DedupeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DedupeMode::NoDedupe => "none",
            DedupeMode::Priority => "priority",
            DedupeMode::MostEpisodes => "most_episodes",
            DedupeMode::HighestEpisodeNumber => "highest_episode_number",
        }
    }
}

impl fmt::Display for DedupeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DedupeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "none" | "no_dedupe" => Ok(DedupeMode::NoDedupe),
            "priority" => Ok(DedupeMode::Priority),
            "most_episodes" => Ok(DedupeMode::MostEpisodes),
            "highest_episode_number" => Ok(DedupeMode::HighestEpisodeNumber),
            other => Err(format!("unknown dedupe mode: {other}")),
        }
    }
}

/// Attaches a linked work to a merge container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedLink {
    pub id: i64,
    pub container_id: i64,
    pub work_id: i64,
    pub work_url: String,
    pub source_id: i64,
    pub is_info_source: bool,
    pub get_updates: bool,
    pub download: bool,
    pub priority: Option<i32>,
    pub dedupe_mode: DedupeMode,
}

impl MergedLink {
    pub fn is_self_link(&self) -> bool {
        self.work_id == self.container_id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct FavoriteEntry {
    pub id: i64,
    pub title: String,
    pub source_id: i64,
    pub gid: String,
    pub token: String,
    pub other_gid: Option<String>,
    pub other_token: Option<String>,
}

/// An episode as reported by a catalog source, before reconciliation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RemoteEpisode {
    pub url: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub scanlator: Option<String>,
    /// Number declared by the source, if any.
    #[serde(default)]
    pub number: Option<f64>,
    /// Upload time in epoch millis; `None` or zero means unknown.
    #[serde(default)]
    pub date_upload: Option<i64>,
    #[serde(default)]
    pub source_order: Option<i64>,
}

impl RemoteEpisode {
    pub fn new(url: impl Into<String>, name: impl Into<String>) -> Self {
        Self { url: url.into(), name: name.into(), ..Default::default() }
    }

    pub fn known_upload(&self) -> Option<i64> {
        self.date_upload.filter(|d| *d > 0)
    }
}

/// Inclusive range (epoch millis) in which a work is expected to be checked for updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FetchWindow {
    pub lower: i64,
    pub upper: i64,
}

impl FetchWindow {
    pub fn contains(&self, ts: i64) -> bool {
        ts >= self.lower && ts <= self.upper
    }
}

/// Bit-exact key for recognized numbers so they can live in hash sets.
pub(crate) fn number_key(n: f64) -> u64 {
    if n == 0.0 { 0f64.to_bits() } else { n.to_bits() }
}
