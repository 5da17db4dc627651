use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::types::{RemoteEpisode, Work};

/// Per-item metadata hook offered by some http sources (title cleanup and the like).
pub trait EpisodeRefiner: Send + Sync {
    fn prepare(&self, episode: RemoteEpisode, work: &Work) -> anyhow::Result<RemoteEpisode>;
}

/// What kind of catalog the episodes came from.
#[derive(Clone)]
pub enum SourceKind {
    Http { refiner: Option<Arc<dyn EpisodeRefiner>> },
    /// Local filesystem library; allowed to report an empty list.
    Offline,
    /// Aggregating container over other works.
    Merged,
}

impl SourceKind {
    pub fn http() -> Self {
        SourceKind::Http { refiner: None }
    }

    pub fn http_with(refiner: Arc<dyn EpisodeRefiner>) -> Self {
        SourceKind::Http { refiner: Some(refiner) }
    }

    pub fn is_offline(&self) -> bool {
        matches!(self, SourceKind::Offline)
    }

    pub(crate) fn refine(&self, episode: RemoteEpisode, work: &Work) -> Result<RemoteEpisode> {
        match self {
            SourceKind::Http { refiner: Some(r) } => {
                let url = episode.url.clone();
                r.prepare(episode, work).map_err(|source| Error::Refine { url, source })
            }
            _ => Ok(episode),
        }
    }
}

impl fmt::Debug for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Http { refiner } => f
                .debug_struct("Http")
                .field("refiner", &refiner.is_some())
                .finish(),
            SourceKind::Offline => f.write_str("Offline"),
            SourceKind::Merged => f.write_str("Merged"),
        }
    }
}
