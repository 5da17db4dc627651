pub mod clock;
pub mod config;
pub mod dao;
pub mod db;
pub mod error;
pub mod merge;
pub mod recognition;
pub mod source;
pub mod storage;
pub mod sync;
pub mod types;

pub use error::{Error, Result};

// --- Library API for embedding ---

/// Convenience re-exports for embedders.
pub mod prelude {
    pub use crate::config::{Config, SyncConfig};
    pub use crate::merge::{Chain, MergeOutcome};
    pub use crate::source::{EpisodeRefiner, SourceKind};
    pub use crate::types::{Category, DedupeMode, Episode, History, MergedLink, RemoteEpisode, Work};
    pub use crate::{Error, Library, Result};
}

use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::dao::{LinkInsert, WorkInsert};
use crate::db::Database;
use crate::merge::{ChainResolver, MergeOutcome};
use crate::recognition::{BasicRecognizer, EpisodeRecognizer};
use crate::source::SourceKind;
use crate::storage::{DownloadStorage, NoDownloads};
use crate::sync::EpisodeSyncer;
use crate::types::{Category, DedupeMode, Episode, RemoteEpisode, Work};

/// Async library entry point. Owns the database and the reconciliation engines.
#[derive(Clone)]
pub struct Library {
    db: Database,
    config: Config,
    clock: Arc<dyn Clock>,
    syncer: EpisodeSyncer,
    resolver: ChainResolver,
}

impl Library {
    /// Opens (and migrates) the configured database with the default collaborators.
    pub async fn connect(config: Config) -> Result<Self> {
        config.sync.validate()?;
        let db = Database::connect(config.database_url.as_deref()).await?;
        Ok(Self::with_parts(db, config, Arc::new(BasicRecognizer), Arc::new(NoDownloads), Arc::new(SystemClock)))
    }

    pub fn with_parts(
        db: Database,
        config: Config,
        recognizer: Arc<dyn EpisodeRecognizer>,
        storage: Arc<dyn DownloadStorage>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let syncer = EpisodeSyncer::new(db.clone(), recognizer, storage, clock.clone(), config.sync.clone());
        let resolver = ChainResolver::new(db.clone(), clock.clone());
        Self { db, config, clock, syncer, resolver }
    }

    pub fn database(&self) -> &Database { &self.db }

    pub fn config(&self) -> &Config { &self.config }

    pub async fn add_work(&self, source_id: i64, url: &str, title: &str, favorite: bool) -> Result<Work> {
        let mut conn = self.db.pool().acquire().await?;
        let date_added = if favorite { self.clock.now_millis() } else { 0 };
        let id = dao::insert_work(
            &mut conn,
            &WorkInsert { source_id, url: url.to_string(), title: title.to_string(), favorite, date_added },
        )
        .await?;
        info!(id, source_id, url, "work added");
        dao::get_work(&mut conn, id).await?.ok_or(Error::WorkNotFound(id))
    }

    pub async fn work(&self, id: i64) -> Result<Work> {
        let mut conn = self.db.pool().acquire().await?;
        dao::get_work(&mut conn, id).await?.ok_or(Error::WorkNotFound(id))
    }

    pub async fn list_works(&self, favorites_only: bool) -> Result<Vec<Work>> {
        let mut conn = self.db.pool().acquire().await?;
        dao::list_works(&mut conn, favorites_only).await
    }

    pub async fn episodes(&self, work_id: i64) -> Result<Vec<Episode>> {
        let mut conn = self.db.pool().acquire().await?;
        dao::episodes_for_work(&mut conn, work_id).await
    }

    /// Reconciles a fetched episode list for `work_id`; returns the episodes worth notifying about.
    pub async fn sync_episodes(
        &self,
        work_id: i64,
        remote: Vec<RemoteEpisode>,
        source: &SourceKind,
        manual_fetch: bool,
    ) -> Result<Vec<Episode>> {
        let work = self.work(work_id).await?;
        self.syncer.sync(remote, &work, source, manual_fetch, None).await
    }

    pub async fn resolve_chains(&self, source_id: i64, episodes: &[Episode]) -> Result<MergeOutcome> {
        self.resolver.resolve(source_id, episodes).await
    }

    /// Attaches `work_id` to the merge container, creating the container's self-link on first use.
    ///
    /// The first linked work becomes the info source. Relinking keeps the existing
    /// flags and only replaces the priority.
    #[instrument(skip(self))]
    pub async fn link_work(&self, container_id: i64, work_id: i64, priority: Option<i32>) -> Result<()> {
        let container = self.work(container_id).await?;
        let linked = self.work(work_id).await?;

        let mut tx = self.db.pool().begin().await?;
        let links = dao::links_for_container(&mut tx, container_id).await?;
        let self_link = links.iter().find(|l| l.is_self_link());

        if self_link.is_none() || work_id == container_id {
            dao::upsert_link(
                &mut tx,
                &LinkInsert {
                    container_id,
                    work_id: container_id,
                    work_url: container.url.clone(),
                    source_id: container.source_id,
                    is_info_source: false,
                    get_updates: false,
                    download: false,
                    priority: if work_id == container_id { priority } else { self_link.and_then(|l| l.priority) },
                    dedupe_mode: self_link.map(|l| l.dedupe_mode).unwrap_or_default(),
                },
            )
            .await?;
        }

        if work_id != container_id {
            let existing = links.iter().find(|l| l.work_id == work_id);
            let first_linked = !links.iter().any(|l| !l.is_self_link());
            dao::upsert_link(
                &mut tx,
                &LinkInsert {
                    container_id,
                    work_id,
                    work_url: linked.url.clone(),
                    source_id: linked.source_id,
                    is_info_source: existing.map_or(first_linked, |l| l.is_info_source),
                    get_updates: existing.map_or(true, |l| l.get_updates),
                    download: existing.map_or(true, |l| l.download),
                    priority,
                    dedupe_mode: DedupeMode::NoDedupe,
                },
            )
            .await?;
        }
        tx.commit().await?;
        debug!("link stored");
        Ok(())
    }

    pub async fn set_dedupe_mode(&self, container_id: i64, mode: DedupeMode) -> Result<()> {
        let updated = {
            let mut conn = self.db.pool().acquire().await?;
            dao::set_dedupe_mode(&mut conn, container_id, mode).await?
        };
        if updated == 0 {
            self.link_work(container_id, container_id, None).await?;
            let mut conn = self.db.pool().acquire().await?;
            dao::set_dedupe_mode(&mut conn, container_id, mode).await?;
        }
        info!(container_id, %mode, "dedupe mode changed");
        Ok(())
    }

    /// Episodes of every work linked into the container, collapsed per its dedupe mode.
    pub async fn merged_episodes(&self, container_id: i64) -> Result<Vec<Episode>> {
        let mut conn = self.db.pool().acquire().await?;
        let links = dao::links_for_container(&mut conn, container_id).await?;
        let mut episodes = Vec::new();
        for link in links.iter().filter(|l| !l.is_self_link()) {
            episodes.extend(dao::episodes_for_work(&mut conn, link.work_id).await?);
        }
        Ok(merge::select(&links, episodes))
    }

    /// Records that an episode was just viewed for `duration` millis.
    pub async fn record_view(&self, episode_id: i64, duration: i64) -> Result<()> {
        let mut conn = self.db.pool().acquire().await?;
        dao::add_history_view(&mut conn, episode_id, self.clock.now_millis(), duration).await
    }

    pub async fn set_read(&self, episode_id: i64, read: bool, last_position: Option<i64>) -> Result<()> {
        let mut conn = self.db.pool().acquire().await?;
        match dao::set_episode_progress(&mut conn, episode_id, read, last_position).await? {
            0 => Err(Error::EpisodeNotFound(episode_id)),
            _ => Ok(()),
        }
    }

    pub async fn set_excluded_scanlators(&self, work_id: i64, scanlators: &[String]) -> Result<()> {
        let mut tx = self.db.pool().begin().await?;
        dao::set_excluded_scanlators(&mut tx, work_id, scanlators).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn create_category(&self, name: &str, sort: i64) -> Result<Category> {
        let mut conn = self.db.pool().acquire().await?;
        dao::insert_category(&mut conn, name, sort).await
    }

    pub async fn set_work_categories(&self, work_id: i64, category_ids: &[i64]) -> Result<()> {
        let mut tx = self.db.pool().begin().await?;
        dao::set_work_categories(&mut tx, work_id, category_ids).await?;
        tx.commit().await?;
        Ok(())
    }
}
