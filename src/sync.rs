//! Reconciles a freshly fetched remote episode list with the library.

pub mod diff;
pub mod interval;

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::dao;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::recognition::EpisodeRecognizer;
use crate::source::SourceKind;
use crate::storage::DownloadStorage;
use crate::types::{number_key, Episode, FetchWindow, RemoteEpisode, RemovedMarker, Work};

use self::diff::{assign_fetch_dates, diff_episodes, RemovedIndex};
use self::interval::{fetch_window, next_fetch};

/// Diff engine bound to its collaborators.
#[derive(Clone)]
pub struct EpisodeSyncer {
    db: Database,
    recognizer: Arc<dyn EpisodeRecognizer>,
    storage: Arc<dyn DownloadStorage>,
    clock: Arc<dyn Clock>,
    settings: SyncConfig,
}

impl EpisodeSyncer {
    pub fn new(
        db: Database,
        recognizer: Arc<dyn EpisodeRecognizer>,
        storage: Arc<dyn DownloadStorage>,
        clock: Arc<dyn Clock>,
        settings: SyncConfig,
    ) -> Self {
        Self { db, recognizer, storage, clock, settings }
    }

    /// Applies `remote` to the persisted episodes of `work` and returns the episodes
    /// that should be announced as new.
    ///
    /// Everything is written in one transaction. Episodes reusing the number of a
    /// removed one get its read/bookmark state back and are not announced, nor are
    /// episodes from scanlators the user excluded. `window` defaults to the grace
    /// window around now.
    #[instrument(skip_all, fields(work_id = work.id, remote = remote.len(), manual_fetch = manual_fetch))]
    pub async fn sync(
        &self,
        remote: Vec<RemoteEpisode>,
        work: &Work,
        source: &SourceKind,
        manual_fetch: bool,
        window: Option<FetchWindow>,
    ) -> Result<Vec<Episode>> {
        if remote.is_empty() && !source.is_offline() {
            return Err(Error::NoEpisodesFound { work_id: work.id });
        }
        let now = self.clock.now_millis();
        let window = window.unwrap_or_else(|| fetch_window(now, self.settings.grace_period_days));

        let mut conn = self.db.pool().acquire().await?;
        let persisted = dao::episodes_for_work(&mut conn, work.id).await?;
        let diff = diff_episodes(
            remote,
            work,
            &persisted,
            source,
            self.recognizer.as_ref(),
            now,
            &self.settings.blank_name,
        )?;

        if diff.is_empty() {
            if manual_fetch || work.fetch_interval == 0 || work.next_update < window.lower {
                let update = next_fetch(work, &persisted, now, window, self.settings.max_interval_days);
                dao::update_work_fetch_interval(&mut conn, work.id, update.fetch_interval, update.next_update, now).await?;
            }
            debug!("episode list unchanged");
            return Ok(Vec::new());
        }

        let excluded = dao::excluded_scanlators(&mut conn, work.id).await?;
        let stored_markers = dao::removed_markers(&mut conn, work.id).await?;
        drop(conn);

        for rename in &diff.renames {
            let downloaded = self
                .storage
                .is_downloaded(work, &rename.old_name, rename.old_scanlator.as_deref())
                .await;
            if !downloaded {
                continue;
            }
            if let Err(e) = self
                .storage
                .rename(
                    work,
                    &rename.old_name,
                    rename.old_scanlator.as_deref(),
                    &rename.new_name,
                    rename.new_scanlator.as_deref(),
                )
                .await
            {
                warn!(work_id = work.id, episode = %rename.old_name, error = %e, "failed to rename downloaded episode");
            }
        }

        let removed_markers: Vec<RemovedMarker> = diff.removed.iter().filter_map(RemovedMarker::from_episode).collect();
        let index = RemovedIndex::from_markers(stored_markers.iter().chain(removed_markers.iter()));
        let mut to_insert = diff.new;
        let readded = assign_fetch_dates(&mut to_insert, &index, now);

        let removed_ids: Vec<i64> = diff.removed.iter().map(|e| e.id).collect();
        let kept: Vec<Episode> = persisted
            .iter()
            .filter(|e| !removed_ids.contains(&e.id))
            .map(|e| diff.updated.iter().find(|u| u.id == e.id).unwrap_or(e).clone())
            .collect();
        // a marker only stands for a number no remaining episode carries
        let present: HashSet<u64> = kept.iter().chain(&to_insert).filter_map(|e| e.number).map(number_key).collect();

        let mut tx = self.db.pool().begin().await?;

        dao::delete_episodes(&mut tx, &removed_ids).await?;
        for marker in removed_markers.iter().filter(|m| !present.contains(&number_key(m.number))) {
            dao::upsert_removed_marker(&mut tx, work.id, marker).await?;
        }
        for marker in stored_markers.iter().filter(|m| present.contains(&number_key(m.number))) {
            dao::delete_removed_marker(&mut tx, work.id, marker.number).await?;
        }

        let mut inserted = Vec::with_capacity(to_insert.len());
        for episode in &to_insert {
            inserted.push(dao::insert_episode(&mut tx, episode).await?);
        }
        for episode in &diff.updated {
            dao::update_episode(&mut tx, episode).await?;
        }

        let current: Vec<Episode> = kept.into_iter().chain(inserted.iter().cloned()).collect();
        let refreshed = Work { last_update: now, ..work.clone() };
        let update = next_fetch(&refreshed, &current, now, window, self.settings.max_interval_days);
        dao::update_work_fetch_interval(&mut tx, work.id, update.fetch_interval, update.next_update, now).await?;
        dao::update_work_last_update(&mut tx, work.id, now).await?;

        tx.commit().await?;

        debug!(
            new = inserted.len(),
            updated = diff.updated.len(),
            removed = removed_ids.len(),
            readded = readded.len(),
            "episode list reconciled"
        );

        Ok(inserted
            .into_iter()
            .filter(|e| !readded.contains(&e.url))
            .filter(|e| e.scanlator.as_ref().map_or(true, |s| !excluded.contains(s)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::dao::WorkInsert;
    use crate::recognition::BasicRecognizer;
    use crate::storage::NoDownloads;
    use async_trait::async_trait;
    use std::sync::Mutex;

    const NOW: i64 = 1_700_000_000_000;

    struct FlakyStorage {
        renames: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl DownloadStorage for FlakyStorage {
        async fn is_downloaded(&self, _work: &Work, _name: &str, _scanlator: Option<&str>) -> bool {
            true
        }

        async fn rename(&self, _work: &Work, old: &str, _os: Option<&str>, new: &str, _ns: Option<&str>) -> anyhow::Result<()> {
            self.renames.lock().unwrap().push((old.to_string(), new.to_string()));
            anyhow::bail!("disk is read-only")
        }
    }

    async fn setup(storage: Arc<dyn DownloadStorage>) -> (EpisodeSyncer, Work, Arc<FixedClock>) {
        let db = Database::connect_in_memory().await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        let id = dao::insert_work(
            &mut conn,
            &WorkInsert { source_id: 1, url: "/w/1".into(), title: "Blue Flag".into(), favorite: true, date_added: NOW },
        )
        .await
        .unwrap();
        let work = dao::get_work(&mut conn, id).await.unwrap().unwrap();
        drop(conn);
        let clock = Arc::new(FixedClock::new(NOW));
        let syncer = EpisodeSyncer::new(db, Arc::new(BasicRecognizer), storage, clock.clone(), SyncConfig::default());
        (syncer, work, clock)
    }

    fn remote(url: &str, name: &str) -> RemoteEpisode {
        RemoteEpisode::new(url, name)
    }

    async fn stored(syncer: &EpisodeSyncer, work_id: i64) -> Vec<Episode> {
        let mut conn = syncer.db.pool().acquire().await.unwrap();
        dao::episodes_for_work(&mut conn, work_id).await.unwrap()
    }

    async fn reload(syncer: &EpisodeSyncer, work_id: i64) -> Work {
        let mut conn = syncer.db.pool().acquire().await.unwrap();
        dao::get_work(&mut conn, work_id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn first_fetch_of_one_episode() {
        let (syncer, work, _) = setup(Arc::new(NoDownloads)).await;
        let new = syncer.sync(vec![remote("/c1", "Ch.1")], &work, &SourceKind::http(), false, None).await.unwrap();

        assert_eq!(new.len(), 1);
        assert_eq!(new[0].source_order, 0);
        assert_eq!(new[0].date_fetch, NOW + 1);
        assert_eq!(new[0].date_upload, NOW);
        assert_eq!(new[0].number, Some(1.0));
        let work = reload(&syncer, work.id).await;
        assert_eq!(work.last_update, NOW);
        assert_eq!(work.last_fetched_at, NOW);
        assert!(work.fetch_interval > 0);
    }

    #[tokio::test]
    async fn second_identical_fetch_changes_nothing() {
        let (syncer, work, clock) = setup(Arc::new(NoDownloads)).await;
        let list = vec![remote("/c1", "Ch.1"), remote("/c2", "Ch.2")];
        syncer.sync(list.clone(), &work, &SourceKind::http(), false, None).await.unwrap();
        let before = stored(&syncer, work.id).await;

        clock.advance(60_000);
        let work = reload(&syncer, work.id).await;
        let new = syncer.sync(list, &work, &SourceKind::http(), false, None).await.unwrap();

        assert!(new.is_empty());
        assert_eq!(stored(&syncer, work.id).await, before);
        let after = reload(&syncer, work.id).await;
        assert_eq!(after.last_update, NOW);
        assert_eq!(after.last_fetched_at, work.last_fetched_at);
        assert_eq!(after.fetch_interval, work.fetch_interval);
        assert_eq!(after.next_update, work.next_update);
    }

    #[tokio::test]
    async fn unchanged_list_computes_missing_interval() {
        let (syncer, work, clock) = setup(Arc::new(NoDownloads)).await;
        syncer.sync(vec![remote("/c1", "Ch.1")], &work, &SourceKind::http(), false, None).await.unwrap();
        let work = reload(&syncer, work.id).await;
        {
            let mut conn = syncer.db.pool().acquire().await.unwrap();
            dao::update_work_fetch_interval(&mut conn, work.id, 0, work.next_update, work.last_fetched_at).await.unwrap();
        }

        clock.advance(60_000);
        let work = reload(&syncer, work.id).await;
        syncer.sync(vec![remote("/c1", "Ch.1")], &work, &SourceKind::http(), false, None).await.unwrap();

        let after = reload(&syncer, work.id).await;
        assert_eq!(after.fetch_interval, interval::DEFAULT_INTERVAL_DAYS);
        assert_eq!(after.last_fetched_at, NOW + 60_000);
        assert_eq!(after.last_update, NOW);
    }

    #[tokio::test]
    async fn unchanged_list_reschedules_overdue_work() {
        let (syncer, work, clock) = setup(Arc::new(NoDownloads)).await;
        syncer.sync(vec![remote("/c1", "Ch.1")], &work, &SourceKind::http(), false, None).await.unwrap();
        let work = reload(&syncer, work.id).await;
        let overdue = NOW - 10 * interval::DAY_MILLIS;
        {
            let mut conn = syncer.db.pool().acquire().await.unwrap();
            dao::update_work_fetch_interval(&mut conn, work.id, work.fetch_interval, overdue, work.last_fetched_at)
                .await
                .unwrap();
        }

        clock.advance(60_000);
        let work = reload(&syncer, work.id).await;
        syncer.sync(vec![remote("/c1", "Ch.1")], &work, &SourceKind::http(), false, None).await.unwrap();

        let after = reload(&syncer, work.id).await;
        assert!(after.next_update > NOW);
        assert_eq!(after.last_fetched_at, NOW + 60_000);
    }

    #[tokio::test]
    async fn manual_fetch_without_changes_still_touches_interval() {
        let (syncer, work, clock) = setup(Arc::new(NoDownloads)).await;
        syncer.sync(vec![remote("/c1", "Ch.1")], &work, &SourceKind::http(), false, None).await.unwrap();
        clock.advance(3_600_000);
        let work = reload(&syncer, work.id).await;
        syncer.sync(vec![remote("/c1", "Ch.1")], &work, &SourceKind::http(), true, None).await.unwrap();
        assert_eq!(reload(&syncer, work.id).await.last_fetched_at, NOW + 3_600_000);
    }

    #[tokio::test]
    async fn removed_then_reintroduced_episode_keeps_read_state() {
        let (syncer, work, clock) = setup(Arc::new(NoDownloads)).await;
        syncer
            .sync(vec![remote("/c1", "Ch.1"), remote("/c2", "Ch.2")], &work, &SourceKind::http(), false, None)
            .await
            .unwrap();
        let c1 = stored(&syncer, work.id).await.into_iter().find(|e| e.url == "/c1").unwrap();
        {
            let mut conn = syncer.db.pool().acquire().await.unwrap();
            dao::set_episode_progress(&mut conn, c1.id, true, Some(12)).await.unwrap();
        }

        clock.advance(1000);
        let work = reload(&syncer, work.id).await;
        syncer.sync(vec![remote("/c2", "Ch.2")], &work, &SourceKind::http(), false, None).await.unwrap();
        assert_eq!(stored(&syncer, work.id).await.len(), 1);

        clock.advance(1000);
        let work = reload(&syncer, work.id).await;
        let new = syncer
            .sync(vec![remote("/c1", "Ch.1"), remote("/c2", "Ch.2")], &work, &SourceKind::http(), false, None)
            .await
            .unwrap();

        assert!(new.is_empty(), "re-added episodes are not announced");
        let back = stored(&syncer, work.id).await.into_iter().find(|e| e.url == "/c1").unwrap();
        assert!(back.read);
        assert_eq!(back.date_fetch, c1.date_fetch);
    }

    #[tokio::test]
    async fn url_change_in_one_run_counts_as_readded() {
        let (syncer, work, clock) = setup(Arc::new(NoDownloads)).await;
        syncer.sync(vec![remote("/old/c1", "Ch.1")], &work, &SourceKind::http(), false, None).await.unwrap();
        let old = stored(&syncer, work.id).await.remove(0);
        {
            let mut conn = syncer.db.pool().acquire().await.unwrap();
            dao::set_episode_progress(&mut conn, old.id, true, None).await.unwrap();
        }
        clock.advance(1000);
        let work = reload(&syncer, work.id).await;
        let new = syncer
            .sync(vec![remote("/new/c1", "Ch.1"), remote("/new/c2", "Ch.2")], &work, &SourceKind::http(), false, None)
            .await
            .unwrap();

        assert_eq!(new.len(), 1);
        assert_eq!(new[0].url, "/new/c2");
        let eps = stored(&syncer, work.id).await;
        let moved = eps.iter().find(|e| e.url == "/new/c1").unwrap();
        assert!(moved.read);
        assert_eq!(moved.date_fetch, old.date_fetch);
    }

    #[tokio::test]
    async fn rename_failure_does_not_block_update() {
        let storage = Arc::new(FlakyStorage { renames: Mutex::new(Vec::new()) });
        let (syncer, work, _) = setup(storage.clone()).await;
        syncer.sync(vec![remote("/c1", "Ch.1")], &work, &SourceKind::http(), false, None).await.unwrap();
        let before = stored(&syncer, work.id).await.remove(0);

        let work = reload(&syncer, work.id).await;
        syncer.sync(vec![remote("/c1", "Ch.1 Beginnings")], &work, &SourceKind::http(), false, None).await.unwrap();

        let after = stored(&syncer, work.id).await.remove(0);
        assert_eq!(after.name, "Ch.1 Beginnings");
        assert_eq!(after.version, before.version + 1);
        assert_eq!(storage.renames.lock().unwrap().as_slice(), &[("Ch.1".to_string(), "Ch.1 Beginnings".to_string())]);
    }

    #[tokio::test]
    async fn excluded_scanlators_are_not_announced() {
        let (syncer, work, _) = setup(Arc::new(NoDownloads)).await;
        {
            let mut conn = syncer.db.pool().acquire().await.unwrap();
            dao::set_excluded_scanlators(&mut conn, work.id, &["Spam Scans".to_string()]).await.unwrap();
        }
        let mut spam = remote("/c1b", "Ch.1");
        spam.scanlator = Some("Spam Scans".into());
        let new = syncer
            .sync(vec![remote("/c1", "Ch.1"), spam], &work, &SourceKind::http(), false, None)
            .await
            .unwrap();
        assert_eq!(new.len(), 1);
        assert_eq!(new[0].url, "/c1");
        assert_eq!(stored(&syncer, work.id).await.len(), 2);
    }

    #[tokio::test]
    async fn empty_list_is_an_error_unless_offline() {
        let (syncer, work, _) = setup(Arc::new(NoDownloads)).await;
        syncer.sync(vec![remote("/c1", "Ch.1")], &work, &SourceKind::http(), false, None).await.unwrap();

        let err = syncer.sync(Vec::new(), &work, &SourceKind::http(), false, None).await.unwrap_err();
        assert!(matches!(err, Error::NoEpisodesFound { .. }));
        assert_eq!(stored(&syncer, work.id).await.len(), 1);

        let work = reload(&syncer, work.id).await;
        syncer.sync(Vec::new(), &work, &SourceKind::Offline, false, None).await.unwrap();
        assert!(stored(&syncer, work.id).await.is_empty());
    }

    #[tokio::test]
    async fn failing_refiner_leaves_library_untouched() {
        struct Broken;
        impl crate::source::EpisodeRefiner for Broken {
            fn prepare(&self, _e: RemoteEpisode, _w: &Work) -> anyhow::Result<RemoteEpisode> {
                anyhow::bail!("layout changed")
            }
        }
        let (syncer, work, _) = setup(Arc::new(NoDownloads)).await;
        let source = SourceKind::http_with(Arc::new(Broken));
        let err = syncer.sync(vec![remote("/c1", "Ch.1")], &work, &source, false, None).await.unwrap_err();
        assert!(matches!(err, Error::Refine { .. }));
        assert!(stored(&syncer, work.id).await.is_empty());
        assert_eq!(reload(&syncer, work.id).await.last_update, 0);
    }

    #[tokio::test]
    async fn failed_write_rolls_back_the_whole_run() {
        let (syncer, work, clock) = setup(Arc::new(NoDownloads)).await;
        syncer
            .sync(vec![remote("/c1", "Ch.1"), remote("/c2", "Ch.2")], &work, &SourceKind::http(), false, None)
            .await
            .unwrap();
        let c1 = stored(&syncer, work.id).await.into_iter().find(|e| e.url == "/c1").unwrap();
        {
            let mut conn = syncer.db.pool().acquire().await.unwrap();
            dao::set_episode_progress(&mut conn, c1.id, true, None).await.unwrap();
        }
        let before = stored(&syncer, work.id).await;
        sqlx::query("CREATE TRIGGER block_inserts BEFORE INSERT ON episodes BEGIN SELECT RAISE(ABORT, 'read-only'); END")
            .execute(syncer.db.pool())
            .await
            .unwrap();

        clock.advance(1000);
        let work = reload(&syncer, work.id).await;
        let err = syncer
            .sync(vec![remote("/c2", "Ch.2"), remote("/c3", "Ch.3")], &work, &SourceKind::http(), false, None)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Database(_)));
        assert_eq!(stored(&syncer, work.id).await, before);
        let mut conn = syncer.db.pool().acquire().await.unwrap();
        assert!(dao::removed_markers(&mut conn, work.id).await.unwrap().is_empty());
        drop(conn);
        assert_eq!(reload(&syncer, work.id).await, work);
    }

    #[tokio::test]
    async fn number_still_carried_by_another_copy_leaves_no_marker() {
        let (syncer, work, clock) = setup(Arc::new(NoDownloads)).await;
        let mut team_a = remote("/a/c5", "Ch.5");
        team_a.scanlator = Some("Team A".into());
        let mut team_b = remote("/b/c5", "Ch.5");
        team_b.scanlator = Some("Team B".into());
        syncer.sync(vec![team_a, team_b.clone()], &work, &SourceKind::http(), false, None).await.unwrap();
        let a = stored(&syncer, work.id).await.into_iter().find(|e| e.url == "/a/c5").unwrap();
        {
            let mut conn = syncer.db.pool().acquire().await.unwrap();
            dao::set_episode_progress(&mut conn, a.id, true, None).await.unwrap();
        }

        clock.advance(1000);
        let work = reload(&syncer, work.id).await;
        syncer.sync(vec![team_b.clone()], &work, &SourceKind::http(), false, None).await.unwrap();
        {
            let mut conn = syncer.db.pool().acquire().await.unwrap();
            assert!(dao::removed_markers(&mut conn, work.id).await.unwrap().is_empty());
        }

        clock.advance(1000);
        let work = reload(&syncer, work.id).await;
        let mut team_c = remote("/c/c5", "Ch.5");
        team_c.scanlator = Some("Team C".into());
        let new = syncer.sync(vec![team_b, team_c], &work, &SourceKind::http(), false, None).await.unwrap();

        assert_eq!(new.len(), 1);
        assert_eq!(new[0].url, "/c/c5");
        assert!(!new[0].read);
    }
}
