use std::collections::{HashMap, HashSet};

use crate::error::Result;
use crate::recognition::EpisodeRecognizer;
use crate::source::SourceKind;
use crate::types::{number_key, Episode, RemoteEpisode, RemovedMarker, Work};

// Characters trimmed from names after the work title prefix is removed.
const NAME_TRIM: &[char] = &[' ', '-', '_', ',', ':'];

/// A downloaded episode whose directory name is affected by an update.
#[derive(Debug, Clone, PartialEq)]
pub struct DirRename {
    pub old_name: String,
    pub old_scanlator: Option<String>,
    pub new_name: String,
    pub new_scanlator: Option<String>,
}

/// Outcome of comparing one remote list with the persisted episodes of a work.
#[derive(Debug, Default, Clone)]
pub struct EpisodeDiff {
    /// Not yet persisted; `id` is zero and `date_fetch` unassigned.
    pub new: Vec<Episode>,
    /// Persisted rows carrying the refreshed metadata.
    pub updated: Vec<Episode>,
    pub removed: Vec<Episode>,
    /// Rename requests, to be honoured only for episodes actually downloaded.
    pub renames: Vec<DirRename>,
}

impl EpisodeDiff {
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

pub fn sanitize_name(name: &str, work_title: &str, blank_name: &str) -> String {
    let trimmed = name.trim();
    let title = work_title.trim();
    let stripped = if !title.is_empty() { trimmed.strip_prefix(title).unwrap_or(trimmed) } else { trimmed };
    let cleaned = stripped.trim_matches(NAME_TRIM);
    if !cleaned.is_empty() {
        cleaned.to_string()
    } else if !trimmed.is_empty() {
        trimmed.to_string()
    } else {
        blank_name.to_string()
    }
}

/// Whether the persisted row differs from the freshly fetched one.
/// An unknown remote upload time never counts as a change.
fn should_update(db: &Episode, remote: &Episode) -> bool {
    db.scanlator != remote.scanlator
        || db.name != remote.name
        || (remote.date_upload != 0 && db.date_upload != remote.date_upload)
        || db.number != remote.number
        || db.source_order != remote.source_order
}

/// Computes new, updated and removed episodes. The source refinement hook runs
/// here; its failure aborts the whole batch.
pub fn diff_episodes(
    remote: Vec<RemoteEpisode>,
    work: &Work,
    persisted: &[Episode],
    source: &SourceKind,
    recognizer: &dyn EpisodeRecognizer,
    now: i64,
    blank_name: &str,
) -> Result<EpisodeDiff> {
    let mut seen = HashSet::new();
    let remote: Vec<RemoteEpisode> = remote
        .into_iter()
        .filter(|e| seen.insert(e.url.clone()))
        .map(|mut e| {
            e.name = sanitize_name(&e.name, &work.title, blank_name);
            e
        })
        .collect();

    let by_url: HashMap<&str, &Episode> = persisted.iter().map(|e| (e.url.as_str(), e)).collect();
    let mut diff = EpisodeDiff {
        removed: persisted.iter().filter(|e| !seen.contains(&e.url)).cloned().collect(),
        ..Default::default()
    };

    let mut max_seen_upload = 0i64;
    for (position, raw) in remote.into_iter().enumerate() {
        let mut raw = source.refine(raw, work)?;
        if raw.name.trim().is_empty() {
            raw.name = blank_name.to_string();
        }
        let number = recognizer.recognize(&work.title, &raw.name, raw.number);
        let upload = raw.known_upload().unwrap_or(0);
        let fetched = Episode {
            id: 0,
            work_id: work.id,
            url: raw.url,
            name: raw.name,
            scanlator: raw.scanlator.filter(|s| !s.trim().is_empty()),
            number,
            source_order: position as i64,
            date_fetch: 0,
            date_upload: upload,
            read: false,
            bookmark: false,
            last_position: None,
            version: 0,
        };

        match by_url.get(fetched.url.as_str()) {
            None => {
                let mut episode = fetched;
                if upload == 0 {
                    episode.date_upload = if max_seen_upload == 0 { now } else { max_seen_upload };
                } else {
                    max_seen_upload = max_seen_upload.max(upload);
                }
                diff.new.push(episode);
            }
            Some(db) => {
                if !should_update(db, &fetched) {
                    continue;
                }
                if db.dir_name_changed(&fetched) {
                    diff.renames.push(DirRename {
                        old_name: db.name.clone(),
                        old_scanlator: db.scanlator.clone(),
                        new_name: fetched.name.clone(),
                        new_scanlator: fetched.scanlator.clone(),
                    });
                }
                let mut changed = (*db).clone();
                changed.name = fetched.name;
                changed.scanlator = fetched.scanlator;
                changed.number = fetched.number;
                changed.source_order = fetched.source_order;
                if upload != 0 {
                    changed.date_upload = upload;
                }
                diff.updated.push(changed);
            }
        }
    }
    Ok(diff)
}

/// Progress left behind by removed episodes, keyed by recognized number.
#[derive(Debug, Default)]
pub struct RemovedIndex {
    numbers: HashSet<u64>,
    read: HashSet<u64>,
    bookmarked: HashSet<u64>,
    last_fetch: HashMap<u64, i64>,
}

impl RemovedIndex {
    pub fn from_markers<'a>(markers: impl IntoIterator<Item = &'a RemovedMarker>) -> Self {
        let mut index = RemovedIndex::default();
        for m in markers {
            let key = number_key(m.number);
            index.numbers.insert(key);
            if m.read {
                index.read.insert(key);
            }
            if m.bookmark {
                index.bookmarked.insert(key);
            }
            let fetch = index.last_fetch.entry(key).or_insert(m.date_fetch);
            *fetch = (*fetch).max(m.date_fetch);
        }
        index
    }

    /// Restores progress onto a new episode that reuses a removed number.
    /// Returns whether the episode counts as re-added.
    pub fn restore(&self, episode: &mut Episode) -> bool {
        let Some(key) = episode.number.map(number_key) else { return false };
        if !self.numbers.contains(&key) {
            return false;
        }
        episode.read |= self.read.contains(&key);
        episode.bookmark |= self.bookmarked.contains(&key);
        if let Some(fetch) = self.last_fetch.get(&key).filter(|f| **f > 0) {
            episode.date_fetch = *fetch;
        }
        true
    }
}

/// Assigns fetch times `now + n ..= now + 1` in list order so the batch sorts as one
/// block, then restores progress of re-added episodes. Returns the urls re-added.
pub fn assign_fetch_dates(new: &mut [Episode], removed: &RemovedIndex, now: i64) -> HashSet<String> {
    let count = new.len() as i64;
    let mut readded = HashSet::new();
    for (i, episode) in new.iter_mut().enumerate() {
        episode.date_fetch = now + (count - i as i64);
        if removed.restore(episode) {
            readded.insert(episode.url.clone());
        }
    }
    readded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognition::BasicRecognizer;
    use crate::source::EpisodeRefiner;
    use std::sync::Arc;

    const NOW: i64 = 1_700_000_000_000;

    fn work() -> Work {
        Work {
            id: 7,
            source_id: 1,
            url: "/w".into(),
            title: "Blue Flag".into(),
            favorite: true,
            date_added: 0,
            episode_flags: 0,
            fetch_interval: 0,
            next_update: 0,
            last_update: 0,
            last_fetched_at: 0,
        }
    }

    fn remote(url: &str, name: &str, upload: i64) -> RemoteEpisode {
        RemoteEpisode { date_upload: Some(upload), ..RemoteEpisode::new(url, name) }
    }

    fn persisted(id: i64, url: &str, name: &str, number: f64, order: i64) -> Episode {
        Episode {
            id,
            work_id: 7,
            url: url.into(),
            name: name.into(),
            scanlator: None,
            number: Some(number),
            source_order: order,
            date_fetch: NOW - 1000,
            date_upload: NOW - 5000,
            read: false,
            bookmark: false,
            last_position: None,
            version: 1,
        }
    }

    fn diff(remote: Vec<RemoteEpisode>, db: &[Episode]) -> EpisodeDiff {
        diff_episodes(remote, &work(), db, &SourceKind::http(), &BasicRecognizer, NOW, "Untitled").unwrap()
    }

    #[test]
    fn sanitize_strips_title_and_fills_blanks() {
        assert_eq!(sanitize_name("  Blue Flag - Ch. 3 ", "Blue Flag", "Untitled"), "Ch. 3");
        assert_eq!(sanitize_name("   ", "Blue Flag", "Untitled"), "Untitled");
        assert_eq!(sanitize_name("Blue Flag", "Blue Flag", "Untitled"), "Blue Flag");
        assert_eq!(sanitize_name("Ch.1", "", "Untitled"), "Ch.1");
    }

    #[test]
    fn first_fetch_is_all_new_in_source_order() {
        let d = diff(vec![remote("/c2", "Ch.2", 0), remote("/c1", "Ch.1", 0), remote("/c2", "dup", 0)], &[]);
        assert_eq!(d.new.len(), 2);
        assert_eq!(d.new[0].url, "/c2");
        assert_eq!(d.new[0].source_order, 0);
        assert_eq!(d.new[1].source_order, 1);
        assert_eq!(d.new[1].number, Some(1.0));
        assert!(d.removed.is_empty() && d.updated.is_empty());
    }

    #[test]
    fn missing_upload_dates_follow_the_watermark() {
        let d = diff(
            vec![remote("/a", "Ch.4", 0), remote("/b", "Ch.3", 300), remote("/c", "Ch.2", 0), remote("/d", "Ch.1", 200)],
            &[],
        );
        let uploads: Vec<i64> = d.new.iter().map(|e| e.date_upload).collect();
        assert_eq!(uploads, vec![NOW, 300, 300, 200]);
    }

    #[test]
    fn unchanged_list_produces_empty_diff() {
        let db = vec![persisted(1, "/c1", "Ch.1", 1.0, 0)];
        let d = diff(vec![remote("/c1", "Ch.1", 0)], &db);
        assert!(d.is_empty());
    }

    #[test]
    fn renamed_episode_is_updated_with_rename_request() {
        let mut db = vec![persisted(1, "/c1", "Ch.1", 1.0, 0)];
        db[0].scanlator = Some("Old Team".into());
        let mut r = remote("/c1", "Ch.1 - The Start", NOW);
        r.scanlator = Some("New Team".into());
        let d = diff(vec![r], &db);
        assert_eq!(d.updated.len(), 1);
        assert_eq!(d.updated[0].id, 1);
        assert_eq!(d.updated[0].date_upload, NOW);
        assert_eq!(d.renames.len(), 1);
        assert_eq!(d.renames[0].old_scanlator.as_deref(), Some("Old Team"));
        assert_eq!(d.renames[0].new_name, "Ch.1 - The Start");
    }

    #[test]
    fn reorder_updates_without_rename() {
        let db = vec![persisted(1, "/c1", "Ch.1", 1.0, 0), persisted(2, "/c2", "Ch.2", 2.0, 1)];
        let d = diff(vec![remote("/c2", "Ch.2", 0), remote("/c1", "Ch.1", 0)], &db);
        assert_eq!(d.updated.len(), 2);
        assert!(d.renames.is_empty());
        // unknown remote upload keeps the stored one
        assert!(d.updated.iter().all(|e| e.date_upload == NOW - 5000));
    }

    #[test]
    fn absent_urls_are_removed() {
        let db = vec![persisted(1, "/c1", "Ch.1", 1.0, 0), persisted(2, "/c2", "Ch.2", 2.0, 1)];
        let d = diff(vec![remote("/c2", "Ch.2", 0)], &db);
        assert_eq!(d.removed.len(), 1);
        assert_eq!(d.removed[0].url, "/c1");
    }

    struct Upper;
    impl EpisodeRefiner for Upper {
        fn prepare(&self, mut e: RemoteEpisode, _work: &Work) -> anyhow::Result<RemoteEpisode> {
            if e.url == "/bad" {
                anyhow::bail!("unparseable");
            }
            e.name = e.name.to_uppercase();
            Ok(e)
        }
    }

    #[test]
    fn refiner_runs_before_recognition_and_aborts_on_error() {
        let source = SourceKind::http_with(Arc::new(Upper));
        let d = diff_episodes(vec![remote("/c1", "ep 5", 0)], &work(), &[], &source, &BasicRecognizer, NOW, "x").unwrap();
        assert_eq!(d.new[0].name, "EP 5");
        assert_eq!(d.new[0].number, Some(5.0));

        let err = diff_episodes(vec![remote("/c1", "ep 5", 0), remote("/bad", "ep 6", 0)], &work(), &[], &source, &BasicRecognizer, NOW, "x")
            .unwrap_err();
        assert!(matches!(err, crate::Error::Refine { ref url, .. } if url == "/bad"));
    }

    #[test]
    fn fetch_dates_descend_and_readded_restore_progress() {
        let mut new = vec![
            persisted(0, "/n3", "Ch.3", 3.0, 0),
            persisted(0, "/n1", "Ch.1", 1.0, 1),
            persisted(0, "/x", "Extra", 0.0, 2),
        ];
        new[2].number = None;
        let markers = vec![
            RemovedMarker { number: 1.0, read: true, bookmark: false, date_fetch: 10 },
            RemovedMarker { number: 1.0, read: false, bookmark: true, date_fetch: 40 },
        ];
        let index = RemovedIndex::from_markers(&markers);
        let readded = assign_fetch_dates(&mut new, &index, NOW);

        assert_eq!(new[0].date_fetch, NOW + 3);
        assert_eq!(new[2].date_fetch, NOW + 1);
        assert!(readded.contains("/n1") && readded.len() == 1);
        assert!(new[1].read && new[1].bookmark);
        assert_eq!(new[1].date_fetch, 40);
    }
}
