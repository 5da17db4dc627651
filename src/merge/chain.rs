use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, OnceLock};

use regex::Regex;
use tracing::{info, instrument};
use url::Url;

use crate::clock::Clock;
use crate::dao::{self, FavoriteEntryInsert};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::types::{number_key, Episode, History, Work};

/// One candidate duplicate: a work with everything hanging off it.
#[derive(Debug, Clone, PartialEq)]
pub struct Chain {
    pub work: Work,
    pub episodes: Vec<Episode>,
    pub history: Vec<History>,
    pub categories: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub accepted: Chain,
    pub discarded: Vec<Chain>,
    pub new_episodes: Vec<Episode>,
}

/// History writes needed so that each final episode carries its freshest row.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct HistoryPlan {
    /// (episode id, last seen, duration)
    pub upserts: Vec<(i64, Option<i64>, i64)>,
    pub deletes: Vec<i64>,
}

fn version_prefix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^v\d+: ").unwrap())
}

/// Site identity of a work: the last two path segments of its url (`/g/{gid}/{token}/`).
pub fn identity_tokens(url: &str) -> Option<(String, String)> {
    let parsed = match Url::parse(url) {
        Ok(u) => u,
        Err(_) => Url::parse("https://localhost/").ok()?.join(url).ok()?,
    };
    let segments: Vec<&str> = parsed.path_segments()?.filter(|s| !s.is_empty()).collect();
    match segments.as_slice() {
        [.., gid, token] => Some((gid.to_string(), token.to_string())),
        _ => None,
    }
}

/// Folds the episodes of `discarded` into the accepted chain, keyed by url.
///
/// Read and bookmark flags are OR-ed, positions take the max; an episode still
/// without a position inherits the highest position any chain recorded for the
/// same number. The result is ordered by upload time and renumbered as
/// successive versions (`v1: `, `v2: `...). Episodes new to the accepted work
/// have id 0.
pub fn fold_episodes(accepted: &Chain, discarded: &[Chain]) -> Vec<Episode> {
    let mut watermark: HashMap<u64, i64> = HashMap::new();
    for e in std::iter::once(accepted).chain(discarded).flat_map(|c| &c.episodes) {
        if let (Some(n), Some(p)) = (e.number, e.last_position) {
            let slot = watermark.entry(number_key(n)).or_insert(p);
            *slot = (*slot).max(p);
        }
    }
    let mark_for = |number: Option<f64>| number.and_then(|n| watermark.get(&number_key(n)).copied());

    let mut combined = accepted.episodes.clone();
    let mut by_url: HashMap<String, usize> = combined.iter().enumerate().map(|(i, e)| (e.url.clone(), i)).collect();

    for episode in discarded.iter().flat_map(|c| &c.episodes) {
        match by_url.get(&episode.url) {
            Some(&i) => {
                let current = &mut combined[i];
                current.read |= episode.read;
                current.bookmark |= episode.bookmark;
                current.last_position = current.last_position.max(episode.last_position);
                if current.last_position.is_none() {
                    current.last_position = mark_for(current.number.or(episode.number));
                }
            }
            None => {
                let mut pending = episode.clone();
                pending.id = 0;
                pending.work_id = accepted.work.id;
                pending.version = 0;
                if pending.last_position.is_none() {
                    pending.last_position = mark_for(pending.number);
                }
                by_url.insert(pending.url.clone(), combined.len());
                combined.push(pending);
            }
        }
    }

    combined.sort_by_key(|e| e.date_upload);
    let last = combined.len().saturating_sub(1);
    for (i, e) in combined.iter_mut().enumerate() {
        let bare = version_prefix().replace(&e.name, "").into_owned();
        e.name = format!("v{}: {}", i + 1, bare);
        e.number = Some((i + 1) as f64);
        e.source_order = (last - i) as i64;
    }
    combined
}

/// Picks, per final episode, the most recently seen history row among all rows
/// that point at an episode with the same url, and drops rows whose episode is
/// not part of the final set.
pub fn plan_history(final_episodes: &[Episode], chains: &[&Chain]) -> HistoryPlan {
    let url_of: HashMap<i64, &str> = chains
        .iter()
        .flat_map(|c| &c.episodes)
        .chain(final_episodes)
        .map(|e| (e.id, e.url.as_str()))
        .collect();

    let mut by_url: HashMap<&str, Vec<&History>> = HashMap::new();
    for h in chains.iter().flat_map(|c| &c.history) {
        if let Some(&url) = url_of.get(&h.episode_id) {
            by_url.entry(url).or_default().push(h);
        }
    }

    let mut plan = HistoryPlan::default();
    for episode in final_episodes {
        let Some(candidates) = by_url.get(episode.url.as_str()) else { continue };
        let best = candidates.iter().max_by(|a, b| {
            a.last_read
                .cmp(&b.last_read)
                .then_with(|| (a.episode_id == episode.id).cmp(&(b.episode_id == episode.id)))
        });
        if let Some(best) = best {
            if best.episode_id != episode.id && best.last_read.is_some() {
                plan.upserts.push((episode.id, best.last_read, best.time_read));
            }
        }
    }

    let final_ids: HashSet<i64> = final_episodes.iter().map(|e| e.id).collect();
    let mut seen = HashSet::new();
    plan.deletes = chains
        .iter()
        .flat_map(|c| &c.history)
        .filter(|h| !final_ids.contains(&h.episode_id) && seen.insert(h.id))
        .map(|h| h.id)
        .collect();
    plan
}

/// Collapses duplicate works of one source into the oldest one.
#[derive(Clone)]
pub struct ChainResolver {
    db: Database,
    clock: Arc<dyn Clock>,
}

impl ChainResolver {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    async fn load_chains(&self, source_id: i64, episodes: &[Episode]) -> Result<Vec<Chain>> {
        let mut urls: Vec<String> = episodes.iter().map(|e| e.url.clone()).collect();
        urls.sort();
        urls.dedup();

        let mut conn = self.db.pool().acquire().await?;
        let works = dao::find_works_owning_urls(&mut conn, source_id, &urls).await?;
        let mut chains = Vec::with_capacity(works.len());
        for work in works {
            let episodes = dao::episodes_for_work(&mut conn, work.id).await?;
            let history = dao::history_for_work(&mut conn, work.id).await?;
            let categories = dao::category_ids_for_work(&mut conn, work.id).await?;
            chains.push(Chain { work, episodes, history, categories });
        }
        Ok(chains)
    }

    /// Finds every work on `source_id` sharing an episode url with `episodes`, keeps
    /// the oldest one and folds the other favorited ones into it.
    ///
    /// Discarded works are unfavorited, never deleted. All writes happen in one
    /// transaction. `episodes` must already be persisted under some work.
    #[instrument(skip_all, fields(source_id = source_id, episodes = episodes.len()))]
    pub async fn resolve(&self, source_id: i64, episodes: &[Episode]) -> Result<MergeOutcome> {
        let mut chains = self.load_chains(source_id, episodes).await?;
        if chains.is_empty() {
            return Err(Error::NoChainsFound { source_id });
        }
        // load_chains returns works ordered by id; the oldest wins
        let accepted = chains.remove(0);
        let discarded: Vec<Chain> = chains.into_iter().filter(|c| c.work.favorite).collect();
        if discarded.is_empty() {
            return Ok(MergeOutcome { accepted, discarded, new_episodes: Vec::new() });
        }

        let now = self.clock.now_millis();
        let folded = fold_episodes(&accepted, &discarded);
        let categories: Vec<i64> = std::iter::once(&accepted)
            .chain(&discarded)
            .flat_map(|c| c.categories.iter().copied())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut tx = self.db.pool().begin().await?;

        let mut accepted_work = accepted.work.clone();
        if !accepted_work.favorite {
            accepted_work.favorite = true;
            accepted_work.date_added = now;
            dao::update_work_favorite(&mut tx, accepted_work.id, true, now).await?;
        }
        for chain in &discarded {
            dao::update_work_favorite(&mut tx, chain.work.id, false, 0).await?;
        }

        let originals: HashMap<i64, &Episode> = accepted.episodes.iter().map(|e| (e.id, e)).collect();
        let mut final_episodes = Vec::with_capacity(folded.len());
        let mut new_episodes = Vec::new();
        for episode in folded {
            if episode.id == 0 {
                let stored = dao::insert_episode(&mut tx, &episode).await?;
                new_episodes.push(stored.clone());
                final_episodes.push(stored);
            } else if originals.get(&episode.id).is_some_and(|orig| **orig != episode) {
                dao::update_episode(&mut tx, &episode).await?;
                final_episodes.push(Episode { version: episode.version + 1, ..episode });
            } else {
                final_episodes.push(episode);
            }
        }

        let all: Vec<&Chain> = std::iter::once(&accepted).chain(&discarded).collect();
        let history_plan = plan_history(&final_episodes, &all);
        for (episode_id, last_read, time_read) in &history_plan.upserts {
            dao::upsert_history(&mut tx, *episode_id, *last_read, *time_read).await?;
        }
        dao::delete_history(&mut tx, &history_plan.deletes).await?;

        for chain in &all {
            dao::set_work_categories(&mut tx, chain.work.id, &categories).await?;
        }

        if let Some((gid, token)) = identity_tokens(&accepted.work.url) {
            let other = discarded.iter().find_map(|c| identity_tokens(&c.work.url));
            if let Some((other_gid, other_token)) = other {
                let entry = FavoriteEntryInsert {
                    title: accepted.work.title.clone(),
                    source_id,
                    gid,
                    token,
                    other_gid: Some(other_gid),
                    other_token: Some(other_token),
                };
                dao::upsert_favorite_entry(&mut tx, &entry).await?;
            }
        }

        let history = dao::history_for_work(&mut tx, accepted_work.id).await?;
        tx.commit().await?;

        info!(
            accepted = accepted_work.id,
            discarded = discarded.len(),
            new = new_episodes.len(),
            "merged duplicate chains"
        );

        let discarded = discarded
            .into_iter()
            .map(|mut c| {
                c.work.favorite = false;
                c.work.date_added = 0;
                c.categories = categories.clone();
                c
            })
            .collect();
        Ok(MergeOutcome {
            accepted: Chain { work: accepted_work, episodes: final_episodes, history, categories },
            discarded,
            new_episodes,
        })
    }
}
