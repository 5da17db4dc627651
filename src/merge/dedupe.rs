use std::collections::HashMap;

use crate::types::{DedupeMode, Episode, MergedLink};

/// Mode configured on the container's self-link; containers without one don't dedupe.
pub fn mode_of(links: &[MergedLink]) -> DedupeMode {
    links.iter().find(|l| l.is_self_link()).map(|l| l.dedupe_mode).unwrap_or_default()
}

/// Collapses the episodes of every work linked into a container into one list.
///
/// `episodes` is the concatenation of each linked work's episodes in their own
/// order. Except for [`DedupeMode::NoDedupe`], which hands the input back as is,
/// the returned episodes have `source_order` rewritten to their output index.
pub fn select(links: &[MergedLink], episodes: Vec<Episode>) -> Vec<Episode> {
    let mut out = match mode_of(links) {
        DedupeMode::NoDedupe => return episodes,
        DedupeMode::Priority => by_priority(links, episodes),
        DedupeMode::MostEpisodes => {
            let mut counts: Vec<(i64, usize)> = Vec::new();
            for e in &episodes {
                match counts.iter_mut().find(|(w, _)| *w == e.work_id) {
                    Some((_, n)) => *n += 1,
                    None => counts.push((e.work_id, 1)),
                }
            }
            let winner = first_max_by(counts.iter(), |(_, n)| *n).map(|(w, _)| *w);
            keep_work(episodes, winner)
        }
        DedupeMode::HighestEpisodeNumber => {
            let winner = first_max_by(episodes.iter(), |e| e.number.unwrap_or(-1.0)).map(|e| e.work_id);
            keep_work(episodes, winner)
        }
    };
    for (i, e) in out.iter_mut().enumerate() {
        e.source_order = i as i64;
    }
    out
}

// Iterator::max_by keeps the last of equal elements; ties here go to the first.
fn first_max_by<T, K: PartialOrd>(items: impl Iterator<Item = T>, key: impl Fn(&T) -> K) -> Option<T> {
    let mut best: Option<(K, T)> = None;
    for item in items {
        let k = key(&item);
        if best.as_ref().map_or(true, |(bk, _)| k > *bk) {
            best = Some((k, item));
        }
    }
    best.map(|(_, item)| item)
}

fn keep_work(episodes: Vec<Episode>, work_id: Option<i64>) -> Vec<Episode> {
    match work_id {
        Some(id) => episodes.into_iter().filter(|e| e.work_id == id).collect(),
        None => episodes,
    }
}

fn by_priority(links: &[MergedLink], episodes: Vec<Episode>) -> Vec<Episode> {
    let priority: HashMap<i64, i32> = links.iter().filter_map(|l| l.priority.map(|p| (l.work_id, p))).collect();

    let mut groups: Vec<(i64, Vec<Episode>)> = Vec::new();
    for e in episodes {
        match groups.iter_mut().find(|(w, _)| *w == e.work_id) {
            Some((_, group)) => group.push(e),
            None => groups.push((e.work_id, vec![e])),
        }
    }
    // stable: equal priorities keep first-appearance order, unprioritized last
    groups.sort_by_key(|(w, _)| priority.get(w).map_or((1, 0), |p| (0, *p)));

    let mut out: Vec<Episode> = Vec::new();
    for (_, group) in groups {
        // index of the last episode placed from this group, or -1 before the first
        let mut cursor: isize = -1;
        for e in group {
            let existing = e.number.and_then(|n| {
                out.iter().position(|o| o.number == Some(n) && o.work_id != e.work_id)
            });
            match existing {
                Some(at) => cursor = at as isize,
                None => {
                    cursor += 1;
                    out.insert(cursor as usize, e);
                }
            }
        }
    }
    out
}
