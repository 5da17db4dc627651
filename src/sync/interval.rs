//! Fetch-interval bookkeeping: how often a work is expected to publish and
//! when it should next be checked.

use crate::types::{Episode, FetchWindow, Work};

pub const DAY_MILLIS: i64 = 86_400_000;
pub const DEFAULT_INTERVAL_DAYS: i32 = 7;
// Once more than this many expected releases were missed, the step doubles.
const DOUBLE_WHEN_OVER: i32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalUpdate {
    pub fetch_interval: i32,
    pub next_update: i64,
}

pub fn start_of_day(ts: i64) -> i64 {
    ts.div_euclid(DAY_MILLIS) * DAY_MILLIS
}

/// Window of days around `now` in which a scheduled check counts as due.
pub fn fetch_window(now: i64, grace_days: i64) -> FetchWindow {
    let today = start_of_day(now);
    FetchWindow {
        lower: today - grace_days * DAY_MILLIS,
        upper: today + grace_days * DAY_MILLIS - 1,
    }
}

/// Median gap in days between recent releases, clamped to `1..=max_days`.
pub fn calculate_interval(episodes: &[Episode], max_days: i32) -> i32 {
    let window = if episodes.len() <= 8 { 3 } else { 10 };
    let upload_days = distinct_days(episodes.iter().map(|e| e.date_upload), window);
    let interval = if upload_days.len() >= 3 {
        median_gap(&upload_days)
    } else {
        let fetch_days = distinct_days(episodes.iter().map(|e| e.date_fetch), window);
        if fetch_days.len() >= 3 { median_gap(&fetch_days) } else { DEFAULT_INTERVAL_DAYS }
    };
    interval.clamp(1, max_days.max(1))
}

fn distinct_days(stamps: impl Iterator<Item = i64>, take: usize) -> Vec<i64> {
    let mut days: Vec<i64> = stamps.filter(|t| *t > 0).map(|t| t.div_euclid(DAY_MILLIS)).collect();
    days.sort_unstable_by(|a, b| b.cmp(a));
    days.dedup();
    days.truncate(take);
    days
}

fn median_gap(days: &[i64]) -> i32 {
    let mut gaps: Vec<i64> = days.windows(2).map(|w| w[0] - w[1]).collect();
    gaps.sort_unstable();
    gaps[(gaps.len() - 1) / 2].min(i64::from(i32::MAX)) as i32
}

fn double_interval(mut delta: i32, days_since: i32, max_days: i32) -> i32 {
    loop {
        if delta >= max_days {
            return max_days;
        }
        let cycle = days_since.div_euclid(delta) + 1;
        if cycle > DOUBLE_WHEN_OVER {
            delta *= 2;
        } else {
            return delta;
        }
    }
}

/// New interval and next expected update for `work`, given its current episode list.
///
/// A negative `fetch_interval` is a user-fixed interval and is kept as is. The
/// scheduled date is only moved when it falls outside `window` or was never set.
pub fn next_fetch(work: &Work, episodes: &[Episode], now: i64, window: FetchWindow, max_days: i32) -> IntervalUpdate {
    let max_days = max_days.max(1);
    let interval = if work.fetch_interval < 0 {
        work.fetch_interval
    } else {
        calculate_interval(episodes, max_days)
    };

    let scheduled_in_window = window.contains(work.next_update) || work.next_update == window.upper + 1;
    if scheduled_in_window && work.fetch_interval != 0 {
        return IntervalUpdate { fetch_interval: interval, next_update: work.next_update };
    }

    let latest = start_of_day(if work.last_update > 0 { work.last_update } else { now });
    let days_since = ((now - latest).max(0) / DAY_MILLIS).min(i64::from(i32::MAX)) as i32;
    let step = if interval < 0 {
        interval.abs()
    } else {
        double_interval(interval, days_since, max_days)
    }
    .max(1);
    let cycle = days_since.div_euclid(step);
    IntervalUpdate {
        fetch_interval: interval,
        next_update: latest + i64::from(cycle + 1) * i64::from(step) * DAY_MILLIS,
    }
}
