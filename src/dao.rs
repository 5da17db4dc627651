use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use crate::error::Result;
use crate::types::{Category, DedupeMode, Episode, FavoriteEntry, History, MergedLink, RemovedMarker, Work};

// SQLite caps bound parameters per statement; stay well below it.
const IN_CHUNK: usize = 500;

const WORK_COLUMNS: &str = "id, source_id, url, title, favorite, date_added, episode_flags, fetch_interval, next_update, last_update, last_fetched_at";
const EPISODE_COLUMNS: &str = "id, work_id, url, name, scanlator, number, source_order, date_fetch, date_upload, read, bookmark, last_position, version";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkInsert {
    pub source_id: i64,
    pub url: String,
    pub title: String,
    pub favorite: bool,
    pub date_added: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkInsert {
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

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FavoriteEntryInsert {
    pub title: String,
    pub source_id: i64,
    pub gid: String,
    pub token: String,
    pub other_gid: Option<String>,
    pub other_token: Option<String>,
}

#[derive(sqlx::FromRow)]
struct EpisodeRow {
    id: i64,
    work_id: i64,
    url: String,
    name: String,
    scanlator: Option<String>,
    number: Option<f64>,
    source_order: i64,
    date_fetch: i64,
    date_upload: i64,
    read: bool,
    bookmark: bool,
    last_position: i64,
    version: i64,
}

impl From<EpisodeRow> for Episode {
    fn from(r: EpisodeRow) -> Self {
        Episode {
            id: r.id,
            work_id: r.work_id,
            url: r.url,
            name: r.name,
            scanlator: r.scanlator,
            number: r.number.filter(|n| *n >= 0.0),
            source_order: r.source_order,
            date_fetch: r.date_fetch,
            date_upload: r.date_upload,
            read: r.read,
            bookmark: r.bookmark,
            last_position: Some(r.last_position).filter(|p| *p > 0),
            version: r.version,
        }
    }
}

#[derive(sqlx::FromRow)]
struct LinkRow {
    id: i64,
    container_id: i64,
    work_id: i64,
    work_url: String,
    source_id: i64,
    is_info_source: bool,
    get_updates: bool,
    download: bool,
    priority: Option<i32>,
    dedupe_mode: String,
}

impl From<LinkRow> for MergedLink {
    fn from(r: LinkRow) -> Self {
        MergedLink {
            id: r.id,
            container_id: r.container_id,
            work_id: r.work_id,
            work_url: r.work_url,
            source_id: r.source_id,
            is_info_source: r.is_info_source,
            get_updates: r.get_updates,
            download: r.download,
            priority: r.priority,
            dedupe_mode: r.dedupe_mode.parse().unwrap_or_default(),
        }
    }
}

// --- works ---

pub async fn insert_work(conn: &mut SqliteConnection, w: &WorkInsert) -> Result<i64> {
    let res = sqlx::query(
        "INSERT INTO works(source_id, url, title, favorite, date_added) VALUES(?, ?, ?, ?, ?)",
    )
    .bind(w.source_id)
    .bind(&w.url)
    .bind(&w.title)
    .bind(w.favorite)
    .bind(w.date_added)
    .execute(&mut *conn)
    .await?;
    Ok(res.last_insert_rowid())
}

pub async fn get_work(conn: &mut SqliteConnection, id: i64) -> Result<Option<Work>> {
    let work = sqlx::query_as::<_, Work>(&format!("SELECT {WORK_COLUMNS} FROM works WHERE id = ?"))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(work)
}

pub async fn list_works(conn: &mut SqliteConnection, favorites_only: bool) -> Result<Vec<Work>> {
    let sql = if favorites_only {
        format!("SELECT {WORK_COLUMNS} FROM works WHERE favorite = 1 ORDER BY title")
    } else {
        format!("SELECT {WORK_COLUMNS} FROM works ORDER BY title")
    };
    let rows = sqlx::query_as::<_, Work>(&sql).fetch_all(&mut *conn).await?;
    Ok(rows)
}

pub async fn update_work_favorite(
    conn: &mut SqliteConnection,
    id: i64,
    favorite: bool,
    date_added: i64,
) -> Result<()> {
    sqlx::query("UPDATE works SET favorite = ?, date_added = ? WHERE id = ?")
        .bind(favorite)
        .bind(date_added)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn update_work_fetch_interval(
    conn: &mut SqliteConnection,
    id: i64,
    fetch_interval: i32,
    next_update: i64,
    last_fetched_at: i64,
) -> Result<()> {
    sqlx::query("UPDATE works SET fetch_interval = ?, next_update = ?, last_fetched_at = ? WHERE id = ?")
        .bind(fetch_interval)
        .bind(next_update)
        .bind(last_fetched_at)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn update_work_last_update(conn: &mut SqliteConnection, id: i64, last_update: i64) -> Result<()> {
    sqlx::query("UPDATE works SET last_update = ? WHERE id = ?")
        .bind(last_update)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Works on `source_id` owning at least one episode whose url is in `urls`, oldest first.
pub async fn find_works_owning_urls(
    conn: &mut SqliteConnection,
    source_id: i64,
    urls: &[String],
) -> Result<Vec<Work>> {
    let mut found: BTreeMap<i64, Work> = BTreeMap::new();
    for chunk in urls.chunks(IN_CHUNK) {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT DISTINCT w.id, w.source_id, w.url, w.title, w.favorite, w.date_added, w.episode_flags, \
             w.fetch_interval, w.next_update, w.last_update, w.last_fetched_at \
             FROM works w JOIN episodes e ON e.work_id = w.id WHERE w.source_id = ",
        );
        qb.push_bind(source_id);
        qb.push(" AND e.url IN (");
        let mut sep = qb.separated(", ");
        for u in chunk {
            sep.push_bind(u.clone());
        }
        sep.push_unseparated(")");
        let rows = qb.build_query_as::<Work>().fetch_all(&mut *conn).await?;
        for w in rows {
            found.insert(w.id, w);
        }
    }
    Ok(found.into_values().collect())
}

// --- episodes ---

pub async fn episodes_for_work(conn: &mut SqliteConnection, work_id: i64) -> Result<Vec<Episode>> {
    let rows = sqlx::query_as::<_, EpisodeRow>(&format!(
        "SELECT {EPISODE_COLUMNS} FROM episodes WHERE work_id = ? ORDER BY source_order, id"
    ))
    .bind(work_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.into_iter().map(Episode::from).collect())
}

/// Inserts the episode (ignoring its id) and returns the stored copy.
pub async fn insert_episode(conn: &mut SqliteConnection, e: &Episode) -> Result<Episode> {
    let res = sqlx::query(
        "INSERT INTO episodes(work_id, url, name, scanlator, number, source_order, date_fetch, date_upload, read, bookmark, last_position, version)\n         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1)",
    )
    .bind(e.work_id)
    .bind(&e.url)
    .bind(&e.name)
    .bind(&e.scanlator)
    .bind(e.number)
    .bind(e.source_order)
    .bind(e.date_fetch)
    .bind(e.date_upload)
    .bind(e.read)
    .bind(e.bookmark)
    .bind(e.last_position.unwrap_or(0))
    .execute(&mut *conn)
    .await?;
    Ok(Episode { id: res.last_insert_rowid(), version: 1, ..e.clone() })
}

/// Writes every mutable column and bumps the version counter.
pub async fn update_episode(conn: &mut SqliteConnection, e: &Episode) -> Result<()> {
    sqlx::query(
        "UPDATE episodes SET name = ?, scanlator = ?, number = ?, source_order = ?, date_fetch = ?, date_upload = ?,\n           read = ?, bookmark = ?, last_position = ?, version = version + 1\n         WHERE id = ?",
    )
    .bind(&e.name)
    .bind(&e.scanlator)
    .bind(e.number)
    .bind(e.source_order)
    .bind(e.date_fetch)
    .bind(e.date_upload)
    .bind(e.read)
    .bind(e.bookmark)
    .bind(e.last_position.unwrap_or(0))
    .bind(e.id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn set_episode_progress(
    conn: &mut SqliteConnection,
    id: i64,
    read: bool,
    last_position: Option<i64>,
) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE episodes SET read = ?, last_position = ?, version = version + 1 WHERE id = ?",
    )
    .bind(read)
    .bind(last_position.unwrap_or(0))
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(res.rows_affected())
}

pub async fn delete_episodes(conn: &mut SqliteConnection, ids: &[i64]) -> Result<u64> {
    let mut total = 0;
    for id in ids {
        let res = sqlx::query("DELETE FROM episodes WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        total += res.rows_affected();
    }
    Ok(total)
}

// --- removed episode markers ---

pub async fn removed_markers(conn: &mut SqliteConnection, work_id: i64) -> Result<Vec<RemovedMarker>> {
    let rows = sqlx::query_as::<_, RemovedMarker>(
        "SELECT number, read, bookmark, date_fetch FROM removed_episodes WHERE work_id = ? ORDER BY number",
    )
    .bind(work_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows)
}

/// Merges the marker into any existing one for the same number.
pub async fn upsert_removed_marker(conn: &mut SqliteConnection, work_id: i64, m: &RemovedMarker) -> Result<()> {
    sqlx::query(
        "INSERT INTO removed_episodes(work_id, number, read, bookmark, date_fetch) VALUES(?, ?, ?, ?, ?)\n         ON CONFLICT(work_id, number) DO UPDATE SET\n           read = removed_episodes.read OR excluded.read,\n           bookmark = removed_episodes.bookmark OR excluded.bookmark,\n           date_fetch = MAX(removed_episodes.date_fetch, excluded.date_fetch)",
    )
    .bind(work_id)
    .bind(m.number)
    .bind(m.read)
    .bind(m.bookmark)
    .bind(m.date_fetch)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn delete_removed_marker(conn: &mut SqliteConnection, work_id: i64, number: f64) -> Result<()> {
    sqlx::query("DELETE FROM removed_episodes WHERE work_id = ? AND number = ?")
        .bind(work_id)
        .bind(number)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

// --- history ---

pub async fn history_for_work(conn: &mut SqliteConnection, work_id: i64) -> Result<Vec<History>> {
    let rows = sqlx::query_as::<_, History>(
        "SELECT h.id, h.episode_id, h.last_read, h.time_read\n         FROM history h JOIN episodes e ON e.id = h.episode_id WHERE e.work_id = ? ORDER BY h.id",
    )
    .bind(work_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows)
}

/// Replaces the single history row of an episode.
pub async fn upsert_history(
    conn: &mut SqliteConnection,
    episode_id: i64,
    last_read: Option<i64>,
    time_read: i64,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO history(episode_id, last_read, time_read) VALUES(?, ?, ?)\n         ON CONFLICT(episode_id) DO UPDATE SET last_read = excluded.last_read, time_read = excluded.time_read",
    )
    .bind(episode_id)
    .bind(last_read)
    .bind(time_read)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Records a view, accumulating the time spent.
pub async fn add_history_view(
    conn: &mut SqliteConnection,
    episode_id: i64,
    seen_at: i64,
    duration: i64,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO history(episode_id, last_read, time_read) VALUES(?, ?, ?)\n         ON CONFLICT(episode_id) DO UPDATE SET last_read = excluded.last_read, time_read = history.time_read + excluded.time_read",
    )
    .bind(episode_id)
    .bind(seen_at)
    .bind(duration)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn delete_history(conn: &mut SqliteConnection, ids: &[i64]) -> Result<u64> {
    let mut total = 0;
    for id in ids {
        let res = sqlx::query("DELETE FROM history WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        total += res.rows_affected();
    }
    Ok(total)
}

// --- categories ---

pub async fn insert_category(conn: &mut SqliteConnection, name: &str, sort: i64) -> Result<Category> {
    let res = sqlx::query("INSERT INTO categories(name, sort) VALUES(?, ?)")
        .bind(name)
        .bind(sort)
        .execute(&mut *conn)
        .await?;
    Ok(Category { id: res.last_insert_rowid(), name: name.to_string(), sort })
}

pub async fn category_ids_for_work(conn: &mut SqliteConnection, work_id: i64) -> Result<Vec<i64>> {
    let ids = sqlx::query_scalar::<_, i64>(
        "SELECT category_id FROM work_categories WHERE work_id = ? ORDER BY category_id",
    )
    .bind(work_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(ids)
}

pub async fn set_work_categories(conn: &mut SqliteConnection, work_id: i64, category_ids: &[i64]) -> Result<()> {
    sqlx::query("DELETE FROM work_categories WHERE work_id = ?")
        .bind(work_id)
        .execute(&mut *conn)
        .await?;
    for cid in category_ids {
        sqlx::query("INSERT OR IGNORE INTO work_categories(work_id, category_id) VALUES(?, ?)")
            .bind(work_id)
            .bind(cid)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

// --- excluded scanlators ---

pub async fn excluded_scanlators(conn: &mut SqliteConnection, work_id: i64) -> Result<HashSet<String>> {
    let rows = sqlx::query_scalar::<_, String>("SELECT scanlator FROM excluded_scanlators WHERE work_id = ?")
        .bind(work_id)
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows.into_iter().collect())
}

pub async fn set_excluded_scanlators(conn: &mut SqliteConnection, work_id: i64, scanlators: &[String]) -> Result<()> {
    sqlx::query("DELETE FROM excluded_scanlators WHERE work_id = ?")
        .bind(work_id)
        .execute(&mut *conn)
        .await?;
    for s in scanlators {
        sqlx::query("INSERT OR IGNORE INTO excluded_scanlators(work_id, scanlator) VALUES(?, ?)")
            .bind(work_id)
            .bind(s)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

// --- merge links ---

pub async fn links_for_container(conn: &mut SqliteConnection, container_id: i64) -> Result<Vec<MergedLink>> {
    let rows = sqlx::query_as::<_, LinkRow>(
        "SELECT id, container_id, work_id, work_url, source_id, is_info_source, get_updates, download, priority, dedupe_mode\n         FROM merged_links WHERE container_id = ? ORDER BY id",
    )
    .bind(container_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.into_iter().map(MergedLink::from).collect())
}

pub async fn upsert_link(conn: &mut SqliteConnection, l: &LinkInsert) -> Result<()> {
    sqlx::query(
        "INSERT INTO merged_links(container_id, work_id, work_url, source_id, is_info_source, get_updates, download, priority, dedupe_mode)\n         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)\n         ON CONFLICT(container_id, work_id) DO UPDATE SET\n           work_url = excluded.work_url, source_id = excluded.source_id, is_info_source = excluded.is_info_source,\n           get_updates = excluded.get_updates, download = excluded.download, priority = excluded.priority,\n           dedupe_mode = excluded.dedupe_mode",
    )
    .bind(l.container_id)
    .bind(l.work_id)
    .bind(&l.work_url)
    .bind(l.source_id)
    .bind(l.is_info_source)
    .bind(l.get_updates)
    .bind(l.download)
    .bind(l.priority)
    .bind(l.dedupe_mode.as_str())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn set_dedupe_mode(conn: &mut SqliteConnection, container_id: i64, mode: DedupeMode) -> Result<u64> {
    let res = sqlx::query("UPDATE merged_links SET dedupe_mode = ? WHERE container_id = ? AND work_id = container_id")
        .bind(mode.as_str())
        .bind(container_id)
        .execute(&mut *conn)
        .await?;
    Ok(res.rows_affected())
}

// --- favorite entries ---

pub async fn upsert_favorite_entry(conn: &mut SqliteConnection, f: &FavoriteEntryInsert) -> Result<()> {
    sqlx::query(
        "INSERT INTO favorite_entries(title, source_id, gid, token, other_gid, other_token) VALUES(?, ?, ?, ?, ?, ?)\n         ON CONFLICT(source_id, gid, token) DO UPDATE SET\n           title = excluded.title, other_gid = excluded.other_gid, other_token = excluded.other_token",
    )
    .bind(&f.title)
    .bind(f.source_id)
    .bind(&f.gid)
    .bind(&f.token)
    .bind(&f.other_gid)
    .bind(&f.other_token)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn favorite_entries(conn: &mut SqliteConnection, source_id: i64) -> Result<Vec<FavoriteEntry>> {
    let rows = sqlx::query_as::<_, FavoriteEntry>(
        "SELECT id, title, source_id, gid, token, other_gid, other_token FROM favorite_entries WHERE source_id = ? ORDER BY id",
    )
    .bind(source_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows)
}
