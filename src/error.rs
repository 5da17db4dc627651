use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("no episodes returned by source for work {work_id}")]
    NoEpisodesFound { work_id: i64 },

    #[error("no persisted chain owns the given episodes on source {source_id}")]
    NoChainsFound { source_id: i64 },

    #[error("work not found: {0}")]
    WorkNotFound(i64),

    #[error("episode not found: {0}")]
    EpisodeNotFound(i64),

    #[error("episode refinement failed for {url}: {source}")]
    Refine {
        url: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
