use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("invalid transition for story {epic_num}.{story_num}: {from} -> {to}")]
    InvalidTransition {
        epic_num: i64,
        story_num: i64,
        from: String,
        to: String,
    },

    #[error("invalid row data: {0}")]
    InvalidData(String),
}

pub type StoreResult<T> = Result<T, StoreError>;
