#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("migration {version} ({name}) failed: {detail}")]
    Migration {
        version: u32,
        name: &'static str,
        detail: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("term '{term}' already exists (id={existing_id})")]
    DuplicateTerm { term: String, existing_id: i64 },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt row in {table}.{column}: {detail}")]
    CorruptRow {
        table: &'static str,
        column: &'static str,
        detail: String,
    },
}

impl StoreError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Database(_) => "database",
            Self::Migration { .. } => "migration",
            Self::NotFound(_) => "not_found",
            Self::DuplicateTerm { .. } => "duplicate_term",
            Self::Serialization(_) => "serialization",
            Self::Io(_) => "io",
            Self::CorruptRow { .. } => "corrupt_row",
        }
    }
}
