//! Error types for `lockerd-store`.
//!
//! Every variant carries the key or operation that failed so a log line is
//! enough to diagnose the problem. Raw card identifiers never appear here;
//! callers hash them before they reach this crate.

/// Errors from the SQLite store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Opening the database file or pool failed.
    #[error("failed to open database at '{path}': {reason}")]
    Open { path: String, reason: String },

    /// A migration could not be applied.
    #[error("migration {version} failed: {reason}")]
    Migration { version: i64, reason: String },

    /// An applied migration's recorded hash no longer matches its source.
    #[error("migration {version} drifted: recorded hash {recorded}, current hash {current}")]
    MigrationDrift {
        version: i64,
        recorded: String,
        current: String,
    },

    /// A read query failed.
    #[error("query failed on {entity}: {reason}")]
    Query { entity: &'static str, reason: String },

    /// A write failed.
    #[error("write failed on {entity}: {reason}")]
    Write { entity: &'static str, reason: String },

    /// A compare-and-set update matched no row (stale version or missing row).
    #[error("optimistic update conflict on {entity}")]
    Conflict { entity: &'static str },

    /// A uniqueness constraint rejected the write.
    #[error("constraint violated on {entity}: {reason}")]
    Constraint { entity: &'static str, reason: String },

    /// A stored value could not be decoded into its domain type.
    #[error("corrupt row in {entity}: {reason}")]
    Corrupt { entity: &'static str, reason: String },
}

impl StoreError {
    /// Map a sqlx error on a write path, distinguishing constraint
    /// violations from other database failures.
    pub(crate) fn from_write(entity: &'static str, err: &sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = err {
            if db.is_unique_violation() {
                return Self::Constraint {
                    entity,
                    reason: db.message().to_owned(),
                };
            }
        }
        Self::Write {
            entity,
            reason: err.to_string(),
        }
    }
}
