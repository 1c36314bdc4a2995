use thiserror::Error;

use crate::lookup::BuildError;
use crate::symbols::ParseError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("{operation}: {source}")]
    Storage {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("database migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("compression error: {0}")]
    Compression(#[from] std::io::Error),
    #[error("{operation} cancelled")]
    Cancelled { operation: &'static str },
}

impl StoreError {
    pub(crate) fn storage(operation: &'static str) -> impl FnOnce(sqlx::Error) -> Self {
        move |source| StoreError::Storage { operation, source }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StoreError::Cancelled { .. })
    }
}

impl From<BuildError> for StoreError {
    fn from(err: BuildError) -> Self {
        match err {
            BuildError::Parse(err) => StoreError::Parse(err),
            BuildError::DuplicateId(id) => {
                StoreError::Validation(format!("descriptor id {id} allocated twice"))
            }
        }
    }
}
