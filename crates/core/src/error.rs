use thiserror::Error;

pub type SegmentResult<T> = Result<T, SegmentError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SegmentError {
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("{entity} already exists: {key}")]
    Conflict { entity: &'static str, key: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Store error: {0}")]
    Store(String),
}

impl SegmentError {
    pub fn user_not_found(user_id: i64) -> Self {
        Self::NotFound {
            entity: "user",
            key: user_id.to_string(),
        }
    }

    pub fn segment_not_found(name: &str) -> Self {
        Self::NotFound {
            entity: "segment",
            key: name.to_string(),
        }
    }

    pub fn user_exists(user_id: i64) -> Self {
        Self::Conflict {
            entity: "user",
            key: user_id.to_string(),
        }
    }

    pub fn segment_exists(name: &str) -> Self {
        Self::Conflict {
            entity: "segment",
            key: name.to_string(),
        }
    }

    /// Short machine-readable label, used for metrics and API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::Conflict { .. } => "conflict",
            Self::Validation(_) => "validation_error",
            Self::Store(_) => "store_error",
        }
    }
}
