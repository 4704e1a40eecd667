use std::fmt;

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type DaoResult<T> = Result<T, DaoError>;

/// Discriminant of [`DaoError`], used by the error factory and for matching
/// without caring about payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    Create,
    Get,
    Update,
    Delete,
    BulkSave,
    Mapping,
    Generic,
    Rollback,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Create => "create",
            ErrorKind::Get => "get",
            ErrorKind::Update => "update",
            ErrorKind::Delete => "delete",
            ErrorKind::BulkSave => "bulk_save",
            ErrorKind::Mapping => "mapping",
            ErrorKind::Generic => "generic",
            ErrorKind::Rollback => "rollback",
        };
        f.write_str(name)
    }
}

/// One item rejected by a bulk save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkFailure {
    pub id: Option<String>,
    pub reason: String,
}

impl fmt::Display for BulkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{}: {}", id, self.reason),
            None => write!(f, "<no id>: {}", self.reason),
        }
    }
}

/// Every failure that crosses the DAO boundary. Backend-native errors are
/// carried as `source` and never surface unwrapped.
#[derive(Debug, Error)]
pub enum DaoError {
    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("create error: {message}")]
    Create {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("get error: {message}")]
    Get {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("update error: {message}")]
    Update {
        message: String,
        conflict: bool,
        #[source]
        source: Option<BoxError>,
    },

    #[error("delete error: {message}")]
    Delete {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("bulk save error: {message}; failed: [{}]", join_failures(.failed))]
    BulkSave {
        message: String,
        failed: Vec<BulkFailure>,
        succeeded: Vec<String>,
    },

    #[error("mapping error: {message}")]
    Mapping { message: String },

    #[error("{message}")]
    Generic {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("rollback error: {message}")]
    Rollback {
        message: String,
        #[source]
        source: Option<BoxError>,
    },
}

fn join_failures(failed: &[BulkFailure]) -> String {
    failed
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl DaoError {
    /// Error factory shared by every backend.
    ///
    /// `BulkSave` built this way carries no item lists; use
    /// [`DaoError::bulk_save`] when the failures are known.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::Validation => DaoError::Validation { message },
            ErrorKind::Create => DaoError::Create { message, source: None },
            ErrorKind::Get => DaoError::Get { message, source: None },
            ErrorKind::Update => DaoError::Update {
                message,
                conflict: false,
                source: None,
            },
            ErrorKind::Delete => DaoError::Delete { message, source: None },
            ErrorKind::BulkSave => DaoError::BulkSave {
                message,
                failed: Vec::new(),
                succeeded: Vec::new(),
            },
            ErrorKind::Mapping => DaoError::Mapping { message },
            ErrorKind::Generic => DaoError::Generic { message, source: None },
            ErrorKind::Rollback => DaoError::Rollback { message, source: None },
        }
    }

    /// Same as [`DaoError::new`] with a chained cause.
    pub fn wrap<E>(kind: ErrorKind, message: impl Into<String>, cause: E) -> Self
    where
        E: Into<BoxError>,
    {
        DaoError::new(kind, message).with_source(cause)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        DaoError::new(ErrorKind::Validation, message)
    }

    pub fn get(message: impl Into<String>) -> Self {
        DaoError::new(ErrorKind::Get, message)
    }

    pub fn mapping(message: impl Into<String>) -> Self {
        DaoError::new(ErrorKind::Mapping, message)
    }

    pub fn generic(message: impl Into<String>) -> Self {
        DaoError::new(ErrorKind::Generic, message)
    }

    /// Update rejected because the supplied revision is stale.
    pub fn conflict<E>(message: impl Into<String>, cause: Option<E>) -> Self
    where
        E: Into<BoxError>,
    {
        DaoError::Update {
            message: message.into(),
            conflict: true,
            source: cause.map(Into::into),
        }
    }

    pub fn bulk_save(
        message: impl Into<String>,
        failed: Vec<BulkFailure>,
        succeeded: Vec<String>,
    ) -> Self {
        DaoError::BulkSave {
            message: message.into(),
            failed,
            succeeded,
        }
    }

    /// Attaches `cause` as the source. Variants without a source slot
    /// (validation, mapping, bulk save) fold the cause into the message.
    pub fn with_source<E>(mut self, cause: E) -> Self
    where
        E: Into<BoxError>,
    {
        let cause = cause.into();
        match &mut self {
            DaoError::Create { source, .. }
            | DaoError::Get { source, .. }
            | DaoError::Update { source, .. }
            | DaoError::Delete { source, .. }
            | DaoError::Generic { source, .. }
            | DaoError::Rollback { source, .. } => *source = Some(cause),
            DaoError::Validation { message }
            | DaoError::Mapping { message }
            | DaoError::BulkSave { message, .. } => {
                message.push_str(&format!(" | caused by: {}", cause));
            }
        }
        self
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DaoError::Validation { .. } => ErrorKind::Validation,
            DaoError::Create { .. } => ErrorKind::Create,
            DaoError::Get { .. } => ErrorKind::Get,
            DaoError::Update { .. } => ErrorKind::Update,
            DaoError::Delete { .. } => ErrorKind::Delete,
            DaoError::BulkSave { .. } => ErrorKind::BulkSave,
            DaoError::Mapping { .. } => ErrorKind::Mapping,
            DaoError::Generic { .. } => ErrorKind::Generic,
            DaoError::Rollback { .. } => ErrorKind::Rollback,
        }
    }

    /// True only for updates rejected on a stale revision or version.
    pub fn is_conflict(&self) -> bool {
        matches!(self, DaoError::Update { conflict: true, .. })
    }

    pub fn message(&self) -> &str {
        match self {
            DaoError::Validation { message }
            | DaoError::Create { message, .. }
            | DaoError::Get { message, .. }
            | DaoError::Update { message, .. }
            | DaoError::Delete { message, .. }
            | DaoError::BulkSave { message, .. }
            | DaoError::Mapping { message }
            | DaoError::Generic { message, .. }
            | DaoError::Rollback { message, .. } => message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn factory_maps_kind_to_variant() {
        for kind in [
            ErrorKind::Validation,
            ErrorKind::Create,
            ErrorKind::Get,
            ErrorKind::Update,
            ErrorKind::Delete,
            ErrorKind::BulkSave,
            ErrorKind::Mapping,
            ErrorKind::Generic,
            ErrorKind::Rollback,
        ] {
            assert_eq!(DaoError::new(kind, "boom").kind(), kind);
        }
    }

    #[test]
    fn wrap_chains_the_cause() {
        let cause = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err = DaoError::wrap(ErrorKind::Get, "could not read doc-1", cause);
        assert_eq!(err.to_string(), "get error: could not read doc-1");
        assert_eq!(err.source().map(|s| s.to_string()).as_deref(), Some("disk gone"));
    }

    #[test]
    fn only_conflicting_updates_are_flagged() {
        let conflict = DaoError::conflict::<BoxError>("stale _rev", None);
        assert!(conflict.is_conflict());
        assert!(!DaoError::new(ErrorKind::Update, "row vanished").is_conflict());
        assert!(!DaoError::new(ErrorKind::Get, "nope").is_conflict());
    }

    #[test]
    fn bulk_save_display_lists_failed_ids() {
        let err = DaoError::bulk_save(
            "bulk save failed for some documents",
            vec![BulkFailure {
                id: Some("Widget|42".into()),
                reason: "document update conflict".into(),
            }],
            vec!["Widget|1".into()],
        );
        assert!(err.to_string().contains("Widget|42: document update conflict"));
        match err {
            DaoError::BulkSave { succeeded, .. } => assert_eq!(succeeded, vec!["Widget|1"]),
            other => panic!("expected BulkSave, got {:?}", other),
        }
    }

    #[test]
    fn sourceless_variants_fold_cause_into_message() {
        let err = DaoError::validation("bad shape").with_source("missing name");
        assert_eq!(err.message(), "bad shape | caused by: missing name");
    }
}
