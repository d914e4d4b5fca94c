// Errors reported by ListStore operations

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ListError {
    #[error("task list not found: {0}")]
    ListNotFound(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("more than one {kind} matches '{key}'")]
    Ambiguous { kind: &'static str, key: String },

    #[error("task already stored: {0}")]
    DuplicateTask(String),

    #[error("title cannot be empty")]
    InvalidTitle,

    #[error(transparent)]
    Storage(#[from] eyre::Report),
}

impl ListError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ListError::ListNotFound(_) | ListError::TaskNotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        assert_eq!(ListError::ListNotFound("l-1".into()).to_string(), "task list not found: l-1");
        assert_eq!(
            ListError::Ambiguous {
                kind: "task",
                key: "01".into()
            }
            .to_string(),
            "more than one task matches '01'"
        );
    }

    #[test]
    fn test_storage_wraps_eyre() {
        let err: ListError = eyre::eyre!("disk full").into();
        assert!(matches!(err, ListError::Storage(_)));
        assert!(!err.is_not_found());
        assert_eq!(err.to_string(), "disk full");
    }
}
