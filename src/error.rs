use crate::io::CodecError;
use crate::ops::ai::GenerateError;
use crate::store::StoreError;

/// Broad classes of failure, used to pick how an error is surfaced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Missing input caught before any external call. Fixed by user action.
    Precondition,
    /// The edit collaborator refused or failed.
    Collaborator,
    /// Storage quota or unavailable storage; the commit was aborted.
    Persistence,
    /// Persisted session did not match its descriptor and was discarded.
    Corruption,
}

#[derive(thiserror::Error, Debug)]
pub enum EditError {
    #[error("no image loaded")]
    NoImage,

    #[error("select a point or paint a mask first")]
    NoSelection,

    #[error("another edit is still in progress")]
    Busy,

    #[error("edit generation failed: {0}")]
    Generator(#[from] GenerateError),

    #[error("could not save the edit: {0}")]
    Persistence(#[from] StoreError),

    #[error("stored session is corrupt: expected {expected} entries, found {found}")]
    CorruptSession { expected: usize, found: usize },

    #[error("history index {index} out of range (length {len})")]
    InvalidIndex { index: usize, len: usize },

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl EditError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            EditError::NoImage
            | EditError::NoSelection
            | EditError::Busy
            | EditError::InvalidIndex { .. }
            | EditError::Codec(_) => ErrorCategory::Precondition,
            EditError::Generator(_) => ErrorCategory::Collaborator,
            EditError::Persistence(_) => ErrorCategory::Persistence,
            EditError::CorruptSession { .. } => ErrorCategory::Corruption,
        }
    }
}

pub type EditResult<T> = Result<T, EditError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_follow_the_failure_source() {
        assert_eq!(EditError::NoImage.category(), ErrorCategory::Precondition);
        assert_eq!(EditError::Busy.category(), ErrorCategory::Precondition);
        assert_eq!(
            EditError::from(GenerateError::Blocked("policy".into())).category(),
            ErrorCategory::Collaborator
        );
        assert_eq!(
            EditError::from(StoreError::Unavailable("off".into())).category(),
            ErrorCategory::Persistence
        );
        assert_eq!(
            EditError::CorruptSession { expected: 3, found: 1 }.category(),
            ErrorCategory::Corruption
        );
    }

    #[test]
    fn persistence_message_is_distinct_from_generator_message() {
        let store = EditError::from(StoreError::QuotaExceeded { needed: 10, available: 2 }).to_string();
        let generator = EditError::from(GenerateError::NoImage).to_string();
        assert!(store.starts_with("could not save"), "{store}");
        assert!(generator.starts_with("edit generation failed"), "{generator}");
    }
}
