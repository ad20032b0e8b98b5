//! Domain-specific error types following panic-free policy.

use thiserror::Error;

use crate::transfer::TransferKind;

/// Errors that can occur in domain operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A transfer offer is missing one or more required fields
    #[error("Incomplete {kind} transfer: missing {missing}")]
    IncompleteTransfer { kind: TransferKind, missing: String },

    /// A file name that cannot be placed inside the download directory
    #[error("Invalid file name: {name:?}")]
    InvalidFileName { name: String },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incomplete_transfer_display() {
        let err = DomainError::IncompleteTransfer {
            kind: TransferKind::Socks5,
            missing: "sid, filesize".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Incomplete SOCKS5 transfer: missing sid, filesize"
        );
    }
}
