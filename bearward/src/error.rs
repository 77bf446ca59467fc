use thiserror::Error;

use crate::authority::AuthorityError;

/// Status codes with which the authority signals that the credential is
/// permanently invalid rather than the attempt having failed
const REJECTION_STATUSES: [u16; 2] = [401, 422];

/// An error while refreshing the session token
///
/// Cloneable so that a single settled refresh can fan its outcome out to the
/// triggering request and every request queued behind it.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RefreshError {
    /// The authority rejected the credential outright; only a full re-login
    /// can recover the session
    #[error("got {status} on token refresh")]
    Rejected {
        /// The status code the authority rejected with
        status: u16,
    },

    /// The refresh attempt failed for any other reason
    #[error("failed to refresh auth token: {message}")]
    Failed {
        /// The underlying cause
        message: String,
    },
}

impl RefreshError {
    /// Whether the authority rejected the credential outright
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }

    /// The settlement delivered to waiters when the in-flight refresh was
    /// dropped before completing.
    pub(crate) fn interrupted() -> Self {
        Self::Failed {
            message: "token refresh was interrupted before it settled".into(),
        }
    }
}

impl From<AuthorityError> for RefreshError {
    fn from(error: AuthorityError) -> Self {
        match error.status() {
            Some(status) if REJECTION_STATUSES.contains(&status) => Self::Rejected { status },
            _ => Self::Failed {
                message: error.to_string(),
            },
        }
    }
}
