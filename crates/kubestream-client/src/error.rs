use thiserror::Error;

use crate::session::SessionState;

/// Rejected client-side session and tab operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("cannot {action} a session that is {state}")]
    InvalidTransition {
        state: SessionState,
        action: &'static str,
    },

    #[error("a tab named '{0}' already exists")]
    DuplicateName(String),

    #[error("tab name must not be empty")]
    EmptyName,

    #[error("no such tab: {0}")]
    UnknownTab(String),
}
