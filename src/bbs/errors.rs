use thiserror::Error;

use crate::validation::NameError;

/// Errors a single client command can produce.
///
/// The `Display` output of each variant is exactly the reply frame sent to the client;
/// none of them end the session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BbsError {
    /// Malformed command, wrong arity, invalid name or message id.
    #[error("Error: {0}")]
    Protocol(String),

    /// The caller is not in the member list of the targeted group.
    #[error("Error: You are not a member of {group}.")]
    NotMember { group: String },

    /// The targeted group has never been created.
    #[error("Error: Group {group} does not exist.")]
    GroupNotFound { group: String },

    /// No message with that id on the group's board.
    #[error("Error: No message with ID#{id} in {group}.")]
    MessageNotFound { group: String, id: u64 },

    /// First token did not name a known command.
    #[error("Invalid command.")]
    UnknownCommand,
}

impl BbsError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        BbsError::Protocol(msg.into())
    }
}

impl From<NameError> for BbsError {
    fn from(e: NameError) -> Self {
        BbsError::Protocol(format!("{}.", e))
    }
}
