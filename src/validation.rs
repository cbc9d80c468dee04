//! Name and content validation for client-supplied text.
//!
//! Usernames and group names travel as whitespace-separated tokens and end up as keys in
//! the persisted snapshots, so both are restricted to a small, filesystem- and log-safe
//! alphabet.

use std::collections::BTreeSet;

/// Longest username or group name accepted.
pub const MAX_NAME_LEN: usize = 32;

/// Name validation errors with messages suitable for a reply frame
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("{kind} cannot be empty")]
    Empty { kind: &'static str },

    #[error("{kind} is too long (maximum {max} characters)")]
    TooLong { kind: &'static str, max: usize },

    #[error("{kind} contains invalid characters: {chars}")]
    InvalidCharacters { kind: &'static str, chars: String },

    #[error("{kind} cannot be '.' or '..'")]
    Dots { kind: &'static str },
}

fn validate_name(name: &str, kind: &'static str) -> Result<String, NameError> {
    if name.is_empty() {
        return Err(NameError::Empty { kind });
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(NameError::TooLong {
            kind,
            max: MAX_NAME_LEN,
        });
    }
    if name == "." || name == ".." {
        return Err(NameError::Dots { kind });
    }

    let invalid: BTreeSet<char> = name
        .chars()
        .filter(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-' || *c == '.'))
        .collect();
    if !invalid.is_empty() {
        let chars = invalid
            .into_iter()
            .map(|c| {
                if c.is_control() {
                    format!("\\u{{{:04x}}}", c as u32)
                } else {
                    c.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join(" ");
        return Err(NameError::InvalidCharacters { kind, chars });
    }

    Ok(name.to_string())
}

/// Validate a username sent in the handshake.
pub fn validate_user_name(name: &str) -> Result<String, NameError> {
    validate_name(name, "Username")
}

/// Validate a group name. Case is preserved; `eng` and `Eng` are different groups.
pub fn validate_group_name(name: &str) -> Result<String, NameError> {
    validate_name(name, "Group name")
}

/// Strip control characters from a subject or body token sequence.
pub fn sanitize_message_text(text: &str) -> String {
    text.chars().filter(|c| !c.is_control()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_name_validation() {
        assert!(validate_user_name("alice").is_ok());
        assert!(validate_user_name("bob_2").is_ok());
        assert!(validate_user_name("j.doe-x").is_ok());

        assert_eq!(
            validate_user_name(""),
            Err(NameError::Empty { kind: "Username" })
        );
        assert!(validate_user_name("..").is_err());
        assert!(validate_user_name("a/b").is_err());
        assert!(validate_user_name("José").is_err());
        assert!(validate_user_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
        assert!(validate_user_name(&"x".repeat(MAX_NAME_LEN)).is_ok());
    }

    #[test]
    fn test_group_name_preserves_case() {
        assert_eq!(validate_group_name("Eng").unwrap(), "Eng");
        assert!(validate_group_name("my group").is_err());
    }

    #[test]
    fn test_invalid_characters_are_listed() {
        let err = validate_group_name("a*b?").unwrap_err();
        assert_eq!(err.to_string(), "Group name contains invalid characters: * ?");
    }

    #[test]
    fn test_sanitize_message_text() {
        assert_eq!(sanitize_message_text("hi\u{0}\u{7}there"), "hithere");
        assert_eq!(sanitize_message_text("plain text"), "plain text");
    }
}
