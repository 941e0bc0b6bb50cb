//! Size limits on client-supplied strings.

use super::errors::RpcError;

/// Prompt, steer, and follow-up text (1 MB).
pub const MAX_PROMPT_LENGTH: usize = 1_048_576;

/// Full plan or job document content (4 MB).
pub const MAX_DOCUMENT_LENGTH: usize = 4 * 1_048_576;

/// Titles, ids, model names, paths (8 KB).
pub const MAX_PARAM_LENGTH: usize = 8_192;

/// Reject `value` when it is longer than `max_len` bytes.
pub fn validate_string_param(value: &str, name: &str, max_len: usize) -> Result<(), RpcError> {
    if value.len() > max_len {
        return Err(RpcError::InvalidParams {
            message: format!(
                "Parameter '{name}' exceeds maximum length ({} > {max_len})",
                value.len()
            ),
        });
    }
    Ok(())
}

/// Reject empty or whitespace-only text.
pub fn require_non_blank(value: &str, name: &str) -> Result<(), RpcError> {
    if value.trim().is_empty() {
        return Err(RpcError::InvalidParams {
            message: format!("Parameter '{name}' must not be empty"),
        });
    }
    Ok(())
}

/// Reject single-line text (titles, names) that carries control characters.
pub fn reject_control_chars(value: &str, name: &str) -> Result<(), RpcError> {
    if value.chars().any(char::is_control) {
        return Err(RpcError::InvalidParams {
            message: format!("Parameter '{name}' must not contain control characters"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_limit_passes() {
        let s = "x".repeat(MAX_PARAM_LENGTH);
        assert!(validate_string_param(&s, "title", MAX_PARAM_LENGTH).is_ok());
    }

    #[test]
    fn over_limit_names_the_param() {
        let s = "x".repeat(MAX_PARAM_LENGTH + 1);
        let err = validate_string_param(&s, "title", MAX_PARAM_LENGTH).unwrap_err();
        assert_eq!(err.code(), "INVALID_PARAMS");
        assert!(err.to_string().contains("title"));
    }

    #[test]
    fn blank_text_is_rejected() {
        assert!(require_non_blank("  \n", "text").is_err());
        assert!(require_non_blank("hi", "text").is_ok());
    }

    #[test]
    fn limits_are_ordered() {
        assert!(MAX_PARAM_LENGTH < MAX_PROMPT_LENGTH);
        assert!(MAX_PROMPT_LENGTH < MAX_DOCUMENT_LENGTH);
    }

    #[test]
    fn control_chars_are_rejected() {
        let err = reject_control_chars("a\nstatus: complete", "title").unwrap_err();
        assert_eq!(err.code(), "INVALID_PARAMS");
        assert!(reject_control_chars("a\tb", "title").is_err());
        assert!(reject_control_chars("Phase: two", "title").is_ok());
    }
}
