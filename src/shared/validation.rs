//! Validation Utilities
//!
//! Request-body validation bridging and room-name shape checks.

use validator::ValidationErrors;

use super::error::{AppError, FieldError};

/// Maximum length of a room name, shard suffix included.
pub const MAX_ROOM_NAME_LEN: usize = 64;

/// Convert validation errors to AppError
pub fn validation_error(errors: ValidationErrors) -> AppError {
    let field_errors: Vec<FieldError> = errors
        .field_errors()
        .iter()
        .flat_map(|(field, errs)| {
            errs.iter().map(move |e| FieldError {
                field: field.to_string(),
                message: e.message.clone().map(|m| m.to_string()).unwrap_or_default(),
            })
        })
        .collect();

    let message = field_errors
        .first()
        .map(|e| format!("{}: {}", e.field, e.message))
        .unwrap_or_else(|| "Validation failed".into());

    AppError::Validation(message)
}

/// Check the shape of a client-supplied room name.
///
/// Rejects empty names, over-long names, leading/trailing whitespace and
/// control characters. Shard suffixes (`"Lobby (2)"`) are part of the name
/// and validated as ordinary characters here.
pub fn valid_room_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_ROOM_NAME_LEN {
        return false;
    }
    if name.trim() != name {
        return false;
    }
    !name.chars().any(|c| c.is_control())
}

/// Split a room name into its base name and optional shard index.
///
/// `"Lobby (3)"` parses to `("Lobby", Some(3))`; anything without a
/// well-formed ` (<n>)` suffix is its own base. Index 0 and 1 are never
/// produced by the autoscaler, so they are treated as literal names.
pub fn split_shard_suffix(name: &str) -> (&str, Option<u32>) {
    if let Some(open) = name.rfind(" (") {
        if let Some(inner) = name[open + 2..].strip_suffix(')') {
            if !inner.is_empty() && inner.chars().all(|c| c.is_ascii_digit()) {
                if let Ok(n) = inner.parse::<u32>() {
                    if n >= 2 {
                        return (&name[..open], Some(n));
                    }
                }
            }
        }
    }
    (name, None)
}

/// Compose the name of shard `n` of a base room.
pub fn shard_name(base: &str, n: u32) -> String {
    format!("{} ({})", base, n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("Lobby", true)]
    #[test_case("Lobby (2)", true)]
    #[test_case("", false)]
    #[test_case(" padded", false ; "leading_padded_false")]
    #[test_case("padded ", false ; "trailing_padded_false")]
    #[test_case("ctrl\u{0007}", false)]
    fn room_name_shapes(name: &str, ok: bool) {
        assert_eq!(valid_room_name(name), ok);
    }

    #[test]
    fn room_name_length_limit() {
        let long = "x".repeat(MAX_ROOM_NAME_LEN + 1);
        assert!(!valid_room_name(&long));
        assert!(valid_room_name(&"x".repeat(MAX_ROOM_NAME_LEN)));
    }

    #[test]
    fn shard_suffix_parsing() {
        assert_eq!(split_shard_suffix("Lobby"), ("Lobby", None));
        assert_eq!(split_shard_suffix("Lobby (2)"), ("Lobby", Some(2)));
        assert_eq!(split_shard_suffix("Lobby (12)"), ("Lobby", Some(12)));
        // Not autoscaler-produced suffixes stay literal
        assert_eq!(split_shard_suffix("Lobby (1)"), ("Lobby (1)", None));
        assert_eq!(split_shard_suffix("Lobby (0)"), ("Lobby (0)", None));
        assert_eq!(split_shard_suffix("Lobby (x)"), ("Lobby (x)", None));
        assert_eq!(split_shard_suffix("Lobby ()"), ("Lobby ()", None));
        // Nested-looking names keep only the outermost suffix
        assert_eq!(split_shard_suffix("A (2) (3)"), ("A (2)", Some(3)));
    }

    #[test]
    fn shard_name_round_trip() {
        let name = shard_name("Lobby", 4);
        assert_eq!(split_shard_suffix(&name), ("Lobby", Some(4)));
    }
}
