//! # Validation Module
//!
//! Input checks run before any network call or database write.
//!
//! ```rust
//! use fleet_core::validation::{validate_targets, validate_udid};
//!
//! assert!(validate_udid("D1").is_ok());
//! assert!(validate_udid("  ").is_err());
//! assert!(validate_targets(&[] as &[String]).is_err());
//! ```

use crate::error::ValidationError;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// A device UDID must be non-empty.
pub fn validate_udid(udid: &str) -> ValidationResult<()> {
    if udid.trim().is_empty() {
        return Err(ValidationError::required("udid"));
    }
    Ok(())
}

/// A protocol call needs at least one non-empty target ID.
pub fn validate_targets<S: AsRef<str>>(ids: &[S]) -> ValidationResult<()> {
    if ids.is_empty() {
        return Err(ValidationError::Empty {
            field: "target id".to_string(),
        });
    }

    if ids.iter().any(|id| id.as_ref().trim().is_empty()) {
        return Err(ValidationError::required("target id"));
    }

    Ok(())
}

/// Payload identifiers are reverse-DNS strings and may not be blank.
pub fn validate_payload_identifier(identifier: &str) -> ValidationResult<()> {
    if identifier.trim().is_empty() {
        return Err(ValidationError::required("payload identifier"));
    }
    Ok(())
}

/// Base URLs for downstream servers must be absolute http(s) URLs.
pub fn validate_server_url(field: &str, url: &str) -> ValidationResult<()> {
    if url.trim().is_empty() {
        return Err(ValidationError::required(field));
    }

    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            reason: format!("must start with http:// or https://, got: {}", url),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_targets() {
        assert!(validate_targets(&["D1", "D2"]).is_ok());
        assert!(matches!(
            validate_targets::<&str>(&[]),
            Err(ValidationError::Empty { .. })
        ));
        assert!(matches!(
            validate_targets(&["D1", ""]),
            Err(ValidationError::Required { .. })
        ));
    }

    #[test]
    fn test_validate_server_url() {
        assert!(validate_server_url("commands.url", "https://mdm.example.com").is_ok());
        assert!(validate_server_url("commands.url", "").is_err());
        assert!(validate_server_url("commands.url", "ws://mdm").is_err());
    }

    #[test]
    fn test_validate_payload_identifier() {
        assert!(validate_payload_identifier("com.example.wifi").is_ok());
        assert!(validate_payload_identifier("").is_err());
    }
}
