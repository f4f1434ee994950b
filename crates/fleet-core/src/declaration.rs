//! # Declarations
//!
//! Deterministic identifiers and payloads for the declaration pair that
//! delivers one legacy profile to one device.
//!
//! ## Identifier Layout
//! ```text
//! <namespace>.<udid>.legacy_profile.<sanitized payload identifier>
//! <namespace>.<udid>.legacy_profile_activation.<sanitized payload identifier>
//! <namespace>.set.<udid>                                   (per-device set)
//! ```
//!
//! Identifiers are pure functions of their inputs, so deleting a profile
//! recomputes exactly the identifiers used when it was pushed.

use serde::{Deserialize, Serialize};
use serde_json::json;

// =============================================================================
// Sanitization
// =============================================================================

/// Replaces every character outside `[A-Za-z0-9._-]` with `_`.
///
/// ```rust
/// use fleet_core::declaration::sanitize_profile_id;
///
/// assert_eq!(sanitize_profile_id("com.example/wi fi"), "com.example_wi_fi");
/// ```
pub fn sanitize_profile_id(payload_identifier: &str) -> String {
    payload_identifier
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Name of the declaration set owned by one device.
pub fn device_set_name(namespace: &str, udid: &str) -> String {
    format!("{}.set.{}", namespace, udid)
}

// =============================================================================
// Identifiers
// =============================================================================

/// The two declaration identifiers derived for a (device, profile) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeclarationIds {
    /// Content declaration carrying the profile download URL.
    pub legacy: String,
    /// Activation declaration referencing `legacy`.
    pub activation: String,
    /// Sanitized payload identifier both IDs were built from.
    pub sanitized: String,
}

impl DeclarationIds {
    pub fn derive(namespace: &str, udid: &str, payload_identifier: &str) -> Self {
        let sanitized = sanitize_profile_id(payload_identifier);
        DeclarationIds {
            legacy: format!("{}.{}.legacy_profile.{}", namespace, udid, sanitized),
            activation: format!(
                "{}.{}.legacy_profile_activation.{}",
                namespace, udid, sanitized
            ),
            sanitized,
        }
    }
}

// =============================================================================
// Declaration Payloads
// =============================================================================

/// The two declaration kinds used for profile delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeclarationKind {
    LegacyProfile,
    ActivationSimple,
}

impl DeclarationKind {
    /// Declaration `Type` understood by the device.
    pub fn declaration_type(&self) -> &'static str {
        match self {
            DeclarationKind::LegacyProfile => "com.apple.configuration.legacy",
            DeclarationKind::ActivationSimple => "com.apple.activation.simple",
        }
    }
}

impl std::fmt::Display for DeclarationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeclarationKind::LegacyProfile => write!(f, "LegacyProfile"),
            DeclarationKind::ActivationSimple => write!(f, "ActivationSimple"),
        }
    }
}

/// A declaration as sent to the declaration server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Declaration {
    #[serde(rename = "Identifier")]
    pub identifier: String,

    #[serde(rename = "Type")]
    pub declaration_type: String,

    #[serde(rename = "Payload")]
    pub payload: serde_json::Value,

    /// Server-managed version token; never set by the director.
    #[serde(rename = "ServerToken", default, skip_serializing_if = "Option::is_none")]
    pub server_token: Option<String>,
}

impl Declaration {
    /// Content declaration pointing the device at the profile bytes.
    pub fn legacy_profile(identifier: impl Into<String>, profile_url: impl Into<String>) -> Self {
        Declaration {
            identifier: identifier.into(),
            declaration_type: DeclarationKind::LegacyProfile
                .declaration_type()
                .to_string(),
            payload: json!({ "ProfileURL": profile_url.into() }),
            server_token: None,
        }
    }

    /// Activation declaration whose payload is solely a reference to `legacy_id`.
    pub fn activation(identifier: impl Into<String>, legacy_id: &str) -> Self {
        Declaration {
            identifier: identifier.into(),
            declaration_type: DeclarationKind::ActivationSimple
                .declaration_type()
                .to_string(),
            payload: json!({ "StandardConfigurations": [legacy_id] }),
            server_token: None,
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
