//! # Commands
//!
//! Request types and the shape of a command before it is serialized
//! into a protocol dialect.
//!
//! ## Command Shape
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         CommandSpec                                     │
//! │                                                                         │
//! │  CommandSpec::InstallProfile { payload }                               │
//! │       │                                                                 │
//! │       │  request_type() → "InstallProfile"                             │
//! │       │  dedup_key()    → None                                         │
//! │       ▼                                                                 │
//! │  fleet-sync serializes it into:                                        │
//! │  • a plist body for the enqueue API                                    │
//! │  • a JSON body for the legacy command API                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

// =============================================================================
// Request Type
// =============================================================================

/// The `RequestType` of a device-management command.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RequestType {
    InstallProfile,
    RemoveProfile,
    InstallApplication,
    InstalledApplicationList,
    DeviceInformation,
    SecurityInfo,
    ProfileList,
    CertificateList,
    DeviceLock,
    EraseDevice,
    /// Any request type the director relays but does not model.
    Other(String),
}

impl RequestType {
    pub fn as_str(&self) -> &str {
        match self {
            RequestType::InstallProfile => "InstallProfile",
            RequestType::RemoveProfile => "RemoveProfile",
            RequestType::InstallApplication => "InstallApplication",
            RequestType::InstalledApplicationList => "InstalledApplicationList",
            RequestType::DeviceInformation => "DeviceInformation",
            RequestType::SecurityInfo => "SecurityInfo",
            RequestType::ProfileList => "ProfileList",
            RequestType::CertificateList => "CertificateList",
            RequestType::DeviceLock => "DeviceLock",
            RequestType::EraseDevice => "EraseDevice",
            RequestType::Other(name) => name,
        }
    }
}

impl std::fmt::Display for RequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for RequestType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "InstallProfile" => RequestType::InstallProfile,
            "RemoveProfile" => RequestType::RemoveProfile,
            "InstallApplication" => RequestType::InstallApplication,
            "InstalledApplicationList" => RequestType::InstalledApplicationList,
            "DeviceInformation" => RequestType::DeviceInformation,
            "SecurityInfo" => RequestType::SecurityInfo,
            "ProfileList" => RequestType::ProfileList,
            "CertificateList" => RequestType::CertificateList,
            "DeviceLock" => RequestType::DeviceLock,
            "EraseDevice" => RequestType::EraseDevice,
            _ => RequestType::Other(value),
        }
    }
}

impl From<&str> for RequestType {
    fn from(value: &str) -> Self {
        RequestType::from(value.to_string())
    }
}

impl From<RequestType> for String {
    fn from(value: RequestType) -> Self {
        value.as_str().to_string()
    }
}

// =============================================================================
// Command Spec
// =============================================================================

/// Queries requested by the device-information command.
pub const DEVICE_INFORMATION_QUERIES: &[&str] = &[
    "UDID",
    "SerialNumber",
    "DeviceName",
    "Model",
    "ModelName",
    "OSVersion",
    "BuildVersion",
    "IsSupervised",
    "IsActivationLockEnabled",
];

/// What to ask a device to do, independent of the wire dialect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "request_type")]
pub enum CommandSpec {
    InstallProfile {
        /// Raw `.mobileconfig` bytes.
        payload: Vec<u8>,
    },
    RemoveProfile {
        identifier: String,
    },
    InstallApplication {
        manifest_url: String,
    },
    InstalledApplicationList,
    DeviceInformation {
        queries: Vec<String>,
    },
    SecurityInfo,
    ProfileList,
    CertificateList,
    DeviceLock {
        pin: Option<String>,
        message: Option<String>,
    },
    EraseDevice {
        pin: Option<String>,
    },
}

impl CommandSpec {
    /// A device-information query with the standard query list.
    pub fn device_information() -> Self {
        CommandSpec::DeviceInformation {
            queries: DEVICE_INFORMATION_QUERIES
                .iter()
                .map(|q| q.to_string())
                .collect(),
        }
    }

    /// The query command for an information class request type.
    pub fn info_query(request_type: &RequestType) -> CoreResult<Self> {
        match request_type {
            RequestType::DeviceInformation => Ok(Self::device_information()),
            RequestType::SecurityInfo => Ok(CommandSpec::SecurityInfo),
            RequestType::ProfileList => Ok(CommandSpec::ProfileList),
            RequestType::CertificateList => Ok(CommandSpec::CertificateList),
            other => Err(CoreError::InvalidCommand {
                request_type: other.to_string(),
                reason: "not an information query".to_string(),
            }),
        }
    }

    pub fn request_type(&self) -> RequestType {
        match self {
            CommandSpec::InstallProfile { .. } => RequestType::InstallProfile,
            CommandSpec::RemoveProfile { .. } => RequestType::RemoveProfile,
            CommandSpec::InstallApplication { .. } => RequestType::InstallApplication,
            CommandSpec::InstalledApplicationList => RequestType::InstalledApplicationList,
            CommandSpec::DeviceInformation { .. } => RequestType::DeviceInformation,
            CommandSpec::SecurityInfo => RequestType::SecurityInfo,
            CommandSpec::ProfileList => RequestType::ProfileList,
            CommandSpec::CertificateList => RequestType::CertificateList,
            CommandSpec::DeviceLock { .. } => RequestType::DeviceLock,
            CommandSpec::EraseDevice { .. } => RequestType::EraseDevice,
        }
    }

    /// Payload value that distinguishes two commands of the same type for
    /// deduplication purposes.
    pub fn dedup_key(&self) -> Option<String> {
        match self {
            CommandSpec::InstallApplication { manifest_url } => Some(manifest_url.clone()),
            CommandSpec::RemoveProfile { identifier } => Some(identifier.clone()),
            _ => None,
        }
    }

    /// Checks that the command carries what the device needs.
    pub fn validate(&self) -> CoreResult<()> {
        let reason = match self {
            CommandSpec::InstallProfile { payload } if payload.is_empty() => "empty profile payload",
            CommandSpec::RemoveProfile { identifier } if identifier.trim().is_empty() => {
                "empty profile identifier"
            }
            CommandSpec::InstallApplication { manifest_url } if manifest_url.trim().is_empty() => {
                "empty manifest URL"
            }
            _ => return Ok(()),
        };

        Err(CoreError::InvalidCommand {
            request_type: self.request_type().to_string(),
            reason: reason.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_type_parses_known_and_unknown_names() {
        assert_eq!(RequestType::from("InstallProfile"), RequestType::InstallProfile);
        assert_eq!(
            RequestType::from("ScheduleOSUpdate"),
            RequestType::Other("ScheduleOSUpdate".to_string())
        );
        assert_eq!(RequestType::from("ScheduleOSUpdate").as_str(), "ScheduleOSUpdate");
    }

    #[test]
    fn test_dedup_key_only_for_payload_commands() {
        let app = CommandSpec::InstallApplication {
            manifest_url: "https://apps.example.com/app.plist".to_string(),
        };
        assert_eq!(
            app.dedup_key().as_deref(),
            Some("https://apps.example.com/app.plist")
        );
        assert_eq!(CommandSpec::SecurityInfo.dedup_key(), None);
    }

    #[test]
    fn test_validate_rejects_empty_payloads() {
        assert!(CommandSpec::InstallProfile { payload: vec![] }.validate().is_err());
        assert!(CommandSpec::InstallApplication {
            manifest_url: " ".to_string()
        }
        .validate()
        .is_err());
        assert!(CommandSpec::ProfileList.validate().is_ok());
    }

    #[test]
    fn test_info_query_rejects_non_queries() {
        assert_eq!(
            CommandSpec::info_query(&RequestType::ProfileList).unwrap(),
            CommandSpec::ProfileList
        );
        assert!(CommandSpec::info_query(&RequestType::InstallProfile).is_err());
    }
}
