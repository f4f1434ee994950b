//! # Domain Types
//!
//! Core records shared by the database layer and the delivery engine.
//!
//! ## Type Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │     Device      │   │     Command     │   │   Enrollment    │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  udid (key)     │   │  command_uuid   │   │  id (= UDID)    │       │
//! │  │  serial_number  │   │  device_udid    │   │  enabled        │       │
//! │  │  active         │   │  request_type   │   │  serial_number  │       │
//! │  │  4 × last_*     │   │  status         │   └─────────────────┘       │
//! │  │  next_push      │   │  error_string   │                              │
//! │  └─────────────────┘   └─────────────────┘                              │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │  CommandStatus  │   │    InfoClass    │   │     Profile     │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  "" (pending)   │   │  CertificateList│   │  payload ident. │       │
//! │  │  NotNow         │   │  ProfileList    │   │  scope          │       │
//! │  │  Acknowledged   │   │  SecurityInfo   │   │  mobileconfig   │       │
//! │  │  Error          │   │  DeviceInfo     │   └─────────────────┘       │
//! │  └─────────────────┘   └─────────────────┘                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::command::RequestType;
use crate::error::CoreError;

// =============================================================================
// Information Classes
// =============================================================================

/// The four classes of information a device reports back on request.
///
/// The scheduler contacts a device whenever one of them is missing or stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InfoClass {
    CertificateList,
    ProfileList,
    SecurityInfo,
    DeviceInfo,
}

impl InfoClass {
    /// All information classes, in the order they are requested.
    pub const ALL: [InfoClass; 4] = [
        InfoClass::DeviceInfo,
        InfoClass::SecurityInfo,
        InfoClass::ProfileList,
        InfoClass::CertificateList,
    ];

    /// The query command that refreshes this class.
    pub fn request_type(&self) -> RequestType {
        match self {
            InfoClass::CertificateList => RequestType::CertificateList,
            InfoClass::ProfileList => RequestType::ProfileList,
            InfoClass::SecurityInfo => RequestType::SecurityInfo,
            InfoClass::DeviceInfo => RequestType::DeviceInformation,
        }
    }

    /// Maps an acknowledged request type back to the class it refreshes.
    pub fn from_request_type(request_type: &RequestType) -> Option<Self> {
        match request_type {
            RequestType::CertificateList => Some(InfoClass::CertificateList),
            RequestType::ProfileList => Some(InfoClass::ProfileList),
            RequestType::SecurityInfo => Some(InfoClass::SecurityInfo),
            RequestType::DeviceInformation => Some(InfoClass::DeviceInfo),
            _ => None,
        }
    }

    /// Name of the device column holding the last-received timestamp.
    pub fn column(&self) -> &'static str {
        match self {
            InfoClass::CertificateList => "last_certificate_list_received",
            InfoClass::ProfileList => "last_profile_list_received",
            InfoClass::SecurityInfo => "last_security_info_received",
            InfoClass::DeviceInfo => "last_device_info_received",
        }
    }
}

// =============================================================================
// Device
// =============================================================================

/// A managed device, keyed by its UDID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Device {
    /// Unique device identifier (stable for the life of the hardware).
    pub udid: String,

    pub serial_number: String,

    /// False once the device has checked out.
    pub active: bool,

    /// Device is flagged for remote erase.
    pub erase: bool,

    /// Device is flagged for remote lock.
    pub lock: bool,

    /// Fixed unlock PIN used by an erase or lock command.
    pub unlock_pin: Option<String>,

    pub last_certificate_list_received: Option<DateTime<Utc>>,
    pub last_profile_list_received: Option<DateTime<Utc>>,
    pub last_security_info_received: Option<DateTime<Utc>>,
    pub last_device_info_received: Option<DateTime<Utc>>,

    /// Explicit future schedule; the device is left alone until then.
    pub next_push: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Device {
    /// Creates a freshly discovered, active device with no history.
    pub fn new(udid: impl Into<String>, serial_number: impl Into<String>) -> Self {
        let now = Utc::now();
        Device {
            udid: udid.into(),
            serial_number: serial_number.into(),
            active: true,
            erase: false,
            lock: false,
            unlock_pin: None,
            last_certificate_list_received: None,
            last_profile_list_received: None,
            last_security_info_received: None,
            last_device_info_received: None,
            next_push: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns when the given information class was last received.
    pub fn last_received(&self, class: InfoClass) -> Option<DateTime<Utc>> {
        match class {
            InfoClass::CertificateList => self.last_certificate_list_received,
            InfoClass::ProfileList => self.last_profile_list_received,
            InfoClass::SecurityInfo => self.last_security_info_received,
            InfoClass::DeviceInfo => self.last_device_info_received,
        }
    }

    /// Sets the last-received timestamp for an information class.
    pub fn set_last_received(&mut self, class: InfoClass, at: DateTime<Utc>) {
        let slot = match class {
            InfoClass::CertificateList => &mut self.last_certificate_list_received,
            InfoClass::ProfileList => &mut self.last_profile_list_received,
            InfoClass::SecurityInfo => &mut self.last_security_info_received,
            InfoClass::DeviceInfo => &mut self.last_device_info_received,
        };
        *slot = Some(at);
    }

    /// The four information timestamps, in [`InfoClass::ALL`] order.
    pub fn info_timestamps(&self) -> [Option<DateTime<Utc>>; 4] {
        InfoClass::ALL.map(|class| self.last_received(class))
    }
}

// =============================================================================
// Command Status
// =============================================================================

/// Delivery status of a command as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CommandStatus {
    /// Queued, no response yet (stored as the empty string).
    #[default]
    #[serde(rename = "")]
    Pending,
    /// Device was busy and will retry later.
    NotNow,
    Acknowledged,
    Error,
    CommandFormatError,
    /// Device reported idle without answering this command.
    Idle,
}

impl CommandStatus {
    /// Wire / storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "",
            CommandStatus::NotNow => "NotNow",
            CommandStatus::Acknowledged => "Acknowledged",
            CommandStatus::Error => "Error",
            CommandStatus::CommandFormatError => "CommandFormatError",
            CommandStatus::Idle => "Idle",
        }
    }

    /// True for the statuses that survive a queue clear.
    ///
    /// `CommandFormatError` is not one of them: a malformed command is
    /// dropped along with anything still pending.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CommandStatus::Acknowledged | CommandStatus::Error)
    }

    /// True for statuses that still count as "in the queue" for deduplication.
    pub fn is_queued(&self) -> bool {
        matches!(self, CommandStatus::Pending | CommandStatus::NotNow)
    }
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandStatus::Pending => write!(f, "pending"),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

impl std::str::FromStr for CommandStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Ok(CommandStatus::Pending),
            "NotNow" => Ok(CommandStatus::NotNow),
            "Acknowledged" => Ok(CommandStatus::Acknowledged),
            "Error" => Ok(CommandStatus::Error),
            "CommandFormatError" => Ok(CommandStatus::CommandFormatError),
            "Idle" => Ok(CommandStatus::Idle),
            other => Err(CoreError::UnknownStatus(other.to_string())),
        }
    }
}

impl TryFrom<String> for CommandStatus {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, CoreError> {
        value.parse()
    }
}

// =============================================================================
// Command
// =============================================================================

/// Local record of a command issued to a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Command {
    /// Unique across the system.
    pub command_uuid: String,

    pub device_udid: String,

    #[cfg_attr(feature = "sqlx", sqlx(try_from = "String"))]
    pub request_type: RequestType,

    /// Deduplication key for payload-bearing commands (manifest URL,
    /// profile identifier). `None` for plain queries.
    pub data: Option<String>,

    #[cfg_attr(feature = "sqlx", sqlx(try_from = "String"))]
    pub status: CommandStatus,

    pub error_string: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Command {
    /// Creates a freshly queued command record.
    pub fn queued(
        command_uuid: impl Into<String>,
        device_udid: impl Into<String>,
        request_type: RequestType,
        data: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Command {
            command_uuid: command_uuid.into(),
            device_udid: device_udid.into(),
            request_type,
            data,
            status: CommandStatus::Pending,
            error_string: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A device's response to a command, relayed by the webhook layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandAcknowledgement {
    pub udid: String,
    pub command_uuid: String,
    pub status: CommandStatus,
    /// Request type if the webhook carried it (needed for relayed commands
    /// the director never issued itself).
    pub request_type: Option<RequestType>,
    pub error_chain: Option<String>,
}

// =============================================================================
// Enrollment
// =============================================================================

/// A downstream server's record of one enrolled channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrollment {
    /// Enrollment ID (the UDID for device channels).
    pub id: String,

    #[serde(rename = "type", default)]
    pub enrollment_type: String,

    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub serial_number: String,
}

// =============================================================================
// Profiles & Applications
// =============================================================================

/// Whether a profile targets one device or the whole fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileScope {
    Device,
    Shared,
}

/// A configuration profile known to the director.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Profile {
    /// Owning device for device-specific profiles, `None` for shared ones.
    pub device_udid: Option<String>,

    pub payload_identifier: String,

    pub payload_uuid: String,

    /// Signed or unsigned `.mobileconfig` bytes.
    pub mobileconfig_data: Vec<u8>,

    /// False when the profile is kept only to be removed.
    pub installed: bool,

    pub updated_at: DateTime<Utc>,
}

impl Profile {
    /// Returns the scope implied by the owning device.
    pub fn scope(&self) -> ProfileScope {
        if self.device_udid.is_some() {
            ProfileScope::Device
        } else {
            ProfileScope::Shared
        }
    }
}

/// An application the director has installed on a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct InstalledApplication {
    pub id: String,
    pub device_udid: String,
    pub manifest_url: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Unit Tests
// =============================================================================
