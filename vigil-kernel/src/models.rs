//! Domain records: failover segments, their member hosts, failure notifications
//! and the instances the compute plane reports for a host.
//!
//! Wire identifiers (`auto`, `COMPUTE_HOST`, `finished`...) are stable and shared
//! with the notification senders and the operator API.

use crate::engine::TaskOutcome;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

/// Raised when a wire identifier does not name a known variant
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: '{value}'")]
pub struct UnknownIdentifier {
    pub kind: &'static str,
    pub value: String,
}

/// Strategy a segment uses to remediate failures of its members
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryMethod {
    #[default]
    Auto,
    ReservedHost,
    AutoPriority,
    RhPriority,
}

impl RecoveryMethod {
    pub const ALL: [RecoveryMethod; 4] = [
        RecoveryMethod::Auto,
        RecoveryMethod::ReservedHost,
        RecoveryMethod::AutoPriority,
        RecoveryMethod::RhPriority,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryMethod::Auto => "auto",
            RecoveryMethod::ReservedHost => "reserved_host",
            RecoveryMethod::AutoPriority => "auto_priority",
            RecoveryMethod::RhPriority => "rh_priority",
        }
    }
}

impl fmt::Display for RecoveryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecoveryMethod {
    type Err = UnknownIdentifier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RecoveryMethod::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| UnknownIdentifier { kind: "recovery method", value: s.to_string() })
    }
}

/// What kind of failure a notification reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NotificationType {
    #[serde(rename = "COMPUTE_HOST")]
    ComputeHost,
    #[serde(rename = "VM")]
    Vm,
    #[serde(rename = "PROCESS")]
    Process,
}

impl NotificationType {
    pub const ALL: [NotificationType; 3] =
        [NotificationType::ComputeHost, NotificationType::Vm, NotificationType::Process];

    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::ComputeHost => "COMPUTE_HOST",
            NotificationType::Vm => "VM",
            NotificationType::Process => "PROCESS",
        }
    }
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationType {
    type Err = UnknownIdentifier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NotificationType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownIdentifier { kind: "notification type", value: s.to_string() })
    }
}

/// Lifecycle of a notification.
///
/// ```text
/// new ──► running ──► finished | failed | error
///  │                                 │
///  └──► ignored | failed | error     └──(operator retry)──► running
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    New,
    Running,
    Error,
    Failed,
    Finished,
    Ignored,
}

impl NotificationStatus {
    pub const ALL: [NotificationStatus; 6] = [
        NotificationStatus::New,
        NotificationStatus::Running,
        NotificationStatus::Error,
        NotificationStatus::Failed,
        NotificationStatus::Finished,
        NotificationStatus::Ignored,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::New => "new",
            NotificationStatus::Running => "running",
            NotificationStatus::Error => "error",
            NotificationStatus::Failed => "failed",
            NotificationStatus::Finished => "finished",
            NotificationStatus::Ignored => "ignored",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NotificationStatus::Finished
                | NotificationStatus::Failed
                | NotificationStatus::Ignored
                | NotificationStatus::Error
        )
    }

    /// Statuses an operator may restart a recovery from
    pub fn is_retryable(&self) -> bool {
        matches!(self, NotificationStatus::Failed | NotificationStatus::Error)
    }

    pub fn can_transition_to(&self, next: NotificationStatus) -> bool {
        use NotificationStatus::*;
        match (self, next) {
            (New, Running | Ignored | Failed | Error) => true,
            (Running, Finished | Failed | Error) => true,
            (Failed | Error, Running) => true,
            _ => false,
        }
    }
}

impl fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationStatus {
    type Err = UnknownIdentifier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NotificationStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| UnknownIdentifier { kind: "notification status", value: s.to_string() })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverSegment {
    pub uuid: Uuid,
    pub name: String,
    pub service_type: String,
    pub recovery_method: RecoveryMethod,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub uuid: Uuid,
    pub name: String,
    pub failover_segment_id: Uuid,
    #[serde(rename = "type")]
    pub host_type: String,
    pub control_attributes: String,
    /// Standby capacity for reserved-host recovery, kept out of normal scheduling
    pub reserved: bool,
    pub on_maintenance: bool,
}

/// An instance as reported by the compute plane
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub host: String,
    #[serde(default)]
    pub vm_state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub uuid: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_time: OffsetDateTime,
    pub source_host_name: String,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub status: NotificationStatus,
    /// Why the notification ended where it did (ignored, failed, error)
    #[serde(default)]
    pub reason: Option<String>,
    /// Per-task outcome of the last workflow run
    #[serde(default)]
    pub task_outcomes: BTreeMap<String, TaskOutcome>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Notification {
    pub fn new(
        source_host_name: impl Into<String>,
        notification_type: NotificationType,
        payload: serde_json::Value,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            uuid: Uuid::new_v4(),
            generated_time: now,
            source_host_name: source_host_name.into(),
            notification_type,
            payload,
            status: NotificationStatus::New,
            reason: None,
            task_outcomes: BTreeMap::new(),
            updated_at: now,
        }
    }

    /// Instance id carried by VM notifications
    pub fn instance_uuid(&self) -> Option<&str> {
        self.payload.get("instance_uuid").and_then(|v| v.as_str())
    }
}

/// Inbound failure notification as published by monitors (MQTT) or posted to the API
#[derive(Debug, Deserialize)]
pub struct NotificationIn {
    pub notification_uuid: Option<Uuid>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub generated_time: Option<OffsetDateTime>,
    pub hostname: String,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl NotificationIn {
    pub fn into_notification(self) -> Notification {
        let mut notification =
            Notification::new(self.hostname, self.notification_type, self.payload);
        if let Some(uuid) = self.notification_uuid {
            notification.uuid = uuid;
        }
        if let Some(generated) = self.generated_time {
            notification.generated_time = generated;
        }
        notification
    }
}
