//! Trinity link protocol: commands, payloads and envelopes.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current protocol version. Carried in the `hello` handshake byte.
pub const PROTOCOL_VERSION: u8 = 1;

pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_CONNECTED: &str = "connected";
pub const STATUS_NO_DATA: &str = "noData";

/// Commands the phone sends to the watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    StartMonitoring,
    StopMonitoring,
    CheckConnection,
    SyncData,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::StartMonitoring => "startMonitoring",
            Command::StopMonitoring => "stopMonitoring",
            Command::CheckConnection => "checkConnection",
            Command::SyncData => "syncData",
        }
    }

    /// Parse a command string. Unknown strings return `None`.
    pub fn parse(s: &str) -> Option<Command> {
        match s {
            "startMonitoring" => Some(Command::StartMonitoring),
            "stopMonitoring" => Some(Command::StopMonitoring),
            "checkConnection" => Some(Command::CheckConnection),
            "syncData" => Some(Command::SyncData),
            _ => None,
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reading returned by a `syncData` pull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartRateData {
    pub heart_rate: f64,
    #[serde(default)]
    pub steps: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calories: Option<f64>,
    pub timestamp: u64,
}

/// One message body. Every key is optional on the wire; receivers check
/// presence before use, so one struct covers commands, replies and pushes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heart_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calories: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitoring_state: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heart_rate_data: Option<HeartRateData>,
}

impl Payload {
    pub fn command(command: Command) -> Self {
        Self {
            command: Some(command.as_str().to_string()),
            ..Self::default()
        }
    }

    pub fn status(status: &str) -> Self {
        Self {
            status: Some(status.to_string()),
            ..Self::default()
        }
    }

    pub fn monitoring_state(monitoring: bool) -> Self {
        Self {
            monitoring_state: Some(monitoring),
            ..Self::default()
        }
    }

    /// Live telemetry push: latest readings plus the sender's monitoring flag.
    pub fn telemetry(heart_rate: Option<f64>, steps: u64, calories: f64, monitoring: bool) -> Self {
        Self {
            heart_rate,
            steps: Some(steps),
            calories: Some(calories),
            monitoring_state: Some(monitoring),
            ..Self::default()
        }
    }

    pub fn sync_reply(data: HeartRateData) -> Self {
        Self {
            heart_rate_data: Some(data),
            ..Self::default()
        }
    }

    /// Typed command, if the `command` key is present and known.
    pub fn parsed_command(&self) -> Option<Command> {
        self.command.as_deref().and_then(Command::parse)
    }

    pub fn is_success(&self) -> bool {
        self.status.as_deref() == Some(STATUS_SUCCESS)
    }
}

/// Correlation id for request/reply pairs.
pub type RequestId = Uuid;

/// Transport envelope around a payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Envelope {
    /// Expects a reply carrying the same id.
    Request { id: RequestId, payload: Payload },
    Reply { id: RequestId, payload: Payload },
    /// Fire-and-forget.
    Push { payload: Payload },
}

impl Envelope {
    pub fn payload(&self) -> &Payload {
        match self {
            Envelope::Request { payload, .. }
            | Envelope::Reply { payload, .. }
            | Envelope::Push { payload } => payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_strings() {
        for c in [
            Command::StartMonitoring,
            Command::StopMonitoring,
            Command::CheckConnection,
            Command::SyncData,
        ] {
            assert_eq!(Command::parse(c.as_str()), Some(c));
        }
        assert_eq!(Command::parse("reboot"), None);
    }

    #[test]
    fn payload_uses_camel_case_and_skips_absent_keys() {
        let json = serde_json::to_string(&Payload::monitoring_state(true)).unwrap();
        assert_eq!(json, r#"{"monitoringState":true}"#);

        let json = serde_json::to_string(&Payload::telemetry(Some(72.0), 10, 1.5, true)).unwrap();
        assert!(json.contains(r#""heartRate":72.0"#));
        assert!(json.contains(r#""steps":10"#));
        assert!(!json.contains("command"));
    }

    #[test]
    fn partial_payload_parses() {
        let p: Payload = serde_json::from_str(r#"{"heartRate":80,"steps":3}"#).unwrap();
        assert_eq!(p.heart_rate, Some(80.0));
        assert_eq!(p.steps, Some(3));
        assert_eq!(p.calories, None);
        assert_eq!(p.monitoring_state, None);
    }

    #[test]
    fn sync_reply_without_calories() {
        let p: Payload = serde_json::from_str(
            r#"{"heartRateData":{"heartRate":70,"steps":12,"timestamp":1000}}"#,
        )
        .unwrap();
        let data = p.heart_rate_data.unwrap();
        assert_eq!(data.calories, None);
        assert_eq!(data.steps, 12);
    }

    #[test]
    fn unknown_command_is_not_parsed() {
        let p = Payload {
            command: Some("dance".into()),
            ..Payload::default()
        };
        assert_eq!(p.parsed_command(), None);
    }

    #[test]
    fn envelope_tagging() {
        let env = Envelope::Push {
            payload: Payload::status(STATUS_SUCCESS),
        };
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.starts_with(r#"{"kind":"push""#));
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, env);
    }
}
