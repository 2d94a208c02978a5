use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Externally observed state of an upload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UploadState {
    #[default]
    Pending,
    Uploading,
    /// Reserved; the engine never enters this state.
    Paused,
    Success,
    Failed,
    Canceled,
}

impl UploadState {
    /// Whether this state is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Canceled)
    }
}

/// Serialized as the `lastUpload` feature property.
///
/// Once `state` is terminal the record is frozen; no later event for the
/// same correlation id is published.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UploadStatus {
    pub correlation_id: String,
    pub state: UploadState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub status_code: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub progress: i32,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub info: HashMap<String, String>,
}

impl UploadStatus {
    /// Whether the upload has reached a terminal state.
    pub fn finished(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Serialized as the `autoUpload` feature property. Absent window bounds are
/// published as explicit nulls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AutoUploadState {
    pub active: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_wire_names_are_uppercase() {
        assert_eq!(serde_json::to_string(&UploadState::Uploading).unwrap(), "\"UPLOADING\"");
        assert_eq!(serde_json::to_string(&UploadState::Canceled).unwrap(), "\"CANCELED\"");
        let parsed: UploadState = serde_json::from_str("\"SUCCESS\"").unwrap();
        assert_eq!(parsed, UploadState::Success);
    }

    #[test]
    fn terminal_states() {
        assert!(!UploadState::Pending.is_terminal());
        assert!(!UploadState::Uploading.is_terminal());
        assert!(!UploadState::Paused.is_terminal());
        assert!(UploadState::Success.is_terminal());
        assert!(UploadState::Failed.is_terminal());
        assert!(UploadState::Canceled.is_terminal());
    }

    #[test]
    fn status_roundtrip() {
        let status = UploadStatus {
            correlation_id: "upload-id-7".into(),
            state: UploadState::Failed,
            start_time: Some(Utc::now()),
            end_time: Some(Utc::now()),
            status_code: "tc".into(),
            message: "no such file".into(),
            progress: 40,
            info: HashMap::from([("origin".to_string(), "test".to_string())]),
        };

        let text = serde_json::to_string(&status).unwrap();
        let parsed: UploadStatus = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, status);
        assert!(parsed.finished());
    }

    #[test]
    fn status_omits_empty_optionals() {
        let status = UploadStatus {
            correlation_id: "u-1".into(),
            state: UploadState::Uploading,
            ..Default::default()
        };
        let text = serde_json::to_string(&status).unwrap();
        assert!(!text.contains("statusCode"));
        assert!(!text.contains("message"));
        assert!(!text.contains("endTime"));
        assert!(!text.contains("info"));
    }

    #[test]
    fn auto_upload_state_publishes_nulls() {
        let state = AutoUploadState::default();
        let text = serde_json::to_string(&state).unwrap();
        assert!(text.contains("\"startTime\":null"));
        assert!(text.contains("\"endTime\":null"));
    }
}
