use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChannelStatus {
    Connected,
    Uploading,
    Completed,
    Failed,
    #[default]
    #[serde(other)]
    Unknown,
}

/// A progress frame, pushed over the WebSocket or returned by the poll
/// endpoint. Every field is optional on the wire.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressMessage {
    #[serde(default)]
    pub photo_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub status: ChannelStatus,
    #[serde(default)]
    pub uploaded_bytes: Option<u64>,
    #[serde(default)]
    pub total_bytes: Option<u64>,
    #[serde(default)]
    pub percentage: Option<f64>,
    /// Poll responses carry `progress` instead of `percentage`
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub uploaded_chunks: Option<u32>,
    #[serde(default)]
    pub total_chunks: Option<u32>,
    #[serde(default)]
    pub message: Option<String>,
    /// Epoch millis or an ISO string, depending on the server
    #[serde(default)]
    pub timestamp: Option<serde_json::Value>,
}

impl ProgressMessage {
    pub fn percent(&self) -> Option<f64> {
        self.percentage.or(self.progress)
    }

    /// Bytes uploaded, scaled onto a file of `total` bytes.
    ///
    /// Prefers the byte counters, then the percentage, then the chunk counters.
    pub fn bytes_for(&self, total: u64) -> Option<u64> {
        let fraction = match (self.uploaded_bytes, self.total_bytes) {
            (Some(uploaded), Some(reported)) if reported > 0 => Some(uploaded as f64 / reported as f64),
            (Some(uploaded), _) => return Some(uploaded.min(total)),
            _ => None,
        };

        let fraction = fraction
            .or_else(|| self.percent().map(|p| p / 100.0))
            .or_else(|| match (self.uploaded_chunks, self.total_chunks) {
                (Some(done), Some(all)) if all > 0 => Some(done as f64 / all as f64),
                _ => None,
            })?;

        Some(((fraction.clamp(0.0, 1.0)) * total as f64).round() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_push_frame() {
        let json = r#"{
            "photoId": "p-1",
            "userId": "u-1",
            "status": "UPLOADING",
            "uploadedBytes": 500000,
            "totalBytes": 1000000,
            "percentage": 50,
            "timestamp": 1718000000000
        }"#;

        let message: ProgressMessage = serde_json::from_str(json).unwrap();
        assert_eq!(message.photo_id.as_deref(), Some("p-1"));
        assert_eq!(message.status, ChannelStatus::Uploading);
        assert_eq!(message.bytes_for(1_000_000), Some(500_000));
    }

    #[test]
    fn test_unknown_status() {
        let message: ProgressMessage = serde_json::from_str(r#"{"status":"QUEUED"}"#).unwrap();
        assert_eq!(message.status, ChannelStatus::Unknown);

        let message: ProgressMessage = serde_json::from_str("{}").unwrap();
        assert_eq!(message.status, ChannelStatus::Unknown);
    }

    #[test]
    fn test_bytes_are_scaled_to_task_size() {
        let message = ProgressMessage {
            uploaded_bytes: Some(50),
            total_bytes: Some(100),
            ..Default::default()
        };
        assert_eq!(message.bytes_for(12_000), Some(6_000));

        let message = ProgressMessage {
            progress: Some(25.0),
            ..Default::default()
        };
        assert_eq!(message.bytes_for(1_000), Some(250));

        let message = ProgressMessage {
            uploaded_chunks: Some(1),
            total_chunks: Some(4),
            ..Default::default()
        };
        assert_eq!(message.bytes_for(1_000), Some(250));

        assert_eq!(ProgressMessage::default().bytes_for(1_000), None);
    }
}
