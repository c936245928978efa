use serde::{Deserialize, Serialize};

/// Playback event exchanged over the relay (must match server protocol).
///
/// Wire shape: `{"action":"play"|"pause"|"seek","currentTime":<secs>}`.
/// Actions this build does not know deserialize to `Unknown` so a newer
/// peer's events fall through without surfacing an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum PlaybackEvent {
    Play,
    Pause,
    Seek {
        #[serde(rename = "currentTime")]
        current_time: f64,
    },
    #[serde(other)]
    Unknown,
}

/// Reference to the currently uploaded video, owned by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoReference {
    #[serde(rename = "fileUrl")]
    pub file_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_matches_relay_topic_shape() {
        let json = serde_json::to_string(&PlaybackEvent::Seek { current_time: 12.0 }).unwrap();
        assert_eq!(json, r#"{"action":"seek","currentTime":12.0}"#);
        assert_eq!(
            serde_json::to_string(&PlaybackEvent::Play).unwrap(),
            r#"{"action":"play"}"#
        );
    }

    #[test]
    fn unknown_action_is_tolerated() {
        let parsed: PlaybackEvent = serde_json::from_str(r#"{"action":"speed"}"#).unwrap();
        assert_eq!(parsed, PlaybackEvent::Unknown);
    }
}
