use serde::{Deserialize, Serialize};

/// Playback event relayed between clients (must match client protocol).
///
/// Wire shape: `{"action":"play"|"pause"|"seek","currentTime":<secs>}`, with
/// `currentTime` only present for seeks. Action values we do not recognize
/// deserialize to `Unknown`; the relay forwards the original frame untouched
/// and receiving clients ignore the event.
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

/// Reference to the currently uploaded video, as returned by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoReference {
    #[serde(rename = "fileUrl")]
    pub file_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seek_round_trips_with_current_time_field() {
        let json = serde_json::to_string(&PlaybackEvent::Seek { current_time: 42.5 }).unwrap();
        assert_eq!(json, r#"{"action":"seek","currentTime":42.5}"#);
        let back: PlaybackEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, PlaybackEvent::Seek { current_time: 42.5 });
    }

    #[test]
    fn play_and_pause_carry_no_time() {
        assert_eq!(
            serde_json::to_string(&PlaybackEvent::Play).unwrap(),
            r#"{"action":"play"}"#
        );
        let parsed: PlaybackEvent = serde_json::from_str(r#"{"action":"pause"}"#).unwrap();
        assert_eq!(parsed, PlaybackEvent::Pause);
    }

    #[test]
    fn unrecognized_action_parses_as_unknown() {
        let parsed: PlaybackEvent = serde_json::from_str(r#"{"action":"stop"}"#).unwrap();
        assert_eq!(parsed, PlaybackEvent::Unknown);
    }

    #[test]
    fn video_reference_uses_file_url_key() {
        let reference: VideoReference =
            serde_json::from_str(r#"{"fileUrl":"/uploads/a.mp4"}"#).unwrap();
        assert_eq!(reference.file_url, "/uploads/a.mp4");
    }
}
