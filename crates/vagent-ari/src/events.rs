//! Typed ARI event envelope (§4.4). Unrecognized event types degrade to a
//! logged, counted `Other` variant instead of a parse failure.

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct Channel {
    pub id: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Playback {
    pub id: String,
    pub media_uri: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum AriEvent {
    StasisStart { channel: Channel, #[serde(default)] args: Vec<String> },
    StasisEnd { channel: Channel },
    ChannelDestroyed { channel: Channel },
    PlaybackStarted { playback: Playback },
    PlaybackFinished { playback: Playback },
    ChannelDtmfReceived { channel: Channel, digit: String },
    #[serde(other)]
    Other,
}

/// Parse a raw ARI event payload, degrading unknown `type` tags or malformed
/// JSON to `AriEvent::Other` plus the original value for diagnostics rather
/// than failing the websocket read loop (§4.4, §7 `protocol` policy).
pub fn parse_event(raw: &str) -> (AriEvent, Value) {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => return (AriEvent::Other, Value::Null),
    };
    let event = serde_json::from_value(value.clone()).unwrap_or(AriEvent::Other);
    (event, value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stasis_start() {
        let raw = r#"{"type":"StasisStart","channel":{"id":"c1","name":"PJSIP/100"},"args":[]}"#;
        let (event, _) = parse_event(raw);
        assert!(matches!(event, AriEvent::StasisStart { .. }));
    }

    #[test]
    fn unknown_type_degrades_to_other() {
        let raw = r#"{"type":"SomeFutureEvent","foo":"bar"}"#;
        let (event, value) = parse_event(raw);
        assert!(matches!(event, AriEvent::Other));
        assert_eq!(value["type"], "SomeFutureEvent");
    }

    #[test]
    fn malformed_json_degrades_to_other() {
        let (event, _) = parse_event("not json");
        assert!(matches!(event, AriEvent::Other));
    }
}
