//! JSON frame encoding for subscription requests and events.
//!
//! The listener engine only moves [`Frame`]s; typed requests are encoded once
//! when a subscription starts and every received frame is decoded into the
//! subscription's event type before it reaches the consumer.

use serde::{Serialize, de::DeserializeOwned};

use crate::error::TmsError;
use crate::transport::Frame;

/// Encode a request or event into a frame.
pub fn encode<T: Serialize>(value: &T) -> Result<Frame, TmsError> {
    serde_json::to_vec(value).map_err(|e| TmsError::Codec(e.to_string()))
}

/// Decode a frame into a request or event.
pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T, TmsError> {
    serde_json::from_slice(frame).map_err(|e| TmsError::Codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;

    #[test]
    fn market_data_update_wire_shape() {
        let event = MarketDataEvent::Update {
            instrument: "IBM".to_string(),
            fields: Fields::new().with_numeric("LastPx", 101.5),
        };
        let frame = encode(&event).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(json["event"], "update");
        assert_eq!(json["instrument"], "IBM");
        assert_eq!(json["fields"]["numeric_fields"]["LastPx"], 101.5);
    }

    #[test]
    fn decodes_feed_status() {
        let frame = br#"{"event":"feed_status","status":"initial_state_received"}"#;
        let event: TargetEvent = decode(frame).unwrap();
        assert_eq!(event.feed_status(), Some(FeedStatus::InitialStateReceived));
    }

    #[test]
    fn missing_field_maps_default_to_empty() {
        let frame = br#"{"event":"added","fields":{}}"#;
        let event: TargetEvent = decode(frame).unwrap();
        assert_eq!(event, TargetEvent::Added { fields: Fields::new() });
    }

    #[test]
    fn rejects_garbage() {
        let err = decode::<PortfolioEvent>(b"not json").unwrap_err();
        assert!(matches!(err, TmsError::Codec(_)));
    }

    #[test]
    fn synthesized_disconnect() {
        assert_eq!(
            PortfolioEvent::disconnected().feed_status(),
            Some(FeedStatus::Disconnected)
        );
        assert_eq!(
            MarketDataEvent::disconnected().feed_status(),
            Some(FeedStatus::Disconnected)
        );
    }
}
