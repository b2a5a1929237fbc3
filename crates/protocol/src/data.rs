use canbridge_remp::CanFrame;
use serde::{Deserialize, Serialize};

/// A CAN frame on its way through the backend.
///
/// Agents send frames with only `source_dongle_id` set; the backend fills in
/// the group and target before relaying.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanFrameRelay {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub source_dongle_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_dongle_id: Option<String>,
    pub frame: CanFrame,
    /// Dongle timestamp in microseconds, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts_us: Option<u64>,
}

/// Messages carried on the data channel after the handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataMessage {
    CanFrame(CanFrameRelay),
    #[serde(other)]
    Unknown,
}

impl DataMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay() -> CanFrameRelay {
        CanFrameRelay {
            group_id: Some("g1".into()),
            source_dongle_id: "aa".into(),
            target_dongle_id: Some("bb".into()),
            frame: CanFrame::new(0x123, false, vec![1, 2]).unwrap(),
            ts_us: None,
        }
    }

    #[test]
    fn tagged_with_type() {
        let json = DataMessage::CanFrame(relay()).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "can_frame");
        assert_eq!(value["group_id"], "g1");
        assert_eq!(value["frame"]["can_id"], 0x123);
        assert!(value.get("ts_us").is_none());
    }

    #[test]
    fn roundtrip() {
        let msg = DataMessage::CanFrame(relay());
        let back = DataMessage::from_json(&msg.to_json().unwrap()).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn agent_frame_without_routing() {
        let text = r#"{"type":"can_frame","source_dongle_id":"aa","frame":{"can_id":1,"data":[]}}"#;
        match DataMessage::from_json(text).unwrap() {
            DataMessage::CanFrame(relay) => {
                assert!(relay.group_id.is_none());
                assert!(relay.target_dongle_id.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_type() {
        let msg = DataMessage::from_json(r#"{"type":"video"}"#).unwrap();
        assert_eq!(msg, DataMessage::Unknown);
    }
}
