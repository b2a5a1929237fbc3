use serde::{Deserialize, Serialize};

use crate::constants::MessageType;

/// Envelope for all control channel communication.
///
/// The `payload` field uses `serde_json::value::RawValue` to defer
/// deserialization until the receiver knows which payload type to expect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlMessage {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<serde_json::value::RawValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlMessage {
    /// Creates a message with the given type and payload.
    pub fn new<T: Serialize>(
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        let raw = match payload {
            Some(p) => Some(serde_json::value::to_raw_value(p)?),
            None => None,
        };
        Ok(Self {
            msg_type,
            request_id: None,
            payload: raw,
            error: None,
        })
    }

    /// Creates a message correlated with `request_id`.
    pub fn request<T: Serialize>(
        request_id: impl Into<String>,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        let mut msg = Self::new(msg_type, payload)?;
        msg.request_id = Some(request_id.into());
        Ok(msg)
    }

    /// Creates an error message.
    pub fn error(
        request_id: Option<String>,
        msg_type: MessageType,
        message: impl Into<String>,
    ) -> Self {
        Self {
            msg_type,
            request_id,
            payload: None,
            error: Some(message.into()),
        }
    }

    /// Deserializes the payload into the given type.
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(
        &self,
    ) -> Result<Option<T>, serde_json::Error> {
        match &self.payload {
            Some(raw) => Ok(Some(serde_json::from_str(raw.get())?)),
            None => Ok(None),
        }
    }

    /// Creates a response message for this request.
    pub fn reply<T: Serialize>(
        &self,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        let mut msg = Self::new(msg_type, payload)?;
        msg.request_id = self.request_id.clone();
        Ok(msg)
    }

    /// Creates an error response for this request.
    pub fn reply_error(&self, msg_type: MessageType, message: impl Into<String>) -> Self {
        Self::error(self.request_id.clone(), msg_type, message)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
