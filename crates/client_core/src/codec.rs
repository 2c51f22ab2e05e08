use shared::protocol::{ClientFrame, EventEnvelope, ServerEvent};

use crate::error::CodecError;

/// Turns transport bytes into envelopes and outbound frames into bytes.
pub trait Codec: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<EventEnvelope, CodecError>;
    fn encode(&self, frame: &ClientFrame) -> Result<Vec<u8>, CodecError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn decode(&self, bytes: &[u8]) -> Result<EventEnvelope, CodecError> {
        serde_json::from_slice::<ServerEvent>(bytes)
            .map(EventEnvelope::new)
            .map_err(CodecError::Decode)
    }

    fn encode(&self, frame: &ClientFrame) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(frame).map_err(CodecError::Encode)
    }
}
