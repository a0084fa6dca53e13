use serde_json::Value;

use crate::error::{Result, WorkerError};

/// Turns payloads into stored bytes and back.
///
/// The name is persisted with every record; a processor refuses records
/// written by a codec with a different name.
pub trait Codec: Send + Sync {
    fn name(&self) -> &str;

    fn encode(&self, payload: &Value, schema_version: u32) -> Result<Vec<u8>>;

    fn decode(&self, bytes: &[u8], payload_type: &str, schema_version: u32) -> Result<Value>;
}

/// Plain JSON. Schema versions are carried alongside the bytes, not inside
/// them.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub const NAME: &'static str = "json";
}

impl Codec for JsonCodec {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn encode(&self, payload: &Value, _schema_version: u32) -> Result<Vec<u8>> {
        serde_json::to_vec(payload).map_err(|e| WorkerError::Codec(e.to_string()))
    }

    fn decode(&self, bytes: &[u8], payload_type: &str, schema_version: u32) -> Result<Value> {
        serde_json::from_slice(bytes).map_err(|e| {
            WorkerError::Codec(format!("{payload_type} v{schema_version}: {e}"))
        })
    }
}
