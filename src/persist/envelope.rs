use serde::{Deserialize, Serialize};
use serde_json::Value;

/// On-storage representation of a persisted store.
///
/// The envelope is stored as a JSON string under the store's name and
/// carries only the partialized state subset plus the schema version it was
/// written with. Fields absent from `state` fall back to the store's
/// initial values on rehydration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub state: Value,
    pub version: u32,
}

impl Envelope {
    /// Serialize the envelope to its wire form.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse an envelope from its wire form.
    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
