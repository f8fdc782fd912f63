use crate::event::EventRecord;
use crate::{Error, Result};

/// JSON wire format for events on the topic.
pub struct JsonSerializer;

impl JsonSerializer {
    pub fn serialize(event: &EventRecord) -> Result<Vec<u8>> {
        serde_json::to_vec(event).map_err(Into::into)
    }

    /// Decodes a consumed record. `partition` and `offset` only feed the error.
    pub fn deserialize(payload: Option<&[u8]>, partition: i32, offset: i64) -> Result<EventRecord> {
        let bytes = payload.ok_or_else(|| Error::Deserialization {
            partition,
            offset,
            message: "record has no payload".to_string(),
        })?;

        serde_json::from_slice(bytes).map_err(|e| Error::Deserialization {
            partition,
            offset,
            message: e.to_string(),
        })
    }
}
