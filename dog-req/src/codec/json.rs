use crate::{codec::TaskCodec, ReqError, ReqResult, Task};

/// JSON codec for task records
#[derive(Debug, Clone, Default)]
pub struct JsonCodec;

impl TaskCodec for JsonCodec {
    fn encode(&self, task: &Task) -> ReqResult<String> {
        serde_json::to_string(task).map_err(|e| ReqError::Encode(e.to_string()))
    }

    fn decode(&self, raw: &str) -> ReqResult<Task> {
        serde_json::from_str(raw).map_err(|e| ReqError::Decode(e.to_string()))
    }

    fn codec_id(&self) -> &'static str {
        "json"
    }
}
