pub mod json;

use crate::{ReqResult, Task};

/// Converts task records to and from the store's string representation.
///
/// Failures in either direction are permanent: a record that cannot be
/// encoded or decoded now will not succeed on retry.
pub trait TaskCodec: Send + Sync {
    fn encode(&self, task: &Task) -> ReqResult<String>;

    fn decode(&self, raw: &str) -> ReqResult<Task>;

    /// Get codec identifier
    fn codec_id(&self) -> &'static str;
}
