use crate::{QueueId, TaskId};

/// Builds every key the engine touches.
///
/// Per-queue structures live under `<prefix>:<kind>:<qid>`, task bodies under
/// `<prefix>:task:<tid>` and name mappings under `<prefix>:qname:<name>`.
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new<S: Into<String>>(prefix: S) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn task(&self, tid: &TaskId) -> String {
        format!("{}:task:{}", self.prefix, tid)
    }

    pub fn qname(&self, name: &str) -> String {
        format!("{}:qname:{}", self.prefix, name)
    }

    pub fn ready(&self, qid: &QueueId) -> String {
        self.queue_key("ready", qid)
    }

    pub fn delayed(&self, qid: &QueueId) -> String {
        self.queue_key("delayed", qid)
    }

    pub fn taken(&self, qid: &QueueId) -> String {
        self.queue_key("taken", qid)
    }

    pub fn buried(&self, qid: &QueueId) -> String {
        self.queue_key("buried", qid)
    }

    pub fn done(&self, qid: &QueueId) -> String {
        self.queue_key("done", qid)
    }

    pub fn validated_at(&self, qid: &QueueId) -> String {
        self.queue_key("validated", qid)
    }

    pub fn lock_taken(&self, qid: &QueueId) -> String {
        self.queue_key("lock:taken", qid)
    }

    pub fn lock_delayed(&self, qid: &QueueId) -> String {
        self.queue_key("lock:delayed", qid)
    }

    pub fn lock_kick(&self, qid: &QueueId) -> String {
        self.queue_key("lock:kick", qid)
    }

    fn queue_key(&self, kind: &str, qid: &QueueId) -> String {
        format!("{}:{}:{}", self.prefix, kind, qid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_namespaced_by_prefix_and_queue() {
        let keys = KeySpace::new("req");
        let qid = QueueId::from_string("1700000000123".to_string());

        assert_eq!(keys.ready(&qid), "req:ready:1700000000123");
        assert_eq!(keys.lock_delayed(&qid), "req:lock:delayed:1700000000123");
        assert_eq!(keys.task(&TaskId::from_string("t1".to_string())), "req:task:t1");
        assert_eq!(keys.qname("emails"), "req:qname:emails");
    }

    #[test]
    fn test_structures_of_one_queue_never_collide() {
        let keys = KeySpace::new("req");
        let qid = QueueId::from_string("42".to_string());
        let mut all = vec![
            keys.ready(&qid),
            keys.delayed(&qid),
            keys.taken(&qid),
            keys.buried(&qid),
            keys.done(&qid),
            keys.validated_at(&qid),
            keys.lock_taken(&qid),
            keys.lock_delayed(&qid),
            keys.lock_kick(&qid),
        ];
        let count = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), count);
    }
}
