use async_trait::async_trait;
use std::sync::{Arc, Mutex};

use crate::errors::QueueError;
use crate::queue::Delivery;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckRecord {
    Ack,
    Nack { requeue: bool },
}

/// An in-memory delivery that writes its settlement into a shared log.
///
/// Entries look like `ack:<body>`, `nack-requeue:<body>` or `nack-drop:<body>`
/// so tests can interleave them with what the handler itself logs.
pub struct MemoryDelivery {
    body: Vec<u8>,
    redelivered: bool,
    log: Arc<Mutex<Vec<String>>>,
}

impl MemoryDelivery {
    pub fn new(body: impl Into<Vec<u8>>, log: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            body: body.into(),
            redelivered: false,
            log,
        }
    }

    pub fn as_redelivery(mut self) -> Self {
        self.redelivered = true;
        self
    }

    /// Settlements found in `log`, in order, ignoring other entries.
    pub fn records(log: &Mutex<Vec<String>>) -> Vec<AckRecord> {
        log.lock()
            .unwrap()
            .iter()
            .filter_map(|entry| match entry.split_once(':') {
                Some(("ack", _)) => Some(AckRecord::Ack),
                Some(("nack-requeue", _)) => Some(AckRecord::Nack { requeue: true }),
                Some(("nack-drop", _)) => Some(AckRecord::Nack { requeue: false }),
                _ => None,
            })
            .collect()
    }

    fn record(&self, kind: &str) {
        let body = String::from_utf8_lossy(&self.body);
        self.log.lock().unwrap().push(format!("{}:{}", kind, body));
    }
}

#[async_trait]
impl Delivery for MemoryDelivery {
    fn body(&self) -> &[u8] {
        &self.body
    }

    fn redelivered(&self) -> bool {
        self.redelivered
    }

    async fn ack(self) -> Result<(), QueueError> {
        self.record("ack");
        Ok(())
    }

    async fn nack(self, requeue: bool) -> Result<(), QueueError> {
        self.record(if requeue { "nack-requeue" } else { "nack-drop" });
        Ok(())
    }
}
