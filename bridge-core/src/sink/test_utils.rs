use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::message::DeliveryOutcome;
use crate::sink::DeliverySink;
use crate::source::test_utils::{Entry, Journal};

/// Sink that answers from a per-payload script and succeeds once the script is used up.
#[derive(Clone)]
pub(crate) struct ScriptedSink {
    journal: Journal,
    script: Arc<Mutex<HashMap<String, VecDeque<DeliveryOutcome>>>>,
    last_headers: Arc<Mutex<HashMap<String, String>>>,
}

impl ScriptedSink {
    pub(crate) fn new(journal: Journal) -> Self {
        Self {
            journal,
            script: Arc::default(),
            last_headers: Arc::default(),
        }
    }

    /// Outcomes of the next attempts for `payload`, in order.
    pub(crate) fn script(&self, payload: &str, outcomes: Vec<DeliveryOutcome>) {
        self.script
            .lock()
            .insert(payload.to_string(), outcomes.into());
    }

    pub(crate) fn last_headers(&self) -> HashMap<String, String> {
        self.last_headers.lock().clone()
    }
}

impl DeliverySink for ScriptedSink {
    async fn send(&self, payload: Bytes, headers: &HashMap<String, String>) -> DeliveryOutcome {
        let payload = String::from_utf8_lossy(&payload).to_string();
        self.journal.push(Entry::Attempt {
            payload: payload.clone(),
        });
        *self.last_headers.lock() = headers.clone();
        self.script
            .lock()
            .get_mut(&payload)
            .and_then(VecDeque::pop_front)
            .unwrap_or(DeliveryOutcome::Success)
    }
}
