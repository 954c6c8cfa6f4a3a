//! In-memory result buffer

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// One side-channel result waiting to be persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEntry {
    /// Request parameters, stored as JSON text
    pub parameters: serde_json::Value,
    pub result_status: i32,
    pub result_data: String,
    /// Identity of the daemon that produced the result
    pub inserted_by: String,
    pub client_transaction_id: i64,
}

/// Buffer shared by pool tasks and the flusher
///
/// Recording is a push under a short lock; the flusher takes the whole
/// buffer by swapping in an empty one, so producers never wait on storage.
#[derive(Debug)]
pub struct ResultBuffer {
    identity: String,
    entries: Mutex<Vec<ResultEntry>>,
}

impl ResultBuffer {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Queue a result, tagged with this buffer's identity
    pub fn record(
        &self,
        parameters: serde_json::Value,
        result_status: i32,
        result_data: impl Into<String>,
        client_transaction_id: i64,
    ) {
        let entry = ResultEntry {
            parameters,
            result_status,
            result_data: result_data.into(),
            inserted_by: self.identity.clone(),
            client_transaction_id,
        };
        self.entries.lock().push(entry);
    }

    /// Take everything recorded so far, leaving the buffer empty
    pub fn take(&self) -> Vec<ResultEntry> {
        std::mem::take(&mut *self.entries.lock())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }
}
