//! Task output sink

use std::io::{self, Write};
use std::sync::Arc;

use tracing::warn;

use crate::db::Store;

/// Appends everything written to it onto a task's stored output
///
/// Bytes are decoded as UTF-8; a multi-byte character split across writes is
/// held back until the rest arrives, invalid bytes become U+FFFD. Store
/// failures are logged and swallowed so a bookkeeping hiccup never fails the
/// step producing the output.
///
/// Each flushed chunk is one synchronous store append on the calling thread,
/// so a locked database stalls the writer for at most the busy timeout.
pub struct TaskOutputWriter {
    store: Arc<dyn Store>,
    task_id: String,
    pending: Vec<u8>,
}

impl TaskOutputWriter {
    pub fn new(store: Arc<dyn Store>, task_id: impl Into<String>) -> Self {
        Self {
            store,
            task_id: task_id.into(),
            pending: Vec::new(),
        }
    }

    fn append(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Err(e) = self.store.append_task_output(&self.task_id, text) {
            warn!(task_id = %self.task_id, "Failed to append task output: {}", e);
        }
    }

    /// Drain the longest decodable prefix of the pending bytes
    fn take_decoded(&mut self) -> String {
        let mut decoded = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    decoded.push_str(text);
                    self.pending.clear();
                    return decoded;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    decoded.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        // Incomplete sequence at the end, wait for more bytes
                        None => {
                            self.pending.drain(..valid);
                            return decoded;
                        }
                        Some(len) => {
                            decoded.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }
    }
}

impl Write for TaskOutputWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        let text = self.take_decoded();
        self.append(&text);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.pending.is_empty() {
            let text = String::from_utf8_lossy(&self.pending).into_owned();
            self.pending.clear();
            self.append(&text);
        }
        Ok(())
    }
}

impl Drop for TaskOutputWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}
