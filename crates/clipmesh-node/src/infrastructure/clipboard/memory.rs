//! In-memory clipboard used by the headless binary and the test suite.

use std::sync::{Mutex, PoisonError};

use super::Clipboard;

/// A clipboard that lives entirely in process memory.
#[derive(Debug, Default)]
pub struct InMemoryClipboard {
    content: Mutex<String>,
}

impl InMemoryClipboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a clipboard pre-loaded with `text`.
    pub fn with_content(text: &str) -> Self {
        Self {
            content: Mutex::new(text.to_string()),
        }
    }
}

impl Clipboard for InMemoryClipboard {
    fn read_current(&self) -> String {
        self.content
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn write_current(&self, text: &str) {
        *self.content.lock().unwrap_or_else(PoisonError::into_inner) = text.to_string();
    }
}
