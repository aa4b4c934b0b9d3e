use std::sync::Mutex;

/// Human-readable run log. Purely informational: nothing reads it back to
/// decide what to do next.
pub trait TraceSink: Send + Sync {
    fn trace(&self, message: &str);
}

/// Forwards trace messages to `tracing` under the `crab::trace` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TraceSink for TracingSink {
    fn trace(&self, message: &str) {
        tracing::info!(target: "crab::trace", "{message}");
    }
}

/// Keeps every message in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    messages: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.messages().iter().any(|m| m.contains(needle))
    }
}

impl TraceSink for MemorySink {
    fn trace(&self, message: &str) {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push(message.to_string());
        }
    }
}
