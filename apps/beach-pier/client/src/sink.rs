use std::io::{self, Write};
use std::sync::Arc;

use parking_lot::Mutex;

/// Clear screen, then cursor home.
pub const CLEAR_HOME: &str = "\x1b[2J\x1b[H";

/// Where a viewer renders what it receives.
pub trait TerminalSink: Send {
    fn reset(&mut self) -> io::Result<()>;
    fn write(&mut self, text: &str) -> io::Result<()>;
}

#[derive(Debug)]
pub struct StdoutSink {
    out: io::Stdout,
}

impl StdoutSink {
    pub fn new() -> Self {
        Self { out: io::stdout() }
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminalSink for StdoutSink {
    fn reset(&mut self) -> io::Result<()> {
        self.write(CLEAR_HOME)
    }

    fn write(&mut self, text: &str) -> io::Result<()> {
        let mut out = self.out.lock();
        out.write_all(text.as_bytes())?;
        out.flush()
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    transcript: String,
    screen_start: usize,
    resets: usize,
}

/// In-memory sink. Clones share one transcript.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written, clear sequences included.
    pub fn transcript(&self) -> String {
        self.state.lock().transcript.clone()
    }

    /// Text written since the last reset.
    pub fn screen(&self) -> String {
        let state = self.state.lock();
        state.transcript[state.screen_start..].to_string()
    }

    pub fn resets(&self) -> usize {
        self.state.lock().resets
    }
}

impl TerminalSink for MemorySink {
    fn reset(&mut self) -> io::Result<()> {
        let mut state = self.state.lock();
        state.transcript.push_str(CLEAR_HOME);
        state.screen_start = state.transcript.len();
        state.resets += 1;
        Ok(())
    }

    fn write(&mut self, text: &str) -> io::Result<()> {
        self.state.lock().transcript.push_str(text);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn screen_starts_after_the_last_reset() {
        let mut sink = MemorySink::new();
        let view = sink.clone();
        sink.write("stale").unwrap();
        sink.reset().unwrap();
        sink.write("fresh").unwrap();

        assert_eq!(view.screen(), "fresh");
        assert_eq!(view.transcript(), format!("stale{CLEAR_HOME}fresh"));
        assert_eq!(view.resets(), 1);
    }
}
