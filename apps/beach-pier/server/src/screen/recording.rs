use std::sync::Arc;

use parking_lot::Mutex;

use super::ScreenModel;
use crate::error::ScreenError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScreenCall {
    Reset { cols: u16, rows: u16 },
    Write(Vec<u8>),
    Serialize,
    Dispose,
}

#[derive(Default)]
struct RecordingState {
    calls: Vec<ScreenCall>,
    text: String,
    disposed: bool,
    failing_serializes: usize,
    panic_on_write: Option<Vec<u8>>,
}

/// Screen model double that keeps raw text and logs every call. Clones share
/// state, so a test can keep one handle after moving another into the
/// serializer.
#[derive(Clone, Default)]
pub struct RecordingScreen {
    state: Arc<Mutex<RecordingState>>,
}

impl RecordingScreen {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<ScreenCall> {
        self.state.lock().calls.clone()
    }

    pub fn text(&self) -> String {
        self.state.lock().text.clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    /// The next `count` serializations fail.
    pub fn fail_serializes(&self, count: usize) {
        self.state.lock().failing_serializes = count;
    }

    /// Writing exactly `bytes` panics inside the model.
    pub fn panic_on_write(&self, bytes: &[u8]) {
        self.state.lock().panic_on_write = Some(bytes.to_vec());
    }
}

impl ScreenModel for RecordingScreen {
    fn reset(&mut self, cols: u16, rows: u16) {
        let mut state = self.state.lock();
        state.calls.push(ScreenCall::Reset { cols, rows });
        state.text.clear();
    }

    fn write(&mut self, bytes: &[u8]) {
        let poisoned = {
            let mut state = self.state.lock();
            state.calls.push(ScreenCall::Write(bytes.to_vec()));
            if state.panic_on_write.as_deref() == Some(bytes) {
                true
            } else {
                state.text.push_str(&String::from_utf8_lossy(bytes));
                false
            }
        };
        if poisoned {
            panic!("recording screen refused {} bytes", bytes.len());
        }
    }

    fn serialize(&self) -> Result<String, ScreenError> {
        let mut state = self.state.lock();
        state.calls.push(ScreenCall::Serialize);
        if state.disposed {
            return Err(ScreenError::Disposed);
        }
        if state.failing_serializes > 0 {
            state.failing_serializes -= 1;
            return Err(ScreenError::Failed("injected serialize failure".into()));
        }
        Ok(state.text.clone())
    }

    fn dispose(&mut self) {
        let mut state = self.state.lock();
        state.calls.push(ScreenCall::Dispose);
        state.disposed = true;
    }
}
