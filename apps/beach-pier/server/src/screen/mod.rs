//! The authoritative screen state mirrored from the upstream byte stream.
//!
//! Implementations are single-owner and never shared across tasks directly;
//! all access goes through [`crate::serializer::ModelSerializer`].

mod alacritty;
#[cfg(any(test, feature = "test-support"))]
mod recording;

pub use alacritty::AlacrittyScreen;
#[cfg(any(test, feature = "test-support"))]
pub use recording::{RecordingScreen, ScreenCall};

use crate::error::ScreenError;

pub trait ScreenModel: Send + 'static {
    /// Discards all state and starts over with the given geometry.
    fn reset(&mut self, cols: u16, rows: u16);

    /// Feeds upstream output. The caller treats return as the acknowledgment
    /// that the model reflects these bytes.
    fn write(&mut self, bytes: &[u8]);

    /// Renders scrollback plus the visible screen as replayable text.
    fn serialize(&self) -> Result<String, ScreenError>;

    fn dispose(&mut self);
}
