//! audio - capture and gapless playback for the live session.
//!
//! Capture runs on a dedicated OS thread (NOT a tokio task) to avoid
//! contention between blocking device I/O and the async network path; the
//! playback scheduler is a tokio task that hands blocks to a sink with its
//! own output thread.

mod alsa;
mod capture;
mod device;
mod playback;

pub use alsa::{AlsaInputOpener, AlsaOutputOpener};
pub use capture::{AudioCapture, FrameCallback};
pub use device::{AudioInputOpener, AudioInputSource, AudioOutputOpener, AudioOutputSink};
pub use playback::AudioPlayback;

/// Samples per frame delivered by [`AudioCapture`] (64 ms at 16 kHz).
pub const CAPTURE_FRAME_SAMPLES: usize = 1024;
