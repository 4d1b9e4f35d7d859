//! Capability seams for audio hardware, so the capture and playback engines
//! can run against ALSA in production and against doubles in tests.

use crate::error::SessionError;

/// A source of interleaved i16 PCM samples (mono, capture rate).
pub trait AudioInputSource: Send {
    /// Blocking read of up to `buf.len()` samples. Returns the number of
    /// samples written into `buf`; `Ok(0)` after a transient fault that was
    /// recovered internally. An error is unrecoverable.
    fn read(&mut self, buf: &mut [i16]) -> anyhow::Result<usize>;
}

/// Acquires an input device. Failure surfaces synchronously from the
/// capture start call and must leave no device handle held.
pub trait AudioInputOpener: Send + Sync {
    fn open(&self) -> Result<Box<dyn AudioInputSource>, SessionError>;
}

/// A sink for normalized f32 blocks scheduled by the playback engine.
pub trait AudioOutputSink: Send {
    /// Queue one block for playout. Must not block the caller.
    fn submit(&mut self, block: &[f32]) -> anyhow::Result<()>;
    /// Drop everything queued but not yet written to the device (barge-in).
    fn halt(&mut self);
}

/// Acquires an output device.
pub trait AudioOutputOpener: Send + Sync {
    fn open(&self) -> Result<Box<dyn AudioOutputSink>, SessionError>;
}
