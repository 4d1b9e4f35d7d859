//! Microphone capture: a dedicated record thread slicing the input into
//! fixed-size PCM frames pushed to a callback.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use tracing::{error, info};

use super::CAPTURE_FRAME_SAMPLES;
use super::device::{AudioInputOpener, AudioInputSource};
use crate::error::SessionError;

/// Invoked on the capture thread with each frame of interleaved
/// little-endian i16 PCM. Must not block.
pub type FrameCallback = Arc<dyn Fn(Bytes) + Send + Sync>;

pub struct AudioCapture {
    opener: Arc<dyn AudioInputOpener>,
    frame_samples: usize,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl AudioCapture {
    pub fn new(opener: Arc<dyn AudioInputOpener>) -> Self {
        Self {
            opener,
            frame_samples: CAPTURE_FRAME_SAMPLES,
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    #[cfg(test)]
    fn with_frame_samples(opener: Arc<dyn AudioInputOpener>, frame_samples: usize) -> Self {
        let mut c = Self::new(opener);
        c.frame_samples = frame_samples;
        c
    }

    /// Acquire the input device and start streaming frames to `on_frame`.
    /// Device failures surface here; nothing is left held on error.
    pub fn start(&mut self, on_frame: FrameCallback) -> Result<(), SessionError> {
        if self.handle.is_some() {
            return Ok(());
        }
        let source = self.opener.open()?;

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let frame_samples = self.frame_samples;
        let handle = thread::Builder::new()
            .name("audio-record".into())
            .spawn(move || record_loop(source, frame_samples, on_frame, &running))
            .map_err(|e| SessionError::DeviceUnavailable(format!("capture thread: {}", e)))?;

        self.handle = Some(handle);
        Ok(())
    }

    /// Signal the record thread to stop and release the device. Safe to call
    /// when not capturing.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }

    pub fn is_active(&self) -> bool {
        self.handle.is_some() && self.running.load(Ordering::SeqCst)
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn record_loop(
    mut source: Box<dyn AudioInputSource>,
    frame_samples: usize,
    on_frame: FrameCallback,
    running: &AtomicBool,
) {
    let mut read_buf = vec![0i16; frame_samples];
    let mut accum: Vec<i16> = Vec::with_capacity(frame_samples * 2);

    info!("Recording started: frame_samples={}", frame_samples);

    while running.load(Ordering::Relaxed) {
        match source.read(&mut read_buf) {
            Ok(0) => continue,
            Ok(n) => {
                accum.extend_from_slice(&read_buf[..n]);
                while accum.len() >= frame_samples {
                    let mut frame = Vec::with_capacity(frame_samples * 2);
                    for sample in &accum[..frame_samples] {
                        frame.extend_from_slice(&sample.to_le_bytes());
                    }
                    accum.drain(..frame_samples);
                    on_frame(Bytes::from(frame));
                }
            }
            Err(e) => {
                error!("Capture source failed: {}", e);
                break;
            }
        }
    }

    // Clear the flag ourselves when the source died, so `is_active` does not
    // report a thread that already exited.
    running.store(false, Ordering::SeqCst);
    info!("Recording stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Produces a ramp of samples in small chunks.
    struct RampSource {
        next: i16,
        chunk: usize,
    }

    impl AudioInputSource for RampSource {
        fn read(&mut self, buf: &mut [i16]) -> anyhow::Result<usize> {
            let n = self.chunk.min(buf.len());
            for slot in &mut buf[..n] {
                *slot = self.next;
                self.next = self.next.wrapping_add(1);
            }
            // Pace the fake device so the test does not spin.
            thread::sleep(Duration::from_micros(200));
            Ok(n)
        }
    }

    struct RampOpener {
        chunk: usize,
    }

    impl AudioInputOpener for RampOpener {
        fn open(&self) -> Result<Box<dyn AudioInputSource>, SessionError> {
            Ok(Box::new(RampSource {
                next: 0,
                chunk: self.chunk,
            }))
        }
    }

    struct DeniedOpener;

    impl AudioInputOpener for DeniedOpener {
        fn open(&self) -> Result<Box<dyn AudioInputSource>, SessionError> {
            Err(SessionError::PermissionDenied("mic".into()))
        }
    }

    #[test]
    fn frames_are_fixed_size_little_endian() {
        let frames: Arc<Mutex<Vec<Bytes>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = frames.clone();
        let mut capture =
            AudioCapture::with_frame_samples(Arc::new(RampOpener { chunk: 48 }), 64);
        capture
            .start(Arc::new(move |frame| sink.lock().unwrap().push(frame)))
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while frames.lock().unwrap().len() < 3 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        capture.stop();

        let frames = frames.lock().unwrap();
        assert!(frames.len() >= 3, "expected at least 3 frames");
        for frame in frames.iter() {
            assert_eq!(frame.len(), 64 * 2);
        }
        // Samples are a contiguous ramp across frame boundaries.
        let first: Vec<i16> = frames[0]
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(&first[..4], &[0, 1, 2, 3]);
        let second: Vec<i16> = frames[1]
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(second[0], 64);
    }

    #[test]
    fn stop_is_idempotent() {
        let mut capture = AudioCapture::new(Arc::new(RampOpener { chunk: 16 }));
        capture.start(Arc::new(|_| {})).unwrap();
        capture.stop();
        capture.stop();
        assert!(!capture.is_active());
        // stop before start is also safe
        let mut idle = AudioCapture::new(Arc::new(RampOpener { chunk: 16 }));
        idle.stop();
    }

    /// Delivers one chunk, then fails like an unplugged device.
    struct DyingSource {
        reads: usize,
    }

    impl AudioInputSource for DyingSource {
        fn read(&mut self, buf: &mut [i16]) -> anyhow::Result<usize> {
            self.reads += 1;
            if self.reads > 1 {
                anyhow::bail!("device gone");
            }
            let n = buf.len().min(8);
            buf[..n].fill(0);
            Ok(n)
        }
    }

    struct DyingOpener;

    impl AudioInputOpener for DyingOpener {
        fn open(&self) -> Result<Box<dyn AudioInputSource>, SessionError> {
            Ok(Box::new(DyingSource { reads: 0 }))
        }
    }

    #[test]
    fn source_failure_clears_active_state() {
        let mut capture = AudioCapture::new(Arc::new(DyingOpener));
        capture.start(Arc::new(|_| {})).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while capture.is_active() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!capture.is_active(), "dead record thread still reported active");
    }

    #[test]
    fn denied_device_fails_start_and_holds_nothing() {
        let mut capture = AudioCapture::new(Arc::new(DeniedOpener));
        let err = capture.start(Arc::new(|_| {})).unwrap_err();
        assert!(matches!(err, SessionError::PermissionDenied(_)));
        assert!(!capture.is_active());
    }
}
