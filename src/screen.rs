//! Periodic screen capture: samples a display source on a fixed interval,
//! JPEG-encodes each frame and emits timestamped records.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use image::ExtendedColorType;
use image::codecs::jpeg::JpegEncoder;
use tokio::sync::Notify;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::SessionError;
use crate::transcript::ScreenFrameRecord;

/// JPEG quality used for emitted stills.
const JPEG_QUALITY: u8 = 80;

/// One raw frame sampled from a display.
#[derive(Debug, Clone)]
pub struct DisplayFrame {
    /// Packed RGB8 pixels.
    pub rgb: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// A live display stream that can be sampled.
pub trait DisplaySource: Send {
    /// Sample the current frame. `Ok(None)` means the stream has ended
    /// (e.g. the user revoked screen share).
    fn capture_frame(&mut self) -> Result<Option<DisplayFrame>, SessionError>;

    /// Release the underlying stream. Only called on sources this module
    /// owns.
    fn close(&mut self);
}

/// Acquires a display stream when the caller did not supply one.
pub trait DisplayOpener: Send + Sync {
    fn open(&self) -> Result<Box<dyn DisplaySource>, SessionError>;
}

/// A caller-owned display stream lent to the capture engine.
pub type SharedDisplaySource = Arc<Mutex<Box<dyn DisplaySource>>>;

/// Whether the capture engine owns its stream (and must close it on stop)
/// or merely borrows one owned by the caller (and must not).
pub enum DisplayStream {
    Owned(Box<dyn DisplaySource>),
    Borrowed(SharedDisplaySource),
}

impl DisplayStream {
    fn capture_frame(&mut self) -> Result<Option<DisplayFrame>, SessionError> {
        match self {
            DisplayStream::Owned(source) => source.capture_frame(),
            DisplayStream::Borrowed(shared) => {
                shared.lock().expect("display source poisoned").capture_frame()
            }
        }
    }

    fn release(self) {
        match self {
            DisplayStream::Owned(mut source) => source.close(),
            DisplayStream::Borrowed(_) => {}
        }
    }
}

pub struct ScreenCapture {
    run: Option<CaptureRun>,
}

/// State of one capture run. Cancellation is per run: a fresh flag and
/// signal every `start`, so a stale stop cannot leak into the next run.
struct CaptureRun {
    active: Arc<AtomicBool>,
    stop_signal: Arc<Notify>,
    _task: tokio::task::JoinHandle<()>,
}

impl ScreenCapture {
    pub fn new() -> Self {
        Self { run: None }
    }

    /// Start sampling `stream` every `interval`, delivering a record per
    /// frame to `on_capture`. `on_ended` fires if the stream ends on its own.
    pub fn start(
        &mut self,
        stream: DisplayStream,
        interval: Duration,
        on_capture: impl Fn(ScreenFrameRecord) + Send + 'static,
        on_ended: impl FnOnce() + Send + 'static,
    ) {
        if self.is_active() {
            return;
        }
        // A run that ended on its own leaves a finished task behind.
        self.run.take();

        let active = Arc::new(AtomicBool::new(true));
        let stop_signal = Arc::new(Notify::new());
        let task = tokio::spawn(capture_loop(
            stream,
            interval,
            active.clone(),
            stop_signal.clone(),
            Box::new(on_capture),
            Box::new(on_ended),
        ));
        self.run = Some(CaptureRun {
            active,
            stop_signal,
            _task: task,
        });
    }

    /// Stop sampling. An owned stream is closed; a borrowed one is left to
    /// its owner. Safe to call repeatedly or when never started.
    pub fn stop(&mut self) {
        if let Some(run) = self.run.take() {
            run.active.store(false, Ordering::SeqCst);
            run.stop_signal.notify_one();
        }
    }

    pub fn is_active(&self) -> bool {
        self.run
            .as_ref()
            .is_some_and(|run| run.active.load(Ordering::SeqCst))
    }
}

impl Default for ScreenCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ScreenCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn capture_loop(
    mut stream: DisplayStream,
    interval: Duration,
    active: Arc<AtomicBool>,
    stop_signal: Arc<Notify>,
    on_capture: Box<dyn Fn(ScreenFrameRecord) + Send>,
    on_ended: Box<dyn FnOnce() + Send>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!("Screen capture started: interval={:?}", interval);
    let mut ended = false;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop_signal.notified() => break,
        }
        if !active.load(Ordering::SeqCst) {
            break;
        }

        match stream.capture_frame() {
            Ok(Some(frame)) => match encode_jpeg(&frame) {
                Ok(jpeg) => on_capture(ScreenFrameRecord {
                    id: Uuid::new_v4(),
                    timestamp: Utc::now(),
                    data: Bytes::from(jpeg),
                    mime_type: "image/jpeg",
                    width: frame.width,
                    height: frame.height,
                }),
                Err(e) => warn!("Failed to encode screen frame: {}", e),
            },
            Ok(None) => {
                // Stream revoked underneath us.
                info!("Display stream ended, stopping screen capture");
                ended = true;
                break;
            }
            Err(e) => {
                warn!("Screen capture failed: {}", e);
            }
        }
    }

    active.store(false, Ordering::SeqCst);
    stream.release();
    if ended {
        on_ended();
    }
    info!("Screen capture stopped");
}

fn encode_jpeg(frame: &DisplayFrame) -> anyhow::Result<Vec<u8>> {
    let mut jpeg = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY);
    encoder.encode(
        &frame.rgb,
        frame.width,
        frame.height,
        ExtendedColorType::Rgb8,
    )?;
    Ok(jpeg)
}
