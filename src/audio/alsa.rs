//! ALSA-backed implementations of the audio capability traits.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result};
use tracing::{error, info, warn};

use super::device::{AudioInputOpener, AudioInputSource, AudioOutputOpener, AudioOutputSink};
use crate::config::{CAPTURE_SAMPLE_RATE, PLAYBACK_SAMPLE_RATE};
use crate::error::SessionError;

/// Parameters negotiated with the hardware.
#[derive(Debug, Clone)]
struct NegotiatedParams {
    sample_rate: u32,
    period_size: usize,
}

fn open_pcm(
    device: &str,
    direction: Direction,
    sample_rate: u32,
    dir_name: &str,
) -> Result<(PCM, NegotiatedParams), SessionError> {
    let pcm = PCM::new(device, direction, false)
        .map_err(|e| SessionError::from_alsa_open(device, &e))?;

    let configure = |pcm: &PCM| -> Result<(), alsa::Error> {
        let hwp = HwParams::any(pcm)?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::S16LE)?;
        hwp.set_channels(1)?;
        hwp.set_rate_near(sample_rate, ValueOr::Nearest)?;
        pcm.hw_params(&hwp)
    };
    configure(&pcm).map_err(|e| {
        SessionError::DeviceUnavailable(format!("'{}' ({}): {}", device, dir_name, e))
    })?;

    let params = {
        let hwp = pcm
            .hw_params_current()
            .map_err(|e| SessionError::DeviceUnavailable(format!("'{}': {}", device, e)))?;
        NegotiatedParams {
            sample_rate: hwp.get_rate().unwrap_or(sample_rate),
            period_size: hwp.get_period_size().map(|p| p as usize).unwrap_or(1024),
        }
    };

    info!(
        "ALSA {}: device={}, rate={}, period_size={}",
        dir_name, device, params.sample_rate, params.period_size,
    );

    Ok((pcm, params))
}

// ======================== Capture ========================

pub struct AlsaInputOpener {
    device: String,
}

impl AlsaInputOpener {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
        }
    }
}

impl AudioInputOpener for AlsaInputOpener {
    fn open(&self) -> Result<Box<dyn AudioInputSource>, SessionError> {
        let (pcm, params) = open_pcm(
            &self.device,
            Direction::Capture,
            CAPTURE_SAMPLE_RATE,
            "capture",
        )?;
        if params.sample_rate != CAPTURE_SAMPLE_RATE {
            return Err(SessionError::NotSupported(format!(
                "capture device negotiated {} Hz, protocol requires {} Hz",
                params.sample_rate, CAPTURE_SAMPLE_RATE
            )));
        }
        Ok(Box::new(AlsaInput { pcm }))
    }
}

struct AlsaInput {
    pcm: PCM,
}

impl AudioInputSource for AlsaInput {
    fn read(&mut self, buf: &mut [i16]) -> Result<usize> {
        let io = self.pcm.io_i16().context("capture IO handle")?;
        match io.readi(buf) {
            Ok(frames) => Ok(frames),
            Err(e) => {
                // XRUN: run the ALSA recovery state machine and let the
                // caller retry with an empty read.
                warn!("ALSA capture error: {}, recovering...", e);
                self.pcm
                    .prepare()
                    .context("failed to recover PCM capture")?;
                Ok(0)
            }
        }
    }
}

// ======================== Playback ========================

pub struct AlsaOutputOpener {
    device: String,
}

impl AlsaOutputOpener {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
        }
    }
}

impl AudioOutputOpener for AlsaOutputOpener {
    fn open(&self) -> Result<Box<dyn AudioOutputSink>, SessionError> {
        AlsaOutput::open(&self.device).map(|s| Box::new(s) as Box<dyn AudioOutputSink>)
    }
}

/// Playback sink with its own `audio-play` thread. `submit` hands a block to
/// the thread without blocking; `halt` bumps an epoch so every block queued
/// before it is discarded instead of written.
struct AlsaOutput {
    tx: Option<mpsc::Sender<(u64, Vec<f32>)>>,
    epoch: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl AlsaOutput {
    fn open(device: &str) -> Result<Self, SessionError> {
        let (pcm, _params) = open_pcm(device, Direction::Playback, PLAYBACK_SAMPLE_RATE, "playback")?;
        let (tx, rx) = mpsc::channel::<(u64, Vec<f32>)>();
        let epoch = Arc::new(AtomicU64::new(0));

        let handle = {
            let epoch = epoch.clone();
            thread::Builder::new()
                .name("audio-play".into())
                .spawn(move || play_loop(pcm, rx, &epoch))
                .map_err(|e| SessionError::DeviceUnavailable(format!("playback thread: {}", e)))?
        };

        Ok(Self {
            tx: Some(tx),
            epoch,
            handle: Some(handle),
        })
    }
}

impl AudioOutputSink for AlsaOutput {
    fn submit(&mut self, block: &[f32]) -> Result<()> {
        let tx = self.tx.as_ref().context("playback thread stopped")?;
        tx.send((self.epoch.load(Ordering::Acquire), block.to_vec()))
            .context("playback thread dropped its receiver")?;
        Ok(())
    }

    fn halt(&mut self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }
}

impl Drop for AlsaOutput {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

fn play_loop(pcm: PCM, rx: mpsc::Receiver<(u64, Vec<f32>)>, epoch: &AtomicU64) {
    let mut write_buf: Vec<i16> = Vec::new();

    while let Ok((block_epoch, block)) = rx.recv() {
        // Blocks submitted before the last halt are stale.
        if block_epoch != epoch.load(Ordering::Acquire) {
            continue;
        }

        write_buf.clear();
        write_buf.extend(
            block
                .iter()
                .map(|s| (s.clamp(-1.0, 1.0) * 32767.0) as i16),
        );

        let io = match pcm.io_i16() {
            Ok(io) => io,
            Err(e) => {
                error!("ALSA playback IO handle: {}", e);
                break;
            }
        };

        // Write with retry to handle short writes and XRUN recovery; give up
        // on a block after repeated failures to avoid a dead loop.
        let mut written = 0;
        let mut retries = 0u32;
        while written < write_buf.len() {
            match io.writei(&write_buf[written..]) {
                Ok(n) => {
                    written += n;
                    retries = 0;
                }
                Err(e) => {
                    warn!("ALSA playback error: {}, recovering...", e);
                    retries += 1;
                    if pcm.prepare().is_err() || retries >= 3 {
                        error!(
                            "dropping {} unwritten samples after failed recovery",
                            write_buf.len() - written
                        );
                        break;
                    }
                }
            }
        }
    }

    info!("Playback thread stopped");
}
