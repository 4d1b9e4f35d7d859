//! Gapless playback of bursty network audio.
//!
//! Inbound PCM is normalized to f32, accumulated, and sliced into 320 ms
//! blocks. A look-ahead scheduler drains the block queue onto the output
//! timeline: each pass only schedules what falls inside a short future
//! window, then re-arms a timer just before the window empties. This keeps
//! memory bounded under bursts and leaves no gaps under continuous input,
//! while the task stays responsive to barge-in at all times.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::device::AudioOutputSink;

/// Playable block length: long enough to keep scheduling overhead low,
/// short enough to keep latency down.
const BLOCK: Duration = Duration::from_millis(320);
/// Only blocks due inside this window are handed to the sink per pass.
const LOOKAHEAD: Duration = Duration::from_millis(200);
/// Startup slack between "now" and the first scheduled block.
const START_SLACK: Duration = Duration::from_millis(50);
/// A pass is re-armed this long before the scheduled timeline runs out.
const RESCHEDULE_MARGIN: Duration = Duration::from_millis(50);

enum Cmd {
    Frame(Bytes),
    Stop,
    Finish(Box<dyn FnOnce() + Send>),
    ResetFinishing,
    Tap(mpsc::UnboundedSender<Vec<f32>>),
    Shutdown,
}

/// End-of-turn drain state. Once a drain starts, intake stays closed —
/// through and past completion — until `reset_finishing` or `stop`.
enum Drain {
    None,
    Pending(Box<dyn FnOnce() + Send>),
    Done,
}

impl Drain {
    fn is_none(&self) -> bool {
        matches!(self, Drain::None)
    }
}

/// Handle to the playback scheduler task. All methods are non-blocking.
pub struct AudioPlayback {
    cmd_tx: mpsc::UnboundedSender<Cmd>,
}

impl AudioPlayback {
    pub fn new(sink: Box<dyn AudioOutputSink>, sample_rate: u32) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let scheduler = Scheduler {
            sink,
            sample_rate,
            block_samples: (sample_rate as u64 * BLOCK.as_millis() as u64 / 1000) as usize,
            accum: Vec::new(),
            queue: VecDeque::new(),
            scheduled_time: Instant::now(),
            drain: Drain::None,
            taps: Vec::new(),
            wake: None,
        };
        tokio::spawn(scheduler.run(cmd_rx));
        Self { cmd_tx }
    }

    /// Feed one inbound frame of little-endian i16 PCM. Ignored from the
    /// moment a drain starts until [`AudioPlayback::reset_finishing`] or
    /// [`AudioPlayback::stop`], even after the drain has completed.
    pub fn enqueue(&self, pcm: Bytes) {
        let _ = self.cmd_tx.send(Cmd::Frame(pcm));
    }

    /// Barge-in: halt the sink, clear all buffers, reset the timeline and
    /// drop any pending drain callback.
    pub fn stop(&self) {
        let _ = self.cmd_tx.send(Cmd::Stop);
    }

    /// Stop accepting new frames, flush the partial accumulation buffer and
    /// let everything queued play out; `on_done` fires once the last block
    /// would have finished playing (immediately if already idle).
    pub fn finish(&self, on_done: impl FnOnce() + Send + 'static) {
        let _ = self.cmd_tx.send(Cmd::Finish(Box::new(on_done)));
    }

    /// Cancel a pending drain, e.g. when new audio arrives before it
    /// completed. The drain callback is dropped without being called.
    pub fn reset_finishing(&self) {
        let _ = self.cmd_tx.send(Cmd::ResetFinishing);
    }

    /// The mixed output as a stream: every scheduled block is also delivered
    /// to the returned receiver, for recording pipelines.
    pub fn output_tap(&self) -> mpsc::UnboundedReceiver<Vec<f32>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = self.cmd_tx.send(Cmd::Tap(tx));
        rx
    }
}

impl Drop for AudioPlayback {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(Cmd::Shutdown);
    }
}

struct Scheduler {
    sink: Box<dyn AudioOutputSink>,
    sample_rate: u32,
    block_samples: usize,
    /// Raw normalized samples not yet sliced into a full block.
    accum: Vec<f32>,
    /// Fixed-size playable blocks awaiting scheduling.
    queue: VecDeque<Vec<f32>>,
    /// Monotonic cursor: where the scheduled timeline currently ends.
    scheduled_time: Instant,
    drain: Drain,
    taps: Vec<mpsc::UnboundedSender<Vec<f32>>>,
    wake: Option<Instant>,
}

impl Scheduler {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Cmd>) {
        loop {
            let wake = self.wake;
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    None | Some(Cmd::Shutdown) => break,
                    Some(cmd) => self.handle(cmd),
                },
                _ = tokio::time::sleep_until(wake.unwrap_or_else(Instant::now)), if wake.is_some() => {
                    self.schedule_pass();
                }
            }
        }
        info!("Playback scheduler stopped");
    }

    fn handle(&mut self, cmd: Cmd) {
        match cmd {
            Cmd::Frame(pcm) => {
                if !self.drain.is_none() {
                    debug!("dropping {} bytes received while draining", pcm.len());
                    return;
                }
                self.accum.extend(
                    pcm.chunks_exact(2)
                        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0),
                );
                while self.accum.len() >= self.block_samples {
                    let block: Vec<f32> = self.accum.drain(..self.block_samples).collect();
                    self.queue.push_back(block);
                }
                self.schedule_pass();
            }
            Cmd::Stop => {
                self.sink.halt();
                self.queue.clear();
                self.accum.clear();
                self.scheduled_time = Instant::now();
                self.drain = Drain::None;
                self.wake = None;
            }
            Cmd::Finish(on_done) => {
                self.drain = Drain::Pending(on_done);
                if !self.accum.is_empty() {
                    let block: Vec<f32> = self.accum.drain(..).collect();
                    self.queue.push_back(block);
                }
                self.schedule_pass();
            }
            Cmd::ResetFinishing => {
                self.drain = Drain::None;
                self.schedule_pass();
            }
            Cmd::Tap(tx) => self.taps.push(tx),
            Cmd::Shutdown => unreachable!("handled by the run loop"),
        }
    }

    /// Drain the queue into the output timeline while it stays inside the
    /// look-ahead window, then decide when to wake next.
    fn schedule_pass(&mut self) {
        let now = Instant::now();
        if !self.queue.is_empty() && self.scheduled_time <= now {
            // Starting from idle: give the sink a little slack.
            self.scheduled_time = now + START_SLACK;
        }

        while self.scheduled_time < now + LOOKAHEAD {
            let Some(block) = self.queue.pop_front() else {
                break;
            };
            self.taps.retain(|tap| tap.send(block.clone()).is_ok());
            if let Err(e) = self.sink.submit(&block) {
                warn!("output sink rejected block: {}", e);
            }
            let start = self.scheduled_time.max(now);
            self.scheduled_time =
                start + Duration::from_secs_f64(block.len() as f64 / self.sample_rate as f64);
        }

        self.wake = if !self.queue.is_empty() {
            let lead = self.scheduled_time.saturating_duration_since(now);
            Some(now + lead.saturating_sub(RESCHEDULE_MARGIN))
        } else if matches!(self.drain, Drain::Pending(_)) && self.accum.is_empty() {
            if self.scheduled_time <= now {
                // The last block has played out. Intake stays closed until
                // an explicit reset.
                if let Drain::Pending(on_done) = std::mem::replace(&mut self.drain, Drain::Done) {
                    on_done();
                }
                None
            } else {
                // Everything is scheduled; fire once it has played out.
                Some(self.scheduled_time)
            }
        } else {
            None
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    const RATE: u32 = 24_000;
    const BLOCK_SAMPLES: usize = 7680; // 320 ms at 24 kHz

    #[derive(Default)]
    struct SinkLog {
        submits: Mutex<Vec<(Instant, usize)>>,
        halts: AtomicUsize,
    }

    struct FakeSink(Arc<SinkLog>);

    impl AudioOutputSink for FakeSink {
        fn submit(&mut self, block: &[f32]) -> anyhow::Result<()> {
            self.0
                .submits
                .lock()
                .unwrap()
                .push((Instant::now(), block.len()));
            Ok(())
        }

        fn halt(&mut self) {
            self.0.halts.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pcm_frame(samples: usize) -> Bytes {
        let mut data = Vec::with_capacity(samples * 2);
        for i in 0..samples {
            data.extend_from_slice(&((i % 128) as i16 * 256).to_le_bytes());
        }
        Bytes::from(data)
    }

    /// Let the scheduler task process queued commands without advancing the
    /// paused clock.
    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    async fn advance(d: Duration) {
        tokio::time::advance(d).await;
        settle().await;
    }

    #[tokio::test(start_paused = true)]
    async fn continuous_input_schedules_without_timeline_gaps() {
        let log = Arc::new(SinkLog::default());
        let playback = AudioPlayback::new(Box::new(FakeSink(log.clone())), RATE);

        // Three full blocks arrive in one burst.
        playback.enqueue(pcm_frame(BLOCK_SAMPLES * 3));
        settle().await;

        // Only what fits the look-ahead window goes out immediately.
        assert_eq!(log.submits.lock().unwrap().len(), 1);

        for _ in 0..8 {
            advance(Duration::from_millis(320)).await;
        }

        let submits = log.submits.lock().unwrap();
        assert_eq!(submits.len(), 3);
        // Each pass runs exactly one block duration after the previous one,
        // so consecutive blocks land back to back on the timeline.
        let spacing = submits[1].0 - submits[0].0;
        assert_eq!(spacing, Duration::from_millis(320));
        let spacing = submits[2].0 - submits[1].0;
        assert_eq!(spacing, Duration::from_millis(320));
        assert!(submits.iter().all(|(_, len)| *len == BLOCK_SAMPLES));
    }

    #[tokio::test(start_paused = true)]
    async fn finish_on_idle_fires_immediately() {
        let playback = AudioPlayback::new(
            Box::new(FakeSink(Arc::new(SinkLog::default()))),
            RATE,
        );
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        playback.finish(move || flag.store(true, Ordering::SeqCst));
        settle().await;
        assert!(done.load(Ordering::SeqCst), "no pending audio, no waiting");
    }

    #[tokio::test(start_paused = true)]
    async fn finish_waits_for_pending_audio_to_play_out() {
        let log = Arc::new(SinkLog::default());
        let playback = AudioPlayback::new(Box::new(FakeSink(log.clone())), RATE);
        let done = Arc::new(AtomicBool::new(false));

        // 160 ms of audio sits in the accumulation buffer (no full block).
        playback.enqueue(pcm_frame(BLOCK_SAMPLES / 2));
        settle().await;
        assert_eq!(log.submits.lock().unwrap().len(), 0);

        let flag = done.clone();
        playback.finish(move || flag.store(true, Ordering::SeqCst));
        settle().await;
        // The partial buffer was flushed as a final short block.
        assert_eq!(log.submits.lock().unwrap().len(), 1);
        assert!(!done.load(Ordering::SeqCst));

        // 50 ms slack + 160 ms block: not drained at 200 ms, drained at 220.
        advance(Duration::from_millis(200)).await;
        assert!(!done.load(Ordering::SeqCst));
        advance(Duration::from_millis(20)).await;
        assert!(done.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn frames_are_dropped_while_draining() {
        let log = Arc::new(SinkLog::default());
        let playback = AudioPlayback::new(Box::new(FakeSink(log.clone())), RATE);
        playback.finish(|| {});
        settle().await;

        // The drain already completed; late frames must still be refused.
        playback.enqueue(pcm_frame(BLOCK_SAMPLES));
        advance(Duration::from_secs(2)).await;
        assert_eq!(log.submits.lock().unwrap().len(), 0);

        // Intake reopens only on an explicit reset.
        playback.reset_finishing();
        settle().await;
        playback.enqueue(pcm_frame(BLOCK_SAMPLES));
        settle().await;
        assert_eq!(log.submits.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_finishing_cancels_the_drain_and_resumes_intake() {
        let log = Arc::new(SinkLog::default());
        let playback = AudioPlayback::new(Box::new(FakeSink(log.clone())), RATE);
        let done = Arc::new(AtomicBool::new(false));

        playback.enqueue(pcm_frame(BLOCK_SAMPLES / 2));
        let flag = done.clone();
        playback.finish(move || flag.store(true, Ordering::SeqCst));
        settle().await;

        playback.reset_finishing();
        settle().await;
        advance(Duration::from_secs(2)).await;
        assert!(!done.load(Ordering::SeqCst), "cancelled drain must not fire");

        // New audio is accepted again.
        playback.enqueue(pcm_frame(BLOCK_SAMPLES));
        advance(Duration::from_secs(2)).await;
        assert_eq!(log.submits.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_halts_sink_and_clears_everything() {
        let log = Arc::new(SinkLog::default());
        let playback = AudioPlayback::new(Box::new(FakeSink(log.clone())), RATE);

        playback.enqueue(pcm_frame(BLOCK_SAMPLES * 2));
        settle().await;
        let before = log.submits.lock().unwrap().len();

        playback.stop();
        settle().await;
        assert_eq!(log.halts.load(Ordering::SeqCst), 1);

        advance(Duration::from_secs(2)).await;
        assert_eq!(
            log.submits.lock().unwrap().len(),
            before,
            "cleared blocks must not be scheduled after stop"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn output_tap_receives_every_scheduled_block() {
        let log = Arc::new(SinkLog::default());
        let playback = AudioPlayback::new(Box::new(FakeSink(log.clone())), RATE);
        let mut tap = playback.output_tap();
        settle().await;

        playback.enqueue(pcm_frame(BLOCK_SAMPLES * 2));
        settle().await;
        for _ in 0..6 {
            advance(Duration::from_millis(320)).await;
        }

        let mut received = 0;
        while let Ok(block) = tap.try_recv() {
            assert_eq!(block.len(), BLOCK_SAMPLES);
            received += 1;
        }
        assert_eq!(received, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn samples_are_normalized_to_unit_range() {
        let log = Arc::new(SinkLog::default());
        let playback = AudioPlayback::new(Box::new(FakeSink(log.clone())), RATE);
        let mut tap = playback.output_tap();
        settle().await;

        let mut data = Vec::new();
        data.extend_from_slice(&i16::MIN.to_le_bytes());
        data.extend_from_slice(&i16::MAX.to_le_bytes());
        data.resize(BLOCK_SAMPLES * 2, 0);
        playback.enqueue(Bytes::from(data));
        advance(Duration::from_secs(1)).await;

        let block = tap.try_recv().unwrap();
        assert!((block[0] - (-1.0)).abs() < 1e-6);
        assert!((block[1] - 32767.0 / 32768.0).abs() < 1e-6);
    }
}
