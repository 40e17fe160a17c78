//! # Playback Queue
//!
//! Orders inbound synthesized audio frames for gapless sequential playback
//! and exposes speaking-state transitions to the caller.
//!
//! ## Scheduling:
//! Positions are counted in samples at the fixed call rate. Each frame is
//! scheduled to start exactly at the previous frame's scheduled end — never
//! relative to its wall-clock arrival time, which would accumulate gaps and
//! drift under callback jitter. The first frame of a burst starts at the
//! current playhead.
//!
//! ## Speaking signals:
//! The queue emits `true` once when it goes empty → non-empty and `false`
//! once when it drains after the last scheduled frame finishes (or is
//! cleared mid-run). The indicator therefore tracks audible output, not
//! upstream message timing.
//!
//! ## Threading:
//! A mutex around the queue state gives the single-writer discipline the
//! scheduling needs: producer (`enqueue`) and consumer (the output device
//! callback, or [`PlaybackQueue::advance`] when running headless) take turns.
//! The cpal output stream is owned by a dedicated worker thread for the same
//! `Send` reasons as the capture side. Speaking callbacks are invoked with
//! the lock released.

use crate::audio::encode;
use crate::error::{AppError, AppResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, StreamConfig};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{error, info};

/// Callback invoked on speaking-state transitions (`true` = started).
pub type SpeakingCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Scheduled placement of one frame, in sample positions at the call rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSchedule {
    /// First sample position of the frame
    pub start: u64,
    /// One past the last sample position of the frame
    pub end: u64,
}

impl FrameSchedule {
    pub fn duration_samples(&self) -> u64 {
        self.end - self.start
    }

    pub fn duration_seconds(&self, sample_rate: u32) -> f64 {
        encode::frame_duration_seconds(self.duration_samples() as usize, sample_rate)
    }
}

/// Queue state behind the mutex.
struct QueueInner {
    /// Samples scheduled but not yet handed to the output
    line: VecDeque<i16>,

    /// Cumulative end position of every frame still in flight, in order
    frame_ends: VecDeque<u64>,

    /// Playhead: samples handed to the output since creation
    consumed: u64,

    /// Where the next enqueued frame will be scheduled to begin
    next_start: u64,

    /// Whether a burst is currently in progress (started emitted, stopped not)
    speaking: bool,
}

impl QueueInner {
    fn new() -> Self {
        Self {
            line: VecDeque::new(),
            frame_ends: VecDeque::new(),
            consumed: 0,
            next_start: 0,
            speaking: false,
        }
    }

    /// Hand up to `n` scheduled samples to the output, zero-filling the rest
    /// of `out` when one is given. Returns the number of real samples handed
    /// over and whether this consumption drained the run.
    fn consume(&mut self, n: usize, mut out: Option<&mut [f32]>) -> (usize, bool) {
        let mut popped = 0;
        while popped < n {
            match self.line.pop_front() {
                Some(sample) => {
                    if let Some(buffer) = out.as_deref_mut() {
                        buffer[popped] = sample as f32 / 32768.0;
                    }
                    popped += 1;
                }
                None => break,
            }
        }

        // Underrun (or idle) portion of the device buffer plays silence
        if let Some(buffer) = out.as_deref_mut() {
            for slot in buffer[popped..n].iter_mut() {
                *slot = 0.0;
            }
        }

        self.consumed += popped as u64;

        // Frames complete strictly in order as the playhead crosses their ends
        while let Some(&end) = self.frame_ends.front() {
            if self.consumed >= end {
                self.frame_ends.pop_front();
            } else {
                break;
            }
        }

        let drained = self.speaking && self.line.is_empty() && self.frame_ends.is_empty();
        if drained {
            self.speaking = false;
        }

        (popped, drained)
    }
}

struct OutputWorker {
    stop: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

/// Ordered pending audio with a playing cursor; see module docs.
pub struct PlaybackQueue {
    inner: Arc<Mutex<QueueInner>>,
    on_speaking: SpeakingCallback,
    sample_rate: u32,
    output: Option<OutputWorker>,
}

impl PlaybackQueue {
    /// Create a queue with no output device attached.
    ///
    /// Consumption is driven by [`PlaybackQueue::advance`] — used headless
    /// and in tests, where the scheduling and signal behavior is what's
    /// under observation.
    pub fn detached(sample_rate: u32, on_speaking: SpeakingCallback) -> Self {
        Self {
            inner: Arc::new(Mutex::new(QueueInner::new())),
            on_speaking,
            sample_rate,
            output: None,
        }
    }

    /// Create a queue playing through the platform default output device.
    ///
    /// ## Errors:
    /// `DeviceUnavailable` when no output device exists or the stream cannot
    /// be opened at the call format.
    pub fn with_default_output(sample_rate: u32, on_speaking: SpeakingCallback) -> AppResult<Self> {
        let mut queue = Self::detached(sample_rate, on_speaking);
        queue.start_output()?;
        Ok(queue)
    }

    fn start_output(&mut self) -> AppResult<()> {
        let inner = self.inner.clone();
        let on_speaking = self.on_speaking.clone();
        let sample_rate = self.sample_rate;

        let stop = Arc::new(AtomicBool::new(false));
        let stop_for_thread = stop.clone();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<AppResult<()>>(1);

        let handle = thread::Builder::new()
            .name("audio-playback".to_string())
            .spawn(move || {
                let host = cpal::default_host();

                let device = match host.default_output_device() {
                    Some(device) => device,
                    None => {
                        let _ = ready_tx.send(Err(AppError::DeviceUnavailable(
                            "no default audio output device".to_string(),
                        )));
                        return;
                    }
                };

                let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());

                let config = StreamConfig {
                    channels: 1,
                    sample_rate,
                    buffer_size: BufferSize::Default,
                };

                let stream = match device.build_output_stream(
                    &config,
                    move |out: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let (_popped, drained) = {
                            let mut guard = inner.lock().unwrap();
                            let len = out.len();
                            guard.consume(len, Some(out))
                        };
                        // Emitted with the lock released; the callback is
                        // expected to be a cheap hand-off.
                        if drained {
                            on_speaking(false);
                        }
                    },
                    move |err| {
                        error!("Playback stream error: {}", err);
                    },
                    None,
                ) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(AppError::DeviceUnavailable(format!(
                            "failed to open output stream on '{}': {}",
                            device_name, e
                        ))));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AppError::DeviceUnavailable(format!(
                        "failed to start output stream on '{}': {}",
                        device_name, e
                    ))));
                    return;
                }

                info!(
                    "Audio playback started on '{}' at {} Hz mono",
                    device_name, sample_rate
                );
                let _ = ready_tx.send(Ok(()));

                while !stop_for_thread.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(50));
                }

                drop(stream);
            })
            .map_err(|e| AppError::Internal(format!("failed to spawn playback thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.output = Some(OutputWorker { stop, handle });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(AppError::DeviceUnavailable(
                    "playback worker exited before reporting readiness".to_string(),
                ))
            }
        }
    }

    /// Append a decoded frame to the tail of the pending sequence.
    ///
    /// If nothing is playing, this begins a new burst at the current
    /// playhead (emitting speaking-started); otherwise the frame is
    /// pre-scheduled to start exactly where the previous frame ends.
    pub fn enqueue(&self, samples: &[i16]) -> FrameSchedule {
        let mut started = false;

        let schedule = {
            let mut inner = self.inner.lock().unwrap();

            if samples.is_empty() {
                return FrameSchedule {
                    start: inner.next_start,
                    end: inner.next_start,
                };
            }

            if !inner.speaking {
                inner.speaking = true;
                inner.next_start = inner.consumed;
                started = true;
            }

            let start = inner.next_start;
            let end = start + samples.len() as u64;
            inner.next_start = end;
            inner.line.extend(samples.iter().copied());
            inner.frame_ends.push_back(end);

            FrameSchedule { start, end }
        };

        if started {
            (self.on_speaking)(true);
        }

        schedule
    }

    /// Decode one base64 wire payload and enqueue it.
    pub fn enqueue_wire(&self, audio_b64: &str) -> AppResult<FrameSchedule> {
        let samples = encode::decode_frame(audio_b64)?;
        Ok(self.enqueue(&samples))
    }

    /// Discard all pending frames, stop in-flight playback, reset to empty.
    ///
    /// Interrupting a run counts as ending it: speaking-stopped is emitted
    /// here if a burst was in progress, so the indicator can't stick on.
    pub fn clear(&self) {
        let was_speaking = {
            let mut inner = self.inner.lock().unwrap();
            inner.line.clear();
            inner.frame_ends.clear();
            inner.next_start = inner.consumed;
            let was_speaking = inner.speaking;
            inner.speaking = false;
            was_speaking
        };

        if was_speaking {
            (self.on_speaking)(false);
        }
    }

    /// Consume up to `max_samples` scheduled samples without a device —
    /// the headless equivalent of the output callback. Returns how many real
    /// samples were consumed.
    pub fn advance(&self, max_samples: usize) -> usize {
        let (popped, drained) = {
            let mut inner = self.inner.lock().unwrap();
            inner.consume(max_samples, None)
        };

        if drained {
            (self.on_speaking)(false);
        }

        popped
    }

    /// Number of frames scheduled but not yet fully played.
    pub fn pending_frames(&self) -> usize {
        self.inner.lock().unwrap().frame_ends.len()
    }

    /// True when nothing is scheduled and nothing is in flight.
    pub fn is_idle(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.line.is_empty() && inner.frame_ends.is_empty()
    }

    /// Current playhead position in samples.
    pub fn playhead(&self) -> u64 {
        self.inner.lock().unwrap().consumed
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn stop_output(&mut self) {
        if let Some(worker) = self.output.take() {
            worker.stop.store(true, Ordering::Relaxed);
            let _ = worker.handle.join();
            info!("Audio playback stopped");
        }
    }
}

impl Drop for PlaybackQueue {
    fn drop(&mut self) {
        self.stop_output();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Queue plus a recorder of every speaking transition it emits.
    fn queue_with_events() -> (PlaybackQueue, Arc<Mutex<Vec<bool>>>) {
        let events: Arc<Mutex<Vec<bool>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let queue = PlaybackQueue::detached(
            24000,
            Arc::new(move |speaking| sink.lock().unwrap().push(speaking)),
        );
        (queue, events)
    }

    /// Total scheduled duration equals the sum of frame durations, with zero
    /// gap and zero overlap between consecutive frames.
    #[test]
    fn test_gapless_scheduling() {
        let (queue, _events) = queue_with_events();

        let frames = [vec![0i16; 160], vec![0i16; 240], vec![0i16; 100]];
        let schedules: Vec<FrameSchedule> =
            frames.iter().map(|frame| queue.enqueue(frame)).collect();

        for pair in schedules.windows(2) {
            assert_eq!(pair[0].end, pair[1].start, "gap or overlap between frames");
        }

        let total: u64 = schedules.iter().map(|s| s.duration_samples()).sum();
        assert_eq!(total, 500);
        assert_eq!(schedules[0].start, 0);
        assert_eq!(schedules[2].end, 500);
    }

    /// Scheduling is relative to the previous frame's scheduled end even when
    /// consumption lags behind (callback jitter must not open gaps).
    #[test]
    fn test_scheduling_ignores_consumption_jitter() {
        let (queue, _events) = queue_with_events();

        let first = queue.enqueue(&vec![0i16; 200]);
        // Device consumed only part of the first frame before the next arrives
        queue.advance(50);
        let second = queue.enqueue(&vec![0i16; 100]);

        assert_eq!(second.start, first.end);
    }

    /// Speaking-started fires exactly once per contiguous non-empty run;
    /// speaking-stopped fires exactly once when the run drains, never mid-run.
    #[test]
    fn test_speaking_signals_once_per_run() {
        let (queue, events) = queue_with_events();

        queue.enqueue(&vec![0i16; 100]);
        queue.enqueue(&vec![0i16; 100]);
        queue.enqueue(&vec![0i16; 100]);
        assert_eq!(*events.lock().unwrap(), vec![true]);

        // Partial consumption: still mid-run, no stopped signal
        queue.advance(250);
        assert_eq!(*events.lock().unwrap(), vec![true]);

        // Draining the run emits stopped exactly once
        queue.advance(50);
        assert_eq!(*events.lock().unwrap(), vec![true, false]);

        // Idle consumption emits nothing further
        queue.advance(500);
        assert_eq!(*events.lock().unwrap(), vec![true, false]);
    }

    /// A new burst after a drain starts at the playhead, not at the stale
    /// schedule cursor, and re-emits speaking-started.
    #[test]
    fn test_new_burst_starts_at_playhead() {
        let (queue, events) = queue_with_events();

        queue.enqueue(&vec![0i16; 100]);
        queue.advance(100);

        let schedule = queue.enqueue(&vec![0i16; 50]);
        assert_eq!(schedule.start, 100);
        assert_eq!(schedule.end, 150);
        assert_eq!(*events.lock().unwrap(), vec![true, false, true]);
    }

    /// clear() empties the queue, ends the run exactly once, and is
    /// idempotent.
    #[test]
    fn test_clear_resets_and_signals_once() {
        let (queue, events) = queue_with_events();

        queue.enqueue(&vec![0i16; 300]);
        queue.advance(10);
        queue.clear();

        assert!(queue.is_idle());
        assert_eq!(queue.pending_frames(), 0);
        assert_eq!(*events.lock().unwrap(), vec![true, false]);

        // Clearing an empty queue is a no-op
        queue.clear();
        assert_eq!(*events.lock().unwrap(), vec![true, false]);
    }

    /// Consumption past the scheduled material returns only what existed.
    #[test]
    fn test_advance_returns_consumed_count() {
        let (queue, _events) = queue_with_events();
        queue.enqueue(&vec![0i16; 80]);

        assert_eq!(queue.advance(200), 80);
        assert_eq!(queue.playhead(), 80);
        assert!(queue.is_idle());
    }

    /// Wire payloads decode and schedule like local frames.
    #[test]
    fn test_enqueue_wire_round_trip() {
        use crate::audio::encode;

        let (queue, _events) = queue_with_events();
        let samples: Vec<f32> = vec![0.25; 120];
        let schedule = queue.enqueue_wire(&encode::encode_frame(&samples)).unwrap();

        assert_eq!(schedule.duration_samples(), 120);
        assert!(queue.enqueue_wire("!!bad base64!!").is_err());
    }

    #[test]
    fn test_empty_frame_is_inert() {
        let (queue, events) = queue_with_events();
        let schedule = queue.enqueue(&[]);
        assert_eq!(schedule.duration_samples(), 0);
        assert!(queue.is_idle());
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_frame_schedule_duration_seconds() {
        let schedule = FrameSchedule { start: 0, end: 12000 };
        assert_eq!(schedule.duration_seconds(24000), 0.5);
    }
}
