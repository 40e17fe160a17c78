//! # Capture Pipeline
//!
//! Acquires the platform default audio input device at the fixed call format
//! (24 kHz mono f32) and delivers successive frames to a caller-supplied
//! callback at whatever granularity the platform's capture callback provides
//! — frames are not re-chunked here.
//!
//! ## Threading:
//! The cpal stream is owned by a dedicated worker thread, because the stream
//! handle is not `Send` and the pipeline handle must travel across the async
//! call machinery. The device callback itself runs on the platform's
//! real-time audio thread: the frame callback passed to [`CapturePipeline::start`]
//! must stay cheap (hand the frame off, return) — blocking there makes the
//! platform drop captured audio, there is no capture-side buffer.
//!
//! ## Lifecycle:
//! `start` fails with `DeviceUnavailable` if there is no input device or the
//! stream cannot be opened; `stop` releases the device and is idempotent.

use crate::error::{AppError, AppResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, StreamConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

/// Handle to the microphone capture worker.
pub struct CapturePipeline {
    sample_rate: u32,
    worker: Option<CaptureWorker>,
}

struct CaptureWorker {
    stop: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

impl CapturePipeline {
    /// Create an idle pipeline for the given capture rate.
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            worker: None,
        }
    }

    /// Acquire the default input device and begin delivering frames.
    ///
    /// ## Parameters:
    /// - **on_frame**: invoked on the device callback thread with each
    ///   captured f32 frame; must not block beyond bounded hand-off time
    ///
    /// ## Errors:
    /// `DeviceUnavailable` when no input device exists, the stream cannot be
    /// built at the call format, or the stream fails to start.
    ///
    /// Calling `start` while already running is a no-op (logged): the running
    /// worker keeps exclusive ownership of the device.
    pub fn start<F>(&mut self, on_frame: F) -> AppResult<()>
    where
        F: Fn(&[f32]) + Send + 'static,
    {
        if self.worker.is_some() {
            warn!("Capture already running, ignoring start");
            return Ok(());
        }

        let stop = Arc::new(AtomicBool::new(false));
        let stop_for_thread = stop.clone();
        let stop_for_callback = stop.clone();
        let sample_rate = self.sample_rate;

        // The worker reports its startup outcome exactly once; after that the
        // channel is only kept open by the worker until it exits.
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<AppResult<()>>(1);

        let handle = thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                let host = cpal::default_host();

                let device = match host.default_input_device() {
                    Some(device) => device,
                    None => {
                        let _ = ready_tx.send(Err(AppError::DeviceUnavailable(
                            "no default audio input device".to_string(),
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

                let stream = match device.build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        if stop_for_callback.load(Ordering::Relaxed) {
                            return;
                        }
                        on_frame(data);
                    },
                    move |err| {
                        error!("Capture stream error: {}", err);
                    },
                    None,
                ) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(AppError::DeviceUnavailable(format!(
                            "failed to open input stream on '{}': {}",
                            device_name, e
                        ))));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AppError::DeviceUnavailable(format!(
                        "failed to start input stream on '{}': {}",
                        device_name, e
                    ))));
                    return;
                }

                info!(
                    "Audio capture started on '{}' at {} Hz mono",
                    device_name, sample_rate
                );
                let _ = ready_tx.send(Ok(()));

                // The stream lives as long as this thread; parking here keeps
                // the device acquired until stop() flips the flag.
                while !stop_for_thread.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(50));
                }

                drop(stream);
            })
            .map_err(|e| AppError::Internal(format!("failed to spawn capture thread: {}", e)))?;

        // Wait for the worker to either own a running stream or report why
        // it couldn't.
        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.worker = Some(CaptureWorker { stop, handle });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(AppError::DeviceUnavailable(
                    "capture worker exited before reporting readiness".to_string(),
                ))
            }
        }
    }

    /// Release the input device.
    ///
    /// Safe to call when not started, and safe to call repeatedly — teardown
    /// paths race each other and all of them call this.
    pub fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop.store(true, Ordering::Relaxed);
            let _ = worker.handle.join();
            info!("Audio capture stopped");
        }
    }

    /// Whether the device is currently acquired.
    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// stop() must be safe before start and however many times teardown
    /// triggers end up calling it.
    #[test]
    fn test_stop_is_idempotent_without_start() {
        let mut pipeline = CapturePipeline::new(24000);
        assert!(!pipeline.is_running());
        pipeline.stop();
        pipeline.stop();
        assert!(!pipeline.is_running());
    }
}
