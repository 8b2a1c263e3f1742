//! Consumer-facing capture facade

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::thread::JoinHandle;

use arc_swap::ArcSwapOption;
use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::{info, warn};

use crate::capture::worker::{CaptureWorker, WorkerShared, WorkerSignals};
use crate::capture::{resize_frame, CaptureBackend, CaptureState, Frame};
use crate::error::CaptureError;
use crate::pipeline::{BoundedFrameBuffer, BufferStats};
use crate::CaptureConfig;

/// Counters describing the current (or last) capture run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub frames_captured: u64,
    pub frames_skipped: u64,
    pub connect_attempts: u64,
    pub read_failures: u64,
    pub buffer: BufferStats,
}

struct Running {
    stop_tx: Sender<()>,
    done_rx: Receiver<()>,
    thread: JoinHandle<()>,
}

/// Webcam capture with a background worker and pull-based accessors.
///
/// `start` spawns the worker, `stop` shuts it down and waits (bounded by
/// `stop_timeout`) for the device to be released. The `get_*` and metric
/// accessors take `&self`, never block, and may be called from any number
/// of threads while the worker runs.
///
/// Device failures never surface here as errors: frames just stop
/// arriving, `is_live()` turns false, and capture resumes on its own once
/// the device comes back.
pub struct WebcamCapture<B: CaptureBackend> {
    backend: Arc<B>,
    config: CaptureConfig,
    shared: Arc<WorkerShared>,
    /// Last sequence id handed out, kept across restarts
    sequence: Arc<AtomicU64>,
    inference_cache: ArcSwapOption<Frame>,
    running: Option<Running>,
}

impl<B: CaptureBackend> WebcamCapture<B> {
    pub fn new(backend: B) -> Self {
        let config = CaptureConfig::default();
        Self {
            backend: Arc::new(backend),
            shared: Arc::new(WorkerShared::new(config.buffer_capacity)),
            config,
            sequence: Arc::new(AtomicU64::new(0)),
            inference_cache: ArcSwapOption::empty(),
            running: None,
        }
    }

    /// Validate `config` and spawn the capture worker.
    ///
    /// # Errors
    /// * `CaptureError::AlreadyStarted` - the worker is still running
    /// * `CaptureError::Config` - a resolution, rate, capacity or delay is out of range
    /// * `CaptureError::Spawn` - the OS refused to create the worker thread
    pub fn start(&mut self, config: CaptureConfig) -> Result<(), CaptureError> {
        if self.is_running() {
            return Err(CaptureError::AlreadyStarted);
        }
        config.validate()?;

        // A worker that died on its own still needs joining
        self.stop();

        if config.upscales_for_inference() {
            warn!(
                capture = %config.capture_resolution,
                inference = %config.inference_resolution,
                "inference frames will be upscaled from the capture resolution"
            );
        }

        let shared = Arc::new(WorkerShared::new(config.buffer_capacity));
        let (stop_tx, stop_rx) = flume::bounded(1);
        let (done_tx, done_rx) = flume::bounded(0);
        let worker = CaptureWorker::new(
            Arc::clone(&self.backend),
            config.clone(),
            Arc::clone(&shared),
            Arc::clone(&self.sequence),
            WorkerSignals {
                stop: stop_rx,
                done: done_tx,
            },
        );
        let thread = worker.spawn()?;

        info!(
            source = %config.source,
            capture = %config.capture_resolution,
            inference = %config.inference_resolution,
            target_fps = ?config.target_fps,
            "capture started"
        );

        self.shared = shared;
        self.config = config;
        self.inference_cache.store(None);
        self.running = Some(Running {
            stop_tx,
            done_rx,
            thread,
        });
        Ok(())
    }

    /// Stop the worker and wait up to `stop_timeout` for it to release the device.
    ///
    /// Returns false if the worker did not confirm in time; it is then left
    /// to finish on its own. Calling this when nothing runs is a no-op that
    /// returns true.
    pub fn stop(&mut self) -> bool {
        let Some(running) = self.running.take() else {
            return true;
        };

        let _ = running.stop_tx.try_send(());
        drop(running.stop_tx);

        match running.done_rx.recv_timeout(self.config.stop_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if running.thread.join().is_err() {
                    warn!("capture worker panicked");
                }
                info!("capture stopped");
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "capture worker did not stop within {:?}; detaching",
                    self.config.stop_timeout
                );
                false
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| !running.thread.is_finished())
    }

    /// Latest frame at capture resolution, `None` until the first frame arrives.
    pub fn get_frame(&self) -> Option<Arc<Frame>> {
        self.shared.buffer.pop_latest()
    }

    /// Latest frame resampled to `inference_resolution`.
    ///
    /// Resampling happens here, on the caller's thread, and the result is
    /// memoised until a newer frame is captured.
    pub fn get_inference_frame(&self) -> Option<Arc<Frame>> {
        let frame = self.get_frame()?;
        let target = self.config.inference_resolution;

        if let Some(cached) = self.inference_cache.load_full() {
            if cached.sequence == frame.sequence
                && cached.width == target.width
                && cached.height == target.height
            {
                return Some(cached);
            }
        }

        match resize_frame(&frame, target) {
            Ok(resized) => {
                let resized = Arc::new(resized);
                self.inference_cache.store(Some(Arc::clone(&resized)));
                Some(resized)
            }
            Err(err) => {
                warn!(sequence = frame.sequence, "failed to resize frame: {err}");
                None
            }
        }
    }

    /// True while the device is open and delivering frames
    pub fn is_live(&self) -> bool {
        self.shared.state().is_live()
    }

    pub fn capture_state(&self) -> CaptureState {
        self.shared.state()
    }

    /// Achieved capture rate over the rolling window, 0 when unknown
    pub fn fps_actual(&self) -> f64 {
        self.shared.fps_actual()
    }

    /// Configured target rate, else the rate the device negotiated, else 0
    pub fn fps_target(&self) -> f64 {
        self.config
            .target_fps
            .unwrap_or_else(|| self.shared.fps_nominal())
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            frames_captured: self.shared.frames_captured(),
            frames_skipped: self.shared.frames_skipped(),
            connect_attempts: self.shared.connect_attempts(),
            read_failures: self.shared.read_failures(),
            buffer: self.shared.buffer.stats(),
        }
    }

    pub fn buffer(&self) -> &BoundedFrameBuffer {
        &self.shared.buffer
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }
}

impl<B: CaptureBackend> Drop for WebcamCapture<B> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<B: CaptureBackend> std::fmt::Debug for WebcamCapture<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebcamCapture")
            .field("config", &self.config)
            .field("state", &self.capture_state())
            .field("is_running", &self.is_running())
            .finish_non_exhaustive()
    }
}
