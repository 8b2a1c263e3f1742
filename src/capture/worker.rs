//! Capture loop running on its own thread
//!
//! The worker is the only owner of the device handle. It drives the
//! reconnect state machine, stamps frames, feeds the FPS window and pushes
//! into the shared buffer. Nothing a consumer does can reach back in here.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::{debug, info, info_span, trace, warn};

use crate::capture::device::{CaptureBackend, DeviceHandle, RawImage};
use crate::capture::frame::Frame;
use crate::capture::reconnect::{CaptureState, ReconnectPolicy};
use crate::error::DeviceError;
use crate::pipeline::{BoundedFrameBuffer, FpsTracker};
use crate::CaptureConfig;

/// State the worker publishes for consumers. Written by the worker only.
#[derive(Debug)]
pub struct WorkerShared {
    pub(crate) buffer: BoundedFrameBuffer,
    state: AtomicU8,
    fps_actual: AtomicU64,
    fps_nominal: AtomicU64,
    frames_captured: AtomicU64,
    frames_skipped: AtomicU64,
    connect_attempts: AtomicU64,
    read_failures: AtomicU64,
}

impl WorkerShared {
    pub fn new(buffer_capacity: usize) -> Self {
        Self {
            buffer: BoundedFrameBuffer::new(buffer_capacity),
            state: AtomicU8::new(CaptureState::Disconnected.as_u8()),
            fps_actual: AtomicU64::new(0f64.to_bits()),
            fps_nominal: AtomicU64::new(0f64.to_bits()),
            frames_captured: AtomicU64::new(0),
            frames_skipped: AtomicU64::new(0),
            connect_attempts: AtomicU64::new(0),
            read_failures: AtomicU64::new(0),
        }
    }

    pub fn buffer(&self) -> &BoundedFrameBuffer {
        &self.buffer
    }

    pub fn state(&self) -> CaptureState {
        CaptureState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn fps_actual(&self) -> f64 {
        f64::from_bits(self.fps_actual.load(Ordering::Relaxed))
    }

    /// Rate the device negotiated, 0 when unknown
    pub fn fps_nominal(&self) -> f64 {
        f64::from_bits(self.fps_nominal.load(Ordering::Relaxed))
    }

    pub fn frames_captured(&self) -> u64 {
        self.frames_captured.load(Ordering::Relaxed)
    }

    /// Reads discarded by the FPS throttle
    pub fn frames_skipped(&self) -> u64 {
        self.frames_skipped.load(Ordering::Relaxed)
    }

    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::Relaxed)
    }

    pub fn read_failures(&self) -> u64 {
        self.read_failures.load(Ordering::Relaxed)
    }

    fn set_state(&self, state: CaptureState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn set_fps_actual(&self, fps: f64) {
        self.fps_actual.store(fps.to_bits(), Ordering::Relaxed);
    }

    fn set_fps_nominal(&self, fps: f64) {
        self.fps_nominal.store(fps.to_bits(), Ordering::Relaxed);
    }
}

/// Channels tying a worker to its controller.
///
/// A message on `stop`, or the sender being dropped, ends the loop. `done`
/// is dropped by the worker after the device has been released.
pub struct WorkerSignals {
    pub stop: Receiver<()>,
    pub done: Sender<()>,
}

pub struct CaptureWorker<B: CaptureBackend> {
    // Declared first so it is released before `signals.done` on every exit path
    handle: Option<B::Handle>,
    backend: Arc<B>,
    config: CaptureConfig,
    shared: Arc<WorkerShared>,
    sequence: Arc<AtomicU64>,
    policy: ReconnectPolicy,
    fps: FpsTracker,
    next_due: Option<Instant>,
    stopping: bool,
    signals: WorkerSignals,
}

impl<B: CaptureBackend> CaptureWorker<B> {
    /// `sequence` holds the last id handed out and outlives the worker, so
    /// ids keep increasing across restarts.
    pub fn new(
        backend: Arc<B>,
        config: CaptureConfig,
        shared: Arc<WorkerShared>,
        sequence: Arc<AtomicU64>,
        signals: WorkerSignals,
    ) -> Self {
        let policy = ReconnectPolicy::new(config.reconnect_base_delay, config.reconnect_max_delay);
        let fps = FpsTracker::new(config.fps_window);
        Self {
            handle: None,
            backend,
            config,
            shared,
            sequence,
            policy,
            fps,
            next_due: None,
            stopping: false,
            signals,
        }
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("aquarium-capture".into())
            .spawn(move || self.run())
    }

    pub fn run(mut self) {
        let span = info_span!("capture", source = %self.config.source);
        let _enter = span.enter();

        if let Some(id) = self.config.capture_core {
            if core_affinity::set_for_current(core_affinity::CoreId { id }) {
                debug!("pinned capture worker to core {id}");
            } else {
                warn!("failed to pin capture worker to core {id}");
            }
        }

        info!("capture worker started");
        while !self.stop_requested() {
            match self.policy.state() {
                CaptureState::Streaming => self.read_once(),
                CaptureState::Disconnected | CaptureState::Backoff => self.connect(),
                CaptureState::Connecting | CaptureState::Stopped => break,
            }
        }
        info!(
            frames = self.shared.frames_captured(),
            "capture worker stopping"
        );
    }

    fn stop_requested(&mut self) -> bool {
        if !self.stopping {
            self.stopping = match self.signals.stop.try_recv() {
                Err(TryRecvError::Empty) => false,
                Ok(()) | Err(TryRecvError::Disconnected) => true,
            };
        }
        self.stopping
    }

    /// Sleep for `duration` unless a stop arrives first.
    fn wait(&mut self, duration: Duration) {
        if self.stopping {
            return;
        }
        self.stopping = match self.signals.stop.recv_timeout(duration) {
            Err(RecvTimeoutError::Timeout) => false,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        };
    }

    fn connect(&mut self) {
        self.policy.begin_connect(Instant::now());
        self.shared.set_state(CaptureState::Connecting);
        self.shared.connect_attempts.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("aquarium_connect_attempts_total").increment(1);

        let mut handle = match self
            .backend
            .open(&self.config.source, self.config.capture_resolution)
        {
            Ok(handle) => handle,
            Err(err) => return self.connect_failed(err),
        };

        // Streaming only counts once the device has delivered a usable frame
        let first = handle
            .read(self.config.read_timeout)
            .and_then(|raw| self.stamp(raw, Instant::now()));
        let frame = match first {
            Ok(frame) => frame,
            Err(err) => {
                drop(handle);
                return self.connect_failed(err);
            }
        };

        let nominal = handle.nominal_fps().unwrap_or(0.0);
        self.shared.set_fps_nominal(nominal);
        self.handle = Some(handle);
        self.policy.connected();
        self.shared.set_state(CaptureState::Streaming);
        info!(
            width = frame.width,
            height = frame.height,
            nominal_fps = nominal,
            "device streaming"
        );

        self.publish(frame);
    }

    fn connect_failed(&mut self, err: DeviceError) {
        let delay = self.policy.connect_failed();
        self.shared.set_state(CaptureState::Backoff);
        warn!(
            attempts = self.policy.attempts(),
            retry_in = ?delay,
            "failed to connect: {err}"
        );
        self.wait(delay);
    }

    fn read_once(&mut self) {
        let result = match self.handle.as_mut() {
            Some(handle) => handle.read(self.config.read_timeout),
            None => Err(DeviceError::Disconnected),
        };

        match result {
            Ok(raw) => self.on_frame(raw),
            Err(err) => self.read_failed(err),
        }
    }

    fn read_failed(&mut self, err: DeviceError) {
        // Release before backing off; the next connect reopens
        self.handle = None;
        self.fps.reset();
        self.shared.set_fps_actual(0.0);
        self.shared.read_failures.fetch_add(1, Ordering::Relaxed);
        self.next_due = None;

        let delay = self.policy.read_failed();
        self.shared.set_state(CaptureState::Backoff);
        warn!(retry_in = ?delay, "device read failed: {err}");
        self.wait(delay);
    }

    fn on_frame(&mut self, raw: RawImage) {
        let now = Instant::now();

        if let Some(due) = self.next_due {
            if now < due {
                // Faster than the target rate; only the freshest frame matters
                self.shared.frames_skipped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("aquarium_frames_skipped_total").increment(1);
                trace!("throttled read discarded");
                self.wait(due - now);
                return;
            }
        }

        match self.stamp(raw, now) {
            Ok(frame) => self.publish(frame),
            Err(err) => self.read_failed(err),
        }
    }

    /// Validate a raw image and give it the next sequence id.
    fn stamp(&self, raw: RawImage, now: Instant) -> Result<Frame, DeviceError> {
        let sequence = self.sequence.load(Ordering::Relaxed) + 1;
        let frame = Frame::new(raw.data, raw.width, raw.height, raw.format, now, sequence)?;
        self.sequence.store(sequence, Ordering::Relaxed);
        Ok(frame)
    }

    fn publish(&mut self, frame: Frame) {
        let now = frame.timestamp;
        let sequence = frame.sequence;

        self.fps.record(now);
        let fps = self.fps.current_fps();
        self.shared.set_fps_actual(fps);
        metrics::gauge!("aquarium_capture_fps").set(fps);

        self.shared.buffer.push(frame);
        self.shared.frames_captured.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("aquarium_frames_captured_total").increment(1);
        trace!(sequence, "frame captured");

        if let Some(interval) = self.config.frame_interval() {
            let next = match self.next_due {
                Some(due) if now.saturating_duration_since(due) < interval => {
                    due.checked_add(interval)
                }
                _ => now.checked_add(interval),
            };
            if next.is_none() {
                warn!(?interval, "frame interval overflows the clock; throttle disabled");
            }
            self.next_due = next;
        }
    }
}

impl<B: CaptureBackend> Drop for CaptureWorker<B> {
    fn drop(&mut self) {
        if self.handle.take().is_some() {
            debug!("device released");
        }
        self.policy.stop();
        self.shared.set_fps_actual(0.0);
        self.shared.set_state(CaptureState::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::PixelFormat;
    use crate::Resolution;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted backend: each entry answers one `open`.
    struct Scripted {
        opens: Mutex<VecDeque<Result<usize, DeviceError>>>,
    }

    struct ScriptedHandle {
        reads_left: usize,
    }

    impl CaptureBackend for Scripted {
        type Handle = ScriptedHandle;

        fn open(&self, source_id: &str, _: Resolution) -> Result<ScriptedHandle, DeviceError> {
            let next = self.opens.lock().unwrap().pop_front();
            match next {
                Some(Ok(reads_left)) => Ok(ScriptedHandle { reads_left }),
                Some(Err(err)) => Err(err),
                None => Err(DeviceError::Open {
                    source_id: source_id.into(),
                    reason: "script exhausted".into(),
                }),
            }
        }
    }

    impl DeviceHandle for ScriptedHandle {
        fn read(&mut self, _: Duration) -> Result<RawImage, DeviceError> {
            if self.reads_left == 0 {
                return Err(DeviceError::Disconnected);
            }
            self.reads_left -= 1;
            Ok(RawImage {
                data: vec![0; 2 * 2 * 3],
                width: 2,
                height: 2,
                format: PixelFormat::Rgb24,
            })
        }
    }

    fn worker(script: Vec<Result<usize, DeviceError>>) -> (CaptureWorker<Scripted>, Sender<()>) {
        let (stop_tx, stop_rx) = flume::bounded(1);
        let (done_tx, _done_rx) = flume::bounded(1);
        let config = CaptureConfig {
            reconnect_base_delay: Duration::from_millis(1),
            reconnect_max_delay: Duration::from_millis(4),
            ..Default::default()
        };
        let backend = Arc::new(Scripted {
            opens: Mutex::new(script.into()),
        });
        let worker = CaptureWorker::new(
            backend,
            config,
            Arc::new(WorkerShared::new(3)),
            Arc::new(AtomicU64::new(0)),
            WorkerSignals {
                stop: stop_rx,
                done: done_tx,
            },
        );
        (worker, stop_tx)
    }

    fn open_err() -> DeviceError {
        DeviceError::Open {
            source_id: "0".into(),
            reason: "busy".into(),
        }
    }

    #[test]
    fn test_connect_then_stream() {
        let (mut worker, _stop) = worker(vec![Ok(5)]);
        worker.connect();
        assert_eq!(worker.policy.state(), CaptureState::Streaming);
        assert_eq!(worker.shared.state(), CaptureState::Streaming);
        assert_eq!(worker.shared.buffer.pop_latest().unwrap().sequence, 1);

        worker.read_once();
        assert_eq!(worker.shared.buffer.pop_latest().unwrap().sequence, 2);
        assert_eq!(worker.shared.frames_captured(), 2);
    }

    #[test]
    fn test_failed_opens_escalate_then_reset() {
        let (mut worker, _stop) = worker(vec![Err(open_err()), Err(open_err()), Ok(1)]);

        worker.connect();
        assert_eq!(worker.policy.attempts(), 1);
        assert_eq!(worker.shared.state(), CaptureState::Backoff);

        worker.connect();
        assert_eq!(worker.policy.attempts(), 2);

        worker.connect();
        assert_eq!(worker.policy.attempts(), 0);
        assert!(worker.shared.state().is_live());
    }

    #[test]
    fn test_first_read_failure_counts_as_failed_connect() {
        let (mut worker, _stop) = worker(vec![Ok(0)]);
        worker.connect();
        assert_eq!(worker.policy.attempts(), 1);
        assert!(worker.handle.is_none());
        assert!(worker.shared.buffer.pop_latest().is_none());
    }

    #[test]
    fn test_read_failure_releases_handle() {
        let (mut worker, _stop) = worker(vec![Ok(1)]);
        worker.connect();
        assert!(worker.handle.is_some());

        worker.read_once();
        assert!(worker.handle.is_none());
        assert_eq!(worker.shared.state(), CaptureState::Backoff);
        assert_eq!(worker.shared.read_failures(), 1);
        assert_eq!(worker.shared.fps_actual(), 0.0);
    }

    #[test]
    fn test_throttle_discards_early_reads() {
        let (mut worker, _stop) = worker(vec![Ok(10)]);
        worker.config.target_fps = Some(5.0);
        worker.connect();

        // 200ms interval, so this read arrives early
        worker.read_once();
        assert_eq!(worker.shared.frames_captured(), 1);
        assert_eq!(worker.shared.frames_skipped(), 1);

        // The discard waited out the interval, so the next read is kept
        worker.read_once();
        assert_eq!(worker.shared.frames_captured(), 2);
    }

    #[test]
    fn test_stop_signal_ends_run() {
        let (worker, stop) = worker(vec![Ok(usize::MAX)]);
        let shared = Arc::clone(&worker.shared);
        stop.send(()).unwrap();
        worker.run();
        assert_eq!(shared.state(), CaptureState::Stopped);
    }

    #[test]
    fn test_garbage_first_frame_fails_connect() {
        struct Garbage;
        struct GarbageHandle;
        impl CaptureBackend for Garbage {
            type Handle = GarbageHandle;
            fn open(&self, _: &str, _: Resolution) -> Result<GarbageHandle, DeviceError> {
                Ok(GarbageHandle)
            }
        }
        impl DeviceHandle for GarbageHandle {
            fn read(&mut self, _: Duration) -> Result<RawImage, DeviceError> {
                Ok(RawImage {
                    data: vec![1, 2],
                    width: 4,
                    height: 4,
                    format: PixelFormat::Rgb24,
                })
            }
        }

        let (stop_tx, stop_rx) = flume::bounded(1);
        let (done_tx, _done_rx) = flume::bounded(1);
        let shared = Arc::new(WorkerShared::new(2));
        let sequence = Arc::new(AtomicU64::new(0));
        let mut worker = CaptureWorker::new(
            Arc::new(Garbage),
            CaptureConfig {
                reconnect_base_delay: Duration::from_millis(1),
                reconnect_max_delay: Duration::from_millis(8),
                ..Default::default()
            },
            Arc::clone(&shared),
            Arc::clone(&sequence),
            WorkerSignals {
                stop: stop_rx,
                done: done_tx,
            },
        );

        let mut attempts = Vec::new();
        for _ in 0..4 {
            worker.connect();
            attempts.push((worker.policy.attempts(), worker.policy.delay()));
        }
        assert!(shared.buffer.pop_latest().is_none());
        assert_eq!(sequence.load(Ordering::Relaxed), 0);
        assert_eq!(shared.state(), CaptureState::Backoff);
        assert!(worker.handle.is_none());

        // A device that only produces garbage backs off like one that never opens
        let ms = Duration::from_millis;
        assert_eq!(
            attempts,
            vec![(1, ms(2)), (2, ms(4)), (3, ms(8)), (4, ms(8))]
        );
        drop(stop_tx);
    }

    #[test]
    fn test_throttle_survives_slowest_rate() {
        let (mut worker, _stop) = worker(vec![Ok(3)]);
        worker.config.target_fps = Some(crate::MIN_TARGET_FPS);
        worker.connect();
        assert_eq!(worker.shared.frames_captured(), 1);

        let due = worker.next_due.unwrap();
        let interval = due.duration_since(worker.shared.buffer.pop_latest().unwrap().timestamp);
        assert_eq!(interval, Duration::from_secs(1000));
        assert_eq!(worker.shared.state(), CaptureState::Streaming);
    }
}
