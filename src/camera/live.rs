//! Live-imaging trigger and reader threads.
//!
//! Live mode puts the camera in software-trigger continuous cycling and runs
//! two cooperating threads: the *trigger* thread fires software triggers at
//! a computed interval, throttling if it runs too far ahead of retrieval,
//! and the *reader* thread queues a buffer, waits for it, converts it, and
//! publishes the result. The reader must always be stopped *before* the
//! trigger thread: with triggering gone, the reader would sit in a buffer
//! wait until its timeout with nothing to deliver.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use ism_buffer::IsmArray;
use parking_lot::Mutex;
use tracing::{error, warn};

use crate::camera::buffers::BufferFactory;
use crate::camera::driver::CameraDriver;
use crate::error::ScopeError;

/// Consecutive reader timeouts tolerated before live mode is declared
/// stalled.
const MAX_TIMEOUTS: u32 = 10;

/// How many frames the trigger thread may run ahead of the reader before it
/// throttles.
const MAX_TRIGGER_LEAD: u64 = 10;

/// State shared between the live threads and the camera.
pub(crate) struct LiveShared {
    /// Seconds between software triggers.
    interval_s: Mutex<f64>,
    /// Reader-side buffer wait timeout, in ms.
    reader_timeout_ms: AtomicU64,
    /// Triggers fired this live session.
    trigger_count: AtomicU64,
    /// Frames retrieved this live session.
    image_count: AtomicU64,
    /// Recent intervals between frame reads, for FPS reporting.
    latest_intervals: Mutex<VecDeque<f64>>,
    /// First fatal error hit by either thread.
    fatal: Mutex<Option<ScopeError>>,
}

impl LiveShared {
    fn new(interval_s: f64) -> Arc<Self> {
        let shared = Arc::new(Self {
            interval_s: Mutex::new(interval_s),
            reader_timeout_ms: AtomicU64::new(0),
            trigger_count: AtomicU64::new(0),
            image_count: AtomicU64::new(0),
            latest_intervals: Mutex::new(VecDeque::with_capacity(10)),
            fatal: Mutex::new(None),
        });
        shared.store_timeout(interval_s);
        shared
    }

    fn store_timeout(&self, interval_s: f64) {
        // triple the trigger interval plus a safety margin
        let timeout = 250 + (interval_s * 1000.0) as u64 * 3;
        self.reader_timeout_ms.store(timeout, Ordering::Relaxed);
    }

    /// Adopt a new trigger interval (exposure changed mid-live) and reset
    /// the FPS window.
    pub fn set_interval(&self, interval_s: f64) {
        *self.interval_s.lock() = interval_s;
        self.store_timeout(interval_s);
        self.latest_intervals.lock().clear();
    }

    /// Mean recent retrieval rate, or 0 before any frame arrived.
    pub fn fps(&self) -> f64 {
        let intervals = self.latest_intervals.lock();
        if intervals.is_empty() {
            return 0.0;
        }
        let mean: f64 = intervals.iter().sum::<f64>() / intervals.len() as f64;
        1.0 / mean
    }

    fn record_interval(&self, seconds: f64) {
        let mut intervals = self.latest_intervals.lock();
        if intervals.len() == 10 {
            intervals.pop_front();
        }
        intervals.push_back(seconds);
    }

    fn set_fatal(&self, error: ScopeError) {
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            *fatal = Some(error);
        }
    }
}

struct LiveThread {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl LiveThread {
    fn spawn(name: &str, mut body: impl FnMut(&AtomicBool) -> bool + Send + 'static) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while flag.load(Ordering::Relaxed) {
                    if !body(&flag) {
                        break;
                    }
                }
            })
            .ok();
        if handle.is_none() {
            error!(thread = name, "failed to spawn live-mode thread");
        }
        Self { running, handle }
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("live-mode thread panicked");
            }
        }
    }
}

/// Handles for one live-imaging session.
pub(crate) struct LiveMode {
    shared: Arc<LiveShared>,
    reader: LiveThread,
    trigger: LiveThread,
}

impl LiveMode {
    /// Start the reader and trigger threads. Does not return until the
    /// reader has queued its first buffer, so a trigger can never fire into
    /// an empty queue.
    pub fn start(
        driver: Arc<dyn CameraDriver>,
        mut factory: BufferFactory,
        interval_s: f64,
        mut publish: impl FnMut(Arc<IsmArray>, Option<u64>) + Send + 'static,
    ) -> Self {
        let shared = LiveShared::new(interval_s);

        let reader_shared = shared.clone();
        let reader_driver = driver.clone();
        let (ready_tx, ready_rx) = mpsc::channel::<()>();
        let mut ready_tx = Some(ready_tx);
        let mut timeout_count = 0u32;
        let reader = LiveThread::spawn("camera-live-reader", move |_running| {
            let started = Instant::now();
            if let Err(e) = factory.queue_if_needed() {
                reader_shared.set_fatal(e);
                return false;
            }
            if let Some(tx) = ready_tx.take() {
                let _ = tx.send(());
            }
            let timeout = reader_shared.reader_timeout_ms.load(Ordering::Relaxed);
            match reader_driver.wait_buffer(Some(timeout)) {
                Ok(raw) => match factory.convert_buffer(&raw) {
                    Ok((array, timestamp)) => {
                        publish(array, timestamp);
                        reader_shared.image_count.fetch_add(1, Ordering::Relaxed);
                        reader_shared.record_interval(started.elapsed().as_secs_f64());
                        timeout_count = 0;
                        true
                    }
                    Err(e) => {
                        reader_shared.set_fatal(e);
                        false
                    }
                },
                Err(e) if e.is_timeout() => {
                    // Timeouts here usually mean the trigger thread is being
                    // stopped. A long run of them means frames stopped
                    // flowing for some other reason.
                    timeout_count += 1;
                    if timeout_count > MAX_TIMEOUTS {
                        reader_shared.set_fatal(ScopeError::LiveRetrievalStalled);
                        return false;
                    }
                    true
                }
                Err(e) => {
                    reader_shared.set_fatal(ScopeError::Camera(e));
                    false
                }
            }
        });
        // don't hand out the session until a buffer is queued
        let _ = ready_rx.recv_timeout(Duration::from_secs(5));

        let trigger_shared = shared.clone();
        let trigger = LiveThread::spawn("camera-live-trigger", move |running| {
            let interval = Duration::from_secs_f64(*trigger_shared.interval_s.lock());
            std::thread::sleep(interval);
            let lead = trigger_shared
                .trigger_count
                .load(Ordering::Relaxed)
                .saturating_sub(trigger_shared.image_count.load(Ordering::Relaxed));
            if lead > MAX_TRIGGER_LEAD {
                while trigger_shared
                    .trigger_count
                    .load(Ordering::Relaxed)
                    .saturating_sub(trigger_shared.image_count.load(Ordering::Relaxed))
                    > 1
                {
                    if !running.load(Ordering::Relaxed) {
                        return false;
                    }
                    std::thread::sleep(interval);
                }
            }
            if let Err(e) = driver.command("SoftwareTrigger") {
                trigger_shared.set_fatal(ScopeError::Camera(e));
                return false;
            }
            trigger_shared.trigger_count.fetch_add(1, Ordering::Relaxed);
            true
        });

        Self {
            shared,
            reader,
            trigger,
        }
    }

    /// Shared live-session state (interval, FPS window, fatal slot).
    pub fn shared(&self) -> Arc<LiveShared> {
        self.shared.clone()
    }

    /// Stop both threads - reader strictly first - and surface any fatal
    /// error either of them recorded.
    pub fn stop(mut self) -> Option<ScopeError> {
        self.reader.stop();
        self.trigger.stop();
        self.shared.fatal.lock().take()
    }
}
