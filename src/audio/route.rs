//! Output route watching
//!
//! Detects a lost output path from two independent signals:
//! 1. the enumerable output-device count shrinking (polled; cpal has no
//!    portable hotplug notification)
//! 2. the keep-alive stream reporting itself dead (`PlaybackInterrupted`,
//!    raised by the engine's stream-error hook)
//!
//! Both are edge-triggered and only meaningful while armed. The watcher
//! keeps refreshing its baseline snapshot and route label even when
//! disarmed, so the UI's route readout stays current between sessions.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::device;

/// Default enumeration poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A route-loss signal, tagged with the channel that observed it so alarms
/// stay attributable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RouteEvent {
    /// The enumerable output count shrank while armed.
    DeviceCountDropped { previous: usize, current: usize },
    /// The continuous-playback stream was suspended or died.
    PlaybackInterrupted,
}

/// Snapshot state shared between the poll thread, the controller and the
/// UI-facing handle.
pub struct RouteShared {
    armed: AtomicBool,
    baseline: Mutex<Option<usize>>,
    label: RwLock<String>,
}

impl RouteShared {
    pub fn new() -> Self {
        Self {
            armed: AtomicBool::new(false),
            baseline: Mutex::new(None),
            label: RwLock::new("Initializing...".to_string()),
        }
    }

    pub fn label(&self) -> String {
        self.label.read().clone()
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    pub fn last_count(&self) -> Option<usize> {
        *self.baseline.lock()
    }
}

impl Default for RouteShared {
    fn default() -> Self {
        Self::new()
    }
}

/// Fold one enumeration outcome into the shared snapshot.
///
/// Always refreshes the label; a successful count always becomes the new
/// baseline. Emits at most one event per downward transition, and only
/// while armed. Enumeration failure degrades the label but never fires and
/// never touches the baseline.
pub fn apply_observation(
    shared: &RouteShared,
    enumeration: Result<usize, String>,
) -> Option<RouteEvent> {
    *shared.label.write() = device::route_label(&enumeration);

    let count = match enumeration {
        Ok(count) => count,
        Err(e) => {
            log::debug!("Output enumeration failed: {}", e);
            return None;
        }
    };

    let mut baseline = shared.baseline.lock();
    let event = match *baseline {
        Some(previous) if shared.armed.load(Ordering::SeqCst) && count < previous => {
            Some(RouteEvent::DeviceCountDropped {
                previous,
                current: count,
            })
        }
        _ => None,
    };
    *baseline = Some(count);
    event
}

/// Callback invoked on the poll thread when a loss edge is observed.
pub type RouteNotify = Arc<dyn Fn(RouteEvent) + Send + Sync>;

/// Polling watcher over the output-device set.
pub struct RouteWatcher {
    shared: Arc<RouteShared>,
    notify: RouteNotify,
    stop_tx: mpsc::SyncSender<()>,
    thread: Option<JoinHandle<()>>,
}

impl RouteWatcher {
    /// Start the poll thread. `shared` is created by the caller so the
    /// UI-facing handle can read the label without going through the
    /// watcher.
    pub fn spawn(
        shared: Arc<RouteShared>,
        poll_interval: Duration,
        notify: RouteNotify,
    ) -> Self {
        let (stop_tx, stop_rx) = mpsc::sync_channel::<()>(1);
        let poll_shared = Arc::clone(&shared);
        let poll_notify = Arc::clone(&notify);

        let thread = thread::spawn(move || {
            log::debug!("Route watcher polling every {:?}", poll_interval);
            loop {
                match stop_rx.recv_timeout(poll_interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let enumeration = device::output_device_count();
                        if let Some(event) = apply_observation(&poll_shared, enumeration) {
                            log::warn!("Route watcher: {:?}", event);
                            (poll_notify)(event);
                        }
                    }
                    _ => break,
                }
            }
        });

        Self {
            shared,
            notify,
            stop_tx,
            thread: Some(thread),
        }
    }

    /// Reset the baseline from a fresh enumeration, then enable loss
    /// detection. The reset happens while still disarmed so arming can
    /// never fire an event by itself.
    pub fn arm(&self) {
        let _ = apply_observation(&self.shared, device::output_device_count());
        self.shared.armed.store(true, Ordering::SeqCst);
        log::info!(
            "Route watcher armed (baseline: {:?})",
            self.shared.last_count()
        );
    }

    pub fn disarm(&self) {
        self.shared.armed.store(false, Ordering::SeqCst);
        log::debug!("Route watcher disarmed");
    }

    /// On-demand re-enumeration. Updates label and baseline; may emit a
    /// loss event if armed and the count dropped.
    pub fn refresh(&self) -> String {
        let enumeration = device::output_device_count();
        if let Some(event) = apply_observation(&self.shared, enumeration) {
            log::warn!("Route refresh: {:?}", event);
            (self.notify)(event);
        }
        self.shared.label()
    }

    pub fn shared(&self) -> Arc<RouteShared> {
        Arc::clone(&self.shared)
    }

    fn stop(&mut self) {
        if let Some(handle) = self.thread.take() {
            let _ = self.stop_tx.send(());
            let _ = handle.join();
        }
    }
}

impl Drop for RouteWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
