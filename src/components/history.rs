use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::canvas::{Layer, LayerId, LayerStack, LayerStackEvent};

pub const DEFAULT_MAX_HISTORY: usize = 50;
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);
pub const DEFAULT_SETTLE: Duration = Duration::from_millis(50);

// ============================================================================
// SNAPSHOT
// ============================================================================

/// A recorded state of the layer stack.  Layers are cloned; their rasters
/// are immutable and shared, so the copy is independent of later edits.
#[derive(Clone, Debug)]
pub struct HistorySnapshot {
    pub layers: Vec<Layer>,
    pub active_layer_id: Option<LayerId>,
    pub timestamp: Instant,
}

impl HistorySnapshot {
    /// True if `layers` would be a new history entry relative to this one.
    pub fn differs_from(&self, layers: &[Layer]) -> bool {
        self.layers.len() != layers.len()
            || self
                .layers
                .iter()
                .zip(layers)
                .any(|(a, b)| a.differs_from(b))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HistoryState {
    Idle,
    /// A change is waiting for its debounce window to close.
    Recording,
    /// An undo/redo restore is settling; changes are not recorded.
    TimeTraveling,
}

// ============================================================================
// HISTORY MANAGER: debounced snapshot stacks
// ============================================================================

/// Undo/redo over whole-stack snapshots.
///
/// Driven entirely by the instants passed in, so it has no timers of its
/// own: `notify_change` opens (or restarts) the debounce window and `poll`
/// records once it has closed.  `past.back()` is always the current state.
pub struct HistoryManager {
    past: VecDeque<HistorySnapshot>,
    future: Vec<HistorySnapshot>,
    max_history: usize,
    debounce: Duration,
    settle: Duration,
    pending_until: Option<Instant>,
    time_travel_until: Option<Instant>,
    /// Change events at or below this stack version came from a restore.
    restored_version: u64,
}

impl Default for HistoryManager {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HISTORY, DEFAULT_DEBOUNCE, DEFAULT_SETTLE)
    }
}

impl HistoryManager {
    pub fn new(max_history: usize, debounce: Duration, settle: Duration) -> Self {
        Self {
            past: VecDeque::new(),
            future: Vec::new(),
            max_history: max_history.max(2),
            debounce,
            settle,
            pending_until: None,
            time_travel_until: None,
            restored_version: 0,
        }
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    pub fn is_time_traveling(&self, now: Instant) -> bool {
        self.time_travel_until.is_some_and(|until| now < until)
    }

    pub fn state(&self, now: Instant) -> HistoryState {
        if self.is_time_traveling(now) {
            HistoryState::TimeTraveling
        } else if self.pending_until.is_some() {
            HistoryState::Recording
        } else {
            HistoryState::Idle
        }
    }

    /// When the pending recording is due, if one is.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending_until
    }

    /// The stack changed.  Cancels any pending recording and starts a fresh
    /// debounce window.  Ignored while a restore is settling.
    pub fn notify_change(&mut self, now: Instant) -> bool {
        if self.is_time_traveling(now) {
            return false;
        }
        self.pending_until = Some(now + self.debounce);
        true
    }

    /// Record `layers` if the debounce window has closed.  Returns whether a
    /// snapshot was pushed.
    pub fn poll(&mut self, now: Instant, layers: &[Layer], active_layer_id: Option<LayerId>) -> bool {
        match self.pending_until {
            Some(due) if now >= due => {
                self.pending_until = None;
                if self.is_time_traveling(now) {
                    return false;
                }
                self.record_if_changed(layers, active_layer_id, now)
            }
            _ => false,
        }
    }

    /// Push a snapshot unless it matches the current one.  Clears the redo
    /// stack and evicts the oldest entry past the bound.
    pub fn record_if_changed(&mut self, layers: &[Layer], active_layer_id: Option<LayerId>, now: Instant) -> bool {
        if let Some(current) = self.past.back()
            && !current.differs_from(layers)
        {
            return false;
        }
        self.past.push_back(HistorySnapshot {
            layers: layers.to_vec(),
            active_layer_id,
            timestamp: now,
        });
        while self.past.len() > self.max_history {
            self.past.pop_front();
        }
        self.future.clear();
        crate::log_info!("History: recorded snapshot ({} layers, {} in past)", layers.len(), self.past.len());
        true
    }

    /// Step back.  Returns the snapshot to restore, or `None` when there is
    /// no earlier state.
    pub fn undo(&mut self, now: Instant) -> Option<HistorySnapshot> {
        if self.past.len() < 2 {
            return None;
        }
        let current = self.past.pop_back()?;
        self.future.push(current);
        self.begin_time_travel(now);
        crate::log_info!("History: undo ({} past, {} future)", self.past.len(), self.future.len());
        self.past.back().cloned()
    }

    pub fn redo(&mut self, now: Instant) -> Option<HistorySnapshot> {
        let next = self.future.pop()?;
        self.past.push_back(next);
        self.begin_time_travel(now);
        crate::log_info!("History: redo ({} past, {} future)", self.past.len(), self.future.len());
        self.past.back().cloned()
    }

    fn begin_time_travel(&mut self, now: Instant) {
        self.pending_until = None;
        self.time_travel_until = Some(now + self.settle);
    }

    /// Ignore change events up to and including stack `version`.
    pub fn suppress_through(&mut self, version: u64) {
        self.restored_version = self.restored_version.max(version);
    }

    pub fn is_suppressed(&self, version: u64) -> bool {
        version <= self.restored_version
    }

    pub fn can_undo(&self) -> bool {
        self.past.len() >= 2
    }

    pub fn can_redo(&self) -> bool {
        !self.future.is_empty()
    }

    pub fn past_len(&self) -> usize {
        self.past.len()
    }

    pub fn future_len(&self) -> usize {
        self.future.len()
    }

    pub fn current(&self) -> Option<&HistorySnapshot> {
        self.past.back()
    }

    /// Oldest retained snapshot.
    pub fn oldest(&self) -> Option<&HistorySnapshot> {
        self.past.front()
    }

    /// Forget everything; a new image or project replaced the old one.
    pub fn reset(&mut self) {
        self.past.clear();
        self.future.clear();
        self.pending_until = None;
        self.time_travel_until = None;
    }
}

// ============================================================================
// HISTORY RECORDER: event-channel driver
// ============================================================================

/// Owns a background thread that consumes stack change events and feeds a
/// shared [`HistoryManager`], coalescing bursts into one snapshot.
pub struct HistoryRecorder {
    manager: Arc<Mutex<HistoryManager>>,
    sender: Sender<LayerStackEvent>,
    worker: Option<JoinHandle<()>>,
}

impl HistoryRecorder {
    pub fn spawn(manager: HistoryManager) -> Self {
        let manager = Arc::new(Mutex::new(manager));
        let (sender, receiver) = mpsc::channel();
        let shared = Arc::clone(&manager);
        let worker = std::thread::Builder::new()
            .name("history-recorder".to_string())
            .spawn(move || record_loop(shared, receiver))
            .map_err(|e| crate::log_err!("Failed to start history recorder: {}", e))
            .ok();
        Self { manager, sender, worker }
    }

    /// Subscribe the recorder to `stack` and record its current state as the
    /// first snapshot.
    pub fn attach(&self, stack: &mut LayerStack) {
        stack.subscribe(self.sender.clone());
        self.lock()
            .record_if_changed(stack.layers(), stack.active_layer_id(), Instant::now());
    }

    pub fn lock(&self) -> MutexGuard<'_, HistoryManager> {
        lock_manager(&self.manager)
    }

    pub fn can_undo(&self) -> bool {
        self.lock().can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.lock().can_redo()
    }

    pub fn undo(&self, stack: &mut LayerStack) -> bool {
        let snapshot = self.lock().undo(Instant::now());
        self.restore(stack, snapshot)
    }

    pub fn redo(&self, stack: &mut LayerStack) -> bool {
        let snapshot = self.lock().redo(Instant::now());
        self.restore(stack, snapshot)
    }

    fn restore(&self, stack: &mut LayerStack, snapshot: Option<HistorySnapshot>) -> bool {
        let Some(snapshot) = snapshot else {
            return false;
        };
        // Suppress the restore's own change event before it is published.
        self.lock().suppress_through(stack.version() + 1);
        stack.restore_layers(snapshot.layers, snapshot.active_layer_id);
        true
    }
}

impl Drop for HistoryRecorder {
    fn drop(&mut self) {
        let _ = self.sender.send(LayerStackEvent::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn lock_manager(manager: &Mutex<HistoryManager>) -> MutexGuard<'_, HistoryManager> {
    manager.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn record_loop(manager: Arc<Mutex<HistoryManager>>, receiver: Receiver<LayerStackEvent>) {
    let mut latest: Option<(Arc<Vec<Layer>>, Option<LayerId>)> = None;
    loop {
        let deadline = lock_manager(&manager).next_deadline();
        let event = match deadline {
            Some(due) => receiver.recv_timeout(due.saturating_duration_since(Instant::now())),
            None => receiver.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match event {
            Ok(LayerStackEvent::Changed { version, layers, active_layer_id }) => {
                let mut m = lock_manager(&manager);
                if !m.is_suppressed(version) && m.notify_change(Instant::now()) {
                    latest = Some((layers, active_layer_id));
                }
            }
            Ok(LayerStackEvent::Reset) => {
                lock_manager(&manager).reset();
                latest = None;
            }
            Ok(LayerStackEvent::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        if let Some((layers, active)) = &latest {
            let mut m = lock_manager(&manager);
            m.poll(Instant::now(), layers, *active);
            if m.next_deadline().is_none() {
                latest = None;
            }
        }
    }
}
