use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{DeviceApi, DeviceClientBuilder};
use crate::config::DeviceConfig;
use crate::diff::StateDiff;
use crate::protocol::SetCommand;
use crate::queue::{CommandQueue, QueueEvent};
use crate::state::{DeviceState, StateListener};
use crate::types::{StatusRecord, Switch};
use crate::Result;

/// Result of the most recent polls.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub last_status: Option<StatusRecord>,
    pub fetched_at: Option<Instant>,
    pub ttl: Duration,
    pub consecutive_failed_polls: u32,
}

impl CacheEntry {
    fn new(ttl: Duration) -> Self {
        Self {
            last_status: None,
            fetched_at: None,
            ttl,
            consecutive_failed_polls: 0,
        }
    }

    pub fn is_fresh(&self) -> bool {
        self.fetched_at.is_some_and(|at| at.elapsed() < self.ttl)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Refresh,
    QuickRefresh,
}

struct TimerSlot {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Pending timers, at most one per kind.
#[derive(Default)]
struct TimerArena {
    next_generation: u64,
    refresh: Option<TimerSlot>,
    quick_refresh: Option<TimerSlot>,
}

impl TimerArena {
    fn slot(&mut self, kind: TimerKind) -> &mut Option<TimerSlot> {
        match kind {
            TimerKind::Refresh => &mut self.refresh,
            TimerKind::QuickRefresh => &mut self.quick_refresh,
        }
    }

    /// Forget a slot that fired, unless it was replaced meanwhile.
    fn release(&mut self, kind: TimerKind, generation: u64) {
        let slot = self.slot(kind);
        if slot.as_ref().is_some_and(|s| s.generation == generation) {
            *slot = None;
        }
    }

    fn abort_all(&mut self) {
        for slot in [self.refresh.take(), self.quick_refresh.take()].into_iter().flatten() {
            slot.handle.abort();
        }
    }
}

/// Owns the canonical state of one device and keeps it converged with the
/// device: scheduled polling with degradation, diff-based commands through
/// a [`CommandQueue`], and a quick re-poll after every executed command.
///
/// Cheap to clone; all clones drive the same device.
#[derive(Clone)]
pub struct DeviceManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: DeviceConfig,
    device: Arc<dyn DeviceApi>,
    queue: CommandQueue,
    state: Mutex<DeviceState>,
    listeners: Mutex<Vec<StateListener>>,
    cache: Mutex<CacheEntry>,
    polling: AtomicBool,
    timers: Mutex<TimerArena>,
    event_listener: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

struct PollGuard<'a>(&'a AtomicBool);

impl Drop for PollGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl DeviceManager {
    /// Build a manager talking UDP to `config.host`. Must be called inside
    /// a Tokio runtime.
    pub fn from_config(config: DeviceConfig) -> Result<Self> {
        let client = DeviceClientBuilder::from_config(config.clone()).build()?;
        Ok(Self::new(config, Arc::new(client)))
    }

    /// Must be called inside a Tokio runtime.
    pub fn new(config: DeviceConfig, device: Arc<dyn DeviceApi>) -> Self {
        let queue = CommandQueue::new(device.clone(), config.retry);
        let events = queue.subscribe();
        let inner = Arc::new(ManagerInner {
            state: Mutex::new(DeviceState::with_config(&config)),
            listeners: Mutex::new(Vec::new()),
            cache: Mutex::new(CacheEntry::new(config.cache_ttl())),
            config,
            device,
            queue,
            polling: AtomicBool::new(false),
            timers: Mutex::new(TimerArena::default()),
            event_listener: Mutex::new(None),
            cancel: CancellationToken::new(),
        });

        let listener = tokio::spawn(listen_for_queue_events(Arc::downgrade(&inner), events));
        *inner.event_listener.lock() = Some(listener);

        Self { inner }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.inner.config
    }

    /// Begin polling immediately.
    pub fn start(&self) {
        debug!(host = %self.inner.config.host, "starting device polling");
        self.schedule(TimerKind::Refresh, Duration::ZERO);
    }

    /// A copy of the canonical state. Mutate it and hand it to
    /// [`apply_state_to_device`](Self::apply_state_to_device).
    pub fn device_state(&self) -> DeviceState {
        self.inner.state.lock().clone()
    }

    /// Borrow the canonical state without copying it.
    pub fn with_device_state<R>(&self, read: impl FnOnce(&DeviceState) -> R) -> R {
        let state = self.inner.state.lock();
        read(&state)
    }

    /// Register a change listener on the canonical state. Listeners get a
    /// snapshot after the state lock is released, so they may call back
    /// into the manager.
    pub fn subscribe(&self, listener: impl Fn(&DeviceState) + Send + Sync + 'static) {
        self.inner.listeners.lock().push(Arc::new(listener));
    }

    pub fn queue_events(&self) -> tokio::sync::broadcast::Receiver<QueueEvent> {
        self.inner.queue.subscribe()
    }

    pub fn is_available(&self) -> bool {
        self.inner.device.is_available()
    }

    pub fn cache_entry(&self) -> CacheEntry {
        self.inner.cache.lock().clone()
    }

    /// Poll the device and merge the result. If a poll is already running,
    /// returns the current state without starting another one. The next
    /// poll is always rescheduled, at the degraded interval after too many
    /// consecutive failures.
    pub async fn update_device_state(&self, quick: bool) -> DeviceState {
        if self.inner.polling.swap(true, Ordering::SeqCst) {
            debug!(quick, "poll already in flight");
            return self.device_state();
        }
        let guard = PollGuard(&self.inner.polling);

        if self.inner.cancel.is_cancelled() {
            return self.device_state();
        }

        match self.inner.device.update_state().await {
            Ok(status) => {
                self.update_canonical(|state| state.ingest_wire_status(&status));
                let mut cache = self.inner.cache.lock();
                if cache.consecutive_failed_polls >= self.inner.config.failed_polls_threshold {
                    info!(host = %self.inner.config.host, "device answering again, resuming normal polling");
                }
                cache.consecutive_failed_polls = 0;
                cache.last_status = Some(status);
                cache.fetched_at = Some(Instant::now());
            }
            Err(e) => {
                let mut cache = self.inner.cache.lock();
                cache.consecutive_failed_polls += 1;
                let failures = cache.consecutive_failed_polls;
                if failures == self.inner.config.failed_polls_threshold {
                    warn!(failures, error = %e, "switching to degraded polling");
                } else {
                    debug!(failures, quick, error = %e, "poll failed");
                }
            }
        }

        drop(guard);
        self.schedule_refresh();
        self.device_state()
    }

    /// Re-arm the regular poll timer, replacing any pending one.
    pub fn schedule_refresh(&self) {
        let degraded = self.inner.cache.lock().consecutive_failed_polls
            >= self.inner.config.failed_polls_threshold;
        let delay = if degraded {
            self.inner.config.degraded_poll_interval()
        } else {
            self.inner.config.poll_interval()
        };
        self.schedule(TimerKind::Refresh, delay);
    }

    /// Arm a short-delay poll, replacing any pending quick refresh.
    pub fn schedule_quick_refresh(&self) {
        self.schedule(TimerKind::QuickRefresh, self.inner.config.quick_refresh_delay());
    }

    /// Send whatever it takes to move the device from the canonical state
    /// to `desired`. Consumes `desired`'s sleep-clear request. Resolves once
    /// the command executed; the canonical state then adopts `desired`,
    /// except for disabled features, which were not sent.
    pub async fn apply_state_to_device(&self, desired: &mut DeviceState) -> Result<()> {
        let force_sleep_clear = desired.take_force_sleep_clear();

        let command = {
            let canonical = self.inner.state.lock();
            let diff = canonical.diff(desired);
            match self.build_command(diff, desired, &canonical, force_sleep_clear) {
                Some(command) => command,
                None => {
                    debug!("desired state matches device, nothing to send");
                    return Ok(());
                }
            }
        };

        debug!(?command, "enqueueing command");
        self.inner.queue.enqueue_command(command).await?;
        let features = self.inner.config.features;
        self.update_canonical(|state| state.ingest_accepted_snapshot(desired, features));
        Ok(())
    }

    /// Stop polling and command execution and close the device connection.
    /// Safe to call repeatedly.
    pub fn cleanup(&self) {
        if !self.inner.cancel.is_cancelled() {
            debug!(host = %self.inner.config.host, "cleaning up device manager");
        }
        self.inner.cancel.cancel();
        self.inner.timers.lock().abort_all();
        if let Some(listener) = self.inner.event_listener.lock().take() {
            listener.abort();
        }
        self.inner.queue.shutdown();
        self.inner.device.cleanup();
    }

    // -- Helpers --

    /// Mutate the canonical state, then notify listeners outside the lock
    /// if anything visible changed.
    fn update_canonical(&self, mutate: impl FnOnce(&mut DeviceState)) {
        let snapshot = {
            let mut state = self.inner.state.lock();
            let before = state.observable();
            mutate(&mut *state);
            (state.observable() != before).then(|| state.clone())
        };
        let Some(snapshot) = snapshot else { return };
        let listeners = self.inner.listeners.lock().clone();
        for listener in listeners {
            listener(&snapshot);
        }
    }

    fn build_command(
        &self,
        diff: StateDiff,
        desired: &DeviceState,
        canonical: &DeviceState,
        force_sleep_clear: bool,
    ) -> Option<SetCommand> {
        let features = self.inner.config.features;
        let mut command = diff.into_command();

        if desired.power() == Switch::Off {
            // Powering off resets these on the device by itself.
            command.operation_mode = None;
            command.target_temperature = None;
            command.fan_speed = None;
            command.swing_mode = None;
            command.turbo_mode = None;
            command.eco_mode = None;
        }
        if !features.swing {
            command.swing_mode = None;
        }
        if !features.eco {
            command.eco_mode = None;
        }
        if !features.display {
            command.display_mode = None;
        }
        if !features.beep {
            command.beep_mode = None;
        }

        if command.is_empty() && !force_sleep_clear {
            return None;
        }

        // Firmware may drop sleep as a side effect of unrelated commands,
        // so sleep always travels with the command.
        command.sleep_mode = Some(desired.sleep_mode());
        if desired.sleep_mode().is_on() {
            command.sleep_profile = desired
                .sleep_profile()
                .or(canonical.sleep_profile())
                .map(str::to_string);
        }
        Some(command)
    }

    fn schedule(&self, kind: TimerKind, delay: Duration) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let mut timers = self.inner.timers.lock();
        timers.next_generation += 1;
        let generation = timers.next_generation;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else { return };
            inner.timers.lock().release(kind, generation);
            DeviceManager { inner }
                .update_device_state(kind == TimerKind::QuickRefresh)
                .await;
        });

        if let Some(previous) = timers.slot(kind).replace(TimerSlot { generation, handle }) {
            previous.handle.abort();
        }
    }
}

async fn listen_for_queue_events(
    inner: Weak<ManagerInner>,
    mut events: tokio::sync::broadcast::Receiver<QueueEvent>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(n)) => {
                debug!(skipped = n, "queue event listener lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let Some(inner) = inner.upgrade() else { break };
        let manager = DeviceManager { inner };

        match event {
            QueueEvent::Executed { id, .. } => {
                debug!(id, "command executed, scheduling quick refresh");
                manager.schedule_quick_refresh();
            }
            QueueEvent::Error { id, message, will_retry, .. } => {
                debug!(id, will_retry, error = %message, "command attempt failed");
                manager.schedule_refresh();
            }
            QueueEvent::MaxRetriesReached { id, attempts, .. } => {
                warn!(id, attempts, "command abandoned after retries");
            }
        }
    }
}
