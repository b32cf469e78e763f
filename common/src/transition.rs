use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use chrono::Utc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::{
    command::{CommandError, CommandSender, DeviceCommand},
    config::{read_mapping, CommandMapping, SharedMapping, TransitionConfig},
    humidity::{self, Position},
    types::{CommandStats, HumidifierState, HumidifierStatus, TransitionPhase},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortOutcome {
    Acknowledged,
    Superseded,
}

// Parked by a waiting target setter, consumed by the running step loop.
#[derive(Debug)]
pub struct AbortSignal {
    reply: oneshot::Sender<AbortOutcome>,
}

impl AbortSignal {
    fn new() -> (Self, oneshot::Receiver<AbortOutcome>) {
        let (reply, waiter) = oneshot::channel();
        (Self { reply }, waiter)
    }

    // false when the waiter is gone
    fn complete(self) -> bool {
        self.reply.send(AbortOutcome::Acknowledged).is_ok()
    }

    fn fail(self) {
        let _ = self.reply.send(AbortOutcome::Superseded);
    }
}

#[derive(Debug)]
struct TransitionState {
    record: HumidifierState,
    current_humidity: Option<f32>,
    phase: TransitionPhase,
    // Device is inside its adjustment mode.
    hot: bool,
    // Some task owns the single-flight slot.
    requesting: bool,
    abort: Option<AbortSignal>,
    // Bumped per launched loop so stale drains leave `hot` alone.
    epoch: u64,
    stats: CommandStats,
}

impl TransitionState {
    // Passes the slot to a parked request, or frees it when none is waiting.
    fn hand_over_slot(&mut self) -> bool {
        self.requesting = self.abort.take().is_some_and(AbortSignal::complete);
        self.requesting
    }
}

enum Step {
    Aborted { epoch: u64 },
    Converged { epoch: u64 },
    Advance { from: Position, to: Position },
}

struct Inner {
    device_id: String,
    mapping: SharedMapping,
    sender: Arc<dyn CommandSender>,
    config: TransitionConfig,
    state: Mutex<TransitionState>,
}

#[derive(Clone)]
pub struct HumidifierController {
    inner: Arc<Inner>,
}

impl HumidifierController {
    pub fn new(
        device_id: impl Into<String>,
        record: HumidifierState,
        mapping: SharedMapping,
        sender: Arc<dyn CommandSender>,
        config: TransitionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                device_id: device_id.into(),
                mapping,
                sender,
                config,
                state: Mutex::new(TransitionState {
                    record,
                    current_humidity: None,
                    phase: TransitionPhase::Idle,
                    hot: false,
                    requesting: false,
                    abort: None,
                    epoch: 0,
                    stats: CommandStats::default(),
                }),
            }),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    pub fn get_active(&self) -> bool {
        self.inner.lock().record.active
    }

    pub fn get_target_humidity(&self) -> u8 {
        self.inner.lock().record.target_humidity
    }

    pub fn current_humidity(&self) -> Option<f32> {
        self.inner.lock().current_humidity
    }

    pub fn update_current_humidity(&self, humidity: f32) {
        self.inner.lock().current_humidity = Some(humidity);
    }

    pub fn snapshot(&self) -> HumidifierState {
        self.inner.lock().record
    }

    pub fn status(&self) -> HumidifierStatus {
        let state = self.inner.lock();
        HumidifierStatus {
            device_id: self.inner.device_id.clone(),
            active: state.record.active,
            target_humidity: state.record.target_humidity,
            internal_position: state.record.internal_position,
            current_humidity: state.current_humidity,
            phase: state.phase.as_str(),
            hot: state.hot,
            requesting: state.requesting,
            commands: state.stats.clone(),
        }
    }

    pub async fn set_active(&self, target: bool) {
        let previous = {
            let mut state = self.inner.lock();
            if state.record.active == target {
                return;
            }
            let previous = state.record.active;
            state.record.active = target;
            previous
        };

        let command = self.inner.mapping().power_command(target).to_string();
        if let Err(err) = self.inner.send(&command).await {
            debug!("power command failed for {}: {err}", self.inner.device_id);
            self.inner.lock().record.active = previous;
            return;
        }

        if !target {
            return;
        }

        // A power cycle drops the device out of whatever setting it held.
        self.inner.lock().record.internal_position = None;
        info!("{} powered on, restoring humidity target", self.inner.device_id);

        let controller = self.clone();
        tokio::spawn(async move {
            let target = controller.get_target_humidity();
            controller.set_target_humidity(f64::from(target)).await;
        });
    }

    pub async fn set_target_humidity(&self, value: f64) {
        let Some(target) = humidity::snap_target(value) else {
            debug!("ignoring non-finite humidity target {value} for {}", self.inner.device_id);
            return;
        };

        let waiter = {
            let mut state = self.inner.lock();
            state.record.target_humidity = target;
            if !state.record.active {
                return;
            }

            if state.requesting {
                if let Some(older) = state.abort.take() {
                    older.fail();
                }
                let (signal, waiter) = AbortSignal::new();
                state.abort = Some(signal);
                Some(waiter)
            } else {
                state.requesting = true;
                None
            }
        };

        let Some(waiter) = waiter else {
            self.inner.launch(target);
            return;
        };

        // Waiting happens on its own task so a dropped caller cannot strand a
        // slot that has already been handed over.
        let inner = Arc::clone(&self.inner);
        let handover = tokio::spawn(async move {
            match waiter.await {
                Ok(AbortOutcome::Acknowledged) => inner.launch(target),
                Ok(AbortOutcome::Superseded) | Err(_) => {
                    debug!("humidity request {target} for {} superseded", inner.device_id);
                }
            }
        });

        if let Err(err) = handover.await {
            warn!("humidity handover task failed for {}: {err}", self.inner.device_id);
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, TransitionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mapping(&self) -> CommandMapping {
        read_mapping(&self.mapping)
    }

    fn grace_period(&self) -> Duration {
        Duration::from_millis(self.config.grace_period_ms)
    }

    async fn send(&self, command: &str) -> Result<(), CommandError> {
        let request = DeviceCommand::customize(command);
        let result = self.sender.send_command(&self.device_id, &request).await;

        let mut state = self.lock();
        state.stats.last_command_at = Some(Utc::now());
        match &result {
            Ok(()) => {
                state.stats.sent = state.stats.sent.saturating_add(1);
                state.stats.last_error = None;
            }
            Err(err) => {
                state.stats.failed = state.stats.failed.saturating_add(1);
                state.stats.last_error = Some(err.to_string());
            }
        }

        result
    }

    // Caller must own the single-flight slot.
    fn launch(self: &Arc<Self>, target: u8) {
        let mut state = self.lock();
        let position = state.record.internal_position;

        if position == Some(target) {
            // A request parked while this one waited for its handover still
            // needs the slot.
            if !state.hand_over_slot() && !state.hot {
                state.phase = TransitionPhase::Idle;
            }
            return;
        }

        state.epoch = state.epoch.wrapping_add(1);
        state.phase = if state.hot {
            TransitionPhase::Stepping
        } else {
            TransitionPhase::Entering
        };
        drop(state);

        debug!(
            "starting humidity transition for {}: {position:?} -> {target} ({} steps)",
            self.device_id,
            humidity::steps_between(position, Some(target))
        );

        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.run_transition(target).await });
    }

    async fn run_transition(self: Arc<Self>, target: u8) {
        let hot = self.lock().hot;
        if !hot {
            // The first press only wakes the adjustment mode.
            let command = self.mapping().humidity;
            if let Err(err) = self.send(&command).await {
                debug!("failed to enter humidity mode on {}: {err}", self.device_id);
                self.release_after_failed_entry();
                return;
            }

            let mut state = self.lock();
            state.hot = true;
            state.phase = TransitionPhase::Stepping;
        }

        loop {
            match self.next_step(target) {
                Step::Aborted { epoch } => {
                    debug!("humidity transition to {target} on {} preempted", self.device_id);
                    let inner = Arc::clone(&self);
                    tokio::spawn(async move { inner.drain(epoch).await });
                    return;
                }
                Step::Converged { epoch } => {
                    debug!("humidity target {target} reached on {}", self.device_id);
                    self.drain(epoch).await;
                    return;
                }
                Step::Advance { from, to } => {
                    let command = self.mapping().humidity;
                    if let Err(err) = self.send(&command).await {
                        debug!(
                            "humidity step {from:?} -> {to:?} failed on {}, retrying: {err}",
                            self.device_id
                        );
                        self.lock().record.internal_position = from;
                        self.retry_pause().await;
                    }
                }
            }
        }
    }

    // Abort check, convergence check and optimistic advance share one lock.
    fn next_step(&self, target: u8) -> Step {
        let mut state = self.lock();

        if state.abort.is_some() {
            state.phase = TransitionPhase::Draining;
            state.hand_over_slot();
            return Step::Aborted { epoch: state.epoch };
        }

        let from = state.record.internal_position;
        if from == Some(target) {
            state.requesting = false;
            state.phase = TransitionPhase::Draining;
            return Step::Converged { epoch: state.epoch };
        }

        let to = humidity::next_position(from);
        state.record.internal_position = to;
        Step::Advance { from, to }
    }

    fn release_after_failed_entry(&self) {
        let mut state = self.lock();
        state.phase = TransitionPhase::Idle;
        state.hand_over_slot();
    }

    async fn retry_pause(&self) {
        match self.config.step_retry_delay_ms {
            0 => tokio::task::yield_now().await,
            delay_ms => tokio::time::sleep(Duration::from_millis(delay_ms)).await,
        }
    }

    // Only the most recent loop may clear `hot`.
    async fn drain(&self, epoch: u64) {
        tokio::time::sleep(self.grace_period()).await;

        let mut state = self.lock();
        if state.epoch == epoch {
            state.hot = false;
            state.phase = TransitionPhase::Idle;
        }
    }
}
