use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Interval between pushes while a resource is observed
pub const DEFAULT_OBSERVE_INTERVAL: Duration = Duration::from_secs(5);

const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Emitted on every timer tick while the resource has observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservationEvent {
    pub path: String,
    pub sequence: u64,
    pub emitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservationPhase {
    Idle,
    Active,
}

/// Counters kept for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleStats {
    pub scheduled: usize,
    pub cancelled: usize,
    pub notifications: u64,
}

#[derive(Debug, Default)]
struct ObservationState {
    subscriber_count: usize,
    // Present iff subscriber_count > 0
    timer: Option<JoinHandle<()>>,
    // Bumped on every start so a stale timer can tell it was replaced
    generation: u64,
    stats: ScheduleStats,
}

/// Drives the periodic self-notification of one observable resource.
///
/// The scheduler is `Idle` while nobody observes the resource and `Active`
/// with exactly one recurring timer task otherwise. Count updates from the
/// transport move it between the two; repeated updates on either side are
/// no-ops.
#[derive(Debug)]
pub struct ObservationScheduler {
    path: String,
    interval: Duration,
    state: Arc<Mutex<ObservationState>>,
    events: broadcast::Sender<ObservationEvent>,
}

impl ObservationScheduler {
    pub fn new(path: impl Into<String>, interval: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            path: path.into(),
            interval,
            state: Arc::new(Mutex::new(ObservationState::default())),
            events,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Receive an event per timer tick
    pub fn subscribe(&self) -> broadcast::Receiver<ObservationEvent> {
        self.events.subscribe()
    }

    pub fn phase(&self) -> ObservationPhase {
        if lock(&self.state).timer.is_some() {
            ObservationPhase::Active
        } else {
            ObservationPhase::Idle
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.state).subscriber_count
    }

    pub fn stats(&self) -> ScheduleStats {
        lock(&self.state).stats
    }

    /// React to the transport's current observer count.
    ///
    /// Must be called from within a tokio runtime when the count leaves zero.
    pub fn update_observation_count(&self, count: usize) {
        let mut state = lock(&self.state);
        state.subscriber_count = count;

        if count > 0 && state.timer.is_none() {
            info!(path = %self.path, "Starting the clock");
            state.generation += 1;
            let timer = self.spawn_timer(state.generation);
            state.timer = Some(timer);
            state.stats.scheduled += 1;
        } else if count == 0 {
            Self::stop(&self.path, &mut state);
        }
    }

    /// Cancel the timer as if the last observer left. Idempotent.
    pub fn cancel(&self) {
        let mut state = lock(&self.state);
        state.subscriber_count = 0;
        Self::stop(&self.path, &mut state);
    }

    fn stop(path: &str, state: &mut ObservationState) {
        if let Some(timer) = state.timer.take() {
            info!(path = %path, "Stopping the clock");
            timer.abort();
            state.stats.cancelled += 1;
        }
    }

    fn spawn_timer(&self, generation: u64) -> JoinHandle<()> {
        let state = Arc::clone(&self.state);
        let events = self.events.clone();
        let path = self.path.clone();
        let period = self.interval;
        let first_tick = Instant::now() + period;

        tokio::spawn(async move {
            let mut ticker = time::interval_at(first_tick, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                let mut state = lock(&state);
                // A stopped or replaced timer must not push anything
                if state.generation != generation || state.subscriber_count == 0 {
                    return;
                }
                state.stats.notifications += 1;
                let event = ObservationEvent {
                    path: path.clone(),
                    sequence: state.stats.notifications,
                    emitted_at: Utc::now(),
                };
                debug!(path = %path, sequence = event.sequence, "Observation tick");
                // No receiver just means nobody is forwarding right now
                let _ = events.send(event);
            }
        })
    }
}

impl Drop for ObservationScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn lock(state: &Mutex<ObservationState>) -> MutexGuard<'_, ObservationState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
