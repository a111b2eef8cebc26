// protocol/expiration.rs - Clocks, schedulers and per-session expiration calls

//! Time is injected: sessions read it from a [`Clock`] and ask a
//! [`Scheduler`] to post a [`TimerEvent`] back to their agency at an
//! absolute deadline. Swapping [`ManualClock`]/[`ManualScheduler`] for
//! [`SystemClock`]/[`TokioScheduler`] changes nothing in the protocol logic.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::message::{AgentId, SessionId, Timestamp};

use super::state_machine::ContractState;

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Virtual clock, only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: i64) -> Timestamp {
        self.now.fetch_add(millis, Ordering::SeqCst) + millis
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

/// Unique id of one armed timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display)]
#[display("timer-{_0}")]
pub struct TimerId(u64);

impl TimerId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        TimerId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Posted back to the owning agency when a timer fires
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerEvent {
    pub owner: AgentId,
    pub session_id: SessionId,
    pub timer_id: TimerId,
}

/// Cancellable handle of a scheduled event. Cancelling twice, or after the
/// event fired, is a no-op.
#[derive(Debug)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
    abort: Option<tokio::task::AbortHandle>,
}

impl TimerHandle {
    pub fn new(cancelled: Arc<AtomicBool>) -> Self {
        Self {
            cancelled,
            abort: None,
        }
    }

    pub fn with_abort(mut self, abort: tokio::task::AbortHandle) -> Self {
        self.abort = Some(abort);
        self
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Schedules one-shot timer events at absolute deadlines
pub trait Scheduler: Send + Sync {
    fn schedule_at(&self, deadline: Timestamp, event: TimerEvent) -> TimerHandle;
}

#[derive(Debug)]
struct PendingTimer {
    event: TimerEvent,
    cancelled: Arc<AtomicBool>,
}

/// Virtual-time scheduler. Events are released by [`ManualScheduler::due`].
#[derive(Debug, Default)]
pub struct ManualScheduler {
    queue: Mutex<BTreeMap<(Timestamp, u64), PendingTimer>>,
    seq: AtomicU64,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return every live event due at `now`, earliest first
    pub fn due(&self, now: Timestamp) -> Vec<TimerEvent> {
        let mut queue = self.queue.lock();
        let later = queue.split_off(&(now + 1, 0));
        let due = std::mem::replace(&mut *queue, later);
        due.into_values()
            .filter(|p| !p.cancelled.load(Ordering::SeqCst))
            .map(|p| p.event)
            .collect()
    }

    /// Earliest deadline of a live event
    pub fn next_deadline(&self) -> Option<Timestamp> {
        let mut queue = self.queue.lock();
        queue.retain(|_, p| !p.cancelled.load(Ordering::SeqCst));
        queue.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Number of scheduled events not yet cancelled
    pub fn pending(&self) -> usize {
        self.queue
            .lock()
            .values()
            .filter(|p| !p.cancelled.load(Ordering::SeqCst))
            .count()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_at(&self, deadline: Timestamp, event: TimerEvent) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        trace!(deadline, timer = %event.timer_id, "Scheduling virtual timer");
        self.queue.lock().insert(
            (deadline, seq),
            PendingTimer {
                event,
                cancelled: cancelled.clone(),
            },
        );
        TimerHandle::new(cancelled)
    }
}

/// Real-time scheduler: one tokio task per timer, fired events are pushed
/// into the agency's timer channel.
pub struct TokioScheduler {
    clock: Arc<dyn Clock>,
    sink: mpsc::UnboundedSender<TimerEvent>,
}

impl TokioScheduler {
    pub fn new(clock: Arc<dyn Clock>, sink: mpsc::UnboundedSender<TimerEvent>) -> Self {
        Self { clock, sink }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_at(&self, deadline: Timestamp, event: TimerEvent) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let delay = Duration::from_millis((deadline - self.clock.now()).max(0) as u64);
        let sink = self.sink.clone();
        let flag = cancelled.clone();

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !flag.load(Ordering::SeqCst) {
                let _ = sink.send(event);
            }
        });

        TimerHandle::new(cancelled).with_abort(task.abort_handle())
    }
}

/// A timer armed by a session
#[derive(Debug)]
pub struct ArmedTimer<K> {
    pub id: TimerId,
    pub deadline: Timestamp,
    pub kind: K,
    pub resulting_state: Option<ContractState>,
    handle: TimerHandle,
}

/// What to do when an armed timer fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expired<K> {
    pub kind: K,
    pub resulting_state: Option<ContractState>,
}

/// The single expiration call a session may have outstanding
#[derive(Debug)]
pub struct Expiration<K> {
    armed: Option<ArmedTimer<K>>,
}

impl<K> Default for Expiration<K> {
    fn default() -> Self {
        Self { armed: None }
    }
}

impl<K: Copy + Debug> Expiration<K> {
    /// Arm a timer, replacing (and cancelling) any previous one
    #[allow(clippy::too_many_arguments)]
    pub fn arm(
        &mut self,
        scheduler: &dyn Scheduler,
        now: Timestamp,
        owner: AgentId,
        session_id: SessionId,
        deadline: Timestamp,
        kind: K,
        resulting_state: Option<ContractState>,
    ) -> TimerId {
        self.cancel();
        if deadline < now {
            warn!(deadline, now, ?kind, "Arming expiration call in the past, it will fire immediately");
        }
        let id = TimerId::next();
        let handle = scheduler.schedule_at(
            deadline,
            TimerEvent {
                owner,
                session_id,
                timer_id: id,
            },
        );
        debug!(timer = %id, deadline, ?kind, "Armed expiration call");
        self.armed = Some(ArmedTimer {
            id,
            deadline,
            kind,
            resulting_state,
            handle,
        });
        id
    }

    /// Cancel the outstanding timer, if any
    pub fn cancel(&mut self) {
        if let Some(armed) = self.armed.take() {
            debug!(timer = %armed.id, kind = ?armed.kind, "Canceling expiration call");
            armed.handle.cancel();
        }
    }

    /// Consume the timer if `id` is the one currently armed. Fired events for
    /// replaced or cancelled timers return `None`.
    pub fn fire(&mut self, id: TimerId) -> Option<Expired<K>> {
        match &self.armed {
            Some(armed) if armed.id == id => {
                let armed = self.armed.take()?;
                Some(Expired {
                    kind: armed.kind,
                    resulting_state: armed.resulting_state,
                })
            }
            _ => {
                debug!(timer = %id, "Ignoring stale timer event");
                None
            }
        }
    }

    /// Whether `id` is the timer currently armed
    pub fn is_current(&self, id: TimerId) -> bool {
        self.armed.as_ref().is_some_and(|armed| armed.id == id)
    }

    pub fn armed(&self) -> Option<&ArmedTimer<K>> {
        self.armed.as_ref()
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }
}

/// Timer-owning capability of a protocol session
pub trait ExpirationOwner {
    type Kind: Copy + Debug;

    fn expiration(&mut self) -> &mut Expiration<Self::Kind>;

    fn cancel_expiration_call(&mut self) {
        self.expiration().cancel();
    }
}
