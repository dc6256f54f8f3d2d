//! Action scheduling with a single input slot.
//!
//! Every action that wants the input backend goes through [`Scheduler`].
//! Only one action holds the [`ScheduleSlot`] at a time; everything else
//! that is due waits for the next free tick and keeps its original due
//! time. Waiting is counted per blocking reservation, and an action that
//! reaches the deferral cap jumps the queue instead of being dropped.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ApiError;
use crate::input::InputTarget;

static NEXT_ACTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique action identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(u64);

impl ActionId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(NEXT_ACTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "action-{}", self.0)
    }
}

/// Identifies one reservation of the input slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Runs once, removed after completion.
    Immediate,
    /// Runs every `interval`.
    Interval,
}

/// One step of an action payload. The scheduler never looks inside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionStep {
    Input(InputTarget),
    Wait(Duration),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub id: ActionId,
    pub kind: ActionKind,
    pub label: String,
    /// Required for, and only for, `Interval` actions.
    pub interval: Option<Duration>,
    pub last_fired_at: Option<Instant>,
    /// Delay before the first firing of an interval action.
    pub start_after: Option<Duration>,
    pub priority: i32,
    pub payload: Vec<ActionStep>,
    pub deferrals: u32,
}

impl Action {
    pub fn immediate(label: impl Into<String>, payload: Vec<ActionStep>) -> Self {
        Self {
            id: ActionId::new(),
            kind: ActionKind::Immediate,
            label: label.into(),
            interval: None,
            last_fired_at: None,
            start_after: None,
            priority: 0,
            payload,
            deferrals: 0,
        }
    }

    pub fn interval(label: impl Into<String>, every: Duration, payload: Vec<ActionStep>) -> Self {
        Self {
            kind: ActionKind::Interval,
            interval: Some(every),
            ..Self::immediate(label, payload)
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn starting_after(mut self, delay: Duration) -> Self {
        self.start_after = Some(delay);
        self
    }

    /// Total time spent in explicit waits.
    pub fn wait_time(&self) -> Duration {
        self.payload
            .iter()
            .map(|step| match step {
                ActionStep::Wait(d) => *d,
                ActionStep::Input(_) => Duration::ZERO,
            })
            .sum()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("interval action '{0}' has no interval")]
    MissingInterval(String),
    #[error("interval action '{0}' has a zero interval")]
    ZeroInterval(String),
    #[error("immediate action '{0}' must not carry an interval")]
    UnexpectedInterval(String),
    #[error("action {0} is already scheduled")]
    Duplicate(ActionId),
}

impl From<ScheduleError> for ApiError {
    fn from(err: ScheduleError) -> Self {
        ApiError::invalid_input(err.to_string())
    }
}

/// "Input backend busy until the holder completes."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleSlot {
    pub slot: SlotId,
    pub holder: ActionId,
    pub granted_at: Instant,
}

/// An action granted the slot, as it was at grant time.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadyAction {
    pub slot: ScheduleSlot,
    pub action: Action,
}

/// An action hit the deferral cap. Reported once per action until it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentionWarning {
    pub id: ActionId,
    pub label: String,
    pub deferrals: u32,
    pub cap: u32,
}

impl From<&ContentionWarning> for ApiError {
    fn from(w: &ContentionWarning) -> Self {
        ApiError::action_contention(&w.label, w.deferrals, w.cap)
    }
}

#[derive(Debug, Default)]
pub struct TickOutcome {
    pub ready: Option<ReadyAction>,
    pub contention: Vec<ContentionWarning>,
}

/// Per-action status for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionStatus {
    pub id: ActionId,
    pub label: String,
    pub kind: ActionKind,
    pub priority: i32,
    pub due_in_ms: u64,
    pub deferrals: u32,
    pub running: bool,
}

#[derive(Debug)]
struct Entry {
    action: Action,
    due: Instant,
    seq: u64,
    running: bool,
    blocked_by: Option<SlotId>,
    warned: bool,
}

impl Entry {
    fn capped(&self, cap: u32) -> bool {
        self.action.deferrals >= cap
    }

    /// Count a deferral against `slot` unless that slot was already counted.
    fn defer(&mut self, slot: SlotId, cap: u32) -> Option<ContentionWarning> {
        if self.blocked_by == Some(slot) {
            return None;
        }
        self.blocked_by = Some(slot);
        self.action.deferrals = self.action.deferrals.saturating_add(1);
        if self.capped(cap) && !self.warned {
            self.warned = true;
            return Some(ContentionWarning {
                id: self.action.id,
                label: self.action.label.clone(),
                deferrals: self.action.deferrals,
                cap,
            });
        }
        None
    }
}

pub struct Scheduler {
    entries: Vec<Entry>,
    slot: Option<ScheduleSlot>,
    next_seq: u64,
    next_slot: u64,
    deferral_cap: u32,
}

impl Scheduler {
    pub fn new(deferral_cap: u32) -> Self {
        Self {
            entries: Vec::new(),
            slot: None,
            next_seq: 0,
            next_slot: 1,
            deferral_cap: deferral_cap.max(1),
        }
    }

    pub fn deferral_cap(&self) -> u32 {
        self.deferral_cap
    }

    pub fn submit(&mut self, action: Action, now: Instant) -> Result<ActionId, ScheduleError> {
        if self.entries.iter().any(|e| e.action.id == action.id) {
            return Err(ScheduleError::Duplicate(action.id));
        }

        let due = match action.kind {
            ActionKind::Interval => {
                let every = action
                    .interval
                    .ok_or_else(|| ScheduleError::MissingInterval(action.label.clone()))?;
                if every.is_zero() {
                    return Err(ScheduleError::ZeroInterval(action.label.clone()));
                }
                match action.last_fired_at {
                    Some(fired) => fired + every,
                    None => now + action.start_after.unwrap_or_default(),
                }
            }
            ActionKind::Immediate => {
                if action.interval.is_some() {
                    return Err(ScheduleError::UnexpectedInterval(action.label.clone()));
                }
                now
            }
        };

        let id = action.id;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(Entry {
            action,
            due,
            seq,
            running: false,
            blocked_by: None,
            warned: false,
        });
        Ok(id)
    }

    /// Remove an action. Releases the slot if the action holds it.
    pub fn cancel(&mut self, id: ActionId) -> bool {
        if self.slot.is_some_and(|s| s.holder == id) {
            self.slot = None;
        }
        let before = self.entries.len();
        self.entries.retain(|e| e.action.id != id);
        self.entries.len() != before
    }

    /// Completion signal from the dispatcher.
    ///
    /// Returns how long the slot was held, or None if `id` was not the
    /// holder (late completion after a cancel, for instance).
    pub fn complete(&mut self, id: ActionId, now: Instant) -> Option<Duration> {
        let held = match self.slot {
            Some(slot) if slot.holder == id => {
                self.slot = None;
                Some(now.saturating_duration_since(slot.granted_at))
            }
            _ => None,
        };

        if let Some(idx) = self.entries.iter().position(|e| e.action.id == id) {
            if self.entries[idx].action.kind == ActionKind::Immediate {
                self.entries.remove(idx);
            } else {
                self.entries[idx].running = false;
            }
        }
        held
    }

    /// Pick at most one due action and grant it the slot.
    pub fn tick(&mut self, now: Instant) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        let cap = self.deferral_cap;

        if let Some(slot) = self.slot {
            for entry in self.entries.iter_mut().filter(|e| !e.running && e.due <= now) {
                outcome.contention.extend(entry.defer(slot.slot, cap));
            }
            return outcome;
        }

        let Some(winner) = self.pick(now) else {
            return outcome;
        };

        let slot = ScheduleSlot {
            slot: SlotId(self.next_slot),
            holder: self.entries[winner].action.id,
            granted_at: now,
        };
        self.next_slot += 1;
        self.slot = Some(slot);

        for (idx, entry) in self.entries.iter_mut().enumerate() {
            if idx != winner && !entry.running && entry.due <= now {
                outcome.contention.extend(entry.defer(slot.slot, cap));
            }
        }

        let entry = &mut self.entries[winner];
        let granted = entry.action.clone();
        entry.running = true;
        entry.blocked_by = None;
        entry.warned = false;
        if let (ActionKind::Interval, Some(every)) = (entry.action.kind, entry.action.interval) {
            entry.action.last_fired_at = Some(now);
            entry.action.deferrals = 0;
            entry.due = now + every;
        }

        outcome.ready = Some(ReadyAction {
            slot,
            action: granted,
        });
        outcome
    }

    fn pick(&self, now: Instant) -> Option<usize> {
        let cap = self.deferral_cap;
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.running && e.due <= now)
            .min_by(|(_, a), (_, b)| Self::order(a, b, cap))
            .map(|(idx, _)| idx)
    }

    /// Capped first, then priority, Immediate before Interval, due time,
    /// submission order.
    fn order(a: &Entry, b: &Entry, cap: u32) -> CmpOrdering {
        let key = |e: &Entry| {
            (
                Reverse(e.capped(cap)),
                Reverse(e.action.priority),
                e.action.kind != ActionKind::Immediate,
                e.due,
                e.seq,
            )
        };
        key(a).cmp(&key(b))
    }

    pub fn holder(&self) -> Option<&ScheduleSlot> {
        self.slot.as_ref()
    }

    pub fn is_busy(&self) -> bool {
        self.slot.is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: ActionId) -> bool {
        self.entries.iter().any(|e| e.action.id == id)
    }

    pub fn snapshot(&self, now: Instant) -> Vec<ActionStatus> {
        let mut statuses: Vec<ActionStatus> = self
            .entries
            .iter()
            .map(|e| ActionStatus {
                id: e.action.id,
                label: e.action.label.clone(),
                kind: e.action.kind,
                priority: e.action.priority,
                due_in_ms: e.due.saturating_duration_since(now).as_millis() as u64,
                deferrals: e.action.deferrals,
                running: e.running,
            })
            .collect();
        statuses.sort_by_key(|s| (s.due_in_ms, s.id));
        statuses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::KeyKind;

    fn press(key: KeyKind) -> ActionStep {
        ActionStep::Input(InputTarget::KeyDown { key })
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_submit_validates_interval() {
        let mut scheduler = Scheduler::new(5);
        let now = Instant::now();

        let mut missing = Action::interval("buff", ms(1000), vec![]);
        missing.interval = None;
        assert!(matches!(
            scheduler.submit(missing, now),
            Err(ScheduleError::MissingInterval(_))
        ));

        let zero = Action::interval("buff", Duration::ZERO, vec![]);
        assert!(matches!(
            scheduler.submit(zero, now),
            Err(ScheduleError::ZeroInterval(_))
        ));

        let mut immediate = Action::immediate("loot", vec![]);
        immediate.interval = Some(ms(10));
        assert!(matches!(
            scheduler.submit(immediate, now),
            Err(ScheduleError::UnexpectedInterval(_))
        ));
    }

    #[test]
    fn test_duplicate_submit_rejected() {
        let mut scheduler = Scheduler::new(5);
        let now = Instant::now();
        let action = Action::immediate("loot", vec![]);
        scheduler.submit(action.clone(), now).unwrap();
        assert_eq!(
            scheduler.submit(action.clone(), now),
            Err(ScheduleError::Duplicate(action.id))
        );
    }

    #[test]
    fn test_action_ids_are_unique() {
        let a = ActionId::new();
        let b = ActionId::new();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_immediate_runs_and_is_removed() {
        let mut scheduler = Scheduler::new(5);
        let now = Instant::now();
        let id = scheduler
            .submit(Action::immediate("loot", vec![press(KeyKind::Z)]), now)
            .unwrap();

        let ready = scheduler.tick(now).ready.unwrap();
        assert_eq!(ready.action.id, id);
        assert!(scheduler.is_busy());

        let held = scheduler.complete(id, now + ms(40));
        assert_eq!(held, Some(ms(40)));
        assert!(!scheduler.is_busy());
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_interval_not_due_before_start_after() {
        let mut scheduler = Scheduler::new(5);
        let now = Instant::now();
        scheduler
            .submit(
                Action::interval("buff", ms(1000), vec![]).starting_after(ms(300)),
                now,
            )
            .unwrap();

        assert!(scheduler.tick(now + ms(299)).ready.is_none());
        assert!(scheduler.tick(now + ms(300)).ready.is_some());
    }

    #[test]
    fn test_busy_slot_defers_instead_of_interrupting() {
        let mut scheduler = Scheduler::new(5);
        let now = Instant::now();
        let first = scheduler
            .submit(Action::immediate("first", vec![]), now)
            .unwrap();
        let second = scheduler
            .submit(Action::immediate("second", vec![]).with_priority(100), now + ms(1))
            .unwrap();

        // Only `first` is due at `now`.
        let ready = scheduler.tick(now).ready.unwrap();
        assert_eq!(ready.action.id, first);

        for t in 1..10 {
            assert!(scheduler.tick(now + ms(t * 10)).ready.is_none());
        }
        // A long-held slot counts as one deferral.
        let status = scheduler
            .snapshot(now)
            .into_iter()
            .find(|s| s.id == second)
            .unwrap();
        assert_eq!(status.deferrals, 1);

        scheduler.complete(first, now + ms(100));
        let ready = scheduler.tick(now + ms(100)).ready.unwrap();
        assert_eq!(ready.action.id, second);
    }

    #[test]
    fn test_priority_then_immediate_then_due_then_fifo() {
        let mut scheduler = Scheduler::new(50);
        let now = Instant::now();
        let low = scheduler
            .submit(Action::immediate("low", vec![]).with_priority(-1), now)
            .unwrap();
        let interval = scheduler
            .submit(Action::interval("interval", ms(5000), vec![]), now)
            .unwrap();
        let imm_a = scheduler
            .submit(Action::immediate("a", vec![]), now + ms(1))
            .unwrap();
        let imm_b = scheduler
            .submit(Action::immediate("b", vec![]), now + ms(1))
            .unwrap();
        let high = scheduler
            .submit(Action::interval("high", ms(5000), vec![]).with_priority(3), now + ms(2))
            .unwrap();

        let mut order = Vec::new();
        let mut t = now + ms(10);
        while let Some(ready) = scheduler.tick(t).ready {
            order.push(ready.action.id);
            scheduler.complete(ready.action.id, t);
            t += ms(1);
        }

        assert_eq!(order, vec![high, imm_a, imm_b, interval, low]);
    }

    #[test]
    fn test_interval_rescheduled_from_fire_time_without_catch_up() {
        let mut scheduler = Scheduler::new(5);
        let start = Instant::now();
        let id = scheduler
            .submit(Action::interval("buff", ms(1000), vec![]), start)
            .unwrap();

        let ready = scheduler.tick(start).ready.unwrap();
        scheduler.complete(ready.action.id, start + ms(10));

        // Loop stalls for ten periods.
        let resumed = start + ms(10_500);
        let fired = scheduler.tick(resumed).ready.unwrap();
        assert_eq!(fired.action.id, id);
        scheduler.complete(id, resumed + ms(10));

        // No burst: nothing more until a full interval after the late firing.
        let mut t = resumed + ms(20);
        while t < resumed + ms(1000) {
            assert!(scheduler.tick(t).ready.is_none(), "catch-up burst at {:?}", t - resumed);
            t += ms(33);
        }
        assert!(scheduler.tick(resumed + ms(1000)).ready.is_some());
    }

    #[test]
    fn test_interval_last_fired_at_recorded() {
        let mut scheduler = Scheduler::new(5);
        let start = Instant::now();
        let id = scheduler
            .submit(Action::interval("buff", ms(1000), vec![]), start)
            .unwrap();
        scheduler.tick(start + ms(5));
        scheduler.complete(id, start + ms(6));

        let entry = scheduler.entries.iter().find(|e| e.action.id == id).unwrap();
        assert_eq!(entry.action.last_fired_at, Some(start + ms(5)));
        assert_eq!(entry.due, start + ms(1005));
    }

    #[test]
    fn test_cancel_releases_slot_immediately() {
        let mut scheduler = Scheduler::new(5);
        let now = Instant::now();
        let id = scheduler
            .submit(Action::immediate("walk", vec![]), now)
            .unwrap();
        scheduler.tick(now);
        assert!(scheduler.is_busy());

        assert!(scheduler.cancel(id));
        assert!(!scheduler.is_busy());
        assert!(!scheduler.cancel(id));
        // Late completion from the dispatcher is ignored.
        assert_eq!(scheduler.complete(id, now + ms(5)), None);
    }

    #[test]
    fn test_capped_action_jumps_queue_and_warns_once() {
        let mut scheduler = Scheduler::new(2);
        let now = Instant::now();
        let low = scheduler
            .submit(Action::immediate("low", vec![]), now)
            .unwrap();
        let high = scheduler
            .submit(Action::interval("high", ms(10), vec![]).with_priority(10), now)
            .unwrap();

        let mut warnings = Vec::new();
        let mut granted = Vec::new();
        let mut t = now;
        for _ in 0..4 {
            let outcome = scheduler.tick(t);
            warnings.extend(outcome.contention);
            if let Some(ready) = outcome.ready {
                granted.push(ready.action.id);
                scheduler.complete(ready.action.id, t + ms(1));
            }
            t += ms(20);
        }

        assert_eq!(granted[..2], [high, high]);
        assert_eq!(granted[2], low);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].id, low);
        assert_eq!(warnings[0].deferrals, 2);
        let err = ApiError::from(&warnings[0]);
        assert_eq!(err.code, crate::error::ErrorCode::ActionContention);
    }

    /// Drives the scheduler the way the control loop does, with each
    /// granted action occupying the slot for `run_time(action)`.
    struct Sim {
        scheduler: Scheduler,
        now: Instant,
        running: Option<(ActionId, Instant)>,
        grants: Vec<(ActionId, Instant, Instant, u32)>,
    }

    impl Sim {
        fn new(cap: u32) -> Self {
            Self {
                scheduler: Scheduler::new(cap),
                now: Instant::now(),
                running: None,
                grants: Vec::new(),
            }
        }

        fn step(&mut self, tick: Duration, run_time: impl Fn(&Action) -> Duration) {
            if let Some((id, until)) = self.running {
                if self.now >= until {
                    self.scheduler.complete(id, self.now);
                    self.running = None;
                }
            }
            if let Some(ready) = self.scheduler.tick(self.now).ready {
                assert!(self.running.is_none(), "slot granted while another action runs");
                let until = self.now + run_time(&ready.action);
                self.grants
                    .push((ready.action.id, self.now, until, ready.action.deferrals));
                self.running = Some((ready.action.id, until));
            }
            self.now += tick;
        }
    }

    #[test]
    fn test_no_overlapping_slots_with_overlapping_interval_actions() {
        let mut sim = Sim::new(5);
        for (i, period) in [300u64, 450, 500, 700, 1100].iter().enumerate() {
            sim.scheduler
                .submit(
                    Action::interval(
                        format!("interval-{}", i),
                        ms(*period),
                        vec![press(KeyKind::A), ActionStep::Wait(ms(120))],
                    )
                    .with_priority(i as i32 % 2),
                    sim.now,
                )
                .unwrap();
        }

        for _ in 0..600 {
            sim.step(ms(33), |a| a.wait_time() + ms(30));
        }

        assert!(sim.grants.len() > 10);
        for pair in sim.grants.windows(2) {
            let (_, _, end, _) = pair[0];
            let (_, start, _, _) = pair[1];
            assert!(start >= end, "slots overlap");
        }
    }

    #[test]
    fn test_normal_action_between_two_busy_interval_actions_completes() {
        let cap = 5;
        let mut sim = Sim::new(cap);
        let post_wait = vec![press(KeyKind::Q), ActionStep::Wait(ms(1000))];
        // Recurring actions outrank the one-shot, so it can only get in
        // through the deferral cap.
        sim.scheduler
            .submit(
                Action::interval("buff-a", ms(2000), post_wait.clone()).with_priority(10),
                sim.now,
            )
            .unwrap();
        sim.scheduler
            .submit(
                Action::interval("buff-b", ms(2000), post_wait).with_priority(10),
                sim.now,
            )
            .unwrap();

        for _ in 0..15 {
            sim.step(ms(33), |a| a.wait_time() + ms(60));
        }
        let normal = sim
            .scheduler
            .submit(Action::immediate("loot", vec![press(KeyKind::Z)]), sim.now)
            .unwrap();

        for _ in 0..600 {
            sim.step(ms(33), |a| a.wait_time() + ms(60));
        }

        let grant = sim
            .grants
            .iter()
            .find(|(id, ..)| *id == normal)
            .expect("normal action never ran");
        assert!(grant.3 <= cap, "ran after {} deferrals", grant.3);
        assert!(!sim.scheduler.contains(normal));
    }

    #[test]
    fn test_normal_action_at_equal_priority_goes_first() {
        let mut sim = Sim::new(5);
        let post_wait = vec![press(KeyKind::Q), ActionStep::Wait(ms(1000))];
        for label in ["buff-a", "buff-b"] {
            sim.scheduler
                .submit(Action::interval(label, ms(2000), post_wait.clone()), sim.now)
                .unwrap();
        }
        sim.step(ms(33), |a| a.wait_time());
        let normal = sim
            .scheduler
            .submit(Action::immediate("loot", vec![]), sim.now)
            .unwrap();

        for _ in 0..100 {
            sim.step(ms(33), |a| a.wait_time() + ms(10));
        }

        let ids: Vec<ActionId> = sim.grants.iter().map(|g| g.0).collect();
        assert_eq!(ids[1], normal);
        assert_eq!(sim.grants[1].3, 1);
    }

    #[test]
    fn test_snapshot_reports_due_and_running() {
        let mut scheduler = Scheduler::new(5);
        let now = Instant::now();
        let buff = scheduler
            .submit(Action::interval("buff", ms(1000), vec![]), now)
            .unwrap();
        scheduler.tick(now);

        let snapshot = scheduler.snapshot(now + ms(200));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, buff);
        assert!(snapshot[0].running);
        assert_eq!(snapshot[0].due_in_ms, 800);

        let json = serde_json::to_string(&snapshot[0]).unwrap();
        assert!(json.contains("\"kind\":\"interval\""));
    }
}
