//! Recovery-aware bot state machine.
//!
//! [`BotState`] is replaced wholesale on every event by [`transition`], a
//! pure function of the old state, the current [`Context`] and the event.
//! Side effects are returned as [`Directive`]s for the control loop to
//! carry out.

use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::input::{Direction, Seed};
use crate::localization::{DetectionResult, MinimapBounds, Position};
use crate::movement::{self, key_down, key_up, tap, Primitive};
use crate::scheduler::{Action, ActionId, ActionStep};
use crate::settings::{KeyBindings, RecoverySettings, Settings};

/// Movement outranks everything configured by the user.
pub const MOVEMENT_PRIORITY: i32 = 100;
/// Recovery outranks movement.
pub const RECOVERY_PRIORITY: i32 = 200;

const ESCAPE_SETTLE: Duration = Duration::from_millis(200);
const TOWARD_CENTER_HOLD: Duration = Duration::from_millis(600);
const RANDOM_HOLD_BASE_MS: u64 = 400;
const RANDOM_HOLD_STEP_MS: u64 = 200;

/// Where to go, and what to do once there.
#[derive(Debug, Clone, PartialEq)]
pub struct Goal {
    pub target: Position,
    pub action: Option<Action>,
}

impl Goal {
    pub fn go_to(target: Position) -> Self {
        Self {
            target,
            action: None,
        }
    }

    pub fn with_action(target: Position, action: Action) -> Self {
        Self {
            target,
            action: Some(action),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Movement {
    pub id: ActionId,
    pub primitive: Primitive,
    pub submitted_at: Instant,
    /// Set when the scheduler hands the movement to the backend.
    pub started_at: Option<Instant>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Navigating {
    pub goal: Goal,
    pub movement: Option<Movement>,
    /// Last position movement was measured against.
    pub anchor: Option<Position>,
    /// Moving since this instant without seeing the position change. Time a
    /// movement spends waiting for the slot does not count.
    pub unanswered_since: Option<Instant>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Executing {
    pub target: Position,
    pub action: ActionId,
    pub started_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StuckReason {
    /// Minimap visible but no player position for longer than the grace period.
    PositionLost,
    /// Movement dispatched but the position did not change.
    NoProgress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Close whatever dialog may be open.
    Escape,
    /// Walk towards the minimap centre, jumping unless near the top edge.
    TowardCenter { direction: Direction, jump: bool },
    /// Jump around in a random direction.
    Random { direction: Direction, hold_ms: u64 },
}

impl RecoveryStrategy {
    /// Escalate with the retry count.
    pub fn choose(
        retry: u32,
        position: Option<Position>,
        bounds: Option<MinimapBounds>,
        recovery: &RecoverySettings,
        roll: u64,
    ) -> RecoveryStrategy {
        let random_direction = if roll & 1 == 0 {
            Direction::Left
        } else {
            Direction::Right
        };
        let random = |retry: u32| RecoveryStrategy::Random {
            direction: random_direction,
            hold_ms: RANDOM_HOLD_BASE_MS + RANDOM_HOLD_STEP_MS * retry as u64,
        };

        match retry {
            0 => RecoveryStrategy::Escape,
            1 => match (position, bounds) {
                (Some(pos), Some(bounds)) => RecoveryStrategy::TowardCenter {
                    direction: Direction::towards(pos.x, bounds.center().x)
                        .unwrap_or(random_direction),
                    jump: bounds.height.saturating_sub(pos.y) > recovery.top_edge_margin,
                },
                _ => random(retry),
            },
            n => random(n),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RecoveryStrategy::Escape => "recover: escape",
            RecoveryStrategy::TowardCenter { .. } => "recover: toward center",
            RecoveryStrategy::Random { .. } => "recover: random",
        }
    }

    pub fn payload(&self, keys: &KeyBindings) -> Vec<ActionStep> {
        match *self {
            RecoveryStrategy::Escape => vec![tap(keys.escape), ActionStep::Wait(ESCAPE_SETTLE)],
            RecoveryStrategy::TowardCenter { direction, jump } => {
                let mut steps = vec![key_down(direction.key())];
                if jump {
                    steps.push(tap(keys.jump));
                }
                steps.push(ActionStep::Wait(TOWARD_CENTER_HOLD));
                steps.push(key_up(direction.key()));
                steps
            }
            RecoveryStrategy::Random { direction, hold_ms } => {
                let half = Duration::from_millis(hold_ms / 2);
                vec![
                    key_down(direction.key()),
                    tap(keys.jump),
                    ActionStep::Wait(half),
                    tap(keys.jump),
                    ActionStep::Wait(half),
                    key_up(direction.key()),
                ]
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryAttempt {
    pub id: ActionId,
    pub strategy: RecoveryStrategy,
    pub started_at: Instant,
    pub finished: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Unstucking {
    pub retry: u32,
    pub since: Instant,
    pub reason: StuckReason,
    /// Position when the stall was detected, if any.
    pub stuck_at: Option<Position>,
    pub attempt: Option<RecoveryAttempt>,
    /// Position continuously acceptable since.
    pub stable_since: Option<Instant>,
    /// Retries used up and the operator has been told.
    pub exhausted: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum BotState {
    #[default]
    Idle,
    Navigating(Navigating),
    ExecutingAction(Executing),
    Unstucking(Unstucking),
}

impl BotState {
    pub fn name(&self) -> &'static str {
        match self {
            BotState::Idle => "idle",
            BotState::Navigating(_) => "navigating",
            BotState::ExecutingAction(_) => "executing_action",
            BotState::Unstucking(_) => "unstucking",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    Completed,
    Failed(ApiError),
    Cancelled,
}

#[derive(Debug)]
pub enum Event<'a> {
    Goal(Goal),
    Perception(&'a DetectionResult),
    /// The scheduler granted the slot and the action was dispatched.
    ActionStarted { id: ActionId },
    ActionFinished { id: ActionId, outcome: ActionOutcome },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    Submit(Action),
    Cancel(ActionId),
    ReleaseAllKeys,
    NeedsAttention(ApiError),
    Redetect,
}

/// What the machine has seen so far, fed by every perception event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Observations {
    pub position: Option<Position>,
    pub last_known: Option<Position>,
    pub bounds: Option<MinimapBounds>,
    /// A Clean or Degraded minimap has been seen at least once.
    pub minimap_seen: bool,
    pub missing_since: Option<Instant>,
}

impl Observations {
    pub fn update(&mut self, detection: &DetectionResult, now: Instant) {
        if detection.quality().is_valid() {
            self.minimap_seen = true;
            self.bounds = detection.bounds();
        }
        self.position = detection.position();
        match detection.position() {
            Some(pos) => {
                self.last_known = Some(pos);
                self.missing_since = None;
            }
            None if self.minimap_seen && self.missing_since.is_none() => {
                self.missing_since = Some(now);
            }
            None => {}
        }
    }

    /// How long the position has been missing after the minimap was seen.
    pub fn missing_for(&self, now: Instant) -> Option<Duration> {
        self.missing_since
            .map(|since| now.saturating_duration_since(since))
    }
}

/// Read-only inputs to a transition. `roll` is a fresh random number.
pub struct Context<'a> {
    pub settings: &'a Settings,
    pub obs: &'a Observations,
    pub roll: u64,
}

pub fn transition(
    state: BotState,
    ctx: &Context<'_>,
    event: Event<'_>,
    now: Instant,
) -> (BotState, Vec<Directive>) {
    match (state, event) {
        (BotState::Idle, Event::Goal(goal)) => navigate(
            Navigating {
                goal,
                movement: None,
                anchor: None,
                unanswered_since: None,
            },
            ctx,
            now,
        ),
        (BotState::Idle, _) => (BotState::Idle, Vec::new()),

        (BotState::Navigating(mut nav), Event::Goal(goal)) => {
            nav.goal = goal;
            (BotState::Navigating(nav), Vec::new())
        }
        (BotState::Navigating(nav), Event::Perception(_)) => navigating_perception(nav, ctx, now),
        (BotState::Navigating(nav), Event::ActionStarted { id }) => {
            (BotState::Navigating(movement_started(nav, id, ctx, now)), Vec::new())
        }
        (BotState::Navigating(mut nav), Event::ActionFinished { id, .. }) => {
            if nav.movement.as_ref().is_some_and(|m| m.id == id) {
                nav.movement = None;
                navigate(nav, ctx, now)
            } else {
                (BotState::Navigating(nav), Vec::new())
            }
        }

        (BotState::ExecutingAction(exec), Event::Perception(_)) => {
            if position_lost(ctx, now) {
                enter_unstucking(Some(exec.action), StuckReason::PositionLost, ctx, now)
            } else {
                (BotState::ExecutingAction(exec), Vec::new())
            }
        }
        (BotState::ExecutingAction(exec), Event::ActionFinished { id, .. }) if id == exec.action => {
            (BotState::Idle, Vec::new())
        }
        (state @ BotState::ExecutingAction(_), _) => (state, Vec::new()),

        (BotState::Unstucking(u), Event::Perception(_)) => unstucking_perception(u, ctx, now),
        (BotState::Unstucking(mut u), Event::ActionFinished { id, .. }) => {
            if let Some(attempt) = u.attempt.as_mut().filter(|a| a.id == id) {
                attempt.finished = true;
            }
            (BotState::Unstucking(u), Vec::new())
        }
        (state @ BotState::Unstucking(_), Event::Goal(_) | Event::ActionStarted { .. }) => {
            (state, Vec::new())
        }
    }
}

fn position_lost(ctx: &Context<'_>, now: Instant) -> bool {
    ctx.obs
        .missing_for(now)
        .is_some_and(|missing| missing > ctx.settings.recovery.position_grace())
}

fn navigating_perception(
    mut nav: Navigating,
    ctx: &Context<'_>,
    now: Instant,
) -> (BotState, Vec<Directive>) {
    let in_flight = nav.movement.as_ref().map(|m| m.id);
    let moving = nav
        .movement
        .as_ref()
        .is_some_and(|m| m.started_at.is_some());

    if position_lost(ctx, now) {
        return enter_unstucking(in_flight, StuckReason::PositionLost, ctx, now);
    }

    if let Some(pos) = ctx.obs.position {
        if nav.anchor != Some(pos) {
            nav.anchor = Some(pos);
            nav.unanswered_since = moving.then_some(now);
        }
    }

    // Without a position there is nothing to compare; the grace period
    // covers that case.
    let stalled = moving
        && ctx.obs.position.is_some()
        && nav.unanswered_since.is_some_and(|since| {
            now.saturating_duration_since(since) > ctx.settings.navigation.movement_timeout()
        });
    if stalled {
        return enter_unstucking(in_flight, StuckReason::NoProgress, ctx, now);
    }

    navigate(nav, ctx, now)
}

/// Issue the next movement, or arrive.
fn navigate(mut nav: Navigating, ctx: &Context<'_>, now: Instant) -> (BotState, Vec<Directive>) {
    let pos = match (&nav.movement, ctx.obs.position) {
        (None, Some(pos)) => pos,
        _ => return (BotState::Navigating(nav), Vec::new()),
    };

    let Some((primitive, direction)) =
        movement::next_primitive(
            pos,
            nav.goal.target,
            &ctx.settings.navigation,
            &ctx.settings.keys,
        )
    else {
        return arrive(nav.goal, now);
    };

    let steps = movement::payload(
        primitive,
        direction,
        &ctx.settings.keys,
        &ctx.settings.navigation,
    );
    let action = Action::immediate(movement_label(primitive, direction), steps)
        .with_priority(MOVEMENT_PRIORITY);

    nav.movement = Some(Movement {
        id: action.id,
        primitive,
        submitted_at: now,
        started_at: None,
    });
    if nav.anchor.is_none() {
        nav.anchor = Some(pos);
    }
    (BotState::Navigating(nav), vec![Directive::Submit(action)])
}

/// Start or resume the stall clock once the current movement is dispatched.
fn movement_started(
    mut nav: Navigating,
    id: ActionId,
    ctx: &Context<'_>,
    now: Instant,
) -> Navigating {
    let Some(movement) = nav.movement.as_mut().filter(|m| m.id == id) else {
        return nav;
    };
    movement.started_at = Some(now);
    let waited = now.saturating_duration_since(movement.submitted_at);

    nav.unanswered_since = Some(match nav.unanswered_since {
        // Skip the time spent queued behind other actions.
        Some(since) => (since + waited).min(now),
        None => {
            if let Some(pos) = ctx.obs.position {
                nav.anchor = Some(pos);
            }
            now
        }
    });
    nav
}

fn arrive(goal: Goal, now: Instant) -> (BotState, Vec<Directive>) {
    match goal.action {
        Some(action) => (
            BotState::ExecutingAction(Executing {
                target: goal.target,
                action: action.id,
                started_at: now,
            }),
            vec![Directive::Submit(action)],
        ),
        None => (BotState::Idle, Vec::new()),
    }
}

fn movement_label(primitive: Primitive, direction: Option<Direction>) -> String {
    let name = match primitive {
        Primitive::Walk => "walk",
        Primitive::Jump => "double jump",
        Primitive::UpJump => "up jump",
        Primitive::Grapple => "grapple",
        Primitive::Fall => "fall",
    };
    match direction {
        Some(Direction::Left) => format!("{} left", name),
        Some(Direction::Right) => format!("{} right", name),
        None => name.to_string(),
    }
}

fn enter_unstucking(
    in_flight: Option<ActionId>,
    reason: StuckReason,
    ctx: &Context<'_>,
    now: Instant,
) -> (BotState, Vec<Directive>) {
    let mut directives = Vec::new();
    if let Some(id) = in_flight {
        directives.push(Directive::Cancel(id));
    }
    directives.push(Directive::ReleaseAllKeys);
    directives.push(Directive::Redetect);

    let unstucking = Unstucking {
        retry: 0,
        since: now,
        reason,
        stuck_at: ctx.obs.position,
        attempt: None,
        stable_since: None,
        exhausted: false,
    };
    let (unstucking, submit) = start_attempt(unstucking, ctx, now);
    directives.push(submit);
    (BotState::Unstucking(unstucking), directives)
}

fn start_attempt(mut u: Unstucking, ctx: &Context<'_>, now: Instant) -> (Unstucking, Directive) {
    let strategy = RecoveryStrategy::choose(
        u.retry,
        ctx.obs.last_known,
        ctx.obs.bounds,
        &ctx.settings.recovery,
        ctx.roll,
    );
    let action = Action::immediate(strategy.label(), strategy.payload(&ctx.settings.keys))
        .with_priority(RECOVERY_PRIORITY);
    u.attempt = Some(RecoveryAttempt {
        id: action.id,
        strategy,
        started_at: now,
        finished: false,
    });
    (u, Directive::Submit(action))
}

fn unstucking_perception(
    mut u: Unstucking,
    ctx: &Context<'_>,
    now: Instant,
) -> (BotState, Vec<Directive>) {
    let mut directives = Vec::new();
    let running = u.attempt.as_ref().filter(|a| !a.finished).map(|a| a.id);

    // A stall only counts as resolved once the player has moved off the spot.
    let acceptable = match (ctx.obs.position, u.reason) {
        (Some(_), StuckReason::PositionLost) => true,
        (Some(pos), StuckReason::NoProgress) => u.stuck_at != Some(pos),
        (None, _) => false,
    };
    if acceptable {
        let since = *u.stable_since.get_or_insert(now);
        if now.saturating_duration_since(since) >= ctx.settings.recovery.confirmation_window() {
            if let Some(id) = running {
                directives.push(Directive::Cancel(id));
                directives.push(Directive::ReleaseAllKeys);
            }
            return (BotState::Idle, directives);
        }
    } else {
        u.stable_since = None;
    }

    if u.exhausted {
        return (BotState::Unstucking(u), directives);
    }

    let timed_out = u.attempt.as_ref().map_or(true, |a| {
        now.saturating_duration_since(a.started_at) >= ctx.settings.recovery.attempt_timeout()
    });
    if !timed_out {
        return (BotState::Unstucking(u), directives);
    }

    if let Some(id) = running {
        directives.push(Directive::Cancel(id));
        directives.push(Directive::ReleaseAllKeys);
    }
    u.retry += 1;
    u.attempt = None;
    if u.retry >= ctx.settings.recovery.max_retries {
        u.exhausted = true;
        directives.push(Directive::NeedsAttention(ApiError::stuck(u.retry)));
        return (BotState::Unstucking(u), directives);
    }

    let (u, submit) = start_attempt(u, ctx, now);
    directives.push(submit);
    (BotState::Unstucking(u), directives)
}

/// State machine status for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineStatus {
    pub state: String,
    pub retry: u32,
    pub exhausted: bool,
    pub target: Option<Position>,
    pub position: Option<Position>,
    pub pending_goal: bool,
}

/// Owns the current [`BotState`] and everything a transition reads.
pub struct StateMachine {
    state: BotState,
    settings: Settings,
    obs: Observations,
    pending: Option<Goal>,
    rng: StdRng,
}

impl StateMachine {
    pub fn new(settings: Settings, seed: Seed) -> Self {
        Self {
            state: BotState::Idle,
            settings,
            obs: Observations::default(),
            pending: None,
            rng: StdRng::from_seed(seed.0),
        }
    }

    pub fn state(&self) -> &BotState {
        &self.state
    }

    pub fn state_name(&self) -> &'static str {
        self.state.name()
    }

    pub fn retry_count(&self) -> u32 {
        match &self.state {
            BotState::Unstucking(u) => u.retry,
            _ => 0,
        }
    }

    pub fn observations(&self) -> &Observations {
        &self.obs
    }

    /// Goals arriving while an action runs or while recovering wait here.
    fn parks_goals(&self) -> bool {
        matches!(
            self.state,
            BotState::ExecutingAction(_) | BotState::Unstucking(_)
        )
    }

    pub fn handle(&mut self, event: Event<'_>, now: Instant) -> Vec<Directive> {
        if let Event::Perception(detection) = &event {
            self.obs.update(detection, now);
        }

        let event = match event {
            Event::Goal(goal) if self.parks_goals() => {
                self.pending = Some(goal);
                return Vec::new();
            }
            other => other,
        };

        let mut directives = self.step(event, now);

        if matches!(self.state, BotState::Idle) {
            if let Some(goal) = self.pending.take() {
                directives.extend(self.step(Event::Goal(goal), now));
            }
        }
        directives
    }

    fn step(&mut self, event: Event<'_>, now: Instant) -> Vec<Directive> {
        let ctx = Context {
            settings: &self.settings,
            obs: &self.obs,
            roll: self.rng.next_u64(),
        };
        let state = std::mem::take(&mut self.state);
        let (next, directives) = transition(state, &ctx, event, now);
        self.state = next;
        directives
    }

    pub fn status(&self) -> MachineStatus {
        let target = match &self.state {
            BotState::Navigating(nav) => Some(nav.goal.target),
            BotState::ExecutingAction(exec) => Some(exec.target),
            _ => None,
        };
        MachineStatus {
            state: self.state_name().to_string(),
            retry: self.retry_count(),
            exhausted: matches!(&self.state, BotState::Unstucking(u) if u.exhausted),
            target,
            position: self.obs.position,
            pending_goal: self.pending.is_some(),
        }
    }
}
