//! The single control loop.
//!
//! Every tick runs, in this order: finished actions, UI commands,
//! perception, state machine, scheduler, dispatch, status. Nothing in
//! here awaits the input backend; dispatches run on their own tasks and
//! report back through the completion channel.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use maplepilot_core::error::ApiError;
use maplepilot_core::input::KeyKind;
use maplepilot_core::localization::{Detector, LocalizationAdapter, MinimapQuality};
use maplepilot_core::player::{Directive, Event, Goal, MachineStatus, StateMachine};
use maplepilot_core::scheduler::{ActionStatus, Scheduler};
use maplepilot_core::settings::{BackendKind, Settings};
use serde::Serialize;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::dispatch::{Completion, Dispatcher};
use super::session::{ConnectionState, Session};

/// How many recent warnings the status report keeps.
const MAX_WARNINGS: usize = 16;

/// Commands from the UI layer.
#[derive(Debug)]
pub enum UiCommand {
    Goal(Goal),
    Redetect,
    /// Retry the backend connection after it was given up on.
    Reconnect,
    Shutdown,
}

/// Everything the UI shows. Published on every tick.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub machine: MachineStatus,
    pub actions: Vec<ActionStatus>,
    pub backend: BackendKind,
    pub connection: ConnectionState,
    pub quality: Option<MinimapQuality>,
    pub held_keys: Vec<KeyKind>,
    /// Recent contention and perception warnings, oldest first.
    pub warnings: Vec<ApiError>,
    /// Set when the bot cannot continue without a human.
    pub attention: Option<ApiError>,
    pub updated_at: DateTime<Utc>,
}

pub struct ControlLoop {
    settings: Settings,
    session: Arc<Session>,
    adapter: LocalizationAdapter,
    machine: StateMachine,
    scheduler: Scheduler,
    dispatcher: Dispatcher,
    completions: mpsc::UnboundedReceiver<Completion>,
    commands: mpsc::Receiver<UiCommand>,
    status: watch::Sender<StatusReport>,
    warnings: VecDeque<ApiError>,
    attention: Option<ApiError>,
    last_quality: Option<MinimapQuality>,
    last_state: &'static str,
}

impl ControlLoop {
    /// Build the loop and submit the configured interval actions.
    pub fn new(
        settings: Settings,
        session: Arc<Session>,
        detector: Box<dyn Detector>,
        commands: mpsc::Receiver<UiCommand>,
    ) -> Result<(Self, watch::Receiver<StatusReport>), ApiError> {
        let now = Instant::now();
        let mut scheduler = Scheduler::new(settings.scheduler.deferral_cap);
        for config in &settings.interval_actions {
            let action = config.to_action();
            debug!("Scheduling '{}' every {}ms", action.label, config.every_ms);
            scheduler.submit(action, now)?;
        }

        let (completion_tx, completions) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(session.clone(), settings.timing, completion_tx);
        let machine = StateMachine::new(settings.clone(), session.seed());
        let adapter = LocalizationAdapter::new(detector, settings.timeouts.detector());

        let report = StatusReport {
            machine: machine.status(),
            actions: scheduler.snapshot(now),
            backend: session.backend_kind(),
            connection: session.connection_state(),
            quality: None,
            held_keys: Vec::new(),
            warnings: Vec::new(),
            attention: None,
            updated_at: Utc::now(),
        };
        let (status, status_rx) = watch::channel(report);

        let control = Self {
            settings,
            session,
            adapter,
            machine,
            scheduler,
            dispatcher,
            completions,
            commands,
            status,
            warnings: VecDeque::new(),
            attention: None,
            last_quality: None,
            last_state: "idle",
        };
        Ok((control, status_rx))
    }

    /// Run until `shutdown` fires or a `Shutdown` command arrives.
    pub async fn run(mut self, shutdown: Arc<Notify>) {
        let mut ticker = tokio::time::interval(self.settings.scheduler.tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            "Control loop running every {}ms",
            self.settings.scheduler.tick_ms
        );

        loop {
            tokio::select! {
                tick = ticker.tick() => {
                    if !self.step(tick.into_std()) {
                        break;
                    }
                }
                _ = shutdown.notified() => break,
            }
        }

        info!("Control loop stopping, releasing keys");
        self.dispatcher.shutdown().await;
    }

    /// One tick. Returns false once a shutdown was requested.
    pub fn step(&mut self, now: Instant) -> bool {
        while let Ok(Completion { id, outcome }) = self.completions.try_recv() {
            self.dispatcher.finished(id);
            if let Some(took) = self.scheduler.complete(id, now) {
                debug!("{} finished after {:?}: {:?}", id, took, outcome);
            }
            let directives = self
                .machine
                .handle(Event::ActionFinished { id, outcome }, now);
            self.apply(directives, now);
        }

        while let Ok(command) = self.commands.try_recv() {
            match command {
                UiCommand::Goal(goal) => {
                    info!("New goal: {:?}", goal.target);
                    let directives = self.machine.handle(Event::Goal(goal), now);
                    self.apply(directives, now);
                }
                UiCommand::Redetect => {
                    info!("Re-detect requested");
                    self.adapter.redetect();
                }
                UiCommand::Reconnect => {
                    info!("Reconnect requested");
                    self.session.request_reconnect();
                }
                UiCommand::Shutdown => return false,
            }
        }

        let detection = self.adapter.detect(now);
        let quality = detection.quality();
        if self.last_quality != Some(quality) {
            if quality == MinimapQuality::Degraded {
                let err = ApiError::perception_uncertain("Minimap is not cleanly cropped");
                debug!("{}", err);
                self.record_warning(err);
            } else {
                debug!("Minimap quality: {:?}", quality);
            }
            self.last_quality = Some(quality);
        }
        let directives = self.machine.handle(Event::Perception(&detection), now);
        self.apply(directives, now);

        let outcome = self.scheduler.tick(now);
        for warning in &outcome.contention {
            let err = ApiError::from(warning);
            warn!("{}", err);
            self.record_warning(err);
        }
        if let Some(ready) = outcome.ready {
            let id = ready.action.id;
            self.dispatcher.dispatch(ready);
            let directives = self.machine.handle(Event::ActionStarted { id }, now);
            self.apply(directives, now);
        }

        let state = self.machine.state_name();
        if state != self.last_state {
            info!("State: {} -> {}", self.last_state, state);
            if state == "idle" && self.last_state == "unstucking" {
                self.attention = None;
            }
            self.last_state = state;
        }

        self.publish(now);
        true
    }

    fn apply(&mut self, directives: Vec<Directive>, now: Instant) {
        for directive in directives {
            match directive {
                Directive::Submit(action) => {
                    let label = action.label.clone();
                    if let Err(e) = self.scheduler.submit(action, now) {
                        warn!("Could not schedule '{}': {}", label, e);
                        self.record_warning(e.into());
                    }
                }
                Directive::Cancel(id) => {
                    self.scheduler.cancel(id);
                    self.dispatcher.cancel(id);
                }
                Directive::ReleaseAllKeys => self.dispatcher.release_all(),
                Directive::NeedsAttention(err) => {
                    error!("{}", err);
                    self.attention = Some(err);
                }
                Directive::Redetect => self.adapter.redetect(),
            }
        }
    }

    fn record_warning(&mut self, err: ApiError) {
        if self.warnings.len() == MAX_WARNINGS {
            self.warnings.pop_front();
        }
        self.warnings.push_back(err);
    }

    fn publish(&self, now: Instant) {
        let connection = self.session.connection_state();
        let attention = self.attention.clone().or_else(|| match &connection {
            ConnectionState::Unreachable { error } => Some(error.clone()),
            _ => None,
        });
        self.status.send_replace(StatusReport {
            machine: self.machine.status(),
            actions: self.scheduler.snapshot(now),
            backend: self.session.backend_kind(),
            connection,
            quality: self.last_quality,
            held_keys: self.dispatcher.held_keys(),
            warnings: self.warnings.iter().cloned().collect(),
            attention,
            updated_at: Utc::now(),
        });
    }
}
