//! Runs granted actions against the input backend.
//!
//! Every action runs on its own task so a slow backend never stalls the
//! control loop. The outcome comes back as a [`Completion`] on a channel.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use maplepilot_core::error::ApiError;
use maplepilot_core::input::{
    InputRequest, InputTarget, KeyKind, KeyRequest, KeyTiming, KeyTimingConfig,
};
use maplepilot_core::player::ActionOutcome;
use maplepilot_core::scheduler::{Action, ActionId, ActionStep, ReadyAction};
use maplepilot_core::settings::BackendKind;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::session::{ConnectionState, Session};
use crate::backend::{BackendError, InputBackend};

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub id: ActionId,
    pub outcome: ActionOutcome,
}

/// State shared between the dispatcher and its action tasks.
struct Shared {
    session: Arc<Session>,
    timing: Mutex<KeyTiming>,
    /// Keys we pressed and have not released yet.
    held: Mutex<HashSet<KeyKind>>,
}

impl Shared {
    fn timing(&self) -> MutexGuard<'_, KeyTiming> {
        self.timing.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn held(&self) -> MutexGuard<'_, HashSet<KeyKind>> {
        self.held.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct Dispatcher {
    shared: Arc<Shared>,
    running: HashMap<ActionId, JoinHandle<()>>,
    release: Option<JoinHandle<()>>,
    completions: mpsc::UnboundedSender<Completion>,
}

impl Dispatcher {
    pub fn new(
        session: Arc<Session>,
        timing: KeyTimingConfig,
        completions: mpsc::UnboundedSender<Completion>,
    ) -> Self {
        let timing = KeyTiming::from_seed(session.seed(), timing);
        Self {
            shared: Arc::new(Shared {
                session,
                timing: Mutex::new(timing),
                held: Mutex::new(HashSet::new()),
            }),
            running: HashMap::new(),
            release: None,
            completions,
        }
    }

    /// Start running a granted action.
    pub fn dispatch(&mut self, ready: ReadyAction) {
        let ReadyAction { slot, action } = ready;
        let id = action.id;
        debug!("Dispatching {} '{}' in slot {:?}", id, action.label, slot.slot);

        let shared = Arc::clone(&self.shared);
        let completions = self.completions.clone();
        // A pending "release all keys" goes out before anything new.
        let release = self.release.take();

        let handle = tokio::spawn(async move {
            if let Some(release) = release {
                let _ = release.await;
            }
            let outcome = match run_action(&shared, &action).await {
                Ok(()) => ActionOutcome::Completed,
                Err(err) => {
                    warn!("Action '{}' failed: {}", action.label, err);
                    ActionOutcome::Failed(err)
                }
            };
            let _ = completions.send(Completion { id, outcome });
        });
        self.running.insert(id, handle);
    }

    /// Abort a running action. Keys it was holding stay down until
    /// [`release_all`](Self::release_all).
    pub fn cancel(&mut self, id: ActionId) -> bool {
        match self.running.remove(&id) {
            Some(handle) => {
                handle.abort();
                debug!("Cancelled {}", id);
                true
            }
            None => false,
        }
    }

    /// Forget a finished action's task.
    pub fn finished(&mut self, id: ActionId) {
        self.running.remove(&id);
    }

    /// Release every key we know to be down.
    pub fn release_all(&mut self) {
        let keys: Vec<KeyKind> = self.shared.held().drain().collect();
        if keys.is_empty() {
            return;
        }
        debug!("Releasing {} held key(s)", keys.len());

        let shared = Arc::clone(&self.shared);
        let previous = self.release.take();
        self.release = Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            let Some(backend) = shared.session.backend().await else {
                warn!("No input backend to release keys on");
                return;
            };
            for key in keys {
                if let Err(e) = backend.send(&InputRequest::key_up(key)).await {
                    warn!("Failed to release {}: {}", key, e);
                    shared.session.report_failure(&backend, &e).await;
                    return;
                }
            }
        }));
    }

    pub fn held_keys(&self) -> Vec<KeyKind> {
        self.shared.held().iter().copied().collect()
    }

    /// Abort everything and lift all held keys before returning.
    pub async fn shutdown(&mut self) {
        for (id, handle) in self.running.drain() {
            debug!("Aborting {} on shutdown", id);
            handle.abort();
        }
        self.release_all();
        if let Some(release) = self.release.take() {
            let _ = release.await;
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        for (_, handle) in self.running.drain() {
            handle.abort();
        }
    }
}

async fn run_action(shared: &Shared, action: &Action) -> Result<(), ApiError> {
    for step in &action.payload {
        match *step {
            ActionStep::Wait(duration) => tokio::time::sleep(duration).await,
            ActionStep::Input(target) => {
                let Some(backend) = shared.session.backend().await else {
                    return Err(not_connected(&shared.session));
                };
                if let Err(e) = send_step(shared, backend.as_ref(), target).await {
                    shared.session.report_failure(&backend, &e).await;
                    return Err(e.into());
                }
            }
        }
    }
    Ok(())
}

fn not_connected(session: &Session) -> ApiError {
    match session.connection_state() {
        ConnectionState::Unreachable { error } => error,
        _ => BackendError::Disconnected.into(),
    }
}

async fn send_step(
    shared: &Shared,
    backend: &dyn InputBackend,
    target: InputTarget,
) -> Result<(), BackendError> {
    let target = match target {
        InputTarget::Key(KeyRequest { key, down_ms: 0 }) => InputTarget::Key(KeyRequest {
            key,
            down_ms: shared.timing().next_down_ms(),
        }),
        InputTarget::Mouse(mouse) => {
            InputTarget::Mouse(mouse.convert(backend.coordinate_mode(), shared.session.window()))
        }
        other => other,
    };
    let request = InputRequest { target };

    match target {
        InputTarget::Key(KeyRequest { key, .. }) => {
            // Tracked while in flight so a cancel mid-press can be undone.
            shared.held().insert(key);
            backend.send(&request).await?;
            shared.held().remove(&key);
            if backend.kind() == BackendKind::Local {
                let gap = shared.timing().next_gap();
                tokio::time::sleep(gap).await;
            }
        }
        InputTarget::KeyDown { key } => {
            shared.held().insert(key);
            backend.send(&request).await?;
        }
        InputTarget::KeyUp { key } => {
            backend.send(&request).await?;
            shared.held().remove(&key);
        }
        InputTarget::Mouse(_) => backend.send(&request).await?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::backend::local::tests::RecordingInjector;
    use maplepilot_core::error::ErrorCode;
    use maplepilot_core::input::{MouseAction, MouseRequest, Seed, WindowRect};
    use maplepilot_core::scheduler::{Scheduler, TickOutcome};
    use maplepilot_core::settings::Settings;
    use tokio::sync::Notify;

    struct Harness {
        dispatcher: Dispatcher,
        completions: mpsc::UnboundedReceiver<Completion>,
        injector: Arc<RecordingInjector>,
        shutdown: Arc<Notify>,
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.shutdown.notify_one();
        }
    }

    async fn harness() -> Harness {
        let mut settings = Settings::default();
        settings.window = WindowRect::new(100, 100, 1366, 768);
        let injector = Arc::new(RecordingInjector::default());
        let session = Arc::new(Session::new(&settings, Seed([9; 32]), injector.clone()));

        let shutdown = Arc::new(Notify::new());
        let mut state = session.subscribe();
        session.spawn_connection_manager(shutdown.clone());
        state
            .wait_for(|s| matches!(s, ConnectionState::Connected { .. }))
            .await
            .unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        Harness {
            dispatcher: Dispatcher::new(session, settings.timing, tx),
            completions: rx,
            injector,
            shutdown,
        }
    }

    /// Grant `action` through a scheduler, the way the control loop does.
    fn grant(action: Action) -> ReadyAction {
        let mut scheduler = Scheduler::new(5);
        let now = Instant::now();
        scheduler.submit(action, now).unwrap();
        let TickOutcome { ready, .. } = scheduler.tick(now);
        ready.unwrap()
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Completion>) -> Completion {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("completion in time")
            .expect("channel open")
    }

    #[tokio::test]
    async fn test_runs_steps_in_order() {
        let mut h = harness().await;
        let action = Action::immediate(
            "combo",
            vec![
                ActionStep::Input(InputTarget::Key(KeyRequest {
                    key: KeyKind::A,
                    down_ms: 0,
                })),
                ActionStep::Wait(Duration::from_millis(5)),
                ActionStep::Input(InputTarget::KeyDown { key: KeyKind::Left }),
                ActionStep::Input(InputTarget::KeyUp { key: KeyKind::Left }),
            ],
        );
        let id = action.id;
        h.dispatcher.dispatch(grant(action));

        let done = next(&mut h.completions).await;
        assert_eq!(done.id, id);
        assert_eq!(done.outcome, ActionOutcome::Completed);
        assert_eq!(
            h.injector.events(),
            vec!["down a", "up a", "down left", "up left"]
        );
        assert!(h.dispatcher.held_keys().is_empty());
    }

    #[tokio::test]
    async fn test_relative_mouse_reaches_local_backend_as_screen() {
        let mut h = harness().await;
        let action = Action::immediate(
            "click",
            vec![ActionStep::Input(InputTarget::Mouse(MouseRequest::relative(
                MouseAction::Click,
                10,
                20,
            )))],
        );
        h.dispatcher.dispatch(grant(action));

        next(&mut h.completions).await;
        assert_eq!(h.injector.events(), vec!["Click 110 120"]);
    }

    #[tokio::test]
    async fn test_release_all_lifts_held_keys() {
        let mut h = harness().await;
        let action = Action::immediate(
            "hold",
            vec![ActionStep::Input(InputTarget::KeyDown {
                key: KeyKind::Right,
            })],
        );
        h.dispatcher.dispatch(grant(action));
        next(&mut h.completions).await;
        assert_eq!(h.dispatcher.held_keys(), vec![KeyKind::Right]);

        h.dispatcher.release_all();
        assert!(h.dispatcher.held_keys().is_empty());

        // The release runs before the next action.
        let follow = Action::immediate("noop", vec![ActionStep::Wait(Duration::ZERO)]);
        h.dispatcher.dispatch(grant(follow));
        next(&mut h.completions).await;
        assert_eq!(h.injector.events(), vec!["down right", "up right"]);
    }

    #[tokio::test]
    async fn test_cancel_stops_action() {
        let mut h = harness().await;
        let action = Action::immediate(
            "slow",
            vec![
                ActionStep::Wait(Duration::from_secs(5)),
                ActionStep::Input(InputTarget::KeyDown { key: KeyKind::X }),
            ],
        );
        let id = action.id;
        h.dispatcher.dispatch(grant(action));
        assert_eq!(h.dispatcher.running.len(), 1);

        assert!(h.dispatcher.cancel(id));
        assert!(!h.dispatcher.cancel(id));

        let waited =
            tokio::time::timeout(Duration::from_millis(50), h.completions.recv()).await;
        assert!(waited.is_err());
        assert!(h.injector.events().is_empty());
    }

    #[tokio::test]
    async fn test_no_backend_fails_action() {
        let settings = Settings::default();
        let injector = Arc::new(RecordingInjector::default());
        let session = Arc::new(Session::new(&settings, Seed([9; 32]), injector));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut dispatcher = Dispatcher::new(session, settings.timing, tx);

        let action = Action::immediate(
            "tap",
            vec![ActionStep::Input(InputTarget::Key(KeyRequest {
                key: KeyKind::A,
                down_ms: 10,
            }))],
        );
        dispatcher.dispatch(grant(action));

        match next(&mut rx).await.outcome {
            ActionOutcome::Failed(err) => assert_eq!(err.code, ErrorCode::BackendUnreachable),
            other => panic!("expected failure, got {:?}", other),
        }
    }
}
