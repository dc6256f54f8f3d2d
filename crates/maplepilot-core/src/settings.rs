//! Read-only configuration values.
//!
//! Every field has a default so a partial (or missing) settings file still
//! yields a usable configuration. Loading from disk happens in the CLI.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::input::{
    CoordinateMode, InputTarget, KeyKind, KeyRequest, KeyTimingConfig, WindowRect,
};
use crate::scheduler::{Action, ActionStep};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Mode mouse coordinates are produced in.
    pub coordinate_mode: CoordinateMode,
    pub keys: KeyBindings,
    pub navigation: NavigationSettings,
    pub recovery: RecoverySettings,
    pub scheduler: SchedulerSettings,
    pub timing: KeyTimingConfig,
    pub timeouts: TimeoutSettings,
    pub backend: BackendSettings,
    /// Captured game window, used for `Relative` → `Screen` conversion.
    pub window: WindowRect,
    pub interval_actions: Vec<IntervalActionConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyBindings {
    pub jump: KeyKind,
    /// Dedicated up-jump skill. Without one, up-jump is up + jump.
    pub up_jump: Option<KeyKind>,
    /// Rope lift skill, used for mid-sized climbs when bound.
    pub grapple: Option<KeyKind>,
    /// Closes dialogs during recovery.
    pub escape: KeyKind,
}

impl Default for KeyBindings {
    fn default() -> Self {
        Self {
            jump: KeyKind::Space,
            up_jump: None,
            grapple: None,
            escape: KeyKind::Esc,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NavigationSettings {
    /// Horizontal distance at and above which movement jumps instead of walking.
    pub jump_threshold: i32,
    pub arrival_threshold: i32,
    pub arrival_y_threshold: i32,
    pub walk_hold_ms: u64,
    /// Delay between the two presses of a double jump.
    pub double_jump_delay_ms: u64,
    /// Time to wait for the character to land after a jump.
    pub jump_settle_ms: u64,
    /// How long the rope lift runs before it is cancelled with a second press.
    pub grapple_hold_ms: u64,
    /// Dispatched movement with no position change for this long means stuck.
    pub movement_timeout_ms: u64,
}

impl Default for NavigationSettings {
    fn default() -> Self {
        Self {
            jump_threshold: 25,
            arrival_threshold: 3,
            arrival_y_threshold: 2,
            walk_hold_ms: 150,
            double_jump_delay_ms: 80,
            jump_settle_ms: 300,
            grapple_hold_ms: 900,
            movement_timeout_ms: 2000,
        }
    }
}

impl NavigationSettings {
    pub fn walk_hold(&self) -> Duration {
        Duration::from_millis(self.walk_hold_ms)
    }

    pub fn double_jump_delay(&self) -> Duration {
        Duration::from_millis(self.double_jump_delay_ms)
    }

    pub fn jump_settle(&self) -> Duration {
        Duration::from_millis(self.jump_settle_ms)
    }

    pub fn grapple_hold(&self) -> Duration {
        Duration::from_millis(self.grapple_hold_ms)
    }

    pub fn movement_timeout(&self) -> Duration {
        Duration::from_millis(self.movement_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverySettings {
    /// How long the position may be missing while the minimap is visible.
    pub position_grace_ms: u64,
    /// How long a re-acquired position must stay before recovery counts.
    pub confirmation_window_ms: u64,
    pub attempt_timeout_ms: u64,
    pub max_retries: u32,
    /// Positions this close to the top edge skip jumping during recovery.
    pub top_edge_margin: i32,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            position_grace_ms: 3000,
            confirmation_window_ms: 1000,
            attempt_timeout_ms: 3000,
            max_retries: 5,
            top_edge_margin: 18,
        }
    }
}

impl RecoverySettings {
    pub fn position_grace(&self) -> Duration {
        Duration::from_millis(self.position_grace_ms)
    }

    pub fn confirmation_window(&self) -> Duration {
        Duration::from_millis(self.confirmation_window_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub deferral_cap: u32,
    pub tick_ms: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            deferral_cap: 5,
            tick_ms: 33,
        }
    }
}

impl SchedulerSettings {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    /// Detector samples older than this are treated as lost.
    pub detector_ms: u64,
    pub remote_request_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            detector_ms: 500,
            remote_request_ms: 2000,
        }
    }
}

impl TimeoutSettings {
    pub fn detector(&self) -> Duration {
        Duration::from_millis(self.detector_ms)
    }

    pub fn remote_request(&self) -> Duration {
        Duration::from_millis(self.remote_request_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Local,
    Remote,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Local => write!(f, "local"),
            BackendKind::Remote => write!(f, "remote"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    pub kind: BackendKind,
    /// `host:port` of the remote input executor.
    pub address: String,
    pub connect_attempts: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            kind: BackendKind::Local,
            address: "127.0.0.1:5901".to_string(),
            connect_attempts: 5,
            backoff_initial_ms: 250,
            backoff_max_ms: 5000,
        }
    }
}

impl BackendSettings {
    /// Delay before reconnect attempt `attempt` (0-based): doubled each
    /// time, capped at `backoff_max_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let ms = self
            .backoff_initial_ms
            .saturating_mul(factor)
            .min(self.backoff_max_ms);
        Duration::from_millis(ms)
    }
}

/// A recurring key press, such as a buff or pet food.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntervalActionConfig {
    pub label: String,
    pub key: KeyKind,
    pub every_ms: u64,
    pub priority: i32,
    pub start_after_ms: u64,
    pub count: u32,
    /// Hold time per press. 0 lets the seeded key timing decide.
    pub hold_ms: u64,
    pub wait_before_ms: u64,
    pub wait_after_ms: u64,
}

impl Default for IntervalActionConfig {
    fn default() -> Self {
        Self {
            label: String::new(),
            key: KeyKind::A,
            every_ms: 0,
            priority: 0,
            start_after_ms: 0,
            count: 1,
            hold_ms: 0,
            wait_before_ms: 0,
            wait_after_ms: 0,
        }
    }
}

impl IntervalActionConfig {
    pub fn to_action(&self) -> Action {
        let mut payload = Vec::new();
        if self.wait_before_ms > 0 {
            payload.push(ActionStep::Wait(Duration::from_millis(self.wait_before_ms)));
        }
        for _ in 0..self.count.max(1) {
            payload.push(ActionStep::Input(InputTarget::Key(KeyRequest {
                key: self.key,
                down_ms: self.hold_ms,
            })));
        }
        if self.wait_after_ms > 0 {
            payload.push(ActionStep::Wait(Duration::from_millis(self.wait_after_ms)));
        }

        let label = if self.label.is_empty() {
            format!("{} every {}ms", self.key, self.every_ms)
        } else {
            self.label.clone()
        };
        Action::interval(label, Duration::from_millis(self.every_ms), payload)
            .with_priority(self.priority)
            .starting_after(Duration::from_millis(self.start_after_ms))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("navigation.jump_threshold must be positive, got {0}")]
    JumpThreshold(i32),
    #[error("navigation.arrival_threshold ({arrival}) must be below jump_threshold ({jump})")]
    ArrivalThreshold { arrival: i32, jump: i32 },
    #[error("scheduler.{0} must be positive")]
    ZeroScheduler(&'static str),
    #[error("recovery.max_retries must be positive")]
    ZeroRetries,
    #[error("backend.connect_attempts must be positive")]
    ZeroConnectAttempts,
    #[error("backend.address is required for the remote backend")]
    MissingAddress,
    #[error("interval action '{0}' needs every_ms > 0")]
    ZeroInterval(String),
}

impl Settings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        let nav = &self.navigation;
        if nav.jump_threshold <= 0 {
            return Err(SettingsError::JumpThreshold(nav.jump_threshold));
        }
        if nav.arrival_threshold >= nav.jump_threshold {
            return Err(SettingsError::ArrivalThreshold {
                arrival: nav.arrival_threshold,
                jump: nav.jump_threshold,
            });
        }
        if self.scheduler.deferral_cap == 0 {
            return Err(SettingsError::ZeroScheduler("deferral_cap"));
        }
        if self.scheduler.tick_ms == 0 {
            return Err(SettingsError::ZeroScheduler("tick_ms"));
        }
        if self.recovery.max_retries == 0 {
            return Err(SettingsError::ZeroRetries);
        }
        if self.backend.connect_attempts == 0 {
            return Err(SettingsError::ZeroConnectAttempts);
        }
        if self.backend.kind == BackendKind::Remote && self.backend.address.trim().is_empty() {
            return Err(SettingsError::MissingAddress);
        }
        if let Some(bad) = self.interval_actions.iter().find(|a| a.every_ms == 0) {
            return Err(SettingsError::ZeroInterval(bad.label.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ActionKind;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.navigation.jump_threshold, 25);
        assert_eq!(settings.scheduler.deferral_cap, 5);
        assert_eq!(settings.recovery.position_grace(), Duration::from_secs(3));
        assert_eq!(settings.recovery.confirmation_window(), Duration::from_secs(1));
        assert_eq!(settings.backend.kind, BackendKind::Local);
        assert_eq!(settings.coordinate_mode, CoordinateMode::Relative);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_document_fills_defaults() {
        let json = r#"{"navigation":{"jump_threshold":30},"keys":{"jump":"alt"}}"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.navigation.jump_threshold, 30);
        assert_eq!(settings.navigation.walk_hold_ms, 150);
        assert_eq!(settings.keys.jump, KeyKind::Alt);
        assert_eq!(settings.keys.escape, KeyKind::Esc);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let backend = BackendSettings {
            backoff_initial_ms: 100,
            backoff_max_ms: 1000,
            ..Default::default()
        };
        assert_eq!(backend.backoff(0), Duration::from_millis(100));
        assert_eq!(backend.backoff(1), Duration::from_millis(200));
        assert_eq!(backend.backoff(3), Duration::from_millis(800));
        assert_eq!(backend.backoff(4), Duration::from_millis(1000));
        assert_eq!(backend.backoff(60), Duration::from_millis(1000));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut settings = Settings::default();
        settings.navigation.arrival_threshold = 25;
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::ArrivalThreshold { .. })
        ));

        let mut settings = Settings::default();
        settings.backend.kind = BackendKind::Remote;
        settings.backend.address = " ".into();
        assert_eq!(settings.validate(), Err(SettingsError::MissingAddress));

        let mut settings = Settings::default();
        settings.interval_actions.push(IntervalActionConfig {
            label: "buff".into(),
            ..Default::default()
        });
        assert_eq!(
            settings.validate(),
            Err(SettingsError::ZeroInterval("buff".into()))
        );
    }

    #[test]
    fn test_interval_action_config_to_action() {
        let config = IntervalActionConfig {
            label: "pet food".into(),
            key: KeyKind::F5,
            every_ms: 2000,
            priority: 2,
            count: 2,
            wait_after_ms: 1000,
            ..Default::default()
        };

        let action = config.to_action();
        assert_eq!(action.kind, ActionKind::Interval);
        assert_eq!(action.interval, Some(Duration::from_millis(2000)));
        assert_eq!(action.priority, 2);
        let press = ActionStep::Input(InputTarget::Key(KeyRequest {
            key: KeyKind::F5,
            down_ms: 0,
        }));
        assert_eq!(
            action.payload,
            vec![press, press, ActionStep::Wait(Duration::from_millis(1000))]
        );
    }

    #[test]
    fn test_unnamed_interval_action_gets_label() {
        let config = IntervalActionConfig {
            key: KeyKind::Three,
            every_ms: 500,
            ..Default::default()
        };
        assert_eq!(config.to_action().label, "three every 500ms");
    }
}
