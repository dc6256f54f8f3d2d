//! Perception samples and UI commands read as JSON lines.
//!
//! The detector and the UI live in other processes; they write one JSON
//! object per line to the agent's stdin:
//!
//! ```text
//! {"type":"detection","quality":"clean","bounds":{"width":200,"height":100},"position":{"x":50,"y":60}}
//! {"type":"goal","x":120,"y":40,"key":"f1"}
//! {"type":"redetect"}
//! {"type":"reconnect"}
//! {"type":"shutdown"}
//! ```
//!
//! Detection positions are image coordinates (`y` growing downward).

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use maplepilot_core::input::{InputTarget, KeyKind, KeyRequest};
use maplepilot_core::localization::{Detector, MinimapBounds, MinimapQuality, Position, Sample};
use maplepilot_core::player::Goal;
use maplepilot_core::scheduler::{Action, ActionStep};
use serde::Deserialize;
use tokio::io::AsyncBufRead;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::control::UiCommand;
use crate::wire::{read_line_bounded, MAX_LINE_SIZE};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedMessage {
    Detection {
        quality: MinimapQuality,
        #[serde(default)]
        bounds: Option<MinimapBounds>,
        #[serde(default)]
        position: Option<Position>,
    },
    Goal {
        x: i32,
        y: i32,
        /// Key to press on arrival.
        #[serde(default)]
        key: Option<KeyKind>,
        /// 0 lets the seeded key timing pick the hold time.
        #[serde(default)]
        hold_ms: u64,
    },
    Redetect,
    Reconnect,
    Shutdown,
}

impl FeedMessage {
    fn into_goal(x: i32, y: i32, key: Option<KeyKind>, hold_ms: u64) -> Goal {
        let target = Position::new(x, y);
        match key {
            Some(key) => {
                let press = ActionStep::Input(InputTarget::Key(KeyRequest {
                    key,
                    down_ms: hold_ms,
                }));
                let action = Action::immediate(format!("{} at ({}, {})", key, x, y), vec![press]);
                Goal::with_action(target, action)
            }
            None => Goal::go_to(target),
        }
    }
}

/// Detector fed from outside. Cloning shares the same latest sample.
#[derive(Debug, Clone, Default)]
pub struct FeedDetector {
    latest: Arc<Mutex<Option<Sample>>>,
}

impl FeedDetector {
    pub fn new() -> Self {
        Self::default()
    }

    fn latest_mut(&self) -> MutexGuard<'_, Option<Sample>> {
        self.latest.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, sample: Sample) {
        *self.latest_mut() = Some(sample);
    }
}

impl Detector for FeedDetector {
    fn latest(&self) -> Option<Sample> {
        *self.latest_mut()
    }

    fn request_redetect(&self) {
        // Whatever arrives next is the fresh crop.
        self.latest_mut().take();
    }
}

/// Read the feed until EOF, updating `detector` and forwarding commands.
pub async fn run_feed<R: AsyncBufRead + Unpin>(
    mut reader: R,
    detector: FeedDetector,
    commands: mpsc::Sender<UiCommand>,
) {
    let mut line = String::new();
    loop {
        line.clear();
        match read_line_bounded(&mut reader, &mut line, MAX_LINE_SIZE).await {
            Ok(0) => {
                info!("Perception feed closed");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Perception feed read failed: {}", e);
                return;
            }
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let message = match serde_json::from_str::<FeedMessage>(trimmed) {
            Ok(message) => message,
            Err(e) => {
                warn!("Ignoring malformed feed line: {}", e);
                continue;
            }
        };

        let command = match message {
            FeedMessage::Detection {
                quality,
                bounds,
                position,
            } => {
                detector.push(Sample {
                    quality,
                    bounds,
                    position,
                    captured_at: Instant::now(),
                });
                continue;
            }
            FeedMessage::Goal {
                x,
                y,
                key,
                hold_ms,
            } => UiCommand::Goal(FeedMessage::into_goal(x, y, key, hold_ms)),
            FeedMessage::Redetect => UiCommand::Redetect,
            FeedMessage::Reconnect => UiCommand::Reconnect,
            FeedMessage::Shutdown => UiCommand::Shutdown,
        };

        debug!("Feed command: {:?}", command);
        if commands.send(command).await.is_err() {
            debug!("Control loop gone, stopping feed");
            return;
        }
    }
}
