//! Core types and logic for maplepilot.
//!
//! Everything here is synchronous and free of I/O: the CLI crate owns the
//! control loop, the input backends and the remote executor, and drives
//! these types from it.
//!
//! # Modules
//!
//! - [`localization`]: turns detector output into trusted detection results
//! - [`player`]: the recovery-aware bot state machine
//! - [`scheduler`]: interval and one-shot actions sharing one input slot
//! - [`movement`]: walk/jump selection and the key sequences behind them
//! - [`input`]: key and mouse requests, coordinate modes, seeded key timing
//! - [`protocol`]: JSON-line protocol spoken with a remote input executor
//! - [`settings`]: configuration values and their defaults
//! - [`error`]: error codes with operator-facing suggestions
//!
//! # Data flow
//!
//! ```text
//! Detector -> LocalizationAdapter -> StateMachine -> Scheduler -> backend
//! ```
//!
//! The state machine never touches the scheduler directly. It returns
//! [`player::Directive`]s, and the control loop applies them.

pub mod error;
pub mod input;
pub mod localization;
pub mod movement;
pub mod player;
pub mod protocol;
pub mod scheduler;
pub mod settings;
