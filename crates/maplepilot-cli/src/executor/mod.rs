//! Reference remote input executor.
//!
//! Runs next to the game (or on the machine driving the input device) and
//! serves the remote input protocol over TCP.

pub mod server;

pub use server::{ExecutorConfig, ExecutorServer, MAX_DOWN_MS};
