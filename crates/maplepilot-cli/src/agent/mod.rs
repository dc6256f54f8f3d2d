//! The bot process: session, control loop, dispatch and perception feed.

pub mod control;
pub mod dispatch;
pub mod feed;
pub mod session;

pub use control::{ControlLoop, StatusReport};
pub use feed::{run_feed, FeedDetector};
pub use session::{ConnectionState, Session};
