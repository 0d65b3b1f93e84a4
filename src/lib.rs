//! tidepool: per-user IRC connections for a chat bridge.
//!
//! Every bridged user gets their own IRC connection. Many of those
//! connections sit in the same channels and see the same lines, so the
//! crate elects one reporter per distinct event before anything reaches
//! the [`bridge::handler::RoomHandler`].

pub mod bridge;
pub mod config;
pub mod error;
pub mod irc;
pub mod util;
