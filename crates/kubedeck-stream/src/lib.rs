//! Push-streaming and interactive sessions over cached clients
//!
//! - [`feed::LiveFeed`] turns a refresh operation into a live feed of snapshots
//! - [`exec::ExecBridge`] relays a remote shell to a duplex transport

#![deny(missing_docs)]

pub mod exec;
pub mod feed;

pub use exec::{ExecBridge, ExecMessage, ExecRequest, ExecTransport};
pub use feed::{FeedEvent, FeedHandle, FeedSink, LiveFeed};
