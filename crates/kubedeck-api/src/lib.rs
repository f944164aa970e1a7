//! HTTP adapters for the kubedeck dashboard
//!
//! Handlers sit on top of these pieces:
//!
//! - [`sse`] answers a refresh operation as one JSON snapshot or a live
//!   server-sent event stream
//! - [`websocket`] carries an exec session over an upgraded connection
//! - [`resources`] lists, fetches and deletes any kind on any saved target
//! - [`error`] renders core errors as Kubernetes `Status` responses

#![deny(missing_docs)]

pub mod error;
pub mod resources;
pub mod sse;
pub mod state;
pub mod websocket;

pub use error::{ApiError, ApiResult};
pub use resources::{ResourceAccess, ResourceKind};
pub use sse::{feed_response, wants_event_stream};
pub use state::AppState;
pub use websocket::{exec_upgrade, has_websocket_upgrade_headers, ExecQuery};
