//! Interactive exec sessions
//!
//! Bridges a remote command stream in a container to a browser-side duplex
//! transport carrying JSON envelopes.

mod bridge;
mod message;
mod registry;
mod remote;

pub use bridge::{
    CloseReason, ExecBridge, ExecRequest, ExecTransport, InboundStream, OutboundSink,
};
pub use message::{ExecMessage, Utf8Decoder};
pub use registry::{ExecRegistry, ExecSessionInfo, ExecState};
pub use remote::{
    ExecBackend, ExecTarget, KubeExecBackend, RemoteGuard, RemoteReader, RemoteSession,
    RemoteWriter, DEFAULT_COMMAND,
};
