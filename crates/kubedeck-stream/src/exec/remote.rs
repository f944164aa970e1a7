//! Remote side of an exec session

use async_trait::async_trait;
use futures::channel::mpsc as resize_channel;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, AttachedProcess, TerminalSize};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use kubedeck_common::{Error, Result};
use kubedeck_credentials::ClientHandle;

/// Shell started when the caller gives no command
pub const DEFAULT_COMMAND: &str = "/bin/sh";

/// What to run, and where
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecTarget {
    /// Namespace of the pod
    pub namespace: String,
    /// Pod name
    pub pod: String,
    /// Container name; `None` lets the API server pick the only container
    pub container: Option<String>,
    /// Command and arguments
    pub command: Vec<String>,
    /// Allocate a pseudo-terminal
    pub tty: bool,
}

/// Boxed remote stdin
pub type RemoteWriter = Box<dyn AsyncWrite + Unpin + Send>;
/// Boxed remote stdout or stderr
pub type RemoteReader = Box<dyn AsyncRead + Unpin + Send>;

/// An open remote command stream
pub struct RemoteSession {
    /// Process input
    pub stdin: RemoteWriter,
    /// Process output
    pub stdout: RemoteReader,
    /// Process error output; merged into stdout when a TTY is allocated
    pub stderr: Option<RemoteReader>,
    /// Terminal size updates, TTY sessions only
    pub resize: Option<resize_channel::Sender<TerminalSize>>,
    /// Tears down the remote process when dropped
    pub guard: RemoteGuard,
}

impl RemoteSession {
    /// Session over arbitrary streams, with nothing to tear down
    pub fn from_streams(
        stdin: RemoteWriter,
        stdout: RemoteReader,
        stderr: Option<RemoteReader>,
    ) -> Self {
        Self {
            stdin,
            stdout,
            stderr,
            resize: None,
            guard: RemoteGuard::default(),
        }
    }
}

/// Aborts the attached process on drop
#[derive(Default)]
pub struct RemoteGuard(Option<AttachedProcess>);

impl Drop for RemoteGuard {
    fn drop(&mut self) {
        if let Some(process) = self.0.take() {
            debug!("Releasing remote exec stream");
            process.abort();
        }
    }
}

/// Opens remote command streams
#[async_trait]
pub trait ExecBackend: Send + Sync {
    /// Negotiate a command stream for `target` using `handle`
    async fn attach(&self, handle: &ClientHandle, target: &ExecTarget) -> Result<RemoteSession>;
}

/// Exec through the pod `exec` subresource
#[derive(Clone, Copy, Debug, Default)]
pub struct KubeExecBackend;

#[async_trait]
impl ExecBackend for KubeExecBackend {
    async fn attach(&self, handle: &ClientHandle, target: &ExecTarget) -> Result<RemoteSession> {
        let pods: Api<Pod> = Api::namespaced(handle.client().clone(), &target.namespace);
        let params = AttachParams {
            stdin: true,
            stdout: true,
            stderr: !target.tty,
            tty: target.tty,
            container: target.container.clone(),
            max_stdin_buf_size: None,
            max_stdout_buf_size: None,
            max_stderr_buf_size: None,
        };

        let mut attached = pods
            .exec(&target.pod, target.command.clone(), &params)
            .await
            .map_err(|e| Error::bridge(format!("exec failed: {}", e)))?;

        let stdin = attached
            .stdin()
            .ok_or_else(|| Error::bridge("remote stream has no stdin"))?;
        let stdout = attached
            .stdout()
            .ok_or_else(|| Error::bridge("remote stream has no stdout"))?;
        let stderr = attached
            .stderr()
            .map(|reader| Box::new(reader) as RemoteReader);
        let resize = if target.tty {
            attached.terminal_size()
        } else {
            None
        };

        Ok(RemoteSession {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr,
            resize,
            guard: RemoteGuard(Some(attached)),
        })
    }
}
