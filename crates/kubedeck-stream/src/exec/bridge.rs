//! Exec bridge
//!
//! Relays one interactive remote command stream to a duplex transport. Each
//! session runs two relay loops:
//! - input: transport `input` envelopes -> bounded queue -> remote stdin
//! - output: remote stdout/stderr -> `stdout`/`stderr` envelopes -> transport
//!
//! The first loop to finish ends the session; the other is aborted and the
//! remote stream released.

use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{select_all, BoxStream};
use futures::{Sink, SinkExt, StreamExt};
use kube::api::TerminalSize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use kubedeck_common::{Error, Result, Settings};
use kubedeck_credentials::{BundleId, ConnectionCache};

use super::message::{ExecMessage, Utf8Decoder};
use super::registry::{ExecRegistry, ExecSessionInfo, ExecState};
use super::remote::{
    ExecBackend, ExecTarget, RemoteReader, RemoteSession, RemoteWriter, DEFAULT_COMMAND,
};

/// Namespace used when neither the request nor the target names one
const FALLBACK_NAMESPACE: &str = "default";

/// Envelopes arriving from the peer
pub type InboundStream = BoxStream<'static, Result<ExecMessage>>;
/// Envelopes going to the peer
pub type OutboundSink = Pin<Box<dyn Sink<ExecMessage, Error = Error> + Send>>;

/// Peer side of a session
pub struct ExecTransport {
    /// Inbound envelopes; the stream ending means the peer closed
    pub inbound: InboundStream,
    /// Outbound envelopes
    pub outbound: OutboundSink,
}

/// Where to open the remote command
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecRequest {
    /// Bundle holding the target
    pub bundle_id: BundleId,
    /// Target name within the bundle
    pub target: String,
    /// Namespace; defaults to the target's context namespace, then `default`
    pub namespace: Option<String>,
    /// Pod name
    pub pod: String,
    /// Container name
    pub container: Option<String>,
    /// Command; empty runs `/bin/sh`
    pub command: Vec<String>,
    /// Allocate a pseudo-terminal
    pub tty: bool,
}

/// Why an active session ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The transport's inbound side ended
    PeerClosed,
    /// The remote output streams ended
    RemoteClosed,
    /// Cancelled through the registry
    Cancelled,
}

/// Opens exec sessions and relays them to transports
pub struct ExecBridge {
    cache: Arc<ConnectionCache>,
    backend: Arc<dyn ExecBackend>,
    registry: Arc<ExecRegistry>,
    input_queue: usize,
}

impl ExecBridge {
    /// Create a bridge using the input queue capacity from settings
    pub fn new(
        cache: Arc<ConnectionCache>,
        backend: Arc<dyn ExecBackend>,
        settings: &Settings,
    ) -> Self {
        Self::with_input_queue(cache, backend, settings.exec_input_queue)
    }

    /// Create a bridge with an explicit input queue capacity (minimum 1)
    pub fn with_input_queue(
        cache: Arc<ConnectionCache>,
        backend: Arc<dyn ExecBackend>,
        input_queue: usize,
    ) -> Self {
        Self {
            cache,
            backend,
            registry: Arc::new(ExecRegistry::new()),
            input_queue: input_queue.max(1),
        }
    }

    /// Live session registry
    pub fn registry(&self) -> &Arc<ExecRegistry> {
        &self.registry
    }

    /// Run one session to completion.
    ///
    /// Fails without going active when the client cannot be resolved or the
    /// remote stream cannot be negotiated; the peer then receives one `error`
    /// envelope before the outbound side is closed. Relay I/O failures after
    /// that are returned as bridge errors.
    pub async fn open(&self, request: ExecRequest, transport: ExecTransport) -> Result<CloseReason> {
        let ExecTransport {
            inbound,
            mut outbound,
        } = transport;
        let id = Uuid::new_v4();
        let cancel = self.registry.register(ExecSessionInfo {
            id,
            bundle_id: request.bundle_id,
            target: request.target.clone(),
            namespace: request.namespace.clone(),
            pod: request.pod.clone(),
            container: request.container.clone(),
            state: ExecState::Connecting,
            started_at: Utc::now(),
        });
        info!(
            session = %id,
            bundle = %request.bundle_id,
            target = %request.target,
            pod = %request.pod,
            "Exec session connecting"
        );

        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::bridge("cancelled while connecting")),
            connected = self.connect(&request) => connected,
        };
        let remote = match connected {
            Ok(remote) => remote,
            Err(e) => {
                self.registry.finish(id);
                warn!(session = %id, error = %e, "Exec session failed to connect");
                let _ = outbound
                    .send(ExecMessage::Error {
                        data: e.to_string(),
                    })
                    .await;
                let _ = outbound.close().await;
                return Err(e);
            }
        };

        self.registry.set_state(id, ExecState::Active);
        info!(session = %id, "Exec session active");

        let result = relay(id, remote, inbound, outbound, self.input_queue, &cancel).await;
        let state = self.registry.finish(id).map(|info| info.state);
        match &result {
            Ok(reason) => info!(session = %id, ?reason, ?state, "Exec session closed"),
            Err(e) => warn!(session = %id, error = %e, "Exec session failed"),
        }
        result
    }

    async fn connect(&self, request: &ExecRequest) -> Result<RemoteSession> {
        if request.pod.trim().is_empty() {
            return Err(Error::validation_for_field("pod", "pod is required"));
        }
        let handle = self.cache.get(request.bundle_id, &request.target).await?;

        let namespace = request
            .namespace
            .clone()
            .filter(|ns| !ns.is_empty())
            .or_else(|| handle.default_namespace().map(str::to_string))
            .unwrap_or_else(|| FALLBACK_NAMESPACE.to_string());
        let command = if request.command.is_empty() {
            vec![DEFAULT_COMMAND.to_string()]
        } else {
            request.command.clone()
        };
        let target = ExecTarget {
            namespace,
            pod: request.pod.clone(),
            container: request.container.clone(),
            command,
            tty: request.tty,
        };
        self.backend.attach(&handle, &target).await
    }
}

async fn relay(
    id: Uuid,
    remote: RemoteSession,
    inbound: InboundStream,
    outbound: OutboundSink,
    input_queue: usize,
    cancel: &CancellationToken,
) -> Result<CloseReason> {
    let RemoteSession {
        stdin,
        stdout,
        stderr,
        resize,
        guard,
    } = remote;

    let (input_tx, input_rx) = mpsc::channel(input_queue);
    let pump = tokio::spawn(pump_inbound(id, inbound, input_tx, resize));
    let mut input_loop = tokio::spawn(relay_input(input_rx, stdin));
    let mut output_loop = tokio::spawn(relay_output(stdout, stderr, outbound));

    let end = tokio::select! {
        _ = cancel.cancelled() => Ok(CloseReason::Cancelled),
        joined = &mut input_loop => flatten(joined),
        joined = &mut output_loop => flatten(joined),
    };

    cancel.cancel();
    pump.abort();
    input_loop.abort();
    output_loop.abort();
    drop(guard);
    end
}

fn flatten(joined: std::result::Result<Result<CloseReason>, JoinError>) -> Result<CloseReason> {
    joined.map_err(|e| Error::bridge(format!("relay task failed: {}", e)))?
}

/// Reads the transport and feeds the input queue.
///
/// When the queue is full the send waits, so the transport is not read again
/// until the remote side catches up. Nothing is dropped.
async fn pump_inbound(
    id: Uuid,
    mut inbound: InboundStream,
    queue: mpsc::Sender<Result<Vec<u8>>>,
    mut resize: Option<futures::channel::mpsc::Sender<TerminalSize>>,
) {
    while let Some(message) = inbound.next().await {
        match message {
            Ok(ExecMessage::Input { data }) => {
                if queue.send(Ok(data.into_bytes())).await.is_err() {
                    return;
                }
            }
            Ok(ExecMessage::Resize { cols, rows }) => match resize.as_mut() {
                Some(tx) => {
                    let size = TerminalSize {
                        width: cols,
                        height: rows,
                    };
                    if SinkExt::send(tx, size).await.is_err() {
                        debug!(session = %id, "Remote terminal no longer accepts resizes");
                        resize = None;
                    }
                }
                None => debug!(session = %id, "Ignoring resize for session without a terminal"),
            },
            Ok(other) => {
                warn!(session = %id, kind = other.kind(), "Ignoring unexpected inbound message")
            }
            Err(e) => {
                let _ = queue.send(Err(e)).await;
                return;
            }
        }
    }
}

async fn relay_input(
    mut queue: mpsc::Receiver<Result<Vec<u8>>>,
    mut stdin: RemoteWriter,
) -> Result<CloseReason> {
    while let Some(chunk) = queue.recv().await {
        let bytes = chunk?;
        stdin
            .write_all(&bytes)
            .await
            .map_err(|e| Error::bridge(format!("write to remote stdin failed: {}", e)))?;
        stdin
            .flush()
            .await
            .map_err(|e| Error::bridge(format!("flush of remote stdin failed: {}", e)))?;
    }
    let _ = stdin.shutdown().await;
    Ok(CloseReason::PeerClosed)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Origin {
    Stdout,
    Stderr,
}

impl Origin {
    fn envelope(self, data: String) -> ExecMessage {
        match self {
            Origin::Stdout => ExecMessage::Stdout { data },
            Origin::Stderr => ExecMessage::Stderr { data },
        }
    }
}

async fn relay_output(
    stdout: RemoteReader,
    stderr: Option<RemoteReader>,
    mut outbound: OutboundSink,
) -> Result<CloseReason> {
    let mut sources = vec![ReaderStream::new(stdout)
        .map(|chunk| (Origin::Stdout, chunk))
        .boxed()];
    if let Some(stderr) = stderr {
        sources.push(
            ReaderStream::new(stderr)
                .map(|chunk| (Origin::Stderr, chunk))
                .boxed(),
        );
    }

    let mut output = select_all(sources);
    let mut stdout_text = Utf8Decoder::default();
    let mut stderr_text = Utf8Decoder::default();
    while let Some((origin, chunk)) = output.next().await {
        let bytes = chunk
            .map_err(|e| Error::bridge(format!("remote {:?} read failed: {}", origin, e)))?;
        let decoder = match origin {
            Origin::Stdout => &mut stdout_text,
            Origin::Stderr => &mut stderr_text,
        };
        let text = decoder.decode(&bytes);
        if !text.is_empty() {
            outbound.send(origin.envelope(text)).await?;
        }
    }

    for (origin, decoder) in [
        (Origin::Stdout, &mut stdout_text),
        (Origin::Stderr, &mut stderr_text),
    ] {
        let tail = decoder.finish();
        if !tail.is_empty() {
            outbound.send(origin.envelope(tail)).await?;
        }
    }
    let _ = outbound.close().await;
    Ok(CloseReason::RemoteClosed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as fmpsc;
    use kubedeck_credentials::{CredentialStore, KubeClientFactory};
    use parking_lot::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// Hands out one pre-built in-memory session and records what was asked for
    #[derive(Default)]
    struct DuplexBackend {
        session: Mutex<Option<RemoteSession>>,
        seen: Mutex<Option<ExecTarget>>,
    }

    #[async_trait::async_trait]
    impl ExecBackend for DuplexBackend {
        async fn attach(
            &self,
            _handle: &kubedeck_credentials::ClientHandle,
            target: &ExecTarget,
        ) -> Result<RemoteSession> {
            *self.seen.lock() = Some(target.clone());
            self.session
                .lock()
                .take()
                .ok_or_else(|| Error::bridge("pod has no running container"))
        }
    }

    /// Far ends of the in-memory remote stream
    struct Remote {
        stdin: DuplexStream,
        stdout: DuplexStream,
        stderr: DuplexStream,
        resize: fmpsc::Receiver<TerminalSize>,
    }

    struct Peer {
        inbound: fmpsc::UnboundedSender<Result<ExecMessage>>,
        outbound: fmpsc::UnboundedReceiver<ExecMessage>,
    }

    struct Harness {
        bridge: Arc<ExecBridge>,
        backend: Arc<DuplexBackend>,
        bundle_id: BundleId,
    }

    fn harness(input_queue: usize, remote_buffer: usize) -> (Harness, Remote) {
        let store = Arc::new(CredentialStore::new());
        let bundle_id = store
            .add_from_token("prod", "https://prod.example.com", "tok")
            .unwrap();
        let cache = ConnectionCache::new(store, Arc::new(KubeClientFactory::default()));

        let (stdin_near, stdin_far) = tokio::io::duplex(remote_buffer);
        let (stdout_near, stdout_far) = tokio::io::duplex(remote_buffer);
        let (stderr_near, stderr_far) = tokio::io::duplex(remote_buffer);
        let (resize_tx, resize_rx) = fmpsc::channel(4);
        let mut session = RemoteSession::from_streams(
            Box::new(stdin_near),
            Box::new(stdout_near),
            Some(Box::new(stderr_near)),
        );
        session.resize = Some(resize_tx);

        let backend = Arc::new(DuplexBackend::default());
        *backend.session.lock() = Some(session);
        let bridge = Arc::new(ExecBridge::with_input_queue(
            cache,
            backend.clone(),
            input_queue,
        ));

        (
            Harness {
                bridge,
                backend,
                bundle_id,
            },
            Remote {
                stdin: stdin_far,
                stdout: stdout_far,
                stderr: stderr_far,
                resize: resize_rx,
            },
        )
    }

    fn transport() -> (ExecTransport, Peer) {
        let (in_tx, in_rx) = fmpsc::unbounded();
        let (out_tx, out_rx) = fmpsc::unbounded();
        let transport = ExecTransport {
            inbound: in_rx.boxed(),
            outbound: Box::pin(out_tx.sink_map_err(|e| Error::bridge(e.to_string()))),
        };
        (
            transport,
            Peer {
                inbound: in_tx,
                outbound: out_rx,
            },
        )
    }

    fn request(bundle_id: BundleId, target: &str) -> ExecRequest {
        ExecRequest {
            bundle_id,
            target: target.into(),
            namespace: Some("shop".into()),
            pod: "web-0".into(),
            container: Some("app".into()),
            command: vec!["sh".into()],
            tty: true,
        }
    }

    fn input(data: &str) -> Result<ExecMessage> {
        Ok(ExecMessage::Input { data: data.into() })
    }

    fn spawn_open(
        h: &Harness,
        request: ExecRequest,
        transport: ExecTransport,
    ) -> tokio::task::JoinHandle<Result<CloseReason>> {
        let bridge = h.bridge.clone();
        tokio::spawn(async move { bridge.open(request, transport).await })
    }

    async fn wait_active(bridge: &ExecBridge) -> Uuid {
        loop {
            if let Some(info) = bridge
                .registry()
                .list()
                .into_iter()
                .find(|s| s.state == ExecState::Active)
            {
                return info.id;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_input_and_output_are_relayed_in_order() {
        let (h, mut remote) = harness(8, 1024);
        let (transport, mut peer) = transport();
        let session = spawn_open(&h, request(h.bundle_id, "prod"), transport);

        peer.inbound.unbounded_send(input("ls\n")).unwrap();
        let mut buf = [0u8; 3];
        remote.stdin.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ls\n");

        remote.stdout.write_all(b"total 0\n").await.unwrap();
        assert_eq!(
            peer.outbound.next().await,
            Some(ExecMessage::Stdout {
                data: "total 0\n".into()
            })
        );

        remote.stderr.write_all(b"warning").await.unwrap();
        assert_eq!(
            peer.outbound.next().await,
            Some(ExecMessage::Stderr {
                data: "warning".into()
            })
        );

        // Peer goes away: the session ends and the remote stream is released
        drop(peer.inbound);
        assert_eq!(session.await.unwrap().unwrap(), CloseReason::PeerClosed);
        let mut rest = Vec::new();
        remote.stdin.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert!(h.bridge.registry().is_empty());
    }

    #[tokio::test]
    async fn test_remote_exit_closes_transport() {
        let (h, remote) = harness(8, 1024);
        let (transport, mut peer) = transport();
        let session = spawn_open(&h, request(h.bundle_id, "prod"), transport);

        let mut stdout = remote.stdout;
        stdout.write_all(b"bye\n").await.unwrap();
        drop(stdout);
        drop(remote.stderr);

        assert_eq!(
            peer.outbound.next().await,
            Some(ExecMessage::Stdout { data: "bye\n".into() })
        );
        assert_eq!(peer.outbound.next().await, None);
        assert_eq!(session.await.unwrap().unwrap(), CloseReason::RemoteClosed);
    }

    #[tokio::test]
    async fn test_connect_failure_sends_error_and_never_goes_active() {
        let (h, _remote) = harness(8, 1024);
        let (transport, mut peer) = transport();

        let err = h
            .bridge
            .open(request(h.bundle_id, "missing"), transport)
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        match peer.outbound.next().await {
            Some(ExecMessage::Error { data }) => assert!(data.contains("missing")),
            other => panic!("expected error envelope, got {other:?}"),
        }
        assert_eq!(peer.outbound.next().await, None);
        assert!(h.backend.seen.lock().is_none());
        assert!(h.bridge.registry().is_empty());
    }

    #[tokio::test]
    async fn test_negotiation_failure_is_bridge_error() {
        let (h, _remote) = harness(8, 1024);
        h.backend.session.lock().take();
        let (transport, _peer) = transport();

        let err = h
            .bridge
            .open(request(h.bundle_id, "prod"), transport)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Bridge { .. }));
    }

    #[tokio::test]
    async fn test_cancel_from_registry() {
        let (h, _remote) = harness(8, 1024);
        let (transport, _peer) = transport();
        let session = spawn_open(&h, request(h.bundle_id, "prod"), transport);

        let id = wait_active(&h.bridge).await;
        h.bridge.registry().cancel(id).unwrap();

        assert_eq!(session.await.unwrap().unwrap(), CloseReason::Cancelled);
    }

    #[tokio::test]
    async fn test_small_queue_keeps_every_byte_in_order() {
        let (h, mut remote) = harness(1, 4);
        let (transport, peer) = transport();
        let session = spawn_open(&h, request(h.bundle_id, "prod"), transport);

        let mut expected = String::new();
        for i in 0..50 {
            let chunk = format!("echo {i}\n");
            expected.push_str(&chunk);
            peer.inbound.unbounded_send(input(&chunk)).unwrap();
        }
        drop(peer.inbound);

        let mut received = Vec::new();
        remote.stdin.read_to_end(&mut received).await.unwrap();
        assert_eq!(String::from_utf8(received).unwrap(), expected);
        assert_eq!(session.await.unwrap().unwrap(), CloseReason::PeerClosed);
    }

    #[tokio::test]
    async fn test_resize_reaches_remote_terminal() {
        let (h, mut remote) = harness(8, 1024);
        let (transport, peer) = transport();
        let _session = spawn_open(&h, request(h.bundle_id, "prod"), transport);

        peer.inbound
            .unbounded_send(Ok(ExecMessage::Resize { cols: 120, rows: 40 }))
            .unwrap();
        let size = remote.resize.next().await.unwrap();
        assert_eq!((size.width, size.height), (120, 40));
    }

    #[tokio::test]
    async fn test_defaults_for_namespace_and_command() {
        let (h, _remote) = harness(8, 1024);
        let (transport, _peer) = transport();
        let mut req = request(h.bundle_id, "prod");
        req.namespace = None;
        req.command.clear();
        let _session = spawn_open(&h, req, transport);

        wait_active(&h.bridge).await;
        let seen = h.backend.seen.lock().clone().unwrap();
        assert_eq!(seen.namespace, "default");
        assert_eq!(seen.command, vec!["/bin/sh".to_string()]);
        assert_eq!(seen.container.as_deref(), Some("app"));
    }
}
