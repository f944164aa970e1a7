//! WebSocket transport for exec sessions
//!
//! Text frames carry JSON envelopes (see [`ExecMessage`]). Binary frames are
//! accepted as raw input for clients that stream keystrokes unframed; they
//! must be UTF-8, since input is relayed as text. Other binary frames are
//! dropped rather than altered.

use std::fmt::Display;
use std::future::ready;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::Response;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};

use kubedeck_common::Error;
use kubedeck_credentials::BundleId;
use kubedeck_stream::exec::{
    ExecBridge, ExecMessage, ExecRequest, ExecTransport, InboundStream, OutboundSink,
};

/// Check if headers indicate a WebSocket upgrade request
pub fn has_websocket_upgrade_headers(headers: &HeaderMap) -> bool {
    let has_upgrade = headers
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    let has_connection = headers
        .get("connection")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade && has_connection
}

/// Query parameters of an exec request
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ExecQuery {
    /// Namespace of the pod
    pub namespace: Option<String>,
    /// Pod name
    pub pod: String,
    /// Container name
    pub container: Option<String>,
    /// Whitespace-separated command; empty starts a shell
    #[serde(default)]
    pub command: String,
    /// Allocate a pseudo-terminal
    #[serde(default = "default_tty")]
    pub tty: bool,
}

fn default_tty() -> bool {
    true
}

impl ExecQuery {
    /// Combine with the addressed target into a bridge request
    pub fn into_request(self, bundle_id: BundleId, target: impl Into<String>) -> ExecRequest {
        ExecRequest {
            bundle_id,
            target: target.into(),
            namespace: self.namespace.filter(|ns| !ns.is_empty()),
            pod: self.pod,
            container: self.container.filter(|c| !c.is_empty()),
            command: self.command.split_whitespace().map(str::to_string).collect(),
            tty: self.tty,
        }
    }
}

/// Upgrade the connection and run one exec session over it
pub fn exec_upgrade(
    ws: WebSocketUpgrade,
    bridge: Arc<ExecBridge>,
    request: ExecRequest,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        if let Err(e) = bridge.open(request, transport(socket)).await {
            debug!(error = %e, "Exec websocket session ended with error");
        }
    })
}

/// Adapt an upgraded socket into an exec transport
pub fn transport(socket: WebSocket) -> ExecTransport {
    let (sink, stream) = socket.split();
    ExecTransport {
        inbound: inbound_from(stream),
        outbound: outbound_into(sink),
    }
}

/// Decode inbound frames; the stream ends at the peer's close frame
pub fn inbound_from<S, E>(frames: S) -> InboundStream
where
    S: Stream<Item = Result<Message, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    frames
        .take_while(|frame| ready(!matches!(frame, Ok(Message::Close(_)))))
        .filter_map(|frame| {
            ready(match frame {
                Ok(Message::Text(text)) => match ExecMessage::parse(text.as_str()) {
                    Ok(message) => Some(Ok(message)),
                    Err(e) => {
                        warn!(error = %e, "Dropping malformed exec frame");
                        None
                    }
                },
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                    Ok(data) => Some(Ok(ExecMessage::Input { data })),
                    Err(_) => {
                        warn!(len = bytes.len(), "Dropping non-UTF-8 binary exec frame");
                        None
                    }
                },
                Ok(_) => None,
                Err(e) => Some(Err(Error::bridge(format!("websocket read failed: {}", e)))),
            })
        })
        .boxed()
}

/// Encode outbound envelopes as text frames
pub fn outbound_into<Si>(frames: Si) -> OutboundSink
where
    Si: Sink<Message> + Send + 'static,
    Si::Error: Display,
{
    Box::pin(
        frames
            .sink_map_err(|e| Error::bridge(format!("websocket write failed: {}", e)))
            .with(|message: ExecMessage| {
                ready(Ok::<_, Error>(Message::Text(message.to_json().into())))
            }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::ws::CloseFrame;
    use futures::channel::mpsc;

    #[test]
    fn test_upgrade_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("upgrade", "WebSocket".parse().unwrap());
        headers.insert("connection", "keep-alive, Upgrade".parse().unwrap());
        assert!(has_websocket_upgrade_headers(&headers));

        headers.remove("connection");
        assert!(!has_websocket_upgrade_headers(&headers));
    }

    #[tokio::test]
    async fn test_inbound_frames() {
        let frames = futures::stream::iter(vec![
            Ok::<_, axum::Error>(Message::Text(r#"{"type":"input","data":"ls\n"}"#.into())),
            Ok(Message::Text("not json".into())),
            Ok(Message::Ping(axum::body::Bytes::new())),
            Ok(Message::Binary(b"pwd\n".to_vec().into())),
            Ok(Message::Text(r#"{"type":"resize","cols":80,"rows":24}"#.into())),
            Ok(Message::Close(Some(CloseFrame {
                code: 1000,
                reason: "".into(),
            }))),
            Ok(Message::Text(r#"{"type":"input","data":"late"}"#.into())),
        ]);

        let messages: Vec<_> = inbound_from(frames)
            .map(|m| m.unwrap())
            .collect()
            .await;
        assert_eq!(
            messages,
            vec![
                ExecMessage::Input { data: "ls\n".into() },
                ExecMessage::Input { data: "pwd\n".into() },
                ExecMessage::Resize { cols: 80, rows: 24 },
            ]
        );
    }

    #[tokio::test]
    async fn test_non_utf8_binary_frames_are_dropped() {
        let frames = futures::stream::iter(vec![
            Ok::<_, axum::Error>(Message::Binary(vec![0x66, 0xff, 0x0a].into())),
            Ok(Message::Binary("é\n".as_bytes().to_vec().into())),
        ]);

        let messages: Vec<_> = inbound_from(frames)
            .map(|m| m.unwrap())
            .collect()
            .await;
        assert_eq!(messages, vec![ExecMessage::Input { data: "é\n".into() }]);
    }

    #[tokio::test]
    async fn test_outbound_frames_are_json_text() {
        let (tx, mut rx) = mpsc::unbounded::<Message>();
        let mut outbound = outbound_into(tx);
        outbound
            .send(ExecMessage::Stdout {
                data: "total 0\n".into(),
            })
            .await
            .unwrap();

        match rx.next().await {
            Some(Message::Text(text)) => {
                assert_eq!(text.as_str(), r#"{"type":"stdout","data":"total 0\n"}"#)
            }
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[test]
    fn test_query_into_request() {
        let query: ExecQuery =
            serde_json::from_str(r#"{"pod":"web-0","command":"ls  -la /tmp","container":""}"#)
                .unwrap();
        let bundle = BundleId::new();
        let request = query.into_request(bundle, "prod");
        assert_eq!(request.command, vec!["ls", "-la", "/tmp"]);
        assert!(request.tty);
        assert!(request.container.is_none());
        assert_eq!(request.target, "prod");
    }
}
