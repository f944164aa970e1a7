//! Response adapters over live feeds
//!
//! A request either wants one snapshot (plain JSON) or a push stream
//! (server-sent events). Both go through the same refresh operation.

use std::convert::Infallible;
use std::future::Future;
use std::time::Duration;

use axum::http::{header, HeaderMap};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::warn;

use kubedeck_common::{Result, KEEP_ALIVE_EVENT};
use kubedeck_stream::feed::{self, FeedEvent, LiveFeed};

/// Idle-connection comment interval, independent of feed keep-alives
const COMMENT_KEEP_ALIVE: Duration = Duration::from_secs(15);

/// Check if the client asked for a push stream
pub fn wants_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("text/event-stream"))
}

/// Answer with a live feed or a single snapshot depending on `Accept`
pub async fn feed_response<P, F, Fut>(headers: &HeaderMap, refresh: F, interval: Duration) -> Response
where
    P: Serialize + Send + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<P>> + Send + 'static,
{
    if wants_event_stream(headers) {
        event_stream(refresh, interval)
    } else {
        snapshot_once(refresh).await
    }
}

/// Run the refresh once and answer with its JSON
pub async fn snapshot_once<P, F, Fut>(mut refresh: F) -> Response
where
    P: Serialize,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<P>>,
{
    match refresh().await {
        Ok(payload) => axum::Json(payload).into_response(),
        Err(e) => crate::ApiError(e).into_response(),
    }
}

/// Answer with a server-sent event stream backed by a live feed.
///
/// One `data:` event per snapshot; a swallowed refresh failure becomes an
/// empty event named `keep-alive`. The feed lives as long as the response
/// body: when the client disconnects the body is dropped and the feed ends.
pub fn event_stream<P, F, Fut>(refresh: F, interval: Duration) -> Response
where
    P: Serialize + Send + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<P>> + Send + 'static,
{
    let (sink, mut rx) = feed::channel::<P>(1);
    let handle = LiveFeed::open(refresh, sink, interval);

    let stream = async_stream::stream! {
        // Owned by the body so dropping the body closes the feed
        let _handle = handle;
        while let Some(event) = rx.recv().await {
            let event = match event {
                FeedEvent::Snapshot(payload) => match Event::default().json_data(&payload) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode snapshot");
                        keep_alive_event()
                    }
                },
                FeedEvent::KeepAlive => keep_alive_event(),
            };
            yield Ok::<_, Infallible>(event);
        }
    };

    Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(COMMENT_KEEP_ALIVE)
                .text("ping"),
        )
        .into_response()
}

fn keep_alive_event() -> Event {
    Event::default().event(KEEP_ALIVE_EVENT).data("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderValue, StatusCode};
    use futures::StreamExt;
    use kubedeck_common::Error;
    use rstest::rstest;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[rstest]
    #[case("text/event-stream", true)]
    #[case("application/json, Text/Event-Stream;q=0.9", true)]
    #[case("application/json", false)]
    fn test_wants_event_stream(#[case] accept: &str, #[case] expected: bool) {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_str(accept).unwrap());
        assert_eq!(wants_event_stream(&headers), expected);
    }

    #[test]
    fn test_no_accept_header_is_snapshot() {
        assert!(!wants_event_stream(&HeaderMap::new()));
    }

    #[tokio::test]
    async fn test_snapshot_once_returns_json() {
        let response = snapshot_once(|| async { Ok::<_, Error>(vec!["web-0", "web-1"]) }).await;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&bytes[..], br#"["web-0","web-1"]"#);
    }

    #[tokio::test]
    async fn test_snapshot_once_maps_errors() {
        let response =
            snapshot_once(|| async { Err::<u32, _>(Error::bundle_not_found("b")) }).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_stream_snapshots_and_keep_alives() {
        let calls = Arc::new(AtomicU64::new(0));
        let refresh = {
            let calls = calls.clone();
            move || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 1 {
                        Err(Error::session("list failed"))
                    } else {
                        Ok(serde_json::json!({ "items": n }))
                    }
                }
            }
        };

        let response = event_stream(refresh, Duration::from_millis(100));
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );

        let mut body = response.into_body().into_data_stream();
        let first = body.next().await.unwrap().unwrap();
        assert!(String::from_utf8_lossy(&first).contains(r#"data: {"items":0}"#));
        let second = body.next().await.unwrap().unwrap();
        assert!(String::from_utf8_lossy(&second).contains("event: keep-alive"));
        let third = body.next().await.unwrap().unwrap();
        assert!(String::from_utf8_lossy(&third).contains(r#"data: {"items":2}"#));

        // Client disconnect: dropping the body ends the feed
        drop(body);
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        let after_drop = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(calls.load(Ordering::SeqCst), after_drop);
    }
}
