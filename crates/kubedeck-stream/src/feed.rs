//! Live feeds
//!
//! A feed turns a poll-style refresh operation into a pushed stream of
//! snapshots. The first refresh runs immediately, then once per interval.
//! Failed refreshes produce a keep-alive marker instead of ending the feed.
//!
//! A refresh only runs once the sink has room for its result, and ticks
//! missed while waiting are skipped, so a slow consumer gets a snapshot
//! computed after it caught up rather than a backlog.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use kubedeck_common::Result;

/// Shortest refresh period a feed runs at
pub const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// One item written to a feed's sink
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FeedEvent<P> {
    /// Result of a successful refresh
    Snapshot(P),
    /// A refresh failed; the session is still alive
    KeepAlive,
}

/// The consumer of a feed has gone away
#[derive(Clone, Copy, Debug, thiserror::Error)]
#[error("feed consumer is gone")]
pub struct SinkClosed;

/// Destination of feed events
#[async_trait]
pub trait FeedSink<P: Send + 'static>: Send + Sync + 'static {
    /// Wait until the consumer can take one more event.
    ///
    /// The feed only refreshes after this resolves, so what it sends next
    /// is computed once there is room for it.
    async fn ready(&mut self) -> std::result::Result<(), SinkClosed>;

    /// Deliver one event
    async fn send(&mut self, event: FeedEvent<P>) -> std::result::Result<(), SinkClosed>;

    /// Resolves once the consumer has gone away
    async fn closed(&self);
}

/// Sink backed by a bounded channel
pub struct ChannelSink<P> {
    tx: mpsc::Sender<FeedEvent<P>>,
    permit: Option<mpsc::OwnedPermit<FeedEvent<P>>>,
}

/// Create a channel sink and the receiver its consumer reads from
pub fn channel<P>(capacity: usize) -> (ChannelSink<P>, mpsc::Receiver<FeedEvent<P>>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ChannelSink { tx, permit: None }, rx)
}

#[async_trait]
impl<P: Send + 'static> FeedSink<P> for ChannelSink<P> {
    async fn ready(&mut self) -> std::result::Result<(), SinkClosed> {
        if self.permit.is_none() {
            let permit = self
                .tx
                .clone()
                .reserve_owned()
                .await
                .map_err(|_| SinkClosed)?;
            self.permit = Some(permit);
        }
        Ok(())
    }

    async fn send(&mut self, event: FeedEvent<P>) -> std::result::Result<(), SinkClosed> {
        match self.permit.take() {
            Some(permit) => {
                permit.send(event);
                Ok(())
            }
            None => self.tx.send(event).await.map_err(|_| SinkClosed),
        }
    }

    async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Running feed session; dropping it stops the feed
pub struct FeedHandle {
    id: Uuid,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl FeedHandle {
    /// Session id used in logs
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Whether the session has ended
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stop the feed and wait for its task to exit.
    ///
    /// No event is written after this returns.
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for FeedHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Push-streaming primitive; one session per subscriber
pub struct LiveFeed;

impl LiveFeed {
    /// Start a feed session.
    ///
    /// Refresh timeouts are the caller's concern: a refresh that never
    /// resolves stalls its own session until it is closed.
    pub fn open<P, F, Fut, S>(refresh: F, sink: S, interval: Duration) -> FeedHandle
    where
        P: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<P>> + Send + 'static,
        S: FeedSink<P>,
    {
        let interval = if interval < MIN_INTERVAL {
            warn!(
                requested_ms = interval.as_millis() as u64,
                "Feed interval below minimum, clamping"
            );
            MIN_INTERVAL
        } else {
            interval
        };
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_feed(id, refresh, sink, interval, cancel.clone()));
        info!(feed = %id, interval_ms = interval.as_millis() as u64, "Opened live feed");
        FeedHandle {
            id,
            cancel,
            task: Some(task),
        }
    }

    /// Stop a feed session
    pub async fn close(handle: FeedHandle) {
        handle.close().await
    }
}

async fn run_feed<P, F, Fut, S>(
    id: Uuid,
    mut refresh: F,
    mut sink: S,
    interval: Duration,
    cancel: CancellationToken,
) where
    P: Send + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<P>> + Send + 'static,
    S: FeedSink<P>,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut sent: u64 = 0;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = sink.closed() => {
                debug!(feed = %id, "Feed consumer gone");
                break;
            }
            _ = ticker.tick() => {}
        }

        let ready = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            ready = sink.ready() => ready,
        };
        if ready.is_err() {
            debug!(feed = %id, "Feed consumer gone");
            break;
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = sink.closed() => break,
            outcome = refresh() => outcome,
        };

        let event = match outcome {
            Ok(payload) => FeedEvent::Snapshot(payload),
            Err(e) => {
                warn!(feed = %id, error = %e, "Feed refresh failed, sending keep-alive");
                FeedEvent::KeepAlive
            }
        };

        if cancel.is_cancelled() {
            break;
        }
        let delivered = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            delivered = sink.send(event) => delivered,
        };
        if delivered.is_err() {
            debug!(feed = %id, "Feed consumer gone");
            break;
        }
        sent += 1;
    }

    info!(feed = %id, events = sent, "Closed live feed");
}
