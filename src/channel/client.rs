//! Reconnecting WebSocket client for server-pushed upload progress.
//!
//! The channel runs as its own task and forwards parsed frames to the upload
//! manager. It never fails an upload: once it runs out of reconnect attempts
//! it reports [`ChannelEvent::GaveUp`] and stops.

use std::fmt::Display;
use std::time::Duration;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;
use super::message::{ChannelStatus, ProgressMessage};

pub const DEFAULT_RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Connected,
    Progress {
        message: ProgressMessage,
        received_at: Instant,
    },
    Disconnected,
    Reconnecting {
        attempt: u32,
        delay: Duration,
    },
    /// Reconnect attempts exhausted, no more events will follow
    GaveUp,
}

#[derive(Debug, Clone)]
pub struct PushChannelConfig {
    pub url: Url,
    pub base_delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl PushChannelConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            base_delay: DEFAULT_RECONNECT_BASE_DELAY,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }

    /// Delay before reconnect number `attempt` (zero based).
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

pub struct PushChannel {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl PushChannel {
    pub fn spawn(config: PushChannelConfig, events: mpsc::UnboundedSender<ChannelEvent>) -> Self {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(config, events, cancel.clone()));

        Self { cancel, handle }
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(err) = self.handle.await {
            warn!("push channel task panicked: {err}");
        }
    }
}

async fn run(config: PushChannelConfig, events: mpsc::UnboundedSender<ChannelEvent>, cancel: CancellationToken) {
    let mut attempt = 0;

    loop {
        let connected = tokio::select! {
            _ = cancel.cancelled() => return,
            result = tokio_tungstenite::connect_async(config.url.as_str()) => result,
        };

        match connected {
            Ok((stream, _)) => {
                info!(url = %config.url, "push channel connected");
                attempt = 0;
                if events.send(ChannelEvent::Connected).is_err() {
                    return;
                }

                let (write, read) = stream.split();
                read_pump(read, write, &events, &cancel).await;

                if cancel.is_cancelled() || events.send(ChannelEvent::Disconnected).is_err() {
                    return;
                }
            }
            Err(err) => {
                warn!(url = %config.url, attempt, "push channel connect failed: {err}");
            }
        }

        if attempt >= config.max_reconnect_attempts {
            warn!(attempts = attempt, "push channel gave up, falling back to local progress");
            let _ = events.send(ChannelEvent::GaveUp);
            return;
        }

        let delay = config.reconnect_delay(attempt);
        attempt += 1;
        debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting push channel");
        if events.send(ChannelEvent::Reconnecting { attempt, delay }).is_err() {
            return;
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Reads frames until the stream ends, errors, closes or `cancel` fires.
pub(crate) async fn read_pump<S, W>(
    mut read: S,
    mut write: W,
    events: &mpsc::UnboundedSender<ChannelEvent>,
    cancel: &CancellationToken,
) where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = read.next() => msg,
        };

        match msg {
            Some(Ok(Message::Text(text))) => handle_text(text.as_str(), events),
            Some(Ok(Message::Ping(data))) => {
                trace!("received ping, sending pong");
                if let Err(err) = write.send(Message::Pong(data)).await {
                    warn!("failed to send pong: {err}");
                    break;
                }
            }
            Some(Ok(Message::Close(_))) => {
                debug!("received close frame");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                warn!("push channel read error: {err}");
                break;
            }
            None => {
                debug!("push channel stream ended");
                break;
            }
        }
    }
}

fn handle_text(text: &str, events: &mpsc::UnboundedSender<ChannelEvent>) {
    let message: ProgressMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(err) => {
            warn!("dropping malformed progress frame: {err}");
            return;
        }
    };

    if message.status == ChannelStatus::Connected {
        info!(user_id = ?message.user_id, "push channel acknowledged subscription");
        return;
    }

    if message.photo_id.is_none() {
        debug!(status = ?message.status, "dropping progress frame without photoId");
        return;
    }

    let _ = events.send(ChannelEvent::Progress {
        message,
        received_at: Instant::now(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn text(json: &str) -> Result<Message, tungstenite::Error> {
        Ok(Message::Text(json.to_string().into()))
    }

    #[test]
    fn test_reconnect_delays() {
        let config = PushChannelConfig::new(Url::parse("ws://localhost/ws").unwrap());
        let delays: Vec<_> = (0..5).map(|a| config.reconnect_delay(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
    }

    #[tokio::test]
    async fn read_pump_forwards_progress_frames() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (sink, _sink_rx) = futures::channel::mpsc::unbounded::<Message>();
        let cancel = CancellationToken::new();

        let frames = stream::iter(vec![
            text(r#"{"status":"CONNECTED","userId":"u-1"}"#),
            text("not valid json {{{"),
            text(r#"{"status":"UPLOADING"}"#),
            text(r#"{"photoId":"p-1","status":"UPLOADING","uploadedBytes":10,"totalBytes":100}"#),
            text(r#"{"photoId":"p-1","status":"COMPLETED"}"#),
        ]);

        read_pump(frames, sink, &tx, &cancel).await;
        drop(tx);

        let mut statuses = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                ChannelEvent::Progress { message, .. } => statuses.push(message.status),
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(statuses, vec![ChannelStatus::Uploading, ChannelStatus::Completed]);
    }

    #[tokio::test]
    async fn read_pump_answers_ping() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (sink, mut sink_rx) = futures::channel::mpsc::unbounded::<Message>();
        let cancel = CancellationToken::new();

        let frames = stream::iter(vec![Ok(Message::Ping(vec![1u8, 2, 3].into()))]);
        read_pump(frames, sink, &tx, &cancel).await;

        match sink_rx.next().await {
            Some(Message::Pong(data)) => assert_eq!(&data[..], &[1, 2, 3]),
            other => panic!("expected pong, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_pump_stops_on_close() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (sink, _sink_rx) = futures::channel::mpsc::unbounded::<Message>();
        let cancel = CancellationToken::new();

        let frames = stream::iter(vec![
            Ok(Message::Close(None)),
            text(r#"{"photoId":"p-1","status":"COMPLETED"}"#),
        ]);
        read_pump(frames, sink, &tx, &cancel).await;
        drop(tx);

        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn read_pump_stops_on_cancel() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (sink, _sink_rx) = futures::channel::mpsc::unbounded::<Message>();
        let cancel = CancellationToken::new();
        cancel.cancel();

        read_pump(stream::pending::<Result<Message, tungstenite::Error>>(), sink, &tx, &cancel).await;
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        // Nothing listens on port 9, every connect fails immediately.
        let config = PushChannelConfig {
            url: Url::parse("ws://127.0.0.1:9/ws/upload-progress").unwrap(),
            base_delay: Duration::from_millis(10),
            max_reconnect_attempts: 2,
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = PushChannel::spawn(config, tx);

        let mut attempts = Vec::new();
        loop {
            match rx.recv().await {
                Some(ChannelEvent::Reconnecting { attempt, .. }) => attempts.push(attempt),
                Some(ChannelEvent::GaveUp) => break,
                Some(other) => panic!("unexpected event {other:?}"),
                None => panic!("channel closed without giving up"),
            }
        }

        assert_eq!(attempts, vec![1, 2]);
        channel.shutdown().await;
    }
}
