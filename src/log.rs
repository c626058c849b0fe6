//! The append-only message log (C3 §4.3): single-writer, many-reader, with
//! bounded fan-out and index-based reconnect.
//!
//! Writes are serialised behind one [`tokio::sync::Mutex`]; readers get a
//! cheap copy-on-read snapshot for replay plus a [`tokio::sync::broadcast`]
//! subscription for everything appended afterwards. A slow subscriber that
//! falls behind the broadcast channel's bounded capacity is told to
//! reconnect by index rather than blocking the writer (§5 back-pressure).

use crate::message::{Message, Usage};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

/// Minimum cadence for heartbeat events on an idle subscription (§4.3, §6).
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Bounded capacity of the broadcast channel backing live subscriptions.
/// Sized generously; a subscriber that falls this far behind is by
/// definition too slow to keep up and must reconnect (§5).
const CHANNEL_CAPACITY: usize = 4096;

/// One item in a log subscription (`/stream` SSE events map 1:1 to this).
#[derive(Debug, Clone)]
pub enum LogEvent {
    Message(Box<Message>),
    Heartbeat,
    /// The subscriber fell behind the broadcast channel's bounded capacity.
    /// The stream ends here; the caller must reconnect with its last-seen
    /// `idx` as the new `from_idx`.
    Lagged,
    SessionEnded,
}

/// Aggregate snapshot returned by [`MessageLog::state`].
#[derive(Debug, Clone)]
pub struct LogState {
    pub session_id: Uuid,
    pub message_count: usize,
    pub total_usage: Usage,
    pub session_ended: bool,
}

struct Inner {
    messages: Vec<Message>,
    total_usage: Usage,
    session_ended: bool,
}

/// The append-only event log for one agent session.
pub struct MessageLog {
    session_id: Uuid,
    inner: Mutex<Inner>,
    sender: broadcast::Sender<LogEvent>,
}

impl MessageLog {
    pub fn new(session_id: Uuid) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            session_id,
            inner: Mutex::new(Inner {
                messages: Vec::new(),
                total_usage: Usage::default(),
                session_ended: false,
            }),
            sender,
        }
    }

    /// Rebuild a log from previously persisted messages (§6 "Persisted
    /// state"). `idx` values are trusted as-is; the caller is responsible
    /// for having loaded a dense, monotonic sequence (see [`parse_ndjson`]).
    pub fn from_messages(session_id: Uuid, messages: Vec<Message>) -> Self {
        let total_usage = messages.iter().map(|m| m.usage).sum();
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            session_id,
            inner: Mutex::new(Inner {
                messages,
                total_usage,
                session_ended: false,
            }),
            sender,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Append a message, assigning it the next dense `idx` and the current
    /// timestamp (P1), and notify subscribers. Returns the stored copy.
    pub async fn append(&self, mut msg: Message) -> Message {
        let mut inner = self.inner.lock().await;
        let idx = inner.messages.len() as u64;
        msg.idx = idx;
        msg.timestamp = chrono::Utc::now();
        inner.total_usage = inner.total_usage + msg.usage;
        inner.messages.push(msg.clone());
        drop(inner);

        // No subscribers is not an error; broadcast::Sender::send only fails
        // when the channel has zero receivers.
        let _ = self.sender.send(LogEvent::Message(Box::new(msg.clone())));
        msg
    }

    /// Messages with `from <= idx < to` (or to end of log if `to` is `None`).
    pub async fn slice(&self, from: u64, to: Option<u64>) -> Vec<Message> {
        let inner = self.inner.lock().await;
        let from = from as usize;
        if from >= inner.messages.len() {
            return Vec::new();
        }
        let to = to
            .map(|t| t as usize)
            .unwrap_or(inner.messages.len())
            .min(inner.messages.len());
        if to <= from {
            return Vec::new();
        }
        inner.messages[from..to].to_vec()
    }

    pub async fn state(&self) -> LogState {
        let inner = self.inner.lock().await;
        LogState {
            session_id: self.session_id,
            message_count: inner.messages.len(),
            total_usage: inner.total_usage,
            session_ended: inner.session_ended,
        }
    }

    /// Transition the log to its terminal state. Idempotent: only the first
    /// call notifies subscribers.
    pub async fn end_session(&self) {
        let mut inner = self.inner.lock().await;
        if inner.session_ended {
            return;
        }
        inner.session_ended = true;
        drop(inner);
        let _ = self.sender.send(LogEvent::SessionEnded);
    }

    /// Replay messages from `from_idx`, then stream subsequent appends,
    /// heartbeats, and the terminal `SessionEnded` event. If the session has
    /// already ended by the time of subscription, the replay is immediately
    /// followed by a synthetic `SessionEnded` and the stream closes (no live
    /// half runs) — matching reconnect-after-end semantics in §4.3.
    pub async fn subscribe(
        self: &Arc<Self>,
        from_idx: u64,
    ) -> impl futures::Stream<Item = LogEvent> + Send + 'static {
        let (replay, already_ended) = {
            let inner = self.inner.lock().await;
            let from = from_idx as usize;
            let replay = if from < inner.messages.len() {
                inner.messages[from..].to_vec()
            } else {
                Vec::new()
            };
            (replay, inner.session_ended)
        };

        let receiver = self.sender.subscribe();
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        struct State {
            replay: VecDeque<Message>,
            receiver: broadcast::Receiver<LogEvent>,
            interval: tokio::time::Interval,
            replay_done: bool,
            synthetic_end_pending: bool,
            ended: bool,
        }

        let state = State {
            replay: replay.into_iter().collect(),
            receiver,
            interval,
            replay_done: false,
            synthetic_end_pending: already_ended,
            ended: false,
        };

        futures::stream::unfold(state, |mut state| async move {
            if state.ended {
                return None;
            }

            if !state.replay_done {
                if let Some(msg) = state.replay.pop_front() {
                    return Some((LogEvent::Message(Box::new(msg)), state));
                }
                state.replay_done = true;
                if state.synthetic_end_pending {
                    state.ended = true;
                    return Some((LogEvent::SessionEnded, state));
                }
            }

            tokio::select! {
                biased;
                recv = state.receiver.recv() => match recv {
                    Ok(LogEvent::SessionEnded) => {
                        state.ended = true;
                        Some((LogEvent::SessionEnded, state))
                    }
                    Ok(event) => Some((event, state)),
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        state.ended = true;
                        Some((LogEvent::Lagged, state))
                    }
                    Err(broadcast::error::RecvError::Closed) => None,
                },
                _ = state.interval.tick() => Some((LogEvent::Heartbeat, state)),
            }
        })
    }

    /// Serialise the full log as newline-delimited JSON, one [`Message`] per
    /// line, preserving `idx` (§6 "Persisted state").
    pub async fn to_ndjson(&self) -> Result<String, serde_json::Error> {
        let inner = self.inner.lock().await;
        let mut out = String::new();
        for msg in &inner.messages {
            out.push_str(&serde_json::to_string(msg)?);
            out.push('\n');
        }
        Ok(out)
    }
}

/// Parse a newline-delimited JSON log (as produced by
/// [`MessageLog::to_ndjson`]) back into a dense, monotonic message sequence.
pub fn parse_ndjson(data: &str) -> crate::Result<Vec<Message>> {
    data.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(crate::Error::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn conv() -> Uuid {
        Uuid::new_v4()
    }

    #[tokio::test]
    async fn append_assigns_dense_monotonic_idx() {
        let log = MessageLog::new(conv());
        let conv_id = conv();
        for i in 0..5 {
            let msg = log.append(Message::user(conv_id, format!("msg {i}"))).await;
            assert_eq!(msg.idx, i);
        }
        let state = log.state().await;
        assert_eq!(state.message_count, 5);
    }

    #[tokio::test]
    async fn slice_returns_requested_range() {
        let log = MessageLog::new(conv());
        let conv_id = conv();
        for i in 0..10 {
            log.append(Message::user(conv_id, format!("msg {i}"))).await;
        }
        let slice = log.slice(3, Some(6)).await;
        assert_eq!(slice.len(), 3);
        assert_eq!(slice[0].idx, 3);
        assert_eq!(slice[2].idx, 5);

        let tail = log.slice(8, None).await;
        assert_eq!(tail.len(), 2);
    }

    #[tokio::test]
    async fn subscribe_replays_then_streams_new_appends() {
        let log = Arc::new(MessageLog::new(conv()));
        let conv_id = conv();
        log.append(Message::user(conv_id, "first")).await;

        let mut stream = log.subscribe(0).await;

        let first = stream.next().await.unwrap();
        assert!(matches!(first, LogEvent::Message(m) if m.idx == 0));

        let log2 = log.clone();
        tokio::spawn(async move {
            log2.append(Message::user(conv_id, "second")).await;
        });

        let second = stream.next().await.unwrap();
        assert!(matches!(second, LogEvent::Message(m) if m.idx == 1));
    }

    #[tokio::test]
    async fn subscribe_after_session_end_gets_replay_then_terminator() {
        let log = Arc::new(MessageLog::new(conv()));
        let conv_id = conv();
        log.append(Message::user(conv_id, "only message")).await;
        log.end_session().await;

        let mut stream = log.subscribe(0).await;
        let first = stream.next().await.unwrap();
        assert!(matches!(first, LogEvent::Message(_)));
        let second = stream.next().await.unwrap();
        assert!(matches!(second, LogEvent::SessionEnded));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn ndjson_round_trips_preserving_idx() {
        let log = MessageLog::new(conv());
        let conv_id = conv();
        for i in 0..3 {
            log.append(Message::user(conv_id, format!("msg {i}"))).await;
        }
        let ndjson = log.to_ndjson().await.unwrap();
        let restored = parse_ndjson(&ndjson).unwrap();
        assert_eq!(restored.len(), 3);
        assert_eq!(restored[2].idx, 2);
    }

    #[tokio::test]
    async fn usage_total_is_recomputed_from_loaded_messages() {
        let conv_id = conv();
        let msg = Message::user(conv_id, "hi").with_usage(Usage::new(10, 5, 0, 0, 0.01));
        let log = MessageLog::from_messages(conv(), vec![msg]);
        let state = log.state().await;
        assert_eq!(state.message_count, 1);
        assert_eq!(state.total_usage.input_tokens, 10);
        assert_eq!(state.total_usage.cost_usd, 0.01);
    }
}
