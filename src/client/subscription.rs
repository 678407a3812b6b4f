use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bus::{Channel, Event};

/// A live subscription to one relay channel.
///
/// Dropping it releases the underlying receiver (or stops the task feeding
/// it), so a view unsubscribes simply by going out of scope.
pub struct Subscription {
    channel: Channel,
    source: Source,
}

enum Source {
    /// Directly attached to the in-process relay
    Relay(broadcast::Receiver<Event>),
    /// Fed by a background task, e.g. an SSE reader
    Forwarded {
        rx: mpsc::Receiver<Event>,
        task: JoinHandle<()>,
    },
}

impl Subscription {
    pub fn from_relay(channel: Channel, rx: broadcast::Receiver<Event>) -> Self {
        Self {
            channel,
            source: Source::Relay(rx),
        }
    }

    pub fn forwarded(channel: Channel, rx: mpsc::Receiver<Event>, task: JoinHandle<()>) -> Self {
        Self {
            channel,
            source: Source::Forwarded { rx, task },
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Wait for the next event. `None` once the channel is gone.
    ///
    /// Events skipped because this subscriber lagged behind are lost; the
    /// durable store is how a view catches up.
    pub async fn next(&mut self) -> Option<Event> {
        match &mut self.source {
            Source::Relay(rx) => loop {
                match rx.recv().await {
                    Ok(event) => return Some(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Lagged on {}, {} event(s) dropped", self.channel, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
            Source::Forwarded { rx, .. } => rx.recv().await,
        }
    }

    /// Next event if one is already buffered.
    pub fn try_next(&mut self) -> Option<Event> {
        match &mut self.source {
            Source::Relay(rx) => loop {
                match rx.try_recv() {
                    Ok(event) => return Some(event),
                    Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                    Err(_) => return None,
                }
            },
            Source::Forwarded { rx, .. } => rx.try_recv().ok(),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Source::Forwarded { task, .. } = &self.source {
            task.abort();
        }
        debug!("Unsubscribed from {}", self.channel);
    }
}

/// Incremental decoder for a `text/event-stream` body.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
}

/// One decoded server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of the body; returns every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.extend(chunk.iter().filter(|b| **b != b'\r'));

        let mut frames = Vec::new();
        while let Some(end) = self.buf.windows(2).position(|w| w == b"\n\n") {
            let block: Vec<u8> = self.buf.drain(..end + 2).collect();
            if let Some(frame) = parse_block(&String::from_utf8_lossy(&block)) {
                frames.push(frame);
            }
        }
        frames
    }
}

fn parse_block(block: &str) -> Option<SseFrame> {
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();

    for line in block.lines() {
        // Comments carry keep-alives
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data.push(value),
            _ => {}
        }
    }

    if event.is_none() && data.is_empty() {
        return None;
    }
    Some(SseFrame {
        event: event.unwrap_or_else(|| "message".to_string()),
        data: data.join("\n"),
    })
}
