use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::bus::{Channel, Event};
use crate::client::backend::ChatBackend;
use crate::client::subscription::Subscription;
use crate::error::Result;

/// Unread badge shown in the navigation bar.
///
/// The count is never adjusted locally: every event on the global channel
/// triggers a fresh query, so all views agree with the store.
pub struct UnreadBadge<B: ChatBackend> {
    backend: Arc<B>,
    subscription: Subscription,
    count: watch::Sender<u64>,
}

impl<B: ChatBackend> UnreadBadge<B> {
    pub async fn open(backend: Arc<B>) -> Result<Self> {
        let initial = backend.unread_count().await?;
        let subscription = backend.subscribe(Channel::Global).await?;
        let (count, _) = watch::channel(initial);

        let badge = Self {
            backend,
            subscription,
            count,
        };
        // Covers events published before the subscription went live
        badge.refresh().await?;
        Ok(badge)
    }

    pub fn count(&self) -> u64 {
        *self.count.borrow()
    }

    /// Receiver other views can hold to follow the badge.
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.count.subscribe()
    }

    pub async fn refresh(&self) -> Result<u64> {
        let latest = self.backend.unread_count().await?;
        self.count.send_replace(latest);
        Ok(latest)
    }

    /// Wait for the next global event and refresh the count.
    pub async fn next_event(&mut self) -> Option<Event> {
        let event = self.subscription.next().await?;
        if let Err(e) = self.refresh().await {
            warn!("Failed to refresh unread count: {}", e);
        }
        Some(event)
    }

    /// Keep the badge current until the subscription ends.
    pub async fn run(mut self) {
        while self.next_event().await.is_some() {}
        debug!("Unread badge stopped, {} closed", self.subscription.channel());
    }
}
