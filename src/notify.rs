use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::clock::{Clock, SystemClock};
use crate::limits::MAX_INBOX_LEN;
use crate::model::{Notification, NotificationRequest};
use crate::store::{NotificationSink, StoreError};

const CHANNEL_CAPACITY: usize = 256;

/// In-process notification sink: a bounded inbox per user plus a broadcast
/// channel per user for live listeners.
pub struct NotifyHub {
    inboxes: DashMap<Ulid, Vec<Notification>>,
    channels: DashMap<Ulid, broadcast::Sender<Notification>>,
    clock: Arc<dyn Clock>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Stamp notifications with `clock` instead of the system time.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inboxes: DashMap::new(),
            channels: DashMap::new(),
            clock,
        }
    }

    /// Subscribe to a user's live notifications. Creates the channel if needed.
    pub fn subscribe(&self, user_id: Ulid) -> broadcast::Receiver<Notification> {
        self.channels
            .entry(user_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Newest last.
    pub fn inbox(&self, user_id: &Ulid) -> Vec<Notification> {
        self.inboxes
            .get(user_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub fn unread_count(&self, user_id: &Ulid) -> usize {
        self.inboxes
            .get(user_id)
            .map_or(0, |e| e.value().iter().filter(|n| !n.read).count())
    }

    /// Returns false if the notification is not in this user's inbox.
    pub fn mark_read(&self, user_id: &Ulid, notification_id: &Ulid) -> bool {
        let Some(mut inbox) = self.inboxes.get_mut(user_id) else {
            return false;
        };
        match inbox.iter_mut().find(|n| n.id == *notification_id) {
            Some(n) => {
                n.read = true;
                true
            }
            None => false,
        }
    }

    pub fn has_channel(&self, user_id: &Ulid) -> bool {
        self.channels.contains_key(user_id)
    }

    /// Drop a user's channel once nobody listens.
    pub fn prune(&self, user_id: &Ulid) {
        self.channels
            .remove_if(user_id, |_, sender| sender.receiver_count() == 0);
    }

    fn deliver(&self, notification: Notification) {
        let user_id = notification.user_id;
        {
            let mut inbox = self.inboxes.entry(user_id).or_default();
            inbox.push(notification.clone());
            if inbox.len() > MAX_INBOX_LEN {
                let excess = inbox.len() - MAX_INBOX_LEN;
                inbox.drain(..excess);
            }
        }
        // No-op if nobody is listening.
        if let Some(sender) = self.channels.get(&user_id) {
            let _ = sender.send(notification);
        }
    }
}

#[async_trait]
impl NotificationSink for NotifyHub {
    async fn notify(&self, request: NotificationRequest) -> Result<(), StoreError> {
        self.deliver(Notification {
            id: Ulid::new(),
            user_id: request.user_id,
            kind: request.kind,
            title: request.title,
            message: request.message,
            related_id: request.related_id,
            read: false,
            created_at: self.clock.now(),
        });
        Ok(())
    }
}
