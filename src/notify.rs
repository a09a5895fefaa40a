use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub keyed by book id or member id.
///
/// Every committed event goes to its book's channel and to the channel of each
/// member it touches, so a member listening on their own id hears when a
/// reservation is promoted for them.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a book or member. Creates the channel if needed.
    pub fn subscribe(&self, key: Ulid) -> broadcast::Receiver<Event> {
        self.channels
            .entry(key)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Send to one channel. No-op if nobody is listening.
    pub fn send(&self, key: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&key)
            && sender.send(event.clone()).is_err()
        {
            // Last receiver went away; drop the channel once it is idle.
            drop(sender);
            self.channels.remove_if(&key, |_, s| s.receiver_count() == 0);
        }
    }

    /// Fan an event out to its book and every member it concerns.
    pub fn publish(&self, event: &Event) {
        self.send(event.book_id(), event);
        for member_id in event.members() {
            self.send(member_id, event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Promotion;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let book = Ulid::new();
        let mut rx = hub.subscribe(book);

        let event = Event::CopiesAdjusted { book_id: book, total_copies: 4 };
        hub.publish(&event);
        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn promoted_member_hears_the_return() {
        let hub = NotifyHub::new();
        let waiter = Ulid::new();
        let mut rx = hub.subscribe(waiter);

        let event = Event::LoanReturned {
            id: Ulid::new(),
            book_id: Ulid::new(),
            member_id: Ulid::new(),
            returned_at: 0,
            promoted: Some(Promotion {
                reservation_id: Ulid::new(),
                member_id: waiter,
                expires_at: 10,
            }),
        };
        hub.publish(&event);
        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let book = Ulid::new();
        hub.send(book, &Event::CopiesAdjusted { book_id: book, total_copies: 1 });
    }

    #[tokio::test]
    async fn idle_channel_is_dropped() {
        let hub = NotifyHub::new();
        let book = Ulid::new();
        drop(hub.subscribe(book));
        hub.send(book, &Event::CopiesAdjusted { book_id: book, total_copies: 1 });
        assert!(hub.channels.get(&book).is_none());
    }
}
