//! Inter-entity messages delivered by the message-distribution phase.

use std::any::Any;
use std::fmt;

use crate::id::{EntityId, TickId};

/// Opaque message body. Domain code downcasts it on receipt.
pub type MessagePayload = Box<dyn Any + Send>;

/// One message from an entity to another entity.
///
/// Messages sent during tick `t` are delivered after the flip of tick `t`,
/// ordered by `(sent_at, from, seq)`, and reach the recipient through
/// [`Entity::on_message`](crate::Entity::on_message) before its next
/// `update()`.
pub struct Message {
    /// Sender.
    pub from: EntityId,
    /// Recipient.
    pub to: EntityId,
    /// Base tick during which the message was sent.
    pub sent_at: TickId,
    /// Per-sender sequence number within `sent_at`.
    pub seq: u32,
    /// Message body.
    pub payload: MessagePayload,
}

impl Message {
    /// Borrow the payload as `T`, if it is one.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }

    /// The key messages are delivered in.
    pub fn order_key(&self) -> (TickId, EntityId, u32) {
        (self.sent_at, self.from, self.seq)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("sent_at", &self.sent_at)
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}
