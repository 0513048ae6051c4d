//! Acknowledgment dispositions.
//!
//! A handler returns one [`AckType`] per delivery. The consumer loop turns it
//! into exactly one broker call on that delivery.

use std::fmt;

/// Outcome a handler assigns to a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckType {
    /// Processed successfully; removed from the queue for good.
    Ack,

    /// Transient failure; returned to the queue for redelivery.
    NackRequeue,

    /// Unrecoverable failure; removed from the queue without being processed.
    NackDiscard,
}

impl AckType {
    /// The `requeue` flag of the negative acknowledgment, or `None` for
    /// [`AckType::Ack`].
    pub fn requeue(self) -> Option<bool> {
        match self {
            AckType::Ack => None,
            AckType::NackRequeue => Some(true),
            AckType::NackDiscard => Some(false),
        }
    }
}

impl fmt::Display for AckType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AckType::Ack => "ack",
            AckType::NackRequeue => "nack-requeue",
            AckType::NackDiscard => "nack-discard",
        };
        f.write_str(s)
    }
}
