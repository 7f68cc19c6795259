//! Message Transport
//!
//! The transport itself is an external collaborator; the backend only
//! needs two operations: fire-and-forget delivery and a blocking RPC for
//! file resolution. [`ChannelBus`] is the in-process reference transport
//! used by the test suites and by embedders that run the front-end in the
//! same process.

use std::time::Duration;

use parking_lot::Mutex;

use super::Message;
use crate::errors::{RenderError, Result};

/// Transport contract for outbound messages.
pub trait MessageSink: Send + Sync {
    /// Delivers a message; ordering is preserved per sender.
    fn send(&self, msg: Message) -> Result<()>;

    /// Delivers a request and blocks for the matching reply.
    ///
    /// Only control threads and explicitly sanctioned tasks may call this
    /// (it blocks the calling thread).
    fn request(&self, msg: Message) -> Result<Message>;
}

/// In-process transport backed by flume channels.
pub struct ChannelBus {
    outgoing: flume::Sender<Message>,
    replies: Mutex<flume::Receiver<Message>>,
    reply_timeout: Duration,
}

impl ChannelBus {
    /// Creates a bus endpoint. Returns the bus plus the front-end side:
    /// a receiver for everything the backend sends, and a sender used to
    /// answer RPC requests.
    #[must_use]
    pub fn endpoint() -> (Self, flume::Receiver<Message>, flume::Sender<Message>) {
        let (out_tx, out_rx) = flume::unbounded();
        let (reply_tx, reply_rx) = flume::unbounded();
        let bus = Self {
            outgoing: out_tx,
            replies: Mutex::new(reply_rx),
            reply_timeout: Duration::from_secs(10),
        };
        (bus, out_rx, reply_tx)
    }

    #[must_use]
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }
}

impl MessageSink for ChannelBus {
    fn send(&self, msg: Message) -> Result<()> {
        self.outgoing
            .send(msg)
            .map_err(|_| RenderError::NetworkConnection("message channel closed".into()))
    }

    fn request(&self, msg: Message) -> Result<Message> {
        // Hold the reply receiver across the round trip so concurrent
        // requesters cannot steal each other's replies.
        let replies = self.replies.lock();
        self.send(msg)?;
        replies
            .recv_timeout(self.reply_timeout)
            .map_err(|_| RenderError::NetworkConnection("no reply from front-end".into()))
    }
}

/// A sink that drops everything; handy for headless tests.
pub struct NullBus;

impl MessageSink for NullBus {
    fn send(&self, _msg: Message) -> Result<()> {
        Ok(())
    }

    fn request(&self, _msg: Message) -> Result<Message> {
        Err(RenderError::NetworkConnection(
            "null transport cannot carry requests".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{MessageClass, MessageIdent};

    #[test]
    fn send_is_received_in_order() {
        let (bus, rx, _reply_tx) = ChannelBus::endpoint();
        bus.send(Message::new(MessageClass::ViewOutput, MessageIdent::Progress))
            .unwrap();
        bus.send(Message::new(MessageClass::ViewOutput, MessageIdent::Done))
            .unwrap();
        assert_eq!(rx.recv().unwrap().ident, MessageIdent::Progress);
        assert_eq!(rx.recv().unwrap().ident, MessageIdent::Done);
    }

    #[test]
    fn request_round_trip() {
        let (bus, rx, reply_tx) = ChannelBus::endpoint();
        let handle = std::thread::spawn(move || {
            let req = rx.recv().unwrap();
            assert_eq!(req.ident, MessageIdent::FindFile);
            reply_tx
                .send(Message::new(MessageClass::FileAccess, MessageIdent::FindFile))
                .unwrap();
        });
        let reply = bus
            .request(Message::new(MessageClass::FileAccess, MessageIdent::FindFile))
            .unwrap();
        assert_eq!(reply.class, MessageClass::FileAccess);
        handle.join().unwrap();
    }
}
