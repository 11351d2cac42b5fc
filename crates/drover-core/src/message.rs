//! Loop messages and the per-iteration message store.
//!
//! Controllers do not own mailboxes. The loop carries one FIFO store per
//! iteration; every controller at every priority level walks the same
//! store and decides, message by message, whether to consume it. A message
//! nobody takes stays put for later levels in the same iteration and, if
//! still untaken, for the next iteration.
//!
//! Messages are type-erased ([`Message`] is `Box<dyn Any + Send>`) and
//! consumed by downcasting, so domain crates can flow their own types
//! through the loop without the core knowing them.

use std::{any::Any, collections::VecDeque};

/// A type-erased loop message.
pub type Message = Box<dyn Any + Send>;

/// FIFO store of loop messages.
///
/// The loop moves the globally posted messages into a store at iteration
/// start; controllers process it through [`MessageStore::process`].
#[derive(Default)]
pub struct MessageStore {
    pending: VecDeque<Message>,
}

impl MessageStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a message for the next processing cycle.
    pub fn add_message(&mut self, msg: Message) {
        self.pending.push_back(msg);
    }

    /// Appends several messages for the next processing cycle.
    pub fn add_messages(&mut self, msgs: impl IntoIterator<Item = Message>) {
        self.pending.extend(msgs);
    }

    /// Number of stored messages.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drains the store.
    pub(crate) fn into_inner(self) -> VecDeque<Message> {
        self.pending
    }

    /// Runs `proc` over the stored messages in insertion order.
    ///
    /// Per message, the processor may [`take`](MessageContext::take) it
    /// (removing it from the store), [`stop`](MessageContext::stop) the
    /// walk (later messages stay in place), and add messages for the next
    /// cycle. Untaken messages remain in order. Messages added during
    /// processing are appended after the survivors and are not visited by
    /// this walk.
    pub fn process<F>(&mut self, mut proc: F)
    where
        F: FnMut(&mut MessageContext<'_>),
    {
        let mut msgs = std::mem::take(&mut self.pending);
        let mut remains = VecDeque::with_capacity(msgs.len());
        while let Some(msg) = msgs.pop_front() {
            let mut ctx = MessageContext {
                current: Some(msg),
                stop: false,
                added: &mut self.pending,
            };
            proc(&mut ctx);
            let stop = ctx.stop;
            if let Some(msg) = ctx.current.take() {
                remains.push_back(msg);
            }
            if stop {
                remains.append(&mut msgs);
                break;
            }
        }
        // Messages added during processing follow the untaken survivors.
        remains.append(&mut self.pending);
        self.pending = remains;
    }
}

/// Context handed to a message processor for one message.
pub struct MessageContext<'a> {
    current: Option<Message>,
    stop: bool,
    added: &'a mut VecDeque<Message>,
}

impl MessageContext<'_> {
    /// Borrows the current message, if not already taken.
    pub fn current(&self) -> Option<&(dyn Any + Send)> {
        self.current.as_deref()
    }

    /// True if the current message is a `T`.
    pub fn is<T: Any>(&self) -> bool {
        self.current.as_deref().is_some_and(|m| (*m).is::<T>())
    }

    /// Takes the current message out of the store.
    pub fn take(&mut self) -> Option<Message> {
        self.current.take()
    }

    /// Takes the current message if it is a `T`; otherwise leaves it in
    /// place for the next consumer.
    pub fn take_as<T: Any + Send>(&mut self) -> Option<Box<T>> {
        if self.is::<T>() {
            self.current.take().and_then(|m| m.downcast().ok())
        } else {
            None
        }
    }

    /// Stops the walk; unvisited messages stay in the store.
    pub fn stop(&mut self) {
        self.stop = true;
    }

    /// Appends a message for the next processing cycle.
    pub fn add_message(&mut self, msg: Message) {
        self.added.push_back(msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_of(values: &[u32]) -> MessageStore {
        let mut store = MessageStore::new();
        for v in values {
            store.add_message(Box::new(*v));
        }
        store
    }

    fn values(store: &mut MessageStore) -> Vec<u32> {
        let mut out = Vec::new();
        store.process(|ctx| {
            out.push(*ctx.current().and_then(|m| m.downcast_ref::<u32>()).expect("u32"));
        });
        out
    }

    #[test]
    fn insertion_order_is_preserved() {
        let mut store = store_of(&[1, 2, 3]);
        assert_eq!(values(&mut store), vec![1, 2, 3]);
        // Nothing taken, so a second walk sees the same messages.
        assert_eq!(values(&mut store), vec![1, 2, 3]);
    }

    #[test]
    fn taken_messages_leave_the_store() {
        let mut store = store_of(&[1, 2, 3]);
        store.process(|ctx| {
            if ctx.current().and_then(|m| m.downcast_ref::<u32>()) == Some(&2) {
                ctx.take();
            }
        });
        assert_eq!(values(&mut store), vec![1, 3]);
    }

    #[test]
    fn take_as_skips_other_types() {
        let mut store = store_of(&[7]);
        store.add_message(Box::new("text"));
        let mut taken = Vec::new();
        store.process(|ctx| {
            if let Some(v) = ctx.take_as::<u32>() {
                taken.push(*v);
            }
        });
        assert_eq!(taken, vec![7]);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn stop_keeps_the_remainder_in_place() {
        let mut store = store_of(&[1, 2, 3]);
        let mut seen = Vec::new();
        store.process(|ctx| {
            let v = *ctx.current().and_then(|m| m.downcast_ref::<u32>()).expect("u32");
            seen.push(v);
            if v == 1 {
                ctx.take();
                ctx.stop();
            }
        });
        assert_eq!(seen, vec![1]);
        assert_eq!(values(&mut store), vec![2, 3]);
    }

    #[test]
    fn additions_during_processing_are_not_revisited() {
        let mut store = store_of(&[1]);
        let mut seen = Vec::new();
        store.process(|ctx| {
            let v = *ctx.current().and_then(|m| m.downcast_ref::<u32>()).expect("u32");
            seen.push(v);
            ctx.take();
            if v == 1 {
                ctx.add_message(Box::new(2u32));
            }
        });
        assert_eq!(seen, vec![1]);
        // The addition is waiting for the next walk.
        assert_eq!(values(&mut store), vec![2]);
    }

    #[test]
    fn additions_follow_untaken_survivors() {
        let mut store = store_of(&[1, 2]);
        store.process(|ctx| {
            if ctx.current().and_then(|m| m.downcast_ref::<u32>()) == Some(&1) {
                ctx.take();
                ctx.add_message(Box::new(3u32));
            }
        });
        assert_eq!(values(&mut store), vec![2, 3]);
    }
}
