//! Supplicant command queue
//!
//! Outstanding requests to the supplicant are serialized here: commands are
//! dispatched in FIFO order and at most one is in flight at any time, so an
//! incoming `OK`/`FAIL` always belongs to the head command. Completion
//! handlers run against the owning component (`C`), which lets them advance
//! manager state and enqueue follow-up commands reentrantly.

use std::collections::VecDeque;

use crate::message::Message;

/// A queued request and the continuation to run on its reply.
pub struct PendingCommand<C> {
    pub message: Message,
    pub handler: Box<dyn FnOnce(&mut C, &Message) + Send>,
}

/// FIFO queue with a single in-flight slot.
pub struct CommandQueue<C> {
    in_flight: Option<PendingCommand<C>>,
    queued: VecDeque<PendingCommand<C>>,
}

impl<C> Default for CommandQueue<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> CommandQueue<C> {
    pub fn new() -> Self {
        Self {
            in_flight: None,
            queued: VecDeque::new(),
        }
    }

    /// Enqueue a command. If nothing is in flight the command takes the
    /// slot immediately and its serialized datagram is returned for
    /// transmission.
    pub fn enqueue<F>(&mut self, message: Message, handler: F) -> Option<String>
    where
        F: FnOnce(&mut C, &Message) + Send + 'static,
    {
        let command = PendingCommand {
            message,
            handler: Box::new(handler),
        };
        if self.in_flight.is_none() {
            let wire = command.message.to_wire();
            self.in_flight = Some(command);
            Some(wire)
        } else {
            self.queued.push_back(command);
            None
        }
    }

    /// Take the in-flight command so its handler can be invoked with the
    /// reply. `None` means a reply arrived with nothing outstanding, which
    /// is a protocol violation the caller logs and drops.
    pub fn take_in_flight(&mut self) -> Option<PendingCommand<C>> {
        self.in_flight.take()
    }

    /// Promote the next queued command into the in-flight slot, returning
    /// its serialized datagram. No-op while a command is still in flight,
    /// which keeps the handler-enqueues-and-transmits path from double
    /// sending.
    pub fn pump(&mut self) -> Option<String> {
        if self.in_flight.is_some() {
            return None;
        }
        let command = self.queued.pop_front()?;
        let wire = command.message.to_wire();
        self.in_flight = Some(command);
        Some(wire)
    }

    /// Drop every pending command. Used when the supplicant link goes away;
    /// outstanding completions never fire.
    pub fn clear(&mut self) {
        self.in_flight = None;
        self.queued.clear();
    }

    pub fn in_flight(&self) -> Option<&Message> {
        self.in_flight.as_ref().map(|command| &command.message)
    }

    pub fn len(&self) -> usize {
        self.queued.len() + usize::from(self.in_flight.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
