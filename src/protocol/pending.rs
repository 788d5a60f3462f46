//! Registry of in-flight operations, keyed by command kind
//!
//! The firmware does not echo request ids, so there can be at most one
//! operation per kind. Each entry carries a ticket so that a late cleanup
//! (timeout task, dropped caller) can never remove a newer entry of the same
//! kind.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use super::command::{CommandKind, TimeoutPolicy};
use super::response::Reply;
use super::ProtocolError;

pub type Outcome = Result<Reply, ProtocolError>;

#[derive(Debug)]
struct PendingOp {
    ticket: u64,
    deadline: Instant,
    timeout: Duration,
    wallet_index: Option<u32>,
    tx: oneshot::Sender<Outcome>,
}

impl PendingOp {
    fn settle(self, outcome: Outcome) {
        // The caller may already be gone
        let _ = self.tx.send(outcome);
    }
}

#[derive(Debug, Default)]
pub struct PendingRegistry {
    ops: HashMap<CommandKind, PendingOp>,
    next_ticket: u64,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new operation
    ///
    /// Fails with [`ProtocolError::AlreadyPending`] if one of the same kind is
    /// still waiting.
    pub fn insert(
        &mut self,
        kind: CommandKind,
        timeout: Duration,
        wallet_index: Option<u32>,
        now: Instant,
    ) -> Result<(u64, oneshot::Receiver<Outcome>), ProtocolError> {
        if self.ops.contains_key(&kind) {
            return Err(ProtocolError::AlreadyPending(kind));
        }

        self.next_ticket += 1;
        let ticket = self.next_ticket;
        let (tx, rx) = oneshot::channel();
        self.ops.insert(
            kind,
            PendingOp {
                ticket,
                deadline: now + timeout,
                timeout,
                wallet_index,
                tx,
            },
        );
        Ok((ticket, rx))
    }

    pub fn contains(&self, kind: CommandKind) -> bool {
        self.ops.contains_key(&kind)
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Kinds currently waiting, in a stable order
    pub fn pending_kinds(&self) -> Vec<CommandKind> {
        let mut kinds: Vec<_> = self.ops.keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// First kind in `order` that is pending
    pub fn first_pending(&self, order: &[CommandKind]) -> Option<CommandKind> {
        order.iter().copied().find(|kind| self.contains(*kind))
    }

    /// Wallet index the operation was sent for, if any
    pub fn wallet_index(&self, kind: CommandKind) -> Option<u32> {
        self.ops.get(&kind).and_then(|op| op.wallet_index)
    }

    /// Current deadline of the entry holding `ticket`
    pub fn deadline(&self, kind: CommandKind, ticket: u64) -> Option<Instant> {
        self.ops
            .get(&kind)
            .filter(|op| op.ticket == ticket)
            .map(|op| op.deadline)
    }

    pub fn resolve(&mut self, kind: CommandKind, reply: Reply) -> bool {
        match self.ops.remove(&kind) {
            Some(op) => {
                op.settle(Ok(reply));
                true
            }
            None => false,
        }
    }

    pub fn reject(&mut self, kind: CommandKind, error: ProtocolError) -> bool {
        match self.ops.remove(&kind) {
            Some(op) => {
                op.settle(Err(error));
                true
            }
            None => false,
        }
    }

    /// Reject every waiting operation; returns how many were settled
    pub fn reject_all(&mut self, error: &ProtocolError) -> usize {
        let count = self.ops.len();
        for (_, op) in self.ops.drain() {
            op.settle(Err(error.clone()));
        }
        count
    }

    /// Push out the deadline of every kind that treats chunk traffic as liveness
    pub fn refresh_on_chunk(&mut self, now: Instant) {
        for (kind, op) in self.ops.iter_mut() {
            if kind.refreshes_on_chunk() {
                op.deadline = now + op.timeout;
                tracing::debug!("{} deadline refreshed by chunk", kind);
            }
        }
    }

    /// Settle the entry holding `ticket` per its kind's timeout policy, if its
    /// deadline has passed. Returns whether it was settled.
    pub fn expire_if_due(&mut self, kind: CommandKind, ticket: u64, now: Instant) -> bool {
        let due = self
            .ops
            .get(&kind)
            .is_some_and(|op| op.ticket == ticket && op.deadline <= now);
        if !due {
            return false;
        }

        let Some(op) = self.ops.remove(&kind) else {
            return false;
        };
        match kind.timeout_policy() {
            TimeoutPolicy::Reject => {
                tracing::warn!("{} timed out after {:?}", kind, op.timeout);
                op.settle(Err(ProtocolError::Timeout(kind)));
            }
            TimeoutPolicy::Resolve(reply) => {
                tracing::debug!("{} got no answer, settling with default", kind);
                op.settle(Ok(reply));
            }
        }
        true
    }

    /// Drop the entry holding `ticket` without settling it
    pub fn remove_ticket(&mut self, kind: CommandKind, ticket: u64) -> bool {
        if self.ops.get(&kind).is_some_and(|op| op.ticket == ticket) {
            self.ops.remove(&kind);
            true
        } else {
            false
        }
    }
}
