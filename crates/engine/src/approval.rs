//! Approval correlation.
//!
//! Every tool call pauses for an explicit human verdict. The gate holds
//! one `oneshot` per outstanding `callId`; the turn loop awaits the
//! receiver while the client's `approval` message resolves the sender.
//! Duplicate verdicts for an already-resolved call are ignored.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::oneshot;

/// Thread-safe store of outstanding approval requests.
#[derive(Default)]
pub struct ApprovalGate {
    pending: Mutex<HashMap<String, oneshot::Sender<bool>>>,
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an outstanding call and get the verdict receiver.
    ///
    /// Re-registering the same `callId` replaces the previous waiter
    /// (which then observes a closed channel).
    pub fn register(&self, call_id: &str) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(call_id.to_owned(), tx);
        rx
    }

    /// Deliver a verdict. Returns `false` for unknown or already-resolved
    /// call ids (duplicates are ignored).
    pub fn resolve(&self, call_id: &str, approved: bool) -> bool {
        match self.pending.lock().remove(call_id) {
            Some(tx) => tx.send(approved).is_ok(),
            None => false,
        }
    }

    /// Drop an outstanding request (cancelled turn). The waiter observes
    /// a closed channel.
    pub fn abandon(&self, call_id: &str) {
        self.pending.lock().remove(call_id);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn approve_resolves_waiter() {
        let gate = ApprovalGate::new();
        let rx = gate.register("c1");
        assert_eq!(gate.pending_count(), 1);

        assert!(gate.resolve("c1", true));
        assert!(rx.await.unwrap());
        assert_eq!(gate.pending_count(), 0);
    }

    #[tokio::test]
    async fn deny_resolves_waiter() {
        let gate = ApprovalGate::new();
        let rx = gate.register("c2");
        assert!(gate.resolve("c2", false));
        assert!(!rx.await.unwrap());
    }

    #[test]
    fn duplicate_verdict_is_ignored() {
        let gate = ApprovalGate::new();
        let _rx = gate.register("c1");
        assert!(gate.resolve("c1", true));
        assert!(!gate.resolve("c1", false), "second verdict must be ignored");
    }

    #[test]
    fn unknown_call_id_is_ignored() {
        let gate = ApprovalGate::new();
        assert!(!gate.resolve("ghost", true));
    }

    #[tokio::test]
    async fn abandon_closes_the_channel() {
        let gate = ApprovalGate::new();
        let rx = gate.register("c1");
        gate.abandon("c1");
        assert!(rx.await.is_err());
        assert!(!gate.resolve("c1", true));
    }
}
