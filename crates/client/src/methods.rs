// Method invocation pipeline state.
//
// Invocations live in an arena keyed by method id; the outstanding-block
// queue orders ids only and never owns the invocations. A block groups
// methods that may be in flight concurrently. Blocks are strictly FIFO:
// block i+1 sends nothing until every invocation of block i has both
// received its result and had its data made visible.

use std::collections::VecDeque;

use serde_json::Value;

use syncwire_common::protocol::ClientMessage;
use syncwire_common::types::{MethodError, MethodId};

use crate::error::ConnectionError;

/// The outcome of a method as reported by the server (or, for nested
/// simulations, by the stub).
pub type MethodResult = Result<Value, MethodError>;

/// Invoked exactly once, after the result has arrived and all data written
/// by the method's stub is visible in the stores.
pub type MethodCallback = Box<dyn FnOnce(MethodResult)>;

/// Invoked as soon as the result message arrives; the data written by the
/// method may not be in the stores yet.
pub type ResultHook = Box<dyn FnOnce(&MethodResult)>;

/// Options accepted by `Connection::apply`.
#[derive(Default)]
pub struct MethodOptions {
    /// Send this method only after every earlier method has fully finished,
    /// and hold every later method until this one has.
    pub wait: bool,
    /// Return the stub's value from `apply` instead of `None`.
    pub return_stub_value: bool,
    pub on_result_received: Option<ResultHook>,
}

/// One outstanding remote invocation.
pub(crate) struct MethodInvocation {
    pub id: MethodId,
    /// The outbound message, retained so reconnects can resend it.
    pub message: ClientMessage,
    pub wait: bool,
    pub sent_message: bool,
    pub data_visible: bool,
    result: Option<MethodResult>,
    callback: Option<MethodCallback>,
    on_result_received: Option<ResultHook>,
}

impl MethodInvocation {
    pub fn new(
        id: MethodId,
        message: ClientMessage,
        wait: bool,
        callback: Option<MethodCallback>,
        on_result_received: Option<ResultHook>,
    ) -> Self {
        Self {
            id,
            message,
            wait,
            sent_message: false,
            data_visible: false,
            result: None,
            callback,
            on_result_received,
        }
    }

    pub fn has_result(&self) -> bool {
        self.result.is_some()
    }

    /// Record the server's outcome. A method receives a result at most once.
    pub fn receive_result(&mut self, outcome: MethodResult) -> Result<(), ConnectionError> {
        if self.result.is_some() {
            return Err(ConnectionError::DuplicateResult(self.id.clone()));
        }
        if let Some(hook) = self.on_result_received.take() {
            hook(&outcome);
        }
        self.result = Some(outcome);
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.result.is_some() && self.data_visible
    }

    pub fn take_completion(&mut self) -> (Option<MethodCallback>, Option<MethodResult>) {
        (self.callback.take(), self.result.take())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct InvocationBlock {
    pub wait: bool,
    pub method_ids: Vec<MethodId>,
}

/// FIFO queue of invocation blocks.
///
/// Invariant: no two adjacent blocks both have `wait == false`; the only
/// thing that serializes methods is a wait method, so adjacent non-wait
/// runs always share a block.
#[derive(Debug, Default)]
pub(crate) struct OutstandingBlocks {
    blocks: VecDeque<InvocationBlock>,
}

impl OutstandingBlocks {
    /// Queue a method. Returns true when it landed in the first block and
    /// should be sent immediately.
    pub fn enqueue(&mut self, id: MethodId, wait: bool) -> bool {
        if wait {
            // Wait methods go in their own block.
            self.blocks.push_back(InvocationBlock { wait: true, method_ids: vec![id] });
        } else {
            match self.blocks.back_mut() {
                Some(block) if !block.wait => block.method_ids.push(id),
                _ => self.blocks.push_back(InvocationBlock { wait: false, method_ids: vec![id] }),
            }
        }
        self.blocks.len() == 1
    }

    /// Drop `id` from the first block when a result arrives. The block
    /// itself is retired separately, once its data is visible too.
    pub fn remove_from_first(&mut self, id: &MethodId) -> bool {
        let Some(first) = self.blocks.front_mut() else {
            return false;
        };
        match first.method_ids.iter().position(|m| m == id) {
            Some(index) => {
                first.method_ids.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn first_block_ids(&self) -> &[MethodId] {
        self.blocks.front().map_or(&[], |block| block.method_ids.as_slice())
    }

    pub fn pop_first(&mut self) -> Option<InvocationBlock> {
        self.blocks.pop_front()
    }

    /// Used at reconnect: a first block whose methods all got results (but
    /// not data visibility) holds nothing to resend.
    pub fn discard_empty_first_block(&mut self) {
        if self.blocks.front().is_some_and(|block| block.method_ids.is_empty()) {
            self.blocks.pop_front();
        }
    }

    pub fn take_all(&mut self) -> VecDeque<InvocationBlock> {
        std::mem::take(&mut self.blocks)
    }

    /// Splice the pre-reconnect blocks behind whatever the reconnect hook
    /// enqueued, merging across the seam when neither side is a wait block.
    /// Returns the ids that became sendable and must go out now.
    pub fn merge_after_reconnect(&mut self, old: VecDeque<InvocationBlock>) -> Vec<MethodId> {
        let mut old = old;
        if old.is_empty() {
            return Vec::new();
        }

        // The hook sent nothing: restore the old queue wholesale and resend
        // its first block.
        if self.blocks.is_empty() {
            let to_send = old.front().map_or_else(Vec::new, |block| block.method_ids.clone());
            self.blocks = old;
            return to_send;
        }

        let mut to_send = Vec::new();
        let seam_merges = !self.blocks.back().is_some_and(|block| block.wait)
            && !old.front().is_some_and(|block| block.wait);
        if seam_merges {
            if let Some(first_old) = old.pop_front() {
                // The hook's methods were already sent when they were
                // enqueued; the moved ones send only if they join the block
                // currently in flight.
                let joins_first_block = self.blocks.len() == 1;
                if let Some(last) = self.blocks.back_mut() {
                    for id in first_old.method_ids {
                        if joins_first_block {
                            to_send.push(id.clone());
                        }
                        last.method_ids.push(id);
                    }
                }
            }
        }

        self.blocks.extend(old);
        to_send
    }

    #[cfg(test)]
    fn iter(&self) -> impl Iterator<Item = &InvocationBlock> {
        self.blocks.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn id(n: u64) -> MethodId {
        MethodId::from_seq(n)
    }

    fn block(wait: bool, ids: &[u64]) -> InvocationBlock {
        InvocationBlock { wait, method_ids: ids.iter().copied().map(id).collect() }
    }

    #[test]
    fn non_wait_methods_share_a_block() {
        let mut blocks = OutstandingBlocks::default();
        assert!(blocks.enqueue(id(1), false));
        assert!(blocks.enqueue(id(2), false));
        assert_eq!(blocks.iter().collect::<Vec<_>>(), vec![&block(false, &[1, 2])]);
    }

    #[test]
    fn wait_method_gets_a_solitary_block() {
        let mut blocks = OutstandingBlocks::default();
        assert!(blocks.enqueue(id(1), true));
        assert!(!blocks.enqueue(id(2), false));
        assert!(!blocks.enqueue(id(3), false));
        assert!(!blocks.enqueue(id(4), true));
        assert_eq!(
            blocks.iter().collect::<Vec<_>>(),
            vec![&block(true, &[1]), &block(false, &[2, 3]), &block(true, &[4])]
        );
    }

    #[test]
    fn only_first_block_methods_send_immediately() {
        let mut blocks = OutstandingBlocks::default();
        assert!(blocks.enqueue(id(1), false));
        assert!(blocks.enqueue(id(2), false));
        assert!(!blocks.enqueue(id(3), true));
    }

    #[test]
    fn result_removal_searches_only_the_first_block() {
        let mut blocks = OutstandingBlocks::default();
        blocks.enqueue(id(1), true);
        blocks.enqueue(id(2), false);

        assert!(!blocks.remove_from_first(&id(2)));
        assert!(blocks.remove_from_first(&id(1)));
        assert!(blocks.first_block_ids().is_empty());
    }

    #[test]
    fn discard_empty_first_block_keeps_nonempty_ones() {
        let mut blocks = OutstandingBlocks::default();
        blocks.enqueue(id(1), false);
        blocks.discard_empty_first_block();
        assert_eq!(blocks.first_block_ids(), &[id(1)]);

        blocks.remove_from_first(&id(1));
        blocks.discard_empty_first_block();
        assert!(blocks.is_empty());
    }

    #[test]
    fn merge_restores_old_queue_when_hook_sent_nothing() {
        let mut blocks = OutstandingBlocks::default();
        blocks.enqueue(id(1), false);
        blocks.enqueue(id(2), true);
        let old = blocks.take_all();

        let to_send = blocks.merge_after_reconnect(old);
        assert_eq!(to_send, vec![id(1)]);
        assert_eq!(
            blocks.iter().collect::<Vec<_>>(),
            vec![&block(false, &[1]), &block(true, &[2])]
        );
    }

    #[test]
    fn merge_joins_non_wait_blocks_across_the_seam() {
        let mut blocks = OutstandingBlocks::default();
        blocks.enqueue(id(1), false);
        blocks.enqueue(id(2), false);
        let old = blocks.take_all();

        // Simulates the reconnect hook having queued method 10.
        blocks.enqueue(id(10), false);

        let to_send = blocks.merge_after_reconnect(old);
        assert_eq!(to_send, vec![id(1), id(2)]);
        assert_eq!(blocks.iter().collect::<Vec<_>>(), vec![&block(false, &[10, 1, 2])]);
    }

    #[test]
    fn merge_keeps_wait_blocks_apart() {
        let mut blocks = OutstandingBlocks::default();
        blocks.enqueue(id(1), false);
        let old = blocks.take_all();

        blocks.enqueue(id(10), true);

        let to_send = blocks.merge_after_reconnect(old);
        assert!(to_send.is_empty());
        assert_eq!(
            blocks.iter().collect::<Vec<_>>(),
            vec![&block(true, &[10]), &block(false, &[1])]
        );
    }

    #[test]
    fn receive_result_rejects_a_second_result() {
        let message = ClientMessage::Method {
            method: "noop".into(),
            params: vec![],
            id: id(1),
            random_seed: None,
        };
        let mut invocation = MethodInvocation::new(id(1), message, false, None, None);
        invocation.receive_result(Ok(Value::Null)).expect("first result");
        assert!(matches!(
            invocation.receive_result(Ok(Value::Null)),
            Err(ConnectionError::DuplicateResult(_))
        ));
    }

    proptest! {
        /// Any interleaving of wait and non-wait enqueues keeps the queue
        /// invariant: wait blocks are solitary and non-wait blocks never
        /// touch.
        #[test]
        fn queue_invariant_holds(waits in prop::collection::vec(any::<bool>(), 0..40)) {
            let mut blocks = OutstandingBlocks::default();
            for (seq, wait) in waits.iter().enumerate() {
                blocks.enqueue(id(seq as u64), *wait);
            }

            let collected: Vec<_> = blocks.iter().collect();
            for pair in collected.windows(2) {
                prop_assert!(pair[0].wait || pair[1].wait);
            }
            for b in &collected {
                if b.wait {
                    prop_assert_eq!(b.method_ids.len(), 1);
                }
            }
            // FIFO: ids appear in enqueue order when blocks are flattened.
            let flattened: Vec<_> =
                collected.iter().flat_map(|b| b.method_ids.iter().cloned()).collect();
            let expected: Vec<_> = (0..waits.len() as u64).map(id).collect();
            prop_assert_eq!(flattened, expected);
        }
    }
}
