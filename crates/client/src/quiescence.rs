// Quiescence coordination.
//
// Two situations force inbound data messages to be buffered instead of
// applied: a reconnect (previously-ready subscriptions must re-deliver, and
// resent methods must report data-done) and an in-flight `wait` method.
// Both are modeled the same way: a set of blocking conditions plus a FIFO
// buffer, flushed as one atomic store transaction when the sets drain.

use std::collections::HashSet;

use syncwire_common::protocol::ServerMessage;
use syncwire_common::types::{MethodId, SubId};

/// Work that must wait until the current batch of updates has been applied
/// to the stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DeferredAction {
    /// All data written by the method is now visible locally.
    MethodDataVisible(MethodId),
    /// The subscription's initial data is now fully in the stores.
    SubscriptionReady(SubId),
}

#[derive(Default)]
pub(crate) struct QuiescenceState {
    buffered: Vec<ServerMessage>,
    subs_being_revived: HashSet<SubId>,
    methods_blocking: HashSet<MethodId>,
    reset_stores: bool,
    deferred: Vec<DeferredAction>,
}

impl QuiescenceState {
    pub fn waiting(&self) -> bool {
        !self.subs_being_revived.is_empty() || !self.methods_blocking.is_empty()
    }

    pub fn buffer(&mut self, message: ServerMessage) {
        self.buffered.push(message);
    }

    pub fn take_buffered(&mut self) -> Vec<ServerMessage> {
        std::mem::take(&mut self.buffered)
    }

    pub fn clear_buffered(&mut self) {
        self.buffered.clear();
    }

    /// Unblock whatever this message satisfies, before it is buffered.
    pub fn note_message_effects(&mut self, message: &ServerMessage) {
        match message {
            ServerMessage::Ready { subs } => {
                for sub in subs {
                    self.subs_being_revived.remove(sub);
                }
            }
            ServerMessage::Updated { methods } => {
                for method in methods {
                    self.methods_blocking.remove(method);
                }
            }
            _ => {}
        }
    }

    /// A `nosub` also settles a reviving subscription: it will never become
    /// ready again.
    pub fn note_sub_gone(&mut self, id: &SubId) {
        self.subs_being_revived.remove(id);
    }

    pub fn begin_revival(&mut self, subs: impl IntoIterator<Item = SubId>) {
        self.subs_being_revived = subs.into_iter().collect();
    }

    pub fn block_on_method(&mut self, id: MethodId) {
        self.methods_blocking.insert(id);
    }

    pub fn clear_blocking(&mut self) {
        self.methods_blocking.clear();
    }

    pub fn mark_reset_needed(&mut self) {
        self.reset_stores = true;
    }

    pub fn reset_pending(&self) -> bool {
        self.reset_stores
    }

    /// Consume the reset flag at the point a store transaction begins.
    pub fn take_reset_flag(&mut self) -> bool {
        std::mem::replace(&mut self.reset_stores, false)
    }

    pub fn push_deferred(&mut self, action: DeferredAction) {
        self.deferred.push(action);
    }

    pub fn take_deferred(&mut self) -> Vec<DeferredAction> {
        std::mem::take(&mut self.deferred)
    }

    pub fn clear_deferred(&mut self) {
        self.deferred.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waits_while_any_condition_is_outstanding() {
        let mut state = QuiescenceState::default();
        assert!(!state.waiting());

        state.begin_revival(vec![SubId::from("s1")]);
        state.block_on_method(MethodId::from("1"));
        assert!(state.waiting());

        state.note_message_effects(&ServerMessage::Ready { subs: vec![SubId::from("s1")] });
        assert!(state.waiting());

        state.note_message_effects(&ServerMessage::Updated { methods: vec![MethodId::from("1")] });
        assert!(!state.waiting());
    }

    #[test]
    fn buffer_preserves_arrival_order() {
        let mut state = QuiescenceState::default();
        state.buffer(ServerMessage::Ready { subs: vec![SubId::from("a")] });
        state.buffer(ServerMessage::Ready { subs: vec![SubId::from("b")] });

        let drained = state.take_buffered();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0], ServerMessage::Ready { subs: vec![SubId::from("a")] });
        assert!(state.take_buffered().is_empty());
    }

    #[test]
    fn nosub_settles_a_reviving_subscription() {
        let mut state = QuiescenceState::default();
        state.begin_revival(vec![SubId::from("s1")]);
        state.note_sub_gone(&SubId::from("s1"));
        assert!(!state.waiting());
    }

    #[test]
    fn reset_flag_is_consumed_once() {
        let mut state = QuiescenceState::default();
        state.mark_reset_needed();
        assert!(state.reset_pending());
        assert!(state.take_reset_flag());
        assert!(!state.take_reset_flag());
    }
}
