// Subscription table.
//
// Subscriptions are matched for reuse by name plus structurally-equal
// params. The inactive flag exists for reactive re-evaluation: a rerun
// marks its subscriptions inactive, re-subscribing reclaims them, and
// whatever is still inactive afterwards gets stopped. That way a rerun
// that arrives at the same subscriptions sends no wire traffic at all.

use std::collections::HashMap;

use serde_json::Value;
use uuid::Uuid;

use syncwire_common::types::{MethodError, SubId};

/// Lifecycle callbacks for one subscription.
#[derive(Default)]
pub struct SubscriptionCallbacks {
    /// Fired once per subscription lifetime, when the initial data is fully
    /// in the stores.
    pub on_ready: Option<Box<dyn FnOnce()>>,
    /// Fired when the server terminates the subscription with an error
    /// before it became ready.
    pub on_error: Option<Box<dyn FnOnce(MethodError)>>,
    /// Fired when the subscription stops for any reason; carries the error
    /// if the server terminated it after it was ready.
    pub on_stop: Option<Box<dyn FnOnce(Option<MethodError>)>>,
}

impl SubscriptionCallbacks {
    pub fn on_ready(mut self, callback: impl FnOnce() + 'static) -> Self {
        self.on_ready = Some(Box::new(callback));
        self
    }

    pub fn on_error(mut self, callback: impl FnOnce(MethodError) + 'static) -> Self {
        self.on_error = Some(Box::new(callback));
        self
    }

    pub fn on_stop(mut self, callback: impl FnOnce(Option<MethodError>) + 'static) -> Self {
        self.on_stop = Some(Box::new(callback));
        self
    }
}

/// Caller-side handle to a subscription. Plain identity; all operations go
/// through the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub id: SubId,
}

pub(crate) struct Subscription {
    pub id: SubId,
    pub name: String,
    pub params: Vec<Value>,
    pub inactive: bool,
    pub ready: bool,
    pub callbacks: SubscriptionCallbacks,
}

#[derive(Default)]
pub(crate) struct SubscriptionTable {
    subs: HashMap<SubId, Subscription>,
}

impl SubscriptionTable {
    /// An inactive subscription with the same name and structurally equal
    /// params can be reclaimed instead of re-subscribed.
    pub fn find_reusable(&self, name: &str, params: &[Value]) -> Option<SubId> {
        self.subs
            .values()
            .find(|sub| sub.inactive && sub.name == name && sub.params == params)
            .map(|sub| sub.id.clone())
    }

    pub fn insert_new(
        &mut self,
        name: &str,
        params: Vec<Value>,
        callbacks: SubscriptionCallbacks,
    ) -> SubId {
        let id = SubId(Uuid::new_v4().simple().to_string());
        self.subs.insert(
            id.clone(),
            Subscription {
                id: id.clone(),
                name: name.to_string(),
                params,
                inactive: false,
                ready: false,
                callbacks,
            },
        );
        id
    }

    /// Reclaim an inactive subscription. The new ready callback only takes
    /// effect if the subscription has not already become ready; the error
    /// and stop callbacks always replace, so failures are not
    /// double-reported to a stale callback.
    pub fn reactivate(&mut self, id: &SubId, callbacks: SubscriptionCallbacks) {
        let Some(sub) = self.subs.get_mut(id) else {
            return;
        };
        sub.inactive = false;
        if let Some(on_ready) = callbacks.on_ready {
            if !sub.ready {
                sub.callbacks.on_ready = Some(on_ready);
            }
        }
        if callbacks.on_error.is_some() {
            sub.callbacks.on_error = callbacks.on_error;
        }
        if callbacks.on_stop.is_some() {
            sub.callbacks.on_stop = callbacks.on_stop;
        }
    }

    pub fn remove(&mut self, id: &SubId) -> Option<Subscription> {
        self.subs.remove(id)
    }

    pub fn contains(&self, id: &SubId) -> bool {
        self.subs.contains_key(id)
    }

    pub fn is_ready(&self, id: &SubId) -> bool {
        self.subs.get(id).is_some_and(|sub| sub.ready)
    }

    /// Mark a subscription ready, returning the ready callback if this is
    /// the first time. Readiness is reported exactly once per lifetime.
    pub fn mark_ready(&mut self, id: &SubId) -> Option<Box<dyn FnOnce()>> {
        let sub = self.subs.get_mut(id)?;
        if sub.ready {
            return None;
        }
        sub.ready = true;
        sub.callbacks.on_ready.take()
    }

    pub fn invalidate(&mut self, id: &SubId) {
        if let Some(sub) = self.subs.get_mut(id) {
            sub.inactive = true;
        }
    }

    pub fn ready_ids(&self) -> Vec<SubId> {
        self.subs.values().filter(|sub| sub.ready).map(|sub| sub.id.clone()).collect()
    }

    pub fn inactive_ids(&self) -> Vec<SubId> {
        self.subs.values().filter(|sub| sub.inactive).map(|sub| sub.id.clone()).collect()
    }

    pub fn all_ids(&self) -> Vec<SubId> {
        self.subs.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.subs.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn reuse_requires_inactive_and_equal_params() {
        let mut table = SubscriptionTable::default();
        let id = table.insert_new("feed", vec![json!(1)], SubscriptionCallbacks::default());

        // Active subscriptions are never reused.
        assert_eq!(table.find_reusable("feed", &[json!(1)]), None);

        table.invalidate(&id);
        assert_eq!(table.find_reusable("feed", &[json!(1)]), Some(id.clone()));
        assert_eq!(table.find_reusable("feed", &[json!(2)]), None);
        assert_eq!(table.find_reusable("other", &[json!(1)]), None);
    }

    #[test]
    fn reactivation_clears_the_inactive_flag() {
        let mut table = SubscriptionTable::default();
        let id = table.insert_new("feed", vec![], SubscriptionCallbacks::default());
        table.invalidate(&id);
        table.reactivate(&id, SubscriptionCallbacks::default());
        assert!(table.inactive_ids().is_empty());
    }

    #[test]
    fn ready_fires_exactly_once() {
        let mut table = SubscriptionTable::default();
        let fired = Rc::new(Cell::new(0));
        let fired_in_cb = Rc::clone(&fired);
        let id = table.insert_new(
            "feed",
            vec![],
            SubscriptionCallbacks::default().on_ready(move || fired_in_cb.set(fired_in_cb.get() + 1)),
        );

        if let Some(cb) = table.mark_ready(&id) {
            cb();
        }
        assert!(table.mark_ready(&id).is_none());
        assert_eq!(fired.get(), 1);
        assert!(table.is_ready(&id));
    }

    #[test]
    fn new_ready_callback_is_ignored_once_ready() {
        let mut table = SubscriptionTable::default();
        let id = table.insert_new("feed", vec![], SubscriptionCallbacks::default());
        if let Some(cb) = table.mark_ready(&id) {
            cb();
        }
        table.invalidate(&id);

        let fired = Rc::new(Cell::new(false));
        let fired_in_cb = Rc::clone(&fired);
        table.reactivate(
            &id,
            SubscriptionCallbacks::default().on_ready(move || fired_in_cb.set(true)),
        );

        // Still ready; the replacement callback must never fire.
        assert!(table.mark_ready(&id).is_none());
        assert!(!fired.get());
    }

    #[test]
    fn error_callback_always_replaces_on_reactivation() {
        let mut table = SubscriptionTable::default();
        let stale = Rc::new(Cell::new(false));
        let stale_in_cb = Rc::clone(&stale);
        let id = table.insert_new(
            "feed",
            vec![],
            SubscriptionCallbacks::default().on_error(move |_| stale_in_cb.set(true)),
        );
        table.invalidate(&id);

        let fresh = Rc::new(Cell::new(false));
        let fresh_in_cb = Rc::clone(&fresh);
        table.reactivate(
            &id,
            SubscriptionCallbacks::default().on_error(move |_| fresh_in_cb.set(true)),
        );

        let sub = table.remove(&id).expect("sub exists");
        if let Some(cb) = sub.callbacks.on_error {
            cb(MethodError::new(500, "boom"));
        }
        assert!(fresh.get());
        assert!(!stale.get());
    }

    #[test]
    fn ready_ids_reports_only_ready_subscriptions() {
        let mut table = SubscriptionTable::default();
        let ready = table.insert_new("a", vec![], SubscriptionCallbacks::default());
        let _pending = table.insert_new("b", vec![], SubscriptionCallbacks::default());
        table.mark_ready(&ready);
        assert_eq!(table.ready_ids(), vec![ready]);
    }
}
