// Connection: the session state machine.
//
// Owns every component and drives all protocol state transitions. The
// embedder feeds transport events into `on_reset` / `on_message` /
// `on_disconnect` and clock ticks into `tick`; everything else happens
// through the public call/subscribe/register surface. All handlers run on
// one logical thread; nothing here is re-entrant except the `on_reconnect`
// hook, which is deliberately handed the connection back.

use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, error, warn};
use uuid::Uuid;

use syncwire_common::protocol::{ClientMessage, ServerMessage, SUPPORTED_PROTOCOL_VERSIONS};
use syncwire_common::types::{MethodError, MethodId, SubId};

use crate::error::ConnectionError;
use crate::heartbeat::{Heartbeat, HeartbeatAction};
use crate::methods::{
    MethodCallback, MethodInvocation, MethodOptions, MethodResult, OutstandingBlocks,
};
use crate::overlay::DocumentOverlay;
use crate::quiescence::{DeferredAction, QuiescenceState};
use crate::stores::{Store, StoreRegistry, StoreUpdate};
use crate::subscriptions::{SubscriptionCallbacks, SubscriptionHandle, SubscriptionTable};
use crate::transport::{
    validate_endpoint_url, DisconnectOptions, ReconnectOptions, Transport, TransportStatus,
};

/// A method stub: simulates the method's effect locally, synchronously,
/// before the server's authoritative answer arrives.
pub type MethodStub<T> =
    Rc<dyn Fn(&mut Connection<T>, &mut StubInvocation, &[Value]) -> MethodResult>;

/// Context handed to a running stub.
pub struct StubInvocation {
    seed: Option<String>,
}

impl StubInvocation {
    fn new() -> Self {
        Self { seed: None }
    }

    /// Stubs always run as simulations on this side of the wire.
    pub fn is_simulation(&self) -> bool {
        true
    }

    /// Seed for deterministic id generation, shared with the server. Only
    /// generated (and only sent) if the stub actually asks for it.
    pub fn random_seed(&mut self) -> String {
        if let Some(seed) = &self.seed {
            return seed.clone();
        }
        let seed = Uuid::new_v4().simple().to_string();
        self.seed = Some(seed.clone());
        seed
    }

    fn into_seed(self) -> Option<String> {
        self.seed
    }
}

/// Options accepted when building a connection.
pub struct ConnectOptions {
    /// How long the link may sit idle before we probe it.
    pub heartbeat_interval: Duration,
    /// How long a probe may go unanswered before the stream is declared dead.
    pub heartbeat_timeout: Duration,
    pub respond_to_pings: bool,
    /// Consumed by the transport adapter's retry policy, not by the session
    /// core.
    pub retry: bool,
    /// Allow a code migration while methods are still in flight.
    pub reload_with_outstanding: bool,
    /// Protocol revisions to offer, preferred first.
    pub supported_protocol_versions: Vec<String>,
    pub on_connected: Option<Box<dyn FnMut()>>,
    pub on_version_negotiation_failure: Option<Box<dyn FnMut(&str)>>,
    /// Fired when a parked migration request becomes serviceable.
    pub on_migration_ready: Option<Box<dyn FnMut()>>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(17_500),
            heartbeat_timeout: Duration::from_millis(15_000),
            respond_to_pings: true,
            retry: true,
            reload_with_outstanding: false,
            supported_protocol_versions: SUPPORTED_PROTOCOL_VERSIONS
                .iter()
                .map(|v| v.to_string())
                .collect(),
            on_connected: None,
            on_version_negotiation_failure: None,
            on_migration_ready: None,
        }
    }
}

/// Validate the endpoint and build a connection over the given transport.
pub fn connect<T: Transport>(
    url: &str,
    transport: T,
    options: ConnectOptions,
) -> Result<Connection<T>, ConnectionError> {
    validate_endpoint_url(url)?;
    Ok(Connection::new(transport, options))
}

pub struct Connection<T: Transport> {
    transport: T,

    // Session negotiation.
    last_session_id: Option<String>,
    version_suggestion: Option<String>,
    version: Option<String>,
    supported_versions: Vec<String>,

    // Components.
    stores: StoreRegistry,
    subs: SubscriptionTable,
    overlay: DocumentOverlay,
    quiescence: QuiescenceState,
    heartbeat: Option<Heartbeat>,

    // Method pipeline.
    stubs: HashMap<String, MethodStub<T>>,
    next_method_seq: u64,
    invokers: HashMap<MethodId, MethodInvocation>,
    blocks: OutstandingBlocks,
    simulation_depth: u32,

    // Options and callbacks.
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    respond_to_pings: bool,
    reload_with_outstanding: bool,
    on_connected: Option<Box<dyn FnMut()>>,
    on_version_negotiation_failure: Option<Box<dyn FnMut(&str)>>,
    on_migration_ready: Option<Box<dyn FnMut()>>,
    /// Called on every reconnect before outstanding methods are resent.
    /// Invocations made from inside the hook are spliced ahead of the
    /// previously outstanding first block.
    pub on_reconnect: Option<Box<dyn FnMut(&mut Connection<T>)>>,

    // User identity, with an epoch for external reactive layers.
    user_id: Option<String>,
    user_id_epoch: u64,

    migration_pending: bool,
}

impl<T: Transport> Connection<T> {
    pub fn new(transport: T, options: ConnectOptions) -> Self {
        let ConnectOptions {
            heartbeat_interval,
            heartbeat_timeout,
            respond_to_pings,
            retry: _,
            reload_with_outstanding,
            supported_protocol_versions,
            on_connected,
            on_version_negotiation_failure,
            on_migration_ready,
        } = options;

        let supported_versions = if supported_protocol_versions.is_empty() {
            SUPPORTED_PROTOCOL_VERSIONS.iter().map(|v| v.to_string()).collect()
        } else {
            supported_protocol_versions
        };

        Self {
            transport,
            last_session_id: None,
            version_suggestion: None,
            version: None,
            supported_versions,
            stores: StoreRegistry::new(),
            subs: SubscriptionTable::default(),
            overlay: DocumentOverlay::default(),
            quiescence: QuiescenceState::default(),
            heartbeat: None,
            stubs: HashMap::new(),
            next_method_seq: 1,
            invokers: HashMap::new(),
            blocks: OutstandingBlocks::default(),
            simulation_depth: 0,
            heartbeat_interval,
            heartbeat_timeout,
            respond_to_pings,
            reload_with_outstanding,
            on_connected,
            on_version_negotiation_failure,
            on_migration_ready,
            on_reconnect: None,
            user_id: None,
            user_id_epoch: 0,
            migration_pending: false,
        }
    }

    // ── Transport events ────────────────────────────────────────────

    /// The transport (re)established its stream. This fires on the very
    /// first connection too, so it is the only place the handshake is sent.
    pub fn on_reset(&mut self) {
        let version = match &self.version_suggestion {
            Some(version) => version.clone(),
            None => self
                .supported_versions
                .first()
                .cloned()
                .unwrap_or_else(|| "1".to_string()),
        };
        self.version_suggestion = Some(version.clone());
        self.send_message(&ClientMessage::Connect {
            session: self.last_session_id.clone(),
            version,
            support: self.supported_versions.clone(),
        });

        // Blast out pending methods and subscriptions before the round trip
        // confirms the session: they are idempotent, and either direction
        // may have lost messages while we were gone.
        self.blocks.discard_empty_first_block();
        for invocation in self.invokers.values_mut() {
            invocation.sent_message = false;
        }

        if self.on_reconnect.is_some() {
            self.call_on_reconnect_and_send();
        } else {
            self.send_outstanding_methods();
        }

        // Subscriptions go last so they take effect after the reconnect
        // hook's methods (auth, typically) have been sent.
        let sub_messages: Vec<ClientMessage> = self
            .subs
            .iter()
            .map(|sub| ClientMessage::Sub {
                id: sub.id.clone(),
                name: sub.name.clone(),
                params: sub.params.clone(),
            })
            .collect();
        for message in &sub_messages {
            self.send_message(message);
        }
    }

    /// The transport lost its stream. It will retry by itself; we only
    /// silence the heartbeat until the next reset.
    pub fn on_disconnect(&mut self) {
        self.heartbeat = None;
    }

    /// One raw inbound message. Malformed input is logged and discarded;
    /// an error return means the overlay detected a client/server
    /// desynchronization.
    pub fn on_message(&mut self, raw: &str) -> Result<(), ConnectionError> {
        let message = match ServerMessage::parse(raw) {
            Ok(message) => message,
            Err(parse_error) => {
                warn!(%parse_error, "discarding malformed inbound message");
                return Ok(());
            }
        };

        // Any inbound traffic proves the link is alive.
        if let Some(heartbeat) = self.heartbeat.as_mut() {
            heartbeat.note_message();
        }

        match message {
            ServerMessage::Connected { session } => self.handle_connected(session),
            ServerMessage::Failed { version } => {
                self.handle_failed(&version);
                Ok(())
            }
            ServerMessage::Ping { id } => {
                if self.respond_to_pings {
                    self.send_message(&ClientMessage::Pong { id });
                }
                Ok(())
            }
            ServerMessage::Pong { .. } => Ok(()),
            ServerMessage::Nosub { id, error } => self.handle_nosub(id, error),
            ServerMessage::Result { id, result, error } => self.handle_result(id, result, error),
            ServerMessage::Error { reason, offending_message } => {
                warn!(%reason, ?offending_message, "server reported a protocol error");
                Ok(())
            }
            data @ (ServerMessage::Added { .. }
            | ServerMessage::Changed { .. }
            | ServerMessage::Removed { .. }
            | ServerMessage::Ready { .. }
            | ServerMessage::Updated { .. }) => self.handle_data_message(data),
        }
    }

    /// Clock tick for the heartbeat. Call at a sub-second cadence.
    pub fn tick(&mut self, now: DateTime<Utc>) {
        let Some(heartbeat) = self.heartbeat.as_mut() else {
            return;
        };
        match heartbeat.tick(now) {
            Some(HeartbeatAction::SendPing) => {
                self.send_message(&ClientMessage::Ping { id: None });
            }
            Some(HeartbeatAction::TimedOut) => {
                warn!("heartbeat timed out; forcing a reconnect");
                self.heartbeat = None;
                self.transport.reconnect(ReconnectOptions { force: true });
            }
            None => {}
        }
    }

    // ── Session negotiation ─────────────────────────────────────────

    fn handle_connected(&mut self, session: String) -> Result<(), ConnectionError> {
        // The proposed version is now the negotiated version for the life
        // of the session.
        self.version = self.version_suggestion.clone();
        if let Some(on_connected) = self.on_connected.as_mut() {
            on_connected();
        }
        self.restart_heartbeat();

        let had_session = self.last_session_id.is_some();
        let resumed_previous_session = self.last_session_id.as_deref() == Some(session.as_str());
        if had_session {
            // Any connection after the first requires a full resync.
            self.quiescence.mark_reset_needed();
        }
        self.last_session_id = Some(session);

        if resumed_previous_session {
            // Never happens today: the protocol gives the server no way to
            // know which messages the client has processed.
            return Ok(());
        }

        // Fresh session. Whatever we buffered for unregistered stores is
        // stale; it will be resent if still relevant.
        self.stores.clear_pending_unknown();

        let resetting = self.quiescence.reset_pending();
        if resetting {
            // Stub bookkeeping is moot: every collection is about to be
            // rebuilt from scratch.
            self.overlay.clear();
        }
        self.quiescence.clear_deferred();

        // Subscriptions that already delivered must deliver again before
        // buffered data is applied, or the user would see a flicker to the
        // empty state.
        self.quiescence.begin_revival(self.subs.ready_ids());

        self.quiescence.clear_blocking();
        if resetting {
            for (id, invocation) in self.invokers.iter() {
                if invocation.has_result() {
                    // Result arrived over the old connection, but its data
                    // never became visible and the method was not resent.
                    // The post-reconnect quiescence point is the closest
                    // substitute for "data is visible".
                    self.quiescence.push_deferred(DeferredAction::MethodDataVisible(id.clone()));
                } else if invocation.sent_message {
                    // Resent on this connection; hold quiescence until its
                    // data-done arrives.
                    self.quiescence.block_on_method(id.clone());
                }
            }
        }

        self.quiescence.clear_buffered();

        if !self.quiescence.waiting() {
            if self.quiescence.take_reset_flag() {
                self.stores.reset_all();
            }
            self.run_deferred_actions()?;
        }
        Ok(())
    }

    fn handle_failed(&mut self, version: &str) {
        if self.supported_versions.iter().any(|v| v == version) {
            self.version_suggestion = Some(version.to_string());
            self.transport.reconnect(ReconnectOptions { force: true });
        } else {
            let description =
                format!("version negotiation failed; server requested version {version}");
            self.transport.disconnect(DisconnectOptions { permanent: true });
            if let Some(on_failure) = self.on_version_negotiation_failure.as_mut() {
                on_failure(&description);
            }
        }
    }

    fn restart_heartbeat(&mut self) {
        self.heartbeat = None;
        if self.version.as_deref() != Some("pre1") && !self.heartbeat_interval.is_zero() {
            self.heartbeat = Some(Heartbeat::new(self.heartbeat_interval, self.heartbeat_timeout));
        }
    }

    // ── Method invocation ───────────────────────────────────────────

    /// Register a stub to simulate `name` locally. One stub per name.
    pub fn register_stub(
        &mut self,
        name: impl Into<String>,
        stub: impl Fn(&mut Connection<T>, &mut StubInvocation, &[Value]) -> MethodResult + 'static,
    ) -> Result<(), ConnectionError> {
        let name = name.into();
        if self.stubs.contains_key(&name) {
            return Err(ConnectionError::DuplicateStub(name));
        }
        self.stubs.insert(name, Rc::new(stub));
        Ok(())
    }

    /// Invoke a remote method with default options.
    pub fn call(
        &mut self,
        name: &str,
        args: Vec<Value>,
        callback: Option<MethodCallback>,
    ) -> Result<Option<Value>, MethodError> {
        self.apply(name, args, MethodOptions::default(), callback)
    }

    /// Invoke a remote method.
    ///
    /// Runs the stub (if any) synchronously, queues the invocation, and
    /// sends it as soon as its block reaches the front of the queue. The
    /// callback fires exactly once, after the server's result has arrived
    /// AND every document the stub wrote has been flushed to its
    /// authoritative value. Without a callback, an error outcome is logged
    /// and discarded.
    ///
    /// A call made from inside a running stub is itself a simulation: no
    /// message is sent and the stub outcome is returned directly. That is
    /// the one case where stub output, not server output, is authoritative.
    pub fn apply(
        &mut self,
        name: &str,
        args: Vec<Value>,
        options: MethodOptions,
        callback: Option<MethodCallback>,
    ) -> Result<Option<Value>, MethodError> {
        let stub = self.stubs.get(name).cloned();

        if self.simulation_depth > 0 {
            let outcome = match stub {
                Some(stub) => self.run_stub(&stub, &args).0,
                None => Ok(Value::Null),
            };
            return match callback {
                Some(callback) => {
                    callback(outcome);
                    Ok(None)
                }
                None => outcome.map(Some),
            };
        }

        let method_id = self.allocate_method_id();
        let mut random_seed = None;
        let mut stub_outcome = None;
        if let Some(stub) = stub {
            // The stub must finish before the message is built, so the
            // overlay has the complete set of documents it wrote.
            self.stores.save_originals_all();
            let (outcome, seed) = self.run_stub(&stub, &args);
            let originals = self.stores.retrieve_originals_all();
            self.overlay.record_stub_writes(&method_id, originals);
            random_seed = seed;
            stub_outcome = Some(outcome);
        }

        if let Some(Err(stub_error)) = &stub_outcome {
            // The server's outcome wins; the simulation failure is only a
            // diagnostic.
            if !stub_error.expected {
                debug!(method = name, %stub_error, "exception while simulating method");
            }
        }

        let stub_value = match stub_outcome {
            Some(Ok(value)) if options.return_stub_value => Some(value),
            _ => None,
        };

        let message = ClientMessage::Method {
            method: name.to_string(),
            params: args,
            id: method_id.clone(),
            random_seed,
        };
        self.invokers.insert(
            method_id.clone(),
            MethodInvocation::new(
                method_id.clone(),
                message,
                options.wait,
                callback,
                options.on_result_received,
            ),
        );

        if self.blocks.enqueue(method_id.clone(), options.wait) {
            self.send_method_message(&method_id);
        }
        Ok(stub_value)
    }

    fn allocate_method_id(&mut self) -> MethodId {
        let id = MethodId::from_seq(self.next_method_seq);
        self.next_method_seq += 1;
        id
    }

    fn run_stub(&mut self, stub: &MethodStub<T>, args: &[Value]) -> (MethodResult, Option<String>) {
        let mut invocation = StubInvocation::new();
        self.simulation_depth += 1;
        let outcome = stub(self, &mut invocation, args);
        self.simulation_depth -= 1;
        (outcome, invocation.into_seed())
    }

    /// Send (or resend) one queued method message.
    fn send_method_message(&mut self, id: &MethodId) {
        let Some(invocation) = self.invokers.get_mut(id) else {
            error!(method_id = %id, "no invocation for queued method");
            return;
        };
        if invocation.has_result() {
            error!(method_id = %id, "refusing to resend a method that already has a result");
            return;
        }
        // On a resend it no longer matters whether data was visible before.
        invocation.data_visible = false;
        invocation.sent_message = true;
        let wait = invocation.wait;
        let message = invocation.message.clone();
        if wait {
            // A wait method buffers all data until its data-done arrives.
            self.quiescence.block_on_method(id.clone());
        }
        self.send_message(&message);
    }

    fn send_outstanding_methods(&mut self) {
        let ids: Vec<MethodId> = self.blocks.first_block_ids().to_vec();
        for id in &ids {
            self.send_method_message(id);
        }
    }

    fn handle_result(
        &mut self,
        id: MethodId,
        result: Option<Value>,
        error: Option<MethodError>,
    ) -> Result<(), ConnectionError> {
        if self.blocks.is_empty() {
            debug!(method_id = %id, "received a method result with no methods outstanding");
            return Ok(());
        }
        if !self.blocks.remove_from_first(&id) {
            debug!(method_id = %id, "cannot match method result to an outstanding method");
            return Ok(());
        }

        let outcome = match error {
            Some(method_error) => Err(method_error),
            None => Ok(result.unwrap_or(Value::Null)),
        };
        match self.invokers.get_mut(&id) {
            Some(invocation) => invocation.receive_result(outcome)?,
            None => return Err(ConnectionError::UnknownMethod(id)),
        }
        self.maybe_complete_method(&id)
    }

    /// Retire the invocation and fire its callback once both halves of
    /// completion (result, data visibility) are in.
    fn maybe_complete_method(&mut self, id: &MethodId) -> Result<(), ConnectionError> {
        let complete = self.invokers.get(id).is_some_and(MethodInvocation::is_complete);
        if !complete {
            return Ok(());
        }
        if let Some(mut invocation) = self.invokers.remove(id) {
            match invocation.take_completion() {
                (Some(callback), Some(outcome)) => callback(outcome),
                (None, Some(Err(discarded))) => {
                    debug!(method_id = %id, %discarded, "discarding method error; caller gave no callback");
                }
                _ => {}
            }
        }
        self.outstanding_method_finished()
    }

    /// After each retirement: once no sent method remains un-delivered, the
    /// first block is done. Drop it, send the next one, and see whether a
    /// parked migration can go ahead.
    fn outstanding_method_finished(&mut self) -> Result<(), ConnectionError> {
        if self.any_methods_outstanding() {
            return Ok(());
        }

        // The first block may be absent entirely when a method half-finished
        // across a reconnect.
        if let Some(first) = self.blocks.pop_first() {
            if !first.method_ids.is_empty() {
                return Err(ConnectionError::NonEmptyRetiredBlock);
            }
            self.send_outstanding_methods();
        }

        self.maybe_migrate();
        Ok(())
    }

    fn any_methods_outstanding(&self) -> bool {
        self.invokers.values().any(|invocation| invocation.sent_message)
    }

    fn call_on_reconnect_and_send(&mut self) {
        let old_blocks = self.blocks.take_all();
        if let Some(mut hook) = self.on_reconnect.take() {
            hook(self);
            // The hook may have installed a replacement; keep the newest.
            if self.on_reconnect.is_none() {
                self.on_reconnect = Some(hook);
            }
        }
        let to_send = self.blocks.merge_after_reconnect(old_blocks);
        for id in &to_send {
            self.send_method_message(id);
        }
    }

    // ── Data message handling ───────────────────────────────────────

    fn handle_data_message(&mut self, message: ServerMessage) -> Result<(), ConnectionError> {
        if self.quiescence.waiting() {
            self.quiescence.note_message_effects(&message);
            self.quiescence.buffer(message);
            if self.quiescence.waiting() {
                return Ok(());
            }
            // The last blocking condition just cleared: apply everything
            // buffered as one atomic batch.
            return self.finish_quiescence();
        }

        let mut updates = BTreeMap::new();
        self.process_data_message(message, &mut updates)?;
        self.apply_updates_and_run_deferred(updates)
    }

    fn finish_quiescence(&mut self) -> Result<(), ConnectionError> {
        let mut updates = BTreeMap::new();
        for message in self.quiescence.take_buffered() {
            self.process_data_message(message, &mut updates)?;
        }
        self.apply_updates_and_run_deferred(updates)
    }

    fn apply_updates_and_run_deferred(
        &mut self,
        updates: BTreeMap<String, Vec<StoreUpdate>>,
    ) -> Result<(), ConnectionError> {
        let reset = self.quiescence.take_reset_flag();
        if reset || !updates.is_empty() {
            self.stores.apply_updates(updates, reset);
        }
        self.run_deferred_actions()
    }

    fn process_data_message(
        &mut self,
        message: ServerMessage,
        updates: &mut BTreeMap<String, Vec<StoreUpdate>>,
    ) -> Result<(), ConnectionError> {
        match message {
            ServerMessage::Added { collection, id, fields } => {
                if let Some(fields) = self.overlay.absorb_added(&collection, &id, fields)? {
                    push_update(updates, collection, StoreUpdate::Added { id, fields });
                }
            }
            ServerMessage::Changed { collection, id, fields, cleared } => {
                if let Some((fields, cleared)) =
                    self.overlay.absorb_changed(&collection, &id, fields, cleared)?
                {
                    push_update(updates, collection, StoreUpdate::Changed { id, fields, cleared });
                }
            }
            ServerMessage::Removed { collection, id } => {
                if !self.overlay.absorb_removed(&collection, &id)? {
                    push_update(updates, collection, StoreUpdate::Removed { id });
                }
            }
            ServerMessage::Ready { subs } => {
                // Readiness takes effect only after every currently overlaid
                // document has flushed, so a sub never looks ready while
                // optimistic values still mask its data.
                for sub_id in subs {
                    let invokers = &self.invokers;
                    if let Some(action) = self.overlay.schedule_after_flush(
                        DeferredAction::SubscriptionReady(sub_id),
                        |method_id| {
                            invokers.get(method_id).is_some_and(|m| m.sent_message)
                        },
                    ) {
                        self.quiescence.push_deferred(action);
                    }
                }
            }
            ServerMessage::Updated { methods } => {
                for method_id in methods {
                    let outcome = self.overlay.method_data_done(&method_id)?;
                    for (key, document) in outcome.replaces {
                        push_update(
                            updates,
                            key.collection,
                            StoreUpdate::Replace { id: key.id, document },
                        );
                    }
                    for action in outcome.matured {
                        self.quiescence.push_deferred(action);
                    }

                    if !self.invokers.contains_key(&method_id) {
                        return Err(ConnectionError::UnknownMethod(method_id));
                    }
                    let invokers = &self.invokers;
                    if let Some(action) = self.overlay.schedule_after_flush(
                        DeferredAction::MethodDataVisible(method_id.clone()),
                        |id| invokers.get(id).is_some_and(|m| m.sent_message),
                    ) {
                        self.quiescence.push_deferred(action);
                    }
                }
            }
            other => {
                debug!(?other, "non-data message routed to the data handler");
            }
        }
        Ok(())
    }

    /// Run the actions deferred to "after this update": data-visible
    /// notifications and subscription readiness. Runs a snapshot; actions
    /// queued while running wait for the next cycle.
    fn run_deferred_actions(&mut self) -> Result<(), ConnectionError> {
        for action in self.quiescence.take_deferred() {
            match action {
                DeferredAction::MethodDataVisible(id) => {
                    if let Some(invocation) = self.invokers.get_mut(&id) {
                        invocation.data_visible = true;
                    } else {
                        debug!(method_id = %id, "data-visible for an already retired method");
                    }
                    self.maybe_complete_method(&id)?;
                }
                DeferredAction::SubscriptionReady(id) => {
                    if let Some(ready_callback) = self.subs.mark_ready(&id) {
                        ready_callback();
                    }
                }
            }
        }
        Ok(())
    }

    // ── Subscriptions ───────────────────────────────────────────────

    /// Subscribe to a named record set. Reclaims an identical inactive
    /// subscription instead of issuing a redundant `sub` message.
    pub fn subscribe(
        &mut self,
        name: &str,
        params: Vec<Value>,
        callbacks: SubscriptionCallbacks,
    ) -> SubscriptionHandle {
        if let Some(id) = self.subs.find_reusable(name, &params) {
            self.subs.reactivate(&id, callbacks);
            return SubscriptionHandle { id };
        }
        let id = self.subs.insert_new(name, params.clone(), callbacks);
        self.send_message(&ClientMessage::Sub {
            id: id.clone(),
            name: name.to_string(),
            params,
        });
        SubscriptionHandle { id }
    }

    pub fn stop_subscription(&mut self, handle: &SubscriptionHandle) {
        self.stop_subscription_by_id(&handle.id);
    }

    fn stop_subscription_by_id(&mut self, id: &SubId) {
        let Some(sub) = self.subs.remove(id) else {
            return;
        };
        self.send_message(&ClientMessage::Unsub { id: id.clone() });
        if let Some(on_stop) = sub.callbacks.on_stop {
            on_stop(None);
        }
    }

    pub fn subscription_ready(&self, handle: &SubscriptionHandle) -> bool {
        self.subs.is_ready(&handle.id)
    }

    /// Mark a subscription reclaimable by an imminent re-subscribe. Pairs
    /// with `flush_inactive_subscriptions` to model a reactive rerun.
    pub fn invalidate_subscription(&mut self, handle: &SubscriptionHandle) {
        self.subs.invalidate(&handle.id);
    }

    /// Stop every subscription still inactive after a rerun finished.
    pub fn flush_inactive_subscriptions(&mut self) {
        for id in self.subs.inactive_ids() {
            self.stop_subscription_by_id(&id);
        }
    }

    /// Teardown helper: silently unsubscribe everything.
    pub fn unsubscribe_all(&mut self) {
        for id in self.subs.all_ids() {
            self.subs.remove(&id);
            self.send_message(&ClientMessage::Unsub { id });
        }
    }

    fn handle_nosub(
        &mut self,
        id: SubId,
        error: Option<MethodError>,
    ) -> Result<(), ConnectionError> {
        let was_waiting = self.quiescence.waiting();
        // A sub that will never become ready again must not block revival.
        self.quiescence.note_sub_gone(&id);

        if let Some(sub) = self.subs.remove(&id) {
            let ready = sub.ready;
            let callbacks = sub.callbacks;
            match error {
                Some(termination) if !ready => {
                    if let Some(on_error) = callbacks.on_error {
                        on_error(termination);
                    } else if let Some(on_stop) = callbacks.on_stop {
                        on_stop(Some(termination));
                    }
                }
                Some(termination) => {
                    if let Some(on_stop) = callbacks.on_stop {
                        on_stop(Some(termination));
                    }
                }
                None => {
                    if let Some(on_stop) = callbacks.on_stop {
                        on_stop(None);
                    }
                }
            }
        }

        if was_waiting && !self.quiescence.waiting() {
            return self.finish_quiescence();
        }
        Ok(())
    }

    // ── Stores ──────────────────────────────────────────────────────

    /// Register the mutation sink for a collection. Returns false if the
    /// collection already has one.
    pub fn register_store(&mut self, name: impl Into<String>, store: Box<dyn Store>) -> bool {
        self.stores.register(name.into(), store)
    }

    // ── User identity ───────────────────────────────────────────────

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Bumped whenever the user id actually changes; an external reactive
    /// layer can depend on it.
    pub fn user_id_epoch(&self) -> u64 {
        self.user_id_epoch
    }

    pub fn set_user_id(&mut self, user_id: Option<String>) {
        if self.user_id == user_id {
            return;
        }
        self.user_id = user_id;
        self.user_id_epoch += 1;
    }

    // ── Migration gating ────────────────────────────────────────────

    /// Ask whether a code migration may proceed. When it cannot (methods
    /// are still in flight), the request is parked and `on_migration_ready`
    /// fires once the pipeline drains.
    pub fn request_migration(&mut self) -> bool {
        if self.reload_with_outstanding || self.ready_to_migrate() {
            return true;
        }
        if self.migration_pending {
            debug!("migration request already parked");
        }
        self.migration_pending = true;
        false
    }

    fn ready_to_migrate(&self) -> bool {
        self.invokers.is_empty()
    }

    fn maybe_migrate(&mut self) {
        if self.migration_pending && self.ready_to_migrate() {
            self.migration_pending = false;
            if let Some(on_ready) = self.on_migration_ready.as_mut() {
                on_ready();
            }
        }
    }

    // ── Passthrough and introspection ───────────────────────────────

    pub fn status(&self) -> TransportStatus {
        self.transport.status()
    }

    pub fn reconnect(&mut self) {
        self.transport.reconnect(ReconnectOptions::default());
    }

    pub fn disconnect(&mut self) {
        self.transport.disconnect(DisconnectOptions::default());
    }

    pub fn session_id(&self) -> Option<&str> {
        self.last_session_id.as_deref()
    }

    pub fn negotiated_version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    fn send_message(&mut self, message: &ClientMessage) {
        match message.to_wire() {
            Ok(text) => self.transport.send(text),
            Err(encode_error) => {
                warn!(%encode_error, "dropping outbound message that failed to encode");
            }
        }
    }
}

fn push_update(
    updates: &mut BTreeMap<String, Vec<StoreUpdate>>,
    collection: String,
    update: StoreUpdate,
) {
    updates.entry(collection).or_default().push(update);
}
