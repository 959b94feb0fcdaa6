// syncwire-client: client-side session manager for the syncwire protocol.
//
// A sans-io state machine over a single logical connection: named remote
// methods with optimistic local stubs, named server-maintained record sets,
// and a stream of document mutations merged deterministically with locally
// simulated writes. The transport, the reactive layer, and the document
// stores are all external collaborators behind traits.

pub mod connection;
pub mod error;
pub mod heartbeat;
pub mod methods;
mod overlay;
mod quiescence;
pub mod stores;
pub mod subscriptions;
pub mod transport;

pub use connection::{connect, ConnectOptions, Connection, MethodStub, StubInvocation};
pub use error::ConnectionError;
pub use methods::{MethodCallback, MethodOptions, MethodResult, ResultHook};
pub use stores::{Store, StoreUpdate};
pub use subscriptions::{SubscriptionCallbacks, SubscriptionHandle};
pub use transport::{
    DisconnectOptions, ReconnectOptions, Transport, TransportStatus,
};
