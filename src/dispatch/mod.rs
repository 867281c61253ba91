//! Message dispatch
//!
//! The router maps each decoded envelope to the handler registered for its
//! kind. Handlers publish events on the bus instead of calling the
//! transport, which keeps them testable without a running node.

pub mod events;
pub mod handlers;
pub mod router;

pub use events::{Event, EventBus, EventKind, SubscriptionId};
pub use handlers::register_default_handlers;
pub use router::{Handler, Router};
