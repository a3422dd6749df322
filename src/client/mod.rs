//! Client-side bridge: the callback-hosting `EventCenterAdapter` and the
//! `EventRouter` that mirrors local subscriptions to the broker.

pub mod adapter;
pub mod router;

pub use adapter::{EventCenterAdapter, RemoteEventHandler};
pub use router::EventRouter;
