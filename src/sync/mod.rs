pub mod protocol;
pub mod remote;
pub mod transport;

pub use protocol::{BroadcastHub, BroadcastMessage, Envelope, MessageKind};
pub use transport::BroadcastTransport;

// Cross-tab broadcast: an in-process hub of named channels, a per-tab
// transport handle over it, and a WebSocket bridge so hubs in different
// processes behave as one.
