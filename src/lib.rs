pub mod config;
pub mod error;
pub mod events;
pub mod host;
pub mod logger;
pub mod peer;
pub mod registry;
pub mod session;
pub mod signaling;
pub mod store;
pub mod testing;
pub mod utils;
pub mod viewer;

pub use config::SignalConfig;
pub use error::{Result, SignalError};
pub use events::SessionEvent;
pub use host::{start_hosting, HostSession};
pub use peer::{LocalMedia, NegotiationState, PeerEngine, RemoteStream, WebRtcEngine};
pub use session::{Session, SessionId, ViewerId};
pub use signaling::SignalingChannel;
pub use store::MemoryChannel;
pub use viewer::{join_stream, ViewerSession};
