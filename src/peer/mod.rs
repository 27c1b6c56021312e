pub mod connection;
pub mod engine;
pub mod ice;
pub mod state;
pub mod types;

pub use connection::{WebRtcEngine, WebRtcLink};
pub use engine::{LinkEvent, LinkEvents, LinkState, LocalMedia, PeerEngine, PeerLink, RemoteStream};
pub use state::{NegotiationState, PeerSlot, Role};
pub use types::{
    CandidateDirection, IceCandidate, IceServerKind, SdpKind, ServerConfig, SessionDescription,
    ViewerDocument, ViewerPatch, ViewerRecord,
};
