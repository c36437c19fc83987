//! Peer connections and the factory that creates them

mod connection;
mod factory;

pub use connection::PeerConnection;
pub use factory::WebRtcTransportFactory;
