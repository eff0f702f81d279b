// lanbus: Facade crate for the LAN publish/subscribe bus.
//
// Re-exports the packet model and the engine so downstream code (and the
// integration suites) can reach the whole stack through one dependency.

pub use lb_codec as codec;
pub use lb_core::{
    Announcement, Bus, BusConfig, Discovery, DiscoveryConfig, DiscoveryMode, PeerEvent,
    PeerRecord, PeerTable, QosConfig, ReliableConfig, SerializationConfig, StreamConfig,
    StreamEvent, StreamTransport, UdpTransport,
};
