// lb-core: Messaging engine for the LAN bus.
//
// Leaves first: transports carry bytes, the peer table tracks membership,
// dedup suppresses replays, the pending tracker drives reliable retries.
// The bus engine at the top owns the publish and receive paths.

pub mod bus;
pub mod dedup;
pub mod discovery;
pub mod peers;
pub mod pending;
pub mod stream;
pub mod transport;

pub use bus::{Bus, BusConfig, QosConfig, ReliableConfig, SerializationConfig};
pub use discovery::{Announcement, Discovery, DiscoveryConfig, DiscoveryMode, PeerEvent};
pub use peers::{PeerRecord, PeerTable};
pub use pending::{DeadLetter, PendingEntry, PendingTracker, TrackerEvent};
pub use stream::{StreamConfig, StreamEvent, StreamTransport};
pub use transport::{Inbound, TransportError, UdpTransport};
