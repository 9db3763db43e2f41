// Everything between the director and a partition replica on another host:
// the frame format, the transport seam, the classifying reader on the caller's
// side and the service that answers on the host's side.

#[cfg(feature = "quic")]
pub mod endpoint;
pub mod error;
pub mod loopback;
pub mod reader;
pub mod service;
pub mod transport;
pub mod wire;

pub use error::TransportError;
pub use reader::{ReadError, RemotePartitionReader};
pub use transport::{Reply, ReplicaService, ReplicaTransport};
