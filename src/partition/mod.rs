// Partitions are the unit of placement. Every tenant's activity stream is cut
// into numbered partitions, newer partitions getting higher IDs, and each
// partition is replicated onto one or more hosts. A replica is addressed by
// its coordinate: the tenant, the partition and the host holding the copy.
//
// Two independent tags describe a replica. The lifecycle state decides whether
// it can take part in reads at all, and the backing storage tier says where
// its data currently lives. A replica can be online on any tier.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod state;
pub mod topology;

/// An isolated namespace of activities and queries.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(pub String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

/// Monotonically assigned per tenant. Higher IDs hold newer activities.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct PartitionId(pub u64);

impl PartitionId {
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// A fleet member, identified by its logical name and service port.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Host {
    pub name: String,
    pub port: u16,
}

impl Host {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.port)
    }
}

/// Uniquely addresses one replica of one partition.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PartitionCoord {
    pub tenant: TenantId,
    pub partition: PartitionId,
    pub host: Host,
}

impl PartitionCoord {
    pub fn new(tenant: TenantId, partition: PartitionId, host: Host) -> Self {
        Self {
            tenant,
            partition,
            host,
        }
    }
}

impl fmt::Display for PartitionCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.tenant, self.partition, self.host)
    }
}

/// Lifecycle of a partition replica.
///
/// Only `Online` replicas answer reads. `Bootstrap` and `Rebuilding` replicas
/// accept writes. `Removed` is terminal: resuming requires a fresh partition
/// ID.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionState {
    Bootstrap,
    Rebuilding,
    Online,
    Offline,
    Removed,
}

impl PartitionState {
    /// Whether a replica in this state may take part in reads.
    pub fn is_readable(&self) -> bool {
        matches!(self, PartitionState::Online)
    }

    /// Whether a replica in this state accepts new activities.
    pub fn is_writable(&self) -> bool {
        matches!(
            self,
            PartitionState::Bootstrap
                | PartitionState::Rebuilding
                | PartitionState::Online
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PartitionState::Removed)
    }
}

impl fmt::Display for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PartitionState::Bootstrap => "bootstrap",
            PartitionState::Rebuilding => "rebuilding",
            PartitionState::Online => "online",
            PartitionState::Offline => "offline",
            PartitionState::Removed => "removed",
        };
        f.write_str(name)
    }
}

/// The medium a partition's data currently resides on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackingStorage {
    #[default]
    Unknown,
    Memory,
    MemMapped,
    Disk,
    Hybrid,
}

impl fmt::Display for BackingStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackingStorage::Unknown => "unknown",
            BackingStorage::Memory => "memory",
            BackingStorage::MemMapped => "mem-mapped",
            BackingStorage::Disk => "disk",
            BackingStorage::Hybrid => "hybrid",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_online_is_readable() {
        assert!(PartitionState::Online.is_readable());
        for state in [
            PartitionState::Bootstrap,
            PartitionState::Rebuilding,
            PartitionState::Offline,
            PartitionState::Removed,
        ] {
            assert!(!state.is_readable(), "{state} should not be readable");
        }
    }

    #[test]
    fn warming_states_accept_writes() {
        assert!(PartitionState::Bootstrap.is_writable());
        assert!(PartitionState::Rebuilding.is_writable());
        assert!(!PartitionState::Removed.is_writable());
    }

    #[test]
    fn coord_display() {
        let coord = PartitionCoord::new(
            TenantId::from("acme"),
            PartitionId(7),
            Host::new("10.0.0.1", 1175),
        );
        assert_eq!(coord.to_string(), "acme/p7@10.0.0.1:1175");
    }

    #[test]
    fn storage_names_round_trip_through_serde() {
        #[derive(Deserialize)]
        struct Wrapper {
            tier: BackingStorage,
        }
        let parsed: Wrapper = toml::from_str("tier = \"mem-mapped\"").unwrap();
        assert_eq!(parsed.tier, BackingStorage::MemMapped);
        assert_eq!(parsed.tier.to_string(), "mem-mapped");
    }
}
