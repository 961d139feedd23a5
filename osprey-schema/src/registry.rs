// Protocol registry
//
// Two phases: descriptors are registered and amended while the registry is
// open, then `finalize()` validates cross references, builds the port tables
// and freezes the catalog. After that every method is a read.

use crate::{
    L4Protocol, ProtocolDescriptor, ProtocolId, ProtocolPair, RegistryError, RegistryResult,
    UNKNOWN_PROTOCOL,
};
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Upper bound on registered protocols (ids must fit in a `ProtocolId`)
pub const MAX_PROTOCOLS: usize = ProtocolId::MAX as usize;

const PORT_TABLE_SIZE: usize = u16::MAX as usize + 1;

/// Catalog of known protocols
#[derive(Debug, Clone)]
pub struct ProtocolRegistry {
    /// Indexed by protocol id
    protocols: Vec<ProtocolDescriptor>,
    names: AHashMap<String, ProtocolId>,
    /// Port -> protocol id, `UNKNOWN_PROTOCOL` when unmapped; empty until finalized
    tcp_ports: Vec<ProtocolId>,
    udp_ports: Vec<ProtocolId>,
    frozen: bool,
}

/// Registry summary for observability
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub protocols: usize,
    pub applications: usize,
    pub informative: usize,
    pub tcp_ports_mapped: usize,
    pub udp_ports_mapped: usize,
    pub host_patterns: usize,
    pub content_patterns: usize,
    pub finalized: bool,
}

impl ProtocolRegistry {
    /// Create an empty registry holding only `Unknown` (id 0)
    pub fn new() -> Self {
        let unknown = ProtocolDescriptor::new("Unknown");
        let mut names = AHashMap::new();
        names.insert(unknown.name.clone(), UNKNOWN_PROTOCOL);
        Self {
            protocols: vec![unknown],
            names,
            tcp_ports: Vec::new(),
            udp_ports: Vec::new(),
            frozen: false,
        }
    }

    /// Register a protocol and return its id
    pub fn register(&mut self, descriptor: ProtocolDescriptor) -> RegistryResult<ProtocolId> {
        if self.frozen {
            return Err(RegistryError::Frozen(descriptor.name));
        }
        if self.names.contains_key(&descriptor.name) {
            return Err(RegistryError::Duplicate(descriptor.name));
        }
        if self.protocols.len() >= MAX_PROTOCOLS {
            return Err(RegistryError::TooManyProtocols { max: MAX_PROTOCOLS });
        }

        let id = self.protocols.len() as ProtocolId;
        debug!(protocol = %descriptor.name, id, "Registered protocol");
        self.names.insert(descriptor.name.clone(), id);
        self.protocols.push(descriptor);
        Ok(id)
    }

    /// Modify an already registered descriptor before finalization
    pub fn amend<F>(&mut self, id: ProtocolId, f: F) -> RegistryResult<()>
    where
        F: FnOnce(&mut ProtocolDescriptor),
    {
        if self.frozen {
            let name = self
                .protocols
                .get(id as usize)
                .map(|d| d.name.clone())
                .unwrap_or_else(|| id.to_string());
            return Err(RegistryError::Frozen(name));
        }
        if id == UNKNOWN_PROTOCOL {
            return Err(RegistryError::Inconsistent(
                "the Unknown protocol cannot be amended".to_string(),
            ));
        }
        let descriptor = self
            .protocols
            .get_mut(id as usize)
            .ok_or_else(|| RegistryError::UnknownProtocol(id.to_string()))?;
        let name = descriptor.name.clone();
        f(descriptor);
        // Renaming would desync the name index
        descriptor.name = name;
        Ok(())
    }

    /// Validate the catalog, build port tables and lock registration
    ///
    /// Finalizing twice is a no-op. On error the registry stays open.
    pub fn finalize(&mut self) -> RegistryResult<()> {
        if self.frozen {
            return Ok(());
        }

        for (id, descriptor) in self.protocols.iter().enumerate() {
            if let Some(master) = descriptor.master {
                if master as usize == id {
                    return Err(RegistryError::Inconsistent(format!(
                        "{} lists itself as master",
                        descriptor.name
                    )));
                }
                if master == UNKNOWN_PROTOCOL || master as usize >= self.protocols.len() {
                    return Err(RegistryError::Inconsistent(format!(
                        "{} refers to missing master {}",
                        descriptor.name, master
                    )));
                }
            }
        }

        let tcp_ports = self.build_port_table(L4Protocol::Tcp)?;
        let udp_ports = self.build_port_table(L4Protocol::Udp)?;
        self.tcp_ports = tcp_ports;
        self.udp_ports = udp_ports;
        self.frozen = true;

        let stats = self.stats();
        info!(
            protocols = stats.protocols,
            tcp_ports = stats.tcp_ports_mapped,
            udp_ports = stats.udp_ports_mapped,
            "Protocol registry finalized"
        );
        Ok(())
    }

    fn build_port_table(&self, l4: L4Protocol) -> RegistryResult<Vec<ProtocolId>> {
        let mut table = vec![UNKNOWN_PROTOCOL; PORT_TABLE_SIZE];
        for (id, descriptor) in self.protocols.iter().enumerate() {
            for range in descriptor.ports(l4) {
                for port in range.start..=range.end {
                    let slot = &mut table[port as usize];
                    if *slot != UNKNOWN_PROTOCOL && *slot as usize != id {
                        return Err(RegistryError::Inconsistent(format!(
                            "{}/{} claimed by both {} and {}",
                            l4, port, self.protocols[*slot as usize].name, descriptor.name
                        )));
                    }
                    *slot = id as ProtocolId;
                }
            }
        }
        Ok(table)
    }

    pub fn is_finalized(&self) -> bool {
        self.frozen
    }

    /// Fail with `NotFinalized` unless the registry is frozen
    pub fn ensure_finalized(&self) -> RegistryResult<()> {
        if self.frozen {
            Ok(())
        } else {
            Err(RegistryError::NotFinalized)
        }
    }

    pub fn lookup_by_id(&self, id: ProtocolId) -> Option<&ProtocolDescriptor> {
        self.protocols.get(id as usize)
    }

    /// Exact, case-sensitive name lookup
    pub fn lookup_by_name(&self, name: &str) -> Option<ProtocolId> {
        self.names.get(name).copied()
    }

    pub fn contains(&self, id: ProtocolId) -> bool {
        (id as usize) < self.protocols.len()
    }

    /// Guess a protocol from its default ports, destination first
    pub fn guess_by_port(&self, l4: L4Protocol, src_port: u16, dst_port: u16) -> Option<ProtocolId> {
        let table = match l4 {
            L4Protocol::Tcp => &self.tcp_ports,
            L4Protocol::Udp => &self.udp_ports,
            _ => return None,
        };
        if table.is_empty() {
            return None;
        }
        [dst_port, src_port]
            .into_iter()
            .map(|port| table[port as usize])
            .find(|&id| id != UNKNOWN_PROTOCOL)
    }

    /// Whether `port` is one of the protocol's default ports
    pub fn is_default_port(&self, id: ProtocolId, l4: L4Protocol, port: u16) -> bool {
        self.lookup_by_id(id)
            .map(|d| d.ports(l4).iter().any(|r| r.contains(port)))
            .unwrap_or(false)
    }

    pub fn name(&self, id: ProtocolId) -> &str {
        self.lookup_by_id(id)
            .map(|d| d.name.as_str())
            .unwrap_or("Unknown")
    }

    /// Render a pair as `MASTER.APP`, or a single name when they coincide
    pub fn protocol_name(&self, pair: ProtocolPair) -> String {
        if pair.master == UNKNOWN_PROTOCOL || pair.master == pair.app {
            return self.name(pair.upper()).to_string();
        }
        if pair.app == UNKNOWN_PROTOCOL {
            return self.name(pair.master).to_string();
        }
        format!("{}.{}", self.name(pair.master), self.name(pair.app))
    }

    pub fn len(&self) -> usize {
        self.protocols.len()
    }

    /// Never true: `Unknown` is always present
    pub fn is_empty(&self) -> bool {
        self.protocols.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ProtocolId, &ProtocolDescriptor)> {
        self.protocols
            .iter()
            .enumerate()
            .map(|(id, d)| (id as ProtocolId, d))
    }

    pub fn stats(&self) -> RegistryStats {
        let mapped = |table: &[ProtocolId]| table.iter().filter(|&&id| id != UNKNOWN_PROTOCOL).count();
        RegistryStats {
            protocols: self.protocols.len(),
            applications: self.protocols.iter().filter(|d| d.master.is_some()).count(),
            informative: self.protocols.iter().filter(|d| d.is_informative).count(),
            tcp_ports_mapped: mapped(&self.tcp_ports),
            udp_ports_mapped: mapped(&self.udp_ports),
            host_patterns: self.protocols.iter().map(|d| d.host_patterns.len()).sum(),
            content_patterns: self.protocols.iter().map(|d| d.content_patterns.len()).sum(),
            finalized: self.frozen,
        }
    }
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Category, PortRange};

    fn sample() -> ProtocolRegistry {
        let mut registry = ProtocolRegistry::new();
        registry
            .register(
                ProtocolDescriptor::new("HTTP")
                    .with_category(Category::Web)
                    .with_tcp_ports(&[PortRange::single(80)]),
            )
            .unwrap();
        registry
            .register(
                ProtocolDescriptor::new("TLS")
                    .with_category(Category::Web)
                    .with_tcp_ports(&[PortRange::single(443)]),
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_unknown_is_reserved() {
        let registry = ProtocolRegistry::new();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup_by_name("Unknown"), Some(UNKNOWN_PROTOCOL));
        assert_eq!(registry.name(UNKNOWN_PROTOCOL), "Unknown");
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = sample();
        let http = registry.lookup_by_name("HTTP").unwrap();
        assert_eq!(http, 1);
        assert_eq!(registry.lookup_by_id(http).unwrap().category, Category::Web);
        assert!(registry.lookup_by_name("http").is_none());
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut registry = sample();
        let err = registry.register(ProtocolDescriptor::new("HTTP")).unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(name) if name == "HTTP"));
    }

    #[test]
    fn test_frozen_after_finalize() {
        let mut registry = sample();
        registry.finalize().unwrap();
        assert!(registry.is_finalized());

        let err = registry.register(ProtocolDescriptor::new("SSH")).unwrap_err();
        assert!(matches!(err, RegistryError::Frozen(_)));

        let err = registry.amend(1, |d| d.breed = crate::Breed::Dangerous).unwrap_err();
        assert!(matches!(err, RegistryError::Frozen(_)));

        // Idempotent
        registry.finalize().unwrap();
    }

    #[test]
    fn test_port_conflict_is_inconsistent() {
        let mut registry = sample();
        registry
            .register(ProtocolDescriptor::new("Alt").with_tcp_ports(&[PortRange::new(440, 450)]))
            .unwrap();
        let err = registry.finalize().unwrap_err();
        assert!(matches!(err, RegistryError::Inconsistent(_)));
        assert!(!registry.is_finalized());
    }

    #[test]
    fn test_missing_master_is_inconsistent() {
        let mut registry = sample();
        registry
            .register(ProtocolDescriptor::new("Orphan").with_master(42))
            .unwrap();
        assert!(matches!(
            registry.finalize(),
            Err(RegistryError::Inconsistent(_))
        ));
    }

    #[test]
    fn test_guess_by_port_prefers_destination() {
        let mut registry = sample();
        registry.finalize().unwrap();
        let tls = registry.lookup_by_name("TLS").unwrap();
        let http = registry.lookup_by_name("HTTP").unwrap();

        assert_eq!(registry.guess_by_port(L4Protocol::Tcp, 51000, 443), Some(tls));
        assert_eq!(registry.guess_by_port(L4Protocol::Tcp, 443, 51000), Some(tls));
        assert_eq!(registry.guess_by_port(L4Protocol::Tcp, 80, 443), Some(tls));
        assert_eq!(registry.guess_by_port(L4Protocol::Tcp, 443, 80), Some(http));
        assert_eq!(registry.guess_by_port(L4Protocol::Udp, 1, 443), None);
        assert_eq!(registry.guess_by_port(L4Protocol::Icmp, 0, 0), None);
    }

    #[test]
    fn test_guess_before_finalize_is_none() {
        let registry = sample();
        assert_eq!(registry.guess_by_port(L4Protocol::Tcp, 1, 80), None);
        assert!(matches!(
            registry.ensure_finalized(),
            Err(RegistryError::NotFinalized)
        ));
    }

    #[test]
    fn test_protocol_name_rendering() {
        let mut registry = sample();
        let app = registry.register(ProtocolDescriptor::new("Example")).unwrap();
        registry.finalize().unwrap();
        let tls = registry.lookup_by_name("TLS").unwrap();

        assert_eq!(registry.protocol_name(ProtocolPair::new(tls, app)), "TLS.Example");
        assert_eq!(registry.protocol_name(ProtocolPair::single(tls)), "TLS");
        assert_eq!(registry.protocol_name(ProtocolPair::new(tls, UNKNOWN_PROTOCOL)), "TLS");
        assert_eq!(registry.protocol_name(ProtocolPair::new(UNKNOWN_PROTOCOL, app)), "Example");
        assert_eq!(registry.protocol_name(ProtocolPair::UNKNOWN), "Unknown");
    }

    #[test]
    fn test_amend_keeps_name() {
        let mut registry = sample();
        registry
            .amend(1, |d| {
                d.name = "Renamed".to_string();
                d.tcp_ports.push(PortRange::single(8080));
            })
            .unwrap();
        let descriptor = registry.lookup_by_id(1).unwrap();
        assert_eq!(descriptor.name, "HTTP");
        assert_eq!(descriptor.tcp_ports.len(), 2);
    }

    #[test]
    fn test_stats() {
        let mut registry = sample();
        registry.finalize().unwrap();
        let stats = registry.stats();
        assert_eq!(stats.protocols, 3);
        assert_eq!(stats.tcp_ports_mapped, 2);
        assert_eq!(stats.udp_ports_mapped, 0);
        assert!(stats.finalized);
    }
}
