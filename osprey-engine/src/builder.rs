// Detection module builder
//
// Everything that can be configured is collected here while the module is
// still mutable. `build()` finalizes the registry and compiles the
// automata and tries; the resulting module is read-only apart from its
// memo caches.

use crate::config::EngineConfig;
use crate::module::{cache_hasher, AddressEntry, BoundDissector, DetectionModule};
use crate::rules::{parse_rules, Rule};
use crate::{EngineError, EngineResult};
use ahash::AHashSet;
use ipnetwork::IpNetwork;
use osprey_ac_dfa::{AutomatonBuilder, MatchPattern};
use osprey_flow::{builtin_dissectors, DissectLimits, Dissector};
use osprey_lru::MemoCache;
use osprey_patricia::{PatriciaTree, Prefix};
use osprey_schema::{ProtocolDescriptor, ProtocolId, ProtocolRegistry};
use std::hash::{BuildHasher, Hash, Hasher};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Builder for [`DetectionModule`]
pub struct ModuleBuilder {
    config: EngineConfig,
    registry: ProtocolRegistry,
    dissectors: Vec<Box<dyn Dissector>>,
    ip_rules: Vec<(IpNetwork, Option<u16>, ProtocolId)>,
    risky_hosts: Vec<String>,
    malicious_fingerprints: AHashSet<String>,
    host_cache: Option<Arc<MemoCache>>,
    address_cache: Option<Arc<MemoCache>>,
}

impl ModuleBuilder {
    /// Start from the built-in catalog and dissectors
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            registry: ProtocolRegistry::with_builtin_protocols()?,
            dissectors: builtin_dissectors(),
            ip_rules: Vec::new(),
            risky_hosts: Vec::new(),
            malicious_fingerprints: AHashSet::new(),
            host_cache: None,
            address_cache: None,
        })
    }

    /// Replace the catalog with a caller-built registry
    ///
    /// Every dissector's protocol must still be present when building.
    pub fn with_registry(mut self, registry: ProtocolRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Drop the built-in dissectors
    pub fn without_dissectors(mut self) -> Self {
        self.dissectors.clear();
        self
    }

    pub fn with_dissector(mut self, dissector: Box<dyn Dissector>) -> Self {
        self.dissectors.push(dissector);
        self
    }

    pub fn register_protocol(&mut self, descriptor: ProtocolDescriptor) -> EngineResult<ProtocolId> {
        Ok(self.registry.register(descriptor)?)
    }

    /// Id of a protocol, registering a bare descriptor if the name is new
    pub fn protocol_id(&mut self, name: &str) -> EngineResult<ProtocolId> {
        match self.registry.lookup_by_name(name) {
            Some(id) => Ok(id),
            None => {
                debug!(protocol = name, "Registering custom protocol");
                self.register_protocol(ProtocolDescriptor::new(name))
            }
        }
    }

    /// Bind a hostname (domain suffix) to a protocol
    pub fn add_host(&mut self, pattern: &str, protocol: ProtocolId) -> EngineResult<()> {
        let pattern = pattern.trim().trim_end_matches('.').to_ascii_lowercase();
        if pattern.is_empty() {
            return Err(EngineError::Config("empty host pattern".to_string()));
        }
        self.registry.amend(protocol, |d| {
            if !d.host_patterns.contains(&pattern) {
                d.host_patterns.push(pattern);
            }
        })?;
        Ok(())
    }

    /// Bind a payload marker to a protocol
    pub fn add_content(&mut self, marker: &str, protocol: ProtocolId) -> EngineResult<()> {
        if marker.is_empty() {
            return Err(EngineError::Config("empty content marker".to_string()));
        }
        let marker = marker.to_string();
        self.registry.amend(protocol, |d| {
            if !d.content_patterns.contains(&marker) {
                d.content_patterns.push(marker);
            }
        })?;
        Ok(())
    }

    /// Bind an address range to a protocol
    ///
    /// With a port the match is authoritative and classifies the flow
    /// immediately.
    pub fn add_ip_rule(
        &mut self,
        network: IpNetwork,
        port: Option<u16>,
        protocol: ProtocolId,
    ) -> EngineResult<()> {
        if self.registry.lookup_by_id(protocol).is_none() {
            return Err(EngineError::Config(format!(
                "address rule for unregistered protocol {}",
                protocol
            )));
        }
        self.ip_rules.push((network, port, protocol));
        Ok(())
    }

    /// Flag flows whose server name is `pattern` or one of its subdomains
    pub fn add_risky_host(&mut self, pattern: &str) -> EngineResult<()> {
        let pattern = pattern.trim().trim_end_matches('.').to_ascii_lowercase();
        if pattern.is_empty() {
            return Err(EngineError::Config("empty risky host pattern".to_string()));
        }
        if !self.risky_hosts.contains(&pattern) {
            self.risky_hosts.push(pattern);
        }
        Ok(())
    }

    /// Flag TLS flows whose ClientHello has this JA3 text
    pub fn add_malicious_fingerprint(&mut self, ja3: &str) -> EngineResult<()> {
        let ja3 = ja3.trim();
        if ja3.is_empty() {
            return Err(EngineError::Config("empty fingerprint".to_string()));
        }
        self.malicious_fingerprints.insert(ja3.to_string());
        Ok(())
    }

    /// Apply parsed rules; returns how many were applied
    pub fn apply_rules(&mut self, rules: Vec<Rule>) -> EngineResult<usize> {
        let count = rules.len();
        for rule in rules {
            let id = match rule.protocol() {
                Some(name) => self.protocol_id(name)?,
                None => {
                    match rule {
                        Rule::RiskyHost { pattern } => self.add_risky_host(&pattern)?,
                        Rule::Fingerprint { value } => self.add_malicious_fingerprint(&value)?,
                        _ => {}
                    }
                    continue;
                }
            };
            match rule {
                Rule::Ports { tcp, udp, .. } => {
                    self.registry.amend(id, |d| {
                        d.tcp_ports.extend(tcp);
                        d.udp_ports.extend(udp);
                    })?;
                }
                Rule::Host { pattern, .. } => self.add_host(&pattern, id)?,
                Rule::Content { marker, .. } => self.add_content(&marker, id)?,
                Rule::Address { network, port, .. } => self.add_ip_rule(network, port, id)?,
                Rule::RiskyHost { .. } | Rule::Fingerprint { .. } => {}
            }
        }
        Ok(count)
    }

    pub fn load_rules_str(&mut self, text: &str) -> EngineResult<usize> {
        let rules = parse_rules(text)?;
        self.apply_rules(rules)
    }

    pub fn load_rules_file(&mut self, path: impl AsRef<Path>) -> EngineResult<usize> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let count = self.load_rules_str(&text)?;
        info!(path = %path.display(), rules = count, "Loaded protocol rules");
        Ok(count)
    }

    /// Reuse a hostname cache owned by the caller
    pub fn with_shared_host_cache(mut self, cache: Arc<MemoCache>) -> EngineResult<Self> {
        check_shared(&cache, "host")?;
        self.host_cache = Some(cache);
        Ok(self)
    }

    /// Reuse an address cache owned by the caller
    pub fn with_shared_address_cache(mut self, cache: Arc<MemoCache>) -> EngineResult<Self> {
        check_shared(&cache, "address")?;
        self.address_cache = Some(cache);
        Ok(self)
    }

    /// Finalize everything into a read-only module
    pub fn build(self) -> EngineResult<DetectionModule> {
        let Self {
            config,
            mut registry,
            dissectors,
            ip_rules,
            risky_hosts,
            malicious_fingerprints,
            host_cache,
            address_cache,
        } = self;

        registry.finalize()?;

        let mut bound = Vec::with_capacity(dissectors.len());
        for dissector in dissectors {
            let protocol = registry.lookup_by_name(dissector.protocol()).ok_or_else(|| {
                EngineError::Config(format!(
                    "dissector '{}' refers to unknown protocol '{}'",
                    dissector.name(),
                    dissector.protocol()
                ))
            })?;
            let descriptor_mask = registry
                .lookup_by_id(protocol)
                .map(|d| d.detection)
                .unwrap_or_default();
            let mask = dissector.selection() & descriptor_mask;
            bound.push(BoundDissector {
                dissector,
                protocol,
                mask,
            });
        }

        let mut host_patterns = Vec::new();
        let mut content_patterns = Vec::new();
        for (id, descriptor) in registry.iter() {
            for host in &descriptor.host_patterns {
                host_patterns.push(MatchPattern::domain(host.to_ascii_lowercase(), id as u32)?);
            }
            for marker in &descriptor.content_patterns {
                content_patterns.push(MatchPattern::contains(marker.as_bytes(), id as u32)?);
            }
        }
        let hosts = AutomatonBuilder::new("hosts")
            .config(config.automaton.clone())
            .add_patterns(host_patterns)
            .build()?;
        let content = AutomatonBuilder::new("content")
            .config(config.automaton.clone())
            .add_patterns(content_patterns)
            .build()?;

        let risky_patterns = risky_hosts
            .iter()
            .map(|host| MatchPattern::domain(host.as_bytes(), 0))
            .collect::<Result<Vec<_>, _>>()?;
        let risky = AutomatonBuilder::new("risky hosts")
            .config(config.automaton.clone())
            .add_patterns(risky_patterns)
            .build()?;

        let fingerprint = lookup_fingerprint(&registry, &bound, &ip_rules);

        let mut ipv4 = PatriciaTree::new(32)?;
        let mut ipv6 = PatriciaTree::new(128)?;
        for (network, port, protocol) in ip_rules {
            let tree = if network.is_ipv4() { &mut ipv4 } else { &mut ipv6 };
            let prefix = Prefix::from_network(network)?;
            let mut entry: AddressEntry = tree.search_exact(&prefix).cloned().unwrap_or_default();
            match port {
                Some(port) => {
                    entry.ports.retain(|(p, _)| *p != port);
                    entry.ports.push((port, protocol));
                }
                None => entry.any_port = Some(protocol),
            }
            tree.insert(prefix, entry)?;
        }

        let host_cache = match host_cache {
            Some(cache) => cache,
            None => Arc::new(MemoCache::from_config(&config.host_cache)?),
        };
        let address_cache = match address_cache {
            Some(cache) => cache,
            None => Arc::new(MemoCache::from_config(&config.address_cache)?),
        };

        info!(
            protocols = registry.len(),
            dissectors = bound.len(),
            host_patterns = hosts.pattern_count(),
            content_patterns = content.pattern_count(),
            ipv4_prefixes = ipv4.len(),
            ipv6_prefixes = ipv6.len(),
            risky_hosts = risky.pattern_count(),
            malicious_fingerprints = malicious_fingerprints.len(),
            fingerprint,
            "Detection module built"
        );

        let limits = DissectLimits {
            tls_reassembly_limit: config.tls_reassembly_limit,
        };
        Ok(DetectionModule::new(
            config,
            registry,
            bound,
            hosts,
            content,
            ipv4,
            ipv6,
            host_cache,
            address_cache,
            limits,
            fingerprint,
            risky,
            malicious_fingerprints,
        ))
    }
}

/// Hash of every input that memoized host and address lookups depend on
///
/// Modules sharing a cache only see each other's entries when they would
/// have computed the same values.
fn lookup_fingerprint(
    registry: &ProtocolRegistry,
    dissectors: &[BoundDissector],
    ip_rules: &[(IpNetwork, Option<u16>, ProtocolId)],
) -> u64 {
    let mut hasher = cache_hasher().build_hasher();
    for (id, descriptor) in registry.iter() {
        id.hash(&mut hasher);
        descriptor.name.hash(&mut hasher);
        descriptor.master.hash(&mut hasher);
        descriptor.is_informative.hash(&mut hasher);
        descriptor.host_patterns.hash(&mut hasher);
        descriptor.content_patterns.hash(&mut hasher);
    }
    for bound in dissectors {
        bound.dissector.name().hash(&mut hasher);
        bound.protocol.hash(&mut hasher);
    }
    for (network, port, protocol) in ip_rules {
        network.to_string().hash(&mut hasher);
        port.hash(&mut hasher);
        protocol.hash(&mut hasher);
    }
    hasher.finish()
}

fn check_shared(cache: &MemoCache, which: &str) -> EngineResult<()> {
    if cache.is_shared() {
        Ok(())
    } else {
        Err(EngineError::Config(format!(
            "{} cache was not created as shareable",
            which
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use osprey_lru::CacheConfig;
    use osprey_schema::{L4Protocol, PortRange};

    fn builder() -> ModuleBuilder {
        ModuleBuilder::new(EngineConfig::default()).unwrap()
    }

    #[test]
    fn test_build_default() {
        let module = builder().build().unwrap();
        let stats = module.stats();
        assert!(stats.registry.finalized);
        assert_eq!(stats.dissectors, vec!["tls", "http", "dns"]);
        assert!(stats.host_automaton.patterns > 0);
        assert_eq!(stats.ipv4_trie.prefixes, 0);
    }

    #[test]
    fn test_rules_register_custom_protocols() {
        let mut b = builder();
        let applied = b
            .load_rules_str("tcp:7777@Custom\nhost:\"corp.example\"@Custom\nip:10.0.0.0/8@CorpLan")
            .unwrap();
        assert_eq!(applied, 3);
        let module = b.build().unwrap();
        let registry = module.registry();
        let custom = registry.lookup_by_name("Custom").unwrap();
        assert_eq!(registry.guess_by_port(L4Protocol::Tcp, 50000, 7777), Some(custom));
        assert!(registry.lookup_by_name("CorpLan").is_some());
        assert_eq!(module.stats().ipv4_trie.prefixes, 1);
    }

    #[test]
    fn test_duplicate_host_is_ignored() {
        let mut b = builder();
        let github = b.protocol_id("GitHub").unwrap();
        b.add_host("GitHub.com.", github).unwrap();
        assert!(b.build().is_ok());
    }

    #[test]
    fn test_port_conflict_fails_build() {
        let mut b = builder();
        let id = b
            .register_protocol(
                ProtocolDescriptor::new("Clash").with_tcp_ports(&[PortRange::single(443)]),
            )
            .unwrap();
        assert!(id > 0);
        assert!(matches!(b.build(), Err(EngineError::Registry(_))));
    }

    #[test]
    fn test_dissector_needs_registered_protocol() {
        let registry = osprey_schema::ProtocolRegistry::new();
        let result = builder().with_registry(registry).build();
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[test]
    fn test_shared_cache_keys_depend_on_lookup_inputs() {
        let shared = Arc::new(MemoCache::new(64, 300, true).unwrap());
        let build = |rules: &str| {
            let mut b = builder()
                .with_shared_host_cache(Arc::clone(&shared))
                .unwrap()
                .with_shared_address_cache(Arc::clone(&shared))
                .unwrap();
            b.load_rules_str(rules).unwrap();
            b.build().unwrap()
        };
        let a = build("host:\"a.example\"@AppA\nip:198.51.100.0/24@CorpA");
        let b = build("tcp:7000@OtherApp");
        assert_ne!(a.fingerprint(), b.fingerprint());

        // Both custom protocols get the same id in their own registries
        let app_a = a.registry().lookup_by_name("AppA").unwrap();
        assert_eq!(b.registry().lookup_by_name("OtherApp"), Some(app_a));

        assert_eq!(a.match_host("a.example", 0), Some(app_a));
        assert_eq!(b.match_host("a.example", 0), None);

        let addr = "198.51.100.9".parse().unwrap();
        assert!(a.match_address(addr, 443, L4Protocol::Tcp, 0).is_some());
        assert_eq!(b.match_address(addr, 443, L4Protocol::Tcp, 0), None);

        // An identically built module reuses the entries
        let c = build("host:\"a.example\"@AppA\nip:198.51.100.0/24@CorpA");
        assert_eq!(c.fingerprint(), a.fingerprint());
        let hits = c.stats().host_cache.hits;
        assert_eq!(c.match_host("a.example", 1), Some(app_a));
        assert_eq!(c.stats().host_cache.hits, hits + 1);
    }

    #[test]
    fn test_shared_cache_flag() {
        let private = Arc::new(MemoCache::from_config(&CacheConfig::default()).unwrap());
        assert!(builder().with_shared_host_cache(private).is_err());

        let shared = Arc::new(
            MemoCache::from_config(&CacheConfig {
                shared: true,
                ..Default::default()
            })
            .unwrap(),
        );
        let a = builder()
            .with_shared_host_cache(Arc::clone(&shared))
            .unwrap()
            .build()
            .unwrap();
        let b = builder()
            .with_shared_host_cache(Arc::clone(&shared))
            .unwrap()
            .build()
            .unwrap();
        assert!(a.stats().host_cache.capacity == b.stats().host_cache.capacity);
        assert_eq!(Arc::strong_count(&shared), 3);
    }
}
