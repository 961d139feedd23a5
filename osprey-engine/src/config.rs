// Engine configuration

use crate::{EngineError, EngineResult};
use osprey_ac_dfa::AutomatonConfig;
use osprey_lru::CacheConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Smallest reassembly buffer that still holds a typical ClientHello
const MIN_TLS_REASSEMBLY: usize = 512;

/// Detection module configuration
///
/// Passed to [`crate::ModuleBuilder::new`]; there is no process-wide state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Packets examined before giving up on a flow
    pub max_packets_to_process: u32,

    /// Payload bytes examined before giving up on a flow
    pub max_bytes_to_process: u64,

    /// Packets handed to each dissector after classification
    pub extra_dissection_packets: u32,

    /// Memo cache for hostname lookups
    pub host_cache: CacheConfig,

    /// Memo cache for address lookups
    pub address_cache: CacheConfig,

    /// Limits shared by the hostname and content automata
    pub automaton: AutomatonConfig,

    /// Match payloads against protocol content markers
    pub enable_content_matching: bool,

    /// Bytes buffered per direction while reassembling TLS records
    pub tls_reassembly_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_packets_to_process: 32,
            max_bytes_to_process: 64 * 1024,
            extra_dissection_packets: 8,
            host_cache: CacheConfig {
                capacity: 4096,
                ttl_secs: 300,
                shared: false,
            },
            address_cache: CacheConfig {
                capacity: 1024,
                ttl_secs: 120,
                shared: false,
            },
            automaton: AutomatonConfig::default(),
            enable_content_matching: true,
            tls_reassembly_limit: 16 * 1024,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> EngineResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> EngineResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Reject settings that would make classification impossible
    pub fn validate(&self) -> EngineResult<()> {
        if self.max_packets_to_process == 0 {
            return Err(EngineError::Config(
                "max_packets_to_process must be at least 1".to_string(),
            ));
        }
        if self.max_bytes_to_process == 0 {
            return Err(EngineError::Config(
                "max_bytes_to_process must be at least 1".to_string(),
            ));
        }
        if self.host_cache.capacity == 0 || self.address_cache.capacity == 0 {
            return Err(EngineError::Config(
                "cache capacity must be at least 1".to_string(),
            ));
        }
        if self.tls_reassembly_limit < MIN_TLS_REASSEMBLY {
            return Err(EngineError::Config(format!(
                "tls_reassembly_limit must be at least {}",
                MIN_TLS_REASSEMBLY
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_packets_to_process, 32);
        assert_eq!(config.max_bytes_to_process, 65_536);
        assert_eq!(config.extra_dissection_packets, 8);
        assert_eq!(config.host_cache.capacity, 4096);
        assert_eq!(config.address_cache.ttl_secs, 120);
        assert!(config.enable_content_matching);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let config = EngineConfig::from_json_str(
            r#"{ "max_packets_to_process": 50, "host_cache": { "capacity": 16 } }"#,
        )
        .unwrap();
        assert_eq!(config.max_packets_to_process, 50);
        assert_eq!(config.host_cache.capacity, 16);
        // Unspecified fields keep their defaults
        assert_eq!(config.host_cache.ttl_secs, CacheConfig::default().ttl_secs);
        assert_eq!(config.tls_reassembly_limit, 16 * 1024);
    }

    #[test]
    fn test_invalid_config() {
        let err = EngineConfig::from_json_str(r#"{ "max_packets_to_process": 0 }"#).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));

        let err = EngineConfig::from_json_str("not json").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{ "enable_content_matching": false }}"#).unwrap();
        let config = EngineConfig::from_json_file(file.path()).unwrap();
        assert!(!config.enable_content_matching);
    }
}
