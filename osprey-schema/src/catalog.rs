// Built-in protocol catalog

use crate::{
    Breed, Category, DetectionMask, PortRange, ProtocolDescriptor, ProtocolRegistry,
    RegistryResult,
};

impl ProtocolRegistry {
    /// Registry pre-populated with common protocols and applications
    ///
    /// The registry is returned open so callers can add rules before
    /// finalizing it.
    pub fn with_builtin_protocols() -> RegistryResult<Self> {
        let mut registry = Self::new();
        for descriptor in builtin_protocols().into_iter().chain(builtin_applications()) {
            registry.register(descriptor)?;
        }
        Ok(registry)
    }
}

fn builtin_protocols() -> Vec<ProtocolDescriptor> {
    let tcp = DetectionMask::TCP_WITH_PAYLOAD;
    let udp = DetectionMask::UDP_WITH_PAYLOAD;
    let both = DetectionMask::TCP_OR_UDP_WITH_PAYLOAD;

    vec![
        ProtocolDescriptor::new("HTTP")
            .with_category(Category::Web)
            .with_breed(Breed::Acceptable)
            .with_detection(tcp)
            .with_tcp_ports(&[PortRange::single(80), PortRange::single(8080)]),
        ProtocolDescriptor::new("TLS")
            .with_category(Category::Web)
            .with_breed(Breed::Safe)
            .with_detection(tcp)
            .with_tcp_ports(&[PortRange::single(443)]),
        ProtocolDescriptor::new("DNS")
            .with_category(Category::Network)
            .with_breed(Breed::Acceptable)
            .with_detection(both)
            .with_tcp_ports(&[PortRange::single(53)])
            .with_udp_ports(&[PortRange::single(53), PortRange::single(5353)]),
        ProtocolDescriptor::new("QUIC")
            .with_category(Category::Web)
            .with_breed(Breed::Acceptable)
            .with_detection(udp)
            .with_udp_ports(&[PortRange::single(443)]),
        ProtocolDescriptor::new("SSH")
            .with_category(Category::RemoteAccess)
            .with_breed(Breed::Acceptable)
            .with_detection(tcp)
            .with_tcp_ports(&[PortRange::single(22)])
            .with_content(&["SSH-2.0-", "SSH-1.99-"]),
        ProtocolDescriptor::new("SMTP")
            .with_category(Category::Mail)
            .with_breed(Breed::Acceptable)
            .with_detection(tcp)
            .with_tcp_ports(&[PortRange::single(25), PortRange::single(587)]),
        ProtocolDescriptor::new("IMAP")
            .with_category(Category::Mail)
            .with_breed(Breed::Unsafe)
            .with_detection(tcp)
            .with_tcp_ports(&[PortRange::single(143)]),
        ProtocolDescriptor::new("POP3")
            .with_category(Category::Mail)
            .with_breed(Breed::Unsafe)
            .with_detection(tcp)
            .with_tcp_ports(&[PortRange::single(110)]),
        ProtocolDescriptor::new("NTP")
            .with_category(Category::System)
            .with_breed(Breed::Acceptable)
            .with_detection(udp)
            .with_udp_ports(&[PortRange::single(123)]),
        ProtocolDescriptor::new("DHCP")
            .with_category(Category::Network)
            .with_breed(Breed::Acceptable)
            .with_detection(udp)
            .with_udp_ports(&[PortRange::new(67, 68)]),
        ProtocolDescriptor::new("BitTorrent")
            .with_category(Category::Download)
            .with_breed(Breed::Acceptable)
            .with_detection(both)
            .with_tcp_ports(&[PortRange::new(6881, 6889)])
            .with_udp_ports(&[PortRange::new(6881, 6889)])
            .with_content(&["BitTorrent protocol"]),
        ProtocolDescriptor::new("Telnet")
            .with_category(Category::RemoteAccess)
            .with_breed(Breed::Unsafe)
            .with_detection(tcp)
            .with_tcp_ports(&[PortRange::single(23)]),
        ProtocolDescriptor::new("FTP")
            .with_category(Category::Download)
            .with_breed(Breed::Unsafe)
            .with_detection(tcp)
            .with_tcp_ports(&[PortRange::single(21)]),
    ]
}

fn builtin_applications() -> Vec<ProtocolDescriptor> {
    vec![
        ProtocolDescriptor::new("Google")
            .with_category(Category::Web)
            .with_breed(Breed::Acceptable)
            .with_hosts(&["google.com", "googleapis.com", "gstatic.com"]),
        ProtocolDescriptor::new("YouTube")
            .with_category(Category::Streaming)
            .with_breed(Breed::Fun)
            .with_hosts(&["youtube.com", "googlevideo.com", "ytimg.com"]),
        ProtocolDescriptor::new("Netflix")
            .with_category(Category::Streaming)
            .with_breed(Breed::Fun)
            .with_hosts(&["netflix.com", "nflxvideo.net", "nflximg.net"]),
        ProtocolDescriptor::new("Facebook")
            .with_category(Category::SocialNetwork)
            .with_breed(Breed::Fun)
            .with_hosts(&["facebook.com", "fbcdn.net"]),
        ProtocolDescriptor::new("GitHub")
            .with_category(Category::Collaborative)
            .with_breed(Breed::Acceptable)
            .with_hosts(&["github.com", "githubusercontent.com"]),
        ProtocolDescriptor::new("Cloudflare")
            .with_category(Category::Web)
            .with_breed(Breed::Acceptable)
            .with_hosts(&["cloudflare.com"])
            .informative(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::L4Protocol;

    #[test]
    fn test_builtin_catalog_finalizes() {
        let mut registry = ProtocolRegistry::with_builtin_protocols().unwrap();
        registry.finalize().unwrap();

        let tls = registry.lookup_by_name("TLS").unwrap();
        let quic = registry.lookup_by_name("QUIC").unwrap();
        assert_eq!(registry.guess_by_port(L4Protocol::Tcp, 50000, 443), Some(tls));
        assert_eq!(registry.guess_by_port(L4Protocol::Udp, 50000, 443), Some(quic));
        assert!(registry.stats().host_patterns >= 10);
    }

    #[test]
    fn test_builtin_breeds() {
        let registry = ProtocolRegistry::with_builtin_protocols().unwrap();
        let telnet = registry.lookup_by_name("Telnet").unwrap();
        assert!(registry.lookup_by_id(telnet).unwrap().breed.is_risky());
        let youtube = registry.lookup_by_name("YouTube").unwrap();
        assert_eq!(
            registry.lookup_by_id(youtube).unwrap().category,
            Category::Streaming
        );
    }
}
