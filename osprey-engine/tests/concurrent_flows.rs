use osprey_engine::{EngineConfig, FlowTable, ModuleBuilder};
use osprey_lru::{CacheConfig, MemoCache};
use osprey_packet::synth;
use osprey_schema::FlowState;
use std::sync::Arc;
use std::thread;

const SERVER: [u8; 4] = [142, 250, 1, 1];
const NAMES: [(&str, &str); 3] = [
    ("www.google.com", "TLS.Google"),
    ("github.com", "TLS.GitHub"),
    ("unlisted.example", "TLS"),
];

#[test]
fn test_parallel_flows_through_one_module() {
    let module = ModuleBuilder::new(EngineConfig::default())
        .unwrap()
        .build()
        .unwrap();
    let table = FlowTable::new(60_000);

    thread::scope(|s| {
        for worker in 0..4u8 {
            let module = &module;
            let table = &table;
            s.spawn(move || {
                for i in 0..25u16 {
                    let (name, expected) = NAMES[(i as usize) % NAMES.len()];
                    let client = [10, 0, worker, (i + 1) as u8];
                    let syn = synth::tcp_v4(client, 40000 + i, SERVER, 443, b"").unwrap();
                    let hello =
                        synth::tcp_v4(client, 40000 + i, SERVER, 443, &synth::tls_client_hello(Some(name)))
                            .unwrap();

                    table.process(module, &syn, 1_000).unwrap();
                    let verdict = table.process(module, &hello, 1_010).unwrap();
                    assert_eq!(verdict.state, FlowState::Classified);
                    assert_eq!(verdict.protocol_name, expected);
                }
            });
        }
    });

    assert_eq!(table.len(), 100);
    let snapshot = module.metrics().snapshot();
    assert_eq!(snapshot.packets, 200);
    assert_eq!(snapshot.flows_created, 100);
    assert_eq!(snapshot.flows_classified, 100);

    let verdicts = table.drain(&module);
    assert_eq!(verdicts.len(), 100);
    assert!(table.is_empty());
    assert_eq!(module.metrics().snapshot().flows_released, 100);
}

#[test]
fn test_shared_cache_across_modules() {
    let cache = Arc::new(
        MemoCache::from_config(&CacheConfig {
            capacity: 64,
            ttl_secs: 0,
            shared: true,
        })
        .unwrap(),
    );
    let build = || {
        ModuleBuilder::new(EngineConfig::default())
            .unwrap()
            .with_shared_host_cache(Arc::clone(&cache))
            .unwrap()
            .build()
            .unwrap()
    };
    let first = build();
    let second = build();

    let google = first.registry().lookup_by_name("Google");
    assert_eq!(first.match_host("maps.google.com", 1), google);
    // Resolved by the first module, served from the cache to the second
    assert_eq!(second.match_host("maps.google.com", 2), google);
    assert_eq!(cache.stats().hits, 1);
    assert_eq!(cache.stats().misses, 1);
}
