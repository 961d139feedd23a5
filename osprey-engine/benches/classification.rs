// Classification benchmarks
//
// Per-packet cost of the driver on common flow shapes, plus raw hostname
// automaton throughput.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use osprey_ac_dfa::{AutomatonBuilder, MatchPattern};
use osprey_engine::{EngineConfig, ModuleBuilder};
use osprey_packet::{synth, PacketView};

const CLIENT: [u8; 4] = [10, 1, 1, 1];
const SERVER: [u8; 4] = [10, 2, 2, 2];

fn bench_classify_flows(c: &mut Criterion) {
    let module = ModuleBuilder::new(EngineConfig::default())
        .unwrap()
        .build()
        .unwrap();

    let cases: Vec<(&str, Vec<u8>)> = vec![
        (
            "tls_client_hello",
            synth::tcp_v4(CLIENT, 40000, SERVER, 443, &synth::tls_client_hello(Some("www.youtube.com"))).unwrap(),
        ),
        (
            "http_request",
            synth::tcp_v4(
                CLIENT,
                40000,
                SERVER,
                80,
                &synth::http_request("GET", "github.com", "/", &[("User-Agent", "Mozilla/5.0")]),
            )
            .unwrap(),
        ),
        (
            "dns_query",
            synth::udp_v4(CLIENT, 53000, SERVER, 53, &synth::dns_query(1, "www.netflix.com")).unwrap(),
        ),
        (
            "opaque_udp",
            synth::udp_v4(CLIENT, 40000, SERVER, 40001, &[0xab; 120]).unwrap(),
        ),
    ];

    let mut group = c.benchmark_group("first_packet");
    for (name, bytes) in &cases {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(name), bytes, |b, bytes| {
            let view = PacketView::parse(bytes).unwrap();
            b.iter(|| {
                let mut flow = module.create_flow(&view, 0);
                let verdict = module.process_packet(&mut flow, black_box(bytes), 0).unwrap();
                module.release_flow(&mut flow);
                black_box(verdict)
            });
        });
    }
    group.finish();
}

fn bench_host_automaton(c: &mut Criterion) {
    let mut group = c.benchmark_group("host_automaton");

    for pattern_count in [10usize, 100, 1000] {
        let patterns: Vec<_> = (0..pattern_count)
            .map(|i| MatchPattern::domain(format!("service-{}.example", i), i as u32).unwrap())
            .collect();
        let automaton = AutomatonBuilder::new("bench")
            .add_patterns(patterns)
            .build()
            .unwrap();
        let host = format!("cdn.service-{}.example", pattern_count / 2);

        group.bench_with_input(BenchmarkId::from_parameter(pattern_count), &host, |b, host| {
            b.iter(|| black_box(automaton.find_longest(black_box(host.as_bytes())).unwrap()));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_classify_flows, bench_host_automaton);
criterion_main!(benches);
