// Quick release mode performance check
//
// Run with: cargo test --release -p osprey-ac-dfa automaton_perf -- --ignored

#[cfg(test)]
mod perf_tests {
    use crate::{AutomatonBuilder, MatchPattern};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::time::Instant;

    fn random_label(rng: &mut StdRng, len: usize) -> String {
        (0..len)
            .map(|_| (b'a' + rng.gen_range(0..26u8)) as char)
            .collect()
    }

    #[test]
    #[ignore] // Run with: cargo test --release automaton_perf -- --ignored
    fn automaton_perf() {
        let mut rng = StdRng::seed_from_u64(7);
        let patterns: Vec<_> = (0..1000u32)
            .map(|i| {
                let host = format!("{}.com", random_label(&mut rng, 10));
                MatchPattern::domain(host, i).unwrap()
            })
            .collect();
        let automaton = AutomatonBuilder::new("perf")
            .add_patterns(patterns)
            .build()
            .unwrap();

        let hosts: Vec<String> = (0..256)
            .map(|_| format!("www.{}.net", random_label(&mut rng, 12)))
            .collect();

        // Warmup
        for host in &hosts {
            let _ = automaton.find_longest(host.as_bytes());
        }

        let iterations = 1_000_000u128;
        let start = Instant::now();
        for i in 0..iterations {
            let host = &hosts[(i % hosts.len() as u128) as usize];
            let _ = automaton.find_longest(host.as_bytes());
        }
        let duration = start.elapsed();
        let ns_per_op = duration.as_nanos() / iterations;

        println!("\n=== Release Mode Automaton Performance ===");
        println!("Iterations: {}", iterations);
        println!("Total time: {:?}", duration);
        println!("Per operation: {} ns", ns_per_op);

        assert!(ns_per_op < 1_000, "Hostname lookup should be fast in release mode, got {} ns/op", ns_per_op);
    }
}
