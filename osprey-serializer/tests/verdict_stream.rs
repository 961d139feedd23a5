use osprey_schema::{Breed, Category, Confidence, FlowState, ProtocolPair, RiskFlags, Verdict};
use osprey_serializer::{
    read_verdict_json, write_verdict, Format, Serializer, TlvDeserializer, TlvValue,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_verdict(rng: &mut StdRng, flow_id: u64) -> Verdict {
    Verdict {
        flow_id,
        protocol: ProtocolPair::new(rng.gen_range(0..300), rng.gen_range(0..300)),
        protocol_name: format!("Proto{}", flow_id),
        confidence: Confidence::from_code(rng.gen_range(0..=5)).unwrap_or(Confidence::None),
        category: Category::Web,
        breed: Breed::Safe,
        risk: RiskFlags::from_bits_truncate(rng.gen()),
        state: FlowState::Classified,
        packets: rng.gen_range(1..100),
        bytes: rng.gen_range(60..100_000),
        server_name: None,
    }
}

#[test]
fn test_json_stream_one_record_per_line() {
    let mut rng = StdRng::seed_from_u64(7);
    let verdicts: Vec<_> = (0..20).map(|i| random_verdict(&mut rng, i)).collect();

    let mut ser = Serializer::new(Format::Json);
    for verdict in &verdicts {
        write_verdict(&mut ser, verdict).unwrap();
    }
    assert_eq!(ser.records(), verdicts.len());

    let text = String::from_utf8(ser.finish().unwrap().to_vec()).unwrap();
    let decoded: Vec<_> = text.lines().map(|l| read_verdict_json(l).unwrap()).collect();
    assert_eq!(decoded, verdicts);
}

#[test]
fn test_tlv_stream_record_boundaries() {
    let mut rng = StdRng::seed_from_u64(11);
    let mut ser = Serializer::new(Format::Tlv);
    for i in 0..5 {
        write_verdict(&mut ser, &random_verdict(&mut rng, i)).unwrap();
    }
    let bytes = ser.finish().unwrap();

    let records = TlvDeserializer::new(&bytes)
        .unwrap()
        .filter(|item| matches!(item, Ok(i) if i.value == TlvValue::EndOfRecord))
        .count();
    assert_eq!(records, 5);
}

#[test]
fn test_abandoned_verdict_is_rolled_back() {
    let mut rng = StdRng::seed_from_u64(3);
    let kept = random_verdict(&mut rng, 1);

    let mut ser = Serializer::new(Format::Json);
    write_verdict(&mut ser, &kept).unwrap();
    ser.snapshot();
    ser.write_u64("flow_id", 2).unwrap();
    ser.start_block("partial").unwrap();
    ser.rollback().unwrap();

    let text = String::from_utf8(ser.finish().unwrap().to_vec()).unwrap();
    assert_eq!(text.lines().count(), 1);
    assert_eq!(read_verdict_json(&text).unwrap(), kept);
}
