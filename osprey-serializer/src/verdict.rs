// Verdict records
//
// Flat keys carry everything needed to rebuild a `Verdict`. Structured
// formats additionally get a `risks` list of readable risk names, which
// readers ignore.

use crate::{Format, SerializerError, SerializerResult, Serializer, TlvDeserializer, TlvValue};
use osprey_schema::{Breed, Category, Confidence, FlowState, ProtocolPair, RiskFlags, Verdict};
use serde_json::Value;

const FLOW_ID: &str = "flow_id";
const MASTER: &str = "master";
const APP: &str = "app";
const NAME: &str = "protocol";
const CONFIDENCE: &str = "confidence";
const CATEGORY: &str = "category";
const BREED: &str = "breed";
const RISK: &str = "risk";
const RISKS: &str = "risks";
const STATE: &str = "state";
const PACKETS: &str = "packets";
const BYTES: &str = "bytes";
const SERVER_NAME: &str = "server_name";

/// Append one verdict as a complete record
///
/// CSV rows always carry a `server_name` column, empty when unknown, so
/// every row matches the header.
pub fn write_verdict(ser: &mut Serializer, verdict: &Verdict) -> SerializerResult<()> {
    ser.write_u64(FLOW_ID, verdict.flow_id)?;
    ser.write_u32(MASTER, verdict.protocol.master as u32)?;
    ser.write_u32(APP, verdict.protocol.app as u32)?;
    ser.write_str(NAME, &verdict.protocol_name)?;
    ser.write_u32(CONFIDENCE, verdict.confidence.code() as u32)?;
    ser.write_u32(CATEGORY, verdict.category.code() as u32)?;
    ser.write_u32(BREED, verdict.breed.code() as u32)?;
    ser.write_u64(RISK, verdict.risk.bits())?;
    ser.write_u32(STATE, verdict.state.code() as u32)?;
    ser.write_u64(PACKETS, verdict.packets)?;
    ser.write_u64(BYTES, verdict.bytes)?;

    match (&verdict.server_name, ser.format()) {
        (Some(name), _) => ser.write_str(SERVER_NAME, name)?,
        (None, Format::Csv) => ser.write_str(SERVER_NAME, "")?,
        (None, _) => {}
    }

    if ser.format() != Format::Csv && !verdict.risk.is_empty() {
        ser.start_list(RISKS)?;
        for name in verdict.risk.names() {
            ser.write_str(RISKS, name)?;
        }
        ser.end_list()?;
    }

    ser.end_of_record()
}

/// Rebuild the first verdict record found in a TLV buffer
pub fn read_verdict_tlv(buf: &[u8]) -> SerializerResult<Verdict> {
    let mut fields = Fields::default();
    let mut depth = 0usize;

    for item in TlvDeserializer::new(buf)? {
        let item = item?;
        match item.value {
            TlvValue::EndOfRecord => return fields.into_verdict(),
            TlvValue::StartBlock | TlvValue::StartList => depth += 1,
            TlvValue::EndBlock | TlvValue::EndList => depth = depth.saturating_sub(1),
            value if depth == 0 => {
                if let Some(name) = item.key.as_ref().and_then(|k| k.as_name()) {
                    fields.set(name, value.as_u64(), value.as_str());
                }
            }
            _ => {}
        }
    }
    Err(SerializerError::Field("end of record"))
}

/// Rebuild a verdict from one JSON record line
pub fn read_verdict_json(line: &str) -> SerializerResult<Verdict> {
    let record: Value = serde_json::from_str(line.trim())?;
    let object = record
        .as_object()
        .ok_or(SerializerError::Field("record object"))?;

    let mut fields = Fields::default();
    for (key, value) in object {
        fields.set(key, value.as_u64(), value.as_str());
    }
    fields.into_verdict()
}

#[derive(Default)]
struct Fields {
    flow_id: Option<u64>,
    master: Option<u64>,
    app: Option<u64>,
    name: Option<String>,
    confidence: Option<u64>,
    category: Option<u64>,
    breed: Option<u64>,
    risk: Option<u64>,
    state: Option<u64>,
    packets: Option<u64>,
    bytes: Option<u64>,
    server_name: Option<String>,
}

impl Fields {
    fn set(&mut self, key: &str, num: Option<u64>, text: Option<&str>) {
        match key {
            FLOW_ID => self.flow_id = num,
            MASTER => self.master = num,
            APP => self.app = num,
            NAME => self.name = text.map(str::to_string),
            CONFIDENCE => self.confidence = num,
            CATEGORY => self.category = num,
            BREED => self.breed = num,
            RISK => self.risk = num,
            STATE => self.state = num,
            PACKETS => self.packets = num,
            BYTES => self.bytes = num,
            SERVER_NAME => {
                self.server_name = text.filter(|s| !s.is_empty()).map(str::to_string)
            }
            _ => {}
        }
    }

    fn into_verdict(self) -> SerializerResult<Verdict> {
        let protocol = ProtocolPair::new(
            narrow(self.master, MASTER)?,
            narrow(self.app, APP)?,
        );
        let confidence = narrow::<u8>(self.confidence, CONFIDENCE)
            .ok()
            .and_then(Confidence::from_code)
            .ok_or(SerializerError::Field(CONFIDENCE))?;
        let category = narrow::<u16>(self.category, CATEGORY)
            .ok()
            .and_then(Category::from_code)
            .ok_or(SerializerError::Field(CATEGORY))?;
        let breed = narrow::<u16>(self.breed, BREED)
            .ok()
            .and_then(Breed::from_code)
            .ok_or(SerializerError::Field(BREED))?;
        let state = narrow::<u8>(self.state, STATE)
            .ok()
            .and_then(FlowState::from_code)
            .ok_or(SerializerError::Field(STATE))?;

        Ok(Verdict {
            flow_id: self.flow_id.ok_or(SerializerError::Field(FLOW_ID))?,
            protocol,
            protocol_name: self.name.ok_or(SerializerError::Field(NAME))?,
            confidence,
            category,
            breed,
            risk: RiskFlags::from_bits_retain(self.risk.ok_or(SerializerError::Field(RISK))?),
            state,
            packets: self.packets.unwrap_or(0),
            bytes: self.bytes.unwrap_or(0),
            server_name: self.server_name,
        })
    }
}

fn narrow<T: TryFrom<u64>>(value: Option<u64>, field: &'static str) -> SerializerResult<T> {
    value
        .and_then(|v| T::try_from(v).ok())
        .ok_or(SerializerError::Field(field))
}
