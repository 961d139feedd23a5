//! Osprey CLI
//!
//! Command-line interface for the Osprey classification engine.

mod trace;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use osprey_engine::{DetectionModule, EngineConfig, FlowTable, ModuleBuilder, Verdict};
use osprey_schema::{L4Protocol, PortRange};
use osprey_serializer::{write_verdict, Format, Serializer};
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Minimum trace time between idle sweeps of the flow table
const SWEEP_INTERVAL_MS: u64 = 1_000;

#[derive(Parser)]
#[command(name = "osprey")]
#[command(about = "Osprey - incremental per-flow protocol classification", long_about = None)]
#[command(version)]
struct Cli {
    /// Extra protocol rules file
    #[arg(short, long, global = true)]
    rules: Option<PathBuf>,

    /// Engine configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Json)]
    format: OutputFormat,

    /// Log level, used when RUST_LOG is not set
    #[arg(short, long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered protocols
    Protocols,

    /// Classify a packet trace (one `<timestamp_ms> <hex>` packet per line)
    Classify {
        /// Trace file
        #[arg(short, long)]
        input: PathBuf,

        /// Flows idle this long are finalized early
        #[arg(long, default_value_t = 60_000)]
        idle_timeout_ms: u64,

        /// Print run and module statistics to stderr
        #[arg(long)]
        stats: bool,
    },

    /// Look up the protocol bound to an address
    Lookup {
        addr: IpAddr,

        /// Server port
        #[arg(short, long, default_value_t = 0)]
        port: u16,

        /// Treat the port as UDP instead of TCP
        #[arg(long)]
        udp: bool,
    },

    /// Match a hostname against the host patterns
    MatchHost { name: String },

    /// Print module statistics as JSON
    Stats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Json,
    Tlv,
    Csv,
}

impl From<OutputFormat> for Format {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Json => Format::Json,
            OutputFormat::Tlv => Format::Tlv,
            OutputFormat::Csv => Format::Csv,
        }
    }
}

/// Counters for one `classify` run
#[derive(Debug, Default, Serialize)]
struct RunSummary {
    packets: usize,
    rejected_lines: usize,
    malformed_packets: usize,
    flows: usize,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level)?;

    let module = build_module(cli.config.as_deref(), cli.rules.as_deref())?;
    let format = Format::from(cli.format);
    let stdout = io::stdout();
    let mut out = stdout.lock();

    match cli.command {
        Commands::Protocols => list_protocols(&module, format, &mut out)?,
        Commands::Classify {
            input,
            idle_timeout_ms,
            stats,
        } => {
            let file = File::open(&input)
                .with_context(|| format!("Failed to open trace {}", input.display()))?;
            let summary = classify_trace(
                &module,
                BufReader::new(file),
                idle_timeout_ms,
                format,
                &mut out,
            )?;
            info!(
                packets = summary.packets,
                flows = summary.flows,
                malformed = summary.malformed_packets,
                "Trace classified"
            );
            if stats {
                let report = serde_json::json!({
                    "run": summary,
                    "module": module.stats(),
                });
                eprintln!("{}", serde_json::to_string_pretty(&report)?);
            }
        }
        Commands::Lookup { addr, port, udp } => {
            let l4 = if udp { L4Protocol::Udp } else { L4Protocol::Tcp };
            lookup_address(&module, addr, port, l4, format, &mut out)?;
        }
        Commands::MatchHost { name } => match_host(&module, &name, format, &mut out)?,
        Commands::Stats => {
            serde_json::to_writer_pretty(&mut out, &module.stats())?;
            writeln!(out)?;
        }
    }

    out.flush()?;
    Ok(())
}

fn setup_logging(level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level).with_context(|| format!("Invalid log level '{}'", level))?,
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to set tracing subscriber: {}", e))?;

    Ok(())
}

fn build_module(config: Option<&Path>, rules: Option<&Path>) -> Result<DetectionModule> {
    let config = match config {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };

    let mut builder = ModuleBuilder::new(config)?;
    if let Some(path) = rules {
        builder
            .load_rules_file(path)
            .with_context(|| format!("Failed to load rules {}", path.display()))?;
    }
    Ok(builder.build()?)
}

/// Feed every trace packet through a flow table and emit one verdict per flow
fn classify_trace(
    module: &DetectionModule,
    reader: impl BufRead,
    idle_timeout_ms: u64,
    format: Format,
    out: &mut impl Write,
) -> Result<RunSummary> {
    let (packets, rejected_lines) = trace::read_trace(reader)?;
    let table = FlowTable::new(idle_timeout_ms);
    let mut summary = RunSummary {
        packets: packets.len(),
        rejected_lines,
        ..Default::default()
    };
    let mut verdicts: Vec<Verdict> = Vec::new();
    let mut last_sweep = 0u64;

    for packet in &packets {
        if let Err(err) = table.process(module, &packet.bytes, packet.timestamp_ms) {
            warn!(line = packet.line, error = %err, "Skipping packet");
            summary.malformed_packets += 1;
        }
        if packet.timestamp_ms.saturating_sub(last_sweep) >= SWEEP_INTERVAL_MS {
            verdicts.extend(table.expire_idle(module, packet.timestamp_ms));
            last_sweep = packet.timestamp_ms;
        }
    }
    verdicts.extend(table.drain(module));
    verdicts.sort_by_key(|v| v.flow_id);
    summary.flows = verdicts.len();
    debug!(flows = summary.flows, "Writing verdicts");

    let mut ser = Serializer::new(format);
    for verdict in &verdicts {
        write_verdict(&mut ser, verdict)?;
    }
    emit(ser, out)?;
    Ok(summary)
}

fn list_protocols(module: &DetectionModule, format: Format, out: &mut impl Write) -> Result<()> {
    let registry = module.registry();
    let mut ser = Serializer::new(format);
    for (id, descriptor) in registry.iter() {
        ser.write_u32("id", id as u32)?;
        ser.write_str("name", &descriptor.name)?;
        ser.write_str(
            "master",
            descriptor.master.map(|m| registry.name(m)).unwrap_or(""),
        )?;
        ser.write_str("category", descriptor.category.as_str())?;
        ser.write_str("breed", descriptor.breed.as_str())?;
        ser.write_bool("informative", descriptor.is_informative)?;
        ser.write_str("tcp_ports", &render_ports(&descriptor.tcp_ports))?;
        ser.write_str("udp_ports", &render_ports(&descriptor.udp_ports))?;
        ser.end_of_record()?;
    }
    emit(ser, out)
}

fn lookup_address(
    module: &DetectionModule,
    addr: IpAddr,
    port: u16,
    l4: L4Protocol,
    format: Format,
    out: &mut impl Write,
) -> Result<()> {
    let found = module.match_address(addr, port, l4, 0);
    let mut ser = Serializer::new(format);
    ser.write_str("address", &addr.to_string())?;
    ser.write_u32("port", port as u32)?;
    match found {
        Some((id, authoritative)) => {
            ser.write_u32("id", id as u32)?;
            ser.write_str("protocol", module.registry().name(id))?;
            ser.write_bool("authoritative", authoritative)?;
        }
        None => {
            ser.write_u32("id", 0)?;
            ser.write_str("protocol", "Unknown")?;
            ser.write_bool("authoritative", false)?;
        }
    }
    ser.end_of_record()?;
    emit(ser, out)
}

fn match_host(module: &DetectionModule, name: &str, format: Format, out: &mut impl Write) -> Result<()> {
    let found = module.match_host(name, 0);
    let mut ser = Serializer::new(format);
    ser.write_str("host", name)?;
    ser.write_u32("id", found.map(|id| id as u32).unwrap_or(0))?;
    ser.write_str(
        "protocol",
        found.map(|id| module.registry().name(id)).unwrap_or("Unknown"),
    )?;
    ser.end_of_record()?;
    emit(ser, out)
}

/// Write a finished record stream, preceded by the header for CSV
fn emit(ser: Serializer, out: &mut impl Write) -> Result<()> {
    if let Some(header) = ser.header() {
        writeln!(out, "{}", header)?;
    }
    let bytes = ser.finish()?;
    out.write_all(&bytes)?;
    Ok(())
}

fn render_ports(ranges: &[PortRange]) -> String {
    ranges
        .iter()
        .map(|r| {
            if r.start == r.end {
                r.start.to_string()
            } else {
                format!("{}-{}", r.start, r.end)
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
