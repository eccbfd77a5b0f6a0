//! t2lm-tool entry point.
//!
//! Offline helper for inspecting and producing T2LM elements and frames.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

use mlo_t2lm::config::DEFAULT_CONFIG_PATH;
use mlo_t2lm::{
    build_info, parse_action_frame, parse_beacon_mappings, switch_time_to_interval_ms, Direction,
    ExpectedDuration, LinkBitmap, LinkMappingInfo, T2lmConfig, Tid,
};

/// TID-to-link mapping inspection tool
#[derive(Parser, Debug)]
#[command(name = "t2lm-tool")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "warn")]
    log_level: String,

    /// Configuration file [default: /etc/wlan/t2lm.toml, if present]
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode the T2LM elements in a hex-encoded element list
    DecodeIe {
        /// Element bytes as hex
        hex: String,
    },

    /// Decode a hex-encoded Protected EHT T2LM action frame body
    DecodeFrame {
        /// Frame bytes as hex, starting at the category
        hex: String,
    },

    /// Encode one T2LM element
    EncodeIe {
        /// Direction (dl, ul, bidi)
        #[arg(short, long, default_value = "bidi")]
        direction: Direction,

        /// Default link mapping (no per-TID bitmaps)
        #[arg(long)]
        default: bool,

        /// Mapping switch time
        #[arg(long)]
        switch_time: Option<u16>,

        /// Expected duration in TUs (24 bits)
        #[arg(long)]
        duration: Option<u32>,

        /// Per-TID link bitmap, e.g. `--tid 0=0x3 --tid TID5=1,2`
        #[arg(long = "tid", value_parser = parse_tid_links)]
        tids: Vec<(Tid, LinkBitmap)>,
    },

    /// Convert a received switch time into milliseconds from a TSF
    TsfInterval {
        /// TSF of the beacon
        #[arg(long, value_parser = parse_u64)]
        tsf: u64,

        /// Received mapping switch time
        #[arg(long)]
        switch_time: u16,
    },

    /// Print the effective configuration
    ShowConfig,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("t2lm-tool failed: {:#}", e);
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let config = load_config(args.config.as_deref(), Path::new(DEFAULT_CONFIG_PATH))?;
    debug!(?config, "Configuration loaded");

    match args.command {
        Command::DecodeIe { hex } => {
            let bytes = decode_hex(&hex)?;
            let slots = parse_beacon_mappings(&bytes).context("decoding T2LM elements")?;
            println!("{}", serde_json::to_string_pretty(&slots)?);
        }
        Command::DecodeFrame { hex } => {
            let bytes = decode_hex(&hex)?;
            let ctx = parse_action_frame(&bytes).context("decoding T2LM action frame")?;
            println!("{}", serde_json::to_string_pretty(&ctx)?);
        }
        Command::EncodeIe {
            direction,
            default,
            switch_time,
            duration,
            tids,
        } => {
            if default && !tids.is_empty() {
                bail!("--tid cannot be combined with --default");
            }
            let mut info = LinkMappingInfo {
                direction,
                default_mapping: default,
                mapping_switch_time: switch_time,
                expected_duration: duration.map(ExpectedDuration::new),
                ..LinkMappingInfo::default()
            };
            for (tid, links) in tids {
                info.set_links(tid, links);
            }
            println!("{}", encode_hex(&build_info(&info)));
        }
        Command::TsfInterval { tsf, switch_time } => {
            println!("{}", switch_time_to_interval_ms(switch_time, tsf));
        }
        Command::ShowConfig => {
            print!("{}", config.to_toml_string()?);
        }
    }
    Ok(())
}

/// Loads an explicit config file, or `fallback` when one exists there.
fn load_config(explicit: Option<&Path>, fallback: &Path) -> anyhow::Result<T2lmConfig> {
    match explicit {
        Some(path) => {
            T2lmConfig::load(path).with_context(|| format!("loading {}", path.display()))
        }
        None => T2lmConfig::load_or_default(fallback)
            .with_context(|| format!("loading {}", fallback.display())),
    }
}

fn decode_hex(input: &str) -> anyhow::Result<Vec<u8>> {
    let digits: String = input
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    if !digits.is_ascii() {
        bail!("non-hex characters in input");
    }
    if digits.len() % 2 != 0 {
        bail!("odd number of hex digits");
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|e| anyhow!("invalid hex at offset {}: {}", i, e))
        })
        .collect()
}

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn parse_u64(s: &str) -> Result<u64, String> {
    match s.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    }
    .map_err(|e| format!("invalid number '{}': {}", s, e))
}

fn parse_tid_links(s: &str) -> Result<(Tid, LinkBitmap), String> {
    let (tid, links) = s
        .split_once('=')
        .ok_or_else(|| format!("expected TID=LINKS, got '{}'", s))?;
    let tid: Tid = tid.trim().parse().map_err(|e| format!("{}", e))?;
    let links: LinkBitmap = links.trim().parse().map_err(|e| format!("{}", e))?;
    Ok((tid, links))
}
