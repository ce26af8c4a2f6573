//! SCHC Compressor Binary
//!
//! Runs the packets of a pcapng capture through the SCHC pipeline. Uplink
//! packets go through a device endpoint and downlink packets through a
//! gateway endpoint; with `--verify` the messages are handed to the opposite
//! endpoint and the rebuilt datagram is compared with the original.

use anyhow::{Context, Result};
use clap::Parser;
use pcap_file::pcapng::{Block, PcapNgReader};
use schc::{
    Direction, LengthPrefixedQueue, LinkConfig, LinkLayer, Role, RuleSet, SchcEndpoint,
};
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

/// Offset of the hop limit in the IPv6 header
const HOP_LIMIT_OFFSET: usize = 7;
/// Offset of the UDP checksum in an IPv6/UDP datagram
const UDP_CHECKSUM_OFFSET: usize = 46;

#[derive(Parser, Debug)]
#[command(name = "compressor")]
#[command(about = "SCHC compressor for IPv6/UDP/CoAP over LPWAN", long_about = None)]
struct Args {
    /// Path to the rules JSON file (built-in LO-CoAP-EAP rules if omitted)
    #[arg(short, long)]
    rules: Option<PathBuf>,

    /// Path to a link configuration JSON file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to the pcapng file
    #[arg(short, long)]
    pcap: PathBuf,

    /// Link layer header length in front of IPv6 (0 for raw IP)
    #[arg(long, default_value_t = 14)]
    link_header_len: usize,

    /// Enable debug mode (print compressed messages)
    #[arg(short, long, default_value_t = false)]
    debug: bool,

    /// Maximum number of packets to process (0 = all)
    #[arg(short, long, default_value_t = 0)]
    max_packets: usize,

    /// Direction of the first packet ("UP" or "DOWN")
    #[arg(long, default_value = "UP")]
    first_packet_direction: String,

    /// Verify compression by decompressing and comparing with original
    #[arg(short = 'v', long, default_value_t = false)]
    verify: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => LinkConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => LinkConfig::default(),
    };
    if args.rules.is_some() {
        config.rules_path = args.rules.clone();
    }

    let rules = Arc::new(config.load_rules().context("Failed to load rules")?);
    println!("Loaded {} rules", rules.len());

    let mut device = endpoint(&rules, &config, Role::Device)?;
    let mut gateway = endpoint(&rules, &config, Role::Gateway)?;
    let link_layer = match args.link_header_len {
        0 => LinkLayer::None,
        14 => LinkLayer::Ethernet,
        len => LinkLayer::Custom(len),
    };

    println!("Opening pcap file: {}", args.pcap.display());
    let file = File::open(&args.pcap).context("Failed to open pcap file")?;
    let mut reader = PcapNgReader::new(file).context("Failed to create pcapng reader")?;

    let mut summary = Summary::default();
    let mut macs = MacMapping::new(&args.first_packet_direction);

    println!("\n{}", "=".repeat(80));
    println!("Processing packets");
    println!("{}\n", "=".repeat(80));

    while let Some(block) = reader.next_block() {
        if args.max_packets > 0 && summary.packets >= args.max_packets {
            break;
        }
        let block = match block {
            Ok(block) => block,
            Err(pcap_file::PcapError::IncompleteBuffer) => break,
            Err(e) => {
                eprintln!("Error reading packet: {}", e);
                break;
            }
        };
        let Block::EnhancedPacket(epb) = block else {
            continue;
        };

        summary.packets += 1;
        let frame = epb.data.as_ref();
        let direction = macs.direction(frame, link_layer);
        let datagram = match link_layer.strip(frame) {
            Ok(datagram) => datagram,
            Err(e) => {
                println!("Packet {}: skipped ({})", summary.packets, e);
                summary.failed += 1;
                continue;
            }
        };

        let (sender, receiver) = match direction {
            Direction::Up => (&mut device, &mut gateway),
            Direction::Down => (&mut gateway, &mut device),
        };

        let mut queue = LengthPrefixedQueue::new(config.queue_capacity);
        let report = match sender.send(datagram, &mut queue) {
            Ok(report) => report,
            Err(e) => {
                println!("Packet {}: NOT COMPRESSED ({})", summary.packets, e);
                summary.failed += 1;
                summary.uncompressed_bytes += datagram.len();
                continue;
            }
        };

        summary.compressed += 1;
        summary.original_header_bytes += report.original_header_bytes;
        summary.compressed_header_bytes += report.compressed_header_bytes;
        summary.messages += report.messages;

        println!(
            "Packet {} {:?}: {} bytes -> {} bytes in {} message(s) (Rule: {} - Saved: {} header bytes)",
            summary.packets,
            direction,
            report.datagram_len,
            report.compressed_len,
            report.messages,
            report.rule_id,
            report.original_header_bytes as i64 - report.compressed_header_bytes as i64
        );

        let messages = queue.drain_messages();
        if args.debug {
            for message in &messages {
                println!("    Message: {}", hex::encode(message));
            }
        }

        if args.verify {
            summary.record(verify(receiver, datagram, &messages, args.debug));
        }
    }

    summary.print(args.verify);
    Ok(())
}

fn endpoint(rules: &Arc<RuleSet>, config: &LinkConfig, role: Role) -> Result<SchcEndpoint> {
    let config = LinkConfig {
        role,
        ..config.clone()
    };
    SchcEndpoint::new(Arc::clone(rules), &config).context("Invalid link configuration")
}

// =============================================================================
// Verification
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verification {
    Passed,
    /// Only the UDP checksum differs (checksum offloading on capture)
    ChecksumOnly,
    Failed,
}

fn verify(
    receiver: &mut SchcEndpoint,
    original: &[u8],
    messages: &[Vec<u8>],
    debug: bool,
) -> Verification {
    let mut rebuilt = None;
    for message in messages {
        match receiver.receive(message) {
            Ok(Some(datagram)) => rebuilt = Some(datagram),
            Ok(None) => {}
            Err(e) => {
                eprintln!("  ✗ Verification ERROR: {}", e);
                return Verification::Failed;
            }
        }
    }
    let Some(rebuilt) = rebuilt else {
        eprintln!("  ✗ Verification ERROR: no datagram rebuilt");
        return Verification::Failed;
    };

    // Decompression always restores hop limit 255
    let differs = |i: usize| i != HOP_LIMIT_OFFSET && original[i] != rebuilt[i];
    let diffs: Vec<usize> = (0..original.len().min(rebuilt.len()))
        .filter(|&i| differs(i))
        .collect();

    let result = if original.len() != rebuilt.len() {
        Verification::Failed
    } else if diffs.is_empty() {
        Verification::Passed
    } else if diffs
        .iter()
        .all(|&i| i == UDP_CHECKSUM_OFFSET || i == UDP_CHECKSUM_OFFSET + 1)
    {
        Verification::ChecksumOnly
    } else {
        Verification::Failed
    };

    match result {
        Verification::Passed => println!("  ✓ Verification: PASSED"),
        Verification::ChecksumOnly => {
            println!("  ⚠ Verification: PASSED (checksum differs - likely offloading)")
        }
        Verification::Failed => {
            println!("  ✗ Verification: FAILED");
            if debug {
                for i in diffs {
                    println!(
                        "    Diff at byte {}: original=0x{:02x}, decompressed=0x{:02x}",
                        i, original[i], rebuilt[i]
                    );
                }
                if original.len() != rebuilt.len() {
                    println!(
                        "    Length mismatch: original={}, decompressed={}",
                        original.len(),
                        rebuilt.len()
                    );
                }
            }
        }
    }
    result
}

// =============================================================================
// Direction Detection
// =============================================================================

/// Assigns directions by Ethernet source MAC, learned from the first packet
struct MacMapping {
    first_direction: Direction,
    dev_mac: Option<Vec<u8>>,
    app_mac: Option<Vec<u8>>,
}

impl MacMapping {
    fn new(first_direction: &str) -> Self {
        let first_direction = match first_direction.to_uppercase().as_str() {
            "DOWN" => Direction::Down,
            _ => Direction::Up,
        };
        Self {
            first_direction,
            dev_mac: None,
            app_mac: None,
        }
    }

    fn direction(&mut self, frame: &[u8], link_layer: LinkLayer) -> Direction {
        if link_layer != LinkLayer::Ethernet || frame.len() < 14 {
            return self.first_direction;
        }
        let dst = frame[0..6].to_vec();
        let src = frame[6..12].to_vec();

        if self.dev_mac.is_none() {
            let (dev, app) = match self.first_direction {
                Direction::Up => (src, dst),
                Direction::Down => (dst, src),
            };
            log::info!(
                "Initialized MAC mapping: DEV={}, APP={}",
                hex::encode(&dev),
                hex::encode(&app)
            );
            self.dev_mac = Some(dev);
            self.app_mac = Some(app);
            return self.first_direction;
        }

        if self.app_mac.as_ref() == Some(&src) {
            Direction::Down
        } else {
            Direction::Up
        }
    }
}

// =============================================================================
// Summary
// =============================================================================

#[derive(Debug, Default)]
struct Summary {
    packets: usize,
    compressed: usize,
    failed: usize,
    messages: usize,
    original_header_bytes: usize,
    compressed_header_bytes: usize,
    uncompressed_bytes: usize,
    verified: usize,
    checksum_only: usize,
    verify_failed: usize,
}

impl Summary {
    fn record(&mut self, verification: Verification) {
        match verification {
            Verification::Passed => self.verified += 1,
            Verification::ChecksumOnly => self.checksum_only += 1,
            Verification::Failed => self.verify_failed += 1,
        }
    }

    fn print(&self, verify: bool) {
        println!("\n{}", "=".repeat(80));
        println!("SUMMARY");
        println!("{}", "=".repeat(80));
        println!("Total packets processed:    {}", self.packets);
        println!("Successfully compressed:    {}", self.compressed);
        println!("Not compressed:             {}", self.failed);
        println!("LPWAN messages:             {}", self.messages);
        println!(
            "Total original header:      {} bytes",
            self.original_header_bytes
        );
        println!(
            "Total compressed header:    {} bytes + {} bytes uncompressed",
            self.compressed_header_bytes, self.uncompressed_bytes
        );
        if self.original_header_bytes > 0 {
            let saved = self
                .original_header_bytes
                .saturating_sub(self.compressed_header_bytes);
            println!(
                "Total bytes saved:          {} bytes ({:.1}%)",
                saved,
                100.0 * saved as f64 / self.original_header_bytes as f64
            );
            println!(
                "Compression ratio:          {:.2}:1",
                self.original_header_bytes as f64 / self.compressed_header_bytes.max(1) as f64
            );
        }
        if verify {
            println!(
                "Verification:               {} passed, {} checksum-only, {} failed",
                self.verified, self.checksum_only, self.verify_failed
            );
        }
        println!("{}", "=".repeat(80));
    }
}
