//! `rmt` — command-line interface for the match-table data plane.
//!
//! ```text
//! USAGE:
//!   rmt describe          Print the reference silicon geometry
//!   rmt l2-demo           Bring up an exact-MAC forwarder and push frames
//!   rmt ttl-demo          Parse IPv4 and decrement the TTL in place
//! ```
//!
//! The demos drive the same control bus an external controller would: every
//! configuration step is a dispatched request, and the packets go through
//! the ordinary ingress path.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use rmt_chip::geometry;
use rmt_chip::ClusterLayout;
use rmt_dataplane::prelude::*;
use rmt_dataplane::render::frame_summary;
use rmt_dataplane::OpCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rmt", about = "Reconfigurable match-table data plane CLI", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Print the reference silicon geometry.
    Describe,
    /// Configure an exact-MAC L2 forwarder and push two frames through it.
    L2Demo,
    /// Parse Ethernet+IPv4 and decrement the TTL in place.
    TtlDemo,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Cmd::Describe => cmd_describe(),
        Cmd::L2Demo => cmd_l2_demo(),
        Cmd::TtlDemo => cmd_ttl_demo(),
    }
}

fn cmd_describe() -> Result<()> {
    let l = ClusterLayout::REFERENCE;
    println!("Reference silicon");
    println!(
        "  Processors  {} logical ({} addressable), {} per cluster",
        l.processors,
        geometry::MAX_PROCESSORS,
        l.processors_per_cluster()
    );
    println!(
        "  Clusters    {}  ({} SRAM + {} TCAM blocks each)",
        l.clusters,
        l.sram_per_cluster(),
        l.tcam_per_cluster()
    );
    println!(
        "  SRAM block  {} bits x {} rows",
        geometry::SRAM_WIDTH_BITS,
        geometry::SRAM_DEPTH
    );
    println!(
        "  TCAM block  {} bits x {} rows",
        geometry::TCAM_WIDTH_BITS,
        geometry::TCAM_DEPTH
    );
    println!(
        "  Per proc    {} matcher slots, {} action slots",
        geometry::MATCHER_SLOTS,
        geometry::EXECUTOR_ACTIONS
    );
    println!(
        "  Packet      {} B headers + {} B metadata",
        geometry::FRONT_HEADER_BYTES,
        geometry::METADATA_BYTES
    );
    Ok(())
}

/// Installed service plus the pipeline it controls.
fn bring_up() -> (CtrlService, Arc<RwLock<Pipeline>>) {
    let pipeline = Arc::new(RwLock::new(Pipeline::new()));
    let mut ctrl = CtrlService::new();
    ctrl.install(Arc::clone(&pipeline));
    (ctrl, pipeline)
}

fn dispatch(ctrl: &CtrlService, req: CtrlRequest) -> Result<()> {
    let resp = ctrl.dispatch(req);
    if resp.status != CtrlStatus::Ok {
        bail!(
            "control request rejected: {}",
            resp.detail.unwrap_or_else(|| format!("{:?}", resp.status))
        );
    }
    Ok(())
}

fn ethernet_parser(ctrl: &CtrlService) -> Result<()> {
    dispatch(ctrl, CtrlRequest::InitParserLevel { proc_id: 0, levels: 2 })?;
    dispatch(
        ctrl,
        CtrlRequest::ModParserEntry {
            proc_id: 0,
            level: 0,
            entry: ParserEntry {
                state: 0,
                key: 0,
                mask: 0,
                hdr_id: 1,
                hdr_len: 112,
                next_state: 1,
                trans_fields: vec![FieldInfo::field(1, 96, 16)],
                miss_act: MissAction::Accept,
            },
        },
    )?;
    dispatch(
        ctrl,
        CtrlRequest::ModParserEntry {
            proc_id: 0,
            level: 1,
            entry: ParserEntry {
                state: 1,
                key: 0x0800,
                mask: 0xFFFF,
                hdr_id: 2,
                hdr_len: 160,
                next_state: 2,
                trans_fields: Vec::new(),
                miss_act: MissAction::Accept,
            },
        },
    )?;
    Ok(())
}

fn demo_frame(dst_mac: [u8; 6], ttl: u8) -> Vec<u8> {
    let mut f = vec![0u8; 64];
    f[..6].copy_from_slice(&dst_mac);
    f[6..12].copy_from_slice(&[0x02, 0x11, 0x22, 0x33, 0x44, 0x55]);
    f[12..14].copy_from_slice(&[0x08, 0x00]);
    f[14] = 0x45;
    f[22] = ttl;
    f[26..30].copy_from_slice(&[192, 168, 0, 1]);
    f[30..34].copy_from_slice(&[192, 168, 0, 2]);
    f
}

fn cmd_l2_demo() -> Result<()> {
    let (ctrl, pipeline) = bring_up();
    ethernet_parser(&ctrl)?;

    // Exact table on the destination MAC; a hit runs action 1, which tags
    // the frame by rewriting the source-MAC's first byte.
    dispatch(
        &ctrl,
        CtrlRequest::SetMemConfig {
            proc_id: 0,
            matcher_id: 0,
            cfg: MemConfig {
                match_type: MatchType::Exact,
                key_width: 48,
                value_width: 16,
                depth: 64,
                miss_act_id: 0,
            },
        },
    )?;
    dispatch(
        &ctrl,
        CtrlRequest::SetFieldInfo {
            proc_id: 0,
            matcher_id: 0,
            fields: vec![FieldInfo::field(1, 0, 48)],
        },
    )?;
    dispatch(
        &ctrl,
        CtrlRequest::SetActionProc {
            proc_id: 0,
            matcher_id: 0,
            map: HashMap::from([(1, 16)]),
        },
    )?;
    dispatch(
        &ctrl,
        CtrlRequest::InsertSramEntry {
            proc_id: 0,
            matcher_id: 0,
            key: vec![0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF],
            value: vec![0x01, 0x00],
        },
    )?;
    dispatch(
        &ctrl,
        CtrlRequest::SetDefaultGateEntry {
            proc_id: 0,
            entry: GateEntry::table(0),
        },
    )?;
    dispatch(
        &ctrl,
        CtrlRequest::InsertAction {
            proc_id: 0,
            action_id: 1,
            action: ActionSpec {
                primitives: vec![PrimitiveSpec {
                    lvalue: FieldInfo::field(1, 48, 8),
                    rvalue: ExpSpec::constant(8, 0x99),
                }],
                para_lens: Vec::new(),
            },
        },
    )?;

    let ppl = pipeline.read().unwrap();
    for (label, frame) in [
        ("known dst", demo_frame([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF], 64)),
        ("unknown dst", demo_frame([0x00, 0x01, 0x02, 0x03, 0x04, 0x05], 64)),
    ] {
        println!("in  ({label}): {}", frame_summary(&frame));
        match ppl.process(&frame, 1)? {
            Some(out) => println!("out (if {}): {}", out.eg_if, frame_summary(&out.bytes)),
            None => println!("out: dropped"),
        }
    }
    Ok(())
}

fn cmd_ttl_demo() -> Result<()> {
    let (ctrl, pipeline) = bring_up();
    ethernet_parser(&ctrl)?;
    dispatch(
        &ctrl,
        CtrlRequest::InsertAction {
            proc_id: 0,
            action_id: 0,
            action: ActionSpec {
                primitives: vec![PrimitiveSpec {
                    lvalue: FieldInfo::field(2, 64, 8),
                    rvalue: ExpSpec::binary(
                        OpCode::Sub,
                        ExpSpec::field(FieldInfo::field(2, 64, 8)),
                        ExpSpec::constant(8, 1),
                    ),
                }],
                para_lens: Vec::new(),
            },
        },
    )?;

    let frame = demo_frame([0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01], 64);
    println!("in : {}", frame_summary(&frame));
    let ppl = pipeline.read().unwrap();
    match ppl.process(&frame, 0)? {
        Some(out) => println!("out: {}", frame_summary(&out.bytes)),
        None => println!("out: dropped"),
    }
    Ok(())
}
