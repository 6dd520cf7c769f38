//! chainplace CLI: simulate stream placement and watch a chain from the terminal.
//!
//! Usage:
//! ```bash
//! # Place 10k streams on 20 nodes run by 5 operators
//! chainplace simulate --nodes 20 --operators 5 --streams 10000 --replication 3
//!
//! # Follow a chain through its RPC endpoint
//! chainplace watch --url https://cloudflare-eth.com
//!
//! # Print default settings
//! chainplace info
//! ```

use std::collections::HashMap;
use std::env;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{keccak256, Address};
use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;

use chainplace_core::telemetry::{init_tracing, LogConfig};
use chainplace_core::{
    BlockNumber, LedgerClient, MemoryChain, NodeStatus, StaticOnChainConfig, StreamDistribution,
};
use chainplace_distributor::{Distributor, DistributorSimulator};
use chainplace_monitor::{ChainMonitor, MonitorConfig};
use chainplace_rpc::HttpLedgerClient;

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "simulate" => cmd_simulate(&args[2..]).await,
        "watch" => cmd_watch(&args[2..]).await,
        "info" => cmd_info(),
        "version" | "--version" | "-V" => {
            println!("chainplace {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("chainplace {}", env!("CARGO_PKG_VERSION"));
    println!("Chain monitoring and consistent-hashing stream placement\n");
    println!("USAGE:");
    println!("    chainplace <COMMAND>\n");
    println!("COMMANDS:");
    println!("    simulate   Place streams on an in-memory registry and report load");
    println!("    watch      Follow a chain through a JSON-RPC endpoint");
    println!("    info       Print default monitor and distribution settings");
    println!("    version    Print version");
    println!("    help       Print this help\n");
    println!("SIMULATE FLAGS:");
    println!("    --nodes <N>          Operational nodes          [default: 10]");
    println!("    --operators <M>      Distinct operators         [default: 3]");
    println!("    --streams <S>        Streams to place           [default: 1000]");
    println!("    --replication <R>    Nodes per stream           [default: 3]");
    println!("    --vnodes <V>         Virtual nodes per node     [default: 150]");
    println!("    --candidates <C>     Ring candidates per stream [default: 4]");
    println!("    --json               Print the report as JSON\n");
    println!("WATCH FLAGS:");
    println!("    --url <URL>              RPC endpoint URL  [required]");
    println!("    --from <BLOCK>           First block       [default: head]");
    println!("    --block-period-ms <MS>   Poll period       [default: 2000]");
    println!("    --json                   JSON log output");
}

// ─── simulate ────────────────────────────────────────────────────────────────

async fn cmd_simulate(args: &[String]) -> Result<()> {
    let nodes: u64 = parse_num(args, "--nodes")?.unwrap_or(10);
    let operators: u64 = parse_num(args, "--operators")?.unwrap_or(3);
    let streams: u64 = parse_num(args, "--streams")?.unwrap_or(1000);
    let replication: usize = parse_num(args, "--replication")?.unwrap_or(3);
    let vnodes: u64 = parse_num(args, "--vnodes")?.unwrap_or(0);
    let candidates: u64 = parse_num(args, "--candidates")?.unwrap_or(0);
    let json = has_flag(args, "--json");

    if nodes == 0 || operators == 0 {
        bail!("--nodes and --operators must be at least 1");
    }

    init_tracing(&LogConfig {
        level: "warn".into(),
        ..LogConfig::default()
    });

    let chain = Arc::new(MemoryChain::new(0, Address::ZERO));
    for i in 0..nodes {
        let node = numbered_address(i + 1);
        let operator = numbered_address(0x1000 + i % operators);
        chain.add_node(node, operator, &format!("https://node-{i}"), NodeStatus::Operational);
    }
    let at = chain.commit();

    let settings = StreamDistribution::new(vnodes, candidates);
    let distributor = Distributor::detached(
        chain.clone(),
        Arc::new(chain.codec()),
        Arc::new(StaticOnChainConfig::new(settings)),
        at,
    )
    .await?;

    for i in 0..streams {
        let stream_id = keccak256(i.to_be_bytes());
        let placed = distributor
            .choose_stream_nodes(&stream_id, replication)
            .with_context(|| format!("placing stream {i}"))?;
        for node in placed {
            distributor.assign_stream_to_node(&node)?;
        }
    }

    let mut loads: Vec<(Address, i64)> = distributor.node_stream_count().into_iter().collect();
    loads.sort_by_key(|(address, _)| *address);
    let stats = LoadStats::from_loads(loads.iter().map(|(_, l)| *l));

    if json {
        let per_node: HashMap<String, i64> =
            loads.iter().map(|(a, l)| (a.to_string(), *l)).collect();
        let report = serde_json::json!({
            "nodes": nodes,
            "operators": operators,
            "streams": streams,
            "replication": replication,
            "vnodes": settings.effective_vnode_count(),
            "candidates": settings.effective_candidates_count(),
            "load": per_node,
            "min": stats.min,
            "max": stats.max,
            "mean": stats.mean,
            "stddev": stats.stddev,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "Placed {streams} streams x{replication} on {nodes} nodes ({operators} operators, {} vnodes, {} candidates)\n",
        settings.effective_vnode_count(),
        settings.effective_candidates_count()
    );
    for (address, load) in &loads {
        println!("  {address}  {load:>8}");
    }
    println!();
    println!("  min    {:>8}", stats.min);
    println!("  max    {:>8}", stats.max);
    println!("  mean   {:>8.1}", stats.mean);
    println!("  stddev {:>8.2}", stats.stddev);
    Ok(())
}

fn numbered_address(n: u64) -> Address {
    let mut bytes = [0u8; 20];
    bytes[12..].copy_from_slice(&n.to_be_bytes());
    Address::new(bytes)
}

#[derive(Debug, Default, PartialEq)]
struct LoadStats {
    min: i64,
    max: i64,
    mean: f64,
    stddev: f64,
}

impl LoadStats {
    fn from_loads(loads: impl Iterator<Item = i64>) -> Self {
        let loads: Vec<i64> = loads.collect();
        if loads.is_empty() {
            return Self::default();
        }
        let n = loads.len() as f64;
        let mean = loads.iter().sum::<i64>() as f64 / n;
        let variance = loads
            .iter()
            .map(|l| (*l as f64 - mean).powi(2))
            .sum::<f64>()
            / n;
        Self {
            min: loads.iter().copied().min().unwrap_or_default(),
            max: loads.iter().copied().max().unwrap_or_default(),
            mean,
            stddev: variance.sqrt(),
        }
    }
}

// ─── watch ───────────────────────────────────────────────────────────────────

async fn cmd_watch(args: &[String]) -> Result<()> {
    let url = parse_flag(args, "--url").context("--url is required")?;
    let from: Option<u64> = parse_num(args, "--from")?;
    let period: u64 = parse_num(args, "--block-period-ms")?.unwrap_or(2000);

    init_tracing(&LogConfig {
        json: has_flag(args, "--json"),
        ..LogConfig::default()
    });

    let client = Arc::new(HttpLedgerClient::default_for(&url)?);
    let start = match from {
        Some(block) => BlockNumber(block),
        None => BlockNumber(client.block_number().await?),
    };

    let config = MonitorConfig::builder()
        .chain(url.clone())
        .block_period(Duration::from_millis(period))
        .build();
    config.validate()?;

    let monitor = ChainMonitor::new(config);
    monitor.on_header(|header| async move {
        let time = chrono::DateTime::from_timestamp(header.timestamp as i64, 0)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| header.timestamp.to_string());
        tracing::info!(
            block = %header.number,
            time = %time,
            base_fee = ?header.base_fee,
            "header"
        );
    });
    monitor.on_block(|block| async move {
        tracing::debug!(block = %block, "block");
    });

    let cancel = CancellationToken::new();
    let handle = monitor.start(client, start, cancel.clone())?;
    tracing::info!(url = %url, from = %start, "watching chain, Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    cancel.cancel();
    handle.await?;

    let metrics = monitor.metrics();
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    Ok(())
}

// ─── info ────────────────────────────────────────────────────────────────────

fn cmd_info() -> Result<()> {
    let monitor = MonitorConfig::default();
    let distribution = StreamDistribution::default();

    println!("chainplace {}\n", env!("CARGO_PKG_VERSION"));
    println!("Monitor defaults:");
    println!("{}\n", serde_json::to_string_pretty(&monitor)?);
    println!("Distribution defaults:");
    println!("  vnodes per node    {}", distribution.effective_vnode_count());
    println!("  ring candidates    {}", distribution.effective_candidates_count());
    println!("  max ring steps     {}", chainplace_distributor::MAX_RING_STEPS);
    Ok(())
}

// ─── flags ───────────────────────────────────────────────────────────────────

fn parse_flag(args: &[String], flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1).cloned()
}

fn parse_num<T>(args: &[String], flag: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    parse_flag(args, flag)
        .map(|v| v.parse::<T>().with_context(|| format!("invalid value for {flag}: {v}")))
        .transpose()
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}
