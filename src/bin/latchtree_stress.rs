//! Multi-threaded stress driver for the latchtree engine.
//!
//! Runs a seeded mixed workload against an in-memory store, optionally crashing and
//! recovering between rounds, then verifies the tree and reports its statistics.

use std::error::Error;
use std::path::PathBuf;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use latchtree::storage::btree::{
    Btree, BtreeConfig, BtreeStatsSnapshot, KeyRange, MemNodeStore, NodeCount, NodeStore,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() {
    init_tracing();
    if let Err(err) = try_main() {
        eprintln!("latchtree-stress failed: {err}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("latchtree=warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
}

#[derive(Parser, Debug)]
#[command(name = "latchtree-stress", about = "Concurrent B+tree stress driver")]
struct Args {
    /// Worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Operations per thread, across all rounds.
    #[arg(long, default_value_t = 20_000)]
    ops: u64,

    /// Keys are drawn uniformly from 0..key_space.
    #[arg(long, default_value_t = 4_096)]
    key_space: u64,

    /// RNG seed; thread `n` uses `seed + n`.
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// TOML tree config; a small-node default is used otherwise.
    #[arg(long, env = "LATCHTREE_CONFIG")]
    config: Option<PathBuf>,

    /// Mix range updates into the workload.
    #[arg(long)]
    range_updates: bool,

    /// Crash the store and recover after every N operations per thread.
    #[arg(long)]
    crash_every: Option<u64>,

    /// Print the report as JSON instead of a table.
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct Report {
    tree: String,
    threads: usize,
    ops_per_thread: u64,
    rounds: u64,
    crashes: u64,
    elapsed_ms: u128,
    ops_per_sec: u64,
    nodes: NodeCount,
    stats: BtreeStatsSnapshot,
}

fn try_main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    if args.threads == 0 || args.key_space == 0 {
        return Err("--threads and --key-space must be greater than zero".into());
    }
    let cfg = match &args.config {
        Some(path) => BtreeConfig::from_toml_file(path)?,
        None => BtreeConfig {
            name: "stress".to_string(),
            ..BtreeConfig::new(512, 8, 8)
        },
    };

    let store = Arc::new(MemNodeStore::<u64, u64>::new());
    let dyn_store: Arc<dyn NodeStore<u64, u64>> = store.clone();
    let mut tree = Arc::new(Btree::create(cfg.clone(), dyn_store)?);

    let round_ops = args.crash_every.unwrap_or(args.ops).clamp(1, args.ops.max(1));
    let rounds = args.ops.div_ceil(round_ops).max(1);
    let mut crashes = 0;
    let mut budget_rng = ChaCha8Rng::seed_from_u64(args.seed ^ 0xC8A5_11ED);
    let started = Instant::now();

    for round in 0..rounds {
        let ops = round_ops.min(args.ops - round * round_ops);
        let crash = args.crash_every.is_some();
        if crash {
            // Durable writes stop somewhere inside the round.
            let budget = budget_rng.gen_range(0..=ops * args.threads as u64);
            store.set_write_budget(Some(budget));
        }
        run_round(&tree, &args, round, ops)?;

        if crash {
            drop(tree);
            store.crash();
            crashes += 1;
            let dyn_store: Arc<dyn NodeStore<u64, u64>> = store.clone();
            tree = Arc::new(Btree::recover(cfg.clone(), dyn_store)?);
        }
        tree.verify()?;
        info!(target: "latchtree::stress", round, crashes, "round verified");
    }

    let elapsed = started.elapsed();
    tree.verify()?;
    tree.emit_stats();
    let total_ops = args.ops * args.threads as u64;
    let report = Report {
        tree: cfg.name.clone(),
        threads: args.threads,
        ops_per_thread: args.ops,
        rounds,
        crashes,
        elapsed_ms: elapsed.as_millis(),
        ops_per_sec: (total_ops as f64 / elapsed.as_secs_f64().max(f64::EPSILON)) as u64,
        nodes: tree.node_count()?,
        stats: tree.stats_snapshot(),
    };
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_table(&report, elapsed);
    }
    Ok(())
}

fn run_round(
    tree: &Arc<Btree<u64, u64>>,
    args: &Args,
    round: u64,
    ops: u64,
) -> Result<(), Box<dyn Error>> {
    let barrier = Arc::new(Barrier::new(args.threads));
    let mut handles = Vec::with_capacity(args.threads);
    for thread_id in 0..args.threads {
        let tree = Arc::clone(tree);
        let barrier = Arc::clone(&barrier);
        let seed = args
            .seed
            .wrapping_add(thread_id as u64)
            .wrapping_add(round << 32);
        let key_space = args.key_space;
        let range_updates = args.range_updates;
        handles.push(thread::spawn(move || -> latchtree::Result<()> {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            barrier.wait();
            for _ in 0..ops {
                let key = rng.gen_range(0..key_space);
                match rng.gen_range(0..100u32) {
                    0..=44 => {
                        tree.insert(key, rng.gen())?;
                    }
                    45..=69 => {
                        tree.remove(&key)?;
                    }
                    70..=89 => {
                        tree.get(&key)?;
                    }
                    90..=94 => {
                        let range = KeyRange::new(key, true, key.saturating_add(64), false);
                        tree.query(range, Some(32))?;
                    }
                    _ if range_updates => {
                        let range = KeyRange::new(key, true, key.saturating_add(32), false);
                        tree.range_update(range, |entries, _| {
                            Ok(entries.iter().map(|(k, v)| (*k, v.wrapping_add(1))).collect())
                        })?;
                    }
                    _ => {
                        let range = KeyRange::new(key, true, key.saturating_add(16), false);
                        tree.get_any(&range)?;
                    }
                }
            }
            Ok(())
        }));
    }
    for handle in handles {
        handle.join().map_err(|_| "stress worker panicked")??;
    }
    Ok(())
}

fn print_table(report: &Report, elapsed: Duration) {
    let stats = &report.stats;
    println!(
        "{:<12} {:>8} {:>10} {:>8} {:>12} {:>12}",
        "TREE", "THREADS", "OPS/THR", "CRASHES", "TIME", "OPS/SEC"
    );
    println!("{}", "-".repeat(68));
    println!(
        "{:<12} {:>8} {:>10} {:>8} {:>12} {:>12}",
        report.tree,
        report.threads,
        report.ops_per_thread,
        report.crashes,
        format!("{:.2} s", elapsed.as_secs_f64()),
        report.ops_per_sec,
    );
    println!();
    println!(
        "    shape: objects={} depth={} leaves={} interiors={}",
        stats.obj_count, stats.depth, report.nodes.leaves, report.nodes.interiors
    );
    println!(
        "    structure: splits={} split_failures={} merges={} node_writes={}",
        stats.splits, stats.split_failures, stats.merges, stats.node_writes
    );
    println!(
        "    contention: retries={} gen_mismatches={} write_errors={} query_errors={}",
        stats.retries, stats.gen_mismatches, stats.write_errors, stats.query_errors
    );
    println!(
        "    ops: puts={} gets={} removes={} range_updates={}",
        stats.puts, stats.gets, stats.removes, stats.range_updates
    );
}
