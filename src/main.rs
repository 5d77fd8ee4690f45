//! FAST & FAIR benchmark driver.
//!
//! Loads (or generates) a key set, warms the tree with the first half, then
//! times concurrent search of that half and concurrent insert of the second
//! half across worker threads.
//!
//! ```bash
//! fastfair -n 1000000 -t 8
//! fastfair -n 1000000 -t 8 -i keys.txt -w 300
//! ```

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use std::time::Instant;

use clap::Parser;

use fastfair::{BTree, PersistConfig};

#[derive(Parser, Debug)]
#[command(name = "fastfair", about = "FAST & FAIR B+-tree benchmark driver")]
struct Args {
    /// Number of keys to process.
    #[arg(short = 'n', long = "num", default_value_t = 100_000)]
    num: usize,

    /// Worker thread count.
    #[arg(short = 't', long = "threads", default_value_t = 1)]
    threads: usize,

    /// Input file of whitespace-separated decimal keys; generated keys are
    /// used when absent.
    #[arg(short = 'i', long = "input")]
    input: Option<PathBuf>,

    /// Emulated per-cache-line write latency in nanoseconds.
    #[arg(short = 'w', long = "write-latency", default_value_t = 0)]
    write_latency: u64,
}

/// Multiplicative-hash key stream: well spread, deterministic, cheap.
fn generated_keys(n: usize) -> Vec<i64> {
    const MULTIPLIER: u64 = 0x9e37_79b9_7f4a_7c15;

    (0..n)
        .map(|i| ((i as u64 + 1).wrapping_mul(MULTIPLIER) >> 1) as i64)
        .collect()
}

fn keys_from_file(path: &std::path::Path, n: usize) -> Result<Vec<i64>, String> {
    let text: String =
        fs::read_to_string(path).map_err(|e| format!("cannot read {}: {e}", path.display()))?;

    let mut keys: Vec<i64> = Vec::with_capacity(n);
    for token in text.split_whitespace().take(n) {
        let key: i64 = token
            .parse()
            .map_err(|e| format!("bad key {token:?}: {e}"))?;
        keys.push(key);
    }

    if keys.len() < n {
        return Err(format!(
            "{} holds {} keys, {n} requested",
            path.display(),
            keys.len()
        ));
    }

    Ok(keys)
}

/// The index is agnostic to handle meaning; the driver stores the key
/// itself, nudged off the reserved null handle.
fn handle_for(key: i64) -> u64 {
    let handle = key as u64;
    if handle == 0 { 1 } else { handle }
}

/// Evict the tree from CPU caches between phases so timings measure memory
/// traffic, not residue.
fn clear_cache() {
    const SIZE: usize = 64 * 1024 * 1024;

    let mut garbage: Vec<u8> = (0..SIZE).map(|i| i as u8).collect();
    for i in 100..SIZE {
        garbage[i] = garbage[i].wrapping_add(garbage[i - 100]);
    }
    std::hint::black_box(&garbage);
}

fn run(args: &Args) -> Result<(), String> {
    let keys: Vec<i64> = match &args.input {
        Some(path) => keys_from_file(path, args.num)?,
        None => generated_keys(args.num),
    };

    let tree: BTree = BTree::with_config(PersistConfig {
        write_latency_ns: args.write_latency,
    });

    let half: usize = keys.len() / 2;
    let threads: usize = args.threads.max(1);
    let per_thread: usize = half / threads.max(1);

    // Warm-up: insert the first half single-threaded.
    let start = Instant::now();
    for &key in &keys[..half] {
        tree.insert(key, handle_for(key))
            .map_err(|e| format!("warm-up insert failed: {e}"))?;
    }
    println!(
        "Warm-up: {half} inserts in {} usec",
        start.elapsed().as_micros()
    );

    clear_cache();

    // Concurrent search of the warm half.
    let start = Instant::now();
    thread::scope(|scope| {
        for tid in 0..threads {
            let tree = &tree;
            let keys = &keys;
            scope.spawn(move || {
                let from: usize = per_thread * tid;
                let to: usize = if tid == threads - 1 {
                    half
                } else {
                    from + per_thread
                };

                let guard = tree.guard();
                for &key in &keys[from..to] {
                    std::hint::black_box(tree.search_with_guard(key, &guard));
                }
            });
        }
    });
    println!(
        "Concurrent searching with {threads} threads (usec): {}",
        start.elapsed().as_micros()
    );

    clear_cache();

    // Concurrent insert of the second half.
    let start = Instant::now();
    thread::scope(|scope| {
        for tid in 0..threads {
            let tree = &tree;
            let keys = &keys;
            scope.spawn(move || {
                let from: usize = half + per_thread * tid;
                let to: usize = if tid == threads - 1 {
                    keys.len()
                } else {
                    from + per_thread
                };

                let guard = tree.guard();
                for &key in &keys[from..to] {
                    if let Err(e) = tree.insert_with_guard(key, handle_for(key), &guard) {
                        eprintln!("insert {key} failed: {e}");
                        return;
                    }
                }
            });
        }
    });
    println!(
        "Concurrent inserting with {threads} threads (usec): {}",
        start.elapsed().as_micros()
    );

    println!(
        "Tree: {} entries, height {}, {} cache lines flushed",
        tree.len(),
        tree.height(),
        tree.flush_count()
    );

    Ok(())
}

fn main() -> ExitCode {
    #[cfg(feature = "tracing")]
    fastfair::init_tracing();

    let args = Args::parse();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("{message}");
            ExitCode::FAILURE
        }
    }
}
