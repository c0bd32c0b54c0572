//! Concurrent insert load: many more workers than pooled connections.
//!
//! Each task takes a connection to its partition's primary, inserts one
//! record, keeps the connection for `--hold-ms`, then lets it go. With
//! `--no-pool` the same load also runs opening a fresh connection per task,
//! and both timings are reported.

use clap::Args;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::warn;

use partita_core::{
    Config, ConnectionFactory, DataAccess, Endpoint, PdalError, PdalResult, Record, Role,
    StoreError,
};

#[derive(Debug, Clone, Args)]
pub struct BenchArgs {
    /// Number of records to insert
    #[arg(long, default_value_t = 1500)]
    pub tasks: usize,
    /// Number of concurrent worker threads
    #[arg(long, default_value_t = 150)]
    pub workers: usize,
    /// Keep each connection this long after its insert, like a slow query
    #[arg(long, value_name = "MS", default_value_t = 0)]
    pub hold_ms: u64,
    /// Also run the load with a fresh connection per task, for comparison
    #[arg(long)]
    pub no_pool: bool,
}

/// Where a task gets its connection from.
enum Source<'a> {
    Pooled {
        data: &'a DataAccess,
        acquire_timeout: Duration,
    },
    Unpooled {
        data: &'a DataAccess,
        factory: &'a dyn ConnectionFactory,
    },
}

impl Source<'_> {
    fn data(&self) -> &DataAccess {
        match self {
            Source::Pooled { data, .. } | Source::Unpooled { data, .. } => *data,
        }
    }

    fn insert(&self, record: &Record, hold: Duration) -> PdalResult<()> {
        let data = self.data();
        let pool = data
            .registry()
            .pool_for(data.route(&record.id), Role::Primary)?;
        let endpoint = pool.endpoint();

        match self {
            Source::Pooled {
                acquire_timeout, ..
            } => {
                let mut conn = pool.acquire(*acquire_timeout)?;
                let result = conn.insert(&endpoint.namespace, record);
                if matches!(&result, Err(err) if err.is_transport()) {
                    conn.mark_broken();
                }
                hold_for(hold);
                result.map_err(|err| insert_error(endpoint, record, err))
            }
            Source::Unpooled { factory, .. } => {
                let mut conn = factory
                    .connect(endpoint)
                    .map_err(|err| PdalError::from_store(endpoint, err))?;
                let result = conn.insert(&endpoint.namespace, record);
                hold_for(hold);
                result.map_err(|err| insert_error(endpoint, record, err))
            }
        }
    }
}

fn hold_for(hold: Duration) {
    if !hold.is_zero() {
        thread::sleep(hold);
    }
}

fn insert_error(endpoint: &Endpoint, record: &Record, err: StoreError) -> PdalError {
    match err {
        StoreError::UniqueViolation(_) => PdalError::Conflict {
            key: record.id.clone(),
        },
        err => PdalError::from_store(endpoint, err),
    }
}

#[derive(Default)]
struct Tally {
    stored: AtomicUsize,
    conflicts: AtomicUsize,
    failed: AtomicUsize,
}

pub fn run(
    data: &DataAccess,
    factory: &dyn ConnectionFactory,
    config: &Config,
    args: &BenchArgs,
) -> anyhow::Result<()> {
    // Ids start past anything an earlier run inserted.
    let base = SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis() as i64 * 1000;
    let hold = Duration::from_millis(args.hold_ms);

    if args.no_pool {
        let unpooled = Source::Unpooled { data, factory };
        let elapsed = load(&unpooled, base + args.tasks as i64, args, hold)?;
        println!(
            "{} {:.2?}",
            "Time taken without pool:".bold(),
            elapsed
        );
    }

    let pooled = Source::Pooled {
        data,
        acquire_timeout: config.acquire_timeout,
    };
    let elapsed = load(&pooled, base, args, hold)?;
    println!(
        "{} {:.2?}",
        format!("Time taken with pool (size={}):", config.pool_size).bold(),
        elapsed
    );
    Ok(())
}

fn load(source: &Source<'_>, base: i64, args: &BenchArgs, hold: Duration) -> anyhow::Result<Duration> {
    let tasks = args.tasks;
    let next = AtomicUsize::new(0);
    let tally = Tally::default();

    let bar = ProgressBar::new(tasks as u64);
    bar.set_style(ProgressStyle::with_template(
        "{spinner} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({per_sec})",
    )?);

    let started = Instant::now();
    thread::scope(|s| {
        for _ in 0..args.workers.max(1) {
            s.spawn(|| {
                loop {
                    let i = next.fetch_add(1, Ordering::Relaxed);
                    if i >= tasks {
                        break;
                    }
                    let id = base + i as i64;
                    let record = Record::new(id).with("task", i as u64);
                    match source.insert(&record, hold) {
                        Ok(()) => tally.stored.fetch_add(1, Ordering::Relaxed),
                        Err(PdalError::Conflict { .. }) => {
                            tally.conflicts.fetch_add(1, Ordering::Relaxed)
                        }
                        Err(err) => {
                            warn!(id, error = %err, "bench insert failed");
                            tally.failed.fetch_add(1, Ordering::Relaxed)
                        }
                    };
                    bar.inc(1);
                }
            });
        }
    });
    let elapsed = started.elapsed();
    bar.finish_and_clear();

    let stored = tally.stored.load(Ordering::Relaxed);
    let failed = tally.failed.load(Ordering::Relaxed);
    println!(
        "{} {} inserts with {} workers, {}ms hold ({:.0}/s)",
        match source {
            Source::Pooled { .. } => "pooled".bold(),
            Source::Unpooled { .. } => "unpooled".bold(),
        },
        tasks,
        args.workers,
        args.hold_ms,
        tasks as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    println!(
        "  stored {}, conflicts {}, failed {}",
        stored.to_string().green(),
        tally.conflicts.load(Ordering::Relaxed),
        if failed == 0 {
            failed.to_string().normal()
        } else {
            failed.to_string().red()
        }
    );
    Ok(elapsed)
}
