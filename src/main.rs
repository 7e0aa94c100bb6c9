//! tablelock contention driver - runs concurrent transactions against a set
//! of in-memory tables and reports how they resolved.

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info};
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tablelock::concurrency::{AccessType, Lockable, LockableId};
use tablelock::config::Config;
use tablelock::database::Database;
use tablelock::event::TableId;
use tablelock::transaction::{
    IsolationLevel, RegistryValidator, TableSystem, TransactionError,
};

/// tablelock - transactional lock contention driver
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of worker threads, one transaction at a time each
    #[arg(short, long, default_value = "4")]
    threads: usize,

    /// Number of tables to contend on
    #[arg(short = 'n', long, default_value = "3")]
    tables: u32,

    /// Transactions per thread
    #[arg(short, long, default_value = "100")]
    iterations: usize,

    /// Rows per table removals are drawn from
    #[arg(short, long, default_value = "1000")]
    rows: u64,

    /// Isolation level of every transaction
    #[arg(short = 'I', long, default_value = "serializable")]
    isolation: IsolationLevel,

    /// Lock grant and queue wait timeout in milliseconds
    #[arg(long, default_value = "1000")]
    timeout_ms: u64,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

struct Table(TableId);

impl Lockable for Table {
    fn lockable_id(&self) -> LockableId {
        LockableId::new(u64::from(self.0 .0))
    }
}

#[derive(Default)]
struct Outcomes {
    committed: AtomicUsize,
    clashed: AtomicUsize,
    timed_out: AtomicUsize,
}

fn main() -> Result<()> {
    let args = Args::parse();
    anyhow::ensure!(args.tables > 0, "--tables must be at least 1");
    anyhow::ensure!(args.rows > 0, "--rows must be at least 1");

    let log_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let mut config = Config::default();
    config.locking.acquire_timeout_ms = Some(args.timeout_ms);
    config.locking.wait_timeout_ms = args.timeout_ms;
    config.transaction.default_isolation = args.isolation;

    let database = Database::with_config(config);
    let system: Arc<dyn TableSystem> = Arc::new(RegistryValidator::new());
    let table_ids: Arc<Vec<TableId>> = Arc::new((1..=args.tables).map(TableId).collect());
    let tables: Arc<Vec<Arc<dyn Lockable>>> = Arc::new(
        table_ids
            .iter()
            .map(|id| Arc::new(Table(*id)) as Arc<dyn Lockable>)
            .collect(),
    );
    let outcomes = Arc::new(Outcomes::default());

    info!(
        "running {} threads x {} transactions on {} tables at {}",
        args.threads, args.iterations, args.tables, args.isolation
    );
    let start = Instant::now();

    let mut workers = Vec::with_capacity(args.threads);
    for worker in 0..args.threads {
        let database = Arc::clone(&database);
        let system = Arc::clone(&system);
        let tables = Arc::clone(&tables);
        let table_ids = Arc::clone(&table_ids);
        let outcomes = Arc::clone(&outcomes);
        let iterations = args.iterations;
        let rows = args.rows;

        workers.push(thread::spawn(move || -> Result<()> {
            let mut rng = rand::thread_rng();
            for _ in 0..iterations {
                let first = rng.gen_range(0..tables.len());
                let count = rng.gen_range(1..=tables.len() - first);
                // Tables are always presented in ascending id order.
                let range = first..first + count;

                match run_transaction(
                    &database,
                    &system,
                    &tables[range.clone()],
                    &table_ids[range],
                    &mut rng,
                    rows,
                ) {
                    Ok(()) => outcomes.committed.fetch_add(1, Ordering::Relaxed),
                    Err(TransactionError::CommitClash { .. }) => {
                        outcomes.clashed.fetch_add(1, Ordering::Relaxed)
                    }
                    Err(e) if e.is_retryable() => {
                        debug!("worker {} gave up: {}", worker, e);
                        outcomes.timed_out.fetch_add(1, Ordering::Relaxed)
                    }
                    Err(e) => return Err(e).context("transaction failed"),
                };
            }
            Ok(())
        }));
    }

    for worker in workers {
        worker
            .join()
            .map_err(|_| anyhow::anyhow!("worker thread panicked"))??;
    }

    println!("Finished in {:?}", start.elapsed());
    println!(
        "  committed: {}",
        outcomes.committed.load(Ordering::Relaxed)
    );
    println!("  clashed:   {}", outcomes.clashed.load(Ordering::Relaxed));
    println!(
        "  timed out: {}",
        outcomes.timed_out.load(Ordering::Relaxed)
    );
    println!(
        "  history:   {} registries retained",
        database.versioned_registry().len()
    );

    Ok(())
}

fn run_transaction(
    database: &Arc<Database>,
    system: &Arc<dyn TableSystem>,
    tables: &[Arc<dyn Lockable>],
    table_ids: &[TableId],
    rng: &mut impl Rng,
    rows: u64,
) -> std::result::Result<(), TransactionError> {
    let mut txn = database.begin_default(system)?;
    txn.enter(tables, AccessType::READ_WRITE)?;

    for table_id in table_ids {
        txn.on_row_removed(*table_id, rng.gen_range(0..rows))?;
        txn.on_row_added(*table_id, rows.saturating_add(rng.gen_range(0..rows)))?;
    }

    txn.commit(None)
}
