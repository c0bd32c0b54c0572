use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use colored::Colorize;
use mimalloc::MiMalloc;
use serde_json::Value;
use std::sync::Arc;

use partita_core::logging::{LogFormat, init_logging_with_format};
use partita_core::{
    Config, ConnectionFactory, DataAccess, Key, MemoryFactory, PartitionRegistry, PartitionRouter,
    Record,
};
use partita_pg::PgConnectionFactory;

mod bench;

use bench::BenchArgs;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "partita")]
#[command(about = "Partitioned record storage with bounded pools and replica failover")]
#[command(version)]
struct Cli {
    /// Serve every endpoint from in-process stores instead of PostgreSQL.
    /// Data lives only as long as the command.
    #[arg(long, global = true)]
    memory: bool,

    /// Log output: plain, pretty, or json. Overrides LOG_FORMAT.
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show which partition owns each id, without connecting
    Route {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    #[command(flatten)]
    Store(StoreCommand),
}

/// Commands that bootstrap the partitions before running.
#[derive(Subcommand)]
enum StoreCommand {
    /// Create every partition's namespace and check its stores
    Bootstrap,
    /// Insert a record
    Put {
        /// Record id (integer or text)
        id: String,
        /// Attribute as NAME=VALUE; VALUE is parsed as JSON when it can be
        #[arg(long = "attr", value_name = "NAME=VALUE")]
        attrs: Vec<String>,
        /// Attributes as one JSON object
        #[arg(long, conflicts_with = "attrs")]
        json: Option<String>,
    },
    /// Look a record up by id
    Get {
        id: String,
    },
    /// Show pool counts for every partition
    Stats,
    /// Insert many records concurrently through the pools
    Bench(BenchArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env().context("loading configuration")?;
    init_logging_with_format(cli.log_format.unwrap_or(config.log_format));

    match cli.command {
        Commands::Route { ids } => route(&config, &ids),
        Commands::Store(command) => {
            let factory = factory(&config, cli.memory);
            let data = connect(&config, Arc::clone(&factory))?;
            let outcome = run(&data, &*factory, &config, command);
            data.registry().shutdown();
            outcome
        }
    }
}

fn factory(config: &Config, memory: bool) -> Arc<dyn ConnectionFactory> {
    if memory {
        Arc::new(MemoryFactory::provision(config))
    } else {
        Arc::new(PgConnectionFactory::new(config.store_timeout))
    }
}

fn connect(config: &Config, factory: Arc<dyn ConnectionFactory>) -> anyhow::Result<DataAccess> {
    let registry = PartitionRegistry::from_config(config, factory).context("bootstrap failed")?;
    Ok(DataAccess::from_config(config, Arc::new(registry)))
}

fn run(
    data: &DataAccess,
    factory: &dyn ConnectionFactory,
    config: &Config,
    command: StoreCommand,
) -> anyhow::Result<()> {
    match command {
        StoreCommand::Bootstrap => {
            for stats in data.registry().stats() {
                let spec = &config.partitions[stats.partition.index()];
                let replica = match (&spec.replica, stats.replica) {
                    (Some(endpoint), Some(_)) => endpoint.to_string().green(),
                    (Some(endpoint), None) => format!("{} (unreachable)", endpoint).yellow(),
                    (None, _) => "none".dimmed(),
                };
                println!(
                    "{} partition {}: primary {}, replica {}",
                    "✓".green(),
                    stats.partition,
                    spec.primary,
                    replica
                );
            }
        }
        StoreCommand::Put { id, attrs, json } => {
            let key = Key::parse(&id);
            let record = match json {
                Some(raw) => record_from_json(&key, &raw)?,
                None => record_from_attrs(&key, &attrs)?,
            };
            data.put(&key, &record)?;
            println!(
                "{} stored {} on partition {}",
                "✓".green(),
                key,
                data.route(&key)
            );
        }
        StoreCommand::Get { id } => {
            let key = Key::parse(&id);
            match data.get(&key)? {
                Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                None => println!(
                    "{}",
                    format!("no record {} on partition {}", key, data.route(&key)).yellow()
                ),
            }
        }
        StoreCommand::Stats => print_stats(data),
        StoreCommand::Bench(args) => {
            bench::run(data, factory, config, &args)?;
            print_stats(data);
        }
    }
    Ok(())
}

fn route(config: &Config, ids: &[String]) -> anyhow::Result<()> {
    let router = PartitionRouter::new(config.partition_count())?;
    for id in ids {
        let key = Key::parse(id);
        let partition = router.route(&key);
        let primary = &config.partitions[partition.index()].primary;
        println!("{} → partition {} ({})", key, partition.to_string().bold(), primary);
    }
    Ok(())
}

fn print_stats(data: &DataAccess) {
    for stats in data.registry().stats() {
        let p = stats.primary;
        print!(
            "partition {}: primary {}/{} idle, {} out",
            stats.partition, p.idle, p.capacity, p.checked_out
        );
        match stats.replica {
            Some(r) => println!(", replica {}/{} idle, {} out", r.idle, r.capacity, r.checked_out),
            None => println!(", no replica"),
        }
    }
}

fn record_from_json(key: &Key, raw: &str) -> anyhow::Result<Record> {
    let mut value: Value = serde_json::from_str(raw).context("--json is not valid JSON")?;
    let Value::Object(fields) = &mut value else {
        bail!("--json must be a JSON object");
    };
    if !fields.contains_key("id") {
        fields.insert("id".to_string(), serde_json::to_value(key)?);
    }
    Ok(Record::from_json(value)?)
}

fn record_from_attrs(key: &Key, attrs: &[String]) -> anyhow::Result<Record> {
    let mut record = Record::new(key.clone());
    for attr in attrs {
        let Some((name, raw)) = attr.split_once('=') else {
            bail!("attribute {:?} is not NAME=VALUE", attr);
        };
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        record = record.with(name, value);
    }
    Ok(record)
}
