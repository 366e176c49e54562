//! Topic Repository CLI
//!
//! Command line access to a topic repository backed by a Kafka cluster:
//! topic administration, publishing, partition reads and cursor checks.

use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use topic_repository_core::config::{LoggingConfig, RepositoryConfig};
use topic_repository_core::log::StaticEndpoints;
use topic_repository_core::metrics::RepositoryMetrics;
use topic_repository_core::{
    BatchItem, CapacityHint, Cursor, InitialPosition, KafkaLogClient, Partition, RepositoryError,
    TopicRepository, TopicSpec,
};

/// Topic and cursor repository over Kafka.
#[derive(Parser)]
#[command(name = "topic-repo")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file.
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Override bootstrap servers (comma-separated host:port list).
    #[arg(long)]
    bootstrap_servers: Option<String>,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print collected metrics in Prometheus text format on exit.
    #[arg(long)]
    metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List topic names.
    Topics,

    /// Create a topic sized from an optional capacity hint.
    Create {
        name: String,

        /// Retention time in milliseconds.
        #[arg(long)]
        retention_ms: i64,

        #[arg(long, default_value_t = 0)]
        read_parallelism: u32,

        #[arg(long, default_value_t = 0)]
        write_parallelism: u32,

        #[arg(long, default_value_t = 0)]
        messages_per_minute: u64,

        #[arg(long, default_value_t = 0)]
        avg_message_size_bytes: u64,
    },

    /// Trigger deletion of a topic.
    Delete { name: String },

    /// List partitions and offset ranges of one or more topics.
    Partitions {
        #[arg(required = true)]
        topics: Vec<String>,
    },

    /// Show one partition of a topic.
    Partition { topic: String, partition: String },

    /// Show read positions at the beginning or end of every partition.
    Positions {
        topic: String,

        /// Where readers start: begin or end.
        #[arg(long, default_value = "end")]
        from: InitialPosition,
    },

    /// Publish events to one partition.
    Publish {
        topic: String,

        #[arg(short, long)]
        partition: String,

        #[arg(required = true)]
        events: Vec<String>,
    },

    /// Validate read cursors given as partition:offset.
    Validate {
        topic: String,

        #[arg(required = true, value_parser = parse_cursor)]
        cursors: Vec<Cursor>,
    },

    /// Validate commit cursors given as partition:offset.
    ValidateCommit {
        topic: String,

        #[arg(required = true, value_parser = parse_cursor)]
        cursors: Vec<Cursor>,
    },

    /// Show where readers resume for cursors given as partition:offset.
    ReadStart {
        topic: String,

        #[arg(required = true, value_parser = parse_cursor)]
        cursors: Vec<Cursor>,
    },
}

fn parse_cursor(s: &str) -> Result<Cursor, String> {
    let (partition, offset) = s
        .split_once(':')
        .ok_or_else(|| format!("bad cursor '{s}', expected partition:offset"))?;
    Ok(Cursor::new(partition, offset))
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = RepositoryConfig::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config))?;

    // Apply CLI overrides
    if let Some(servers) = &args.bootstrap_servers {
        config.kafka.bootstrap_servers = servers.split(',').map(|s| s.trim().to_string()).collect();
        config.validate()?;
    }

    // Override log level from verbosity flag
    let log_config = match args.verbose {
        0 => config.logging.clone(),
        1 => LoggingConfig {
            level: "debug".to_string(),
            ..config.logging.clone()
        },
        _ => LoggingConfig {
            level: "trace".to_string(),
            ..config.logging.clone()
        },
    };

    setup_tracing(&log_config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        bootstrap_servers = ?config.kafka.bootstrap_servers(),
        "starting topic repository"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move { run(config, args.command, args.metrics).await })
}

fn setup_tracing(config: &LoggingConfig) {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // Logs go to stderr so command output stays pipeable
    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

async fn run(config: RepositoryConfig, command: Command, print_metrics: bool) -> anyhow::Result<()> {
    let client = Arc::new(KafkaLogClient::from_config(&config));
    let endpoints = Arc::new(StaticEndpoints::new(config.kafka.connection_string()));
    let metrics = Arc::new(RepositoryMetrics::new());

    let mut repository = TopicRepository::new(client, endpoints, &config);
    if config.metrics.enabled {
        repository = repository.with_metrics(Arc::clone(&metrics));
    }

    let result = execute(&repository, command).await;
    repository.close();

    if print_metrics {
        print!("{}", metrics.encode()?);
    }
    result
}

async fn execute(repository: &TopicRepository<KafkaLogClient>, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Topics => {
            for topic in repository.list_topics().await? {
                println!("{topic}");
            }
        }
        Command::Create {
            name,
            retention_ms,
            read_parallelism,
            write_parallelism,
            messages_per_minute,
            avg_message_size_bytes,
        } => {
            let hint = CapacityHint {
                read_parallelism,
                write_parallelism,
                messages_per_minute,
                avg_message_size_bytes,
            };
            let mut spec = TopicSpec::new(name.as_str(), retention_ms);
            if hint != CapacityHint::default() {
                spec = spec.with_capacity_hint(hint);
            }
            repository.create_topic(&spec).await?;
            println!("created {name}");
        }
        Command::Delete { name } => {
            repository.delete_topic(&name).await?;
            println!("deletion of {name} triggered");
        }
        Command::Partitions { topics } => {
            let partitions = if let [topic] = topics.as_slice() {
                repository.list_partitions(topic).await?
            } else {
                repository.list_partitions_for(&topics).await?
            };
            for partition in &partitions {
                print_partition(partition);
            }
        }
        Command::Partition { topic, partition } => {
            print_partition(&repository.get_partition(&topic, &partition).await?);
        }
        Command::Positions { topic, from } => {
            for (partition, offset) in repository.materialize_positions(&topic, from).await? {
                println!("{partition}\t{offset}");
            }
        }
        Command::Publish {
            topic,
            partition,
            events,
        } => {
            let mut batch: Vec<BatchItem> = events
                .into_iter()
                .map(|event| BatchItem::new(event).with_partition(partition.as_str()))
                .collect();
            let result = repository.publish(&topic, &mut batch).await;
            for (n, item) in batch.iter().enumerate() {
                if item.detail().is_empty() {
                    println!("{n}\t{}", item.status());
                } else {
                    println!("{n}\t{}\t{}", item.status(), item.detail());
                }
            }
            result?;
        }
        Command::Validate { topic, cursors } => {
            report_validation(repository.validate_cursors(&topic, &cursors).await)?;
        }
        Command::ValidateCommit { topic, cursors } => {
            report_validation(repository.validate_commit_cursors(&topic, &cursors).await)?;
        }
        Command::ReadStart { topic, cursors } => {
            let starts = repository.read_start_positions(&topic, &cursors).await?;
            for start in starts {
                println!("{}\t{}", start.partition, start.offset);
            }
        }
    }
    Ok(())
}

fn print_partition(partition: &Partition) {
    println!(
        "{}\t{}\t{}\t{}",
        partition.topic,
        partition.partition_id,
        partition.oldest_available_offset,
        partition.newest_available_offset
    );
}

fn report_validation(result: Result<(), RepositoryError>) -> anyhow::Result<()> {
    match result {
        Ok(()) => {
            println!("ok");
            Ok(())
        }
        Err(RepositoryError::InvalidCursor { kind, cursor }) => {
            bail!("cursor {cursor} rejected: {kind}")
        }
        Err(e) => Err(e.into()),
    }
}
