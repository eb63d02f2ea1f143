mod handlers;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use chrono::Duration as ChronoDuration;
use clap::{Parser, Subcommand};
use drover_core::broker::{AgingPolicy, Broker, PriorityAgingBroker, QueueBroker};
use drover_core::config::{BrokerStrategy, DroverConfig, StoreKind};
use drover_core::impls::{MemoryStore, open_store};
use drover_core::ports::{Clock, ManualClock, SystemClock, UlidGenerator};
use drover_core::worker::WorkerPoolBuilder;
use drover_core::{Priority, Producer, WorkerPool};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::handlers::{EchoHandler, SendEmailHandler};

#[derive(Parser, Debug)]
#[command(name = "drover")]
#[command(about = "Priority-aging task broker and worker pool", long_about = None)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(long, global = true, env = "DROVER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a worker pool until Ctrl-C
    Worker {
        /// Number of concurrent consumers
        #[arg(short, long)]
        concurrency: Option<usize>,

        /// fifo | priority_aging
        #[arg(long)]
        strategy: Option<BrokerStrategy>,

        /// Worker pool id (used in consumer names)
        #[arg(long)]
        id: Option<String>,
    },

    /// Enqueue one task and print its id
    Submit {
        #[arg(long = "type")]
        task_type: String,

        /// low | medium | high | <integer>
        #[arg(long, default_value = "medium")]
        priority: Priority,

        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,
    },

    /// Show aging order in one process with a simulated clock
    Demo {
        /// Seconds the low-priority tasks wait before the high ones arrive
        #[arg(long, default_value_t = 120)]
        wait_secs: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = match &cli.config {
        Some(path) => DroverConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => DroverConfig::default(),
    };

    match cli.command {
        Command::Worker {
            concurrency,
            strategy,
            id,
        } => {
            let mut config = config;
            if let Some(n) = concurrency {
                config.worker.concurrency = n;
            }
            if let Some(s) = strategy {
                config.broker.strategy = s;
            }
            if let Some(id) = id {
                config.worker.id = id;
            }
            config.validate()?;
            run_worker(config).await
        }
        Command::Submit {
            task_type,
            priority,
            payload,
        } => submit(config, task_type, priority, payload).await,
        Command::Demo { wait_secs } => demo(wait_secs).await,
    }
}

fn register_demo_handlers(builder: WorkerPoolBuilder) -> anyhow::Result<WorkerPoolBuilder> {
    Ok(builder
        .register_task(
            "send_email",
            Arc::new(SendEmailHandler::new(Duration::from_millis(200))),
        )?
        .register_task("echo", Arc::new(EchoHandler))?)
}

async fn run_worker(config: DroverConfig) -> anyhow::Result<()> {
    if config.store.kind == StoreKind::Memory {
        warn!("memory store: only tasks submitted by this process are visible");
    }

    let shutdown = CancellationToken::new();
    let store = open_store(&config.store)
        .await
        .context("connecting to the task store")?;
    let broker: Arc<dyn Broker> = Arc::new(QueueBroker::from_config(
        &config.broker,
        config.store.collection.clone(),
        store,
        Arc::new(SystemClock),
        &shutdown,
    ));

    let pool = register_demo_handlers(WorkerPoolBuilder::from_config(
        &config.worker,
        broker.clone(),
    ))?
    .build();
    info!(
        strategy = %config.broker.strategy,
        task_types = ?pool.registry().task_types(),
        "registered handlers"
    );

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            tokio::signal::ctrl_c().await.ok();
            info!("received shutdown signal");
            shutdown.cancel();
        }
    });

    let report = pool.start(shutdown).await;
    broker.close().await?;
    println!(
        "completed={} failed={} dropped={} aborted={}",
        report.counts.completed, report.counts.failed, report.counts.dropped, report.aborted
    );
    Ok(())
}

async fn submit(
    config: DroverConfig,
    task_type: String,
    priority: Priority,
    payload: String,
) -> anyhow::Result<()> {
    if config.store.kind == StoreKind::Memory {
        bail!("submit needs a shared store; set store.kind: redis in the config");
    }
    serde_json::from_str::<serde_json::Value>(&payload).context("payload must be valid JSON")?;

    let store = open_store(&config.store)
        .await
        .context("connecting to the task store")?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    // running workers keep the collection aged
    let broker: Arc<dyn Broker> = Arc::new(QueueBroker::for_producer(
        &config.broker,
        config.store.collection.clone(),
        store,
        clock.clone(),
    ));
    let producer = Producer::new(
        broker.clone(),
        clock.clone(),
        Arc::new(UlidGenerator::new(clock)),
    );

    let id = producer.submit(task_type, priority, payload).await?;
    broker.close().await?;
    println!("{id}");
    Ok(())
}

/// Low tasks wait `wait_secs` on a simulated clock, then high tasks arrive.
/// With the default factor 0.1 a low task outranks a fresh high one after 90 s.
async fn demo(wait_secs: i64) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let clock = Arc::new(ManualClock::new(SystemClock.now()));
    let broker = Arc::new(PriorityAgingBroker::start(
        Arc::new(MemoryStore::new()),
        "demo",
        AgingPolicy::default(),
        clock.clone(),
        &shutdown,
    ));
    let producer = Producer::new(
        broker.clone(),
        clock.clone(),
        Arc::new(UlidGenerator::new(clock.clone())),
    );

    for n in 0..3 {
        producer
            .submit("echo", Priority::LOW, format!("low #{n}"))
            .await?;
    }
    clock.advance(ChronoDuration::seconds(wait_secs));
    for n in 0..3 {
        producer
            .submit("echo", Priority::HIGH, format!("high #{n}"))
            .await?;
    }
    broker.rescore_now().await?;

    for (task, score) in broker.ranking().await? {
        println!(
            "{:>8.2}  {:<6}  {}",
            score,
            task.priority().to_string(),
            String::from_utf8_lossy(task.payload())
        );
    }

    // 1 本だけで回すと処理順 = ranking 順になる
    let pool = Arc::new(
        register_demo_handlers(WorkerPool::builder("demo", broker.clone()).concurrency(1))?
            .build(),
    );
    let run = tokio::spawn({
        let pool = pool.clone();
        let cancel = shutdown.clone();
        async move { pool.start(cancel).await }
    });

    let board = pool.status_board();
    tokio::time::timeout(Duration::from_secs(10), async {
        while board.counts().completed < 6 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .context("demo tasks did not finish")?;

    shutdown.cancel();
    let report = run.await?;
    broker.close().await?;
    println!("completed={}", report.counts.completed);
    Ok(())
}
