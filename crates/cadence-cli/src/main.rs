use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use clap::{Parser, Subcommand, ValueEnum};
use rand::Rng;
use tracing::{error, info, warn};

use cadence_core::impls::RedisStore;
use cadence_core::ports::Store;
use cadence_core::{
    CadenceConfig, Coordinator, HandlerError, HandlerRegistry, Limit, Schedule, Scheduler,
    TaskHandler, TaskId, TaskRecord, TaskSpec, TrackingList, WorkerGroup,
};

#[derive(Parser)]
#[command(name = "cadence")]
#[command(about = "Task scheduler and worker runtime on Redis")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drain a queue with the demo handler
    Worker {
        #[arg(short, long)]
        queue: Option<String>,

        /// Worker loops to run against the queue
        #[arg(short, long, default_value_t = 1)]
        concurrency: usize,

        /// Probability (0..=1) that the demo handler fails an attempt
        #[arg(long, default_value_t = 0.0)]
        fail_rate: f64,
    },
    /// Listen for expired triggers and re-enqueue delayed tasks until Ctrl-C
    Schedule,
    /// Submit a task
    Add {
        /// JSON payload
        #[arg(short, long, default_value = "null")]
        data: String,

        #[arg(long)]
        id: Option<String>,

        #[arg(short, long)]
        queue: Option<String>,

        /// Fixed delay in milliseconds, or a cron expression
        #[arg(short, long)]
        schedule: Option<String>,

        /// Number, or -1 for unbounded
        #[arg(long, allow_hyphen_values = true)]
        max_runs: Option<Limit>,

        /// Number, or -1 for unbounded
        #[arg(long, allow_hyphen_values = true)]
        max_tries: Option<Limit>,
    },
    /// Print a stored record
    Get { id: String },
    /// Deactivate a task and delete its record
    Delete { id: String },
    /// Put a task stuck on the active list back on its queue
    Rescue { id: String },
    /// Rescue or drop everything on the active list
    Purge,
    /// Show a tracking list
    List {
        list: ListArg,

        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        start: isize,

        #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
        stop: isize,
    },
    /// Show tracking list sizes
    Counts,
}

#[derive(Clone, Copy, ValueEnum)]
enum ListArg {
    Active,
    Failed,
    Completed,
    Ids,
    Quarantine,
}

impl From<ListArg> for TrackingList {
    fn from(arg: ListArg) -> Self {
        match arg {
            ListArg::Active => TrackingList::Active,
            ListArg::Failed => TrackingList::Failed,
            ListArg::Completed => TrackingList::Completed,
            ListArg::Ids => TrackingList::Ids,
            ListArg::Quarantine => TrackingList::Quarantine,
        }
    }
}

/// Logs the payload and fails with a fixed probability.
struct DemoHandler {
    fail_rate: f64,
}

#[async_trait]
impl TaskHandler for DemoHandler {
    async fn handle(&self, task: &TaskRecord) -> Result<(), HandlerError> {
        info!(task_id = ?task.id(), runs = task.runs(), data = %task.data, "handling task");
        if rand::thread_rng().gen_bool(self.fail_rate) {
            return Err(HandlerError::new("simulated failure"));
        }
        Ok(())
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var("CADENCE_LOG").unwrap_or_else(|_| "info".to_string());
        tracing_subscriber::EnvFilter::new(level)
    });
    let json = std::env::var("CADENCE_LOG_JSON").is_ok_and(|v| v.eq_ignore_ascii_case("true"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = CadenceConfig::from_env().context("invalid configuration")?;
    let store: Arc<dyn Store> = Arc::new(
        RedisStore::from_config(&config)
            .await
            .context("could not connect to redis")?,
    );

    match cli.command {
        Commands::Worker {
            queue,
            concurrency,
            fail_rate,
        } => run_workers(store, config, queue, concurrency, fail_rate).await,
        Commands::Schedule => run_scheduler(store, config).await,
        command => {
            let scheduler = Scheduler::new(store, config).await?;
            let result = admin(&scheduler, command).await;
            scheduler.shutdown();
            result
        }
    }
}

async fn run_workers(
    store: Arc<dyn Store>,
    config: CadenceConfig,
    queue: Option<String>,
    concurrency: usize,
    fail_rate: f64,
) -> Result<()> {
    if !(0.0..=1.0).contains(&fail_rate) {
        bail!("--fail-rate must be within [0, 1], got {fail_rate}");
    }
    let queue = queue.unwrap_or_else(|| config.default_queue.clone());

    // workers only consume; the scheduler process owns the expiration listener
    let coordinator = Arc::new(Coordinator::new(store, config));
    let mut registry = HandlerRegistry::new();
    registry.register(queue.as_str(), Arc::new(DemoHandler { fail_rate }))?;

    let mut group = WorkerGroup::spawn(coordinator, Arc::new(registry), concurrency)?;
    info!(queue = %queue, concurrency, "workers running");

    let exit = tokio::select! {
        _ = tokio::signal::ctrl_c() => None,
        exit = group.next_exit() => Some(exit),
    };

    match exit {
        None => {
            info!("shutdown requested");
            let counters = group.shutdown_and_join().await?;
            info!(
                runs = counters.runs,
                errors = counters.errors,
                failed = counters.failed,
                "workers stopped"
            );
            Ok(())
        }
        Some(Some(Err(e))) => {
            error!(error = %e, "worker lost the store");
            Err(e.into())
        }
        Some(_) => bail!("worker exited unexpectedly"),
    }
}

async fn run_scheduler(store: Arc<dyn Store>, config: CadenceConfig) -> Result<()> {
    let mut scheduler = Scheduler::new(store, config).await?;
    let mut events = scheduler.subscribe();
    info!("scheduler running");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            stopped = scheduler.listener_stopped() => {
                let cause = match stopped {
                    Ok(()) => anyhow::anyhow!("expiration listener stopped"),
                    Err(e) => anyhow::Error::new(e).context("expiration listener stopped"),
                };
                error!(error = %cause, "scheduler can no longer re-enqueue delayed tasks");
                return Err(cause);
            }
            event = events.recv() => match event {
                Ok(event) => info!(
                    event = event.name(),
                    task_id = ?event.task().and_then(TaskRecord::id),
                    "task event"
                ),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "event stream lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    scheduler.shutdown();
    Ok(())
}

async fn admin(scheduler: &Scheduler, command: Commands) -> Result<()> {
    match command {
        Commands::Add {
            data,
            id,
            queue,
            schedule,
            max_runs,
            max_tries,
        } => {
            let data: serde_json::Value =
                serde_json::from_str(&data).context("--data is not valid JSON")?;
            let mut spec = TaskSpec::new(data);
            spec.id = id.map(TaskId::new);
            spec.queue = queue;
            spec.max_runs = max_runs;
            spec.max_tries = max_tries;
            if let Some(schedule) = schedule {
                spec.schedule = parse_schedule(&schedule);
            }

            let task = scheduler.add_task(spec).await?;
            print_record(&task)?;
        }
        Commands::Get { id } => match scheduler.get_task(&TaskId::new(id.as_str())).await? {
            Some(task) => print_record(&task)?,
            None => bail!("no task {id}"),
        },
        Commands::Delete { id } => {
            if scheduler.delete_task(&TaskId::new(id.as_str())).await?.is_none() {
                warn!(task_id = %id, "no record; cleared tracking entries only");
            }
            println!("deleted {id}");
        }
        Commands::Rescue { id } => match scheduler.rescue_task(&TaskId::new(id.as_str())).await? {
            Some(task) => print_record(&task)?,
            None => bail!("no task {id}"),
        },
        Commands::Purge => {
            let report = scheduler.purge_tasks().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::List { list, start, stop } => {
            let list = TrackingList::from(list);
            for entry in scheduler.coordinator().list_range(list, start, stop).await? {
                println!("{entry}");
            }
        }
        Commands::Counts => {
            let counts = scheduler.counts().await?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
        }
        Commands::Worker { .. } | Commands::Schedule => {
            bail!("long-running commands need their own process")
        }
    }
    Ok(())
}

/// `5000` is a fixed delay, anything else a cron expression.
fn parse_schedule(raw: &str) -> Schedule {
    match raw.trim().parse::<u64>() {
        Ok(ms) => Schedule::Delay(ms),
        Err(_) => Schedule::Cron(raw.trim().to_string()),
    }
}

fn print_record(task: &TaskRecord) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(&task.serialize()?)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
