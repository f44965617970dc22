//! Event bus saturation benchmark
//!
//! Usage:
//!   bus-bench send-reply --consumers 32 --senders 32 --seconds 10
//!   bus-bench send-reply --remote            (senders and consumers on two nodes)
//!   bus-bench run-on-context --verticles 32 --seconds 10
//!
//! Every sender keeps exactly one request in flight and issues the next one
//! from its reply handler; run-on-context verticles resubmit an empty task
//! forever. Per-context statistics are printed at the end.

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use eventbus::{
    ActorSystem, BusConfig, BytesCodec, Completion, ContextStats, DeliveryOptions, EventBus,
    InProcessCluster, Verticle, VerticleContext,
};
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SEND_REPLY_ADDRESS: &str = "testSendAndReply";

#[derive(Parser, Debug)]
#[command(name = "bus-bench")]
#[command(about = "Event bus send/reply and run-on-context saturation benchmark")]
#[command(version)]
struct Args {
    /// Optional bus configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Context pool size (overrides configuration)
    #[arg(long)]
    pool_size: Option<usize>,

    /// Log filter, e.g. `info` or `eventbus=debug`
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging format
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    scenario: Scenario,
}

#[derive(Subcommand, Debug)]
enum Scenario {
    /// Senders request and consumers reply as fast as possible
    SendReply {
        #[arg(long, default_value_t = 32)]
        consumers: usize,

        #[arg(long, default_value_t = 32)]
        senders: usize,

        #[arg(long, default_value_t = 10)]
        seconds: u64,

        /// Put consumers on a second in-process cluster node
        #[arg(long)]
        remote: bool,
    },
    /// Verticles resubmit an empty task to their own context forever
    RunOnContext {
        #[arg(long, default_value_t = 32)]
        verticles: usize,

        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },
}

/// Replies with an empty body to every message
struct ReplyingConsumer;

impl Verticle for ReplyingConsumer {
    fn start(&mut self, ctx: &VerticleContext, done: Completion) {
        let consumer = ctx.bus().consumer(SEND_REPLY_ADDRESS, |msg| {
            msg.reply(())?;
            Ok(())
        });
        match consumer {
            Ok(consumer) => consumer.completion_handler(move |r| done.resolve(r)),
            Err(e) => done.resolve(Err(e)),
        }
    }
}

/// Keeps one request in flight, sending the next from the reply handler
struct Sender {
    replies: Arc<AtomicU64>,
    failures: Arc<AtomicU64>,
}

impl Sender {
    fn pump(bus: EventBus, replies: Arc<AtomicU64>, failures: Arc<AtomicU64>) {
        let next_bus = bus.clone();
        let sent = bus.send_with_reply(
            SEND_REPLY_ADDRESS,
            vec![0u8; 16],
            DeliveryOptions::default(),
            move |reply| {
                match reply {
                    Ok(_) => replies.fetch_add(1, Ordering::Relaxed),
                    Err(_) => failures.fetch_add(1, Ordering::Relaxed),
                };
                Sender::pump(next_bus, replies, failures);
            },
        );
        if let Err(e) = sent {
            warn!(error = %e, "Sender stopped");
        }
    }
}

impl Verticle for Sender {
    fn start(&mut self, ctx: &VerticleContext, done: Completion) {
        done.complete();
        Sender::pump(ctx.bus().clone(), Arc::clone(&self.replies), Arc::clone(&self.failures));
    }
}

/// Resubmits an empty task to its own context until the context closes
struct Spinner {
    iterations: Arc<AtomicU64>,
}

impl Verticle for Spinner {
    fn start(&mut self, ctx: &VerticleContext, done: Completion) {
        done.complete();
        let iterations = Arc::clone(&self.iterations);
        let spinning = ctx.context().run_repeatedly(move || {
            iterations.fetch_add(1, Ordering::Relaxed);
            ControlFlow::Continue(())
        });
        if let Err(e) = spinning {
            warn!(error = %e, "Spinner could not start");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    let mut config = match &args.config {
        Some(path) => BusConfig::load(Some(path.as_path()), None)?,
        None => bus_config::load_config(None)?,
    };
    if let Some(pool_size) = args.pool_size {
        config.pool_size = pool_size;
    }

    match args.scenario {
        Scenario::SendReply {
            consumers,
            senders,
            seconds,
            remote,
        } => send_reply(config, consumers, senders, Duration::from_secs(seconds), remote).await,
        Scenario::RunOnContext { verticles, seconds } => {
            run_on_context(config, verticles, Duration::from_secs(seconds)).await
        }
    }
}

async fn send_reply(
    config: BusConfig,
    consumers: usize,
    senders: usize,
    window: Duration,
    remote: bool,
) -> Result<()> {
    let sender_node = ActorSystem::new(BusConfig {
        node_id: "node-a".to_string(),
        ..config.clone()
    })?;
    let consumer_node = if remote {
        let node = ActorSystem::new(BusConfig {
            node_id: "node-b".to_string(),
            ..config
        })?;
        let cluster = InProcessCluster::new(Arc::new(BytesCodec));
        cluster.join(sender_node.event_bus());
        cluster.join(node.event_bus());
        info!(nodes = ?cluster.node_ids(), "Consumers deployed on a remote node");
        node
    } else {
        sender_node.clone()
    };

    for _ in 0..consumers {
        consumer_node
            .deploy_verticle(ReplyingConsumer)
            .await
            .context("Failed to deploy consumer")?;
    }

    let replies = Arc::new(AtomicU64::new(0));
    let failures = Arc::new(AtomicU64::new(0));
    for _ in 0..senders {
        sender_node
            .deploy_verticle(Sender {
                replies: Arc::clone(&replies),
                failures: Arc::clone(&failures),
            })
            .await
            .context("Failed to deploy sender")?;
    }
    info!(consumers, senders, seconds = window.as_secs(), "Send/reply running");

    let started = Instant::now();
    tokio::time::sleep(window).await;
    let elapsed = started.elapsed();
    let total = replies.load(Ordering::Relaxed);

    println!(
        "send-reply: {} replies in {:.2?} ({:.0} req/s), {} failures",
        total,
        elapsed,
        total as f64 / elapsed.as_secs_f64(),
        failures.load(Ordering::Relaxed)
    );
    println!("{:?}", sender_node.event_bus().stats());
    display_context_stats(&sender_node.stats().contexts);
    if remote {
        display_context_stats(&consumer_node.stats().contexts);
        consumer_node.shutdown().await?;
    }
    sender_node.shutdown().await?;
    Ok(())
}

async fn run_on_context(config: BusConfig, verticles: usize, window: Duration) -> Result<()> {
    let system = ActorSystem::new(config)?;
    let iterations = Arc::new(AtomicU64::new(0));

    for _ in 0..verticles {
        system
            .deploy_verticle(Spinner {
                iterations: Arc::clone(&iterations),
            })
            .await
            .context("Failed to deploy spinner")?;
    }
    info!(verticles, seconds = window.as_secs(), "Run-on-context running");

    let started = Instant::now();
    tokio::time::sleep(window).await;
    let elapsed = started.elapsed();
    let total = iterations.load(Ordering::Relaxed);

    println!(
        "run-on-context: {} tasks in {:.2?} ({:.0} tasks/s)",
        total,
        elapsed,
        total as f64 / elapsed.as_secs_f64()
    );
    display_context_stats(&system.stats().contexts);
    system.shutdown().await?;
    Ok(())
}

fn display_context_stats(contexts: &[ContextStats]) {
    for stats in contexts {
        println!(
            "Context:{:>28} executed:{:>12} discarded:{:>8} panics:{:>3} busy:{:>8} msec pending:{:>8}",
            stats.name,
            stats.tasks_executed,
            stats.tasks_discarded,
            stats.panics,
            stats.busy_time.as_millis(),
            stats.pending()
        );
    }
}

fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .context("Invalid log filter")?;

    if args.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    Ok(())
}
