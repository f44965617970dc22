//! Context-Confined Event Bus
//!
//! Asynchronous addressed messaging between verticles. Every verticle runs
//! on exactly one single-threaded context, so its handlers never race with
//! each other. Bodies travel between local consumers as `Arc<dyn Any>`; a
//! codec is only involved when an envelope crosses to another node.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  deploy   ┌────────────────────┐
//! │ Deployment   │──────────▶│   Context Pool     │
//! │ Manager      │  assign   │ ctx-0 ctx-1 … ctx-N│
//! └──────┬───────┘           └─────────▲──────────┘
//!        │ start/stop                  │ enqueue delivery
//!        ▼                             │
//! ┌──────────────┐  resolve  ┌─────────┴──────────┐
//! │  Verticles   │──────────▶│     Event Bus      │──▶ Cluster Gateway
//! │ (consumers)  │  send/pub │  Address Registry  │    (no local consumer)
//! └──────────────┘           └────────────────────┘
//! ```
//!
//! # Delivery Semantics
//!
//! - **send**: exactly one consumer, round robin in registration order
//! - **publish**: every active consumer of the address
//! - **request**: send plus a reply handler on the sender's context,
//!   failing with `NO_HANDLERS`, `REPLY_TIMEOUT` or `HANDLER_FAILURE`
//! - At most once per hop; FIFO per context; no ordering across addresses
//!
//! # Examples
//!
//! ```rust,no_run
//! use eventbus::{ActorSystem, BusConfig, Completion, Verticle, VerticleContext};
//! use std::time::Duration;
//!
//! struct Pong;
//!
//! impl Verticle for Pong {
//!     fn start(&mut self, ctx: &VerticleContext, done: Completion) {
//!         match ctx.bus().consumer("ping", |msg| {
//!             msg.reply("pong")?;
//!             Ok(())
//!         }) {
//!             Ok(consumer) => consumer.completion_handler(move |r| done.resolve(r)),
//!             Err(e) => done.resolve(Err(e)),
//!         }
//!     }
//! }
//!
//! # async fn demo() -> eventbus::Result<()> {
//! let system = ActorSystem::new(BusConfig::default())?;
//! system.deploy(|| Ok(Pong)).await?;
//!
//! let reply = system.event_bus().request("ping", (), Duration::from_secs(1)).await?;
//! assert_eq!(reply.body().downcast_ref::<String>().map(String::as_str), Some("pong"));
//! system.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod cluster;
pub mod codec;
pub mod context;
pub mod deployment;
pub mod error;
pub mod message;
pub mod metrics;
pub mod pool;
pub mod registry;
pub mod reply;
pub mod system;
pub mod verticle;

pub use bus::{EventBus, MessageConsumer, WeakEventBus};
pub use cluster::{ClusterGateway, InProcessCluster, NoopGateway};
pub use codec::{BincodeCodec, BodyCodec, BytesCodec, JsonCodec};
pub use context::{
    Context, ContextId, ContextState, ContextStats, LiveDeployments, TimerHandle, SCHEDULING_QUANTUM,
};
pub use deployment::{
    DeploymentId, DeploymentInfo, DeploymentManager, DeploymentOptions, DeploymentState,
};
pub use error::{BusError, FailureKind, Result};
pub use message::{Address, Body, DeliveryMode, DeliveryOptions, Envelope, Message};
pub use metrics::{BusMetrics, BusStats};
pub use pool::ContextPool;
pub use registry::{AddressRegistry, ConsumerHandle, ConsumerId, HandlerResult};
pub use reply::ReplyFuture;
pub use system::{ActorSystem, SystemStats};
pub use verticle::{Completion, Verticle, VerticleContext};

pub use bus_config::{AssignmentPolicy, BusConfig};
