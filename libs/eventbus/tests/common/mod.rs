//! Shared helpers for event bus integration tests

#![allow(dead_code)]

use eventbus::{ActorSystem, BusConfig, Completion, MessageConsumer, Result, Verticle, VerticleContext};
use std::time::Duration;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn system(pool_size: usize) -> ActorSystem {
    ActorSystem::new(BusConfig {
        pool_size,
        ..BusConfig::default()
    })
    .expect("actor system")
}

pub fn node(node_id: &str, pool_size: usize) -> ActorSystem {
    ActorSystem::new(BusConfig {
        pool_size,
        node_id: node_id.to_string(),
        ..BusConfig::default()
    })
    .expect("actor system")
}

/// Wait until the consumer has been advertised
pub async fn registered(consumer: &MessageConsumer) {
    let (tx, rx) = tokio::sync::oneshot::channel();
    consumer.completion_handler(move |r| {
        let _ = tx.send(r);
    });
    tokio::time::timeout(WAIT, rx)
        .await
        .expect("registration timed out")
        .expect("registration callback dropped")
        .expect("registration failed");
}

/// Poll `condition` until it holds or `WAIT` elapses
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Complete `done` once `consumer` is registered
pub fn complete_when_registered(consumer: Result<MessageConsumer>, done: Completion) {
    match consumer {
        Ok(consumer) => consumer.completion_handler(move |r| done.resolve(r)),
        Err(e) => done.resolve(Err(e)),
    }
}

/// Replies to every request on `address` with the body it received
pub struct Echo {
    pub address: &'static str,
}

impl Verticle for Echo {
    fn start(&mut self, ctx: &VerticleContext, done: Completion) {
        let consumer = ctx.bus().consumer(self.address, |msg| {
            msg.reply(msg.body().clone())?;
            Ok(())
        });
        complete_when_registered(consumer, done);
    }
}
