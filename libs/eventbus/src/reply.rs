//! Reply correlation
//!
//! Every request owns a [`PendingReply`]: a one-shot handler, the private
//! reply consumer registered on the sender's context and the timeout timer on
//! that same context. Exactly one of reply, timeout or no-handlers completes
//! it; the other two find the handler already taken and do nothing.
//!
//! ```text
//! request ─▶ PendingReply ──┬── reply consumer fires ──┐
//!                           ├── timer expires ─────────┼─▶ complete() (first wins)
//!                           └── no handlers ───────────┘
//! ```

use crate::context::TimerHandle;
use crate::error::{BusError, Result};
use crate::message::{Address, Message};
use crate::registry::{AddressRegistry, ConsumerHandle};
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::trace;

/// One-shot reply handler
pub type ReplyHandler = Box<dyn FnOnce(Result<Message>) + Send + 'static>;

/// State of one outstanding request
pub(crate) struct PendingReply {
    target: Address,
    reply_address: Address,
    timeout: Duration,
    started: Instant,
    handler: Mutex<Option<ReplyHandler>>,
    timer: Mutex<Option<TimerHandle>>,
    consumer: Mutex<Option<Arc<ConsumerHandle>>>,
}

impl PendingReply {
    pub(crate) fn new(
        target: Address,
        reply_address: Address,
        timeout: Duration,
        handler: ReplyHandler,
    ) -> Self {
        Self {
            target,
            reply_address,
            timeout,
            started: Instant::now(),
            handler: Mutex::new(Some(handler)),
            timer: Mutex::new(None),
            consumer: Mutex::new(None),
        }
    }

    pub(crate) fn target(&self) -> &Address {
        &self.target
    }

    pub(crate) fn reply_address(&self) -> &Address {
        &self.reply_address
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn attach_consumer(&self, consumer: Arc<ConsumerHandle>) {
        *self.consumer.lock() = Some(consumer);
    }

    pub(crate) fn attach_timer(&self, timer: TimerHandle) {
        if self.is_completed() {
            timer.cancel();
        } else {
            *self.timer.lock() = Some(timer);
        }
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.handler.lock().is_none()
    }

    /// Error reported when the timer wins
    pub(crate) fn timeout_error(&self) -> BusError {
        BusError::reply_timeout(self.target.as_str(), self.timeout.as_millis() as u64)
    }

    /// Settle the request; returns false if it was already settled
    pub(crate) fn complete(&self, registry: &AddressRegistry, outcome: Result<Message>) -> bool {
        let handler = self.handler.lock().take();
        let Some(handler) = handler else {
            trace!(
                reply_address = %self.reply_address,
                "Request already settled; outcome ignored"
            );
            return false;
        };

        if let Some(timer) = self.timer.lock().take() {
            timer.cancel();
        }
        if let Some(consumer) = self.consumer.lock().take() {
            registry.unregister(&consumer);
        }

        trace!(
            address = %self.target,
            elapsed_us = self.started.elapsed().as_micros() as u64,
            ok = outcome.is_ok(),
            "Request settled"
        );
        handler(outcome);
        true
    }
}

/// Future returned by [`crate::EventBus::request`]
#[derive(Debug)]
pub struct ReplyFuture {
    state: ReplyState,
}

#[derive(Debug)]
enum ReplyState {
    Failed(Option<BusError>),
    Waiting(oneshot::Receiver<Result<Message>>),
}

impl ReplyFuture {
    pub(crate) fn waiting(receiver: oneshot::Receiver<Result<Message>>) -> Self {
        Self {
            state: ReplyState::Waiting(receiver),
        }
    }

    pub(crate) fn failed(error: BusError) -> Self {
        Self {
            state: ReplyState::Failed(Some(error)),
        }
    }
}

impl Future for ReplyFuture {
    type Output = Result<Message>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            ReplyState::Failed(error) => Poll::Ready(Err(error
                .take()
                .unwrap_or_else(|| BusError::system("ReplyFuture polled after completion")))),
            ReplyState::Waiting(receiver) => Pin::new(receiver).poll(cx).map(|received| {
                received.unwrap_or_else(|_| {
                    Err(BusError::system(
                        "Reply handler dropped before the request settled",
                    ))
                })
            }),
        }
    }
}
