//! Point-to-point, publish and request/reply behaviour
//!
//! Covers:
//! - Round-robin selection in registration order
//! - Publish fan-out to every consumer
//! - Immediate NO_HANDLERS and the reply timeout window, under backlog too
//! - Handler failures, panics and double replies
//! - Reply handlers running on the sender's context

mod common;

use common::*;
use eventbus::{Body, BusError, Context, DeliveryOptions, FailureKind};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[tokio::test]
async fn test_round_robin_follows_registration_order() {
    let system = system(3);
    let bus = system.event_bus();
    let seen: Arc<Mutex<Vec<Vec<u64>>>> = Arc::new(Mutex::new(vec![Vec::new(); 3]));

    for slot in 0..3 {
        let seen = Arc::clone(&seen);
        let consumer = bus
            .consumer("rr", move |msg| {
                let n = *msg
                    .body()
                    .downcast_ref::<u64>()
                    .ok_or_else(|| anyhow::anyhow!("expected u64 body"))?;
                seen.lock()[slot].push(n);
                Ok(())
            })
            .unwrap();
        registered(&consumer).await;
    }

    for n in 0..30u64 {
        bus.send("rr", Body::new(n)).unwrap();
    }
    assert!(wait_until(|| seen.lock().iter().map(Vec::len).sum::<usize>() == 30).await);

    let seen = seen.lock().clone();
    for (slot, received) in seen.iter().enumerate() {
        let expected: Vec<u64> = (slot as u64..30).step_by(3).collect();
        assert_eq!(received, &expected, "consumer {}", slot);
    }
    system.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_publish_reaches_every_consumer_in_order() {
    let system = system(2);
    let bus = system.event_bus();
    let received: Arc<Mutex<Vec<Vec<u64>>>> = Arc::new(Mutex::new(vec![Vec::new(); 4]));

    for slot in 0..4 {
        let received = Arc::clone(&received);
        let consumer = bus
            .consumer("fanout", move |msg| {
                if let Some(n) = msg.body().downcast_ref::<u64>() {
                    received.lock()[slot].push(*n);
                }
                Ok(())
            })
            .unwrap();
        registered(&consumer).await;
    }

    for n in 0..10u64 {
        bus.publish("fanout", Body::new(n)).unwrap();
    }
    assert!(wait_until(|| received.lock().iter().all(|r| r.len() == 10)).await);

    let expected: Vec<u64> = (0..10).collect();
    assert!(received.lock().iter().all(|r| *r == expected));
    assert_eq!(bus.stats().publishes, 10);
    assert_eq!(bus.stats().deliveries, 40);
    system.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_publish_without_consumers_is_silent() {
    let system = system(1);
    system.event_bus().publish("nobody", "hello").unwrap();
    assert_eq!(system.event_bus().stats().no_handlers, 0);
    system.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_request_without_consumers_fails_immediately() {
    let system = system(1);
    let started = Instant::now();

    let err = system
        .event_bus()
        .request("nobody", "ping", Duration::from_secs(30))
        .await
        .unwrap_err();

    assert!(err.is(FailureKind::NoHandlers));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(system.event_bus().stats().no_handlers, 1);
    // the private reply consumer does not outlive the failed request
    assert!(wait_until(|| system.event_bus().registry().is_empty()).await);
    system.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_request_times_out_and_late_reply_is_dropped() {
    let system = system(2);
    let bus = system.event_bus();

    let consumer = bus
        .consumer("slow", |msg| {
            let late = msg.clone();
            let context = Context::current().ok_or_else(|| anyhow::anyhow!("not on a context"))?;
            context.set_timer(Duration::from_millis(300), move || {
                let _ = late.reply("too late");
            })?;
            Ok(())
        })
        .unwrap();
    registered(&consumer).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = tokio::sync::oneshot::channel();
    let started = Instant::now();
    let counted = Arc::clone(&calls);
    bus.send_with_reply(
        "slow",
        "ping",
        DeliveryOptions::new().with_timeout(Duration::from_millis(100)),
        move |reply| {
            counted.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(reply);
        },
    )
    .unwrap();

    let err = tokio::time::timeout(WAIT, rx).await.unwrap().unwrap().unwrap_err();
    let waited = started.elapsed();
    assert!(err.is(FailureKind::ReplyTimeout));
    assert!(matches!(err, BusError::ReplyTimeout { timeout_ms: 100, .. }));
    assert!(waited >= Duration::from_millis(100), "fired early: {:?}", waited);

    assert!(wait_until(|| bus.stats().dropped_replies == 1).await);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(bus.stats().reply_timeouts, 1);
    system.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reply_timeout_is_not_delayed_by_queue_backlog() {
    const BACKLOG: usize = 20_000;
    let system = system(1);
    let bus = system.event_bus();

    let consumer = bus.consumer("never.replies", |_| Ok(())).unwrap();
    registered(&consumer).await;

    let drained = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = tokio::sync::oneshot::channel();
    let started = Instant::now();
    let seen = Arc::clone(&drained);
    bus.send_with_reply(
        "never.replies",
        "ping",
        DeliveryOptions::new().with_timeout(Duration::from_millis(100)),
        move |reply| {
            let _ = tx.send((reply, started.elapsed(), seen.load(Ordering::SeqCst)));
        },
    )
    .unwrap();

    // about a second of work queued on the sender's context
    for _ in 0..BACKLOG {
        let drained = Arc::clone(&drained);
        system
            .run_on_context(move || {
                let spin = Instant::now();
                while spin.elapsed() < Duration::from_micros(50) {
                    std::hint::spin_loop();
                }
                drained.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }

    let (reply, waited, drained_at_timeout) = tokio::time::timeout(WAIT, rx).await.unwrap().unwrap();
    assert!(reply.unwrap_err().is(FailureKind::ReplyTimeout));
    assert!(waited >= Duration::from_millis(100), "fired early: {:?}", waited);
    assert!(waited < Duration::from_millis(600), "fired late: {:?}", waited);
    assert!(
        drained_at_timeout < BACKLOG / 2,
        "timeout waited for {} queued tasks",
        drained_at_timeout
    );
    system.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_handler_failures_reach_the_sender_and_context_survives() {
    // one context, so every consumer shares it
    let system = system(1);
    let bus = system.event_bus();

    let failing = bus
        .consumer("fails", |_| Err(anyhow::anyhow!("boom")))
        .unwrap();
    let panicking = bus
        .consumer("panics", |_| -> eventbus::HandlerResult { panic!("kaboom") })
        .unwrap();
    let refusing = bus
        .consumer("refuses", |msg| {
            msg.fail("bad input")?;
            Ok(())
        })
        .unwrap();
    let healthy = bus
        .consumer("healthy", |msg| {
            msg.reply("ok")?;
            Ok(())
        })
        .unwrap();
    for consumer in [&failing, &panicking, &refusing, &healthy] {
        registered(consumer).await;
    }

    let err = bus.request("fails", (), WAIT).await.unwrap_err();
    assert!(err.is(FailureKind::HandlerFailure));
    assert!(err.to_string().contains("boom"));

    let err = bus.request("panics", (), WAIT).await.unwrap_err();
    assert!(err.is(FailureKind::HandlerFailure));
    assert!(err.to_string().contains("kaboom"));

    let err = bus.request("refuses", (), WAIT).await.unwrap_err();
    assert_eq!(
        err,
        BusError::handler_failure("refuses", "bad input")
    );

    let reply = bus.request("healthy", (), WAIT).await.unwrap();
    assert_eq!(reply.body().downcast_ref::<String>().map(String::as_str), Some("ok"));

    let stats = system.stats();
    assert_eq!(stats.bus.handler_failures, 2);
    assert_eq!(stats.contexts[0].panics, 0, "handler panics are caught before the context boundary");
    system.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_second_reply_is_rejected() {
    let system = system(1);
    let bus = system.event_bus();
    let (tx, rx) = std::sync::mpsc::channel();

    let consumer = bus
        .consumer("twice", move |msg| {
            msg.reply("first")?;
            let _ = tx.send(msg.reply("second"));
            Ok(())
        })
        .unwrap();
    registered(&consumer).await;

    let reply = bus.request("twice", (), WAIT).await.unwrap();
    assert_eq!(reply.body().downcast_ref::<String>().map(String::as_str), Some("first"));

    let second = rx.recv_timeout(WAIT).unwrap().unwrap_err();
    assert!(second.is(FailureKind::AlreadyReplied));
    assert_eq!(bus.stats().already_replied, 1);
    system.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reply_without_reply_address_is_an_error() {
    let system = system(1);
    let bus = system.event_bus();
    let (tx, rx) = std::sync::mpsc::channel();

    let consumer = bus
        .consumer("oneway", move |msg| {
            let _ = tx.send(msg.reply("nobody is listening"));
            Ok(())
        })
        .unwrap();
    registered(&consumer).await;

    bus.send("oneway", ()).unwrap();
    let err = rx.recv_timeout(WAIT).unwrap().unwrap_err();
    assert!(matches!(err, BusError::NoReplyAddress { .. }));
    system.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reply_handler_runs_on_sender_context() {
    let system = system(4);
    let bus = system.event_bus().clone();

    let consumer = bus
        .consumer("where", |msg| {
            msg.reply(())?;
            Ok(())
        })
        .unwrap();
    registered(&consumer).await;

    let (tx, rx) = tokio::sync::oneshot::channel();
    system
        .run_on_context(move || {
            let Some(sender) = Context::current() else {
                return;
            };
            let result = bus.send_with_reply("where", (), DeliveryOptions::default(), move |reply| {
                let same = Context::current().map(|c| c.id()) == Some(sender.id());
                let _ = tx.send((reply.is_ok(), same));
            });
            assert!(result.is_ok());
        })
        .unwrap();

    let (ok, same_context) = tokio::time::timeout(WAIT, rx).await.unwrap().unwrap();
    assert!(ok);
    assert!(same_context);
    system.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unregister_is_the_commit_point() {
    let system = system(1);
    let bus = system.event_bus();
    let delivered = Arc::new(AtomicUsize::new(0));

    let counted = Arc::clone(&delivered);
    let consumer = bus
        .consumer("commit", move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
    registered(&consumer).await;

    bus.send("commit", ()).unwrap();
    assert!(consumer.unregister());
    assert!(!consumer.is_registered());
    bus.send("commit", ()).unwrap();

    // the delivery enqueued before the unregister still runs
    assert!(wait_until(|| delivered.load(Ordering::SeqCst) == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(delivered.load(Ordering::SeqCst), 1);
    assert_eq!(bus.stats().no_handlers, 1);
    assert!(!consumer.unregister());
    system.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_deliveries_are_fifo_per_context() {
    let system = system(1);
    let bus = system.event_bus();
    let order = Arc::new(Mutex::new(Vec::new()));

    for address in ["fifo.a", "fifo.b"] {
        let order = Arc::clone(&order);
        let consumer = bus
            .consumer(address, move |msg| {
                if let Some(n) = msg.body().downcast_ref::<u64>() {
                    order.lock().push(*n);
                }
                Ok(())
            })
            .unwrap();
        registered(&consumer).await;
    }

    for n in 0..100u64 {
        let address = if n % 2 == 0 { "fifo.a" } else { "fifo.b" };
        bus.send(address, Body::new(n)).unwrap();
    }
    assert!(wait_until(|| order.lock().len() == 100).await);
    assert_eq!(*order.lock(), (0..100).collect::<Vec<u64>>());
    system.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_headers_travel_with_the_message() {
    let system = system(1);
    let bus = system.event_bus();

    let consumer = bus
        .consumer("headers", |msg| {
            let trace = msg.headers().get("trace-id").cloned().unwrap_or_default();
            msg.reply(trace)?;
            Ok(())
        })
        .unwrap();
    registered(&consumer).await;

    let options = DeliveryOptions::new()
        .with_timeout(WAIT)
        .with_header("trace-id", "abc-123");
    let reply = bus.request_with_options("headers", (), options).await.unwrap();
    assert_eq!(reply.body().downcast_ref::<String>().map(String::as_str), Some("abc-123"));
    system.shutdown().await.unwrap();
}
