//! In-process fan-out benchmark for Beacon.
//!
//! One publisher blasts QoS 1 messages at a topic while N subscriber tasks
//! receive and acknowledge them through the broker.
//!
//! ```bash
//! cargo run --release --bin fanout -- 16
//! ```

use anyhow::Result;
use beacon_protocol::{Frame, QoS};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tenvis_beacon_core::{metrics, Broker, BrokerConfig, Session, SubscriberKey, TokioExecutor};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const TOPIC: &str = "benchmark";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tenvis_beacon_core=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().collect();
    let num_clients = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║            Beacon In-Process Fan-Out Benchmark               ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    let config = BrokerConfig::load()?;
    metrics::init_metrics();
    let broker = Arc::new(Broker::new(config, Arc::new(TokioExecutor::current())));

    run_fanout_benchmark(broker, num_clients).await
}

async fn run_fanout_benchmark(broker: Arc<Broker>, num_clients: usize) -> Result<()> {
    println!("📊 Fan-out Benchmark: {} subscribers, QoS 1", num_clients);
    println!("   Warmup: {}s, Measurement: {}s", WARMUP_SECS, BENCH_SECS);
    println!();

    let received = Arc::new(AtomicU64::new(0));
    let mut handles = Vec::new();

    for client in 0..num_clients {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = broker.open_session(&format!("sub-{client}"), None, tx);
        broker.subscribe(&session, TOPIC, QoS::AtLeastOnce)?;

        let broker = Arc::clone(&broker);
        let received = Arc::clone(&received);
        handles.push(tokio::spawn(async move {
            run_subscriber(broker, session, rx, received).await;
        }));
    }
    println!("✓ All {} subscribers attached", num_clients);

    let running = Arc::new(AtomicBool::new(true));
    let published = Arc::new(AtomicU64::new(0));
    let publisher = {
        let broker = Arc::clone(&broker);
        let running = Arc::clone(&running);
        let published = Arc::clone(&published);
        tokio::spawn(async move {
            let payload = Bytes::from(vec![0u8; 64]);
            while running.load(Ordering::Relaxed) {
                if let Err(e) = broker.publish(TOPIC, QoS::AtLeastOnce, false, payload.clone()) {
                    eprintln!("Publish error: {}", e);
                    break;
                }
                published.fetch_add(1, Ordering::Relaxed);
                tokio::task::yield_now().await;
            }
        })
    };

    // Warmup phase
    println!("⏳ Warming up for {}s...", WARMUP_SECS);
    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    // Reset counters and start measurement
    received.store(0, Ordering::SeqCst);
    published.store(0, Ordering::SeqCst);
    let start = Instant::now();

    println!("📈 Measuring for {}s...", BENCH_SECS);
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed();
    let total_received = received.load(Ordering::SeqCst);
    let total_published = published.load(Ordering::SeqCst);

    running.store(false, Ordering::Relaxed);
    publisher.await?;

    let skipped: u64 = broker
        .topic(TOPIC)
        .map(|topic| {
            (0..num_clients)
                .map(|client| SubscriberKey::new(format!("sub-{client}"), TOPIC))
                .filter_map(|key| topic.cursor(&key))
                .map(|cursor| cursor.skipped())
                .sum()
        })
        .unwrap_or(0);

    let secs = elapsed.as_secs_f64();
    let delivered_per_sec = total_received as f64 / secs;

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                         RESULTS                              ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!(
        "║  Subscribers:          {:>10}                           ║",
        num_clients
    );
    println!(
        "║  Duration:             {:>10.2}s                          ║",
        secs
    );
    println!(
        "║  Published:            {:>10.0} msg/s                    ║",
        total_published as f64 / secs
    );
    println!(
        "║  Delivered:            {:>10.0} msg/s                    ║",
        delivered_per_sec
    );
    println!(
        "║  Per-Subscriber:       {:>10.0} msg/s                    ║",
        delivered_per_sec / num_clients as f64
    );
    println!(
        "║  Skipped (evicted):    {:>10}                           ║",
        skipped
    );
    println!("╚══════════════════════════════════════════════════════════════╝");

    for handle in handles {
        handle.abort();
    }
    Ok(())
}

async fn run_subscriber(
    broker: Arc<Broker>,
    session: Arc<Session>,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    received: Arc<AtomicU64>,
) {
    while let Some(frame) = rx.recv().await {
        if let Frame::Publish {
            packet_id: Some(id),
            ..
        } = frame
        {
            received.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = broker.handle_frame(&session, Frame::puback(id)) {
                eprintln!("Ack error for {}: {}", session.client_id(), e);
                break;
            }
        }
    }
}
