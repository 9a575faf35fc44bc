//! End-to-end relay benchmark for Parley.
//!
//! Usage: `e2e_throughput [clients] [url]`
//!
//! Every client joins one conversation and sends messages back to back,
//! waiting for each `message-sent` ack before the next send. Reports the
//! delivered `new-message` rate, the ack rate and ack latency percentiles.

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

const DEFAULT_URL: &str = "ws://127.0.0.1:8080/ws";
const CONVERSATION: &str = "benchmark";
const WARMUP: Duration = Duration::from_secs(2);
const MEASURE: Duration = Duration::from_secs(10);

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type Reader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Counters shared by all clients.
#[derive(Default)]
struct Tally {
    delivered: AtomicU64,
    acked: AtomicU64,
    ack_latencies_us: Mutex<Vec<u64>>,
}

impl Tally {
    fn reset(&self) {
        self.delivered.store(0, Ordering::SeqCst);
        self.acked.store(0, Ordering::SeqCst);
        if let Ok(mut latencies) = self.ack_latencies_us.lock() {
            latencies.clear();
        }
    }
}

#[tokio::main]
async fn main() {
    let mut args = std::env::args().skip(1);
    let clients: usize = args.next().and_then(|s| s.parse().ok()).unwrap_or(16);
    let url = args.next().unwrap_or_else(|| DEFAULT_URL.to_string());

    println!("Parley relay benchmark");
    println!("  server:  {url}");
    println!("  clients: {clients} in conversation {CONVERSATION:?}");
    println!("  warmup {}s, measure {}s", WARMUP.as_secs(), MEASURE.as_secs());
    println!();

    let tally = Arc::new(Tally::default());
    let ready = Arc::new(Barrier::new(clients + 1));

    let tasks: Vec<_> = (0..clients)
        .map(|n| {
            let url = url.clone();
            let tally = Arc::clone(&tally);
            let ready = Arc::clone(&ready);
            tokio::spawn(async move {
                if let Err(e) = run_client(n, &url, tally, ready).await {
                    eprintln!("client {n}: {e}");
                }
            })
        })
        .collect();

    ready.wait().await;
    println!("all clients joined, warming up");
    tokio::time::sleep(WARMUP).await;

    tally.reset();
    let start = Instant::now();
    tokio::time::sleep(MEASURE).await;
    let elapsed = start.elapsed().as_secs_f64();

    for task in tasks {
        task.abort();
    }

    report(&tally, clients, elapsed);
}

fn report(tally: &Tally, clients: usize, elapsed: f64) {
    let delivered = tally.delivered.load(Ordering::SeqCst);
    let acked = tally.acked.load(Ordering::SeqCst);

    println!();
    println!("results over {elapsed:.2}s");
    println!("  sent (acked):  {acked:>10}  {:>10.0} msg/s", acked as f64 / elapsed);
    println!(
        "  delivered:     {delivered:>10}  {:>10.0} msg/s",
        delivered as f64 / elapsed
    );
    if acked > 0 {
        println!(
            "  fan-out:       {:>10.2}  (ideal {})",
            delivered as f64 / acked as f64,
            clients.saturating_sub(1)
        );
    }

    let mut latencies = match tally.ack_latencies_us.lock() {
        Ok(latencies) => latencies.clone(),
        Err(_) => return,
    };
    if latencies.is_empty() {
        return;
    }
    latencies.sort_unstable();
    let pct = |p: f64| latencies[((latencies.len() - 1) as f64 * p) as usize];
    println!(
        "  ack latency:   p50 {}us  p99 {}us  max {}us",
        pct(0.50),
        pct(0.99),
        pct(1.0)
    );
}

fn envelope(event: &str, data: Value) -> Message {
    Message::Text(json!({"event": event, "data": data}).to_string())
}

fn parse(message: &Message) -> Option<Value> {
    match message {
        Message::Text(text) => serde_json::from_str(text).ok(),
        _ => None,
    }
}

/// Read until an event named `name` arrives whose `data.userId` is `user_id`.
async fn wait_for(reader: &mut Reader, name: &str, user_id: &str) -> Result<(), BoxError> {
    while let Some(message) = reader.next().await {
        if let Some(event) = parse(&message?) {
            if event["event"] == name && event["data"]["userId"] == user_id {
                return Ok(());
            }
        }
    }
    Err("connection closed before sync".into())
}

async fn run_client(
    n: usize,
    url: &str,
    tally: Arc<Tally>,
    ready: Arc<Barrier>,
) -> Result<(), BoxError> {
    let (ws, _) = connect_async(url).await?;
    let (mut writer, mut reader) = ws.split();
    let user = format!("bench-{n}");

    writer.send(envelope("join", json!(user))).await?;
    writer
        .send(envelope("join-conversation", json!(CONVERSATION)))
        .await?;
    // join-conversation has no reply; a status check behind it acts as a barrier
    writer
        .send(envelope("check-user-status", json!(user)))
        .await?;
    wait_for(&mut reader, "user-status", &user).await?;

    ready.wait().await;

    let (ack_tx, mut ack_rx) = tokio::sync::mpsc::channel::<()>(1);
    let counts = Arc::clone(&tally);
    let read_task = tokio::spawn(async move {
        while let Some(Ok(message)) = reader.next().await {
            let Some(event) = parse(&message) else { continue };
            match event["event"].as_str() {
                Some("new-message") => {
                    counts.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Some("message-sent") => {
                    if ack_tx.send(()).await.is_err() {
                        break;
                    }
                }
                _ => {}
            }
        }
    });

    let message = envelope(
        "send-message",
        json!({"conversationId": CONVERSATION, "content": "x".repeat(64)}),
    );

    loop {
        let sent_at = Instant::now();
        if writer.send(message.clone()).await.is_err() || ack_rx.recv().await.is_none() {
            break;
        }
        let micros = sent_at.elapsed().as_micros() as u64;
        tally.acked.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut latencies) = tally.ack_latencies_us.lock() {
            latencies.push(micros);
        }
    }

    read_task.abort();
    Ok(())
}
