use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;

struct Client {
    framed: Framed<TcpStream, LinesCodec>,
    library: String,
    member: Ulid,
    librarian: bool,
}

impl Client {
    async fn connect(host: &str, port: u16, library: &str, librarian: bool) -> Self {
        let socket = TcpStream::connect((host, port)).await.expect("connect failed");
        Self {
            framed: Framed::new(socket, LinesCodec::new()),
            library: library.to_string(),
            member: Ulid::new(),
            librarian,
        }
    }

    async fn call(&mut self, mut op: Value) -> Value {
        op["library"] = json!(self.library);
        op["member"] = json!(self.member.to_string());
        op["librarian"] = json!(self.librarian);
        self.framed.send(op.to_string()).await.expect("send failed");
        loop {
            let line = self
                .framed
                .next()
                .await
                .expect("connection closed")
                .expect("read failed");
            let value: Value = serde_json::from_str(&line).expect("bad reply");
            if value.get("ok").is_some() {
                return value;
            }
        }
    }

    async fn register(&mut self, copies: u32) -> String {
        let isbn = Ulid::new().to_string()[13..].to_string();
        let reply = self
            .call(json!({
                "op": "register_book",
                "isbn": isbn,
                "title": "Bench",
                "author": "Bench",
                "publisher": "Bench",
                "total_copies": copies,
            }))
            .await;
        reply["data"]["id"].as_str().expect("register failed").to_string()
    }
}

fn fresh_library(phase: &str) -> String {
    format!("bench_{phase}_{}", Ulid::new())
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().map_or(0.0, |d| d.as_secs_f64() * 1000.0),
    );
}

/// One member borrowing and returning the same title in a loop.
async fn phase1_sequential(host: &str, port: u16) {
    let library = fresh_library("seq");
    let mut desk = Client::connect(host, port, &library, true).await;
    let book = desk.register(1).await;
    let mut member = Client::connect(host, port, &library, false).await;

    let n = 1000;
    let mut borrow_lat = Vec::with_capacity(n);
    let mut return_lat = Vec::with_capacity(n);
    let start = Instant::now();
    for _ in 0..n {
        let t = Instant::now();
        let loan = member.call(json!({"op": "borrow", "book_id": book})).await;
        borrow_lat.push(t.elapsed());
        let loan_id = loan["data"]["id"].as_str().expect("borrow failed").to_string();

        let t = Instant::now();
        member.call(json!({"op": "return", "loan_id": loan_id})).await;
        return_lat.push(t.elapsed());
    }
    let elapsed = start.elapsed();
    println!(
        "  {} transactions in {:.2}s ({:.0} tx/s)",
        2 * n,
        elapsed.as_secs_f64(),
        (2 * n) as f64 / elapsed.as_secs_f64()
    );
    print_latency("borrow", &mut borrow_lat);
    print_latency("return", &mut return_lat);
}

/// Many members racing for a few copies of one hot title.
async fn phase2_contention(host: &str, port: u16) {
    let library = fresh_library("hot");
    let copies = 5;
    let mut desk = Client::connect(host, port, &library, true).await;
    let book = desk.register(copies).await;

    let n_members = 50;
    let ok = Arc::new(AtomicUsize::new(0));
    let unavailable = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_members {
        let (host, library, book) = (host.to_string(), library.clone(), book.clone());
        let (ok, unavailable) = (ok.clone(), unavailable.clone());
        handles.push(tokio::spawn(async move {
            let mut member = Client::connect(&host, port, &library, false).await;
            let reply = member.call(json!({"op": "borrow", "book_id": book})).await;
            if reply["ok"] == true {
                ok.fetch_add(1, Ordering::Relaxed);
            } else if reply["error"]["code"] == "book_unavailable" {
                unavailable.fetch_add(1, Ordering::Relaxed);
            }
        }));
    }
    for h in handles {
        let _ = h.await;
    }
    let ok = ok.load(Ordering::Relaxed);
    let unavailable = unavailable.load(Ordering::Relaxed);
    println!(
        "  {n_members} members, {copies} copies: {ok} loans, {unavailable} refused in {:.2}s",
        start.elapsed().as_secs_f64()
    );
    if ok != copies as usize {
        println!("  !! expected exactly {copies} loans");
    }
}

/// Catalogue reads while writers churn loans on other titles.
async fn phase3_read_under_load(host: &str, port: u16) {
    let library = fresh_library("read");
    let mut desk = Client::connect(host, port, &library, true).await;
    let mut books = Vec::new();
    for _ in 0..10 {
        books.push(desk.register(3).await);
    }

    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let mut writers = Vec::new();
    for book in books.iter().cloned() {
        let (host, library, stop) = (host.to_string(), library.clone(), stop.clone());
        writers.push(tokio::spawn(async move {
            let mut member = Client::connect(&host, port, &library, false).await;
            while !stop.load(Ordering::Relaxed) {
                let loan = member.call(json!({"op": "borrow", "book_id": book})).await;
                if let Some(loan_id) = loan["data"]["id"].as_str() {
                    member.call(json!({"op": "return", "loan_id": loan_id})).await;
                }
            }
        }));
    }

    let n = 500;
    let mut latencies = Vec::with_capacity(n);
    for i in 0..n {
        let t = Instant::now();
        desk.call(json!({"op": "get_book", "book_id": books[i % books.len()]})).await;
        latencies.push(t.elapsed());
    }
    stop.store(true, Ordering::Relaxed);
    for w in writers {
        let _ = w.await;
    }
    print_latency("get_book under load", &mut latencies);
}

/// Lots of short-lived connections.
async fn phase4_connection_storm(host: &str, port: u16) {
    let library = fresh_library("storm");
    let n_conns = 100;
    let ops_per_conn = 20;
    let success = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_conns {
        let (host, library, success) = (host.to_string(), library.clone(), success.clone());
        handles.push(tokio::spawn(async move {
            let mut client = Client::connect(&host, port, &library, false).await;
            for _ in 0..ops_per_conn {
                client.call(json!({"op": "list_books"})).await;
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }
    for h in handles {
        let _ = h.await;
    }
    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        start.elapsed().as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("SHELFD_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("SHELFD_PORT")
        .unwrap_or_else(|_| "7654".into())
        .parse()
        .expect("invalid SHELFD_PORT");

    println!("=== shelfd stress benchmark ===");
    println!("target: {host}:{port}\n");

    // Each phase uses its own library to avoid interference

    println!("[phase 1] sequential borrow/return");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] contended borrows on one title");
    phase2_contention(&host, port).await;

    println!("\n[phase 3] read latency under loan churn");
    phase3_read_under_load(&host, port).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== benchmark complete ===");
}
