use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage};

const HOUR: i64 = 3_600_000;
const DAY: i64 = 24 * HOUR;

async fn connect(host: &str, port: u16, password: &str) -> Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname("slotd")
        .user("slotd")
        .password(password);

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
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
        println!("  {label}: no samples");
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
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

/// First column of the first returned row.
async fn first_value(client: &Client, sql: &str) -> String {
    client
        .simple_query(sql)
        .await
        .unwrap_or_else(|e| panic!("{sql}: {e}"))
        .into_iter()
        .find_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => row.get(0).map(str::to_string),
            _ => None,
        })
        .unwrap_or_else(|| panic!("{sql}: no rows"))
}

/// Users get unique emails per run since the server keeps state between runs.
struct Target {
    host: String,
    port: u16,
    password: String,
    run: String,
}

impl Target {
    async fn client(&self) -> Client {
        connect(&self.host, self.port, &self.password).await
    }

    async fn new_user(&self, client: &Client, label: &str) -> String {
        first_value(
            client,
            &format!(
                "INSERT INTO users (email, name) VALUES ('{label}.{}@bench.local', 'Bench User')",
                self.run
            ),
        )
        .await
    }
}

async fn phase1_sequential(target: &Target) {
    let client = target.client().await;
    let user = target.new_user(&client, "seq").await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for i in 0..n {
        let s = (i as i64) * HOUR;
        let t = Instant::now();
        client
            .batch_execute(&format!("INSERT INTO slots VALUES ({user}, {s}, 60)"))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} slots in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

async fn phase2_concurrent(target: &Arc<Target>) {
    let n_tasks = 10;
    let n_per_task = 200;

    let start = Instant::now();
    let mut handles = Vec::new();
    for task in 0..n_tasks {
        let target = target.clone();
        handles.push(tokio::spawn(async move {
            let client = target.client().await;
            let user = target.new_user(&client, &format!("conc{task}")).await;
            for j in 0..n_per_task {
                let s = (j as i64) * HOUR;
                client
                    .batch_execute(&format!("INSERT INTO slots VALUES ({user}, {s}, 30)"))
                    .await
                    .unwrap();
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} users x {n_per_task} slots = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase3_read_under_load(target: &Arc<Target>) {
    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..5 {
        let target = target.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = target.client().await;
            let user = target.new_user(&client, &format!("writer{w}")).await;
            let mut i = 0i64;
            while !stop.load(Ordering::Relaxed) {
                let _ = client
                    .batch_execute(&format!("INSERT INTO slots VALUES ({user}, {}, 30)", i * HOUR))
                    .await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for r in 0..n_readers {
        let target = target.clone();
        reader_handles.push(tokio::spawn(async move {
            let client = target.client().await;
            let user = target.new_user(&client, &format!("reader{r}")).await;
            // Half the slots booked so free/busy has something to merge.
            for i in 0..50i64 {
                let slot = first_value(
                    &client,
                    &format!("INSERT INTO slots VALUES ({user}, {}, 60)", i * 2 * HOUR),
                )
                .await;
                if i % 2 == 0 {
                    client
                        .batch_execute(&format!(
                            "UPDATE slots SET status = 'BUSY' WHERE id = {slot} AND user_id = {user}"
                        ))
                        .await
                        .unwrap();
                }
            }

            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client
                    .batch_execute(&format!(
                        r#"SELECT * FROM free_busy WHERE user_id = {user} AND start >= 0 AND "end" <= {}"#,
                        7 * DAY
                    ))
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }
    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("free/busy query", &mut all_latencies);
}

/// Many clients race to book one slot; exactly one may win.
async fn phase4_booking_contention(target: &Arc<Target>) {
    let client = target.client().await;
    let owner = target.new_user(&client, "contended").await;
    let slot = first_value(&client, &format!("INSERT INTO slots VALUES ({owner}, 0, 60)")).await;

    let n_clients = 50;
    let booked = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_clients {
        let target = target.clone();
        let booked = booked.clone();
        let owner = owner.clone();
        let slot = slot.clone();
        handles.push(tokio::spawn(async move {
            let client = target.client().await;
            let result = client
                .batch_execute(&format!(
                    "INSERT INTO meetings VALUES ({owner}, {slot}, 'Race', NULL, ARRAY[{owner}])"
                ))
                .await;
            if result.is_ok() {
                booked.fetch_add(1, Ordering::Relaxed);
            }
        }));
    }
    for h in handles {
        let _ = h.await;
    }

    let won = booked.load(Ordering::Relaxed);
    println!(
        "  {n_clients} clients raced for one slot: {won} booking(s) in {:.2}s",
        start.elapsed().as_secs_f64()
    );
    assert_eq!(won, 1, "double booking detected");
}

#[tokio::main]
async fn main() {
    let host = std::env::var("SLOTD_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("SLOTD_PORT")
        .unwrap_or_else(|_| "5434".into())
        .parse()
        .expect("invalid SLOTD_PORT");
    let password = std::env::var("SLOTD_PASSWORD").unwrap_or_else(|_| "slotd".into());
    let run = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_nanos()
        .to_string();

    println!("=== slotd stress benchmark ===");
    println!("target: {host}:{port}\n");

    let target = Arc::new(Target {
        host,
        port,
        password,
        run,
    });

    println!("[phase 1] sequential slot creation");
    phase1_sequential(&target).await;

    println!("\n[phase 2] concurrent slot creation");
    phase2_concurrent(&target).await;

    println!("\n[phase 3] free/busy latency under write load");
    phase3_read_under_load(&target).await;

    println!("\n[phase 4] booking contention");
    phase4_booking_contention(&target).await;

    println!("\n=== done ===");
}
