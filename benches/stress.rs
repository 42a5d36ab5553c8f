use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{Datelike, NaiveDate, TimeDelta};
use tokio_postgres::{Client, Config, NoTls};
use ulid::Ulid;

const WEEK: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

async fn connect(host: &str, port: u16, dbname: &str) -> Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(dbname)
        .user("fitbook")
        .password("fitbook");

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn fresh_gym() -> String {
    format!("bench_{}", Ulid::new())
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

struct Gym {
    facility: Ulid,
    plan: Ulid,
}

/// A facility open every day 06:00-22:00 in one-hour sessions, plus a
/// yearly plan with an allowance large enough for the whole run.
async fn setup_gym(client: &Client, capacity: u32) -> Gym {
    let facility = Ulid::new();
    let plan = Ulid::new();
    let mut sql = format!(
        "INSERT INTO facilities (id, name, session_hours, capacity) VALUES ('{facility}', 'Floor', 1, {capacity});"
    );
    for day in WEEK {
        sql.push_str(&format!(
            "INSERT INTO facility_hours (facility_id, weekday, open_time, close_time) VALUES ('{facility}', '{day}', '06:00', '22:00');"
        ));
    }
    sql.push_str(&format!(
        "INSERT INTO plans (id, price, duration_units, kind, allowed_reservations) VALUES ('{plan}', 0, 365, 'yearly', 100000);"
    ));
    client.batch_execute(&sql).await.unwrap();
    Gym { facility, plan }
}

async fn add_member(client: &Client, gym: &Gym) -> Ulid {
    let member = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO members (id) VALUES ('{member}'); INSERT INTO grants (member_id, plan_id) VALUES ('{member}', '{}');",
            gym.plan
        ))
        .await
        .unwrap();
    member
}

fn book_sql(member: Ulid, gym: &Gym, date: NaiveDate, hour: u32) -> String {
    format!(
        "INSERT INTO reservations (member_id, facility_id, date, start_time, end_time, weekday) VALUES ('{member}', '{}', '{date}', '{hour:02}:00', '{:02}:00', '{}')",
        gym.facility,
        hour + 1,
        date.weekday()
    )
}

fn day(offset: usize) -> NaiveDate {
    let base = NaiveDate::from_ymd_opt(2030, 1, 7).unwrap_or_default();
    base + TimeDelta::days(offset as i64)
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port, &fresh_gym()).await;
    let gym = setup_gym(&client, 1000).await;
    let member = add_member(&client, &gym).await;

    // One active reservation per member and day, so walk the calendar.
    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for i in 0..n {
        let t = Instant::now();
        client
            .batch_execute(&book_sql(member, &gym, day(i), 6 + (i % 16) as u32))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

/// Many members race for a handful of seats in the same slot.
async fn phase2_contention(host: &str, port: u16) {
    let dbname = fresh_gym();
    let setup_client = connect(host, port, &dbname).await;
    let capacity = 20;
    let gym = Arc::new(setup_gym(&setup_client, capacity).await);

    let n_tasks = 200;
    let mut members = Vec::with_capacity(n_tasks);
    for _ in 0..n_tasks {
        members.push(add_member(&setup_client, &gym).await);
    }

    let booked = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();
    for member in members {
        let host = host.to_string();
        let dbname = dbname.clone();
        let gym = gym.clone();
        let booked = booked.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &dbname).await;
            if client.simple_query(&book_sql(member, &gym, day(2), 18)).await.is_ok() {
                booked.fetch_add(1, Ordering::Relaxed);
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let won = booked.load(Ordering::Relaxed);
    println!(
        "  {n_tasks} members for {capacity} seats: {won} booked in {:.2}s",
        elapsed.as_secs_f64()
    );
    assert_eq!(won, capacity as usize, "capacity must never be exceeded");
}

async fn phase3_read_under_load(host: &str, port: u16) {
    let dbname = fresh_gym();
    let setup_client = connect(host, port, &dbname).await;
    let gym = Arc::new(setup_gym(&setup_client, 50).await);

    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for _ in 0..5 {
        let host = host.to_string();
        let dbname = dbname.clone();
        let gym = gym.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &dbname).await;
            let member = add_member(&client, &gym).await;
            let mut i = 0usize;
            while !stop.load(Ordering::Relaxed) {
                // Alternating slots on one day exercises the move path.
                let _ = client
                    .simple_query(&book_sql(member, &gym, day(i % 30), 6 + (i % 2) as u32))
                    .await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for r in 0..n_readers {
        let host = host.to_string();
        let dbname = dbname.clone();
        let gym = gym.clone();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &dbname).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for i in 0..reads_per_reader {
                let t = Instant::now();
                client
                    .simple_query(&format!(
                        "SELECT * FROM availability WHERE facility_id = '{}' AND date = '{}'",
                        gym.facility,
                        day((r + i) % 30)
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

    print_latency("availability query", &mut all_latencies);
}

async fn phase4_connection_storm(host: &str, port: u16) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for _ in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &fresh_gym()).await;
            let gym = setup_gym(&client, 10).await;
            let member = add_member(&client, &gym).await;
            for i in 0..ops_per_conn {
                client
                    .batch_execute(&book_sql(member, &gym, day(i), 8))
                    .await
                    .unwrap();
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("FITBOOK_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("FITBOOK_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid FITBOOK_PORT");

    println!("=== fitbook stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential booking throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] last-seat contention");
    phase2_contention(&host, port).await;

    println!("\n[phase 3] availability latency under booking load");
    phase3_read_under_load(&host, port).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== benchmark complete ===");
}
