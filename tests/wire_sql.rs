use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use fitbook::clock::SystemClock;
use fitbook::tenant::TenantManager;
use fitbook::wire;

// 2030-01-09 is a Wednesday.
const DATE: &str = "2030-01-09";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("fitbook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000, Arc::new(SystemClock)));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "fitbook".to_string(), None).await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr, dbname: &str) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(dbname)
        .user("fitbook")
        .password("fitbook");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

struct Gym {
    facility: Ulid,
    plan: Ulid,
}

/// A studio open Wednesdays 09:00-12:00 in one-hour sessions, and a monthly plan.
async fn setup_gym(client: &Client, capacity: u32) -> Gym {
    let facility = Ulid::new();
    let plan = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO facilities (id, name, session_hours, capacity) VALUES ('{facility}', 'Studio', 1, {capacity});
             INSERT INTO facility_hours (facility_id, weekday, open_time, close_time) VALUES ('{facility}', 'Wed', '09:00', '12:00');
             INSERT INTO plans (id, name, price, duration_units, kind, allowed_reservations) VALUES ('{plan}', 'Monthly', 4000, 30, 'monthly', 2);"
        ))
        .await
        .unwrap();
    Gym { facility, plan }
}

async fn subscribed_member(client: &Client, gym: &Gym) -> Ulid {
    let member = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO members (id, name) VALUES ('{member}', 'Ana');
             INSERT INTO grants (member_id, plan_id) VALUES ('{member}', '{}');",
            gym.plan
        ))
        .await
        .unwrap();
    member
}

fn book_sql(member: Ulid, gym: &Gym, start: &str, end: &str) -> String {
    format!(
        "INSERT INTO reservations (member_id, facility_id, date, start_time, end_time) VALUES ('{member}', '{}', '{DATE}', '{start}', '{end}')",
        gym.facility
    )
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn availability_reflects_bookings() {
    let addr = start_test_server().await;
    let client = connect(addr, "availability").await;
    let gym = setup_gym(&client, 1).await;
    let member = subscribed_member(&client, &gym).await;

    let booked = rows(&client, &book_sql(member, &gym, "10:00", "11:00")).await;
    assert_eq!(booked.len(), 1);
    assert_eq!(booked[0].get("status"), Some("active"));
    assert_eq!(booked[0].get("weekday"), Some("Wed"));

    let slots = rows(
        &client,
        &format!("SELECT * FROM availability WHERE facility_id = '{}' AND date = '{DATE}'", gym.facility),
    )
    .await;
    assert_eq!(slots.len(), 3);
    assert_eq!(slots[0].get("start_time"), Some("09:00"));
    assert_eq!(slots[1].get("current_reservations"), Some("1"));
    assert_eq!(slots[1].get("is_available"), Some("f"));
    assert_eq!(slots[2].get("is_available"), Some("t"));
}

#[tokio::test]
async fn full_slot_is_a_user_error() {
    let addr = start_test_server().await;
    let client = connect(addr, "full_slot").await;
    let gym = setup_gym(&client, 1).await;
    let first = subscribed_member(&client, &gym).await;
    let second = subscribed_member(&client, &gym).await;

    rows(&client, &book_sql(first, &gym, "09:00", "10:00")).await;
    let err = client
        .simple_query(&book_sql(second, &gym, "09:00", "10:00"))
        .await
        .unwrap_err();
    let db = err.as_db_error().unwrap();
    assert_eq!(db.code().code(), "P0001");
    assert!(db.message().contains("fully booked"));
}

#[tokio::test]
async fn unknown_member_is_not_found() {
    let addr = start_test_server().await;
    let client = connect(addr, "not_found").await;
    let err = client
        .simple_query(&format!("SELECT * FROM members WHERE id = '{}'", Ulid::new()))
        .await
        .unwrap_err();
    assert_eq!(err.as_db_error().unwrap().code().code(), "P0002");
}

#[tokio::test]
async fn bad_sql_is_a_syntax_error() {
    let addr = start_test_server().await;
    let client = connect(addr, "syntax").await;
    let err = client.simple_query("SELEKT nothing").await.unwrap_err();
    assert_eq!(err.as_db_error().unwrap().code().code(), "42601");
}

#[tokio::test]
async fn cancel_refunds_allowance() {
    let addr = start_test_server().await;
    let client = connect(addr, "refund").await;
    let gym = setup_gym(&client, 4).await;
    let member = subscribed_member(&client, &gym).await;

    let booked = rows(&client, &book_sql(member, &gym, "09:00", "10:00")).await;
    let reservation = booked[0].get("id").unwrap().to_string();

    let profile = rows(&client, &format!("SELECT * FROM members WHERE id = '{member}'")).await;
    assert_eq!(profile[0].get("used_reservations"), Some("1"));
    assert_eq!(profile[0].get("allowed_reservations"), Some("2"));
    assert_eq!(profile[0].get("expired"), Some("f"));

    client
        .batch_execute(&format!(
            "DELETE FROM reservations WHERE id = '{reservation}' AND member_id = '{member}'"
        ))
        .await
        .unwrap();

    let profile = rows(&client, &format!("SELECT * FROM members WHERE id = '{member}'")).await;
    assert_eq!(profile[0].get("used_reservations"), Some("0"));

    let history = rows(&client, &format!("SELECT * FROM reservations WHERE member_id = '{member}'")).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].get("status"), Some("cancelled"));
}

#[tokio::test]
async fn grant_lifecycle_over_sql() {
    let addr = start_test_server().await;
    let client = connect(addr, "grants").await;
    let gym = setup_gym(&client, 4).await;
    let member = subscribed_member(&client, &gym).await;

    let active = rows(&client, &format!("SELECT * FROM active_grants WHERE member_id = '{member}'")).await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].get("payment_state"), Some("paid"));
    let grant = active[0].get("id").unwrap().to_string();

    let extended = rows(
        &client,
        &format!("INSERT INTO grant_extensions (grant_id, extra_days) VALUES ('{grant}', 5)"),
    )
    .await;
    assert_eq!(extended[0].get("id"), Some(grant.as_str()));

    // No plan_id renews the latest plan.
    let renewed = rows(
        &client,
        &format!("INSERT INTO grants (member_id, will_pay_later) VALUES ('{member}', true)"),
    )
    .await;
    assert_eq!(renewed[0].get("plan_id"), Some(gym.plan.to_string().as_str()));
    assert_eq!(renewed[0].get("payment_state"), Some("unpaid"));

    client
        .batch_execute(&format!("DELETE FROM grants WHERE id = '{grant}' AND member_id = '{member}'"))
        .await
        .unwrap();

    let history = rows(&client, &format!("SELECT * FROM grants WHERE member_id = '{member}'")).await;
    assert_eq!(history.len(), 2);
    assert!(history[1].get("invalidated_at").is_some());
}

#[tokio::test]
async fn databases_are_separate_gyms() {
    let addr = start_test_server().await;
    let north = connect(addr, "north").await;
    let south = connect(addr, "south").await;

    let member = Ulid::new();
    north
        .batch_execute(&format!("INSERT INTO members (id) VALUES ('{member}')"))
        .await
        .unwrap();

    assert!(north.simple_query(&format!("SELECT * FROM members WHERE id = '{member}'")).await.is_ok());
    assert!(south.simple_query(&format!("SELECT * FROM members WHERE id = '{member}'")).await.is_err());
}

#[tokio::test]
async fn extended_protocol_binds_parameters() {
    let addr = start_test_server().await;
    let client = connect(addr, "extended").await;
    let gym = setup_gym(&client, 2).await;
    let member = subscribed_member(&client, &gym).await;

    let member_text = member.to_string();
    let found = client
        .query("SELECT * FROM members WHERE id = $1", &[&member_text])
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    let name: String = found[0].get("name");
    assert_eq!(name, "Ana");
}
