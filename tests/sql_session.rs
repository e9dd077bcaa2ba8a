use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};

use reservd::clock::SystemClock;
use reservd::engine::Engine;
use reservd::wire::{self, ReservdFactory};

const PASSWORD: &str = "reservd";
const ROOT_PASSWORD: &str = "root-secret";

// ── Test infrastructure ──────────────────────────────────────

struct TestServer {
    addr: SocketAddr,
    _dir: tempfile::TempDir,
}

async fn start_test_server() -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let engine =
        Arc::new(Engine::new(&dir.path().join("reservd.wal"), Arc::new(SystemClock)).unwrap());
    engine.ensure_root("root", Some(ROOT_PASSWORD)).await.unwrap();
    let factory = ReservdFactory::new(engine, PASSWORD.to_string(), true);

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let factory = factory.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, factory, None).await;
            });
        }
    });

    TestServer { addr, _dir: dir }
}

async fn try_connect(
    addr: SocketAddr,
    user: &str,
    password: &str,
) -> Result<Client, tokio_postgres::Error> {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("reservd")
        .user(user)
        .password(password);

    let (client, connection) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        let _ = connection.await;
    });
    Ok(client)
}

async fn connect(addr: SocketAddr, user: &str) -> Client {
    let password = if user == "root" { ROOT_PASSWORD } else { PASSWORD };
    try_connect(addr, user, password).await.unwrap()
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn sqlstate(client: &Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.unwrap_err();
    err.code().unwrap().code().to_string()
}

fn hours_from_now(h: i64) -> String {
    (Utc::now() + Duration::hours(h)).to_rfc3339()
}

async fn create_server(root: &Client, name: &str) -> String {
    let created = rows(
        root,
        &format!(
            "INSERT INTO servers (name, address, login, secret) \
             VALUES ('{name}', '10.0.0.1', 'admin', 'hunter2')"
        ),
    )
    .await;
    created[0].get("id").unwrap().to_string()
}

fn book_sql(server_id: &str, from_h: i64, to_h: i64) -> String {
    format!(
        r#"INSERT INTO reservations (server_id, start, "end") VALUES ({server_id}, '{}', '{}')"#,
        hours_from_now(from_h),
        hours_from_now(to_h)
    )
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn booking_conflicts_and_adjacency() {
    let server = start_test_server().await;
    let root = connect(server.addr, "root").await;
    let alice = connect(server.addr, "alice").await;
    let bob = connect(server.addr, "bob").await;

    let gpu = create_server(&root, "gpu-1").await;

    let booked = rows(&alice, &book_sql(&gpu, 1, 3)).await;
    assert_eq!(booked.len(), 1);
    assert_eq!(booked[0].get("status"), Some("active"));
    assert_eq!(booked[0].get("username"), Some("alice"));
    assert_eq!(booked[0].get("server_name"), Some("gpu-1"));

    assert_eq!(sqlstate(&bob, &book_sql(&gpu, 2, 4)).await, "23P01");

    let adjacent = rows(&bob, &book_sql(&gpu, 3, 4)).await;
    assert_eq!(adjacent.len(), 1);

    let servers = rows(&bob, "SELECT * FROM servers").await;
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0].get("status"), Some("reserved"));
    assert_eq!(servers[0].get("secret"), None);

    let as_root = rows(&root, &format!("SELECT * FROM servers WHERE id = {gpu}")).await;
    assert_eq!(as_root[0].get("secret"), Some("hunter2"));
}

#[tokio::test]
async fn reservations_are_scoped_to_their_owner() {
    let server = start_test_server().await;
    let root = connect(server.addr, "root").await;
    let alice = connect(server.addr, "alice").await;
    let bob = connect(server.addr, "bob").await;

    let gpu = create_server(&root, "gpu-1").await;
    let alice_res = rows(&alice, &book_sql(&gpu, 1, 2)).await;
    let alice_id = alice_res[0].get("id").unwrap().to_string();
    rows(&bob, &book_sql(&gpu, 5, 6)).await;

    let mine = rows(&bob, "SELECT * FROM reservations").await;
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].get("username"), Some("bob"));
    assert_eq!(mine[0].get("address"), None);

    let all = rows(&root, "SELECT * FROM reservations").await;
    assert_eq!(all.len(), 2);

    let cancel = format!("UPDATE reservations SET status = 'cancelled' WHERE id = {alice_id}");
    assert_eq!(sqlstate(&bob, &cancel).await, "P0002");
    assert_eq!(
        sqlstate(&bob, &format!("SELECT * FROM reservations WHERE id = {alice_id}")).await,
        "P0002"
    );

    let n = alice
        .execute(
            "UPDATE reservations SET status = 'cancelled' WHERE id = $1",
            &[&alice_id.as_str()],
        )
        .await
        .unwrap();
    assert_eq!(n, 1);
    assert_eq!(sqlstate(&alice, &cancel).await, "55P04");

    let after = rows(&alice, &format!("SELECT * FROM reservations WHERE id = {alice_id}")).await;
    assert_eq!(after[0].get("status"), Some("cancelled"));
}

#[tokio::test]
async fn maintenance_and_privileges() {
    let server = start_test_server().await;
    let root = connect(server.addr, "root").await;
    let alice = connect(server.addr, "alice").await;

    let gpu = create_server(&root, "gpu-1").await;

    assert_eq!(
        sqlstate(&alice, "INSERT INTO servers (name) VALUES ('rogue')").await,
        "42501"
    );
    assert_eq!(sqlstate(&alice, "SELECT * FROM users").await, "42501");

    rows(&root, &format!("UPDATE servers SET status = 'maintenance' WHERE id = {gpu}")).await;
    assert_eq!(sqlstate(&alice, &book_sql(&gpu, 1, 2)).await, "55000");

    rows(&root, &format!("UPDATE servers SET status = 'available' WHERE id = {gpu}")).await;
    assert_eq!(rows(&alice, &book_sql(&gpu, 1, 2)).await.len(), 1);

    let me = rows(&alice, "SELECT * FROM whoami").await;
    assert_eq!(me[0].get("username"), Some("alice"));
    assert_eq!(me[0].get("role"), Some("user"));

    let users = rows(&root, "SELECT * FROM users").await;
    assert_eq!(users.len(), 2);
}

#[tokio::test]
async fn invalid_input_is_reported() {
    let server = start_test_server().await;
    let root = connect(server.addr, "root").await;
    let gpu = create_server(&root, "gpu-1").await;

    assert_eq!(sqlstate(&root, &book_sql(&gpu, 3, 2)).await, "22023");
    assert_eq!(sqlstate(&root, &book_sql(&gpu, -3, -2)).await, "22023");
    assert_eq!(sqlstate(&root, &book_sql("999", 1, 2)).await, "P0002");
    assert_eq!(sqlstate(&root, "SELECT * FROM widgets").await, "42P01");
    assert_eq!(sqlstate(&root, "SELEKT nonsense").await, "42601");
    assert_eq!(
        sqlstate(&root, "INSERT INTO servers (name) VALUES ('gpu-1')").await,
        "23505"
    );
}

#[tokio::test]
async fn logins_check_per_account_passwords() {
    let server = start_test_server().await;

    assert!(try_connect(server.addr, "root", PASSWORD).await.is_err());
    let root = connect(server.addr, "root").await;
    let me = rows(&root, "SELECT * FROM whoami").await;
    assert_eq!(me[0].get("role"), Some("root"));

    let alice = connect(server.addr, "alice").await;
    let alice_id = rows(&alice, "SELECT * FROM whoami").await[0]
        .get("id")
        .unwrap()
        .to_string();
    rows(
        &alice,
        &format!("UPDATE users SET password = 'alice-secret' WHERE id = {alice_id}"),
    )
    .await;

    assert!(try_connect(server.addr, "alice", PASSWORD).await.is_err());
    let again = try_connect(server.addr, "alice", "alice-secret").await.unwrap();
    let me = rows(&again, "SELECT * FROM whoami").await;
    assert_eq!(me[0].get("username"), Some("alice"));

    let root_id = rows(&root, "SELECT * FROM whoami").await[0]
        .get("id")
        .unwrap()
        .to_string();
    assert_eq!(
        sqlstate(
            &again,
            &format!("UPDATE users SET password = 'x' WHERE id = {root_id}")
        )
        .await,
        "42501"
    );

    rows(
        &root,
        "INSERT INTO users (username, password) VALUES ('carol', 'carol-secret')",
    )
    .await;
    assert!(try_connect(server.addr, "carol", PASSWORD).await.is_err());
    assert!(try_connect(server.addr, "carol", "carol-secret").await.is_ok());
}
