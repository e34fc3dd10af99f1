use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;

use toolshed::clock::FixedClock;
use toolshed::engine::Engine;
use toolshed::model::{Tool, ToolStatus, UserProfile};
use toolshed::notify::NotifyHub;
use toolshed::store::{Collaborators, InMemoryStore};
use toolshed::wire;

// ── Test infrastructure ──────────────────────────────────────

const OWNER: &str = "auth|owner";
const BORROWER: &str = "auth|borrower";

struct Fixture {
    addr: SocketAddr,
    tool_id: Ulid,
    owner_id: Ulid,
}

async fn start_test_server() -> Fixture {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let store = Arc::new(InMemoryStore::new());
    let owner = UserProfile {
        id: Ulid::new(),
        external_id: OWNER.into(),
        display_name: Some("Olive".into()),
    };
    let borrower = UserProfile {
        id: Ulid::new(),
        external_id: BORROWER.into(),
        display_name: Some("Bram".into()),
    };
    let tool = Tool {
        id: Ulid::new(),
        owner_id: owner.id,
        name: Some("Hedge trimmer".into()),
        status: ToolStatus::Available,
        advance_notice_days: 1,
        max_loan_days: 5,
    };
    store.upsert_user(owner.clone()).await.unwrap();
    store.upsert_user(borrower).await.unwrap();
    store.upsert_tool(tool.clone()).await.unwrap();

    let hub = Arc::new(NotifyHub::new());
    let clock = Arc::new(FixedClock::at_date(NaiveDate::from_ymd_opt(2026, 6, 1).unwrap()));
    let engine = Arc::new(Engine::new(
        Collaborators::in_memory(store, hub.clone()),
        clock,
    ));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine.clone();
            let hub = hub.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, hub).await;
            });
        }
    });

    Fixture {
        addr,
        tool_id: tool.id,
        owner_id: owner.id,
    }
}

struct Client {
    framed: Framed<TcpStream, LinesCodec>,
    pushed: Vec<Value>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let socket = TcpStream::connect(addr).await.unwrap();
        Self {
            framed: Framed::new(socket, LinesCodec::new()),
            pushed: Vec::new(),
        }
    }

    async fn next_line(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(2), self.framed.next())
            .await
            .expect("timed out waiting for server")
            .expect("connection closed")
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }

    /// Send one request and return its reply, stashing pushed notifications.
    async fn call(&mut self, request: Value) -> Value {
        self.send_raw(request.to_string()).await;
        loop {
            let value = self.next_line().await;
            if value.get("notification").is_some() {
                self.pushed.push(value);
            } else {
                return value;
            }
        }
    }

    async fn send_raw(&mut self, line: String) {
        self.framed.send(line).await.unwrap();
    }

    async fn next_notification(&mut self) -> Value {
        if !self.pushed.is_empty() {
            return self.pushed.remove(0);
        }
        let value = self.next_line().await;
        assert!(value.get("notification").is_some(), "expected a push, got {value}");
        value
    }
}

fn data(reply: &Value) -> &Value {
    assert_eq!(reply["ok"], json!(true), "request failed: {reply}");
    &reply["data"]
}

fn error_kind(reply: &Value) -> &str {
    assert_eq!(reply["ok"], json!(false), "request unexpectedly succeeded: {reply}");
    reply["error"]["kind"].as_str().unwrap()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn full_loan_over_the_wire() {
    let fx = start_test_server().await;
    let mut borrower = Client::connect(fx.addr).await;
    let mut owner = Client::connect(fx.addr).await;

    let reply = borrower
        .call(json!({
            "id": 1,
            "caller": BORROWER,
            "request": "create_reservation",
            "tool_id": fx.tool_id,
            "start_date": "2026-06-03",
            "end_date": "2026-06-05",
        }))
        .await;
    assert_eq!(reply["id"], json!(1));
    let reservation = data(&reply);
    assert_eq!(reservation["status"], json!("pending"));
    let rid = reservation["id"].as_str().unwrap().to_string();

    let reply = owner
        .call(json!({"caller": OWNER, "request": "approve", "reservation_id": rid}))
        .await;
    assert_eq!(data(&reply)["status"], json!("confirmed"));

    let reply = borrower
        .call(json!({"caller": BORROWER, "request": "confirm_pickup", "reservation_id": rid}))
        .await;
    assert_eq!(error_kind(&reply), "MissingRequiredPhoto");
    assert_eq!(reply["error"]["status"], json!(400));

    for (kind, command) in [("before", "confirm_pickup"), ("after", "confirm_return")] {
        let reply = borrower
            .call(json!({
                "caller": BORROWER,
                "request": "record_photo",
                "reservation_id": rid,
                "kind": kind,
                "url": format!("https://img.example/{kind}.jpg"),
            }))
            .await;
        data(&reply);
        let reply = borrower
            .call(json!({"caller": BORROWER, "request": command, "reservation_id": rid}))
            .await;
        data(&reply);
    }

    let reply = borrower
        .call(json!({
            "caller": BORROWER,
            "request": "create_review",
            "reservation_id": rid,
            "rating": 4,
            "comment": "sharp blades",
        }))
        .await;
    assert_eq!(data(&reply)["rating"], json!(4));

    let reply = borrower
        .call(json!({"caller": BORROWER, "request": "reputation", "user_id": fx.owner_id}))
        .await;
    assert_eq!(data(&reply), &json!(4.0));

    let reply = borrower
        .call(json!({
            "caller": BORROWER,
            "request": "create_review",
            "reservation_id": rid,
            "rating": 5,
        }))
        .await;
    assert_eq!(error_kind(&reply), "DuplicateReview");
    assert_eq!(reply["error"]["status"], json!(409));
}

#[tokio::test]
async fn listen_streams_decline_reason() {
    let fx = start_test_server().await;
    let mut borrower = Client::connect(fx.addr).await;
    let mut owner = Client::connect(fx.addr).await;

    data(&borrower.call(json!({"caller": BORROWER, "request": "listen"})).await);

    let reply = borrower
        .call(json!({
            "caller": BORROWER,
            "request": "create_reservation",
            "tool_id": fx.tool_id,
            "start_date": "2026-06-04",
            "end_date": "2026-06-04",
        }))
        .await;
    let rid = data(&reply)["id"].clone();

    let reply = owner
        .call(json!({
            "caller": OWNER,
            "request": "decline",
            "reservation_id": rid,
            "reason": "Tool under maintenance",
        }))
        .await;
    assert_eq!(data(&reply)["owner_note"], json!("Tool under maintenance"));

    let push = borrower.next_notification().await;
    assert_eq!(push["notification"]["kind"], json!("reservation_declined"));
    assert!(push["notification"]["message"]
        .as_str()
        .unwrap()
        .contains("Tool under maintenance"));

    let inbox = borrower
        .call(json!({"caller": BORROWER, "request": "notifications"}))
        .await;
    let items = data(&inbox).as_array().unwrap().clone();
    assert_eq!(items.len(), 1);
    let reply = borrower
        .call(json!({"caller": BORROWER, "request": "mark_read", "notification_id": items[0]["id"]}))
        .await;
    data(&reply);
}

#[tokio::test]
async fn policy_errors_carry_kind_and_status() {
    let fx = start_test_server().await;
    let mut client = Client::connect(fx.addr).await;

    // Tool needs a day of notice.
    let reply = client
        .call(json!({
            "caller": BORROWER,
            "request": "create_reservation",
            "tool_id": fx.tool_id,
            "start_date": "2026-06-01",
            "end_date": "2026-06-02",
        }))
        .await;
    assert_eq!(error_kind(&reply), "InsufficientAdvanceNotice");

    let reply = client
        .call(json!({
            "caller": BORROWER,
            "request": "create_reservation",
            "tool_id": fx.tool_id,
            "start_date": "2026-06-02",
            "end_date": "2026-06-17",
        }))
        .await;
    assert_eq!(error_kind(&reply), "LoanTooLong");

    let reply = client
        .call(json!({"caller": "auth|ghost", "request": "list_my_reservations"}))
        .await;
    assert_eq!(error_kind(&reply), "NotAuthorized");
    assert_eq!(reply["error"]["status"], json!(403));
}

#[tokio::test]
async fn malformed_lines_do_not_drop_the_connection() {
    let fx = start_test_server().await;
    let mut client = Client::connect(fx.addr).await;

    client.send_raw("not json".into()).await;
    let reply = client.next_line().await;
    assert_eq!(error_kind(&reply), "BadRequest");

    client
        .send_raw(json!({"caller": BORROWER, "request": "teleport"}).to_string())
        .await;
    assert_eq!(error_kind(&client.next_line().await), "BadRequest");

    let reply = client
        .call(json!({"caller": BORROWER, "request": "booked_ranges", "tool_id": fx.tool_id}))
        .await;
    assert_eq!(data(&reply), &json!([]));
}
