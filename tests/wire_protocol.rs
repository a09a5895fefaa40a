use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;

use shelfd::model::Policy;
use shelfd::tenant::LibraryManager;
use shelfd::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<LibraryManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("shelfd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let libraries = Arc::new(LibraryManager::new(dir, 1000, Policy::default(), Duration::from_secs(60)));

    let libs = libraries.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let libs = libs.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, libs).await;
            });
        }
    });

    (addr, libraries)
}

struct Client {
    framed: Framed<TcpStream, LinesCodec>,
    member: Ulid,
    librarian: bool,
}

impl Client {
    async fn connect(addr: SocketAddr, member: Ulid, librarian: bool) -> Self {
        let socket = TcpStream::connect(addr).await.unwrap();
        Self {
            framed: Framed::new(socket, LinesCodec::new()),
            member,
            librarian,
        }
    }

    /// Send one op and return the next reply line (skipping notifications).
    async fn call(&mut self, op: Value) -> Value {
        let mut request = json!({
            "library": "test",
            "member": self.member.to_string(),
            "librarian": self.librarian,
        });
        for (k, v) in op.as_object().unwrap() {
            request[k] = v.clone();
        }
        self.framed.send(request.to_string()).await.unwrap();
        loop {
            let line = self.framed.next().await.unwrap().unwrap();
            let value: Value = serde_json::from_str(&line).unwrap();
            if value.get("ok").is_some() {
                return value;
            }
        }
    }

    /// Wait for the next notification line.
    async fn notification(&mut self, timeout: Duration) -> Option<Value> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let line = tokio::time::timeout_at(deadline, self.framed.next())
                .await
                .ok()??
                .ok()?;
            let value: Value = serde_json::from_str(&line).ok()?;
            if value.get("event").is_some() {
                return Some(value);
            }
        }
    }
}

async fn register(librarian: &mut Client, isbn: &str, copies: u32) -> String {
    let reply = librarian
        .call(json!({
            "op": "register_book",
            "isbn": isbn,
            "title": "The Left Hand of Darkness",
            "author": "Le Guin",
            "publisher": "Ace",
            "total_copies": copies,
        }))
        .await;
    assert_eq!(reply["ok"], true, "{reply}");
    reply["data"]["id"].as_str().unwrap().to_string()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn borrow_reserve_return_over_the_wire() {
    let (addr, _libraries) = start_test_server().await;
    let mut desk = Client::connect(addr, Ulid::new(), true).await;
    let mut a = Client::connect(addr, Ulid::new(), false).await;
    let mut b = Client::connect(addr, Ulid::new(), false).await;

    let book = register(&mut desk, "9780441478125", 1).await;

    let loan = a.call(json!({"op": "borrow", "book_id": book})).await;
    assert_eq!(loan["ok"], true);
    let loan_id = loan["data"]["id"].as_str().unwrap().to_string();

    let refused = b.call(json!({"op": "borrow", "book_id": book})).await;
    assert_eq!(refused["ok"], false);
    assert_eq!(refused["error"]["code"], "book_unavailable");

    let reservation = b.call(json!({"op": "reserve", "book_id": book})).await;
    assert_eq!(reservation["data"]["status"], "WAITING");
    assert!(reservation["data"]["expires_at"].is_null());

    // Only the borrower (or a librarian) may return.
    let forbidden = b.call(json!({"op": "return", "loan_id": loan_id})).await;
    assert_eq!(forbidden["error"]["code"], "forbidden");

    let returned = a.call(json!({"op": "return", "loan_id": loan_id})).await;
    assert_eq!(returned["ok"], true);
    assert_eq!(returned["data"]["loan"]["status"], "RETURNED");
    assert_eq!(returned["data"]["promoted"]["status"], "AVAILABLE");
    assert_eq!(returned["data"]["promoted"]["id"], reservation["data"]["id"]);

    let again = a.call(json!({"op": "return", "loan_id": loan_id})).await;
    assert_eq!(again["error"]["code"], "already_returned");

    let info = desk.call(json!({"op": "get_book", "book_id": book})).await;
    assert_eq!(info["data"]["available_copies"], 1);
    assert_eq!(info["data"]["held_copies"], 1);
}

#[tokio::test]
async fn members_only_see_their_own_records() {
    let (addr, _libraries) = start_test_server().await;
    let mut desk = Client::connect(addr, Ulid::new(), true).await;
    let mut a = Client::connect(addr, Ulid::new(), false).await;
    let mut b = Client::connect(addr, Ulid::new(), false).await;

    let book = register(&mut desk, "9780060512750", 3).await;
    a.call(json!({"op": "borrow", "book_id": book})).await;
    b.call(json!({"op": "borrow", "book_id": book})).await;

    let mine = a.call(json!({"op": "list_active_loans"})).await;
    assert_eq!(mine["data"].as_array().unwrap().len(), 1);

    let theirs = a
        .call(json!({"op": "list_loans", "member_id": b.member.to_string()}))
        .await;
    assert_eq!(theirs["error"]["code"], "forbidden");

    let all = desk.call(json!({"op": "list_active_loans"})).await;
    assert_eq!(all["data"].as_array().unwrap().len(), 2);

    let overdue = desk.call(json!({"op": "list_overdue_loans"})).await;
    assert!(overdue["data"].as_array().unwrap().is_empty());

    // Members cannot catalogue books.
    let denied = a
        .call(json!({
            "op": "register_book",
            "isbn": "9780000000000",
            "title": "T",
            "author": "A",
            "publisher": "P",
            "total_copies": 1,
        }))
        .await;
    assert_eq!(denied["error"]["code"], "forbidden");
}

#[tokio::test]
async fn borrow_cap_over_the_wire() {
    let (addr, _libraries) = start_test_server().await;
    let mut desk = Client::connect(addr, Ulid::new(), true).await;
    let mut member = Client::connect(addr, Ulid::new(), false).await;

    let mut books = Vec::new();
    for i in 0..4 {
        books.push(register(&mut desk, &format!("978000000010{i}"), 1).await);
    }
    for book in &books[..3] {
        let reply = member.call(json!({"op": "borrow", "book_id": book})).await;
        assert_eq!(reply["ok"], true);
    }
    let reply = member.call(json!({"op": "borrow", "book_id": books[3]})).await;
    assert_eq!(reply["error"]["code"], "borrow_limit_exceeded");
}

#[tokio::test]
async fn listener_hears_promotion() {
    let (addr, _libraries) = start_test_server().await;
    let mut desk = Client::connect(addr, Ulid::new(), true).await;
    let mut a = Client::connect(addr, Ulid::new(), false).await;
    let mut b = Client::connect(addr, Ulid::new(), false).await;

    let book = register(&mut desk, "9780553293357", 1).await;
    let loan = a.call(json!({"op": "borrow", "book_id": book})).await;
    let loan_id = loan["data"]["id"].as_str().unwrap().to_string();
    b.call(json!({"op": "reserve", "book_id": book})).await;

    let listening = b.call(json!({"op": "listen"})).await;
    assert_eq!(listening["data"]["listening"], b.member.to_string());

    a.call(json!({"op": "return", "loan_id": loan_id})).await;

    let note = b.notification(Duration::from_secs(2)).await.expect("no notification");
    assert_eq!(note["channel"], b.member.to_string());
    let returned = &note["event"]["LoanReturned"];
    assert_eq!(returned["promoted"]["member_id"], b.member.to_string());
}

#[tokio::test]
async fn book_listeners_only_see_their_own_circulation() {
    let (addr, _libraries) = start_test_server().await;
    let mut desk = Client::connect(addr, Ulid::new(), true).await;
    let mut borrower = Client::connect(addr, Ulid::new(), false).await;
    let mut onlooker = Client::connect(addr, Ulid::new(), false).await;

    let book = register(&mut desk, "9780441569595", 2).await;
    let listening = onlooker.call(json!({"op": "listen", "channel": book})).await;
    assert_eq!(listening["ok"], true);
    let listening = desk.call(json!({"op": "listen", "channel": book})).await;
    assert_eq!(listening["ok"], true);

    let loan = borrower.call(json!({"op": "borrow", "book_id": book})).await;
    assert_eq!(loan["ok"], true);

    // Librarians see every loan on the book.
    let note = desk.notification(Duration::from_secs(2)).await.expect("no notification");
    assert_eq!(note["event"]["LoanIssued"]["member_id"], borrower.member.to_string());

    let adjusted = desk
        .call(json!({"op": "set_total_copies", "book_id": book, "total_copies": 3}))
        .await;
    assert_eq!(adjusted["ok"], true);

    // The loan is skipped; the next thing the member hears is the catalogue change.
    let note = onlooker.notification(Duration::from_secs(2)).await.expect("no notification");
    assert!(note["event"]["CopiesAdjusted"].is_object(), "{note}");
    assert!(!note.to_string().contains(&borrower.member.to_string()));
}

#[tokio::test]
async fn cannot_listen_on_another_member() {
    let (addr, _libraries) = start_test_server().await;
    let mut a = Client::connect(addr, Ulid::new(), false).await;
    let reply = a
        .call(json!({"op": "listen", "channel": Ulid::new().to_string()}))
        .await;
    assert_eq!(reply["error"]["code"], "forbidden");
}

#[tokio::test]
async fn malformed_requests_keep_the_connection_open() {
    let (addr, _libraries) = start_test_server().await;
    let mut client = Client::connect(addr, Ulid::new(), false).await;

    client.framed.send("{not json".to_string()).await.unwrap();
    let line = client.framed.next().await.unwrap().unwrap();
    let reply: Value = serde_json::from_str(&line).unwrap();
    assert_eq!(reply["error"]["code"], "bad_request");

    let reply = client.call(json!({"op": "list_books"})).await;
    assert_eq!(reply["ok"], true);
}

#[tokio::test]
async fn libraries_are_isolated() {
    let (addr, libraries) = start_test_server().await;
    let mut desk = Client::connect(addr, Ulid::new(), true).await;
    let book = register(&mut desk, "9780765326355", 1).await;

    let other = libraries.get_or_create("elsewhere").unwrap();
    assert!(other.list_books(shelfd::engine::now_ms()).await.is_empty());
    let here = libraries.get_or_create("test").unwrap();
    assert_eq!(here.list_books(shelfd::engine::now_ms()).await[0].id.to_string(), book);
}
