//! Newline-delimited JSON protocol.
//!
//! Every request is one JSON object on one line:
//!
//! ```text
//! {"library":"main","member":"01J...","op":"borrow","book_id":"01J..."}
//! ```
//!
//! and gets exactly one reply line, `{"ok":true,"data":...}` or
//! `{"ok":false,"error":{"code":"...","message":"..."}}`. After a `listen`
//! the connection also receives `{"channel":"...","event":{...}}` lines,
//! interleaved with replies, for every event on that channel.

use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, BoxStream, SelectAll};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use ulid::Ulid;

use crate::engine::{now_ms, Engine, EngineError};
use crate::limits::MAX_REQUEST_LINE_LEN;
use crate::model::*;
use crate::observability;
use crate::tenant::LibraryManager;

fn default_library() -> String {
    "default".to_string()
}

/// One request line. `member` and `librarian` are the caller identity as
/// asserted by whatever authenticates the connection upstream.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Request {
    #[serde(default = "default_library")]
    pub library: String,
    pub member: Ulid,
    #[serde(default)]
    pub librarian: bool,
    #[serde(flatten)]
    pub op: Op,
}

impl Request {
    pub fn actor(&self) -> Actor {
        Actor {
            member_id: self.member,
            librarian: self.librarian,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    RegisterBook {
        isbn: String,
        title: String,
        author: String,
        publisher: String,
        total_copies: u32,
    },
    SetTotalCopies {
        book_id: Ulid,
        total_copies: u32,
    },
    /// `member_id` lets a librarian lend on a member's behalf at the desk.
    Borrow {
        book_id: Ulid,
        #[serde(default)]
        member_id: Option<Ulid>,
    },
    Return {
        loan_id: Ulid,
    },
    Reserve {
        book_id: Ulid,
        #[serde(default)]
        member_id: Option<Ulid>,
    },
    CancelReservation {
        reservation_id: Ulid,
    },
    GetBook {
        book_id: Ulid,
    },
    GetLoan {
        loan_id: Ulid,
    },
    GetReservation {
        reservation_id: Ulid,
    },
    ListBooks,
    ListLoans {
        #[serde(default)]
        member_id: Option<Ulid>,
    },
    ListActiveLoans {
        #[serde(default)]
        member_id: Option<Ulid>,
    },
    ListOverdueLoans,
    ListReservations {
        #[serde(default)]
        member_id: Option<Ulid>,
        #[serde(default)]
        active_only: bool,
    },
    /// Subscribe to a book id or a member id. Defaults to the caller's own id.
    Listen {
        #[serde(default)]
        channel: Option<Ulid>,
    },
}

/// Payload of a successful reply.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Data {
    Book(BookInfo),
    Books(Vec<BookInfo>),
    Loan(Loan),
    LoanInfo(LoanInfo),
    Loans(Vec<LoanInfo>),
    Returned(ReturnOutcome),
    Reservation(Reservation),
    Reservations(Vec<Reservation>),
    Listening { listening: Ulid },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

impl ErrorBody {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<EngineError> for ErrorBody {
    fn from(e: EngineError) -> Self {
        if e.is_internal() {
            // Details stay in the server log.
            tracing::error!("internal error: {e}");
            return Self::new(e.code(), "internal error");
        }
        Self::new(e.code(), e.to_string())
    }
}

#[derive(Debug, Serialize)]
struct Reply {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Data>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorBody>,
}

impl Reply {
    fn from_result(result: Result<Data, ErrorBody>) -> Self {
        match result {
            Ok(data) => Reply { ok: true, data: Some(data), error: None },
            Err(error) => Reply { ok: false, data: None, error: Some(error) },
        }
    }
}

#[derive(Debug, Serialize)]
struct Notification {
    channel: Ulid,
    event: Event,
}

type Subscriptions = SelectAll<BoxStream<'static, Notification>>;

/// Notifications on `channel` that `actor` may see.
fn subscription(channel: Ulid, actor: Actor, rx: broadcast::Receiver<Event>) -> BoxStream<'static, Notification> {
    stream::unfold(rx, move |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) if event.visible_to(&actor) => return Some((Notification { channel, event }, rx)),
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!("listener on {channel} lagged, {n} events dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

/// Narrow a listing to what the caller may see: librarians see everyone,
/// members only themselves.
fn scope(actor: &Actor, requested: Option<Ulid>) -> Result<Option<Ulid>, EngineError> {
    match requested {
        Some(member_id) if !actor.may_act_for(member_id) => Err(EngineError::Forbidden(member_id)),
        Some(member_id) => Ok(Some(member_id)),
        None if actor.librarian => Ok(None),
        None => Ok(Some(actor.member_id)),
    }
}

/// The member an operation is performed for: the caller, or anyone if the
/// caller is a librarian.
fn on_behalf_of(actor: &Actor, requested: Option<Ulid>) -> Result<Ulid, EngineError> {
    let member_id = requested.unwrap_or(actor.member_id);
    if actor.may_act_for(member_id) {
        Ok(member_id)
    } else {
        Err(EngineError::Forbidden(member_id))
    }
}

/// Run one non-listen operation against a library engine.
pub async fn execute(engine: &Engine, actor: &Actor, op: Op, now: Ms) -> Result<Data, EngineError> {
    match op {
        Op::RegisterBook {
            isbn,
            title,
            author,
            publisher,
            total_copies,
        } => engine
            .register_book(actor, isbn, title, author, publisher, total_copies)
            .await
            .map(Data::Book),
        Op::SetTotalCopies { book_id, total_copies } => engine
            .set_total_copies(book_id, actor, total_copies)
            .await
            .map(Data::Book),
        Op::Borrow { book_id, member_id } => {
            let member_id = on_behalf_of(actor, member_id)?;
            engine.borrow(member_id, book_id, now).await.map(Data::Loan)
        }
        Op::Return { loan_id } => engine.return_book(loan_id, actor, now).await.map(Data::Returned),
        Op::Reserve { book_id, member_id } => {
            let member_id = on_behalf_of(actor, member_id)?;
            engine.reserve(member_id, book_id, now).await.map(Data::Reservation)
        }
        Op::CancelReservation { reservation_id } => engine
            .cancel_reservation(reservation_id, actor, now)
            .await
            .map(Data::Reservation),
        Op::GetBook { book_id } => engine.book(book_id, now).await.map(Data::Book),
        Op::GetLoan { loan_id } => {
            let loan = engine.loan(loan_id, now).await?;
            if !actor.may_act_for(loan.member_id) {
                return Err(EngineError::Forbidden(loan_id));
            }
            Ok(Data::LoanInfo(loan))
        }
        Op::GetReservation { reservation_id } => {
            let reservation = engine.reservation(reservation_id).await?;
            if !actor.may_act_for(reservation.member_id) {
                return Err(EngineError::Forbidden(reservation_id));
            }
            Ok(Data::Reservation(reservation))
        }
        Op::ListBooks => Ok(Data::Books(engine.list_books(now).await)),
        Op::ListLoans { member_id } => {
            let member_id = scope(actor, member_id)?;
            Ok(Data::Loans(engine.list_loans(member_id, now).await))
        }
        Op::ListActiveLoans { member_id } => {
            let member_id = scope(actor, member_id)?;
            Ok(Data::Loans(engine.list_active_loans(member_id, now).await))
        }
        Op::ListOverdueLoans => {
            let mut loans = engine.list_overdue_loans(now).await;
            if !actor.librarian {
                loans.retain(|l| l.member_id == actor.member_id);
            }
            Ok(Data::Loans(loans))
        }
        Op::ListReservations { member_id, active_only } => {
            let member_id = scope(actor, member_id)?;
            Ok(Data::Reservations(engine.list_reservations(member_id, active_only).await))
        }
        Op::Listen { .. } => Err(EngineError::InvalidInput("listen is handled by the connection")),
    }
}

fn listen(
    engine: &Engine,
    actor: &Actor,
    channel: Option<Ulid>,
    library: &str,
    subscribed: &mut HashSet<(String, Ulid)>,
    subscriptions: &mut Subscriptions,
) -> Result<Data, EngineError> {
    let channel = channel.unwrap_or(actor.member_id);
    // Anyone may follow a book, but only sees other members' circulation if a
    // librarian. Member channels belong to their member.
    if engine.get_book(&channel).is_none() && !actor.may_act_for(channel) {
        return Err(EngineError::Forbidden(channel));
    }
    if subscribed.insert((library.to_string(), channel)) {
        subscriptions.push(subscription(channel, *actor, engine.notify.subscribe(channel)));
    }
    Ok(Data::Listening { listening: channel })
}

fn open_library(libraries: &LibraryManager, library: &str) -> Result<Arc<Engine>, ErrorBody> {
    libraries.get_or_create(library).map_err(|e| {
        if e.kind() == io::ErrorKind::InvalidInput {
            ErrorBody::new("invalid_input", e.to_string())
        } else {
            tracing::error!("cannot open library {library}: {e}");
            ErrorBody::new("unavailable", "library unavailable")
        }
    })
}

fn codec_err(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

async fn send_json<S, T>(framed: &mut Framed<S, LinesCodec>, value: &T) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: Serialize,
{
    let line = serde_json::to_string(value).map_err(io::Error::other)?;
    framed.send(line).await.map_err(codec_err)
}

/// Serve one client until it disconnects.
pub async fn process_connection<S>(socket: S, libraries: Arc<LibraryManager>) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_REQUEST_LINE_LEN));
    let mut subscribed = HashSet::new();
    let mut subscriptions: Subscriptions = SelectAll::new();

    loop {
        let line = tokio::select! {
            line = framed.next() => line,
            Some(notification) = subscriptions.next(), if !subscriptions.is_empty() => {
                send_json(&mut framed, &notification).await?;
                continue;
            }
        };
        let line = match line {
            None => return Ok(()),
            Some(Ok(line)) => line,
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                let reply = Reply::from_result(Err(ErrorBody::new("limit_exceeded", "request line too long")));
                send_json(&mut framed, &reply).await?;
                continue;
            }
            Some(Err(e)) => return Err(codec_err(e)),
        };
        if line.trim().is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                let reply = Reply::from_result(Err(ErrorBody::new("bad_request", e.to_string())));
                send_json(&mut framed, &reply).await?;
                continue;
            }
        };

        let op_label = observability::op_label(&request.op);
        let start = Instant::now();
        let actor = request.actor();
        let result = match open_library(&libraries, &request.library) {
            Err(e) => Err(e),
            Ok(engine) => match request.op {
                Op::Listen { channel } => listen(
                    &engine,
                    &actor,
                    channel,
                    &request.library,
                    &mut subscribed,
                    &mut subscriptions,
                )
                .map_err(ErrorBody::from),
                op => execute(&engine, &actor, op, now_ms()).await.map_err(ErrorBody::from),
            },
        };

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::REQUESTS_TOTAL, "op" => op_label, "status" => status).increment(1);
        metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "op" => op_label)
            .record(start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::debug!("{op_label} failed: {} ({})", e.message, e.code);
        }

        send_json(&mut framed, &Reply::from_result(result)).await?;
    }
}
