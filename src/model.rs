use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::Inventory;
use crate::limits::{DAY_MS, HOUR_MS};

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// Circulation rules applied by one library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    /// `due_at = issued_at + loan_period_ms`.
    pub loan_period_ms: Ms,
    /// How long a promoted reservation holds its copy.
    pub hold_window_ms: Ms,
    /// Concurrent ACTIVE loans per member.
    pub max_active_loans: u32,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            loan_period_ms: 14 * DAY_MS,
            hold_window_ms: 24 * HOUR_MS,
            max_active_loans: 3,
        }
    }
}

/// Who is calling, as asserted by the external auth layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub member_id: Ulid,
    pub librarian: bool,
}

impl Actor {
    pub fn member(member_id: Ulid) -> Self {
        Self { member_id, librarian: false }
    }

    pub fn librarian(member_id: Ulid) -> Self {
        Self { member_id, librarian: true }
    }

    /// Owners may act on their own records; librarians on anyone's.
    pub fn may_act_for(&self, owner: Ulid) -> bool {
        self.librarian || self.member_id == owner
    }
}

// ── Records ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Book {
    pub id: Ulid,
    pub isbn: String,
    pub title: String,
    pub author: String,
    pub publisher: String,
    pub inventory: Inventory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoanStatus {
    Active,
    Returned,
}

/// Status as seen by readers. `Overdue` is never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoanState {
    Active,
    Overdue,
    Returned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Loan {
    pub id: Ulid,
    pub book_id: Ulid,
    pub member_id: Ulid,
    pub status: LoanStatus,
    pub issued_at: Ms,
    pub due_at: Ms,
    pub returned_at: Option<Ms>,
}

impl Loan {
    pub fn is_active(&self) -> bool {
        self.status == LoanStatus::Active
    }

    pub fn is_overdue(&self, now: Ms) -> bool {
        self.is_active() && self.due_at < now
    }

    pub fn state_at(&self, now: Ms) -> LoanState {
        match self.status {
            LoanStatus::Returned => LoanState::Returned,
            LoanStatus::Active if self.due_at < now => LoanState::Overdue,
            LoanStatus::Active => LoanState::Active,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    /// Queued behind other members or waiting for a copy.
    Waiting,
    /// Promoted: a copy is set aside until `expires_at`.
    Available,
    /// The holder borrowed the book.
    Fulfilled,
    /// The hold window passed without a borrow.
    Expired,
    Cancelled,
}

impl ReservationStatus {
    pub fn is_active(self) -> bool {
        matches!(self, ReservationStatus::Waiting | ReservationStatus::Available)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub book_id: Ulid,
    pub member_id: Ulid,
    pub status: ReservationStatus,
    pub reserved_at: Ms,
    /// Set on promotion; `None` while WAITING.
    pub expires_at: Option<Ms>,
}

impl Reservation {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// AVAILABLE and still inside its hold window.
    pub fn is_live_hold(&self, now: Ms) -> bool {
        self.status == ReservationStatus::Available && self.expires_at.is_some_and(|e| e > now)
    }

    /// AVAILABLE but the hold window has passed.
    pub fn is_lapsed(&self, now: Ms) -> bool {
        self.status == ReservationStatus::Available && self.expires_at.is_some_and(|e| e <= now)
    }
}

/// Everything guarded by one book's lock: the title, its loan history and its queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookState {
    pub book: Book,
    /// Append-only, in issue order.
    pub loans: Vec<Loan>,
    /// Append-only, in request order (the FIFO order of the queue).
    pub reservations: Vec<Reservation>,
}

impl BookState {
    pub fn new(book: Book) -> Self {
        Self {
            book,
            loans: Vec::new(),
            reservations: Vec::new(),
        }
    }

    pub fn loan(&self, id: Ulid) -> Option<&Loan> {
        self.loans.iter().find(|l| l.id == id)
    }

    pub fn loan_mut(&mut self, id: Ulid) -> Option<&mut Loan> {
        self.loans.iter_mut().find(|l| l.id == id)
    }

    pub fn reservation(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    pub fn reservation_mut(&mut self, id: Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == id)
    }

    /// The member's WAITING or AVAILABLE reservation on this book, if any.
    pub fn active_reservation_of(&self, member_id: Ulid) -> Option<&Reservation> {
        self.reservations
            .iter()
            .find(|r| r.member_id == member_id && r.is_active())
    }

    pub fn active_loans(&self) -> impl Iterator<Item = &Loan> {
        self.loans.iter().filter(|l| l.is_active())
    }

    pub fn queued_reservations(&self) -> usize {
        self.reservations.iter().filter(|r| r.is_active()).count()
    }

    /// Copies set aside for live holds belonging to anyone other than `member_id`.
    pub fn held_for_others(&self, member_id: Ulid, now: Ms) -> u32 {
        self.reservations
            .iter()
            .filter(|r| r.member_id != member_id && r.is_live_hold(now))
            .count() as u32
    }
}

/// Reservation promoted as part of a return or a lapsed hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Promotion {
    pub reservation_id: Ulid,
    pub member_id: Ulid,
    pub expires_at: Ms,
}

/// Committed transactions. This is the WAL record format.
///
/// Each variant is one committed transaction: a return carries its promotion, a
/// borrow carries the reservation it fulfils, so replay never sees half a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BookRegistered {
        id: Ulid,
        isbn: String,
        title: String,
        author: String,
        publisher: String,
        total_copies: u32,
    },
    CopiesAdjusted {
        book_id: Ulid,
        total_copies: u32,
    },
    LoanIssued {
        id: Ulid,
        book_id: Ulid,
        member_id: Ulid,
        issued_at: Ms,
        due_at: Ms,
        fulfilled: Option<Ulid>,
    },
    LoanReturned {
        id: Ulid,
        book_id: Ulid,
        member_id: Ulid,
        returned_at: Ms,
        promoted: Option<Promotion>,
    },
    ReservationRequested {
        id: Ulid,
        book_id: Ulid,
        member_id: Ulid,
        reserved_at: Ms,
    },
    ReservationCancelled {
        id: Ulid,
        book_id: Ulid,
        member_id: Ulid,
    },
    HoldLapsed {
        id: Ulid,
        book_id: Ulid,
        member_id: Ulid,
        promoted: Option<Promotion>,
    },
    /// Compaction snapshot of a whole book row.
    BookRestored {
        state: BookState,
    },
}

impl Event {
    pub fn book_id(&self) -> Ulid {
        match self {
            Event::BookRegistered { id, .. } => *id,
            Event::BookRestored { state } => state.book.id,
            Event::CopiesAdjusted { book_id, .. }
            | Event::LoanIssued { book_id, .. }
            | Event::LoanReturned { book_id, .. }
            | Event::ReservationRequested { book_id, .. }
            | Event::ReservationCancelled { book_id, .. }
            | Event::HoldLapsed { book_id, .. } => *book_id,
        }
    }

    /// Members whose records this event touches (for notifications).
    pub fn members(&self) -> Vec<Ulid> {
        match self {
            Event::BookRegistered { .. } | Event::CopiesAdjusted { .. } | Event::BookRestored { .. } => {
                Vec::new()
            }
            Event::LoanIssued { member_id, .. }
            | Event::ReservationRequested { member_id, .. }
            | Event::ReservationCancelled { member_id, .. } => vec![*member_id],
            Event::LoanReturned { member_id, promoted, .. }
            | Event::HoldLapsed { member_id, promoted, .. } => {
                let mut out = vec![*member_id];
                if let Some(p) = promoted {
                    out.push(p.member_id);
                }
                out
            }
        }
    }

    /// Whether a listener may receive this event. Catalogue events are public;
    /// circulation events reach librarians and the members they concern.
    pub fn visible_to(&self, actor: &Actor) -> bool {
        if actor.librarian {
            return true;
        }
        let members = self.members();
        members.is_empty() || members.contains(&actor.member_id)
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookInfo {
    pub id: Ulid,
    pub isbn: String,
    pub title: String,
    pub author: String,
    pub publisher: String,
    pub total_copies: u32,
    pub available_copies: u32,
    /// Copies on the shelf but set aside for promoted reservations.
    pub held_copies: u32,
    pub queued_reservations: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanInfo {
    pub id: Ulid,
    pub book_id: Ulid,
    pub member_id: Ulid,
    pub state: LoanState,
    pub issued_at: Ms,
    pub due_at: Ms,
    pub returned_at: Option<Ms>,
}

impl LoanInfo {
    pub fn from_loan(loan: &Loan, now: Ms) -> Self {
        Self {
            id: loan.id,
            book_id: loan.book_id,
            member_id: loan.member_id,
            state: loan.state_at(now),
            issued_at: loan.issued_at,
            due_at: loan.due_at,
            returned_at: loan.returned_at,
        }
    }
}

/// Result of a return: the closed loan plus the reservation promoted by it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnOutcome {
    pub loan: Loan,
    pub promoted: Option<Reservation>,
}

/// A hold that ran out, and who (if anyone) inherited the copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldLapse {
    pub reservation_id: Ulid,
    pub promoted: Option<Promotion>,
}
