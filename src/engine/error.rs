use ulid::Ulid;

use crate::model::ReservationStatus;

use super::LedgerError;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    DuplicateIsbn(String),
    BookUnavailable(Ulid),
    BorrowLimitExceeded { member_id: Ulid, limit: u32 },
    AlreadyReturned(Ulid),
    Forbidden(Ulid),
    /// A catalogue change attempted by a member.
    LibrarianOnly(&'static str),
    DuplicateReservation(Ulid),
    InvalidState {
        id: Ulid,
        status: ReservationStatus,
    },
    /// The ledger refused an `increase`: a return arrived with every copy on the shelf.
    CapacityExceeded(Ulid),
    /// A librarian tried to shrink stock below what is lent out.
    CopiesOnLoan { book_id: Ulid, on_loan: u32 },
    InvalidInput(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Broken invariants and storage failures: defects, not caller mistakes.
    pub fn is_internal(&self) -> bool {
        matches!(self, EngineError::CapacityExceeded(_) | EngineError::WalError(_))
    }

    /// Stable snake_case code for clients.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::DuplicateIsbn(_) => "already_exists",
            EngineError::BookUnavailable(_) => "book_unavailable",
            EngineError::BorrowLimitExceeded { .. } => "borrow_limit_exceeded",
            EngineError::AlreadyReturned(_) => "already_returned",
            EngineError::Forbidden(_) | EngineError::LibrarianOnly(_) => "forbidden",
            EngineError::DuplicateReservation(_) => "duplicate_reservation",
            EngineError::InvalidState { .. } | EngineError::CopiesOnLoan { .. } => "invalid_state",
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::CapacityExceeded(_) | EngineError::WalError(_) => "internal",
        }
    }

    /// Map a ledger refusal on `book_id` into the caller-facing taxonomy.
    pub fn from_ledger(book_id: Ulid, err: LedgerError) -> Self {
        match err {
            LedgerError::OutOfStock => EngineError::BookUnavailable(book_id),
            LedgerError::CapacityExceeded => EngineError::CapacityExceeded(book_id),
            LedgerError::BelowOnLoan { on_loan } => EngineError::CopiesOnLoan { book_id, on_loan },
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::DuplicateIsbn(isbn) => write!(f, "isbn already registered: {isbn}"),
            EngineError::BookUnavailable(id) => write!(f, "no copy of book {id} available"),
            EngineError::BorrowLimitExceeded { member_id, limit } => {
                write!(f, "member {member_id} already holds {limit} active loans")
            }
            EngineError::AlreadyReturned(id) => write!(f, "loan {id} already returned"),
            EngineError::Forbidden(id) => write!(f, "not permitted to act on {id}"),
            EngineError::LibrarianOnly(action) => write!(f, "only librarians may {action}"),
            EngineError::DuplicateReservation(id) => {
                write!(f, "member already has active reservation {id} for this book")
            }
            EngineError::InvalidState { id, status } => {
                write!(f, "reservation {id} is {status:?}")
            }
            EngineError::CapacityExceeded(id) => {
                write!(f, "book {id}: available copies would exceed total")
            }
            EngineError::CopiesOnLoan { book_id, on_loan } => {
                write!(f, "book {book_id} has {on_loan} copies on loan")
            }
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
