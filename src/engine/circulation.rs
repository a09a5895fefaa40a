//! Circulation service: the transactions external callers run.
//!
//! Every operation validates and commits under the owning book's write lock, so
//! check-then-mutate is atomic per book. Borrow and return also hold the member's
//! ledger lock, always taken first.

use tokio::sync::OwnedRwLockWriteGuard;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::queries::book_info;
use super::{loans, now_ms, reservations, validate_timestamp, Engine, EngineError, Inventory};

fn check_field(value: &str, max: usize, empty: &'static str, too_long: &'static str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::InvalidInput(empty));
    }
    if value.len() > max {
        return Err(EngineError::LimitExceeded(too_long));
    }
    Ok(())
}

fn check_copies(total_copies: u32) -> Result<(), EngineError> {
    if total_copies == 0 {
        return Err(EngineError::InvalidInput("total_copies must be positive"));
    }
    if total_copies > MAX_COPIES_PER_BOOK {
        return Err(EngineError::LimitExceeded("too many copies"));
    }
    Ok(())
}

/// Internal failures are defects: log them where they surface.
fn note_defect(err: EngineError) -> EngineError {
    if err.is_internal() {
        tracing::error!("circulation defect: {err}");
        metrics::counter!(observability::INVARIANT_VIOLATIONS_TOTAL).increment(1);
    }
    err
}

impl Engine {
    /// Add a title to the catalogue with every copy on the shelf. Librarians only.
    pub async fn register_book(
        &self,
        actor: &Actor,
        isbn: String,
        title: String,
        author: String,
        publisher: String,
        total_copies: u32,
    ) -> Result<BookInfo, EngineError> {
        if !actor.librarian {
            return Err(EngineError::LibrarianOnly("register books"));
        }
        check_field(&isbn, MAX_ISBN_LEN, "isbn is empty", "isbn too long")?;
        check_field(&title, MAX_TITLE_LEN, "title is empty", "title too long")?;
        check_field(&author, MAX_AUTHOR_LEN, "author is empty", "author too long")?;
        check_field(&publisher, MAX_PUBLISHER_LEN, "publisher is empty", "publisher too long")?;
        check_copies(total_copies)?;

        let _catalog = self.catalog.lock().await;
        let id = Ulid::new();
        if self.state.len() >= MAX_BOOKS_PER_LIBRARY {
            return Err(EngineError::LimitExceeded("too many books"));
        }
        if self.isbn_index.contains_key(&isbn) {
            return Err(EngineError::DuplicateIsbn(isbn));
        }

        let event = Event::BookRegistered {
            id,
            isbn: isbn.clone(),
            title: title.clone(),
            author: author.clone(),
            publisher: publisher.clone(),
            total_copies,
        };
        self.wal_append(&event).await?;
        let bs = BookState::new(Book {
            id,
            isbn,
            title,
            author,
            publisher,
            inventory: Inventory::new(total_copies),
        });
        let info = book_info(&bs, now_ms());
        self.insert_book(bs);
        self.notify.publish(&event);
        tracing::info!("registered book {id} ({total_copies} copies)");
        Ok(info)
    }

    /// Change how many copies the library owns. Lent copies stay lent; the shelf
    /// count absorbs the difference. Librarians only.
    pub async fn set_total_copies(&self, book_id: Ulid, actor: &Actor, total_copies: u32) -> Result<BookInfo, EngineError> {
        if !actor.librarian {
            return Err(EngineError::Forbidden(book_id));
        }
        check_copies(total_copies)?;
        let rs = self.get_book(&book_id).ok_or(EngineError::NotFound(book_id))?;
        let mut guard = rs.write().await;

        let mut trial = guard.book.inventory;
        trial
            .resize(total_copies)
            .map_err(|e| EngineError::from_ledger(book_id, e))?;

        let event = Event::CopiesAdjusted { book_id, total_copies };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(book_info(&guard, now_ms()))
    }

    /// Lend one copy of `book_id` to `member_id`.
    ///
    /// Fails with `BorrowLimitExceeded` at the member's cap, and `BookUnavailable`
    /// when no copy is on the shelf or every shelf copy is held for someone else.
    /// A reservation the member holds on the book is fulfilled by the loan.
    pub async fn borrow(&self, member_id: Ulid, book_id: Ulid, now: Ms) -> Result<Loan, EngineError> {
        validate_timestamp(now)?;
        let rs = self.get_book(&book_id).ok_or(EngineError::NotFound(book_id))?;
        let mut member = self.lock_member(member_id).await;
        let mut guard = rs.write().await;

        let loan_id = Ulid::new();
        let issued = match loans::plan_issue(&guard, &member, &self.policy, loan_id, member_id, now) {
            Ok(event) => self.persist_and_apply(&mut guard, &event).await,
            Err(e) => Err(e),
        };
        if let Err(e) = issued {
            self.release_member(member_id, &member);
            return Err(e);
        }
        member.open(loan_id);

        let loan = guard.loan(loan_id).cloned().ok_or(EngineError::NotFound(loan_id))?;
        tracing::debug!("loan {loan_id}: book {book_id} to member {member_id}, due {}", loan.due_at);
        Ok(loan)
    }

    /// Close an ACTIVE loan and hand the freed copy to the head of the queue.
    pub async fn return_book(&self, loan_id: Ulid, actor: &Actor, now: Ms) -> Result<ReturnOutcome, EngineError> {
        validate_timestamp(now)?;
        let entity = self.get_entity(&loan_id).ok_or(EngineError::NotFound(loan_id))?;
        let mut member = self.lock_member(entity.member_id).await;
        let committed = self.commit_return(loan_id, actor, now).await;
        if committed.is_ok() {
            member.close(loan_id);
        }
        self.release_member(entity.member_id, &member);
        let (event, guard) = committed?;

        let loan = guard.loan(loan_id).cloned().ok_or(EngineError::NotFound(loan_id))?;
        let promoted = match &event {
            Event::LoanReturned { promoted: Some(p), .. } => guard.reservation(p.reservation_id).cloned(),
            _ => None,
        };
        if let Some(r) = &promoted {
            tracing::info!("reservation {} promoted for member {}", r.id, r.member_id);
        }
        Ok(ReturnOutcome { loan, promoted })
    }

    async fn commit_return(
        &self,
        loan_id: Ulid,
        actor: &Actor,
        now: Ms,
    ) -> Result<(Event, OwnedRwLockWriteGuard<BookState>), EngineError> {
        let (_, mut guard) = self.resolve_entity_write(&loan_id).await?;
        let event = loans::plan_return(&guard, &self.policy, loan_id, actor, now).map_err(note_defect)?;
        self.persist_and_apply(&mut guard, &event).await?;
        Ok((event, guard))
    }

    /// Join the queue for `book_id`.
    pub async fn reserve(&self, member_id: Ulid, book_id: Ulid, now: Ms) -> Result<Reservation, EngineError> {
        validate_timestamp(now)?;
        let rs = self.get_book(&book_id).ok_or(EngineError::NotFound(book_id))?;
        let mut guard = rs.write().await;

        let reservation_id = Ulid::new();
        let event = reservations::plan_request(&guard, reservation_id, member_id, now)?;
        self.persist_and_apply(&mut guard, &event).await?;
        guard
            .reservation(reservation_id)
            .cloned()
            .ok_or(EngineError::NotFound(reservation_id))
    }

    /// Cancel a WAITING or AVAILABLE reservation. A cancelled hold frees its copy
    /// for general borrowing; the next member in line is not promoted.
    pub async fn cancel_reservation(&self, reservation_id: Ulid, actor: &Actor, now: Ms) -> Result<Reservation, EngineError> {
        validate_timestamp(now)?;
        let (_, mut guard) = self.resolve_entity_write(&reservation_id).await?;

        let event = reservations::plan_cancel(&guard, reservation_id, actor)?;
        self.persist_and_apply(&mut guard, &event).await?;
        guard
            .reservation(reservation_id)
            .cloned()
            .ok_or(EngineError::NotFound(reservation_id))
    }

    /// Expire one AVAILABLE reservation whose hold window has passed, passing the
    /// copy to the next member in line. `Ok(None)` if there was nothing to expire.
    pub async fn lapse_hold(&self, reservation_id: Ulid, now: Ms) -> Result<Option<HoldLapse>, EngineError> {
        let (_, mut guard) = self.resolve_entity_write(&reservation_id).await?;
        let Some(event) = reservations::plan_lapse(&guard, reservation_id, &self.policy, now) else {
            return Ok(None);
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(observability::HOLDS_LAPSED_TOTAL).increment(1);
        let promoted = match event {
            Event::HoldLapsed { promoted, .. } => promoted,
            _ => None,
        };
        Ok(Some(HoldLapse { reservation_id, promoted }))
    }

    /// `(book_id, reservation_id)` of every lapsed hold.
    pub async fn collect_lapsed_holds(&self, now: Ms) -> Vec<(Ulid, Ulid)> {
        let mut out = Vec::new();
        for rs in self.books_snapshot() {
            let guard = rs.read().await;
            for id in reservations::lapsed(&guard, now) {
                out.push((guard.book.id, id));
            }
        }
        out
    }
}
