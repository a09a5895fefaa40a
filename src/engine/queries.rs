use std::cmp::Reverse;

use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError, SharedBookState};

pub(super) fn book_info(bs: &BookState, now: Ms) -> BookInfo {
    let b = &bs.book;
    BookInfo {
        id: b.id,
        isbn: b.isbn.clone(),
        title: b.title.clone(),
        author: b.author.clone(),
        publisher: b.publisher.clone(),
        total_copies: b.inventory.total(),
        available_copies: b.inventory.available(),
        held_copies: bs.reservations.iter().filter(|r| r.is_live_hold(now)).count() as u32,
        queued_reservations: bs.queued_reservations(),
    }
}

impl Engine {
    /// Clone out every book handle so no map shard is held across an await.
    pub(super) fn books_snapshot(&self) -> Vec<SharedBookState> {
        self.state.iter().map(|e| e.value().clone()).collect()
    }

    pub async fn book(&self, book_id: Ulid, now: Ms) -> Result<BookInfo, EngineError> {
        let rs = self.get_book(&book_id).ok_or(EngineError::NotFound(book_id))?;
        let guard = rs.read().await;
        Ok(book_info(&guard, now))
    }

    pub fn book_id_for_isbn(&self, isbn: &str) -> Option<Ulid> {
        self.isbn_index.get(isbn).map(|e| *e.value())
    }

    /// Every title, ordered by id.
    pub async fn list_books(&self, now: Ms) -> Vec<BookInfo> {
        let mut out = Vec::new();
        for rs in self.books_snapshot() {
            out.push(book_info(&*rs.read().await, now));
        }
        out.sort_by_key(|b| b.id);
        out
    }

    pub async fn loan(&self, loan_id: Ulid, now: Ms) -> Result<LoanInfo, EngineError> {
        let entity = self.get_entity(&loan_id).ok_or(EngineError::NotFound(loan_id))?;
        let rs = self.get_book(&entity.book_id).ok_or(EngineError::NotFound(entity.book_id))?;
        let guard = rs.read().await;
        guard
            .loan(loan_id)
            .map(|l| LoanInfo::from_loan(l, now))
            .ok_or(EngineError::NotFound(loan_id))
    }

    pub async fn reservation(&self, reservation_id: Ulid) -> Result<Reservation, EngineError> {
        let entity = self
            .get_entity(&reservation_id)
            .ok_or(EngineError::NotFound(reservation_id))?;
        let rs = self.get_book(&entity.book_id).ok_or(EngineError::NotFound(entity.book_id))?;
        let guard = rs.read().await;
        guard
            .reservation(reservation_id)
            .cloned()
            .ok_or(EngineError::NotFound(reservation_id))
    }

    async fn collect_loans(&self, keep: impl Fn(&Loan) -> bool, now: Ms) -> Vec<LoanInfo> {
        let mut out = Vec::new();
        for rs in self.books_snapshot() {
            let guard = rs.read().await;
            out.extend(guard.loans.iter().filter(|l| keep(*l)).map(|l| LoanInfo::from_loan(l, now)));
        }
        out
    }

    /// Full loan history, newest first. `None` lists every member.
    pub async fn list_loans(&self, member_id: Option<Ulid>, now: Ms) -> Vec<LoanInfo> {
        let mut out = self
            .collect_loans(|l| member_id.is_none_or(|m| l.member_id == m), now)
            .await;
        out.sort_by_key(|l| Reverse(l.issued_at));
        out
    }

    /// ACTIVE loans (overdue included), newest first.
    pub async fn list_active_loans(&self, member_id: Option<Ulid>, now: Ms) -> Vec<LoanInfo> {
        let mut out = self
            .collect_loans(
                |l| l.is_active() && member_id.is_none_or(|m| l.member_id == m),
                now,
            )
            .await;
        out.sort_by_key(|l| Reverse(l.issued_at));
        out
    }

    /// ACTIVE loans past their due date, most overdue first.
    pub async fn list_overdue_loans(&self, now: Ms) -> Vec<LoanInfo> {
        let mut out = self.collect_loans(|l| l.is_overdue(now), now).await;
        out.sort_by_key(|l| l.due_at);
        out
    }

    /// Reservations in queue order. `active_only` keeps WAITING and AVAILABLE.
    pub async fn list_reservations(&self, member_id: Option<Ulid>, active_only: bool) -> Vec<Reservation> {
        let mut out = Vec::new();
        for rs in self.books_snapshot() {
            let guard = rs.read().await;
            out.extend(
                guard
                    .reservations
                    .iter()
                    .filter(|r| member_id.is_none_or(|m| r.member_id == m))
                    .filter(|r| !active_only || r.is_active())
                    .cloned(),
            );
        }
        // Stable: equal timestamps keep per-book request order.
        out.sort_by_key(|r| r.reserved_at);
        out
    }

    /// Number of ACTIVE loans the member holds right now.
    pub async fn active_loan_count(&self, member_id: Ulid) -> usize {
        match self.members.get(&member_id).map(|e| e.value().clone()) {
            Some(ledger) => ledger.lock().await.active_count(),
            None => 0,
        }
    }
}
