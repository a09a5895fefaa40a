//! Loan manager: borrow caps, loan periods, and the return transition.

use std::collections::HashSet;

use ulid::Ulid;

use crate::model::*;

use super::reservations;
use super::{EngineError, LedgerError};

/// Active loans of one member, across every book. Guarded by a per-member mutex
/// that is always taken before any book lock.
#[derive(Debug, Default)]
pub struct MemberLedger {
    active: HashSet<Ulid>,
}

impl MemberLedger {
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn open(&mut self, loan_id: Ulid) {
        self.active.insert(loan_id);
    }

    pub fn close(&mut self, loan_id: Ulid) {
        self.active.remove(&loan_id);
    }
}

/// Validate a borrow against the member's ledger and the book row, and build the
/// event that commits it. Nothing is mutated here.
pub(super) fn plan_issue(
    bs: &BookState,
    member: &MemberLedger,
    policy: &Policy,
    loan_id: Ulid,
    member_id: Ulid,
    now: Ms,
) -> Result<Event, EngineError> {
    if member.active_count() >= policy.max_active_loans as usize {
        return Err(EngineError::BorrowLimitExceeded {
            member_id,
            limit: policy.max_active_loans,
        });
    }
    // Copies earmarked for other members' live holds are not on offer.
    let held = bs.held_for_others(member_id, now);
    if bs.book.inventory.available() <= held {
        return Err(EngineError::BookUnavailable(bs.book.id));
    }
    Ok(Event::LoanIssued {
        id: loan_id,
        book_id: bs.book.id,
        member_id,
        issued_at: now,
        due_at: now.saturating_add(policy.loan_period_ms),
        fulfilled: bs.active_reservation_of(member_id).map(|r| r.id),
    })
}

/// Validate a return by `actor` and build the event, including the promotion the
/// freed copy triggers.
pub(super) fn plan_return(
    bs: &BookState,
    policy: &Policy,
    loan_id: Ulid,
    actor: &Actor,
    now: Ms,
) -> Result<Event, EngineError> {
    let loan = bs.loan(loan_id).ok_or(EngineError::NotFound(loan_id))?;
    if !actor.may_act_for(loan.member_id) {
        return Err(EngineError::Forbidden(loan_id));
    }
    if !loan.is_active() {
        return Err(EngineError::AlreadyReturned(loan_id));
    }
    if !bs.book.inventory.can_increase() {
        return Err(EngineError::CapacityExceeded(bs.book.id));
    }
    Ok(Event::LoanReturned {
        id: loan_id,
        book_id: bs.book.id,
        member_id: loan.member_id,
        returned_at: now,
        promoted: reservations::promotion_after(bs, 1, policy, now),
    })
}

/// Apply a committed issue: decrement the ledger, record the loan, close the
/// reservation it fulfils.
pub(super) fn record_issue(bs: &mut BookState, loan: Loan, fulfilled: Option<Ulid>) -> Result<(), LedgerError> {
    bs.book.inventory.decrease()?;
    if let Some(rid) = fulfilled {
        reservations::record_fulfilment(bs, rid);
    }
    bs.loans.push(loan);
    Ok(())
}

/// Apply a committed return: the single ACTIVE → RETURNED transition plus the increment.
pub(super) fn record_return(bs: &mut BookState, loan_id: Ulid, returned_at: Ms) -> Result<(), LedgerError> {
    bs.book.inventory.increase()?;
    if let Some(loan) = bs.loan_mut(loan_id) {
        loan.status = LoanStatus::Returned;
        loan.returned_at = Some(returned_at);
    }
    Ok(())
}
