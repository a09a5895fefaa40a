//! Per-book FIFO reservation queue.

use ulid::Ulid;

use crate::limits::MAX_QUEUED_RESERVATIONS;
use crate::model::*;

use super::EngineError;

pub(super) fn plan_request(
    bs: &BookState,
    reservation_id: Ulid,
    member_id: Ulid,
    now: Ms,
) -> Result<Event, EngineError> {
    if let Some(existing) = bs.active_reservation_of(member_id) {
        return Err(EngineError::DuplicateReservation(existing.id));
    }
    if bs.queued_reservations() >= MAX_QUEUED_RESERVATIONS {
        return Err(EngineError::LimitExceeded("too many reservations queued on book"));
    }
    Ok(Event::ReservationRequested {
        id: reservation_id,
        book_id: bs.book.id,
        member_id,
        reserved_at: now,
    })
}

pub(super) fn plan_cancel(bs: &BookState, reservation_id: Ulid, actor: &Actor) -> Result<Event, EngineError> {
    let r = bs
        .reservation(reservation_id)
        .ok_or(EngineError::NotFound(reservation_id))?;
    if !actor.may_act_for(r.member_id) {
        return Err(EngineError::Forbidden(reservation_id));
    }
    if !r.is_active() {
        return Err(EngineError::InvalidState {
            id: reservation_id,
            status: r.status,
        });
    }
    Ok(Event::ReservationCancelled {
        id: reservation_id,
        book_id: bs.book.id,
        member_id: r.member_id,
    })
}

/// Build the lapse of an AVAILABLE reservation whose hold window has passed.
/// `None` if it was borrowed, cancelled or already swept in the meantime.
pub(super) fn plan_lapse(bs: &BookState, reservation_id: Ulid, policy: &Policy, now: Ms) -> Option<Event> {
    let r = bs.reservation(reservation_id)?;
    if !r.is_lapsed(now) {
        return None;
    }
    Some(Event::HoldLapsed {
        id: reservation_id,
        book_id: bs.book.id,
        member_id: r.member_id,
        promoted: promotion_after(bs, 0, policy, now),
    })
}

/// Head of the queue: earliest `reserved_at`, ties broken by request order.
pub(super) fn next_in_line(bs: &BookState) -> Option<&Reservation> {
    // min_by_key keeps the first of equal keys, and `reservations` is in request order.
    bs.reservations
        .iter()
        .filter(|r| r.status == ReservationStatus::Waiting)
        .min_by_key(|r| r.reserved_at)
}

/// The promotion owed once `freed` more copies reach the shelf, if any copy is
/// left over after the live holds and someone is waiting.
pub(super) fn promotion_after(bs: &BookState, freed: u32, policy: &Policy, now: Ms) -> Option<Promotion> {
    let live_holds = bs
        .reservations
        .iter()
        .filter(|r| r.is_live_hold(now))
        .count() as u32;
    if bs.book.inventory.available() + freed <= live_holds {
        return None;
    }
    next_in_line(bs).map(|r| Promotion {
        reservation_id: r.id,
        member_id: r.member_id,
        expires_at: now.saturating_add(policy.hold_window_ms),
    })
}

/// AVAILABLE reservations whose window has passed, oldest first.
pub(super) fn lapsed(bs: &BookState, now: Ms) -> Vec<Ulid> {
    bs.reservations
        .iter()
        .filter(|r| r.is_lapsed(now))
        .map(|r| r.id)
        .collect()
}

pub(super) fn record_request(bs: &mut BookState, reservation: Reservation) {
    bs.reservations.push(reservation);
}

pub(super) fn record_promotion(bs: &mut BookState, promotion: &Promotion) {
    if let Some(r) = bs.reservation_mut(promotion.reservation_id) {
        r.status = ReservationStatus::Available;
        r.expires_at = Some(promotion.expires_at);
    }
}

pub(super) fn record_fulfilment(bs: &mut BookState, reservation_id: Ulid) {
    set_status(bs, reservation_id, ReservationStatus::Fulfilled);
}

pub(super) fn record_cancel(bs: &mut BookState, reservation_id: Ulid) {
    set_status(bs, reservation_id, ReservationStatus::Cancelled);
}

pub(super) fn record_lapse(bs: &mut BookState, reservation_id: Ulid) {
    set_status(bs, reservation_id, ReservationStatus::Expired);
}

fn set_status(bs: &mut BookState, reservation_id: Ulid, status: ReservationStatus) {
    if let Some(r) = bs.reservation_mut(reservation_id) {
        r.status = status;
    }
}
