mod circulation;
mod error;
mod inventory;
mod loans;
mod queries;
mod reservations;

pub use error::EngineError;
pub use inventory::{Inventory, LedgerError};
pub use loans::MemberLedger;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedMutexGuard, RwLock};
use ulid::Ulid;

use crate::limits::{MAX_VALID_TIMESTAMP_MS, MIN_VALID_TIMESTAMP_MS};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::wal::Wal;

pub type SharedBookState = Arc<RwLock<BookState>>;
pub type SharedMemberLedger = Arc<Mutex<MemberLedger>>;

/// Commands drained per wake-up of the WAL writer.
const WAL_BATCH_LIMIT: usize = 512;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        snapshot: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL. Every wake-up drains whatever is queued;
/// all appends in that drain share one fsync. Control commands first commit the
/// appends queued ahead of them, so ordering is preserved.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    let mut inbox = Vec::with_capacity(WAL_BATCH_LIMIT);
    let mut pending: Vec<PendingAppend> = Vec::new();
    while rx.recv_many(&mut inbox, WAL_BATCH_LIMIT).await > 0 {
        for cmd in inbox.drain(..) {
            match cmd {
                WalCommand::Append { event, response } => pending.push((event, response)),
                WalCommand::Compact { snapshot, response } => {
                    commit(&mut wal, &mut pending);
                    let _ = response.send(wal.compact(&snapshot));
                }
                WalCommand::AppendsSinceCompact { response } => {
                    commit(&mut wal, &mut pending);
                    let _ = response.send(wal.appends_since_compact());
                }
            }
        }
        commit(&mut wal, &mut pending);
    }
}

fn commit(wal: &mut Wal, pending: &mut Vec<PendingAppend>) {
    if pending.is_empty() {
        return;
    }
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(pending.len() as f64);
    let started = std::time::Instant::now();
    let appended = pending.iter().try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-written bytes don't leak into the next batch.
    let flushed = wal.flush_sync();
    let result = appended.and(flushed);
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL commit of {} events failed: {e}", pending.len());
    }
    for (_, tx) in pending.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

/// Where a loan or reservation lives, and whose it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityRef {
    pub book_id: Ulid,
    pub member_id: Ulid,
}

pub struct Engine {
    pub state: DashMap<Ulid, SharedBookState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub policy: Policy,
    /// Loan/reservation id → owning book and member.
    pub(super) entities: DashMap<Ulid, EntityRef>,
    pub(super) isbn_index: DashMap<String, Ulid>,
    pub(super) members: DashMap<Ulid, SharedMemberLedger>,
    /// Serialises catalogue changes so ISBN uniqueness can't race.
    pub(super) catalog: Mutex<()>,
}

/// Apply a committed event to its book row (caller holds the write lock).
///
/// Every event was validated under that same lock before it was logged, so a
/// ledger refusal here means the log and the rules disagree: logged as a defect.
fn apply_to_book(bs: &mut BookState, event: &Event, entities: &DashMap<Ulid, EntityRef>) {
    let result = match event {
        Event::CopiesAdjusted { total_copies, .. } => bs.book.inventory.resize(*total_copies),
        Event::LoanIssued {
            id,
            book_id,
            member_id,
            issued_at,
            due_at,
            fulfilled,
        } => {
            entities.insert(*id, EntityRef { book_id: *book_id, member_id: *member_id });
            let loan = Loan {
                id: *id,
                book_id: *book_id,
                member_id: *member_id,
                status: LoanStatus::Active,
                issued_at: *issued_at,
                due_at: *due_at,
                returned_at: None,
            };
            loans::record_issue(bs, loan, *fulfilled)
        }
        Event::LoanReturned {
            id,
            returned_at,
            promoted,
            ..
        } => loans::record_return(bs, *id, *returned_at).map(|()| {
            if let Some(p) = promoted {
                reservations::record_promotion(bs, p);
            }
        }),
        Event::ReservationRequested {
            id,
            book_id,
            member_id,
            reserved_at,
        } => {
            entities.insert(*id, EntityRef { book_id: *book_id, member_id: *member_id });
            reservations::record_request(
                bs,
                Reservation {
                    id: *id,
                    book_id: *book_id,
                    member_id: *member_id,
                    status: ReservationStatus::Waiting,
                    reserved_at: *reserved_at,
                    expires_at: None,
                },
            );
            Ok(())
        }
        Event::ReservationCancelled { id, .. } => {
            reservations::record_cancel(bs, *id);
            Ok(())
        }
        Event::HoldLapsed { id, promoted, .. } => {
            reservations::record_lapse(bs, *id);
            if let Some(p) = promoted {
                reservations::record_promotion(bs, p);
            }
            Ok(())
        }
        // Row creation happens at the map level.
        Event::BookRegistered { .. } | Event::BookRestored { .. } => Ok(()),
    };
    if let Err(e) = result {
        tracing::error!(book_id = %bs.book.id, "invariant violation applying {event:?}: {e}");
        metrics::counter!(observability::INVARIANT_VIOLATIONS_TOTAL).increment(1);
    }
}

fn book_from_registration(event: &Event) -> Option<Book> {
    match event {
        Event::BookRegistered {
            id,
            isbn,
            title,
            author,
            publisher,
            total_copies,
        } => Some(Book {
            id: *id,
            isbn: isbn.clone(),
            title: title.clone(),
            author: author.clone(),
            publisher: publisher.clone(),
            inventory: Inventory::new(*total_copies),
        }),
        _ => None,
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, policy: Policy) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            policy,
            entities: DashMap::new(),
            isbn_index: DashMap::new(),
            members: DashMap::new(),
            catalog: Mutex::new(()),
        };

        // We're the sole owner of every lock during replay, so try_write always
        // succeeds; blocking_write would panic inside the runtime.
        for event in events {
            match event {
                Event::BookRegistered { .. } => {
                    if let Some(book) = book_from_registration(&event) {
                        engine.insert_book(BookState::new(book));
                    }
                }
                Event::BookRestored { state } => engine.insert_book(state),
                other => {
                    let Some(rs) = engine.get_book(&other.book_id()) else {
                        tracing::warn!("replay: event for unknown book {}", other.book_id());
                        continue;
                    };
                    let mut guard = rs.try_write().expect("replay: uncontended write");
                    apply_to_book(&mut guard, &other, &engine.entities);
                }
            }
        }
        engine.rebuild_member_ledgers();

        tracing::info!(
            "{}: replayed {} books, {} loans and reservations",
            wal_path.display(),
            engine.state.len(),
            engine.entities.len()
        );
        Ok(engine)
    }

    /// Put a whole book row into the maps and indexes.
    pub(super) fn insert_book(&self, bs: BookState) {
        let book_id = bs.book.id;
        self.isbn_index.insert(bs.book.isbn.clone(), book_id);
        for loan in &bs.loans {
            self.entities.insert(loan.id, EntityRef { book_id, member_id: loan.member_id });
        }
        for r in &bs.reservations {
            self.entities.insert(r.id, EntityRef { book_id, member_id: r.member_id });
        }
        self.state.insert(book_id, Arc::new(RwLock::new(bs)));
    }

    fn rebuild_member_ledgers(&self) {
        let mut ledgers: HashMap<Ulid, MemberLedger> = HashMap::new();
        for entry in self.state.iter() {
            let guard = entry.value().try_read().expect("replay: uncontended read");
            for loan in guard.active_loans() {
                ledgers.entry(loan.member_id).or_default().open(loan.id);
            }
        }
        for (member_id, ledger) in ledgers {
            self.members.insert(member_id, Arc::new(Mutex::new(ledger)));
        }
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_book(&self, id: &Ulid) -> Option<SharedBookState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_entity(&self, id: &Ulid) -> Option<EntityRef> {
        self.entities.get(id).map(|e| *e.value())
    }

    /// The member's ledger, created empty on first use.
    fn member_ledger(&self, member_id: Ulid) -> SharedMemberLedger {
        self.members.entry(member_id).or_default().value().clone()
    }

    /// Lock the member's ledger. A ledger released while we waited for it is
    /// no longer in the map, so look the member up again.
    pub(super) async fn lock_member(&self, member_id: Ulid) -> OwnedMutexGuard<MemberLedger> {
        loop {
            let ledger = self.member_ledger(member_id);
            let guard = ledger.clone().lock_owned().await;
            let current = self
                .members
                .get(&member_id)
                .is_some_and(|e| Arc::ptr_eq(e.value(), &ledger));
            if current {
                return guard;
            }
        }
    }

    /// Drop the ledger of a member with no active loans. Must be called with
    /// that ledger locked.
    pub(super) fn release_member(&self, member_id: Ulid, guard: &OwnedMutexGuard<MemberLedger>) {
        if guard.active_count() == 0 {
            let ledger = OwnedMutexGuard::mutex(guard);
            self.members.remove_if(&member_id, |_, l| Arc::ptr_eq(l, ledger));
        }
    }

    /// Members with a ledger in memory.
    pub fn tracked_members(&self) -> usize {
        self.members.len()
    }

    /// WAL-append + apply + notify: the commit of one transaction.
    pub(super) async fn persist_and_apply(&self, bs: &mut BookState, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_book(bs, event, &self.entities);
        self.notify.publish(event);
        Ok(())
    }

    /// Lookup entity → book, acquire the book's write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<(EntityRef, tokio::sync::OwnedRwLockWriteGuard<BookState>), EngineError> {
        let entity = self.get_entity(entity_id).ok_or(EngineError::NotFound(*entity_id))?;
        let rs = self
            .get_book(&entity.book_id)
            .ok_or(EngineError::NotFound(entity.book_id))?;
        Ok((entity, rs.write_owned().await))
    }

    /// Snapshot every book row under read locks (held until the rewrite lands, so
    /// no commit can slip between snapshot and swap) and compact the WAL.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // Registrations would otherwise land in the old file and vanish in the swap.
        let _catalog = self.catalog.lock().await;
        let mut ids: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        ids.sort();
        let mut guards = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(rs) = self.get_book(id) {
                guards.push(rs.read_owned().await);
            }
        }
        let snapshot: Vec<Event> = guards
            .iter()
            .map(|g| Event::BookRestored { state: (**g).clone() })
            .collect();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { snapshot, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()));
        drop(guards);
        result
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as Ms)
}

pub(crate) fn validate_timestamp(t: Ms) -> Result<(), EngineError> {
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&t) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}
