use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::{now_ms, Engine};
use crate::model::Ms;

/// One pass: expire every lapsed hold, promoting the next member in line.
/// Returns how many holds were expired.
pub async fn sweep_lapsed_holds(engine: &Engine, now: Ms) -> usize {
    let mut expired = 0;
    for (book_id, reservation_id) in engine.collect_lapsed_holds(now).await {
        match engine.lapse_hold(reservation_id, now).await {
            Ok(None) => {}
            Ok(Some(lapse)) => {
                expired += 1;
                info!("hold {reservation_id} on book {book_id} lapsed");
                if let Some(p) = lapse.promoted {
                    info!("reservation {} promoted for member {}", p.reservation_id, p.member_id);
                }
            }
            Err(e) => tracing::debug!("sweeper skip {reservation_id}: {e}"),
        }
    }
    expired
}

/// Background task that periodically expires lapsed holds.
pub async fn run_sweeper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        sweep_lapsed_holds(&engine, now_ms()).await;
    }
}

/// Background task that compacts the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => tracing::error!("WAL compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::{DAY_MS, HOUR_MS};
    use crate::model::*;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;
    use ulid::Ulid;

    const T0: Ms = 1_750_000_000_000;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("shelfd_test_sweeper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn lapsed_hold_passes_to_next_in_line() {
        let engine = Engine::new(test_wal_path("pass_down.wal"), Arc::new(NotifyHub::new()), Policy::default()).unwrap();
        let librarian = Actor::librarian(Ulid::new());
        let book = engine
            .register_book(&librarian, "9780000000002".into(), "T".into(), "A".into(), "P".into(), 1)
            .await
            .unwrap();

        let (a, b, c) = (Ulid::new(), Ulid::new(), Ulid::new());
        let loan = engine.borrow(a, book.id, T0).await.unwrap();
        let rb = engine.reserve(b, book.id, T0 + 1).await.unwrap();
        let rc = engine.reserve(c, book.id, T0 + 2).await.unwrap();

        let returned_at = T0 + DAY_MS;
        engine.return_book(loan.id, &Actor::member(a), returned_at).await.unwrap();

        // Inside the window nothing happens.
        assert_eq!(sweep_lapsed_holds(&engine, returned_at + HOUR_MS).await, 0);

        let after_window = returned_at + engine.policy.hold_window_ms;
        assert_eq!(engine.collect_lapsed_holds(after_window).await, vec![(book.id, rb.id)]);
        assert_eq!(sweep_lapsed_holds(&engine, after_window).await, 1);

        let rb = engine.reservation(rb.id).await.unwrap();
        let rc = engine.reservation(rc.id).await.unwrap();
        assert_eq!(rb.status, ReservationStatus::Expired);
        assert_eq!(rc.status, ReservationStatus::Available);
        assert_eq!(rc.expires_at, Some(after_window + engine.policy.hold_window_ms));

        // Second pass finds nothing new.
        assert_eq!(sweep_lapsed_holds(&engine, after_window).await, 0);
    }
}
