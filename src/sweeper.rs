use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;

/// Background task that periodically expires lapsed reservations.
pub async fn run_sweeper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        match engine.sweep_expired(engine.now_ms()).await {
            Ok(0) => {}
            Ok(n) => info!("expired {n} reservation(s)"),
            Err(e) => tracing::error!("sweep failed: {e}"),
        }
    }
}

/// Background task that rewrites the WAL once enough events have piled up
/// since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let appended = engine.wal_appends_since_compact().await;
        if appended < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appended} appends"),
            Err(e) => tracing::error!("WAL compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::*;

    const H: Ms = 3_600_000;
    const T0: Ms = 1_748_772_000_000;

    #[tokio::test]
    async fn sweeper_expires_lapsed_reservations() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(T0));
        let engine = Arc::new(Engine::new(&dir.path().join("sweep.wal"), clock.clone()).unwrap());
        let root = engine.ensure_root("root", Some("root-pw")).await.unwrap();
        let server = engine
            .create_server(
                root,
                NewServer {
                    name: "gpu-1".into(),
                    ..NewServer::default()
                },
            )
            .await
            .unwrap();
        let booked = engine
            .create_reservation(root, server.id, T0 + H, T0 + 2 * H)
            .await
            .unwrap();

        clock.set(T0 + 3 * H);
        let task = tokio::spawn(run_sweeper(engine.clone(), Duration::from_millis(10)));
        let mut status = ReservationStatus::Active;
        for _ in 0..100 {
            status = engine.get_reservation(root, booked.id).await.unwrap().status;
            if status != ReservationStatus::Active {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        task.abort();

        assert_eq!(status, ReservationStatus::Expired);
        let server = engine.get_server(root, server.id).await.unwrap();
        assert_eq!(server.status, ServerStatus::Available);
    }

    #[tokio::test]
    async fn compactor_waits_for_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(T0));
        let engine = Arc::new(Engine::new(&dir.path().join("compact.wal"), clock).unwrap());
        engine.ensure_root("root", Some("root-pw")).await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 1);

        let task = tokio::spawn(run_compactor(engine.clone(), 1, Duration::from_millis(10)));
        let mut appended = 1;
        for _ in 0..100 {
            appended = engine.wal_appends_since_compact().await;
            if appended == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        task.abort();
        assert_eq!(appended, 0);
    }
}
