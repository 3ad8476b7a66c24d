use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::engine::Engine;

/// Background task that rewrites the WAL once enough appends have piled up
/// since the last compaction. Keeps replay time bounded for long-running
/// installs with heavy booking churn.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("WAL compacted after {appends} appends"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RoomType, StayRange};
    use crate::notify::NotifyHub;
    use chrono::{Duration as CDuration, Local};
    use rust_decimal::Decimal;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("innkeep_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compaction_threshold_counter() {
        let path = test_wal_path("threshold.wal");
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::new(path, notify).unwrap());

        let room = engine
            .create_room("901".into(), RoomType::Single, Decimal::new(8000, 2), 1, 9)
            .await
            .unwrap();
        let user = engine
            .register_user(
                "Compaction Tester".into(),
                "compact@example.com".into(),
                "+1000000999".into(),
                chrono::NaiveDate::from_ymd_opt(1990, 1, 1).unwrap(),
                "hunter2!A",
            )
            .await
            .unwrap();

        let today = Local::now().date_naive();
        for i in 0..5 {
            let stay = StayRange::new(
                today + CDuration::days(10 + i * 3),
                today + CDuration::days(11 + i * 3),
            );
            let b = engine.create_booking(user.id, room.id, stay).await.unwrap();
            engine.cancel_booking(b.id).await.unwrap();
        }

        let before = engine.wal_appends_since_compact().await;
        assert!(before >= 12); // room + user + 5×(create + cancel)

        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
    }
}
