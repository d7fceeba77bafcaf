//! The background reaper: a periodic sweep that expires sealed chests past
//! their deadline and garbage-collects chests abandoned mid-upload.

use crate::blob::BlobStore;
use crate::db::MetadataStore;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Equal to the multipart token TTL: any in-flight chunked
/// upload's token is already invalid by the time its session reaches this
/// age, so no live uploader can collide with reaping.
pub const ABANDONED_AFTER_SECS_DEFAULT: i64 = 48 * 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reason {
    Expired,
    Abandoned,
}

#[derive(Debug, Default)]
pub struct SweepSummary {
    pub expired: usize,
    pub abandoned: usize,
    pub deleted_files: usize,
    pub deleted_blobs: usize,
    pub pruned_multipart_uploads: usize,
    pub errors: Vec<String>,
}

/// Runs one sweep. Never returns `Err` — per-session and global read
/// failures are folded into the summary's `errors` so the caller's loop
/// never has to decide whether to abort.
pub async fn sweep_once(
    db: &MetadataStore,
    blobs: &Arc<dyn BlobStore>,
    now: DateTime<Utc>,
    abandoned_after_secs: i64,
) -> SweepSummary {
    let mut summary = SweepSummary::default();

    let expired = match db.select_expired_sessions(now).await {
        Ok(rows) => rows,
        Err(e) => {
            summary.errors.push(format!("selectExpiredSessions failed: {e}"));
            Vec::new()
        }
    };

    let cutoff = now - Duration::seconds(abandoned_after_secs);
    let abandoned = match db.select_abandoned_sessions(cutoff).await {
        Ok(rows) => rows,
        Err(e) => {
            summary.errors.push(format!("selectAbandonedSessions failed: {e}"));
            Vec::new()
        }
    };

    for row in expired {
        let Ok(session_id) = row.session_id() else {
            summary.errors.push(format!("corrupt session id: {}", row.id));
            continue;
        };
        summary.expired += 1;
        reap_session(db, blobs, session_id, Reason::Expired, &mut summary).await;
    }

    for row in abandoned {
        let Ok(session_id) = row.session_id() else {
            summary.errors.push(format!("corrupt session id: {}", row.id));
            continue;
        };
        summary.abandoned += 1;
        reap_session(db, blobs, session_id, Reason::Abandoned, &mut summary).await;
    }

    // A session's in-flight multipart upload id lives only inside its signed
    // multipart token, never in the metadata store, so an abandoned session's
    // staged parts can't be found via reap_session's blob listing. Prune by
    // age instead: any staging directory untouched for the abandoned-session
    // window belongs to an upload nobody will ever complete.
    match blobs.prune_stale_multipart_uploads(abandoned_after_secs).await {
        Ok(n) => summary.pruned_multipart_uploads = n,
        Err(e) => summary
            .errors
            .push(format!("failed to prune stale multipart uploads: {e}")),
    }

    summary
}

async fn reap_session(
    db: &MetadataStore,
    blobs: &Arc<dyn BlobStore>,
    session_id: Uuid,
    reason: Reason,
    summary: &mut SweepSummary,
) {
    let prefix = session_id.to_string();
    match blobs.list(&prefix).await {
        Ok(keys) => {
            for key in keys {
                match blobs.delete(&key).await {
                    Ok(()) => summary.deleted_blobs += 1,
                    Err(e) => summary
                        .errors
                        .push(format!("failed to delete blob {key}: {e}")),
                }
            }
        }
        Err(e) => summary
            .errors
            .push(format!("failed to list blobs for {session_id}: {e}")),
    }

    match db.count_session_files(session_id).await {
        Ok(count) => summary.deleted_files += count as usize,
        Err(e) => summary
            .errors
            .push(format!("failed to count files for {session_id}: {e}")),
    }

    if let Err(e) = db.soft_delete_files(session_id).await {
        summary
            .errors
            .push(format!("failed to soft-delete files for {session_id}: {e}"));
    }
    if let Err(e) = db.soft_delete_session(session_id).await {
        summary
            .errors
            .push(format!("failed to soft-delete session {session_id}: {e}"));
    }

    tracing::info!(
        %session_id,
        reason = match reason { Reason::Expired => "expired", Reason::Abandoned => "abandoned" },
        "reaped chest"
    );
}

/// Spawns the hourly-by-default sweep loop. Runs until the process shuts
/// down; there is no external cancellation, so callers simply drop the handle.
pub fn spawn_reaper_task(
    db: MetadataStore,
    blobs: Arc<dyn BlobStore>,
    sweep_interval_secs: u64,
    abandoned_after_secs: i64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(sweep_interval_secs));
        // The first tick fires immediately; skip it so we don't sweep at startup
        // before anything could possibly be expired.
        interval.tick().await;
        loop {
            interval.tick().await;
            let summary = sweep_once(&db, &blobs, Utc::now(), abandoned_after_secs).await;
            if summary.errors.is_empty() {
                tracing::info!(
                    expired = summary.expired,
                    abandoned = summary.abandoned,
                    deleted_files = summary.deleted_files,
                    deleted_blobs = summary.deleted_blobs,
                    pruned_multipart_uploads = summary.pruned_multipart_uploads,
                    "reaper sweep complete"
                );
            } else {
                tracing::warn!(
                    expired = summary.expired,
                    abandoned = summary.abandoned,
                    errors = ?summary.errors,
                    "reaper sweep completed with errors"
                );
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::FsBlobStore;
    use bytes::Bytes;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, MetadataStore, Arc<dyn BlobStore>) {
        let dir = TempDir::new().unwrap();
        let db = MetadataStore::connect_in_memory().await.unwrap();
        let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(dir.path()));
        (dir, db, blobs)
    }

    #[tokio::test]
    async fn sweep_reaps_expired_and_abandoned_but_spares_permanent() {
        let (_dir, db, blobs) = setup().await;
        let now = Utc::now();

        let expiring = Uuid::new_v4();
        db.insert_session(expiring).await.unwrap();
        db.mark_sealed(expiring, "EXPIR1", Some(now - ChronoDuration::days(1)))
            .await
            .unwrap();
        blobs
            .put(&format!("{expiring}/{}", Uuid::new_v4()), Bytes::from_static(b"x"))
            .await
            .unwrap();

        let abandoned = Uuid::new_v4();
        db.insert_session(abandoned).await.unwrap();
        blobs
            .put(&format!("{abandoned}/{}", Uuid::new_v4()), Bytes::from_static(b"y"))
            .await
            .unwrap();

        let permanent = Uuid::new_v4();
        db.insert_session(permanent).await.unwrap();
        db.mark_sealed(permanent, "PERM01", None).await.unwrap();
        blobs
            .put(&format!("{permanent}/{}", Uuid::new_v4()), Bytes::from_static(b"z"))
            .await
            .unwrap();

        // simulate the abandoned session having been created 49h ago by
        // sweeping with a `now` shifted forward instead of back-dating rows.
        let future_now = now + ChronoDuration::hours(49);
        let summary = sweep_once(&db, &blobs, future_now, ABANDONED_AFTER_SECS_DEFAULT).await;

        assert_eq!(summary.expired, 1);
        assert_eq!(summary.abandoned, 1);
        assert!(summary.errors.is_empty());

        assert!(blobs.list(&expiring.to_string()).await.unwrap().is_empty());
        assert!(blobs.list(&abandoned.to_string()).await.unwrap().is_empty());
        assert_eq!(blobs.list(&permanent.to_string()).await.unwrap().len(), 1);

        assert!(db.get_session(expiring).await.unwrap().is_none());
        assert!(db.get_session(abandoned).await.unwrap().is_none());
        assert!(db.get_session(permanent).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sweep_is_idempotent_on_overlap() {
        let (_dir, db, blobs) = setup().await;
        let now = Utc::now();
        let id = Uuid::new_v4();
        db.insert_session(id).await.unwrap();
        db.mark_sealed(id, "EXPIR2", Some(now - ChronoDuration::days(1)))
            .await
            .unwrap();

        let first = sweep_once(&db, &blobs, now, ABANDONED_AFTER_SECS_DEFAULT).await;
        assert_eq!(first.expired, 1);

        let second = sweep_once(&db, &blobs, now, ABANDONED_AFTER_SECS_DEFAULT).await;
        assert_eq!(second.expired, 0, "already-reaped session is no longer selected");
        assert!(second.errors.is_empty());
    }

    #[tokio::test]
    async fn sweep_prunes_stale_multipart_staging_state() {
        let (_dir, db, blobs) = setup().await;
        let key = format!("{}/{}", Uuid::new_v4(), Uuid::new_v4());
        let upload_id = blobs.multipart_create(&key).await.unwrap();
        blobs
            .multipart_upload_part(&key, &upload_id, 1, Bytes::from_static(b"abandoned part"))
            .await
            .unwrap();

        let summary = sweep_once(&db, &blobs, Utc::now(), 0).await;
        assert_eq!(summary.pruned_multipart_uploads, 1);
        assert!(summary.errors.is_empty());
    }

    #[tokio::test]
    async fn open_session_within_window_is_not_abandoned() {
        let (_dir, db, blobs) = setup().await;
        let id = Uuid::new_v4();
        db.insert_session(id).await.unwrap();

        let summary = sweep_once(&db, &blobs, Utc::now(), ABANDONED_AFTER_SECS_DEFAULT).await;
        assert_eq!(summary.abandoned, 0);
        assert!(db.get_open_session(id).await.unwrap().is_some());
    }
}
