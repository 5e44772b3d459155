//! Photo upload pipeline.
//!
//! Independent of record sync: a meal whose photo exists only on the device
//! is uploaded to a path derived from (user, meal), so a retried upload
//! overwrites instead of duplicating. The local file is only removed after
//! the remote URL has been committed to the store.

use std::path::Path;

use anyhow::Result;
use serde::Serialize;

use crate::error::RemoteError;
use crate::remote::photo_remote_path;
use crate::sync::SyncEngine;

#[derive(Debug, Clone, Default, Serialize)]
pub struct PhotoReport {
    pub uploaded: usize,
    pub failed: usize,
    /// Local file vanished before it could be uploaded.
    pub missing: usize,
    /// No network; nothing attempted (or the rest of the batch was skipped).
    pub deferred: bool,
}

impl SyncEngine {
    pub async fn upload_pending_photos(&self, user_uid: &str) -> Result<PhotoReport> {
        let mut report = PhotoReport::default();
        if !self.remote.connectivity.is_connected() {
            report.deferred = true;
            return Ok(report);
        }

        let meals = self.store().meals_with_pending_photos(user_uid)?;
        for meal in meals {
            let Some(local_uri) = meal.photo.local_uri().map(str::to_string) else {
                continue;
            };
            let local_path = Path::new(&local_uri);

            let exists = tokio::fs::try_exists(local_path).await.unwrap_or(false);
            if !exists {
                tracing::warn!(
                    cloud_id = %meal.cloud_id,
                    path = %local_uri,
                    "photo file missing, giving up on upload"
                );
                self.store().mark_photo_missing(&meal.cloud_id, &local_uri)?;
                report.missing += 1;
                continue;
            }

            let remote_path = photo_remote_path(user_uid, &meal.cloud_id);
            let uploaded = self
                .with_timeout(self.remote.files.put_file(&remote_path, local_path))
                .await;
            match uploaded {
                Ok(url) => {
                    let committed =
                        self.store()
                            .complete_photo_upload(&meal.cloud_id, &local_uri, &url)?;
                    if !committed {
                        tracing::debug!(cloud_id = %meal.cloud_id, "photo replaced during upload");
                        continue;
                    }
                    report.uploaded += 1;
                    tracing::debug!(cloud_id = %meal.cloud_id, %url, "photo uploaded");
                    if self.config.delete_local_photo_after_upload {
                        if let Err(err) = tokio::fs::remove_file(local_path).await {
                            tracing::warn!(path = %local_uri, error = %err, "could not remove uploaded photo");
                        }
                    }
                }
                Err(RemoteError::Offline) => {
                    report.deferred = true;
                    break;
                }
                Err(err) => {
                    tracing::warn!(cloud_id = %meal.cloud_id, error = %err, "photo upload failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }
}
