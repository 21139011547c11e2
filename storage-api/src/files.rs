//! File, file-snapshot and metadata endpoints.

use reqwest::{Method, StatusCode};
use tracing::{debug, info, warn};

use crate::client::ApiClient;
use crate::error::Result;
use crate::models::{File, FileSnapshot};

impl ApiClient {
    /// Look up a file by its cluster path; `None` when it does not exist.
    pub async fn get_file(&self, path: &str) -> Result<Option<File>> {
        let req = self
            .request(Method::GET, "/files")
            .query(&[("path", path)]);
        let resp = self.send(req).await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            // Backend workaround: lookups of missing files can answer 500.
            // Callers depend on this reading as "absent".
            StatusCode::INTERNAL_SERVER_ERROR => {
                debug!(path, "File lookup returned 500, treating as not found");
                Ok(None)
            }
            s if s.is_success() => {
                let bytes = resp.bytes().await?;
                Ok(Some(serde_json::from_slice(&bytes)?))
            }
            _ => Err(Self::unexpected(resp, "get file").await),
        }
    }

    pub async fn list_file_snapshots(&self, path: &str) -> Result<Vec<FileSnapshot>> {
        let req = self
            .request(Method::GET, "/file-snapshots/list")
            .query(&[("filename-expression", path)]);
        Ok(self
            .get_optional(req, "list file snapshots")
            .await?
            .unwrap_or_default())
    }

    pub async fn create_file_snapshot(&self, path: &str, snapshot: &str) -> Result<bool> {
        info!(path, snapshot, "Creating file snapshot");
        let req = self
            .request(Method::POST, "/file-snapshots/create")
            .query(&[("filename-expression", path), ("snapshot-name", snapshot)]);
        self.submit(req, "create file snapshot").await
    }

    pub async fn delete_file_snapshot(&self, path: &str, snapshot: &str) -> Result<bool> {
        debug!(path, snapshot, "Deleting file snapshot");
        let req = self
            .request(Method::DELETE, "/file-snapshots/delete")
            .query(&[
                ("filename-expression", path),
                ("date-time-expression", snapshot),
            ]);
        self.submit_delete(req, "delete file snapshot").await
    }

    /// Restore a file snapshot to a new path.
    pub async fn restore_file_snapshot(
        &self,
        source_path: &str,
        snapshot: &str,
        destination: &str,
    ) -> Result<bool> {
        info!(source_path, snapshot, destination, "Restoring file snapshot");
        let req = self
            .request(Method::POST, "/file-snapshots/restore")
            .query(&[
                ("filename-expression", source_path),
                ("date-time-expression", snapshot),
                ("destination-path", destination),
            ]);
        self.submit(req, "restore file snapshot").await
    }

    pub async fn set_file_objective(&self, path: &str, objective: &str) -> Result<bool> {
        debug!(path, objective, "Applying objective to file");
        let req = self
            .request(Method::POST, "/files/objective-set")
            .query(&[("path", path), ("objective-identifier", objective)]);
        self.submit(req, "set file objective").await
    }

    /// Attach a metadata tag to a path.
    ///
    /// Backend workaround: the tagging call may report success even when the
    /// tag was not written, so a `true` result is not a guarantee.
    pub async fn set_tag(&self, path: &str, key: &str, value: &str) -> Result<bool> {
        let req = self
            .request(Method::PUT, "/files/tags")
            .query(&[("path", path), ("key", key), ("value", value)]);
        let ok = self.submit(req, "set tag").await?;
        if !ok {
            warn!(path, key, "Tag task did not complete");
        }
        Ok(ok)
    }
}
