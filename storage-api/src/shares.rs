//! Share and share-snapshot endpoints.

use reqwest::Method;
use tracing::{debug, info};

use crate::client::{ApiClient, segment};
use crate::error::Result;
use crate::models::{Share, ShareRequest};

impl ApiClient {
    pub async fn list_shares(&self) -> Result<Vec<Share>> {
        let req = self.request(Method::GET, "/shares");
        self.get_required(req, "list shares").await
    }

    /// Look up a share by name; `None` when it does not exist.
    pub async fn get_share(&self, name: &str) -> Result<Option<Share>> {
        let req = self.request(Method::GET, &format!("/shares/{}", segment(name)));
        self.get_optional(req, "get share").await
    }

    /// Create a share and wait for the creation task.
    pub async fn create_share(&self, share: &ShareRequest) -> Result<bool> {
        info!(share = %share.name, path = %share.path, "Creating share");
        let req = self.request(Method::POST, "/shares").json(share);
        self.submit(req, "create share").await
    }

    /// Create a share whose initial content is a snapshot of another share.
    pub async fn restore_share_snapshot(
        &self,
        source_share: &str,
        snapshot: &str,
        share: &ShareRequest,
    ) -> Result<bool> {
        info!(
            share = %share.name,
            source = %source_share,
            snapshot = %snapshot,
            "Creating share from snapshot"
        );
        let path = format!(
            "/share-snapshots/snapshot-restore/{}/{}",
            segment(source_share),
            segment(snapshot)
        );
        let req = self.request(Method::POST, &path).json(share);
        self.submit(req, "restore share snapshot").await
    }

    /// Update a share in place. Used to change its size limit.
    pub async fn update_share(&self, share: &ShareRequest) -> Result<bool> {
        info!(share = %share.name, size = ?share.share_size_limit, "Updating share");
        let req = self
            .request(Method::PUT, &format!("/shares/{}", segment(&share.name)))
            .json(share);
        self.submit(req, "update share").await
    }

    /// Delete a share. A negative delay leaves the cluster default in place.
    pub async fn delete_share(&self, name: &str, delete_delay: i64) -> Result<bool> {
        info!(share = %name, delete_delay, "Deleting share");
        let mut req = self.request(Method::DELETE, &format!("/shares/{}", segment(name)));
        if delete_delay >= 0 {
            req = req.query(&[("delete-delay", delete_delay.to_string())]);
        }
        self.submit_delete(req, "delete share").await
    }

    /// Names of the snapshots taken of a share.
    pub async fn list_share_snapshots(&self, share: &str) -> Result<Vec<String>> {
        let path = format!("/share-snapshots/snapshot-list/{}", segment(share));
        let req = self.request(Method::GET, &path);
        Ok(self
            .get_optional(req, "list share snapshots")
            .await?
            .unwrap_or_default())
    }

    pub async fn create_share_snapshot(&self, share: &str, snapshot: &str) -> Result<bool> {
        info!(share = %share, snapshot = %snapshot, "Creating share snapshot");
        let path = format!("/share-snapshots/snapshot-create/{}", segment(share));
        let req = self
            .request(Method::POST, &path)
            .query(&[("snapshot-name", snapshot)]);
        self.submit(req, "create share snapshot").await
    }

    pub async fn delete_share_snapshot(&self, share: &str, snapshot: &str) -> Result<bool> {
        debug!(share = %share, snapshot = %snapshot, "Deleting share snapshot");
        let path = format!(
            "/share-snapshots/snapshot-delete/{}/{}",
            segment(share),
            segment(snapshot)
        );
        let req = self.request(Method::DELETE, &path);
        self.submit_delete(req, "delete share snapshot").await
    }

    pub async fn set_share_objective(&self, share: &str, objective: &str) -> Result<bool> {
        debug!(share = %share, objective = %objective, "Applying objective to share");
        let path = format!("/shares/{}/objective-set", segment(share));
        let req = self
            .request(Method::POST, &path)
            .query(&[("objective-identifier", objective), ("path", "/")]);
        self.submit(req, "set share objective").await
    }
}
