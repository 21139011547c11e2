//! Cluster-wide queries: capacity, objectives, floating IPs, data portals.
//!
//! Capacity and the objective catalog are memoized in the injected
//! [`TtlCache`](crate::TtlCache); a cold cache only costs a request.

use reqwest::Method;
use tracing::debug;

use crate::cache::{CachedValue, KEY_FREE_CAPACITY, KEY_OBJECTIVES};
use crate::client::ApiClient;
use crate::error::Result;
use crate::models::{Cluster, ClusterState, DataPortal, Objective};

impl ApiClient {
    pub async fn list_objectives(&self) -> Result<Vec<Objective>> {
        let req = self.request(Method::GET, "/objectives");
        self.get_required(req, "list objectives").await
    }

    /// Names of all objectives known to the cluster.
    pub async fn objective_names(&self) -> Result<Vec<String>> {
        if let Some(CachedValue::Objectives(names)) = self.cache().get(KEY_OBJECTIVES) {
            return Ok(names);
        }

        let names: Vec<String> = self
            .list_objectives()
            .await?
            .into_iter()
            .map(|o| o.name)
            .collect();
        debug!(count = names.len(), "Fetched objective catalog");
        self.cache().insert(
            KEY_OBJECTIVES.to_string(),
            CachedValue::Objectives(names.clone()),
        );
        Ok(names)
    }

    /// Free bytes across the whole cluster.
    pub async fn free_capacity(&self) -> Result<u64> {
        if let Some(CachedValue::Capacity(free)) = self.cache().get(KEY_FREE_CAPACITY) {
            return Ok(free);
        }

        let req = self.request(Method::GET, "/cntl/state");
        let states: Vec<ClusterState> = self.get_required(req, "cluster state").await?;
        let free = states
            .iter()
            .filter_map(|s| s.capacity.as_ref())
            .map(|c| c.free.max(0) as u64)
            .next()
            .unwrap_or(0);

        self.cache()
            .insert(KEY_FREE_CAPACITY.to_string(), CachedValue::Capacity(free));
        Ok(free)
    }

    pub async fn get_cluster(&self) -> Result<Cluster> {
        let req = self.request(Method::GET, "/cntl");
        self.get_required(req, "cluster info").await
    }

    /// Cluster floating IPs usable for data-path mounts.
    pub async fn floating_ips(&self) -> Result<Vec<String>> {
        Ok(self
            .get_cluster()
            .await?
            .floating_ips
            .into_iter()
            .map(|ip| ip.address)
            .filter(|a| !a.is_empty())
            .collect())
    }

    pub async fn list_data_portals(&self) -> Result<Vec<DataPortal>> {
        let req = self.request(Method::GET, "/data-portals/");
        self.get_required(req, "list data portals").await
    }
}
