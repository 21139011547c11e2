//! Storage Cluster Management API Client
//!
//! Typed client for the storage cluster's REST management API, used by the
//! CSI driver to reconcile shares, files, snapshots and objectives.
//!
//! The library is split into several modules:
//! - `client`: session handling, status-code normalization, task polling
//! - `shares`, `files`, `cluster`: endpoint groups
//! - `models`: JSON request/response types
//! - `cache`: time-boxed memoization for expensive read-mostly queries

pub mod cache;
pub mod client;
pub mod cluster;
pub mod error;
pub mod files;
pub mod models;
pub mod shares;

pub use cache::{CachedValue, TtlCache};
pub use client::{ApiClient, ApiConfig, PollPolicy};
pub use error::{ApiError, Result};
pub use models::{
    Cluster, DataPortal, ExportOption, File, FileSnapshot, Objective, Share, ShareRequest, Task,
    TaskStatus,
};
