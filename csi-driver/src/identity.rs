//! CSI Identity Service Implementation
//!
//! Provides plugin identification and capability reporting to Kubernetes.

use std::sync::Arc;

use storage_api::ApiClient;
use tonic::{Request, Response, Status};
use tracing::{debug, warn};

use crate::csi;

pub const DRIVER_NAME: &str = "nfs-portal.csi.io";
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// CSI Identity Service
///
/// Implements the CSI Identity service which provides:
/// - Plugin identification (name and version)
/// - Plugin capability reporting
/// - Readiness, tied to a working backend session
pub struct IdentityService {
    driver_name: String,
    api: Arc<ApiClient>,
}

impl IdentityService {
    pub fn new(driver_name: impl Into<String>, api: Arc<ApiClient>) -> Self {
        Self {
            driver_name: driver_name.into(),
            api,
        }
    }
}

#[tonic::async_trait]
impl csi::identity_server::Identity for IdentityService {
    /// Returns the name and version of the CSI plugin.
    async fn get_plugin_info(
        &self,
        _request: Request<csi::GetPluginInfoRequest>,
    ) -> Result<Response<csi::GetPluginInfoResponse>, Status> {
        Ok(Response::new(csi::GetPluginInfoResponse {
            name: self.driver_name.clone(),
            vendor_version: DRIVER_VERSION.to_string(),
            manifest: std::collections::HashMap::new(),
        }))
    }

    /// Returns the capabilities of the CSI plugin.
    async fn get_plugin_capabilities(
        &self,
        _request: Request<csi::GetPluginCapabilitiesRequest>,
    ) -> Result<Response<csi::GetPluginCapabilitiesResponse>, Status> {
        use csi::plugin_capability::service::Type as ServiceType;

        let service = |t: ServiceType| csi::PluginCapability {
            r#type: Some(csi::plugin_capability::Type::Service(
                csi::plugin_capability::Service { r#type: t as i32 },
            )),
        };

        let capabilities = vec![
            service(ServiceType::ControllerService),
            service(ServiceType::VolumeAccessibilityConstraints),
            csi::PluginCapability {
                r#type: Some(csi::plugin_capability::Type::VolumeExpansion(
                    csi::plugin_capability::VolumeExpansion {
                        r#type: csi::plugin_capability::volume_expansion::Type::Online as i32,
                    },
                )),
            },
        ];

        Ok(Response::new(csi::GetPluginCapabilitiesResponse { capabilities }))
    }

    /// Ready once a backend login has succeeded. A Probe before that point
    /// tries to log in.
    async fn probe(
        &self,
        _request: Request<csi::ProbeRequest>,
    ) -> Result<Response<csi::ProbeResponse>, Status> {
        if !self.api.is_ready() {
            match self.api.login().await {
                Ok(()) => debug!("Backend login succeeded on Probe"),
                Err(e) => warn!(error = %e, "Backend not reachable, reporting not ready"),
            }
        }
        Ok(Response::new(csi::ProbeResponse {
            ready: Some(self.api.is_ready()),
        }))
    }
}
