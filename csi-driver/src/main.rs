//! NFS Data-Portal CSI Driver
//!
//! Kubernetes CSI driver that provisions volumes through the storage
//! cluster's management API and mounts them over NFS.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, Parser};
use tokio::net::UnixListener;
use tokio::signal;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::{Level, debug, info, warn};
use tracing_subscriber::FmtSubscriber;

use csi_driver::csi::controller_server::ControllerServer;
use csi_driver::csi::identity_server::IdentityServer;
use csi_driver::csi::node_server::NodeServer;
use csi_driver::metrics;
use csi_driver::platform::{HostOps, LinuxHost};
use csi_driver::{
    ControllerService, DRIVER_NAME, DriverConfig, IdentityService, Locks, MountConfig,
    NodeService, PortalSelector, SnapshotManager, VolumeReconciler,
};
use storage_api::{ApiClient, ApiConfig, TtlCache};

/// Lifetime of cached capacity and objective lookups.
const API_CACHE_TTL: Duration = Duration::from_secs(300);
const API_CACHE_ENTRIES: usize = 64;

/// CLI arguments for the CSI driver
#[derive(Parser, Debug)]
#[command(name = "csi-driver")]
#[command(about = "NFS data-portal CSI driver for Kubernetes")]
struct Args {
    /// CSI endpoint (unix:///path or host:port)
    #[arg(long, env = "CSI_ENDPOINT", default_value = "unix:///var/run/csi/csi.sock")]
    endpoint: String,

    /// Node ID for this CSI node
    #[arg(long, env = "CSI_NODE_ID")]
    node_id: Option<String>,

    /// Run in controller mode (enables controller service)
    #[arg(long, default_value_t = false, action = ArgAction::Set)]
    controller: bool,

    /// Run in node mode (enables node service)
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    node: bool,

    /// Driver name
    #[arg(long, default_value = DRIVER_NAME)]
    driver_name: String,

    /// Storage management API endpoint (e.g., https://cluster.example.com:8443)
    #[arg(long, env = "STORAGE_API_ENDPOINT")]
    api_endpoint: String,

    #[arg(long, env = "STORAGE_API_USERNAME")]
    api_username: String,

    #[arg(long, env = "STORAGE_API_PASSWORD", hide_env_values = true)]
    api_password: String,

    /// Verify the management API's TLS certificate
    #[arg(long, env = "STORAGE_API_TLS_VERIFY", default_value_t = true, action = ArgAction::Set)]
    tls_verify: bool,

    /// Data-access FQDN tried before any data portal
    #[arg(long, env = "CSI_DATA_FQDN")]
    fqdn: Option<String>,

    /// Also try the cluster's floating IPs before data portals
    #[arg(long, env = "CSI_USE_FLOATING_IPS", default_value_t = false, action = ArgAction::Set)]
    use_floating_ips: bool,

    /// Fixed export prefix; disables export discovery
    #[arg(long, env = "CSI_MOUNT_PREFIX")]
    mount_prefix: Option<String>,

    /// Export prefixes tried in order against a portal's exports
    #[arg(
        long,
        env = "CSI_EXPORT_PREFIXES",
        value_delimiter = ',',
        default_value = "/,/mnt/data-portal,/mnt/data-portal/"
    )]
    export_prefixes: Vec<String>,

    /// Directory backing shares of file-backed volumes are mounted under
    #[arg(long, env = "CSI_BACKING_MOUNT_DIR", default_value = "/var/lib/csi-nfs-portal/backing")]
    backing_mount_dir: String,

    /// How long an operation waits for a busy volume or snapshot
    #[arg(long, default_value = "30")]
    lock_timeout_secs: u64,

    /// Prometheus metrics HTTP address (e.g., 0.0.0.0:9091)
    /// If not set, metrics endpoint is disabled
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Initialize Prometheus metrics endpoint if configured
    if let Some(ref addr_str) = args.metrics_addr {
        let addr: SocketAddr = addr_str
            .parse()
            .map_err(|e| format!("Invalid metrics address '{}': {}", addr_str, e))?;
        if let Err(e) = metrics::init_metrics(addr) {
            return Err(format!("Failed to initialize metrics: {}", e).into());
        }
    }

    // Determine node_id
    let node_id = match args.node_id.clone() {
        Some(id) => id,
        None => hostname::get()?.to_string_lossy().to_string(),
    };

    info!(
        driver_name = %args.driver_name,
        endpoint = %args.endpoint,
        api_endpoint = %args.api_endpoint,
        node_id = %node_id,
        controller_mode = %args.controller,
        node_mode = %args.node,
        "Starting NFS data-portal CSI driver"
    );

    let mut api_config = ApiConfig::new(&args.api_endpoint, &args.api_username, &args.api_password);
    api_config.tls_verify = args.tls_verify;
    let cache = Arc::new(TtlCache::new(API_CACHE_TTL, API_CACHE_ENTRIES));
    let api = Arc::new(ApiClient::new(api_config, cache)?);

    // Probe keeps retrying the login, so a cluster that is down at startup is not fatal
    if let Err(e) = api.login().await {
        warn!(error = %e, "Initial login to the management API failed");
    }

    let host: Arc<dyn HostOps> = Arc::new(LinuxHost::new());
    let mount_config = MountConfig {
        node_id: node_id.clone(),
        fqdn: args.fqdn.clone(),
        use_floating_ips: args.use_floating_ips,
        mount_prefix: args.mount_prefix.clone(),
        export_prefixes: args.export_prefixes.clone(),
        backing_mount_dir: args.backing_mount_dir.clone(),
    };
    let locks = Locks::new(Duration::from_secs(args.lock_timeout_secs));
    let portals = Arc::new(PortalSelector::new(
        api.clone(),
        host.clone(),
        mount_config,
        locks.backing_shares.clone(),
    ));

    let identity = IdentityService::new(&args.driver_name, api.clone());

    let controller = args.controller.then(|| {
        let config = DriverConfig {
            driver_name: args.driver_name.clone(),
            ..DriverConfig::default()
        };
        let volumes = Arc::new(VolumeReconciler::new(
            api.clone(),
            host.clone(),
            portals.clone(),
            locks.volumes.clone(),
            config,
        ));
        let snapshots = Arc::new(SnapshotManager::new(api.clone(), locks.snapshots.clone()));
        ControllerServer::new(ControllerService::new(volumes, snapshots))
    });

    let node = args
        .node
        .then(|| NodeServer::new(NodeService::new(node_id.clone(), portals.clone(), host.clone())));

    let router = Server::builder()
        .add_service(IdentityServer::new(identity))
        .add_optional_service(controller)
        .add_optional_service(node);

    let shutdown = async {
        shutdown_signal().await;
        info!("Shutdown signal received, draining connections...");
    };

    if let Some(socket_path) = args.endpoint.strip_prefix("unix://") {
        let socket_path = Path::new(socket_path);
        if let Some(parent) = socket_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match tokio::fs::remove_file(socket_path).await {
            Ok(()) => debug!(path = %socket_path.display(), "Removed stale socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let listener = UnixListener::bind(socket_path)?;
        info!("gRPC server listening on {}", args.endpoint);
        router
            .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown)
            .await?;
    } else {
        let addr: SocketAddr = args.endpoint.trim_start_matches("tcp://").parse()?;
        info!("gRPC server listening on {}", addr);
        router.serve_with_shutdown(addr, shutdown).await?;
    }

    info!("CSI driver shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM, SIGINT, or SIGHUP)
async fn shutdown_signal() {
    use signal::unix::{Signal, SignalKind, signal};

    // Install signal handlers, logging errors but continuing with available handlers
    let install = |kind: SignalKind, name: &str| match signal(kind) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::error!("Failed to install {} handler: {}", name, e);
            None
        }
    };

    // A handler that failed to install never fires
    async fn recv(sig: Option<Signal>) {
        match sig {
            Some(mut sig) => {
                sig.recv().await;
            }
            None => std::future::pending().await,
        }
    }

    let sigterm = install(SignalKind::terminate(), "SIGTERM");
    let sigint = install(SignalKind::interrupt(), "SIGINT");
    let sighup = install(SignalKind::hangup(), "SIGHUP");

    tokio::select! {
        _ = recv(sigterm) => info!("Received SIGTERM"),
        _ = recv(sigint) => info!("Received SIGINT"),
        _ = recv(sighup) => info!("Received SIGHUP, shutting down"),
    }
}
