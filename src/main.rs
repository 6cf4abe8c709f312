//! Registry Config Server
//!
//! Runs one registry/config node: REST API, heartbeat eviction, peer
//! replication, config snapshot store with an optional YAML directory
//! source, and a Prometheus metrics endpoint.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use registry_config_server::config::{FileBackendConfig, FileSourceConfig, DEFAULT_LABEL};
use registry_config_server::controlplane::ConfigBackendKind;
use registry_config_server::replication::PeerState;
use registry_config_server::{
    ApiServer, ApiServerConfig, Error, NodeConfig, NodeStatus, RegistryNode, Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Registry Config Server - service registry and config distribution node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// REST API bind address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8761")]
    api_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:9761")]
    metrics_addr: String,

    /// Peer base URLs, comma separated
    #[arg(long, env = "PEERS", value_delimiter = ',')]
    peers: Vec<String>,

    /// This node's base URL as peers reach it
    #[arg(long, env = "SELF_URL")]
    self_url: Option<String>,

    /// Seconds without renewal before an instance expires
    #[arg(long, env = "LEASE_EXPIRY_SECS", default_value = "90")]
    lease_expiry_secs: u64,

    /// Seconds between eviction sweeps
    #[arg(long, env = "EVICTION_INTERVAL_SECS", default_value = "30")]
    eviction_interval_secs: u64,

    /// Fraction of expired instances that suspends eviction; only applies
    /// once at least --self-preservation-min-instances are registered
    #[arg(long, env = "SELF_PRESERVATION_THRESHOLD", default_value = "0.15")]
    self_preservation_threshold: f64,

    /// Registered instances needed before self-preservation can engage
    #[arg(long, env = "SELF_PRESERVATION_MIN_INSTANCES", default_value = "10")]
    self_preservation_min_instances: usize,

    /// Disable self-preservation
    #[arg(long, env = "DISABLE_SELF_PRESERVATION")]
    disable_self_preservation: bool,

    /// Directory for durable config history; in-memory when unset
    #[arg(long, env = "CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Directory of YAML files to publish from
    #[arg(long, env = "CONFIG_SOURCE_DIR")]
    config_source_dir: Option<PathBuf>,

    /// Label for snapshots published from the source directory
    #[arg(long, env = "CONFIG_LABEL", default_value = DEFAULT_LABEL)]
    config_label: String,

    /// Seconds between source directory scans
    #[arg(long, env = "CONFIG_POLL_SECS", default_value = "10")]
    config_poll_secs: u64,

    /// Versions retained per config key
    #[arg(long, env = "CONFIG_RETENTION", default_value = "10")]
    config_retention: usize,

    /// Allow cross-origin requests from anywhere
    #[arg(long, env = "CORS_PERMISSIVE")]
    cors_permissive: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn node_config(&self) -> Result<NodeConfig> {
        if !(0.0..=1.0).contains(&self.self_preservation_threshold) {
            return Err(Error::Configuration(format!(
                "self-preservation threshold must be within 0..=1, got {}",
                self.self_preservation_threshold
            )));
        }
        if self.config_retention == 0 {
            return Err(Error::Configuration("config retention must be at least 1".into()));
        }

        let mut config = NodeConfig::default();
        config.heartbeat.lease_expiry = Duration::from_secs(self.lease_expiry_secs);
        config.heartbeat.eviction_interval = Duration::from_secs(self.eviction_interval_secs);
        config.heartbeat.self_preservation_threshold = self.self_preservation_threshold;
        config.heartbeat.self_preservation_enabled = !self.disable_self_preservation;
        config.heartbeat.self_preservation_min_instances = self.self_preservation_min_instances;

        config.replication.peers = self
            .peers
            .iter()
            .map(|p| p.trim().trim_end_matches('/').to_string())
            .filter(|p| !p.is_empty())
            .collect();
        config.replication.self_url = self.self_url.clone();

        config.snapshot_store.retention = self.config_retention;
        if let Some(dir) = &self.config_dir {
            config.config_backend = ConfigBackendKind::File(FileBackendConfig {
                root_path: dir.clone(),
                ..Default::default()
            });
        }
        config.source = self.config_source_dir.as_ref().map(|dir| FileSourceConfig {
            dir: dir.clone(),
            label: self.config_label.clone(),
            poll_interval: Duration::from_secs(self.config_poll_secs.max(1)),
        });

        Ok(config)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting Registry Config Server");
    info!("  Version: {}", registry_config_server::VERSION);
    info!("  REST API: {}", args.api_addr);
    info!("  Peers: {:?}", args.peers);
    info!("  Config dir: {:?}", args.config_dir);
    info!("  Config source: {:?}", args.config_source_dir);

    let node = RegistryNode::build(args.node_config()?).await?;
    node.start();

    let metrics_addr = args.metrics_addr.clone();
    let metrics_node = node.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics_node).await {
            error!("Metrics server error: {}", e);
        }
    });

    let api_config = ApiServerConfig {
        rest_addr: args
            .api_addr
            .parse()
            .map_err(|e| Error::Configuration(format!("Invalid REST API address: {}", e)))?,
        cors_permissive: args.cors_permissive,
        ..Default::default()
    };
    let api_server = Arc::new(ApiServer::new(api_config, node.clone()));

    let signal_server = api_server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            signal_server.shutdown();
        }
    });

    let result = api_server.run().await;
    node.shutdown().await;

    info!("Server shutdown complete");
    result
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "reqwest=warn", "tower=warn", "axum=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

/// Gauges refreshed from the node status on every scrape
struct NodeMetrics {
    instances_total: prometheus::IntGauge,
    instances_up: prometheus::IntGauge,
    registrations: prometheus::IntGauge,
    renewals: prometheus::IntGauge,
    evictions: prometheus::IntGauge,
    self_preservation_sweeps: prometheus::IntGauge,
    replication_pushed: prometheus::IntGauge,
    replication_failed: prometheus::IntGauge,
    peers: prometheus::IntGaugeVec,
    config_keys: prometheus::IntGauge,
    config_publishes: prometheus::IntGauge,
    config_conflicts: prometheus::IntGauge,
    subscriptions: prometheus::IntGauge,
    webhooks: prometheus::IntGauge,
}

fn gauge(name: &str, help: &str) -> Result<prometheus::IntGauge> {
    prometheus::register_int_gauge!(name, help)
        .map_err(|e| Error::Internal(format!("Failed to register metric {}: {}", name, e)))
}

impl NodeMetrics {
    fn register() -> Result<Self> {
        Ok(Self {
            instances_total: gauge("registry_instances_total", "Registered instances")?,
            instances_up: gauge("registry_instances_up", "Instances with status UP")?,
            registrations: gauge("registry_registrations", "Registrations since start")?,
            renewals: gauge("registry_renewals", "Lease renewals since start")?,
            evictions: gauge("registry_evictions", "Instances evicted since start")?,
            self_preservation_sweeps: gauge(
                "registry_self_preservation_sweeps",
                "Sweeps that skipped eviction under self-preservation",
            )?,
            replication_pushed: gauge("replication_events_pushed", "Events pushed to peers")?,
            replication_failed: gauge("replication_events_failed", "Events peers did not accept")?,
            peers: prometheus::register_int_gauge_vec!("replication_peers", "Peers by state", &["state"])
                .map_err(|e| Error::Internal(format!("Failed to register metric replication_peers: {}", e)))?,
            config_keys: gauge("config_keys", "Known config keys")?,
            config_publishes: gauge("config_publishes", "Config versions published since start")?,
            config_conflicts: gauge("config_conflicts", "Rejected conditional publishes")?,
            subscriptions: gauge("config_subscriptions_active", "Open change subscriptions")?,
            webhooks: gauge("config_webhooks", "Registered webhooks")?,
        })
    }

    fn refresh(&self, status: &NodeStatus) {
        let to_i64 = |v: u64| i64::try_from(v).unwrap_or(i64::MAX);

        self.instances_total.set(to_i64(status.registry.total_instances));
        self.instances_up.set(to_i64(status.registry.up_instances));
        self.registrations.set(to_i64(status.registry.registrations));
        self.renewals.set(to_i64(status.registry.renewals));
        self.evictions.set(to_i64(status.registry.evictions));
        self.self_preservation_sweeps
            .set(to_i64(status.heartbeat.self_preservation_sweeps));
        self.replication_pushed.set(to_i64(status.replication.pushed));
        self.replication_failed.set(to_i64(status.replication.failed));

        let healthy = status.peers.iter().filter(|p| p.state == PeerState::Healthy).count();
        self.peers.with_label_values(&["healthy"]).set(healthy as i64);
        self.peers
            .with_label_values(&["degraded"])
            .set((status.peers.len() - healthy) as i64);

        self.config_keys.set(status.config.keys as i64);
        self.config_publishes.set(to_i64(status.config.publishes));
        self.config_conflicts.set(to_i64(status.config.conflicts));
        self.subscriptions.set(status.notifier.active_subscriptions as i64);
        self.webhooks.set(status.webhooks as i64);
    }
}

async fn run_metrics_server(addr: &str, node: Arc<RegistryNode>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let metrics = Arc::new(NodeMetrics::register()?);

    let make_svc = make_service_fn(move |_conn| {
        let node = node.clone();
        let metrics = metrics.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let node = node.clone();
                let metrics = metrics.clone();
                async move {
                    let mut response = Response::new(Body::empty());
                    match req.uri().path() {
                        "/metrics" => {
                            metrics.refresh(&node.status().await);

                            let encoder = TextEncoder::new();
                            let mut buffer = Vec::new();
                            if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
                                error!("Failed to encode metrics: {}", e);
                                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                            } else if let Ok(content_type) = encoder.format_type().parse() {
                                response.headers_mut().insert(hyper::header::CONTENT_TYPE, content_type);
                                *response.body_mut() = Body::from(buffer);
                            }
                        }
                        "/healthz" | "/livez" => {
                            *response.body_mut() = Body::from("ok");
                        }
                        _ => {
                            *response.status_mut() = StatusCode::NOT_FOUND;
                            *response.body_mut() = Body::from("not found");
                        }
                    }
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid metrics server address: {}", e)))?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
