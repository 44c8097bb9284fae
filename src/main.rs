use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use k8s_openapi::api::core::v1::{Node, Service};
use kube::api::{Api, ListParams};
use service_lb_controller::cloud::{CloudProvider, MemoryBackend, MemoryCloud};
use service_lb_controller::cluster::KubeCluster;
use service_lb_controller::config::ControllerConfig;
use service_lb_controller::controller::{predicates, KubeEventRecorder, ServiceController};
use service_lb_controller::{leader, telemetry, Error};
use tokio::sync::watch;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller
    Run(RunArgs),
    /// Show version and build information
    Version,
    /// Show load balancer services in the cluster
    Info,
}

/// Cloud implementations compiled into this binary
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum CloudProviderKind {
    /// In-process load balancers; nothing is provisioned outside the process
    Memory,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Cloud provider that provisions load balancers
    #[arg(long, value_enum, env = "CLOUD_PROVIDER")]
    cloud_provider: CloudProviderKind,

    /// Accept a provider that only simulates load balancers
    #[arg(long, env = "ALLOW_SIMULATED_CLOUD")]
    allow_simulated: bool,

    /// TOML file overlaying the default controller settings
    #[arg(long, env = "LB_CONTROLLER_CONFIG")]
    config: Option<PathBuf>,

    /// Number of concurrent sync workers
    #[arg(long, env = "LB_CONTROLLER_WORKERS")]
    workers: Option<usize>,

    /// Cluster name used to tag load balancers
    #[arg(long, env = "CLUSTER_NAME")]
    cluster_name: Option<String>,

    /// Seconds between full resyncs, 0 disables
    #[arg(long, env = "LB_CONTROLLER_RESYNC_SECONDS")]
    resync_seconds: Option<u64>,

    /// Namespace holding the leader election lease
    #[arg(long, env = "POD_NAMESPACE", default_value = "kube-system")]
    namespace: String,

    /// Only reconcile while holding the leader lease
    #[arg(long, env = "LEADER_ELECT")]
    leader_elect: bool,

    /// Address for /healthz, /readyz and /metrics
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Log as JSON lines
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl RunArgs {
    fn controller_config(&self) -> Result<ControllerConfig, Error> {
        let mut config = match &self.config {
            Some(path) => ControllerConfig::from_file(path)?,
            None => ControllerConfig::default(),
        };
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(name) = &self.cluster_name {
            config.cluster_name = name.clone();
        }
        if let Some(secs) = self.resync_seconds {
            config.resync_secs = secs;
        }
        config.validate()?;
        Ok(config)
    }

    fn build_cloud(&self, config: &ControllerConfig) -> Result<Box<dyn CloudProvider>, Error> {
        match self.cloud_provider {
            CloudProviderKind::Memory if !self.allow_simulated => Err(Error::ConfigError(
                "cloud provider 'memory' only simulates load balancers and writes addresses \
                 that route nowhere; pass --allow-simulated to run it against a cluster"
                    .to_string(),
            )),
            CloudProviderKind::Memory => {
                warn!("Using the in-memory cloud provider, no real load balancers are provisioned");
                let backend = Arc::new(MemoryBackend::new(Arc::new(config.classifier())));
                Ok(Box::new(MemoryCloud::new(backend)))
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("service-lb-controller v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            println!("Rust Version: {}", env!("RUST_VERSION"));
            Ok(())
        }
        Commands::Info => run_info().await,
        Commands::Run(run_args) => run_controller(run_args).await,
    }
}

async fn run_info() -> Result<(), Error> {
    let client = kube::Client::try_default().await?;

    let services: Api<Service> = Api::all(client.clone());
    let services = services.list(&ListParams::default()).await?;
    let nodes: Api<Node> = Api::all(client);
    let nodes = nodes.list(&ListParams::default()).await?;

    println!("Nodes: {}", nodes.items.len());
    for svc in services.items.iter().filter(|s| predicates::needs_load_balancer(s)) {
        let address = svc
            .status
            .as_ref()
            .and_then(|s| s.load_balancer.as_ref())
            .and_then(|lb| lb.ingress.as_ref())
            .and_then(|ingress| ingress.first())
            .and_then(|i| i.ip.clone().or_else(|| i.hostname.clone()))
            .unwrap_or_else(|| "<pending>".to_string());
        println!(
            "{}/{}\t{}",
            svc.metadata.namespace.as_deref().unwrap_or_default(),
            svc.metadata.name.as_deref().unwrap_or_default(),
            address
        );
    }
    Ok(())
}

fn init_tracing(log_json: bool) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(log_json.then(|| fmt::layer().json().with_target(true)))
        .with((!log_json).then(|| fmt::layer().with_target(true)));

    match telemetry::otlp_endpoint() {
        Some(endpoint) => {
            match telemetry::init_telemetry(&endpoint, telemetry::DEFAULT_SERVICE_NAME) {
                Ok(otel_layer) => {
                    registry.with(otel_layer).init();
                    info!("OpenTelemetry tracing initialized, exporting to {}", endpoint);
                }
                Err(e) => {
                    registry.init();
                    warn!("OpenTelemetry tracing disabled: {}", e);
                }
            }
        }
        None => {
            registry.init();
            info!(
                "OpenTelemetry tracing disabled ({} not set)",
                telemetry::OTLP_ENDPOINT_ENV
            );
        }
    }
}

async fn run_controller(args: RunArgs) -> Result<(), Error> {
    init_tracing(args.log_json);
    let config = args.controller_config()?;

    info!(
        "Starting service-lb-controller v{} for cluster {}",
        env!("CARGO_PKG_VERSION"),
        config.cluster_name
    );

    let cloud = args.build_cloud(&config)?;

    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let (cluster, informers) = KubeCluster::new(client.clone());
    let cluster = Arc::new(cluster);
    let recorder = Arc::new(KubeEventRecorder::new(client.clone()));

    let controller = ServiceController::new(
        config,
        cloud.as_ref(),
        cluster.clone(),
        cluster.clone(),
        recorder,
    )?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let stop_tx = Arc::new(stop_tx);

    {
        let stop_tx = stop_tx.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Shutdown signal received");
            stop_tx.send_replace(true);
        });
    }

    let informers = informers.start(controller.router());

    #[cfg(feature = "rest-api")]
    {
        let state = service_lb_controller::rest_api::ApiState {
            cluster: cluster.clone(),
            queue: controller.queue().clone(),
        };
        let mut stop = stop_rx.clone();
        let addr = args.metrics_addr;
        tokio::spawn(async move {
            let shutdown = async move {
                let _ = stop.wait_for(|stopped| *stopped).await;
            };
            if let Err(e) = service_lb_controller::rest_api::run_server(addr, state, shutdown).await {
                error!("HTTP server error: {:?}", e);
            }
        });
    }
    #[cfg(not(feature = "rest-api"))]
    info!("HTTP endpoints disabled, ignoring {}", args.metrics_addr);

    if args.leader_elect {
        let identity = leader::default_identity();
        info!("Leader election using holder ID: {}", identity);

        let (leading_tx, mut leading_rx) = watch::channel(false);
        let elector = leader::LeaderElector::new(client, &args.namespace, identity);
        tokio::spawn(elector.run(leading_tx));

        let mut stop = stop_rx.clone();
        tokio::select! {
            _ = leading_rx.wait_for(|leading| *leading) => {}
            _ = stop.wait_for(|stopped| *stopped) => {
                info!("Stopped before acquiring leadership");
                informers.iter().for_each(|h| h.abort());
                telemetry::shutdown_telemetry();
                return Ok(());
            }
        }

        let stop_tx = stop_tx.clone();
        tokio::spawn(async move {
            leader::lost(leading_rx).await;
            warn!("Leadership lost, stopping controller");
            stop_tx.send_replace(true);
        });
    }

    let result = controller.run(stop_rx).await;

    informers.iter().for_each(|h| h.abort());
    telemetry::shutdown_telemetry();
    result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
