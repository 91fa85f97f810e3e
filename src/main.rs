use fleetgate::admin::{AdminServer, AdminState, PKG_NAME, VERSION};
use fleetgate::channels::build_notifier;
use fleetgate::config::Config;
use fleetgate::events::EventBus;
use fleetgate::filters::FilterChain;
use fleetgate::forward::ProxyDispatcher;
use fleetgate::headers::{HeaderProvider, StaticHeaderProvider};
use fleetgate::instance::{InstanceId, StatusInfo};
use fleetgate::locator::RouteLocator;
use fleetgate::notifications::{NotificationDispatcher, NotifierEntry};
use fleetgate::pool::{ConnectionPool, PoolConfig};
use fleetgate::proxy::ProxyServer;
use fleetgate::refresh::RefreshController;
use fleetgate::registry::{InMemoryRegistry, InstanceRegistry};
use fleetgate::template::{TemplateRegistry, TemplateRenderer};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fleetgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Registry and event bus
    let bus = EventBus::new(config.server.event_capacity);
    let registry = Arc::new(InMemoryRegistry::new(bus.clone()));
    seed_registry(&registry, &config);
    let registry_reader: Arc<dyn InstanceRegistry> = registry.clone();

    // Routes
    let locator = Arc::new(RouteLocator::new(Arc::clone(&registry_reader)));
    let refresh = RefreshController::new(Arc::clone(&locator));
    let refresh_handle = tokio::spawn(refresh.run(bus.subscribe(), shutdown_rx.clone()));

    // Notifications
    let renderer: Arc<dyn TemplateRenderer> = Arc::new(TemplateRegistry::from_sources(&config.templates)?);
    let mut entries = Vec::with_capacity(config.notifiers.len());
    for notifier_config in &config.notifiers {
        let notifier = build_notifier(notifier_config, Arc::clone(&renderer)).map_err(|e| {
            error!(notifier = %notifier_config.name, error = %e, "Failed to create notifier");
            anyhow::anyhow!("notifier '{}': {}", notifier_config.name, e)
        })?;
        info!(
            notifier = %notifier_config.name,
            channel = notifier_config.channel_type.as_str(),
            enabled = notifier_config.enabled,
            "Notifier configured"
        );
        entries.push(NotifierEntry::new(notifier, notifier_config.send_timeout()));
    }
    let notifications = Arc::new(NotificationDispatcher::new(Arc::clone(&registry_reader), entries));
    let notifications_handle = tokio::spawn(Arc::clone(&notifications).run(bus.subscribe(), shutdown_rx.clone()));

    // Proxy
    let header_provider = Arc::new(StaticHeaderProvider::new(config.headers.clone(), Arc::clone(&registry_reader)));
    let chain = FilterChain::standard(
        &config.proxy,
        Arc::clone(&locator),
        Arc::clone(&header_provider) as Arc<dyn HeaderProvider>,
    );
    let pool_config = PoolConfig::from(&config.proxy);
    info!(
        max_idle = pool_config.max_idle_per_host,
        idle_timeout_secs = pool_config.idle_timeout.as_secs(),
        max_per_target = pool_config.max_connections_per_target,
        "Connection pool configured"
    );
    let dispatcher = Arc::new(ProxyDispatcher::new(
        Arc::new(ConnectionPool::new(pool_config)?),
        config.proxy.request_timeout(),
        &config.proxy.ignored_headers,
    ));

    let proxy_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid proxy bind address");
            anyhow::anyhow!("Invalid proxy bind address: {}", e)
        })?;
    let proxy = ProxyServer::new(proxy_addr, chain, dispatcher, shutdown_rx.clone());
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    // Admin API
    let admin_addr: SocketAddr = format!("127.0.0.1:{}", config.server.admin_port)
        .parse()
        .map_err(|e| {
            error!(admin_port = config.server.admin_port, error = %e, "Invalid admin bind address");
            anyhow::anyhow!("Invalid admin bind address: {}", e)
        })?;

    // Generate or use configured admin token
    let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
        token
    });

    let admin_server = AdminServer::new(
        admin_addr,
        AdminState {
            locator: Arc::clone(&locator),
            registry: Arc::clone(&registry),
            notifications: Arc::clone(&notifications),
        },
        shutdown_rx.clone(),
        admin_token,
    );
    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "Admin server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or config reload (SIGHUP)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!(path = %config_path.display(), "Received SIGHUP, reloading configuration...");
                    reload(&config_path, &notifications, &header_provider);
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Wait for tasks to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = proxy_handle.await;
        let _ = admin_handle.await;
        let _ = refresh_handle.await;
        let _ = notifications_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

/// Register the instances listed in the configuration file
fn seed_registry(registry: &InMemoryRegistry, config: &Config) {
    for instance in &config.instances {
        let id = instance.id.clone().map(InstanceId::new);
        match registry.register(id, instance.registration.clone()) {
            Ok(id) => {
                if let Some(status) = instance.status {
                    if let Err(e) = registry.update_status(&id, StatusInfo::of(status)) {
                        warn!(instance_id = %id, error = %e, "Failed to apply configured status");
                    }
                }
            }
            Err(e) => {
                warn!(name = %instance.registration.name, error = %e, "Skipping configured instance");
            }
        }
    }
    info!(instances = registry.len(), "Registry seeded from configuration");
}

/// Re-read the configuration and apply what can change at runtime
fn reload(path: &Path, notifications: &NotificationDispatcher, header_provider: &StaticHeaderProvider) {
    match Config::load(path) {
        Ok(config) => {
            notifications.reload(&config.notifiers);
            header_provider.update(config.headers);
            info!(notifiers = config.notifiers.len(), "Configuration reloaded successfully");
        }
        Err(e) => {
            error!(error = %e, "Failed to reload configuration");
        }
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting administration gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        admin_port = config.server.admin_port,
        prefix = %config.proxy.normalized_prefix(),
        "Server configuration"
    );
    info!(
        request_timeout_secs = config.proxy.request_timeout_secs,
        max_connections_per_target = config.proxy.max_connections_per_target,
        sensitive_all = config.proxy.sensitive_all,
        endpoints = ?config.proxy.endpoints,
        "Proxy settings"
    );
    info!(
        notifiers = config.notifiers.len(),
        templates = config.templates.len(),
        instances = config.instances.len(),
        "Configured components"
    );
}
