use std::{net::SocketAddr, sync::Arc, time::Duration};

use clap::Parser;
use eyre::{Context, Result};
use gantry::{
    adapters::tls::{self, CertLoader, ClientAddr, StreamListener},
    build_gateway, config,
    config::Reloader,
    metrics, register_reload_appliers, tracing_setup, PooledHttpClient, Shutdown,
};
use tokio_rustls::TlsAcceptor;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    /// Configuration file path.
    #[clap(short, long, default_value = "gantry.yaml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Start the gateway (default).
    Serve {
        #[clap(short, long, default_value = "gantry.yaml")]
        config: String,
    },
    /// Validate a configuration file and exit.
    Validate {
        #[clap(short, long, default_value = "gantry.yaml")]
        config: String,
    },
    /// Write a starter configuration file.
    Init {
        #[clap(short, long, default_value = "gantry.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    let (command, config_path) = match args.command {
        Some(Commands::Serve { config }) => ("serve", config),
        Some(Commands::Validate { config }) => ("validate", config),
        Some(Commands::Init { config }) => ("init", config),
        None => ("serve", args.config),
    };

    match command {
        "validate" => validate_command(&config_path),
        "init" => init_command(&config_path),
        _ => {
            if let Err(e) = serve(&config_path).await {
                eprintln!("fatal: {e:#}");
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

async fn serve(config_path: &str) -> Result<()> {
    let cfg = config::load(config_path)
        .with_context(|| format!("loading configuration from {config_path}"))?;

    tracing_setup::init_tracing(cfg.logging.output_kind())?;

    for warning in &cfg.warnings {
        tracing::warn!(message = %warning, "config warning");
    }

    tracing::info!(
        port = cfg.server.port,
        routes = cfg.routes.len(),
        auth_enabled = cfg.auth.enabled,
        metrics_enabled = cfg.metrics.is_enabled(),
        metrics_path = %cfg.metrics.path,
        trusted_proxies = cfg.server.trusted_proxies.len(),
        max_body_bytes = cfg.server.max_body_bytes,
        global_timeout_ms = cfg.server.global_timeout_ms,
        tls_enabled = cfg.server.tls.enabled,
        admin_enabled = cfg.admin.enabled,
        "configuration loaded"
    );

    let metrics_handle = if cfg.metrics.is_enabled() {
        Some(metrics::install_recorder()?)
    } else {
        None
    };

    let client = Arc::new(PooledHttpClient::new(&cfg.routes)?);

    let reloader = Arc::new(Reloader::new(config_path, cfg.clone()));
    let parts = build_gateway(&cfg, client, metrics_handle, Some(Arc::clone(&reloader)));
    register_reload_appliers(&reloader, &parts);
    reloader.start();

    let _sweeper = parts.limiter.spawn_sweeper();

    let shutdown = Arc::new(Shutdown::new());
    {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move { shutdown.run_signal_handler().await });
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.server.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;

    let app = parts
        .router
        .into_make_service_with_connect_info::<ClientAddr>();

    let drain_timeout = cfg.server.shutdown_timeout();
    let shutdown_wait = {
        let shutdown = Arc::clone(&shutdown);
        async move { shutdown.wait().await }
    };

    if cfg.server.tls.enabled {
        let cert_loader = CertLoader::new(&cfg.server.tls.cert_file, &cfg.server.tls.key_file)
            .context("loading TLS certificate")?;
        cert_loader.watch();

        let rustls_config = tls::server_config(cert_loader, &cfg.server.tls.min_version)?;
        let acceptor = TlsAcceptor::from(Arc::new(rustls_config));
        let local_addr = listener.local_addr().context("reading local addr")?;
        let tls_stream = tls_listener::TlsListener::new(acceptor, listener);
        let tls_listener = StreamListener {
            stream: tls_stream,
            local_addr,
        };

        tracing::info!(
            addr = %addr,
            min_tls = %cfg.server.tls.min_version,
            "starting gateway with TLS"
        );
        let server = axum::serve(tls_listener, app).with_graceful_shutdown(shutdown_wait);
        run_until_drained(server, &shutdown, drain_timeout).await?;
    } else {
        tracing::info!(addr = %addr, "starting gateway");
        let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_wait);
        run_until_drained(server, &shutdown, drain_timeout).await?;
    }

    tracing::info!("gateway stopped gracefully");
    Ok(())
}

/// Await the server; after a shutdown signal, give in-flight requests
/// the configured drain window before letting the process exit.
async fn run_until_drained<F>(server: F, shutdown: &Arc<Shutdown>, drain: Duration) -> Result<()>
where
    F: std::future::IntoFuture<Output = std::io::Result<()>>,
{
    let forced = {
        let shutdown = Arc::clone(shutdown);
        async move {
            shutdown.wait().await;
            tracing::info!(timeout_secs = drain.as_secs(), "draining in-flight requests");
            tokio::time::sleep(drain).await;
        }
    };

    tokio::select! {
        result = server.into_future() => result.context("server error"),
        _ = forced => {
            tracing::warn!("drain window exceeded, forcing shutdown");
            Ok(())
        }
    }
}

fn validate_command(config_path: &str) -> Result<()> {
    println!("Validating configuration file: {config_path}");

    match config::load(config_path) {
        Ok(cfg) => {
            println!("✅ Configuration is valid");
            for warning in &cfg.warnings {
                println!("⚠️  {warning}");
            }
            println!();
            println!("Summary:");
            println!("  • Port: {}", cfg.server.port);
            println!("  • Routes: {}", cfg.routes.len());
            println!("  • TLS enabled: {}", cfg.server.tls.enabled);
            println!("  • Auth enabled: {}", cfg.auth.enabled);
            println!("  • Admin enabled: {}", cfg.admin.enabled);
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration is invalid:");
            eprintln!("   {e:#}");
            std::process::exit(1);
        }
    }
}

fn init_command(config_path: &str) -> Result<()> {
    let path = std::path::Path::new(config_path);
    if path.exists() {
        eprintln!("❌ {config_path} already exists");
        std::process::exit(1);
    }

    let starter = r#"# Gantry gateway configuration

server:
  port: 8080
  max_body_bytes: 1048576
  # global_timeout_ms: 5000
  # trusted_proxies: ["10.0.0.0/8"]

rate_limit:
  requests_per_second: 100
  burst_size: 50

circuit_breaker:
  window_size: 10
  failure_threshold: 0.5
  reset_timeout_ms: 30000
  half_open_max: 2

# auth:
#   enabled: true
#   jwt_secret: ${GANTRY_JWT_SECRET}
#   issuer: https://issuer.example
#   audience: gateway
#   scopes: ["read"]

routes:
  - path_prefix: /api
    backend: http://localhost:3000
    strip_prefix: false
    retry_attempts: 2
    timeout_ms: 30000
"#;

    std::fs::write(path, starter).with_context(|| format!("writing {config_path}"))?;
    println!("✅ Created starter configuration at {config_path}");
    println!("   Run 'gantry serve --config {config_path}' to start the gateway");
    Ok(())
}
