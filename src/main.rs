use anyhow::{Context, bail};
use clap::Parser;
use http_relay::config::{LoggingConfig, RelayConfig};
use http_relay::config_validation::RelayConfigValidator;
use http_relay::error::exit_code;
use http_relay::{Relay, logging};
use log::{error, info};
use std::path::Path;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[clap(
    version,
    about = "Relay HTTP GET requests from a local port to a fixed remote host:port"
)]
struct Args {
    #[clap(value_name = "HOST", help = "Remote host to relay to (IPv6 may be bracketed)")]
    host: Option<String>,

    #[clap(value_name = "PORT", help = "Remote port")]
    port: Option<u16>,

    #[clap(value_name = "LOCAL_PORT", help = "Local port to listen on (defaults to PORT)")]
    local_port: Option<u16>,

    #[clap(value_name = "LOCAL_ADDR", help = "Local address to bind (default: 0.0.0.0)")]
    local_addr: Option<String>,

    #[clap(short = 'n', long, value_name = "NUM", help = "Number of worker threads (default: 8)")]
    num_threads: Option<usize>,

    #[clap(short, long, value_name = "BYTES", help = "Upstream read chunk size in bytes (default: 1)")]
    buffer_size: Option<usize>,

    #[clap(short = 't', long, value_name = "SECONDS", help = "Kill the process after this many seconds (0 disables)")]
    sigkill_timeout: Option<u64>,

    #[clap(short = 's', long, help = "Only count down while a stream is open and stalled")]
    sigkill_on_stream_stop: bool,

    #[clap(short, long, value_name = "FILE", help = "Configuration file path (JSON)")]
    config: Option<String>,

    #[clap(long, value_name = "LEVEL", help = "Log level: trace, debug, info, warn, error")]
    log_level: Option<String>,

    #[clap(long, value_name = "FORMAT", help = "Log format: text or json")]
    log_format: Option<String>,

    #[clap(long, value_name = "FILE", help = "Generate a sample configuration file")]
    generate_config: Option<String>,
}

fn main() {
    let args = Args::parse();

    if let Some(config_file) = &args.generate_config {
        match generate_sample_config(config_file) {
            Ok(()) => {
                println!("Sample configuration file generated: {}", config_file);
                std::process::exit(0);
            }
            Err(e) => {
                eprintln!("{:#}", e);
                std::process::exit(exit_code::FAILURE);
            }
        }
    }

    let config = match create_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{:#}", e);
            std::process::exit(exit_code::CONFIG_INVALID);
        }
    };

    if let Err(e) = logging::init(&config.logging.clone().unwrap_or_default()) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    if let Err(e) = RelayConfigValidator::new(&config).validate().into_result() {
        error!("{}", e);
        std::process::exit(e.exit_code());
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.num_threads)
        .thread_name("relay-worker")
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start runtime: {}", e);
            std::process::exit(exit_code::FAILURE);
        }
    };

    let code = runtime.block_on(serve(config));
    // In-flight workers are not waited for.
    std::process::exit(code);
}

async fn serve(config: RelayConfig) -> i32 {
    let relay = match Relay::bind(config).await {
        Ok(relay) => relay,
        Err(e) => {
            error!("{}", e);
            return e.exit_code();
        }
    };

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_stop_signal().await;
        http_relay::shutdown(&signal_token);
    });

    match relay.run(shutdown).await {
        Ok(()) => {
            info!("Relay stopped. Goodbye!");
            0
        }
        Err(e) => {
            error!("{}", e);
            e.exit_code()
        }
    }
}

async fn wait_for_stop_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
                    _ = terminate.recv() => info!("Received SIGTERM, shutting down"),
                }
                return;
            }
            Err(e) => error!("Cannot listen for SIGTERM: {}", e),
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down"),
        Err(e) => error!("Cannot listen for Ctrl+C: {}", e),
    }
}

fn create_config(args: &Args) -> anyhow::Result<RelayConfig> {
    let mut config = if let Some(config_file) = &args.config {
        if !Path::new(config_file).exists() {
            bail!("Configuration file not found: {}", config_file);
        }
        RelayConfig::from_file(config_file)
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("Failed to load {}", config_file))?
    } else {
        let host = args.host.clone().context("HOST is required unless --config is given")?;
        let port = args.port.context("PORT is required unless --config is given")?;
        RelayConfig::new(host, port)
    };

    // Command-line values override the file.
    if args.config.is_some() {
        if let Some(host) = &args.host {
            config.host = host.clone();
        }
        if let Some(port) = args.port {
            config.port = port;
        }
    }
    if let Some(local_port) = args.local_port {
        config.local_port = Some(local_port);
    }
    if let Some(local_addr) = &args.local_addr {
        config.local_addr = local_addr.clone();
    }
    if let Some(num_threads) = args.num_threads {
        config.num_threads = num_threads;
    }
    if let Some(buffer_size) = args.buffer_size {
        config.buffer_size = buffer_size;
    }
    if let Some(sigkill_timeout) = args.sigkill_timeout {
        config.sigkill_timeout = sigkill_timeout;
    }
    if args.sigkill_on_stream_stop {
        config.sigkill_on_stream_stop = true;
    }

    if args.log_level.is_some() || args.log_format.is_some() {
        let log_config = config.logging.get_or_insert_with(LoggingConfig::default);
        if let Some(level) = &args.log_level {
            log_config.level = Some(logging::parse_log_level(level).map_err(anyhow::Error::msg)?);
        }
        if let Some(format) = &args.log_format {
            log_config.format = Some(logging::parse_log_format(format).map_err(anyhow::Error::msg)?);
        }
    }

    Ok(config)
}

fn generate_sample_config(file_path: &str) -> anyhow::Result<()> {
    let mut sample = RelayConfig::new("caster.example.com", 2101);
    sample.local_port = Some(2102);
    sample.buffer_size = 1024;
    sample.sigkill_timeout = 60;
    sample.sigkill_on_stream_stop = true;
    sample.logging = Some(LoggingConfig::default());

    sample
        .to_file(file_path)
        .map_err(|e| anyhow::anyhow!("Failed to write {}: {}", file_path, e))
}
