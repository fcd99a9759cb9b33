use anyhow::{bail, Context};
use capdev_core::bootstrap::{root_token, Bootstrapper};
use capdev_core::coap::option::{OBSERVE_DEREGISTER, OBSERVE_REGISTER};
use capdev_core::config::{load_config, ServerConfig};
use capdev_core::token::{Envelope, RevocationRequest, RevocationType};
use capdev_core::{validator, Action, AuthorizationGate, Client, ResourceServer, Site, TokenValidator};
use clap::{Parser, Subcommand, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "capdev", version, about = "Capability-gated CoAP device server")]
struct Cli {
    /// TOML or JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, used when RUST_LOG is not set
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Issue the root token, then serve the resource tree
    Serve {
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Serve without issuing a root token first
        #[arg(long)]
        skip_bootstrap: bool,
    },
    /// Issue the root token and wait for the ledger to commit it
    IssueRoot {
        /// Print the token instead of issuing it
        #[arg(long)]
        dry_run: bool,
    },
    /// Run an envelope through the configured validator
    Validate {
        #[arg(long)]
        envelope: String,
    },
    /// Send one request to a device
    Request {
        #[arg(long, default_value = "127.0.0.1:5683")]
        server: SocketAddr,

        #[arg(long, default_value = "GET")]
        method: Action,

        #[arg(long)]
        path: String,

        /// Capability envelope, e.g. {"AC":"GET","ID":"..."}
        #[arg(long)]
        envelope: String,

        #[arg(long, default_value = "")]
        payload: String,

        /// Observe the resource and print this many notifications
        #[arg(long)]
        observe: Option<usize>,
    },
    /// Print a revocation request for `capbac`
    Revocation {
        #[arg(long)]
        id: String,

        #[arg(long)]
        issuer: String,

        #[arg(long, default_value = "coap://device")]
        device: String,

        #[arg(long, value_enum, default_value_t = Scope::All)]
        scope: Scope,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Scope {
    All,
    Only,
    Children,
}

impl From<Scope> for RevocationType {
    fn from(scope: Scope) -> Self {
        match scope {
            Scope::All => RevocationType::All,
            Scope::Only => RevocationType::Only,
            Scope::Children => RevocationType::Children,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match load_config(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        },
        None => ServerConfig::default(),
    };
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    init_tracing(&config.log_level);

    if let Err(e) = run(cli.command, config).await {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(command: Commands, mut config: ServerConfig) -> anyhow::Result<()> {
    match command {
        Commands::Serve {
            bind,
            skip_bootstrap,
        } => {
            if let Some(bind) = bind {
                config.bind = bind;
            }
            let bootstrap = config.bootstrap.enabled && !skip_bootstrap;
            serve(config, bootstrap).await
        }
        Commands::IssueRoot { dry_run } => {
            let token = root_token(&config);
            if dry_run {
                println!("{}", serde_json::to_string_pretty(&token)?);
                return Ok(());
            }
            let receipt = Bootstrapper::from_config(&config).run(&token).await?;
            println!("Root token committed: {}", receipt.link);
            Ok(())
        }
        Commands::Validate { envelope } => {
            let envelope = Envelope::parse(&envelope).context("Invalid envelope")?;
            let result = validator::from_config(&config.capbac)
                .validate(&envelope)
                .await?;
            println!("{}", serde_json::to_string(&result)?);
            Ok(())
        }
        Commands::Request {
            server,
            method,
            path,
            envelope,
            payload,
            observe,
        } => {
            let body = config
                .framing
                .join(envelope.as_bytes(), payload.as_bytes())?;
            request(server, method, &path, body, observe).await
        }
        Commands::Revocation {
            id,
            issuer,
            device,
            scope,
        } => {
            let revocation = RevocationRequest {
                id,
                issuer,
                device,
                revocation_type: scope.into(),
            };
            println!("{}", serde_json::to_string(&revocation)?);
            Ok(())
        }
    }
}

async fn serve(config: ServerConfig, bootstrap: bool) -> anyhow::Result<()> {
    info!("Starting server...");

    if bootstrap {
        let token = root_token(&config);
        if let Err(e) = Bootstrapper::from_config(&config).run(&token).await {
            error!("Unexpected error: {} Server not started.", e);
            std::process::exit(1);
        }
    }

    let gate = AuthorizationGate::new(validator::from_config(&config.capbac))
        .with_framing(config.framing);
    let site = Site::device(&config, gate);

    let server = ResourceServer::bind(config.bind, site)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;
    info!("Server started.");

    server
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

async fn request(
    server: SocketAddr,
    method: Action,
    path: &str,
    body: Vec<u8>,
    observe: Option<usize>,
) -> anyhow::Result<()> {
    let mut client = Client::connect(server).await?;
    let token = Client::new_token();

    let register = observe.map(|_| OBSERVE_REGISTER);
    let response = client
        .request(method, path, body.clone(), register, token.clone())
        .await?;
    println!("{}", response.code);
    println!("{}", String::from_utf8_lossy(&response.payload));

    let Some(count) = observe else {
        return Ok(());
    };
    if response.observe().is_none() {
        bail!("Server did not accept the observation");
    }

    for _ in 0..count {
        let notification = client.next_notification(&token).await?;
        println!(
            "[{}] {}",
            notification.observe().unwrap_or_default(),
            String::from_utf8_lossy(&notification.payload)
        );
        if !notification.code.is_success() {
            return Ok(());
        }
    }

    client
        .request(method, path, body, Some(OBSERVE_DEREGISTER), token)
        .await?;
    Ok(())
}
