//! Volume Upload - controller, upload receiver, and token tooling

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use volume_upload::config::{ControllerArgs, UploadServerArgs};
use volume_upload::controller::{UploadController, WatchSources};
use volume_upload::server::UploadServer;
use volume_upload::token::{issue_token, keys, open_token, RsaTokenCrypto};
use volume_upload::workload::KubeWorkloadClient;

/// Volume Upload - one-shot authenticated disk image uploads into storage claims
#[derive(Parser, Debug)]
#[command(name = "volume-upload", version, about, long_about = None)]
struct Cli {
    /// Log verbosity (0-5); ignored when RUST_LOG is set
    #[arg(short = 'v', long = "verbosity", global = true, default_value_t = 1)]
    verbosity: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconcile upload receivers for annotated claims
    Controller(ControllerArgs),

    /// Accept a single upload and exit (runs inside the receiver pod)
    UploadServer(UploadServerArgs),

    /// Write a new RSA key pair as PEM files
    GenerateKeys(GenerateKeysArgs),

    /// Issue an upload token for a claim
    IssueToken(IssueTokenArgs),

    /// Open an upload token and print the claim it names
    OpenToken(OpenTokenArgs),
}

#[derive(Parser, Debug)]
struct GenerateKeysArgs {
    /// Private key output path
    #[arg(long)]
    private_key: PathBuf,

    /// Public key output path
    #[arg(long)]
    public_key: PathBuf,

    /// Modulus size in bits
    #[arg(long, default_value_t = keys::DEFAULT_KEY_BITS)]
    bits: usize,
}

#[derive(Parser, Debug)]
struct IssueTokenArgs {
    /// Claim name
    #[arg(long)]
    name: String,

    /// Claim namespace
    #[arg(long)]
    namespace: String,

    /// Receiver public key (PEM)
    #[arg(long)]
    recipient_public_key: PathBuf,

    /// Issuer private key (PEM)
    #[arg(long)]
    issuer_private_key: PathBuf,
}

#[derive(Parser, Debug)]
struct OpenTokenArgs {
    /// Token to open
    #[arg(long, env = "UPLOAD_TOKEN")]
    token: String,

    /// Receiver private key (PEM)
    #[arg(long)]
    recipient_private_key: PathBuf,

    /// Issuer public key (PEM)
    #[arg(long)]
    issuer_public_key: PathBuf,
}

fn default_filter(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        2 | 3 => "debug",
        _ => "trace",
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // The receiver's TLS listener needs a process-wide provider
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install aws-lc-rs crypto provider: {e:?}");
        std::process::exit(1);
    }

    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(cli.verbosity)));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Controller(args) => run_controller(args).await,
        Commands::UploadServer(args) => run_upload_server(args).await,
        Commands::GenerateKeys(args) => generate_keys(args),
        Commands::IssueToken(args) => run_issue_token(args),
        Commands::OpenToken(args) => run_open_token(args),
    }
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    let config = args.validate()?;
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let controller = UploadController::new(
        Arc::new(KubeWorkloadClient::new(client.clone())),
        WatchSources::kube(client, config.namespace.clone()),
        config.template,
        config.retry,
        config.cache_sync_timeout,
    );

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received shutdown signal");
        }
        on_signal.cancel();
    });

    controller.run(config.threadiness, shutdown).await?;
    tracing::info!("upload controller shutting down");
    Ok(())
}

async fn run_upload_server(args: UploadServerArgs) -> anyhow::Result<()> {
    let config = args.validate()?;
    UploadServer::new(config)?.run().await?;
    tracing::info!("upload server exiting after completed upload");
    Ok(())
}

fn generate_keys(args: GenerateKeysArgs) -> anyhow::Result<()> {
    let private = keys::generate_private_key(args.bits)?;
    std::fs::write(&args.private_key, keys::private_key_to_pem(&private)?)?;
    std::fs::write(
        &args.public_key,
        keys::public_key_to_pem(&private.to_public_key())?,
    )?;
    tracing::info!(
        private_key = %args.private_key.display(),
        public_key = %args.public_key.display(),
        bits = args.bits,
        "generated key pair"
    );
    Ok(())
}

fn run_issue_token(args: IssueTokenArgs) -> anyhow::Result<()> {
    let recipient = keys::load_public_key(&args.recipient_public_key)?;
    let issuer = keys::load_private_key(&args.issuer_private_key)?;
    let token = issue_token(
        &RsaTokenCrypto,
        &args.name,
        &args.namespace,
        &recipient,
        &issuer,
    )?;
    println!("{token}");
    Ok(())
}

fn run_open_token(args: OpenTokenArgs) -> anyhow::Result<()> {
    let recipient = keys::load_private_key(&args.recipient_private_key)?;
    let issuer = keys::load_public_key(&args.issuer_public_key)?;
    let data = open_token(&RsaTokenCrypto, &args.token, &recipient, &issuer)?;
    println!("{}", serde_json::to_string_pretty(&data)?);
    Ok(())
}
