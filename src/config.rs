//! Process configuration
//!
//! Command-line arguments with environment fallbacks, validated into typed
//! configs before any work starts. Validation failures are
//! [`Error::Config`] and stop the process.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use crate::claim::ObjectKey;
use crate::retry::RetryConfig;
use crate::workload::{PullPolicy, ReceiverTemplate};
use crate::{Error, DEFAULT_DESTINATION, DEFAULT_LISTEN_ADDRESS, DEFAULT_PVC_DIR};

/// Receiver process arguments
#[derive(Args, Debug, Clone)]
pub struct UploadServerArgs {
    /// Address to bind; empty means all interfaces
    #[arg(long, env = "LISTEN_ADDRESS", default_value = DEFAULT_LISTEN_ADDRESS)]
    pub listen_address: String,

    /// Port to bind
    #[arg(long, env = "LISTEN_PORT", default_value_t = crate::DEFAULT_LISTEN_PORT)]
    pub listen_port: u16,

    /// Mount point of the claim volume
    #[arg(long, env = "PVC_DIR", default_value = DEFAULT_PVC_DIR)]
    pub pvc_dir: PathBuf,

    /// File the uploaded image is written to
    #[arg(long, env = "DESTINATION", default_value = DEFAULT_DESTINATION)]
    pub destination: PathBuf,

    /// TLS private key (PEM)
    #[arg(long, env = "TLS_KEY_FILE")]
    pub tls_key_file: Option<PathBuf>,

    /// TLS certificate chain (PEM)
    #[arg(long, env = "TLS_CERT_FILE")]
    pub tls_cert_file: Option<PathBuf>,

    /// Receiver private key used to open upload tokens
    #[arg(long, env = "UPLOAD_PRIVATE_KEY_FILE")]
    pub private_key_file: Option<PathBuf>,

    /// Public key of the trusted token issuer
    #[arg(long, env = "UPLOAD_ISSUER_PUBLIC_KEY_FILE")]
    pub issuer_public_key_file: Option<PathBuf>,

    /// Claim this receiver serves
    #[arg(long, env = "UPLOAD_CLAIM_NAME")]
    pub claim_name: Option<String>,

    /// Namespace of the claim this receiver serves
    #[arg(long, env = "UPLOAD_CLAIM_NAMESPACE")]
    pub claim_namespace: Option<String>,
}

/// TLS material for the receiver listener
#[derive(Clone, Debug, PartialEq)]
pub struct TlsFiles {
    /// Private key path
    pub key: PathBuf,
    /// Certificate path
    pub cert: PathBuf,
}

/// Token verification settings for the receiver
#[derive(Clone, Debug, PartialEq)]
pub struct TokenVerification {
    /// Receiver private key path
    pub private_key_file: PathBuf,
    /// Issuer public key path
    pub issuer_public_key_file: PathBuf,
    /// Claim identity tokens must carry
    pub claim: ObjectKey,
}

/// Validated receiver configuration
#[derive(Clone, Debug, PartialEq)]
pub struct UploadServerConfig {
    /// Listener address
    pub listen_addr: SocketAddr,
    /// Mount point of the claim volume
    pub pvc_dir: PathBuf,
    /// File the uploaded image is written to
    pub destination: PathBuf,
    /// Listener TLS material
    pub tls: TlsFiles,
    /// Token checks, when enabled
    pub token: Option<TokenVerification>,
}

impl UploadServerArgs {
    /// Validate into a [`UploadServerConfig`]
    pub fn validate(self) -> Result<UploadServerConfig, Error> {
        let address = match self.listen_address.trim() {
            "" => DEFAULT_LISTEN_ADDRESS,
            other => other,
        };
        let ip: IpAddr = address
            .parse()
            .map_err(|_| Error::config(format!("invalid LISTEN_ADDRESS: {address}")))?;

        let (Some(key), Some(cert)) = (self.tls_key_file, self.tls_cert_file) else {
            return Err(Error::config(
                "TLS_KEY_FILE and TLS_CERT_FILE are both required",
            ));
        };

        let token = match (self.private_key_file, self.issuer_public_key_file) {
            (None, None) => None,
            (Some(private_key_file), Some(issuer_public_key_file)) => {
                let (Some(name), Some(namespace)) = (self.claim_name, self.claim_namespace) else {
                    return Err(Error::config(
                        "token verification needs UPLOAD_CLAIM_NAME and UPLOAD_CLAIM_NAMESPACE",
                    ));
                };
                Some(TokenVerification {
                    private_key_file,
                    issuer_public_key_file,
                    claim: ObjectKey::new(namespace, name),
                })
            }
            _ => {
                return Err(Error::config(
                    "UPLOAD_PRIVATE_KEY_FILE and UPLOAD_ISSUER_PUBLIC_KEY_FILE must be set together",
                ))
            }
        };

        Ok(UploadServerConfig {
            listen_addr: SocketAddr::new(ip, self.listen_port),
            pvc_dir: self.pvc_dir,
            destination: self.destination,
            tls: TlsFiles { key, cert },
            token,
        })
    }
}

/// Controller process arguments
#[derive(Args, Debug, Clone)]
pub struct ControllerArgs {
    /// Receiver container image
    #[arg(long, env = "UPLOAD_SERVER_IMAGE")]
    pub image: String,

    /// Receiver image pull policy
    #[arg(long, env = "PULL_POLICY", default_value = "IfNotPresent")]
    pub pull_policy: String,

    /// Log verbosity passed to receivers as `-v=<level>`
    #[arg(long, env = "VERBOSITY", default_value_t = 1)]
    pub receiver_verbosity: u8,

    /// Secret holding receiver TLS material
    #[arg(long, env = "UPLOAD_SERVER_TLS_SECRET", default_value = "cdi-upload-server-tls")]
    pub tls_secret: String,

    /// Secret holding receiver token keys; enables token checks in receivers
    #[arg(long, env = "UPLOAD_TOKEN_SECRET")]
    pub token_secret: Option<String>,

    /// Number of sync workers
    #[arg(long, default_value_t = 3)]
    pub threadiness: i32,

    /// Deadline for the initial cache sync
    #[arg(long, default_value_t = 60)]
    pub cache_sync_timeout_secs: u64,

    /// Failed syncs before a key is dropped (0 = retry forever)
    #[arg(long, default_value_t = 10)]
    pub max_retries: u32,

    /// Namespace to watch; all namespaces when unset
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub namespace: Option<String>,
}

/// Validated controller configuration
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Receiver template
    pub template: ReceiverTemplate,
    /// Number of sync workers, checked again when the controller starts
    pub threadiness: i32,
    /// Deadline for the initial cache sync
    pub cache_sync_timeout: Duration,
    /// Requeue policy
    pub retry: RetryConfig,
    /// Namespace to watch
    pub namespace: Option<String>,
}

impl ControllerArgs {
    /// Validate into a [`ControllerConfig`]
    pub fn validate(self) -> Result<ControllerConfig, Error> {
        if self.image.trim().is_empty() {
            return Err(Error::config("UPLOAD_SERVER_IMAGE must not be empty"));
        }
        let pull_policy: PullPolicy = self.pull_policy.parse()?;

        let template = ReceiverTemplate {
            pull_policy,
            verbosity: self.receiver_verbosity,
            tls_secret: self.tls_secret,
            token_secret: self.token_secret,
            ..ReceiverTemplate::new(self.image)
        };

        Ok(ControllerConfig {
            template,
            threadiness: self.threadiness,
            cache_sync_timeout: Duration::from_secs(self.cache_sync_timeout_secs),
            retry: RetryConfig::with_max_attempts(self.max_retries),
            namespace: self.namespace.filter(|ns| !ns.is_empty()),
        })
    }
}
