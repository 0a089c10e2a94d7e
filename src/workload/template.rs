//! Receiver pod and service templates

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PersistentVolumeClaim, PersistentVolumeClaimVolumeSource,
    Pod, PodSpec, SecretVolumeSource, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::claim::{owner_reference, ANN_CREATED_BY_UPLOAD};
use crate::{Error, DEFAULT_DESTINATION, DEFAULT_LISTEN_PORT, DEFAULT_PVC_DIR, SERVICE_PORT};

const CONTAINER_NAME: &str = "cdi-upload-server";
/// Subcommand the receiver image runs
const RECEIVER_COMMAND: &str = "upload-server";
const DATA_VOLUME: &str = "cdi-data-vol";
const TLS_VOLUME: &str = "cdi-upload-tls";
const TLS_MOUNT_PATH: &str = "/etc/upload-server/tls";
const TOKEN_VOLUME: &str = "cdi-upload-token-keys";
const TOKEN_MOUNT_PATH: &str = "/etc/upload-server/token";

/// Image pull policy for the receiver container
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PullPolicy {
    /// Pull only when the image is missing on the node
    #[default]
    IfNotPresent,
    /// Always pull
    Always,
    /// Never pull
    Never,
}

impl fmt::Display for PullPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PullPolicy::IfNotPresent => "IfNotPresent",
            PullPolicy::Always => "Always",
            PullPolicy::Never => "Never",
        };
        f.write_str(s)
    }
}

impl FromStr for PullPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IfNotPresent" => Ok(PullPolicy::IfNotPresent),
            "Always" => Ok(PullPolicy::Always),
            "Never" => Ok(PullPolicy::Never),
            other => Err(Error::config(format!(
                "invalid pull policy {other:?}, expected IfNotPresent, Always, or Never"
            ))),
        }
    }
}

/// Parameters shared by every receiver the controller spawns
#[derive(Clone, Debug, PartialEq)]
pub struct ReceiverTemplate {
    /// Receiver container image
    pub image: String,
    /// Image pull policy
    pub pull_policy: PullPolicy,
    /// Log verbosity passed as `-v=<level>`
    pub verbosity: u8,
    /// Secret holding `tls.key` and `tls.crt` for the receiver listener
    pub tls_secret: String,
    /// Secret holding `private.pem` and `issuer.pem`; enables token checks
    pub token_secret: Option<String>,
}

impl ReceiverTemplate {
    /// Template with the given image and defaults for everything else
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            pull_policy: PullPolicy::default(),
            verbosity: 1,
            tls_secret: "cdi-upload-server-tls".to_string(),
            token_secret: None,
        }
    }
}

fn receiver_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "app".to_string(),
            "containerized-data-importer".to_string(),
        ),
        (
            "cdi.kubevirt.io".to_string(),
            "cdi-upload-server".to_string(),
        ),
        ("service".to_string(), name.to_string()),
    ])
}

fn receiver_meta(name: &str, claim: &PersistentVolumeClaim) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: claim.namespace(),
        labels: Some(receiver_labels(name)),
        annotations: Some(BTreeMap::from([(
            ANN_CREATED_BY_UPLOAD.to_string(),
            "yes".to_string(),
        )])),
        owner_references: Some(vec![owner_reference(claim)]),
        ..Default::default()
    }
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn requested_size(claim: &PersistentVolumeClaim) -> Option<String> {
    claim
        .spec
        .as_ref()?
        .resources
        .as_ref()?
        .requests
        .as_ref()?
        .get("storage")
        .map(|q| q.0.clone())
}

fn secret_volume(name: &str, secret: &str) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: Some(read_only),
        ..Default::default()
    }
}

/// Build the receiver pod for a claim
pub fn build_pod(template: &ReceiverTemplate, name: &str, claim: &PersistentVolumeClaim) -> Pod {
    let claim_name = claim.name_any();

    let mut env_vars = vec![
        env("LISTEN_PORT", DEFAULT_LISTEN_PORT.to_string()),
        env("PVC_DIR", DEFAULT_PVC_DIR),
        env("DESTINATION", DEFAULT_DESTINATION),
        env("TLS_KEY_FILE", format!("{TLS_MOUNT_PATH}/tls.key")),
        env("TLS_CERT_FILE", format!("{TLS_MOUNT_PATH}/tls.crt")),
        env("UPLOAD_CLAIM_NAME", claim_name.clone()),
        env("UPLOAD_CLAIM_NAMESPACE", claim.namespace().unwrap_or_default()),
    ];
    if let Some(size) = requested_size(claim) {
        env_vars.push(env("UPLOAD_CLAIM_SIZE", size));
    }

    let mut volume_mounts = vec![
        mount(DATA_VOLUME, DEFAULT_PVC_DIR, false),
        mount(TLS_VOLUME, TLS_MOUNT_PATH, true),
    ];
    let mut volumes = vec![
        Volume {
            name: DATA_VOLUME.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name,
                read_only: Some(false),
            }),
            ..Default::default()
        },
        secret_volume(TLS_VOLUME, &template.tls_secret),
    ];

    if let Some(secret) = &template.token_secret {
        env_vars.push(env(
            "UPLOAD_PRIVATE_KEY_FILE",
            format!("{TOKEN_MOUNT_PATH}/private.pem"),
        ));
        env_vars.push(env(
            "UPLOAD_ISSUER_PUBLIC_KEY_FILE",
            format!("{TOKEN_MOUNT_PATH}/issuer.pem"),
        ));
        volume_mounts.push(mount(TOKEN_VOLUME, TOKEN_MOUNT_PATH, true));
        volumes.push(secret_volume(TOKEN_VOLUME, secret));
    }

    Pod {
        metadata: receiver_meta(name, claim),
        spec: Some(PodSpec {
            containers: vec![Container {
                name: CONTAINER_NAME.to_string(),
                image: Some(template.image.clone()),
                image_pull_policy: Some(template.pull_policy.to_string()),
                args: Some(vec![
                    RECEIVER_COMMAND.to_string(),
                    format!("-v={}", template.verbosity),
                ]),
                ports: Some(vec![ContainerPort {
                    name: Some("https".to_string()),
                    container_port: i32::from(DEFAULT_LISTEN_PORT),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                env: Some(env_vars),
                volume_mounts: Some(volume_mounts),
                ..Default::default()
            }],
            restart_policy: Some("Never".to_string()),
            volumes: Some(volumes),
            ..Default::default()
        }),
        status: None,
    }
}

/// Build the receiver service for a claim
pub fn build_service(name: &str, claim: &PersistentVolumeClaim) -> Service {
    Service {
        metadata: receiver_meta(name, claim),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(BTreeMap::from([(
                "service".to_string(),
                name.to_string(),
            )])),
            ports: Some(vec![ServicePort {
                name: Some("https".to_string()),
                port: SERVICE_PORT,
                target_port: Some(IntOrString::Int(i32::from(DEFAULT_LISTEN_PORT))),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    }
}
