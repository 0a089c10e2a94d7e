//! Claim keys and the annotation contract
//!
//! The controller never owns claims. It reads the upload intent annotation,
//! mirrors the receiver pod phase back onto the claim, and recognises its own
//! receiver objects by owner reference plus the created-by annotation.

use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::ResourceExt;

use crate::Error;

/// Presence on a claim requests an upload receiver
pub const ANN_UPLOAD_REQUEST: &str = "cdi.kubevirt.io/storage.upload.target";

/// Last observed receiver pod phase, written by the controller
pub const ANN_UPLOAD_POD_PHASE: &str = "cdi.kubevirt.io/storage.upload.pod.phase";

/// Marks receiver pods and services created by the controller
pub const ANN_CREATED_BY_UPLOAD: &str = "cdi.kubevirt.io/storage.createdByUploadController";

/// Owner kind that receiver objects point at
pub const CLAIM_KIND: &str = "PersistentVolumeClaim";

/// Pod phase after a successful upload
pub const PHASE_SUCCEEDED: &str = "Succeeded";

/// Pod phase after a failed upload
pub const PHASE_FAILED: &str = "Failed";

const RESOURCE_PREFIX: &str = "cdi-upload-";

/// Identity of a namespaced object: `namespace/name`
///
/// Claims are queued by this key and the local caches index every kind by it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Object namespace
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Create a key from its parts
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key for an object's own namespace and name
    pub fn for_object<K: kube::Resource>(obj: &K) -> Option<Self> {
        let meta = obj.meta();
        Some(Self::new(meta.namespace.clone()?, meta.name.clone()?))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for ObjectKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split('/').collect::<Vec<_>>().as_slice() {
            [namespace, name] if !namespace.is_empty() && !name.is_empty() => {
                Ok(Self::new(*namespace, *name))
            }
            _ => Err(Error::InvalidKey(s.to_string())),
        }
    }
}

/// Deterministic receiver resource name for a claim
pub fn receiver_name(claim_name: &str) -> String {
    format!("{RESOURCE_PREFIX}{claim_name}")
}

/// Whether the claim currently asks for an upload receiver
pub fn upload_requested(claim: &PersistentVolumeClaim) -> bool {
    claim.annotations().contains_key(ANN_UPLOAD_REQUEST)
}

/// Receiver phase last mirrored onto the claim, empty when never written
pub fn mirrored_phase(claim: &PersistentVolumeClaim) -> &str {
    claim
        .annotations()
        .get(ANN_UPLOAD_POD_PHASE)
        .map(String::as_str)
        .unwrap_or_default()
}

/// Terminal receiver phases: the upload is over either way
pub fn is_terminal_phase(phase: &str) -> bool {
    phase == PHASE_SUCCEEDED || phase == PHASE_FAILED
}

/// Controller owner reference pointing at the claim
pub fn owner_reference(claim: &PersistentVolumeClaim) -> OwnerReference {
    OwnerReference {
        api_version: "v1".to_string(),
        kind: CLAIM_KIND.to_string(),
        name: claim.name_any(),
        uid: claim.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// The owner reference flagged as controller, if any
pub fn controller_of(meta: &ObjectMeta) -> Option<&OwnerReference> {
    meta.owner_references
        .as_ref()?
        .iter()
        .find(|r| r.controller == Some(true))
}

/// Whether the object's controller is exactly this claim (matched by UID)
pub fn is_controlled_by(meta: &ObjectMeta, claim: &PersistentVolumeClaim) -> bool {
    match (controller_of(meta), claim.uid()) {
        (Some(owner), Some(uid)) => owner.uid == uid,
        _ => false,
    }
}

/// Claim key owning a receiver object, if the object is one of ours
///
/// Only objects controlled by a claim AND marked created-by-upload qualify;
/// user objects that happen to share the name are ignored.
pub fn owning_claim(meta: &ObjectMeta) -> Option<ObjectKey> {
    let owner = controller_of(meta)?;
    let created_by_us = meta
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(ANN_CREATED_BY_UPLOAD));
    if owner.kind != CLAIM_KIND || !created_by_us {
        return None;
    }
    Some(ObjectKey::new(meta.namespace.clone()?, owner.name.clone()))
}
