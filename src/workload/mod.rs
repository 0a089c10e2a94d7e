//! Receiver workload: the pod and service that accept one upload per claim
//!
//! Both objects are named `cdi-upload-<claim>`, carry the created-by
//! annotation, and are controlled by the claim through an owner reference so
//! the cluster garbage-collects them with the claim.
//!
//! - [`template`] builds the objects from a [`ReceiverTemplate`]
//! - [`client`] is the cluster write path ([`WorkloadClient`])
//! - [`provisioner`] implements get-or-create and idempotent delete

mod client;
mod provisioner;
mod template;

pub use client::{KubeWorkloadClient, WorkloadClient};
pub use provisioner::Provisioner;
pub use template::{build_pod, build_service, PullPolicy, ReceiverTemplate};

#[cfg(test)]
pub use client::MockWorkloadClient;
