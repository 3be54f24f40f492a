//! Kubernetes access for kubestream
//!
//! This crate provides the two external collaborators the streaming core
//! talks to: a pod directory (list/watch pods, resolve workload selectors)
//! and a container log source (follow-mode byte streams). Both are traits so
//! the pipeline can run against in-memory fakes.

mod client;
mod directory;
mod error;
mod log_source;
mod selector;

pub use client::KubeClient;
pub use directory::{KubePodDirectory, PodDirectory, PodSelector, PodWatchEvent};
pub use error::K8sError;
pub use log_source::{ByteStream, KubeLogSource, LogOptions, LogSource};

// Re-export types that are used in our public API
pub use kubestream_types::{OwnerRef, PodIdentity, PodRecord, PodStatus, SetType};
