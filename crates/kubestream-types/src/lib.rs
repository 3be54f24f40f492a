//! Shared types for kubestream
//!
//! This crate contains data structures used across multiple kubestream crates:
//! the tailing scope, pod identities, line events and their wire form, and
//! alarm rules.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix carried by every diagnostic line sent in place of a real log line
pub const DIAGNOSTIC_PREFIX: &str = "Error: ";

/// Default client-side message buffer capacity
pub const DEFAULT_MAX_MESSAGES: usize = 10_000;

/// Build the text of a diagnostic line
pub fn diagnostic_text(message: impl fmt::Display) -> String {
    format!("{}{}", DIAGNOSTIC_PREFIX, message)
}

// ============================================================================
// Scope Types
// ============================================================================

/// Kind of controller owning a set of pods
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SetType {
    Replica,
    Stateful,
    Daemon,
    /// Pods are owned through the deployment's `<name>-<hash>` replica sets
    Deployment,
}

impl SetType {
    /// Kubernetes kind name used in owner references
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Replica => "ReplicaSet",
            Self::Stateful => "StatefulSet",
            Self::Daemon => "DaemonSet",
            Self::Deployment => "Deployment",
        }
    }

    /// Map an owner reference kind back to a set type
    pub fn from_kind(kind: &str) -> Option<Self> {
        match kind {
            "ReplicaSet" => Some(Self::Replica),
            "StatefulSet" => Some(Self::Stateful),
            "DaemonSet" => Some(Self::Daemon),
            "Deployment" => Some(Self::Deployment),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Replica => "replica",
            Self::Stateful => "stateful",
            Self::Daemon => "daemon",
            Self::Deployment => "deployment",
        }
    }
}

/// Granularity at which pods are selected
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeKind {
    Container,
    Pod,
    #[serde(alias = "set", alias = "deployment")]
    Workload,
    Namespace,
    Cluster,
}

impl ScopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Container => "container",
            Self::Pod => "pod",
            Self::Workload => "workload",
            Self::Namespace => "namespace",
            Self::Cluster => "cluster",
        }
    }
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated scope with exactly the addressing fields it needs
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Scope {
    Container {
        namespace: String,
        pod: String,
        container: String,
    },
    Pod {
        namespace: String,
        pod: String,
    },
    Workload {
        namespace: String,
        set: String,
        set_type: Option<SetType>,
    },
    Namespace {
        namespace: String,
    },
    Cluster,
}

impl Scope {
    pub fn kind(&self) -> ScopeKind {
        match self {
            Self::Container { .. } => ScopeKind::Container,
            Self::Pod { .. } => ScopeKind::Pod,
            Self::Workload { .. } => ScopeKind::Workload,
            Self::Namespace { .. } => ScopeKind::Namespace,
            Self::Cluster => ScopeKind::Cluster,
        }
    }

    /// Namespace the scope is confined to (None for cluster scope)
    pub fn namespace(&self) -> Option<&str> {
        match self {
            Self::Container { namespace, .. }
            | Self::Pod { namespace, .. }
            | Self::Workload { namespace, .. }
            | Self::Namespace { namespace } => Some(namespace),
            Self::Cluster => None,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Container {
                namespace,
                pod,
                container,
            } => write!(f, "container {}/{}/{}", namespace, pod, container),
            Self::Pod { namespace, pod } => write!(f, "pod {}/{}", namespace, pod),
            Self::Workload {
                namespace,
                set,
                set_type,
            } => match set_type {
                Some(t) => write!(f, "{} set {}/{}", t.as_str(), namespace, set),
                None => write!(f, "set {}/{}", namespace, set),
            },
            Self::Namespace { namespace } => write!(f, "namespace {}", namespace),
            Self::Cluster => f.write_str("cluster"),
        }
    }
}

// ============================================================================
// Pod Identity Types
// ============================================================================

/// Key identifying one tailed container stream
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PodKey {
    pub namespace: String,
    pub pod: String,
    pub container: String,
}

impl PodKey {
    pub fn new(namespace: &str, pod: &str, container: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            pod: pod.to_string(),
            container: container.to_string(),
        }
    }
}

impl fmt::Display for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.pod, self.container)
    }
}

/// A resolved pod container, immutable once resolved
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodIdentity {
    pub namespace: String,
    pub pod_name: String,
    pub container_name: String,
    pub owner_name: Option<String>,
    pub owner_type: Option<SetType>,
}

impl PodIdentity {
    pub fn new(namespace: &str, pod_name: &str, container_name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            pod_name: pod_name.to_string(),
            container_name: container_name.to_string(),
            owner_name: None,
            owner_type: None,
        }
    }

    /// Attach the owning set
    pub fn with_owner(mut self, name: &str, set_type: Option<SetType>) -> Self {
        self.owner_name = Some(name.to_string());
        self.owner_type = set_type;
        self
    }

    pub fn key(&self) -> PodKey {
        PodKey::new(&self.namespace, &self.pod_name, &self.container_name)
    }
}

/// Pod lifecycle phase
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PodStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl From<&str> for PodStatus {
    fn from(s: &str) -> Self {
        match s {
            "Pending" => Self::Pending,
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }
}

/// Controller reference of a pod
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnerRef {
    pub kind: String,
    pub name: String,
}

impl OwnerRef {
    /// Whether this is one of the `<deployment>-<hash>` replica sets of a deployment
    pub fn belongs_to_deployment(&self, deployment: &str) -> bool {
        if self.kind == SetType::Deployment.kind() {
            return self.name == deployment;
        }
        self.kind == SetType::Replica.kind()
            && self
                .name
                .strip_prefix(deployment)
                .and_then(|rest| rest.strip_prefix('-'))
                .is_some_and(|hash| {
                    !hash.is_empty() && hash.chars().all(|c| c.is_ascii_alphanumeric())
                })
    }
}

/// Pod as reported by the pod directory
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodRecord {
    pub namespace: String,
    pub name: String,
    pub status: PodStatus,
    pub owners: Vec<OwnerRef>,
    pub containers: Vec<String>,
    /// Deletion timestamp is set
    pub deleting: bool,
}

impl PodRecord {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            status: PodStatus::Unknown,
            owners: Vec::new(),
            containers: Vec::new(),
            deleting: false,
        }
    }

    /// Pending or running pods that are not being torn down produce output
    pub fn is_live(&self) -> bool {
        matches!(self.status, PodStatus::Pending | PodStatus::Running) && !self.deleting
    }

    /// Whether one of the owner references names the given set
    pub fn owned_by(&self, set: &str, set_type: Option<SetType>) -> bool {
        self.owners.iter().any(|o| match set_type {
            Some(SetType::Deployment) => o.belongs_to_deployment(set),
            Some(t) => o.name == set && t.kind() == o.kind,
            None => o.name == set,
        })
    }

    /// One identity per container, tagged with the owning set if any
    pub fn identities(&self) -> Vec<PodIdentity> {
        let owner = self
            .owners
            .iter()
            .find(|o| SetType::from_kind(&o.kind).is_some())
            .or_else(|| self.owners.first());

        self.containers
            .iter()
            .map(|container| {
                let identity = PodIdentity::new(&self.namespace, &self.name, container);
                match owner {
                    Some(o) => identity.with_owner(&o.name, SetType::from_kind(&o.kind)),
                    None => identity,
                }
            })
            .collect()
    }
}

// ============================================================================
// Line Event Types
// ============================================================================

/// One complete log line from one container
#[derive(Clone, Debug)]
pub struct LineEvent {
    /// Container the line came from
    pub source: PodIdentity,

    /// Line text, without the trailing newline
    pub text: String,

    /// Server-supplied timestamp (only when requested)
    pub timestamp: Option<DateTime<Utc>>,

    /// When the line was reassembled
    pub received_at: DateTime<Utc>,
}

impl LineEvent {
    pub fn new(source: PodIdentity, text: String) -> Self {
        Self {
            source,
            text,
            timestamp: None,
            received_at: Utc::now(),
        }
    }

    /// A synthetic line reporting a failure for this source
    pub fn diagnostic(source: PodIdentity, message: impl fmt::Display) -> Self {
        Self::new(source, diagnostic_text(message))
    }

    pub fn is_diagnostic(&self) -> bool {
        self.text.starts_with(DIAGNOSTIC_PREFIX)
    }

    /// Convert to the server-to-client wire form
    pub fn to_wire(&self) -> WireLineEvent {
        WireLineEvent {
            namespace: self.source.namespace.clone(),
            pod_name: self.source.pod_name.clone(),
            container_name: Some(self.source.container_name.clone())
                .filter(|c| !c.is_empty()),
            text: self.text.clone(),
            timestamp: self.timestamp.map(|ts| ts.to_rfc3339()),
        }
    }
}

/// Line event as carried over the channel (one JSON text frame per line)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireLineEvent {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub pod_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl WireLineEvent {
    pub fn is_diagnostic(&self) -> bool {
        self.text.starts_with(DIAGNOSTIC_PREFIX)
    }

    /// Parse the ISO-8601 timestamp, if present and well formed
    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
            .as_deref()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc))
    }
}

// ============================================================================
// Watch Request Types
// ============================================================================

/// Per-request streaming options
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WatchOptions {
    pub timestamp: bool,
    pub previous: bool,
    pub max_messages: usize,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            timestamp: false,
            previous: false,
            max_messages: DEFAULT_MAX_MESSAGES,
        }
    }
}

fn default_max_messages() -> usize {
    DEFAULT_MAX_MESSAGES
}

/// Watch request sent once by the client when a channel opens
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchRequest {
    pub scope: ScopeKind,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_type: Option<SetType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(default)]
    pub timestamp: bool,
    #[serde(default)]
    pub previous: bool,
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
}

/// Reasons a watch request cannot be turned into a scope
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("{scope} scope requires a non-empty '{field}' field")]
    MissingField {
        scope: ScopeKind,
        field: &'static str,
    },
}

impl WatchRequest {
    /// Build the request for a scope
    pub fn new(scope: &Scope, options: WatchOptions) -> Self {
        let mut request = Self {
            scope: scope.kind(),
            namespace: scope.namespace().unwrap_or_default().to_string(),
            set: None,
            set_type: None,
            pod: None,
            container: None,
            timestamp: options.timestamp,
            previous: options.previous,
            max_messages: options.max_messages,
        };

        match scope {
            Scope::Container { pod, container, .. } => {
                request.pod = Some(pod.clone());
                request.container = Some(container.clone());
            }
            Scope::Pod { pod, .. } => request.pod = Some(pod.clone()),
            Scope::Workload { set, set_type, .. } => {
                request.set = Some(set.clone());
                request.set_type = *set_type;
            }
            Scope::Namespace { .. } | Scope::Cluster => {}
        }

        request
    }

    pub fn options(&self) -> WatchOptions {
        WatchOptions {
            timestamp: self.timestamp,
            previous: self.previous,
            max_messages: self.max_messages,
        }
    }

    /// Validate the addressing fields required by the scope
    pub fn to_scope(&self) -> Result<Scope, RequestError> {
        let require = |value: &Option<String>, field: &'static str| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .ok_or(RequestError::MissingField {
                    scope: self.scope,
                    field,
                })
        };
        let namespace = || {
            let ns = self.namespace.trim();
            if ns.is_empty() {
                Err(RequestError::MissingField {
                    scope: self.scope,
                    field: "namespace",
                })
            } else {
                Ok(ns.to_string())
            }
        };

        Ok(match self.scope {
            ScopeKind::Container => Scope::Container {
                namespace: namespace()?,
                pod: require(&self.pod, "pod")?,
                container: require(&self.container, "container")?,
            },
            ScopeKind::Pod => Scope::Pod {
                namespace: namespace()?,
                pod: require(&self.pod, "pod")?,
            },
            ScopeKind::Workload => Scope::Workload {
                namespace: namespace()?,
                set: require(&self.set, "set")?,
                set_type: self.set_type,
            },
            ScopeKind::Namespace => Scope::Namespace {
                namespace: namespace()?,
            },
            ScopeKind::Cluster => Scope::Cluster,
        })
    }
}

// ============================================================================
// Alarm Types
// ============================================================================

/// How a triggered alarm is surfaced
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlarmType {
    /// Modal requiring explicit dismissal
    Blocking,
    /// Auto-dismissing notification
    Timed,
    /// Notification kept until dismissed, with a "view" action
    Persistent,
}

/// Notification severity
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Default,
    Info,
    Success,
    Warning,
    Error,
}

/// A substring alarm owned by one client session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmRule {
    pub expression: String,
    #[serde(rename = "type")]
    pub kind: AlarmType,
    #[serde(default)]
    pub severity: Severity,
    /// Message template; `{line}` and `{expression}` are substituted
    #[serde(default)]
    pub message: String,
    #[serde(default, alias = "beep", alias = "audibleAlert")]
    pub audible: bool,
}

impl AlarmRule {
    pub fn new(expression: &str, kind: AlarmType) -> Self {
        Self {
            expression: expression.to_string(),
            kind,
            severity: Severity::default(),
            message: String::new(),
            audible: false,
        }
    }

    pub fn with_message(mut self, message: &str) -> Self {
        self.message = message.to_string();
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn audible(mut self) -> Self {
        self.audible = true;
        self
    }

    /// Literal substring match; an empty expression never fires
    pub fn matches(&self, text: &str) -> bool {
        !self.expression.is_empty() && text.contains(&self.expression)
    }

    /// Render the message template for a matching line
    pub fn render_message(&self, line: &str) -> String {
        if self.message.is_empty() {
            return format!("'{}' matched: {}", self.expression, line);
        }
        self.message
            .replace("{expression}", &self.expression)
            .replace("{line}", line)
    }
}
