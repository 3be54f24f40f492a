use chrono::{DateTime, Utc};

use kubestream_types::WireLineEvent;

/// Text of the marker line appended when a session stops
pub const STOP_MARKER: &str = "====================================================================================================";

/// A line as held in a client session buffer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Assigned by the buffer, increasing
    pub id: u64,
    pub namespace: String,
    pub pod: String,
    pub container: Option<String>,
    pub text: String,
    /// Server-supplied timestamp, if the session asked for one
    pub timestamp: Option<DateTime<Utc>>,
    /// Client receive time
    pub received_at: DateTime<Utc>,
}

impl Message {
    /// A local line with no source pod (markers, channel diagnostics)
    pub fn local(text: &str) -> Self {
        Self {
            id: 0,
            namespace: String::new(),
            pod: String::new(),
            container: None,
            text: text.to_string(),
            timestamp: None,
            received_at: Utc::now(),
        }
    }

    /// Stamp a line event received from the server
    pub fn from_wire(event: WireLineEvent) -> Self {
        let timestamp = event.parsed_timestamp();
        Self {
            id: 0,
            namespace: event.namespace,
            pod: event.pod_name,
            container: event.container_name,
            text: event.text,
            timestamp,
            received_at: Utc::now(),
        }
    }

    /// "ns/pod/container" (or shorter when parts are missing)
    pub fn source_label(&self) -> String {
        let mut parts: Vec<&str> = Vec::with_capacity(3);
        if !self.namespace.is_empty() {
            parts.push(&self.namespace);
        }
        if !self.pod.is_empty() {
            parts.push(&self.pod);
        }
        if let Some(container) = self.container.as_deref().filter(|c| !c.is_empty()) {
            parts.push(container);
        }
        parts.join("/")
    }

    pub fn is_local(&self) -> bool {
        self.namespace.is_empty() && self.pod.is_empty()
    }

    pub fn is_stop_marker(&self) -> bool {
        self.is_local() && self.text == STOP_MARKER
    }
}
