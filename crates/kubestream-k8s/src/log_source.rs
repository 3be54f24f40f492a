use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use futures::{AsyncReadExt, FutureExt, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::LogParams;
use kube::{Api, Client};

use kubestream_types::PodIdentity;

use crate::K8sError;

/// Size of each read from a container log stream
const CHUNK_SIZE: usize = 8 * 1024;

/// Raw, arbitrarily-chunked output of one container
pub type ByteStream = BoxStream<'static, std::io::Result<Vec<u8>>>;

/// Options for opening a container log stream
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogOptions {
    pub follow: bool,
    /// Read the previous terminated instance of the container
    pub previous: bool,
    /// Ask the server to prefix each line with an RFC 3339 timestamp
    pub timestamps: bool,
    pub tail_lines: Option<i64>,
    /// Only lines newer than this instant
    pub since_time: Option<DateTime<Utc>>,
}

/// Container log source: follow-mode byte streams per container
pub trait LogSource: Send + Sync {
    fn open(
        &self,
        pod: &PodIdentity,
        options: &LogOptions,
    ) -> BoxFuture<'static, Result<ByteStream, K8sError>>;
}

/// Log source backed by the Kubernetes pod log subresource
#[derive(Clone)]
pub struct KubeLogSource {
    client: Client,
}

impl KubeLogSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl LogSource for KubeLogSource {
    fn open(
        &self,
        pod: &PodIdentity,
        options: &LogOptions,
    ) -> BoxFuture<'static, Result<ByteStream, K8sError>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);
        let pod_name = pod.pod_name.clone();
        let params = LogParams {
            follow: options.follow,
            container: Some(pod.container_name.clone()).filter(|c| !c.is_empty()),
            previous: options.previous,
            timestamps: options.timestamps,
            tail_lines: options.tail_lines,
            since_time: options.since_time,
            ..Default::default()
        };

        async move {
            let reader = api.log_stream(&pod_name, &params).await?;

            let chunks = stream::unfold(Some(Box::pin(reader)), |state| async move {
                let mut reader = state?;
                let mut buf = vec![0u8; CHUNK_SIZE];
                match reader.read(&mut buf).await {
                    Ok(0) => None,
                    Ok(n) => {
                        buf.truncate(n);
                        Some((Ok(buf), Some(reader)))
                    }
                    // Yield the error once, then end the stream
                    Err(e) => Some((Err(e), None)),
                }
            });

            Ok(chunks.boxed())
        }
        .boxed()
    }
}
