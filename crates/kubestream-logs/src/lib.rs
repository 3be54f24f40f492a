//! Log pipeline for kubestream
//!
//! This crate turns a scope into merged line events: it resolves and
//! watches the matching pods, tails each container, reassembles chunked
//! output into lines and fans everything into one channel per session.

mod parser;
mod queue;
mod reassembler;
mod resolver;
mod session;
mod tailer;

#[cfg(test)]
mod testing;

pub use parser::split_timestamp;
pub use queue::TailQueue;
pub use reassembler::{ChunkReassembler, LineFlush, Lines};
pub use resolver::{PodSetChange, PodSetResolver, PodSetTracker};
pub use session::{SessionConfig, StreamSession};
pub use tailer::{LogTailer, TailerConfig, TailerExit};

// Re-export types used in our public API
pub use kubestream_types::{LineEvent, PodIdentity, PodKey, Scope, WatchOptions};
