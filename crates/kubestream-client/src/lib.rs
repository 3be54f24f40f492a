//! Client side of kubestream
//!
//! This crate holds everything a front end needs besides drawing: log
//! sessions with their state machine and bounded buffers, the channel to
//! the server, filtering and search, alarms and the ordered tab set.

pub mod action;
pub mod alarm;
pub mod buffer;
pub mod connection;
pub mod error;
pub mod message;
pub mod search;
pub mod session;
pub mod tabs;

pub use action::TabAction;
pub use alarm::{AlarmCenter, AlarmEffect, AlarmEngine, Notification, Surfaced, TIMED_NOTIFICATION};
pub use buffer::MessageBuffer;
pub use connection::{
    ChannelEvent, ChannelHandle, ChannelMessage, ChannelOpener, SessionId, WebSocketOpener,
};
pub use error::SessionError;
pub use message::{Message, STOP_MARKER};
pub use search::SearchCursor;
pub use session::{ClientLogSession, Received, SessionOptions, SessionState, ViewUpdate};
pub use tabs::{TabSet, TabUpdate};

// Re-export types used in our public API
pub use kubestream_types::{AlarmRule, AlarmType, Scope, Severity, WatchOptions};
