use std::fmt;

use tokio::sync::mpsc;
use tracing::debug;

use kubestream_types::{
    AlarmRule, DEFAULT_MAX_MESSAGES, Scope, WatchOptions, WatchRequest, diagnostic_text,
};

use crate::alarm::{AlarmEffect, AlarmEngine};
use crate::buffer::MessageBuffer;
use crate::connection::{ChannelEvent, ChannelHandle, ChannelMessage, ChannelOpener, SessionId};
use crate::error::SessionError;
use crate::message::{Message, STOP_MARKER};
use crate::search::SearchCursor;

/// Lifecycle of a client session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Started,
    Paused,
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Started => "started",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// What the presentation layer should show after a change
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ViewUpdate {
    /// Add one line at the end and scroll to it
    Append(Message),
    /// Redraw from this full list of visible lines
    Replace(Vec<Message>),
}

/// Result of feeding a channel event to a session
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Received {
    pub view: Option<ViewUpdate>,
    pub alarms: Vec<AlarmEffect>,
    /// The event ended the session
    pub stopped: bool,
}

/// Settings a new session starts with
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionOptions {
    pub max_messages: usize,
    pub timestamp: bool,
    pub previous: bool,
    pub background_notify: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_messages: DEFAULT_MAX_MESSAGES,
            timestamp: false,
            previous: false,
            background_notify: true,
        }
    }
}

/// One tab: a scope, its buffered lines, filter, search and alarms
pub struct ClientLogSession {
    id: SessionId,
    name: String,
    scope: Scope,
    cluster: Option<String>,
    buffer: MessageBuffer,
    filter: String,
    search: SearchCursor,
    alarms: Vec<AlarmRule>,
    state: SessionState,
    pending: bool,
    default_tab: bool,
    background_notify: bool,
    timestamp: bool,
    previous: bool,
    /// Bumped on every start; events from older channels are ignored
    generation: u64,
    channel: Option<ChannelHandle>,
}

impl ClientLogSession {
    pub fn new(id: SessionId, name: &str, scope: Scope, options: &SessionOptions) -> Self {
        Self {
            id,
            name: name.to_string(),
            scope,
            cluster: None,
            buffer: MessageBuffer::new(options.max_messages),
            filter: String::new(),
            search: SearchCursor::default(),
            alarms: Vec::new(),
            state: SessionState::Idle,
            pending: false,
            default_tab: false,
            background_notify: options.background_notify,
            timestamp: options.timestamp,
            previous: options.previous,
            generation: 0,
            channel: None,
        }
    }

    pub fn with_cluster(mut self, cluster: &str) -> Self {
        self.cluster = Some(cluster.to_string());
        self
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn cluster(&self) -> Option<&str> {
        self.cluster.as_deref()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn is_default(&self) -> bool {
        self.default_tab
    }

    pub fn background_notify(&self) -> bool {
        self.background_notify
    }

    pub fn timestamp(&self) -> bool {
        self.timestamp
    }

    pub fn previous(&self) -> bool {
        self.previous
    }

    pub fn buffer(&self) -> &MessageBuffer {
        &self.buffer
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    pub fn search(&self) -> &SearchCursor {
        &self.search
    }

    pub fn alarms(&self) -> &[AlarmRule] {
        &self.alarms
    }

    /// Open a channel (Idle or Stopped only); a restart clears the buffer first
    pub fn start(
        &mut self,
        opener: &dyn ChannelOpener,
        events: &mpsc::UnboundedSender<ChannelMessage>,
    ) -> Result<ViewUpdate, SessionError> {
        match self.state {
            SessionState::Idle => {}
            SessionState::Stopped => {
                self.buffer.clear();
                let term = self.search.term().to_string();
                self.search.set(&term, &self.buffer);
            }
            state => {
                return Err(SessionError::InvalidTransition {
                    state,
                    action: "start",
                });
            }
        }

        self.generation += 1;
        let options = WatchOptions {
            timestamp: self.timestamp,
            previous: self.previous,
            max_messages: self.buffer.capacity(),
        };
        let request = WatchRequest::new(&self.scope, options);
        debug!(session = %self.id, name = %self.name, generation = self.generation, "Starting session");
        self.channel = Some(opener.open(request, self.id, self.generation, events.clone()));
        self.state = SessionState::Started;

        Ok(ViewUpdate::Replace(self.visible()))
    }

    pub fn pause(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Started {
            return Err(SessionError::InvalidTransition {
                state: self.state,
                action: "pause",
            });
        }
        self.state = SessionState::Paused;
        Ok(())
    }

    /// Back to Started; the view catches up with everything buffered meanwhile
    pub fn resume(&mut self) -> Result<ViewUpdate, SessionError> {
        if self.state != SessionState::Paused {
            return Err(SessionError::InvalidTransition {
                state: self.state,
                action: "resume",
            });
        }
        self.state = SessionState::Started;
        Ok(ViewUpdate::Replace(self.visible()))
    }

    /// Close the channel and append the stop marker; a no-op unless running
    pub fn stop(&mut self) -> Option<ViewUpdate> {
        if !matches!(self.state, SessionState::Started | SessionState::Paused) {
            return None;
        }
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
        self.state = SessionState::Stopped;
        debug!(session = %self.id, name = %self.name, "Session stopped");

        let marker = self.buffer.push(Message::local(STOP_MARKER)).clone();
        Some(ViewUpdate::Append(marker))
    }

    /// Apply one channel event; `focused` says whether this tab is on screen
    pub fn receive(&mut self, generation: u64, event: ChannelEvent, focused: bool) -> Received {
        if generation != self.generation {
            debug!(session = %self.id, generation, current = self.generation, "Discarding event from old channel");
            return Received::default();
        }

        match event {
            ChannelEvent::Line(line) => match self.state {
                SessionState::Started => self.accept(Message::from_wire(line), focused),
                SessionState::Paused => {
                    self.store(Message::from_wire(line));
                    Received::default()
                }
                SessionState::Idle | SessionState::Stopped => Received::default(),
            },
            ChannelEvent::Closed(reason) => {
                if !matches!(self.state, SessionState::Started | SessionState::Paused) {
                    return Received::default();
                }
                if let Some(reason) = reason {
                    let text = diagnostic_text(format!("channel closed: {}", reason));
                    self.store(Message::local(&text));
                }
                self.stop();
                Received {
                    view: focused.then(|| ViewUpdate::Replace(self.visible())),
                    alarms: Vec::new(),
                    stopped: true,
                }
            }
        }
    }

    fn store(&mut self, message: Message) -> Message {
        let stored = self.buffer.push(message).clone();
        self.search.observe(&stored, &self.buffer);
        stored
    }

    fn accept(&mut self, message: Message, focused: bool) -> Received {
        let stored = self.store(message);

        let mut received = Received::default();
        if focused {
            if self.passes_filter(&stored) {
                received.view = Some(ViewUpdate::Append(stored.clone()));
            }
        } else if self.background_notify {
            self.pending = true;
        }

        received.alarms = AlarmEngine::evaluate(&self.alarms, &stored.text, &self.name);
        received
    }

    /// Became the focused tab: clear the highlight and redraw
    pub fn focus(&mut self) -> ViewUpdate {
        self.pending = false;
        ViewUpdate::Replace(self.visible())
    }

    /// Buffered lines passing the filter
    pub fn visible(&self) -> Vec<Message> {
        self.buffer.filtered(&self.filter)
    }

    fn passes_filter(&self, message: &Message) -> bool {
        self.filter.is_empty() || message.text.contains(&self.filter)
    }

    pub fn set_filter(&mut self, filter: &str) -> ViewUpdate {
        self.filter = filter.to_string();
        ViewUpdate::Replace(self.visible())
    }

    /// Start a search; returns the id of the first match
    pub fn set_search(&mut self, term: &str) -> Option<u64> {
        self.search.set(term, &self.buffer);
        self.search.current()
    }

    pub fn search_next(&mut self) -> Option<u64> {
        self.search.next(&self.buffer)
    }

    pub fn search_prev(&mut self) -> Option<u64> {
        self.search.prev(&self.buffer)
    }

    pub fn set_background_notify(&mut self, enabled: bool) {
        self.background_notify = enabled;
        if !enabled {
            self.pending = false;
        }
    }

    /// Takes effect on the next start
    pub fn set_timestamp(&mut self, enabled: bool) {
        self.timestamp = enabled;
    }

    /// Takes effect on the next start
    pub fn set_previous(&mut self, enabled: bool) {
        self.previous = enabled;
    }

    pub(crate) fn set_default(&mut self, default_tab: bool) {
        self.default_tab = default_tab;
    }

    pub fn add_alarm(&mut self, rule: AlarmRule) {
        self.alarms.push(rule);
    }

    pub fn remove_alarm(&mut self, index: usize) -> Option<AlarmRule> {
        (index < self.alarms.len()).then(|| self.alarms.remove(index))
    }

    /// Buffered lines as newline-joined text
    pub fn export(&self) -> String {
        self.buffer.export_raw()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    use kubestream_types::{AlarmType, WireLineEvent};
    use tokio_util::sync::CancellationToken;

    /// Records opened channels instead of connecting anywhere
    #[derive(Default)]
    pub(crate) struct RecordingOpener {
        pub(crate) opened: Mutex<Vec<(WatchRequest, SessionId, u64, CancellationToken)>>,
    }

    impl RecordingOpener {
        pub(crate) fn count(&self) -> usize {
            self.opened.lock().unwrap().len()
        }

        pub(crate) fn is_closed(&self, index: usize) -> bool {
            self.opened.lock().unwrap()[index].3.is_cancelled()
        }
    }

    impl ChannelOpener for RecordingOpener {
        fn open(
            &self,
            request: WatchRequest,
            session: SessionId,
            generation: u64,
            _events: mpsc::UnboundedSender<ChannelMessage>,
        ) -> ChannelHandle {
            let cancel = CancellationToken::new();
            self.opened
                .lock()
                .unwrap()
                .push((request, session, generation, cancel.clone()));
            ChannelHandle::new(cancel)
        }
    }

    pub(crate) fn line(text: &str) -> ChannelEvent {
        ChannelEvent::Line(WireLineEvent {
            namespace: "prod".to_string(),
            pod_name: "web-0".to_string(),
            container_name: Some("app".to_string()),
            text: text.to_string(),
            timestamp: None,
        })
    }

    fn session(max_messages: usize) -> ClientLogSession {
        let options = SessionOptions {
            max_messages,
            ..SessionOptions::default()
        };
        let scope = Scope::Namespace {
            namespace: "prod".to_string(),
        };
        ClientLogSession::new(SessionId(1), "prod-1", scope, &options)
    }

    fn started(max_messages: usize) -> (ClientLogSession, RecordingOpener) {
        let opener = RecordingOpener::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut s = session(max_messages);
        s.start(&opener, &tx).unwrap();
        (s, opener)
    }

    #[test]
    fn test_start_sends_request() {
        let (s, opener) = started(250);
        assert_eq!(s.state(), SessionState::Started);
        assert_eq!(s.cluster(), None);
        assert_eq!(session(1).with_cluster("eu-west").cluster(), Some("eu-west"));
        let opened = opener.opened.lock().unwrap();
        assert_eq!(opened[0].0.max_messages, 250);
        assert_eq!(opened[0].0.namespace, "prod");
        assert_eq!(opened[0].2, 1);
    }

    #[test]
    fn test_buffer_bound() {
        let (mut s, _opener) = started(3);
        for i in 0..5 {
            s.receive(1, line(&format!("l{}", i)), true);
        }
        let texts: Vec<String> = s.visible().into_iter().map(|m| m.text).collect();
        assert_eq!(texts, vec!["l2", "l3", "l4"]);
    }

    #[test]
    fn test_pause_accumulates_without_presenting_or_alarming() {
        let (mut s, _opener) = started(100);
        s.add_alarm(AlarmRule::new("ERROR", AlarmType::Blocking));
        s.pause().unwrap();

        let received = s.receive(1, line("ERROR while paused"), true);
        assert_eq!(received, Received::default());
        assert_eq!(s.buffer().len(), 1);

        let ViewUpdate::Replace(view) = s.resume().unwrap() else {
            panic!("resume should redraw");
        };
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].text, "ERROR while paused");

        let received = s.receive(1, line("ERROR after resume"), true);
        assert_eq!(received.alarms.len(), 1);
    }

    #[test]
    fn test_focused_appends_background_marks_pending() {
        let (mut s, _opener) = started(100);
        let received = s.receive(1, line("hello"), true);
        assert!(matches!(received.view, Some(ViewUpdate::Append(ref m)) if m.text == "hello"));
        assert!(!s.is_pending());

        let received = s.receive(1, line("again"), false);
        assert!(received.view.is_none());
        assert!(s.is_pending());

        s.focus();
        assert!(!s.is_pending());

        s.set_background_notify(false);
        s.receive(1, line("quiet"), false);
        assert!(!s.is_pending());
    }

    #[test]
    fn test_filter_applies_to_view() {
        let (mut s, _opener) = started(100);
        s.set_filter("500");
        assert!(s.receive(1, line("GET / 200"), true).view.is_none());
        assert!(s.receive(1, line("GET / 500"), true).view.is_some());
        assert_eq!(s.visible().len(), 1);
        assert_eq!(s.buffer().len(), 2);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (mut s, opener) = started(100);
        assert!(s.stop().is_some());
        assert!(opener.is_closed(0));
        assert_eq!(s.state(), SessionState::Stopped);
        assert!(s.stop().is_none());

        let markers = s.buffer().iter().filter(|m| m.is_stop_marker()).count();
        assert_eq!(markers, 1);
    }

    #[test]
    fn test_restart_clears_buffer_and_ignores_old_channel() {
        let (mut s, opener) = started(100);
        let (tx, _rx) = mpsc::unbounded_channel();
        s.receive(1, line("first run"), true);
        s.stop();

        s.start(&opener, &tx).unwrap();
        assert!(s.buffer().is_empty());
        assert_eq!(s.generation(), 2);
        assert_eq!(opener.count(), 2);

        assert_eq!(s.receive(1, line("stale"), true), Received::default());
        assert!(s.buffer().is_empty());
        s.receive(2, line("fresh"), true);
        assert_eq!(s.export(), "fresh");
    }

    #[test]
    fn test_invalid_transitions() {
        let mut s = session(10);
        assert_eq!(
            s.pause(),
            Err(SessionError::InvalidTransition {
                state: SessionState::Idle,
                action: "pause"
            })
        );
        assert!(s.resume().is_err());
        assert!(s.stop().is_none());

        let (mut s, opener) = started(10);
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(s.start(&opener, &tx).is_err());
    }

    #[test]
    fn test_transport_close_stops_with_diagnostic() {
        let (mut s, opener) = started(10);
        let received = s.receive(1, ChannelEvent::Closed(Some("reset by peer".to_string())), true);
        assert!(received.stopped);
        assert_eq!(s.state(), SessionState::Stopped);
        assert!(opener.is_closed(0));

        let texts: Vec<String> = s.buffer().iter().map(|m| m.text.clone()).collect();
        assert_eq!(texts[0], "Error: channel closed: reset by peer");
        assert_eq!(texts[1], STOP_MARKER);

        // Already stopped: a second close changes nothing
        assert_eq!(s.receive(1, ChannelEvent::Closed(None), true), Received::default());
    }

    #[test]
    fn test_search_through_session() {
        let (mut s, _opener) = started(10);
        s.receive(1, line("a ERROR"), true);
        s.receive(1, line("b"), true);
        assert_eq!(s.set_search("ERROR"), Some(0));
        s.receive(1, line("c ERROR"), true);
        assert!(s.search().can_search_next());
        assert_eq!(s.search_next(), Some(2));
        assert_eq!(s.search_prev(), Some(0));
    }
}
