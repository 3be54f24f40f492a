use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use kubestream_types::Scope;

use crate::action::TabAction;
use crate::alarm::{AlarmCenter, AlarmEffect, Surfaced};
use crate::connection::{ChannelMessage, ChannelOpener, SessionId};
use crate::error::SessionError;
use crate::session::{ClientLogSession, SessionOptions, SessionState, ViewUpdate};

/// Outcome of routing one channel message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TabUpdate {
    pub session: SessionId,
    /// Only set for the focused tab
    pub view: Option<ViewUpdate>,
    /// Alarm effects of the line and how each was surfaced
    pub alarms: Vec<(AlarmEffect, Surfaced)>,
    pub stopped: bool,
}

/// Ordered tabs owned by one controller
///
/// All reordering and removal goes through this type; the focused tab is
/// tracked by id and passed explicitly to actions.
pub struct TabSet {
    tabs: Vec<ClientLogSession>,
    focused: Option<SessionId>,
    next_id: u64,
    opener: Arc<dyn ChannelOpener>,
    events: mpsc::UnboundedSender<ChannelMessage>,
    alarms: AlarmCenter,
    defaults: SessionOptions,
}

impl TabSet {
    /// New empty tab set; channel events for every tab arrive on the receiver
    pub fn new(
        opener: Arc<dyn ChannelOpener>,
        defaults: SessionOptions,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelMessage>) {
        let (events, rx) = mpsc::unbounded_channel();
        let tabs = Self {
            tabs: Vec::new(),
            focused: None,
            next_id: 1,
            opener,
            events,
            alarms: AlarmCenter::new(),
            defaults,
        };
        (tabs, rx)
    }

    /// `<base>-1`, `<base>-2`, ... first one not taken
    pub fn unique_name(&self, base: &str) -> String {
        (1..)
            .map(|i| format!("{}-{}", base, i))
            .find(|name| self.position_by_name(name).is_none())
            .unwrap_or_else(|| base.to_string())
    }

    /// Add an idle tab for a scope and focus it
    pub fn add(&mut self, base: &str, scope: Scope) -> SessionId {
        let id = SessionId(self.next_id);
        self.next_id += 1;
        let name = self.unique_name(base);
        debug!(session = %id, name = %name, scope = %scope, "Adding tab");

        self.tabs
            .push(ClientLogSession::new(id, &name, scope, &self.defaults));
        self.focused = Some(id);
        id
    }

    pub fn len(&self) -> usize {
        self.tabs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tabs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientLogSession> {
        self.tabs.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tabs.iter().map(|t| t.name()).collect()
    }

    pub fn get(&self, id: SessionId) -> Option<&ClientLogSession> {
        self.tabs.iter().find(|t| t.id() == id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut ClientLogSession> {
        self.tabs.iter_mut().find(|t| t.id() == id)
    }

    pub fn by_name(&self, name: &str) -> Option<&ClientLogSession> {
        self.position_by_name(name).map(|i| &self.tabs[i])
    }

    pub fn focused(&self) -> Option<SessionId> {
        self.focused
    }

    pub fn alarm_center(&self) -> &AlarmCenter {
        &self.alarms
    }

    pub fn alarm_center_mut(&mut self) -> &mut AlarmCenter {
        &mut self.alarms
    }

    /// Switch focus; the tab's highlight is cleared and its view redrawn
    pub fn focus(&mut self, id: SessionId) -> Result<ViewUpdate, SessionError> {
        let tab = self
            .get_mut(id)
            .ok_or_else(|| SessionError::UnknownTab(id.to_string()))?;
        let view = tab.focus();
        self.focused = Some(id);
        Ok(view)
    }

    /// Act on a notification's "view": dismiss it and focus its tab
    pub fn view_notification(&mut self, notification: u64) -> Option<ViewUpdate> {
        let name = self.alarms.view(notification)?;
        let id = self.by_name(&name)?.id();
        self.focus(id).ok()
    }

    /// Route one channel message to its tab
    pub fn handle(&mut self, message: ChannelMessage) -> Option<TabUpdate> {
        let focused = self.focused == Some(message.session);
        let Some(tab) = self.get_mut(message.session) else {
            debug!(session = %message.session, "Event for a removed tab");
            return None;
        };

        let received = tab.receive(message.generation, message.event, focused);
        let alarms = received
            .alarms
            .into_iter()
            .map(|effect| {
                let surfaced = self.alarms.surface(effect.clone());
                (effect, surfaced)
            })
            .collect();

        Some(TabUpdate {
            session: message.session,
            view: received.view,
            alarms,
            stopped: received.stopped,
        })
    }

    /// Apply an action to a tab; returns a view update when the focused view changed
    pub fn dispatch(
        &mut self,
        id: SessionId,
        action: TabAction,
    ) -> Result<Option<ViewUpdate>, SessionError> {
        let index = self
            .position(id)
            .ok_or_else(|| SessionError::UnknownTab(id.to_string()))?;
        let focused = self.focused == Some(id);

        let view = match action {
            TabAction::Start => {
                let opener = self.opener.clone();
                Some(self.tabs[index].start(opener.as_ref(), &self.events)?)
            }
            TabAction::TogglePause => {
                let tab = &mut self.tabs[index];
                if tab.state() == SessionState::Paused {
                    Some(tab.resume()?)
                } else {
                    tab.pause()?;
                    None
                }
            }
            TabAction::Stop => self.tabs[index].stop(),
            TabAction::Remove => return Ok(self.remove(id)),
            TabAction::MoveLeft => {
                if index > 0 {
                    self.tabs.swap(index, index - 1);
                }
                None
            }
            TabAction::MoveRight => {
                if index + 1 < self.tabs.len() {
                    self.tabs.swap(index, index + 1);
                }
                None
            }
            TabAction::MoveFirst => {
                self.move_to(index, 0);
                None
            }
            TabAction::MoveLast => {
                self.move_to(index, self.tabs.len() - 1);
                None
            }
            TabAction::MoveTo(target) => {
                self.move_to(index, target.min(self.tabs.len() - 1));
                None
            }
            TabAction::Rename(name) => {
                self.rename(index, &name)?;
                None
            }
            TabAction::SetDefault => {
                for (i, tab) in self.tabs.iter_mut().enumerate() {
                    tab.set_default(i == index);
                }
                None
            }
            TabAction::ToggleBackgroundNotify => {
                let tab = &mut self.tabs[index];
                tab.set_background_notify(!tab.background_notify());
                None
            }
            TabAction::ToggleTimestamp => {
                let tab = &mut self.tabs[index];
                tab.set_timestamp(!tab.timestamp());
                None
            }
            TabAction::TogglePrevious => {
                let tab = &mut self.tabs[index];
                tab.set_previous(!tab.previous());
                None
            }
            TabAction::SetFilter(filter) => Some(self.tabs[index].set_filter(&filter)),
            TabAction::Search(term) => {
                self.tabs[index].set_search(&term);
                None
            }
            TabAction::SearchNext => {
                self.tabs[index].search_next();
                None
            }
            TabAction::SearchPrev => {
                self.tabs[index].search_prev();
                None
            }
            TabAction::AddAlarm(rule) => {
                self.tabs[index].add_alarm(rule);
                None
            }
            TabAction::RemoveAlarm(i) => {
                self.tabs[index].remove_alarm(i);
                None
            }
        };

        Ok(view.filter(|_| focused))
    }

    /// Stop and drop every tab
    pub fn clear(&mut self) {
        for tab in &mut self.tabs {
            tab.stop();
        }
        self.tabs.clear();
        self.focused = None;
        self.alarms = AlarmCenter::new();
    }

    fn remove(&mut self, id: SessionId) -> Option<ViewUpdate> {
        let index = self.position(id)?;
        let mut tab = self.tabs.remove(index);
        tab.stop();
        self.alarms.forget_session(tab.name());
        debug!(session = %id, name = %tab.name(), "Removed tab");

        if self.focused != Some(id) {
            return None;
        }
        match self.tabs.first().map(|t| t.id()) {
            Some(first) => self.focus(first).ok(),
            None => {
                self.focused = None;
                Some(ViewUpdate::Replace(Vec::new()))
            }
        }
    }

    fn rename(&mut self, index: usize, name: &str) -> Result<(), SessionError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SessionError::EmptyName);
        }
        if let Some(existing) = self.position_by_name(name) {
            if existing == index {
                return Ok(());
            }
            return Err(SessionError::DuplicateName(name.to_string()));
        }

        let old = self.tabs[index].name().to_string();
        self.tabs[index].set_name(name);
        self.alarms.rename_session(&old, name);
        Ok(())
    }

    fn move_to(&mut self, from: usize, to: usize) {
        let tab = self.tabs.remove(from);
        self.tabs.insert(to, tab);
    }

    fn position(&self, id: SessionId) -> Option<usize> {
        self.tabs.iter().position(|t| t.id() == id)
    }

    fn position_by_name(&self, name: &str) -> Option<usize> {
        self.tabs.iter().position(|t| t.name() == name)
    }
}

impl Drop for TabSet {
    fn drop(&mut self) {
        self.clear();
    }
}
