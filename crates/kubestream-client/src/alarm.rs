//! Alarm evaluation and the notification center that surfaces alarm effects

use std::time::{Duration, Instant};

use tracing::debug;

use kubestream_types::{AlarmRule, AlarmType, Severity};

/// How long a timed notification stays up
pub const TIMED_NOTIFICATION: Duration = Duration::from_secs(3);

/// One rule firing on one line
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AlarmEffect {
    pub kind: AlarmType,
    pub severity: Severity,
    /// Rendered rule message
    pub message: String,
    pub expression: String,
    /// Play an audible cue
    pub audible: bool,
    /// Name of the session the line arrived on
    pub session: String,
    /// The matching line, unchanged
    pub line: String,
}

/// Stateless substring matcher over a session's rules
pub struct AlarmEngine;

impl AlarmEngine {
    /// Every rule whose expression occurs in the text, in rule order
    pub fn evaluate(rules: &[AlarmRule], text: &str, session: &str) -> Vec<AlarmEffect> {
        rules
            .iter()
            .filter(|rule| rule.matches(text))
            .map(|rule| AlarmEffect {
                kind: rule.kind,
                severity: rule.severity,
                message: rule.render_message(text),
                expression: rule.expression.clone(),
                audible: rule.audible,
                session: session.to_string(),
                line: text.to_string(),
            })
            .collect()
    }
}

/// A non-blocking notification on display
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub id: u64,
    pub effect: AlarmEffect,
    /// When a timed notification goes away by itself
    pub expires_at: Option<Instant>,
}

/// What surfacing an effect did
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Surfaced {
    /// Became the blocking modal
    Blocking,
    /// Another blocking alarm is already up; this one was not shown
    Suppressed,
    /// Shown as a notification with this id
    Notification(u64),
}

/// Holds at most one blocking alarm and any number of notifications
#[derive(Debug, Default)]
pub struct AlarmCenter {
    blocking: Option<AlarmEffect>,
    notifications: Vec<Notification>,
    next_id: u64,
}

impl AlarmCenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn surface(&mut self, effect: AlarmEffect) -> Surfaced {
        self.surface_at(effect, Instant::now())
    }

    pub fn surface_at(&mut self, effect: AlarmEffect, now: Instant) -> Surfaced {
        match effect.kind {
            AlarmType::Blocking => {
                if self.blocking.is_some() {
                    debug!(expression = %effect.expression, "Blocking alarm already shown");
                    return Surfaced::Suppressed;
                }
                self.blocking = Some(effect);
                Surfaced::Blocking
            }
            AlarmType::Timed | AlarmType::Persistent => {
                let id = self.next_id;
                self.next_id += 1;
                let expires_at = match effect.kind {
                    AlarmType::Timed => Some(now + TIMED_NOTIFICATION),
                    _ => None,
                };
                self.notifications.push(Notification {
                    id,
                    effect,
                    expires_at,
                });
                Surfaced::Notification(id)
            }
        }
    }

    /// The blocking alarm awaiting dismissal, if any
    pub fn blocking(&self) -> Option<&AlarmEffect> {
        self.blocking.as_ref()
    }

    pub fn dismiss_blocking(&mut self) -> Option<AlarmEffect> {
        self.blocking.take()
    }

    pub fn notifications(&self) -> &[Notification] {
        &self.notifications
    }

    pub fn dismiss(&mut self, id: u64) -> Option<Notification> {
        let index = self.notifications.iter().position(|n| n.id == id)?;
        Some(self.notifications.remove(index))
    }

    /// Dismiss a notification and return the session it points at
    pub fn view(&mut self, id: u64) -> Option<String> {
        self.dismiss(id).map(|n| n.effect.session)
    }

    /// Drop timed notifications whose display time is over
    pub fn expire(&mut self, now: Instant) -> usize {
        let before = self.notifications.len();
        self.notifications
            .retain(|n| n.expires_at.is_none_or(|at| at > now));
        before - self.notifications.len()
    }

    /// Forget everything raised by a session that is going away
    pub fn forget_session(&mut self, session: &str) {
        self.notifications.retain(|n| n.effect.session != session);
        if self.blocking.as_ref().is_some_and(|b| b.session == session) {
            self.blocking = None;
        }
    }

    /// Follow a session rename so "view" still finds it
    pub fn rename_session(&mut self, from: &str, to: &str) {
        for n in &mut self.notifications {
            if n.effect.session == from {
                n.effect.session = to.to_string();
            }
        }
        if let Some(b) = self.blocking.as_mut().filter(|b| b.session == from) {
            b.session = to.to_string();
        }
    }
}
