use std::io::{self, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use crossterm::event::{Event, EventStream, KeyCode, KeyEventKind};
use crossterm::queue;
use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};
use futures::StreamExt;
use tracing::{debug, info};

use kubestream_client::{
    AlarmEffect, AlarmRule, AlarmType, Message, Severity, Surfaced, TabAction, TabSet,
    ViewUpdate, WebSocketOpener,
};
use kubestream_types::DIAGNOSTIC_PREFIX;

use crate::cli::WatchArgs;
use crate::config::Config;

/// Follow one scope and print it until Ctrl-C or the channel ends
pub async fn run(args: WatchArgs, config: Config) -> Result<()> {
    let scope = args.scope()?;
    let server = args.server.clone().unwrap_or(config.client.server.clone());

    let mut options = config.session_options();
    options.timestamp |= args.timestamp;
    options.previous |= args.previous;
    if let Some(max) = args.max_messages {
        options.max_messages = max;
    }

    let opener = Arc::new(WebSocketOpener::new(
        &server,
        config.client.api_key.as_deref(),
    ));
    let (mut tabs, mut events) = TabSet::new(opener, options.clone());
    let id = tabs.add(&args.tab_name(), scope);

    let rules = config.client.alarms.iter().cloned().chain(
        args.alarms
            .iter()
            .map(|expr| AlarmRule::new(expr, AlarmType::Timed)),
    );
    for rule in rules {
        tabs.dispatch(id, TabAction::AddAlarm(rule))?;
    }
    if let Some(filter) = &args.filter {
        tabs.dispatch(id, TabAction::SetFilter(filter.clone()))?;
    }

    let mut presenter = Presenter::new(io::stdout(), io::stderr(), options.timestamp);
    if let Some(view) = tabs.dispatch(id, TabAction::Start)? {
        presenter.view(&view)?;
    }
    info!(%server, "Watching");

    let mut enter = EnterKeys::new();
    let mut expiry = tokio::time::interval(Duration::from_secs(1));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        // Output is held while a blocking alarm waits for Enter
        let blocked = enter.is_open() && tabs.alarm_center().blocking().is_some();

        tokio::select! {
            _ = &mut ctrl_c => {
                if let Some(view) = tabs.dispatch(id, TabAction::Stop)? {
                    presenter.view(&view)?;
                }
                break;
            }

            _ = enter.pressed(), if blocked => {
                tabs.alarm_center_mut().dismiss_blocking();
            }

            message = events.recv(), if !blocked => {
                let Some(message) = message else { break };
                let Some(update) = tabs.handle(message) else { continue };

                if let Some(view) = &update.view {
                    presenter.view(view)?;
                }
                for (effect, surfaced) in &update.alarms {
                    presenter.alarm(effect, surfaced)?;
                }
                if update.stopped {
                    debug!("Channel ended");
                    break;
                }
            }

            _ = expiry.tick() => {
                tabs.alarm_center_mut().expire(Instant::now());
            }
        }
    }

    Ok(())
}

/// Enter presses read from the terminal
///
/// Without a usable terminal the stream closes and blocking alarms no
/// longer hold output.
struct EnterKeys {
    events: Option<EventStream>,
}

impl EnterKeys {
    fn new() -> Self {
        Self {
            events: Some(EventStream::new()),
        }
    }

    fn is_open(&self) -> bool {
        self.events.is_some()
    }

    /// Wait for the next Enter press; returns at once if input has closed
    async fn pressed(&mut self) {
        let Some(events) = self.events.as_mut() else {
            return;
        };
        loop {
            match events.next().await {
                Some(Ok(event)) if is_enter(&event) => return,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "Terminal input unavailable");
                    break;
                }
                None => break,
            }
        }
        self.events = None;
    }
}

fn is_enter(event: &Event) -> bool {
    matches!(
        event,
        Event::Key(key) if key.code == KeyCode::Enter && key.kind == KeyEventKind::Press
    )
}

/// Prints view updates to `out` and alarms to `err`
pub struct Presenter<O: Write, E: Write> {
    out: O,
    err: E,
    timestamps: bool,
    last_printed: Option<u64>,
}

impl<O: Write, E: Write> Presenter<O, E> {
    pub fn new(out: O, err: E, timestamps: bool) -> Self {
        Self {
            out,
            err,
            timestamps,
            last_printed: None,
        }
    }

    /// Lines are printed once; a redraw only prints what is new
    pub fn view(&mut self, update: &ViewUpdate) -> io::Result<()> {
        match update {
            ViewUpdate::Append(message) => self.line(message)?,
            ViewUpdate::Replace(messages) => {
                for message in messages {
                    self.line(message)?;
                }
            }
        }
        self.out.flush()
    }

    fn line(&mut self, message: &Message) -> io::Result<()> {
        if self.last_printed.is_some_and(|last| message.id <= last) {
            return Ok(());
        }
        self.last_printed = Some(message.id);

        if message.is_stop_marker() {
            return queue!(
                self.out,
                SetForegroundColor(Color::DarkGrey),
                Print(&message.text),
                ResetColor,
                Print("\n")
            );
        }

        if let Some(ts) = message.timestamp.filter(|_| self.timestamps) {
            queue!(
                self.out,
                SetForegroundColor(Color::DarkGrey),
                Print(ts.format("%Y-%m-%dT%H:%M:%S%.3fZ ")),
                ResetColor
            )?;
        }
        if !message.is_local() {
            queue!(
                self.out,
                SetForegroundColor(Color::Cyan),
                Print(format!("[{}] ", message.source_label())),
                ResetColor
            )?;
        }

        let color = if message.text.starts_with(DIAGNOSTIC_PREFIX) {
            Color::Red
        } else {
            Color::Reset
        };
        queue!(
            self.out,
            SetForegroundColor(color),
            Print(&message.text),
            ResetColor,
            Print("\n")
        )
    }

    pub fn alarm(&mut self, effect: &AlarmEffect, surfaced: &Surfaced) -> io::Result<()> {
        let suffix = match surfaced {
            Surfaced::Suppressed => return Ok(()),
            Surfaced::Blocking => " (press Enter to continue)",
            Surfaced::Notification(_) => "",
        };

        if effect.audible {
            queue!(self.err, Print('\x07'))?;
        }
        queue!(
            self.err,
            SetForegroundColor(severity_color(effect.severity)),
            Print(format!("[{} alarm on {}] ", kind_label(effect.kind), effect.session)),
            ResetColor,
            Print(&effect.message),
            Print(suffix),
            Print("\n")
        )?;
        self.err.flush()
    }
}

fn severity_color(severity: Severity) -> Color {
    match severity {
        Severity::Default => Color::Magenta,
        Severity::Info => Color::Blue,
        Severity::Success => Color::Green,
        Severity::Warning => Color::Yellow,
        Severity::Error => Color::Red,
    }
}

fn kind_label(kind: AlarmType) -> &'static str {
    match kind {
        AlarmType::Blocking => "blocking",
        AlarmType::Timed => "timed",
        AlarmType::Persistent => "persistent",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubestream_client::{MessageBuffer, STOP_MARKER};

    fn stored(buffer: &mut MessageBuffer, pod: &str, text: &str) -> Message {
        let mut message = Message::local(text);
        if !pod.is_empty() {
            message.namespace = "prod".to_string();
            message.pod = pod.to_string();
            message.container = Some("app".to_string());
        }
        buffer.push(message).clone()
    }

    fn printed(bytes: &[u8]) -> String {
        String::from_utf8_lossy(bytes).to_string()
    }

    #[test]
    fn test_lines_carry_source_prefix() {
        let mut buffer = MessageBuffer::new(10);
        let mut presenter = Presenter::new(Vec::new(), Vec::new(), false);
        let line = stored(&mut buffer, "web-0", "GET / 200");
        presenter.view(&ViewUpdate::Append(line)).unwrap();

        let out = printed(&presenter.out);
        assert!(out.contains("[prod/web-0/app] "));
        assert!(out.contains("GET / 200\n"));
    }

    #[test]
    fn test_redraw_prints_only_new_lines() {
        let mut buffer = MessageBuffer::new(10);
        let mut presenter = Presenter::new(Vec::new(), Vec::new(), false);
        let first = stored(&mut buffer, "web-0", "first");
        presenter.view(&ViewUpdate::Append(first)).unwrap();

        stored(&mut buffer, "", "Error: channel closed: reset");
        stored(&mut buffer, "", STOP_MARKER);
        presenter.view(&ViewUpdate::Replace(buffer.all())).unwrap();

        let out = printed(&presenter.out);
        assert_eq!(out.matches("first").count(), 1);
        assert!(out.contains("Error: channel closed: reset"));
        assert!(out.contains(STOP_MARKER));
    }

    #[test]
    fn test_only_enter_press_dismisses() {
        use crossterm::event::{KeyEvent, KeyEventState, KeyModifiers};

        assert!(is_enter(&Event::Key(KeyEvent::new(KeyCode::Enter, KeyModifiers::NONE))));
        assert!(!is_enter(&Event::Key(KeyEvent::new(KeyCode::Char('q'), KeyModifiers::NONE))));

        let release = KeyEvent {
            code: KeyCode::Enter,
            modifiers: KeyModifiers::NONE,
            kind: KeyEventKind::Release,
            state: KeyEventState::NONE,
        };
        assert!(!is_enter(&Event::Key(release)));
        assert!(!is_enter(&Event::FocusGained));
    }

    #[test]
    fn test_alarms_go_to_err() {
        let mut presenter = Presenter::new(Vec::new(), Vec::new(), false);
        let effect = AlarmEffect {
            kind: AlarmType::Blocking,
            severity: Severity::Error,
            message: "disk full".to_string(),
            expression: "ERROR".to_string(),
            audible: true,
            session: "prod-1".to_string(),
            line: "2024 ERROR disk full".to_string(),
        };

        presenter.alarm(&effect, &Surfaced::Blocking).unwrap();
        let err = printed(&presenter.err);
        assert!(err.starts_with('\x07'));
        assert!(err.contains("[blocking alarm on prod-1] "));
        assert!(err.contains("disk full (press Enter to continue)"));
        assert!(presenter.out.is_empty());

        let before = presenter.err.len();
        presenter.alarm(&effect, &Surfaced::Suppressed).unwrap();
        assert_eq!(presenter.err.len(), before);
    }
}
