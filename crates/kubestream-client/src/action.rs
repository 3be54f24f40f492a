use kubestream_types::AlarmRule;

/// Everything a user can do to one tab (command pattern)
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TabAction {
    // Lifecycle
    Start,
    TogglePause,
    Stop,
    Remove,

    // Organize
    MoveLeft,
    MoveRight,
    MoveFirst,
    MoveLast,
    MoveTo(usize),
    Rename(String),
    SetDefault,

    // Options (timestamp/previous apply on the next start)
    ToggleBackgroundNotify,
    ToggleTimestamp,
    TogglePrevious,

    // View
    SetFilter(String),
    Search(String),
    SearchNext,
    SearchPrev,

    // Alarms
    AddAlarm(AlarmRule),
    RemoveAlarm(usize),
}
