//! Background continuity: keeps pulling data from the watch while the phone
//! app is backgrounded and the OS may suspend it.
//!
//! Two mechanisms run while monitoring: a short repeating timer and an OS
//! periodic background task as a fallback for when the timer itself is
//! suspended. Both only produce `Pull`s; the controller turns a pull into a
//! reachability check plus a `syncData` request.

use std::time::Duration;

/// Default cadence of the background sync timer.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(1);

/// Shortest interval the OS honours for periodic background tasks.
pub const MIN_BACKGROUND_FETCH_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Identifier the OS scheduler hands to a periodic background task.
pub type TaskId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Foreground,
    Background,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContinuityAction {
    StartTimer(Duration),
    StopTimer,
    RegisterPeriodic(Duration),
    UnregisterPeriodic,
    /// Check reachability and pull the latest sample once.
    Pull,
    /// Tell the OS the periodic task finished.
    CompletePeriodic(TaskId),
}

pub struct ContinuityManager {
    active: bool,
    timer_running: bool,
    periodic_registered: bool,
    app_state: AppState,
    sync_interval: Duration,
    fetch_interval: Duration,
}

impl ContinuityManager {
    pub fn new(sync_interval: Duration, fetch_interval: Duration) -> Self {
        Self {
            active: false,
            timer_running: false,
            periodic_registered: false,
            app_state: AppState::Foreground,
            sync_interval,
            fetch_interval: fetch_interval.max(MIN_BACKGROUND_FETCH_INTERVAL),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn app_state(&self) -> AppState {
        self.app_state
    }

    pub fn is_timer_running(&self) -> bool {
        self.timer_running
    }

    pub fn is_periodic_registered(&self) -> bool {
        self.periodic_registered
    }

    /// Called when monitoring starts. Idempotent.
    pub fn start(&mut self) -> Vec<ContinuityAction> {
        self.active = true;
        let mut actions = Vec::new();
        if !self.timer_running {
            self.timer_running = true;
            actions.push(ContinuityAction::StartTimer(self.sync_interval));
        }
        if !self.periodic_registered {
            self.periodic_registered = true;
            actions.push(ContinuityAction::RegisterPeriodic(self.fetch_interval));
        }
        if !actions.is_empty() {
            log::info!("background continuity started");
        }
        actions
    }

    /// Called when monitoring stops or the controller goes away. Idempotent and
    /// safe when never started.
    pub fn stop(&mut self) -> Vec<ContinuityAction> {
        self.active = false;
        let mut actions = Vec::new();
        if self.timer_running {
            self.timer_running = false;
            actions.push(ContinuityAction::StopTimer);
        }
        if self.periodic_registered {
            self.periodic_registered = false;
            actions.push(ContinuityAction::UnregisterPeriodic);
        }
        if !actions.is_empty() {
            log::info!("background continuity stopped");
        }
        actions
    }

    /// Timer tick. Pulls only while backgrounded; the foreground app gets pushes.
    pub fn on_timer_tick(&mut self) -> Vec<ContinuityAction> {
        if self.active && self.timer_running && self.app_state == AppState::Background {
            vec![ContinuityAction::Pull]
        } else {
            vec![]
        }
    }

    /// OS periodic task fired. Always completes the task, pulling first when active.
    pub fn on_periodic_task(&mut self, task_id: TaskId) -> Vec<ContinuityAction> {
        log::info!("background fetch task {}", task_id);
        let mut actions = Vec::new();
        if self.active {
            actions.push(ContinuityAction::Pull);
        }
        actions.push(ContinuityAction::CompletePeriodic(task_id));
        actions
    }

    /// App lifecycle change. Returning to the foreground while active pulls
    /// immediately to close the gap left by suspension.
    pub fn on_app_state(&mut self, state: AppState) -> Vec<ContinuityAction> {
        let previous = self.app_state;
        self.app_state = state;
        match (previous, state) {
            (AppState::Background, AppState::Foreground) if self.active => {
                log::info!("app returned to foreground; resyncing");
                vec![ContinuityAction::Pull]
            }
            (AppState::Foreground, AppState::Background) if self.active => {
                log::info!("app moved to background; keeping watch link alive");
                vec![]
            }
            _ => vec![],
        }
    }
}

impl Default for ContinuityManager {
    fn default() -> Self {
        Self::new(DEFAULT_SYNC_INTERVAL, MIN_BACKGROUND_FETCH_INTERVAL)
    }
}
