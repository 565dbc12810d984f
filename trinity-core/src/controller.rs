//! Phone side: issues commands to the watch, mirrors its monitoring state,
//! buffers samples and produces session statistics.
//!
//! The watch is authoritative for whether monitoring is running. The phone
//! keeps its own `is_monitoring` flag for user intent and reconciles with one
//! rule: a `monitoringState` pushed by the watch that differs from the local
//! flag wins, and triggers the same side effects as a local transition.

use std::collections::HashMap;
use std::time::Duration;

use crate::continuity::{AppState, ContinuityAction, ContinuityManager, TaskId};
use crate::continuity::{DEFAULT_SYNC_INTERVAL, MIN_BACKGROUND_FETCH_INTERVAL};
use crate::protocol::{Command, Envelope, Payload, RequestId, STATUS_CONNECTED};
use crate::sample::{RecentSampleWindow, Sample, SessionStatistics, DEFAULT_RECENT_WINDOW};

/// Default deadline for an unanswered start/stop command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub recent_window: usize,
    pub sync_interval: Duration,
    pub background_fetch_interval: Duration,
    /// `None` waits for a reply forever.
    pub command_timeout: Option<Duration>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            recent_window: DEFAULT_RECENT_WINDOW,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            background_fetch_interval: MIN_BACKGROUND_FETCH_INTERVAL,
            command_timeout: Some(DEFAULT_COMMAND_TIMEOUT),
        }
    }
}

/// Reachability of the watch as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchConnectionStatus {
    Connected,
    Disconnected,
}

/// Monitoring state as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhoneSessionState {
    /// Watch unreachable and no session believed to be running.
    Unknown,
    Idle,
    /// Possibly stale while the watch is unreachable.
    Active,
}

/// User-facing failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    #[error("Watch is not connected.")]
    WatchNotConnected,
    #[error("Watch failed to start monitoring.")]
    StartRejected,
    #[error("Watch failed to stop monitoring.")]
    StopRejected,
    #[error("Failed to send {command} command to Watch: {reason}")]
    SendFailed { command: Command, reason: String },
    #[error("Watch did not answer {0} in time.")]
    TimedOut(Command),
}

/// Action for the phone host to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum PhoneAction {
    /// Send a command request; report the reply with `on_reply` or the failure with `on_send_error`.
    Send { id: RequestId, command: Command },
    /// Blocking alert for the user.
    Alert(ControlError),
    /// A session ended; statistics are `None` when no sample was accepted.
    SessionFinished(Option<SessionStatistics>),
    StartSyncTimer(Duration),
    StopSyncTimer,
    RegisterBackgroundFetch(Duration),
    UnregisterBackgroundFetch,
    FinishBackgroundFetch(TaskId),
}

struct PendingCommand {
    command: Command,
    sent_at: u64,
    /// Session generation the command was sent in.
    session: u64,
}

pub struct SessionController {
    config: ControllerConfig,
    connection: WatchConnectionStatus,
    is_monitoring: bool,
    started_at: Option<u64>,
    history: Vec<Sample>,
    recent: RecentSampleWindow,
    statistics: Option<SessionStatistics>,
    heart_rate: Option<f64>,
    steps: u64,
    calories: f64,
    pending: HashMap<RequestId, PendingCommand>,
    /// Bumped whenever a session begins or finishes.
    session: u64,
    continuity: ContinuityManager,
}

impl SessionController {
    pub fn new(config: ControllerConfig) -> Self {
        let continuity =
            ContinuityManager::new(config.sync_interval, config.background_fetch_interval);
        Self {
            recent: RecentSampleWindow::new(config.recent_window),
            config,
            connection: WatchConnectionStatus::Disconnected,
            is_monitoring: false,
            started_at: None,
            history: Vec::new(),
            statistics: None,
            heart_rate: None,
            steps: 0,
            calories: 0.0,
            pending: HashMap::new(),
            session: 0,
            continuity,
        }
    }

    pub fn connection(&self) -> WatchConnectionStatus {
        self.connection
    }

    pub fn is_monitoring(&self) -> bool {
        self.is_monitoring
    }

    pub fn started_at(&self) -> Option<u64> {
        self.started_at
    }

    pub fn session_state(&self) -> PhoneSessionState {
        match (self.is_monitoring, self.connection) {
            (true, _) => PhoneSessionState::Active,
            (false, WatchConnectionStatus::Connected) => PhoneSessionState::Idle,
            (false, WatchConnectionStatus::Disconnected) => PhoneSessionState::Unknown,
        }
    }

    /// True while a start or stop command waits for its reply.
    pub fn is_loading(&self) -> bool {
        self.pending.values().any(|p| {
            matches!(p.command, Command::StartMonitoring | Command::StopMonitoring)
        })
    }

    pub fn statistics(&self) -> Option<&SessionStatistics> {
        self.statistics.as_ref()
    }

    pub fn recent(&self) -> &RecentSampleWindow {
        &self.recent
    }

    /// Samples accepted in the current session.
    pub fn history(&self) -> &[Sample] {
        &self.history
    }

    pub fn heart_rate(&self) -> Option<f64> {
        self.heart_rate
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn calories(&self) -> f64 {
        self.calories
    }

    pub fn app_state(&self) -> AppState {
        self.continuity.app_state()
    }

    pub fn continuity(&self) -> &ContinuityManager {
        &self.continuity
    }

    /// Whole seconds since the session started; 0 when not monitoring.
    pub fn elapsed_seconds(&self, now: u64) -> u64 {
        match (self.is_monitoring, self.started_at) {
            (true, Some(start)) => now.saturating_sub(start) / 1000,
            _ => 0,
        }
    }

    /// User pressed start. Nothing is sent unless the watch is reachable.
    pub fn start_monitoring(&mut self, now: u64) -> Result<Vec<PhoneAction>, ControlError> {
        self.require_connected()?;
        log::info!("start monitoring requested");
        self.begin_session(now);
        Ok(vec![self.send(Command::StartMonitoring, now)])
    }

    /// User pressed stop. Nothing is sent unless the watch is reachable.
    pub fn stop_monitoring(&mut self, now: u64) -> Result<Vec<PhoneAction>, ControlError> {
        self.require_connected()?;
        log::info!("stop monitoring requested");
        Ok(vec![self.send(Command::StopMonitoring, now)])
    }

    /// Transport reachability changed. Never stops an active session.
    pub fn on_reachability(&mut self, reachable: bool) {
        let status = if reachable {
            WatchConnectionStatus::Connected
        } else {
            WatchConnectionStatus::Disconnected
        };
        if status != self.connection {
            log::info!("watch {:?}", status);
            if !reachable && self.is_monitoring {
                log::warn!("watch unreachable during session; state may be stale");
            }
        }
        self.connection = status;
    }

    /// Process an envelope from the watch.
    pub fn on_envelope(&mut self, env: Envelope, now: u64) -> Vec<PhoneAction> {
        match env {
            Envelope::Reply { id, payload } => self.on_reply(id, &payload, now),
            Envelope::Push { payload } => self.on_message(&payload, now),
            Envelope::Request { .. } => {
                log::debug!("ignoring request from watch");
                vec![]
            }
        }
    }

    /// Reply to an earlier `Send`. Unknown or already resolved ids are ignored.
    pub fn on_reply(&mut self, id: RequestId, payload: &Payload, now: u64) -> Vec<PhoneAction> {
        let Some(pending) = self.pending.remove(&id) else {
            log::debug!("reply for unknown request {}; ignored", id);
            return vec![];
        };
        match pending.command {
            Command::StartMonitoring if pending.session != self.session => {
                log::info!("start reply for a superseded session; ignored");
                vec![]
            }
            Command::StartMonitoring => {
                if payload.is_success() {
                    log::info!("start monitoring confirmed");
                    self.enter_active()
                } else {
                    log::warn!("watch refused start: {:?}", payload.status);
                    if !self.is_monitoring {
                        self.started_at = None;
                    }
                    vec![PhoneAction::Alert(ControlError::StartRejected)]
                }
            }
            Command::StopMonitoring => {
                if payload.is_success() {
                    log::info!("stop monitoring confirmed");
                    self.finish_session(now)
                } else {
                    log::warn!("watch refused stop: {:?}", payload.status);
                    vec![PhoneAction::Alert(ControlError::StopRejected)]
                }
            }
            Command::CheckConnection => {
                if payload.status.as_deref() == Some(STATUS_CONNECTED) {
                    self.on_reachability(true);
                }
                vec![]
            }
            Command::SyncData => {
                if let Some(data) = &payload.heart_rate_data {
                    if let Some(kcal) = data.calories {
                        self.calories = kcal;
                    }
                    self.accept_sample(data.heart_rate, data.steps, now);
                } else {
                    log::debug!("sync returned no data");
                }
                vec![]
            }
        }
    }

    /// Transport failed to deliver request `id`. Never changes `is_monitoring`.
    pub fn on_send_error(&mut self, id: RequestId, reason: &str) -> Vec<PhoneAction> {
        let Some(pending) = self.pending.remove(&id) else {
            return vec![];
        };
        let error = ControlError::SendFailed {
            command: pending.command,
            reason: reason.to_string(),
        };
        self.fail_command(&pending, error)
    }

    /// Unsolicited message from the watch: telemetry and/or monitoring state.
    pub fn on_message(&mut self, payload: &Payload, now: u64) -> Vec<PhoneAction> {
        if let (Some(heart_rate), Some(steps)) = (payload.heart_rate, payload.steps) {
            if let Some(kcal) = payload.calories {
                if self.is_monitoring && self.started_at.is_some() {
                    self.calories = kcal;
                }
            }
            self.accept_sample(heart_rate, steps, now);
        }
        match payload.monitoring_state {
            Some(state) if state != self.is_monitoring => {
                log::info!("adopting watch monitoring state {}", state);
                if state {
                    self.begin_session(now);
                    self.enter_active()
                } else {
                    self.finish_session(now)
                }
            }
            _ => vec![],
        }
    }

    /// App moved between foreground and background.
    pub fn on_app_state(&mut self, state: AppState, now: u64) -> Vec<PhoneAction> {
        let actions = self.continuity.on_app_state(state);
        self.continuity_actions(actions, now)
    }

    /// Background sync timer fired.
    pub fn on_sync_timer(&mut self, now: u64) -> Vec<PhoneAction> {
        let actions = self.continuity.on_timer_tick();
        self.continuity_actions(actions, now)
    }

    /// OS periodic background task fired.
    pub fn on_background_fetch(&mut self, task_id: TaskId, now: u64) -> Vec<PhoneAction> {
        let actions = self.continuity.on_periodic_task(task_id);
        self.continuity_actions(actions, now)
    }

    /// Periodic housekeeping: fails start/stop commands that outlived the
    /// deadline. Unanswered background pulls are dropped without touching
    /// reachability, which only the transport reports.
    pub fn tick(&mut self, now: u64) -> Vec<PhoneAction> {
        let Some(timeout) = self.config.command_timeout else {
            return vec![];
        };
        let timeout_ms = timeout.as_millis() as u64;
        let expired: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_sub(p.sent_at) >= timeout_ms)
            .map(|(&id, _)| id)
            .collect();
        let mut actions = Vec::new();
        for id in expired {
            let Some(pending) = self.pending.remove(&id) else {
                continue;
            };
            match pending.command {
                Command::StartMonitoring | Command::StopMonitoring => {
                    log::warn!("{} timed out", pending.command);
                    let error = ControlError::TimedOut(pending.command);
                    actions.extend(self.fail_command(&pending, error));
                }
                Command::CheckConnection | Command::SyncData => {
                    log::info!("{} unanswered; waiting for the next pull", pending.command);
                }
            }
        }
        actions
    }

    /// Controller is going away: tear down background work.
    pub fn shutdown(&mut self) -> Vec<PhoneAction> {
        let actions = self.continuity.stop();
        self.continuity_actions(actions, 0)
    }

    fn require_connected(&self) -> Result<(), ControlError> {
        if self.connection == WatchConnectionStatus::Connected {
            Ok(())
        } else {
            log::warn!("watch not connected; command not sent");
            Err(ControlError::WatchNotConnected)
        }
    }

    fn send(&mut self, command: Command, now: u64) -> PhoneAction {
        let id = uuid::Uuid::new_v4();
        self.pending.insert(
            id,
            PendingCommand {
                command,
                sent_at: now,
                session: self.session,
            },
        );
        PhoneAction::Send { id, command }
    }

    fn fail_command(&mut self, pending: &PendingCommand, error: ControlError) -> Vec<PhoneAction> {
        match pending.command {
            Command::StartMonitoring | Command::StopMonitoring => {
                log::error!("{}", error);
                if pending.command == Command::StartMonitoring
                    && pending.session == self.session
                    && !self.is_monitoring
                {
                    self.started_at = None;
                }
                vec![PhoneAction::Alert(error)]
            }
            Command::CheckConnection => {
                log::info!("connection check failed: {}", error);
                self.on_reachability(false);
                vec![]
            }
            Command::SyncData => {
                log::info!("data sync failed: {}", error);
                vec![]
            }
        }
    }

    fn begin_session(&mut self, now: u64) {
        self.session += 1;
        self.started_at = Some(now);
        self.history.clear();
        self.recent.clear();
        self.statistics = None;
        self.heart_rate = None;
        self.steps = 0;
        self.calories = 0.0;
    }

    fn enter_active(&mut self) -> Vec<PhoneAction> {
        self.is_monitoring = true;
        let actions = self.continuity.start();
        self.continuity_actions(actions, 0)
    }

    fn finish_session(&mut self, now: u64) -> Vec<PhoneAction> {
        let stats = SessionStatistics::from_history(&self.history, self.started_at, now);
        if let Some(s) = &stats {
            log::info!(
                "session finished: {}s, {} measurements, avg {} bpm",
                s.duration,
                s.total_measurements,
                s.avg_heart_rate
            );
            self.statistics = Some(s.clone());
        }
        let was_running = self.is_monitoring || self.started_at.is_some();
        self.session += 1;
        self.is_monitoring = false;
        self.started_at = None;
        self.history.clear();
        let continuity = self.continuity.stop();
        let mut actions = Vec::new();
        if was_running {
            actions.push(PhoneAction::SessionFinished(stats));
        }
        actions.extend(self.continuity_actions(continuity, now));
        actions
    }

    /// Record a sample if a session is running locally; drop it otherwise.
    fn accept_sample(&mut self, heart_rate: f64, steps: u64, now: u64) -> bool {
        if !self.is_monitoring || self.started_at.is_none() {
            log::debug!("sample outside a session; dropped");
            return false;
        }
        let sample = Sample {
            timestamp: now,
            heart_rate,
            steps,
            calories: self.calories,
        };
        self.history.push(sample);
        self.recent.push(sample);
        self.heart_rate = Some(heart_rate);
        self.steps = steps;
        log::debug!("sample: {} bpm, {} steps, {} kcal", heart_rate, steps, self.calories);
        true
    }

    fn continuity_actions(&mut self, actions: Vec<ContinuityAction>, now: u64) -> Vec<PhoneAction> {
        let mut out = Vec::new();
        for action in actions {
            match action {
                ContinuityAction::Pull => {
                    out.push(self.send(Command::CheckConnection, now));
                    out.push(self.send(Command::SyncData, now));
                }
                ContinuityAction::StartTimer(d) => out.push(PhoneAction::StartSyncTimer(d)),
                ContinuityAction::StopTimer => out.push(PhoneAction::StopSyncTimer),
                ContinuityAction::RegisterPeriodic(d) => {
                    out.push(PhoneAction::RegisterBackgroundFetch(d))
                }
                ContinuityAction::UnregisterPeriodic => {
                    out.push(PhoneAction::UnregisterBackgroundFetch)
                }
                ContinuityAction::CompletePeriodic(id) => {
                    out.push(PhoneAction::FinishBackgroundFetch(id))
                }
            }
        }
        out
    }
}

impl Default for SessionController {
    fn default() -> Self {
        Self::new(ControllerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{HeartRateData, STATUS_SUCCESS};

    fn connected() -> SessionController {
        let mut c = SessionController::default();
        c.on_reachability(true);
        c
    }

    fn sent(actions: &[PhoneAction], command: Command) -> RequestId {
        actions
            .iter()
            .find_map(|a| match a {
                PhoneAction::Send { id, command: c } if *c == command => Some(*id),
                _ => None,
            })
            .unwrap_or_else(|| panic!("no {} sent in {:?}", command, actions))
    }

    fn sample_push(heart_rate: f64, steps: u64) -> Payload {
        Payload {
            heart_rate: Some(heart_rate),
            steps: Some(steps),
            ..Payload::default()
        }
    }

    /// Start at `now` and confirm it.
    fn started(now: u64) -> SessionController {
        let mut c = connected();
        let actions = c.start_monitoring(now).unwrap();
        let id = sent(&actions, Command::StartMonitoring);
        c.on_reply(id, &Payload::status(STATUS_SUCCESS), now);
        c
    }

    fn stop_confirmed(c: &mut SessionController, now: u64) -> Vec<PhoneAction> {
        let actions = c.stop_monitoring(now).unwrap();
        let id = sent(&actions, Command::StopMonitoring);
        c.on_reply(id, &Payload::status(STATUS_SUCCESS), now)
    }

    #[test]
    fn reference_scenario_statistics() {
        let mut c = started(0);
        c.on_message(&sample_push(72.0, 10), 1_000);
        c.on_message(&sample_push(75.0, 25), 2_000);
        let actions = stop_confirmed(&mut c, 3_000);
        let stats = c.statistics().unwrap();
        assert_eq!(stats.duration, 3);
        assert_eq!(stats.total_measurements, 2);
        assert_eq!(stats.avg_heart_rate, 73.5);
        assert_eq!(stats.max_heart_rate, 75.0);
        assert_eq!(stats.min_heart_rate, 72.0);
        assert_eq!(stats.total_steps, 25);
        assert!(actions.contains(&PhoneAction::SessionFinished(Some(stats.clone()))));
        assert!(!c.is_monitoring());
        assert_eq!(c.started_at(), None);
    }

    #[test]
    fn start_while_disconnected_sends_nothing() {
        let mut c = SessionController::default();
        assert_eq!(c.start_monitoring(0), Err(ControlError::WatchNotConnected));
        assert_eq!(c.stop_monitoring(0), Err(ControlError::WatchNotConnected));
        assert_eq!(c.started_at(), None);
        assert!(!c.is_loading());
        assert!(!c.is_monitoring());
        assert_eq!(c.session_state(), PhoneSessionState::Unknown);
    }

    #[test]
    fn start_confirmed_starts_continuity() {
        let mut c = connected();
        let actions = c.start_monitoring(100).unwrap();
        assert!(c.is_loading());
        assert!(!c.is_monitoring());
        let id = sent(&actions, Command::StartMonitoring);
        let actions = c.on_reply(id, &Payload::status(STATUS_SUCCESS), 200);
        assert!(c.is_monitoring());
        assert!(!c.is_loading());
        assert_eq!(c.started_at(), Some(100));
        assert!(actions.contains(&PhoneAction::StartSyncTimer(DEFAULT_SYNC_INTERVAL)));
        assert!(actions.contains(&PhoneAction::RegisterBackgroundFetch(
            MIN_BACKGROUND_FETCH_INTERVAL
        )));
        assert_eq!(c.session_state(), PhoneSessionState::Active);
    }

    #[test]
    fn start_rejected_alerts_and_stays_idle() {
        let mut c = connected();
        let actions = c.start_monitoring(0).unwrap();
        let id = sent(&actions, Command::StartMonitoring);
        let actions = c.on_reply(id, &Payload::status("busy"), 10);
        assert_eq!(actions, vec![PhoneAction::Alert(ControlError::StartRejected)]);
        assert!(!c.is_monitoring());
        assert!(!c.is_loading());
    }

    #[test]
    fn send_error_alerts_without_touching_monitoring() {
        let mut c = started(0);
        let actions = c.stop_monitoring(10).unwrap();
        let id = sent(&actions, Command::StopMonitoring);
        let actions = c.on_send_error(id, "not reachable");
        assert!(matches!(
            actions.as_slice(),
            [PhoneAction::Alert(ControlError::SendFailed { command: Command::StopMonitoring, .. })]
        ));
        assert!(c.is_monitoring());
        assert!(!c.is_loading());
    }

    #[test]
    fn stop_rejected_leaves_state() {
        let mut c = started(0);
        c.on_message(&sample_push(70.0, 1), 500);
        let actions = c.stop_monitoring(1_000).unwrap();
        let id = sent(&actions, Command::StopMonitoring);
        let actions = c.on_reply(id, &Payload::status("error"), 1_000);
        assert_eq!(actions, vec![PhoneAction::Alert(ControlError::StopRejected)]);
        assert!(c.is_monitoring());
        assert_eq!(c.history().len(), 1);
        assert!(c.statistics().is_none());
    }

    #[test]
    fn samples_outside_session_are_dropped() {
        let mut c = connected();
        c.on_message(&sample_push(60.0, 1), 0);
        let actions = c.start_monitoring(1_000).unwrap();
        // Not yet confirmed: still dropped.
        c.on_message(&sample_push(61.0, 2), 1_100);
        let id = sent(&actions, Command::StartMonitoring);
        c.on_reply(id, &Payload::status(STATUS_SUCCESS), 1_200);
        c.on_message(&sample_push(70.0, 3), 2_000);
        c.on_message(&sample_push(72.0, 4), 3_000);
        stop_confirmed(&mut c, 4_000);
        c.on_message(&sample_push(99.0, 9), 5_000);
        assert_eq!(c.statistics().unwrap().total_measurements, 2);
        assert!(c.history().is_empty());
    }

    #[test]
    fn message_without_steps_is_not_a_sample() {
        let mut c = started(0);
        c.on_message(
            &Payload {
                heart_rate: Some(80.0),
                ..Payload::default()
            },
            100,
        );
        assert!(c.history().is_empty());
    }

    #[test]
    fn duplicate_last_sample_does_not_double_count_totals() {
        let mut c = started(0);
        let mut last = sample_push(90.0, 300);
        last.calories = Some(12.5);
        c.on_message(&sample_push(85.0, 120), 1_000);
        c.on_message(&last, 2_000);
        c.on_message(&last, 2_100);
        stop_confirmed(&mut c, 3_000);
        let stats = c.statistics().unwrap();
        assert_eq!(stats.total_steps, 300);
        assert_eq!(stats.total_calories, 12.5);
    }

    #[test]
    fn watch_initiated_stop_produces_statistics() {
        let mut c = started(0);
        c.on_message(&sample_push(100.0, 50), 1_000);
        c.on_message(&sample_push(110.0, 80), 2_000);
        let actions = c.on_message(&Payload::monitoring_state(false), 5_000);
        assert!(!c.is_monitoring());
        let stats = c.statistics().unwrap();
        assert_eq!(stats.total_measurements, 2);
        assert_eq!(stats.duration, 5);
        assert_eq!(stats.avg_heart_rate, 105.0);
        assert!(actions.contains(&PhoneAction::StopSyncTimer));
        assert!(actions.contains(&PhoneAction::UnregisterBackgroundFetch));
    }

    #[test]
    fn watch_initiated_start_begins_session() {
        let mut c = connected();
        let actions = c.on_message(&Payload::monitoring_state(true), 7_000);
        assert!(c.is_monitoring());
        assert_eq!(c.started_at(), Some(7_000));
        assert!(actions.contains(&PhoneAction::StartSyncTimer(DEFAULT_SYNC_INTERVAL)));
        c.on_message(&sample_push(65.0, 0), 8_000);
        assert_eq!(c.history().len(), 1);
    }

    #[test]
    fn duplicate_state_pushes_are_idempotent() {
        let mut c = started(0);
        c.on_message(&sample_push(70.0, 1), 1_000);
        assert!(c.on_message(&Payload::monitoring_state(true), 1_500).is_empty());
        assert_eq!(c.history().len(), 1);
        c.on_message(&Payload::monitoring_state(false), 2_000);
        let first = c.statistics().cloned();
        assert!(c.on_message(&Payload::monitoring_state(false), 2_500).is_empty());
        assert_eq!(c.statistics().cloned(), first);
    }

    #[test]
    fn late_stop_reply_keeps_statistics_from_push() {
        let mut c = started(0);
        c.on_message(&sample_push(70.0, 5), 1_000);
        let actions = c.stop_monitoring(2_000).unwrap();
        let id = sent(&actions, Command::StopMonitoring);
        // State push overtakes the reply.
        c.on_message(&Payload::monitoring_state(false), 2_100);
        let stats = c.statistics().cloned();
        assert!(stats.is_some());
        let actions = c.on_reply(id, &Payload::status(STATUS_SUCCESS), 2_200);
        assert!(!actions.iter().any(|a| matches!(a, PhoneAction::SessionFinished(_))));
        assert_eq!(c.statistics().cloned(), stats);
    }

    #[test]
    fn disconnect_does_not_stop_session() {
        let mut c = started(0);
        c.on_message(&sample_push(70.0, 5), 1_000);
        c.on_reachability(false);
        assert!(c.is_monitoring());
        assert_eq!(c.session_state(), PhoneSessionState::Active);
        assert_eq!(c.history().len(), 1);
        assert_eq!(c.connection(), WatchConnectionStatus::Disconnected);
    }

    #[test]
    fn next_start_clears_previous_statistics() {
        let mut c = started(0);
        c.on_message(&sample_push(70.0, 5), 1_000);
        stop_confirmed(&mut c, 2_000);
        assert!(c.statistics().is_some());
        c.start_monitoring(3_000).unwrap();
        assert!(c.statistics().is_none());
        assert!(c.recent().is_empty());
    }

    #[test]
    fn recent_window_holds_last_five() {
        let mut c = started(0);
        for i in 0..8u64 {
            c.on_message(&sample_push(60.0 + i as f64, i), 1_000 * (i + 1));
        }
        assert_eq!(c.recent().len(), 5);
        assert_eq!(c.recent().latest().unwrap().steps, 7);
        assert_eq!(c.history().len(), 8);
        assert_eq!(c.heart_rate(), Some(67.0));
    }

    #[test]
    fn background_timer_pulls_check_and_sync() {
        let mut c = started(0);
        assert!(c.on_sync_timer(1_000).is_empty());
        assert!(c.on_app_state(AppState::Background, 1_500).is_empty());
        let actions = c.on_sync_timer(2_000);
        let sync_id = sent(&actions, Command::SyncData);
        sent(&actions, Command::CheckConnection);
        c.on_reply(
            sync_id,
            &Payload::sync_reply(HeartRateData {
                heart_rate: 77.0,
                steps: 31,
                calories: Some(2.5),
                timestamp: 1_900,
            }),
            2_050,
        );
        assert_eq!(c.history().len(), 1);
        assert_eq!(c.history()[0].timestamp, 2_050);
        assert_eq!(c.history()[0].calories, 2.5);
        // Background pulls never show the loading indicator.
        assert!(!c.is_loading());
    }

    #[test]
    fn foreground_return_resyncs_immediately() {
        let mut c = started(0);
        c.on_app_state(AppState::Background, 100);
        let actions = c.on_app_state(AppState::Foreground, 60_000);
        sent(&actions, Command::CheckConnection);
        sent(&actions, Command::SyncData);
    }

    #[test]
    fn background_fetch_always_finishes() {
        let mut c = connected();
        assert_eq!(
            c.on_background_fetch("idle".into(), 0),
            vec![PhoneAction::FinishBackgroundFetch("idle".into())]
        );
        let mut c = started(0);
        let actions = c.on_background_fetch("bg".into(), 1_000);
        sent(&actions, Command::SyncData);
        assert_eq!(
            actions.last(),
            Some(&PhoneAction::FinishBackgroundFetch("bg".into()))
        );
    }

    #[test]
    fn failed_connection_check_marks_disconnected() {
        let mut c = started(0);
        c.on_app_state(AppState::Background, 0);
        let actions = c.on_sync_timer(1_000);
        let check = sent(&actions, Command::CheckConnection);
        let sync = sent(&actions, Command::SyncData);
        assert!(c.on_send_error(sync, "timeout").is_empty());
        assert!(c.on_send_error(check, "timeout").is_empty());
        assert_eq!(c.connection(), WatchConnectionStatus::Disconnected);
        assert!(c.is_monitoring());
    }

    #[test]
    fn unanswered_command_times_out() {
        let mut c = connected();
        c.start_monitoring(0).unwrap();
        assert!(c.tick(5_000).is_empty());
        assert!(c.is_loading());
        let actions = c.tick(10_000);
        assert_eq!(
            actions,
            vec![PhoneAction::Alert(ControlError::TimedOut(Command::StartMonitoring))]
        );
        assert!(!c.is_loading());
        assert!(!c.is_monitoring());
        assert_eq!(c.started_at(), None);
    }

    #[test]
    fn unanswered_background_check_keeps_link_status() {
        let mut c = started(0);
        c.on_app_state(AppState::Background, 0);
        let actions = c.on_sync_timer(1_000);
        sent(&actions, Command::CheckConnection);
        assert!(c.tick(11_000).is_empty());
        assert_eq!(c.connection(), WatchConnectionStatus::Connected);
        c.on_message(&Payload::monitoring_state(false), 12_000);
        assert!(!c.continuity().is_active());
        assert!(c.start_monitoring(13_000).is_ok());
    }

    #[test]
    fn start_reply_after_completed_stop_is_ignored() {
        let mut c = connected();
        let start = sent(&c.start_monitoring(0).unwrap(), Command::StartMonitoring);
        let stop = sent(&c.stop_monitoring(100).unwrap(), Command::StopMonitoring);
        c.on_reply(stop, &Payload::status(STATUS_SUCCESS), 200);
        assert!(c
            .on_reply(start, &Payload::status(STATUS_SUCCESS), 300)
            .is_empty());
        c.on_message(&sample_push(80.0, 3), 400);
        assert!(!c.is_monitoring());
        assert_eq!(c.started_at(), None);
        assert_eq!(c.session_state(), PhoneSessionState::Idle);
        assert!(!c.continuity().is_active());
        assert!(!c.is_loading());
    }

    #[test]
    fn only_the_latest_start_reply_activates() {
        let mut c = connected();
        let first = sent(&c.start_monitoring(0).unwrap(), Command::StartMonitoring);
        let second = sent(&c.start_monitoring(500).unwrap(), Command::StartMonitoring);
        assert!(c.on_reply(first, &Payload::status("busy"), 600).is_empty());
        assert_eq!(c.started_at(), Some(500));
        c.on_reply(second, &Payload::status(STATUS_SUCCESS), 700);
        assert!(c.is_monitoring());
        assert_eq!(c.started_at(), Some(500));
    }

    #[test]
    fn message_without_calories_keeps_last_value() {
        let mut c = started(0);
        let mut first = sample_push(70.0, 10);
        first.calories = Some(4.0);
        c.on_message(&first, 1_000);
        c.on_message(&sample_push(72.0, 20), 2_000);
        assert_eq!(c.history()[1].calories, 4.0);
        assert_eq!(c.calories(), 4.0);
        stop_confirmed(&mut c, 3_000);
        assert_eq!(c.statistics().unwrap().total_calories, 4.0);
    }

    #[test]
    fn no_timeout_waits_forever() {
        let mut c = SessionController::new(ControllerConfig {
            command_timeout: None,
            ..ControllerConfig::default()
        });
        c.on_reachability(true);
        c.start_monitoring(0).unwrap();
        assert!(c.tick(u64::MAX).is_empty());
        assert!(c.is_loading());
    }

    #[test]
    fn reply_for_unknown_request_is_ignored() {
        let mut c = connected();
        assert!(c
            .on_reply(uuid::Uuid::new_v4(), &Payload::status(STATUS_SUCCESS), 0)
            .is_empty());
        assert!(!c.is_monitoring());
    }

    #[test]
    fn elapsed_seconds_tracks_session() {
        let c = started(1_000);
        assert_eq!(c.elapsed_seconds(4_500), 3);
        let c = connected();
        assert_eq!(c.elapsed_seconds(4_500), 0);
    }

    #[test]
    fn shutdown_tears_down_background_work() {
        let mut c = started(0);
        assert_eq!(
            c.shutdown(),
            vec![PhoneAction::StopSyncTimer, PhoneAction::UnregisterBackgroundFetch]
        );
        assert!(c.shutdown().is_empty());
    }

    fn over_wire(env: Envelope) -> Envelope {
        let bytes = crate::wire::encode_frame(&env).unwrap();
        let (decoded, used) = crate::wire::decode_frame(&bytes).unwrap();
        assert_eq!(used, bytes.len());
        decoded
    }

    /// Delivers the phone's sends to the watch and the watch's replies and pushes back.
    fn exchange(
        phone: &mut SessionController,
        watch: &mut crate::handler::CommandHandler,
        actions: Vec<PhoneAction>,
        now: u64,
    ) -> Vec<PhoneAction> {
        use crate::handler::WatchAction;
        use crate::sensor::SensorAccess;
        let mut out = Vec::new();
        for action in actions {
            let PhoneAction::Send { id, command } = action else {
                out.push(action);
                continue;
            };
            let request = over_wire(Envelope::Request {
                id,
                payload: Payload::command(command),
            });
            for reply in watch.on_envelope(request, SensorAccess::Authorized, now) {
                let env = match reply {
                    WatchAction::Reply(id, payload) => Envelope::Reply { id, payload },
                    WatchAction::Push(payload) => Envelope::Push { payload },
                    WatchAction::Sensor(_) => continue,
                };
                out.extend(phone.on_envelope(over_wire(env), now));
            }
        }
        out
    }

    fn deliver_pushes(
        phone: &mut SessionController,
        actions: Vec<crate::handler::WatchAction>,
        now: u64,
    ) {
        for action in actions {
            if let crate::handler::WatchAction::Push(payload) = action {
                phone.on_envelope(over_wire(Envelope::Push { payload }), now);
            }
        }
    }

    #[test]
    fn phone_and_watch_complete_a_session_over_the_wire() {
        use crate::sensor::Reading;
        let mut watch = crate::handler::CommandHandler::new();
        watch.on_reachability(true);
        let mut phone = connected();

        let actions = phone.start_monitoring(0).unwrap();
        exchange(&mut phone, &mut watch, actions, 0);
        assert!(watch.is_monitoring());
        assert!(phone.is_monitoring());
        assert!(!phone.is_loading());

        let a = watch.on_reading(Reading::HeartRate(72.0), 1_000);
        deliver_pushes(&mut phone, a, 1_000);
        let a = watch.on_reading(Reading::Steps(10), 1_500);
        deliver_pushes(&mut phone, a, 1_500);
        let a = watch.on_reading(Reading::HeartRate(75.0), 2_000);
        deliver_pushes(&mut phone, a, 2_000);
        assert_eq!(phone.history().len(), 3);
        assert_eq!(phone.heart_rate(), Some(75.0));

        let actions = phone.stop_monitoring(3_000).unwrap();
        let out = exchange(&mut phone, &mut watch, actions, 3_000);
        assert!(!watch.is_monitoring());
        assert!(!phone.is_monitoring());
        let stats = phone.statistics().unwrap();
        assert_eq!(stats.duration, 3);
        assert_eq!(stats.total_measurements, 3);
        assert_eq!(stats.avg_heart_rate, 73.0);
        assert_eq!(stats.min_heart_rate, 72.0);
        assert_eq!(stats.max_heart_rate, 75.0);
        assert_eq!(stats.total_steps, 10);
        assert!(out.contains(&PhoneAction::StopSyncTimer));
    }

    #[test]
    fn failed_watch_start_is_reconciled_on_phone() {
        let mut watch = crate::handler::CommandHandler::new();
        watch.on_reachability(true);
        let mut phone = connected();
        let actions = phone.start_monitoring(0).unwrap();
        let id = sent(&actions, Command::StartMonitoring);
        let request = over_wire(Envelope::Request {
            id,
            payload: Payload::command(Command::StartMonitoring),
        });
        let replies = watch.on_envelope(request, crate::sensor::SensorAccess::Unavailable, 0);
        for reply in replies {
            let env = match reply {
                crate::handler::WatchAction::Reply(id, payload) => Envelope::Reply { id, payload },
                crate::handler::WatchAction::Push(payload) => Envelope::Push { payload },
                crate::handler::WatchAction::Sensor(_) => continue,
            };
            phone.on_envelope(over_wire(env), 100);
        }
        assert!(!watch.is_monitoring());
        assert!(!phone.is_monitoring());
        assert!(phone.statistics().is_none());
        assert!(!phone.continuity().is_active());
    }
}
