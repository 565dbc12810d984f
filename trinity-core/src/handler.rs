//! Watch side: maps phone commands onto the sensor session and pushes state
//! and telemetry back to the phone.
//!
//! Pushes are best-effort: they are emitted only while the phone is reachable
//! and are never queued or retried.

use crate::protocol::{
    Command, Envelope, HeartRateData, Payload, RequestId, STATUS_CONNECTED, STATUS_NO_DATA,
    STATUS_SUCCESS,
};
use crate::sensor::{Metric, Reading, SensorAccess, SensorAction, SensorSession, SensorUpdate};

/// Action for the watch host to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchAction {
    /// Answer the phone request `id`.
    Reply(RequestId, Payload),
    /// Fire-and-forget message to the phone.
    Push(Payload),
    Sensor(SensorAction),
}

/// Watch-side command handler. Owns the sensor session and the watch's
/// authoritative `is_monitoring` flag.
pub struct CommandHandler {
    session: SensorSession,
    is_monitoring: bool,
    reachable: bool,
    last_reading_at: Option<u64>,
}

impl CommandHandler {
    pub fn new() -> Self {
        Self {
            session: SensorSession::new(),
            is_monitoring: false,
            reachable: false,
            last_reading_at: None,
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.is_monitoring
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable
    }

    pub fn session(&self) -> &SensorSession {
        &self.session
    }

    pub fn on_reachability(&mut self, reachable: bool) {
        if self.reachable != reachable {
            log::info!("phone {}", if reachable { "reachable" } else { "unreachable" });
        }
        self.reachable = reachable;
    }

    /// Process an envelope from the phone. Only requests carry commands; anything
    /// else is logged and ignored.
    pub fn on_envelope(&mut self, env: Envelope, access: SensorAccess, now: u64) -> Vec<WatchAction> {
        match env {
            Envelope::Request { id, payload } => self.on_request(id, &payload, access, now),
            other => {
                log::debug!("ignoring non-request envelope from phone: {:?}", other);
                vec![]
            }
        }
    }

    /// Process a command request. Unknown or missing commands get no reply.
    pub fn on_request(
        &mut self,
        id: RequestId,
        payload: &Payload,
        access: SensorAccess,
        now: u64,
    ) -> Vec<WatchAction> {
        let Some(command) = payload.parsed_command() else {
            log::warn!("unhandled message from phone: {:?}", payload);
            return vec![];
        };
        log::info!("received command {}", command);
        match command {
            Command::StartMonitoring => {
                // Acknowledged before the sensor session confirms; a later failure
                // is reported through a monitoringState push.
                let mut actions = vec![WatchAction::Reply(id, Payload::status(STATUS_SUCCESS))];
                actions.extend(self.start_local(access));
                actions
            }
            Command::StopMonitoring => {
                let mut actions = vec![WatchAction::Reply(id, Payload::status(STATUS_SUCCESS))];
                actions.extend(self.stop_local());
                actions
            }
            Command::CheckConnection => {
                vec![WatchAction::Reply(id, Payload::status(STATUS_CONNECTED))]
            }
            Command::SyncData => vec![WatchAction::Reply(id, self.sync_payload(now))],
        }
    }

    /// Start monitoring, from a phone command or the watch's own controls.
    pub fn start_local(&mut self, access: SensorAccess) -> Vec<WatchAction> {
        let started = self.session.start(access);
        let mut actions = self.set_monitoring(true);
        match started {
            Ok(sensor) => actions.extend(sensor.into_iter().map(WatchAction::Sensor)),
            Err(e) => {
                log::warn!("monitoring did not start: {}", e);
                actions.extend(self.set_monitoring(false));
            }
        }
        actions
    }

    /// Stop monitoring, from a phone command or the watch's own controls.
    pub fn stop_local(&mut self) -> Vec<WatchAction> {
        let mut actions: Vec<WatchAction> = self
            .session
            .stop()
            .into_iter()
            .map(WatchAction::Sensor)
            .collect();
        self.last_reading_at = None;
        actions.extend(self.set_monitoring(false));
        actions
    }

    /// Host reports the outcome of a `RequestAuthorization` action.
    pub fn on_authorization(&mut self, granted: bool) -> Vec<WatchAction> {
        match self.session.on_authorization(granted) {
            Ok(sensor) => sensor.into_iter().map(WatchAction::Sensor).collect(),
            Err(e) => {
                log::warn!("monitoring did not start: {}", e);
                self.set_monitoring(false)
            }
        }
    }

    /// Host reports a query that failed to open or stopped delivering.
    pub fn on_query_failed(&mut self, metric: Metric, reason: &str) -> Vec<WatchAction> {
        if !self.session.is_active() {
            log::debug!("{:?} query failure after stop; ignored", metric);
            return vec![];
        }
        let (sensor, err) = self.session.on_query_failed(metric, reason);
        log::warn!("monitoring stopped: {}", err);
        self.last_reading_at = None;
        let mut actions: Vec<WatchAction> = sensor.into_iter().map(WatchAction::Sensor).collect();
        actions.extend(self.set_monitoring(false));
        actions
    }

    /// Host delivers a reading from an open query.
    pub fn on_reading(&mut self, reading: Reading, now: u64) -> Vec<WatchAction> {
        let Some(update) = self.session.on_reading(reading) else {
            return vec![];
        };
        self.last_reading_at = Some(now);
        self.push(self.telemetry(&update)).into_iter().collect()
    }

    fn telemetry(&self, update: &SensorUpdate) -> Payload {
        Payload::telemetry(update.heart_rate, update.steps, update.calories, self.is_monitoring)
    }

    fn sync_payload(&self, now: u64) -> Payload {
        match (self.session.heart_rate(), self.last_reading_at) {
            (Some(heart_rate), Some(at)) => Payload::sync_reply(HeartRateData {
                heart_rate,
                steps: self.session.steps(),
                calories: Some(self.session.calories()),
                timestamp: at,
            }),
            _ => {
                log::debug!("sync requested at {} with no reading", now);
                Payload::status(STATUS_NO_DATA)
            }
        }
    }

    fn set_monitoring(&mut self, monitoring: bool) -> Vec<WatchAction> {
        if self.is_monitoring == monitoring {
            return vec![];
        }
        log::info!("monitoring state -> {}", monitoring);
        self.is_monitoring = monitoring;
        self.push(Payload::monitoring_state(monitoring))
            .into_iter()
            .collect()
    }

    fn push(&self, payload: Payload) -> Option<WatchAction> {
        if self.reachable {
            Some(WatchAction::Push(payload))
        } else {
            log::debug!("phone unreachable; dropping push {:?}", payload);
            None
        }
    }
}

impl Default for CommandHandler {
    fn default() -> Self {
        Self::new()
    }
}
