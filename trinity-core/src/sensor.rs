//! Wearable sensor session: authorization, live metric queries and the
//! recording context that keeps background delivery alive.
//!
//! Host-driven like the rest of the core. The host reports the platform's
//! authorization status and query results; the session returns the
//! `SensorAction`s to perform against the platform sensor store.

/// Live metric the session observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    HeartRate,
    Steps,
    /// Active energy burned.
    Calories,
}

impl Metric {
    pub const ALL: [Metric; 3] = [Metric::HeartRate, Metric::Steps, Metric::Calories];

    fn index(self) -> usize {
        match self {
            Metric::HeartRate => 0,
            Metric::Steps => 1,
            Metric::Calories => 2,
        }
    }
}

/// Platform authorization status reported by the host when starting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorAccess {
    /// Health data is not available on this device at all.
    Unavailable,
    NotAuthorized,
    Authorized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Authorizing,
    Active,
}

/// Action for the host to perform against the platform sensor store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorAction {
    RequestAuthorization,
    /// Open the workout-like context so the platform keeps delivering in background.
    BeginRecording,
    OpenQuery(Metric),
    CloseQuery(Metric),
    EndRecording,
}

/// Value delivered by one of the open queries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading {
    HeartRate(f64),
    /// Cumulative since the query was opened.
    Steps(u64),
    /// Cumulative kcal since the query was opened.
    Calories(f64),
}

impl Reading {
    pub fn metric(&self) -> Metric {
        match self {
            Reading::HeartRate(_) => Metric::HeartRate,
            Reading::Steps(_) => Metric::Steps,
            Reading::Calories(_) => Metric::Calories,
        }
    }
}

/// Sample callback: the reading that arrived plus the session's current counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorUpdate {
    pub reading: Reading,
    pub heart_rate: Option<f64>,
    pub steps: u64,
    pub calories: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SensorError {
    #[error("health data is not available on this device")]
    Unavailable,
    #[error("sensor authorization denied")]
    AuthorizationDenied,
    #[error("{0:?} query failed: {1}")]
    QueryFailed(Metric, String),
}

pub struct SensorSession {
    state: SessionState,
    open_queries: [bool; 3],
    recording: bool,
    heart_rate: Option<f64>,
    steps: u64,
    calories: f64,
}

impl SensorSession {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            open_queries: [false; 3],
            recording: false,
            heart_rate: None,
            steps: 0,
            calories: 0.0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
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

    pub fn is_query_open(&self, metric: Metric) -> bool {
        self.open_queries[metric.index()]
    }

    /// Begin monitoring. Returns the actions to perform, or an error when the
    /// session cannot start. Starting an already starting/active session is a no-op.
    pub fn start(&mut self, access: SensorAccess) -> Result<Vec<SensorAction>, SensorError> {
        if self.state != SessionState::Idle {
            log::debug!("sensor session already {:?}; start ignored", self.state);
            return Ok(vec![]);
        }
        match access {
            SensorAccess::Unavailable => {
                log::warn!("health data not available; monitoring did not start");
                Err(SensorError::Unavailable)
            }
            SensorAccess::NotAuthorized => {
                log::info!("requesting sensor authorization");
                self.state = SessionState::Authorizing;
                Ok(vec![SensorAction::RequestAuthorization])
            }
            SensorAccess::Authorized => Ok(self.activate()),
        }
    }

    /// Host reports the outcome of `RequestAuthorization`. Ignored unless authorizing
    /// (e.g. the session was stopped while the prompt was up).
    pub fn on_authorization(&mut self, granted: bool) -> Result<Vec<SensorAction>, SensorError> {
        if self.state != SessionState::Authorizing {
            log::debug!("authorization result in {:?}; ignored", self.state);
            return Ok(vec![]);
        }
        if granted {
            Ok(self.activate())
        } else {
            log::warn!("sensor authorization denied; monitoring did not start");
            self.state = SessionState::Idle;
            Err(SensorError::AuthorizationDenied)
        }
    }

    /// Host reports that a query could not be opened or died. Tears the whole session down;
    /// the caller must issue a fresh `start()`.
    pub fn on_query_failed(&mut self, metric: Metric, reason: &str) -> (Vec<SensorAction>, SensorError) {
        log::warn!("{:?} query failed: {}", metric, reason);
        self.open_queries[metric.index()] = false;
        let actions = self.teardown();
        (actions, SensorError::QueryFailed(metric, reason.to_string()))
    }

    /// Deliver a reading from an open query. Returns the sample callback, or `None`
    /// when the session is not active or the query was already closed.
    pub fn on_reading(&mut self, reading: Reading) -> Option<SensorUpdate> {
        if !self.is_active() || !self.is_query_open(reading.metric()) {
            log::debug!("reading {:?} outside an active query; dropped", reading);
            return None;
        }
        match reading {
            Reading::HeartRate(bpm) => self.heart_rate = Some(bpm),
            // Cumulative counters never go backwards within a session.
            Reading::Steps(n) => self.steps = self.steps.max(n),
            Reading::Calories(kcal) => self.calories = self.calories.max(kcal),
        }
        Some(SensorUpdate {
            reading,
            heart_rate: self.heart_rate,
            steps: self.steps,
            calories: self.calories,
        })
    }

    /// Stop monitoring. Closes open queries, ends recording and resets counters for the
    /// next session. Returns no actions when already stopped.
    pub fn stop(&mut self) -> Vec<SensorAction> {
        if self.state == SessionState::Idle && !self.recording && !self.open_queries.contains(&true) {
            return vec![];
        }
        log::info!("stopping sensor session");
        self.teardown()
    }

    fn activate(&mut self) -> Vec<SensorAction> {
        log::info!("sensor session active");
        self.state = SessionState::Active;
        self.recording = true;
        self.heart_rate = None;
        self.steps = 0;
        self.calories = 0.0;
        // Recording context must exist before the live queries are registered.
        let mut actions = vec![SensorAction::BeginRecording];
        for metric in Metric::ALL {
            self.open_queries[metric.index()] = true;
            actions.push(SensorAction::OpenQuery(metric));
        }
        actions
    }

    fn teardown(&mut self) -> Vec<SensorAction> {
        let mut actions = Vec::new();
        for metric in Metric::ALL {
            if self.open_queries[metric.index()] {
                self.open_queries[metric.index()] = false;
                actions.push(SensorAction::CloseQuery(metric));
            }
        }
        if self.recording {
            self.recording = false;
            actions.push(SensorAction::EndRecording);
        }
        self.state = SessionState::Idle;
        self.heart_rate = None;
        self.steps = 0;
        self.calories = 0.0;
        actions
    }
}

impl Default for SensorSession {
    fn default() -> Self {
        Self::new()
    }
}
