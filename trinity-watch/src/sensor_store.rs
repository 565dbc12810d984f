//! Simulated platform sensor store. Performs `SensorAction`s and delivers
//! readings back to the event loop, one tokio task per open query.

use std::collections::HashMap;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use trinity_core::{Metric, Reading, SensorAction};

use crate::config::Authorization;

/// Identifies one opened query; readings from a closed query are stale.
pub type QueryId = u64;

/// Event from the store into the watch event loop.
#[derive(Debug)]
pub enum StoreEvent {
    Authorization(bool),
    Reading(QueryId, Reading),
    QueryFailed(Metric, String),
}

pub struct SensorStore {
    events: mpsc::UnboundedSender<StoreEvent>,
    interval: Duration,
    authorization: Authorization,
    recording: bool,
    queries: HashMap<Metric, (QueryId, JoinHandle<()>)>,
    next_query: QueryId,
}

impl SensorStore {
    pub fn new(
        events: mpsc::UnboundedSender<StoreEvent>,
        interval: Duration,
        authorization: Authorization,
    ) -> Self {
        Self {
            events,
            interval,
            authorization,
            recording: false,
            queries: HashMap::new(),
            next_query: 0,
        }
    }

    pub fn perform(&mut self, action: SensorAction) {
        match action {
            SensorAction::RequestAuthorization => {
                let granted = self.authorization.prompt_result();
                log::info!("authorization prompt -> {}", if granted { "granted" } else { "denied" });
                let events = self.events.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    let _ = events.send(StoreEvent::Authorization(granted));
                });
            }
            SensorAction::BeginRecording => {
                log::info!("recording started");
                self.recording = true;
            }
            SensorAction::OpenQuery(metric) => self.open_query(metric),
            SensorAction::CloseQuery(metric) => {
                if let Some((_, handle)) = self.queries.remove(&metric) {
                    handle.abort();
                    log::debug!("{:?} query closed", metric);
                }
            }
            SensorAction::EndRecording => {
                log::info!("recording ended");
                self.recording = false;
            }
        }
    }

    pub fn shutdown(&mut self) {
        for (_, (_, handle)) in self.queries.drain() {
            handle.abort();
        }
        self.recording = false;
    }

    /// True when `query` is the open query for `metric`.
    pub fn is_current(&self, query: QueryId, metric: Metric) -> bool {
        self.queries.get(&metric).map(|(id, _)| *id) == Some(query)
    }

    fn open_query(&mut self, metric: Metric) {
        if !self.recording {
            let _ = self.events.send(StoreEvent::QueryFailed(
                metric,
                "no active recording".to_string(),
            ));
            return;
        }
        if let Some((_, old)) = self.queries.remove(&metric) {
            old.abort();
        }
        self.next_query += 1;
        let query = self.next_query;
        let events = self.events.clone();
        let interval = self.interval;
        let handle = tokio::spawn(async move {
            let mut rng = StdRng::from_entropy();
            let mut source = Simulated::new(metric);
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if events.send(StoreEvent::Reading(query, source.next(&mut rng))).is_err() {
                    break;
                }
            }
        });
        log::debug!("{:?} query opened", metric);
        self.queries.insert(metric, (query, handle));
    }
}

/// Plausible values for one metric: a bounded heart-rate walk and
/// non-decreasing cumulative counters.
struct Simulated {
    metric: Metric,
    heart_rate: f64,
    steps: u64,
    calories: f64,
}

impl Simulated {
    fn new(metric: Metric) -> Self {
        Self {
            metric,
            heart_rate: 72.0,
            steps: 0,
            calories: 0.0,
        }
    }

    fn next<R: Rng>(&mut self, rng: &mut R) -> Reading {
        match self.metric {
            Metric::HeartRate => {
                self.heart_rate = (self.heart_rate + rng.gen_range(-3.0..3.0)).clamp(50.0, 180.0);
                Reading::HeartRate(self.heart_rate.round())
            }
            Metric::Steps => {
                self.steps += rng.gen_range(0..4);
                Reading::Steps(self.steps)
            }
            Metric::Calories => {
                self.calories += rng.gen_range(0.0..0.15);
                Reading::Calories((self.calories * 100.0).round() / 100.0)
            }
        }
    }
}
