//! Biometric samples, the recent-sample window and per-session statistics.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Default number of samples kept for display.
pub const DEFAULT_RECENT_WINDOW: usize = 5;

/// One biometric observation as captured by the phone.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    /// Phone-local capture time, ms since the Unix epoch.
    pub timestamp: u64,
    /// Instantaneous reading, beats per minute.
    pub heart_rate: f64,
    /// Cumulative since session start.
    pub steps: u64,
    /// Cumulative kcal since session start.
    pub calories: f64,
}

/// Last `capacity` samples, oldest evicted first. Display only.
#[derive(Debug, Clone)]
pub struct RecentSampleWindow {
    samples: VecDeque<Sample>,
    capacity: usize,
}

impl RecentSampleWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, sample: Sample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter()
    }

    pub fn latest(&self) -> Option<&Sample> {
        self.samples.back()
    }
}

impl Default for RecentSampleWindow {
    fn default() -> Self {
        Self::new(DEFAULT_RECENT_WINDOW)
    }
}

/// Summary of one finished session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatistics {
    /// Whole seconds from start to stop.
    pub duration: u64,
    pub total_measurements: usize,
    /// Rounded to one decimal.
    pub avg_heart_rate: f64,
    pub max_heart_rate: f64,
    pub min_heart_rate: f64,
    /// Last sample's cumulative counter.
    pub total_steps: u64,
    /// Last sample's cumulative counter.
    pub total_calories: f64,
}

impl SessionStatistics {
    /// Build statistics from a session's history. Returns `None` when no sample was accepted.
    pub fn from_history(history: &[Sample], started_at: Option<u64>, stopped_at: u64) -> Option<Self> {
        let last = history.last()?;
        let count = history.len();
        let sum: f64 = history.iter().map(|s| s.heart_rate).sum();
        let (min, max) = history.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), s| {
            (lo.min(s.heart_rate), hi.max(s.heart_rate))
        });
        let duration = started_at
            .map(|start| stopped_at.saturating_sub(start) / 1000)
            .unwrap_or(0);
        Some(Self {
            duration,
            total_measurements: count,
            avg_heart_rate: round_one_decimal(sum / count as f64),
            max_heart_rate: max,
            min_heart_rate: min,
            total_steps: last.steps,
            total_calories: last.calories,
        })
    }
}

fn round_one_decimal(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}
