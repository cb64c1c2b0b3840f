//! Run report: an append-only event timeline with counters kept in step.

use crate::error::ChaosError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

/// Serde adapter storing a [`Duration`] as whole milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Start,
    Success,
    Failure,
    Error,
    Cleanup,
    Info,
}

impl EventType {
    /// Whether events of this type count as a step in [`Stats`].
    pub fn is_step(self) -> bool {
        !matches!(self, Self::Start | Self::Info)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
            Self::Error => write!(f, "error"),
            Self::Cleanup => write!(f, "cleanup"),
            Self::Info => write!(f, "info"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub step: String,
    pub message: String,
    #[serde(rename = "duration_ms", with = "duration_ms")]
    pub duration: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<BTreeMap<String, Value>>,
}

impl Event {
    pub fn new(event_type: EventType, step: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            step: step.into(),
            message: message.into(),
            duration: Duration::ZERO,
            details: None,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_details(mut self, details: BTreeMap<String, Value>) -> Self {
        self.details = (!details.is_empty()).then_some(details);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub total_steps: u32,
    pub success_steps: u32,
    pub failed_steps: u32,
    pub cleanup_steps: u32,
}

impl Stats {
    fn record(&mut self, event_type: EventType) {
        if !event_type.is_step() {
            return;
        }
        self.total_steps += 1;
        match event_type {
            EventType::Success => self.success_steps += 1,
            EventType::Failure | EventType::Error => self.failed_steps += 1,
            EventType::Cleanup => self.cleanup_steps += 1,
            EventType::Start | EventType::Info => {}
        }
    }
}

/// Outcome of one scenario run.
///
/// Events can only be appended through [`Report::add_event`], which updates
/// [`Stats`] in the same call. A deserialized report rebuilds its stats by
/// replaying the saved events rather than trusting the stored counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "SavedReport")]
pub struct Report {
    pub scenario: String,
    pub description: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(rename = "duration_ms", with = "duration_ms")]
    pub duration: Duration,
    pub success: bool,
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<ChaosError>,
    events: Vec<Event>,
    stats: Stats,
    #[serde(skip)]
    started: Instant,
}

fn serialize_error<S: Serializer>(error: &Option<ChaosError>, s: S) -> Result<S::Ok, S::Error> {
    match error {
        Some(e) => s.serialize_some(&e.to_string()),
        None => s.serialize_none(),
    }
}

/// On-disk shape of a [`Report`]; `stats` is ignored if present.
#[derive(Deserialize)]
struct SavedReport {
    scenario: String,
    #[serde(default)]
    description: String,
    start_time: DateTime<Utc>,
    #[serde(default)]
    end_time: Option<DateTime<Utc>>,
    #[serde(rename = "duration_ms", with = "duration_ms")]
    duration: Duration,
    success: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    events: Vec<Event>,
}

impl From<SavedReport> for Report {
    fn from(saved: SavedReport) -> Self {
        let mut report = Report::new(saved.scenario, saved.description);
        report.start_time = saved.start_time;
        report.end_time = saved.end_time;
        report.duration = saved.duration;
        report.success = saved.success;
        report.error = saved.error.as_deref().map(ChaosError::from_message);
        for event in saved.events {
            report.add_event(event);
        }
        report
    }
}

impl Report {
    pub fn new(scenario: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            scenario: scenario.into(),
            description: description.into(),
            start_time: Utc::now(),
            end_time: None,
            duration: Duration::ZERO,
            success: false,
            error: None,
            events: Vec::new(),
            stats: Stats::default(),
            started: Instant::now(),
        }
    }

    pub fn add_event(&mut self, event: Event) {
        self.stats.record(event.event_type);
        self.events.push(event);
    }

    /// Stamp the end time and overall outcome.
    pub fn finish(&mut self, success: bool, error: Option<ChaosError>) {
        self.end_time = Some(Utc::now());
        self.duration = self.started.elapsed();
        self.success = success;
        self.error = error;
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn events_of(&self, event_type: EventType) -> impl Iterator<Item = &Event> {
        self.events.iter().filter(move |e| e.event_type == event_type)
    }
}
