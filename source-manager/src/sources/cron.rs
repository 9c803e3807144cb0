use super::core::SourceCore;
use super::TaskSlot;
use crate::source::EventSource;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Local, SecondsFormat, Utc};
use croner::Cron;
use serde::Deserialize;
use serde_json::{Map, Value};
use sourcebus::{SourceConfig, SourceError};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info};

/// How ticks are spaced.
#[derive(Debug, Clone, PartialEq)]
pub enum Schedule {
    /// Fixed period between ticks
    Interval(Duration),
    /// Five-field cron expression in local time
    Cron(String),
}

impl Schedule {
    /// Five whitespace-separated fields select cron mode; anything else is a
    /// duration string such as `"5s"` or `"1h 30m"`.
    pub fn parse(schedule: &str) -> Result<Self, SourceError> {
        let schedule = schedule.trim();
        if schedule.split_whitespace().count() == 5 {
            return Ok(Schedule::Cron(schedule.to_string()));
        }

        let period = humantime::parse_duration(schedule).map_err(|e| SourceError::InvalidOption {
            option: "schedule".to_string(),
            reason: e.to_string(),
        })?;
        if period.is_zero() {
            return Err(SourceError::InvalidOption {
                option: "schedule".to_string(),
                reason: "interval must be greater than zero".to_string(),
            });
        }
        Ok(Schedule::Interval(period))
    }
}

#[derive(Debug, Default, Deserialize)]
struct CronOptions {
    schedule: Option<String>,
    payload: Option<Value>,
    #[serde(default)]
    immediate: bool,
}

/// Emits `"tick"` events on a fixed interval or a cron expression.
///
/// There is no connection: `connect()` marks the source connected at once
/// and starts the timer.
pub struct CronSource {
    core: Arc<SourceCore>,
    schedule: Schedule,
    payload: Map<String, Value>,
    immediate: bool,
    ticker: TaskSlot,
}

impl CronSource {
    pub fn new(config: SourceConfig) -> Result<Self, SourceError> {
        let options: CronOptions = config.decode_options()?;
        let schedule = Schedule::parse(config.require("schedule", &options.schedule)?)?;

        let payload = match options.payload {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map,
            Some(_) => {
                return Err(SourceError::InvalidOption {
                    option: "payload".to_string(),
                    reason: "must be an object".to_string(),
                })
            }
        };

        Ok(Self {
            core: Arc::new(SourceCore::new(config)),
            schedule,
            payload,
            immediate: options.immediate,
            ticker: TaskSlot::default(),
        })
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    fn tick(&self, scheduled_at: DateTime<Utc>) {
        let mut data = self.payload.clone();
        data.insert(
            "scheduledAt".to_string(),
            Value::String(scheduled_at.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        debug!(source_id = %self.core.id(), "Tick");
        self.core.emit_event("tick", data, None);
    }

    async fn run_interval(self: Arc<Self>, period: Duration) {
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            self.tick(Utc::now());
        }
    }

    /// Sleeps until the next occurrence computed from the wall clock, fires,
    /// and repeats.
    async fn run_cron(self: Arc<Self>, expression: String) {
        let cron = match Cron::new(&expression).parse() {
            Ok(cron) => cron,
            Err(e) => {
                self.core
                    .emit_error(format!("invalid cron expression '{}': {}", expression, e));
                return;
            }
        };

        let mut last_fired: Option<DateTime<Local>> = None;
        loop {
            let now = Local::now();
            let from = match last_fired {
                Some(last) if last > now => last,
                _ => now,
            };
            let next = match cron.find_next_occurrence(&from, false) {
                Ok(next) => next,
                Err(e) => {
                    self.core
                        .emit_error(format!("no next occurrence for '{}': {}", expression, e));
                    return;
                }
            };

            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(wait).await;
            last_fired = Some(next);
            self.tick(next.with_timezone(&Utc));
        }
    }
}

#[async_trait]
impl EventSource for CronSource {
    fn core(&self) -> &SourceCore {
        &self.core
    }

    async fn connect(self: Arc<Self>) -> Result<()> {
        self.core.mark_connecting()?;
        self.core.mark_connected();
        info!(source_id = %self.core.id(), schedule = ?self.schedule, "Schedule started");

        if self.immediate {
            self.tick(Utc::now());
        }

        let task = match self.schedule.clone() {
            Schedule::Interval(period) => tokio::spawn(Arc::clone(&self).run_interval(period)),
            Schedule::Cron(expression) => tokio::spawn(Arc::clone(&self).run_cron(expression)),
        };
        self.ticker.set(task);
        Ok(())
    }

    async fn disconnect(&self) {
        self.ticker.abort();
    }
}
