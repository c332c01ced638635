//! Time-of-day trigger for the recurring poll check.
//!
//! The loop wakes every 30 seconds and compares the local wall clock
//! against the configured days and time; the check itself is idempotent,
//! so the trigger only has to be roughly once per scheduled day.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use tokio::sync::watch;

use crate::config::PollConfig;
use crate::llm::TextGenerator;
use crate::poll::PollManager;
use crate::signal::Outbound;

const TICK: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ScheduleSpec {
    days: Vec<Weekday>,
    time: NaiveTime,
}

fn weekday_from_index(index: u8) -> Option<Weekday> {
    match index {
        0 => Some(Weekday::Mon),
        1 => Some(Weekday::Tue),
        2 => Some(Weekday::Wed),
        3 => Some(Weekday::Thu),
        4 => Some(Weekday::Fri),
        5 => Some(Weekday::Sat),
        6 => Some(Weekday::Sun),
        _ => None,
    }
}

impl ScheduleSpec {
    /// Lenient parse: out-of-range days are dropped with a warning, an
    /// unparseable time falls back to 12:30.
    pub fn from_config(config: &PollConfig) -> Self {
        let days: Vec<Weekday> = config
            .schedule_days
            .iter()
            .filter_map(|&day| {
                let weekday = weekday_from_index(day);
                if weekday.is_none() {
                    tracing::warn!("Ignoring invalid schedule day {} (want 0-6)", day);
                }
                weekday
            })
            .collect();

        let time = NaiveTime::parse_from_str(&config.schedule_time, "%H:%M").unwrap_or_else(|e| {
            tracing::warn!(
                "Invalid schedule_time {:?} ({}), falling back to 12:30",
                config.schedule_time,
                e
            );
            NaiveTime::from_hms_opt(12, 30, 0).unwrap_or_default()
        });

        for day in &days {
            tracing::info!("Scheduled poll check: {} at {}", day, time.format("%H:%M"));
        }

        Self { days, time }
    }

    /// Whether the check should fire now: a scheduled weekday, past the
    /// configured time, and not already run today.
    pub fn is_due(&self, now: NaiveDateTime, last_run: Option<NaiveDate>) -> bool {
        if last_run == Some(now.date()) {
            return false;
        }
        self.days.contains(&now.weekday()) && now.time() >= self.time
    }
}

/// Scheduler loop. Owns the poll manager (and with it the ledger file)
/// exclusively. Shutdown is only observed between checks, so a running
/// `check_and_post` always finishes its batch and its ledger save.
pub async fn run_poll_scheduler(
    mut manager: PollManager,
    spec: ScheduleSpec,
    check_on_startup: bool,
    outbound: Arc<dyn Outbound>,
    generator: Arc<dyn TextGenerator>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut last_run: Option<NaiveDate> = None;

    if check_on_startup {
        tracing::info!("Running initial poll check...");
        let today = Local::now().date_naive();
        manager
            .check_and_post(today, outbound.as_ref(), generator.as_ref())
            .await;
        // The startup check does not latch `last_run`: if the daemon was
        // still coming up and nothing got posted, the scheduled run the
        // same day retries the missing weeks.
    }

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(TICK) => {}
        }
        let now = Local::now().naive_local();
        if spec.is_due(now, last_run) {
            manager
                .check_and_post(now.date(), outbound.as_ref(), generator.as_ref())
                .await;
            last_run = Some(now.date());
        }
    }
    tracing::info!("Poll scheduler stopped");
}
