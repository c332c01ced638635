//! Weekly poll creation with an idempotent week-keyed ledger.
//!
//! The ledger file is a flat JSON object mapping `"YYYY-WW"` (ISO year
//! and zero-padded ISO week) to the date the poll was posted. A key in
//! the ledger means that week is covered; losing the file causes a
//! duplicate poll, never corruption.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Datelike, Duration, NaiveDate, Weekday};

use crate::config::PollConfig;
use crate::llm::TextGenerator;
use crate::signal::Outbound;

const WEEKDAYS: [&str; 7] = [
    "Montag",
    "Dienstag",
    "Mittwoch",
    "Donnerstag",
    "Freitag",
    "Samstag",
    "Sonntag",
];

/// Ledger key for the ISO week containing `date`.
pub fn week_key_of(date: NaiveDate) -> String {
    let iso = date.iso_week();
    week_key(iso.year(), iso.week())
}

pub fn week_key(year: i32, week: u32) -> String {
    format!("{}-{:02}", year, week)
}

/// Monday of the given ISO week. chrono's ISO week calendar matches the
/// ISO-8601 definition (week 1 contains January 4th).
pub fn monday_of_week(year: i32, week: u32) -> Option<NaiveDate> {
    NaiveDate::from_isoywd_opt(year, week, Weekday::Mon)
}

/// Poll option label: "DD.MM.YYYY Wochentag".
fn day_label(date: NaiveDate) -> String {
    let weekday = WEEKDAYS[date.weekday().num_days_from_monday() as usize];
    format!("{} {}", date.format("%d.%m.%Y"), weekday)
}

// ─── Ledger ──────────────────────────────────────────────────────────────────

pub struct PollLedger {
    path: PathBuf,
    weeks: BTreeMap<String, String>,
}

impl PollLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            weeks: BTreeMap::new(),
        }
    }

    /// Load the posted-weeks map from disk, starting empty on any
    /// read or parse failure.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let mut ledger = Self::new(path);
        match read_ledger(&ledger.path) {
            Ok(Some(weeks)) => {
                tracing::info!("Loaded poll ledger with {} posted weeks", weeks.len());
                ledger.weeks = weeks;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("Failed to load poll ledger from {:?}: {}", ledger.path, e);
            }
        }
        ledger
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create ledger directory {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(&self.weeks).context("serialize poll ledger")?;
        fs::write(&self.path, json)
            .with_context(|| format!("write poll ledger {}", self.path.display()))?;
        Ok(())
    }

    pub fn contains(&self, year: i32, week: u32) -> bool {
        self.weeks.contains_key(&week_key(year, week))
    }

    fn insert(&mut self, year: i32, week: u32, posted_on: NaiveDate) {
        self.weeks
            .insert(week_key(year, week), posted_on.format("%Y-%m-%d").to_string());
    }

    /// ISO (year, week) of `today` and the next `lookahead - 1` weeks
    /// that have no ledger entry yet, in chronological order.
    pub fn weeks_needing(&self, today: NaiveDate, lookahead: u32) -> Vec<(i32, u32)> {
        (0..lookahead)
            .map(|i| {
                let iso = (today + Duration::weeks(i as i64)).iso_week();
                (iso.year(), iso.week())
            })
            .filter(|&(year, week)| !self.contains(year, week))
            .collect()
    }
}

fn read_ledger(path: &Path) -> Result<Option<BTreeMap<String, String>>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let weeks = serde_json::from_str(&contents).context("parse poll ledger")?;
    Ok(Some(weeks))
}

// ─── Manager ─────────────────────────────────────────────────────────────────

/// Drives poll creation against the ledger. Owned exclusively by the
/// scheduler task.
pub struct PollManager {
    ledger: PollLedger,
    group_id: String,
    weeks_ahead: u32,
    post_count: u32,
    announcement_prompt: Option<String>,
}

impl PollManager {
    pub fn new(ledger: PollLedger, group_id: impl Into<String>, config: &PollConfig) -> Self {
        Self {
            ledger,
            group_id: group_id.into(),
            weeks_ahead: config.weeks_ahead,
            post_count: config.post_count,
            announcement_prompt: config.announcement_prompt.clone(),
        }
    }

    /// Post a poll for one ISO week: seven day options Monday..Sunday,
    /// titled "KW{week}".
    pub async fn post_week(&self, year: i32, week: u32, outbound: &dyn Outbound) -> Result<()> {
        let monday = monday_of_week(year, week)
            .with_context(|| format!("invalid ISO week {}-{:02}", year, week))?;
        let options: Vec<String> = (0..7)
            .map(|i| day_label(monday + Duration::days(i)))
            .collect();
        let question = format!("KW{}", week);

        outbound
            .create_poll(&self.group_id, &question, &options)
            .await
            .with_context(|| format!("post poll for KW{} ({})", week, year))?;
        tracing::info!("Posted poll for KW{} ({})", week, year);
        Ok(())
    }

    /// Catch-up routine: post polls for the first `post_count` weeks of
    /// the lookahead window that are still missing from the ledger, then
    /// persist the ledger once for the whole batch. Failed posts are not
    /// recorded and get retried on the next run; the announcement only
    /// goes out when at least one poll actually landed, so a run against
    /// a dead daemon stays silent. Calling this again with no wall-clock
    /// advance issues no further daemon calls.
    pub async fn check_and_post(
        &mut self,
        today: NaiveDate,
        outbound: &dyn Outbound,
        generator: &dyn TextGenerator,
    ) -> Vec<String> {
        let missing = self.ledger.weeks_needing(today, self.weeks_ahead);

        if missing.is_empty() {
            tracing::info!("Next {} weeks already covered", self.weeks_ahead);
            return Vec::new();
        }

        tracing::info!(
            "Need to post: {}",
            missing
                .iter()
                .map(|(y, w)| format!("KW{} ({})", w, y))
                .collect::<Vec<_>>()
                .join(", ")
        );

        let mut posted = Vec::new();
        for &(year, week) in missing.iter().take(self.post_count as usize) {
            match self.post_week(year, week, outbound).await {
                Ok(()) => {
                    self.ledger.insert(year, week, today);
                    posted.push(format!("KW{}", week));
                }
                Err(e) => {
                    tracing::error!("Failed to post poll for KW{} ({}): {}", week, year, e);
                }
            }
        }

        if !posted.is_empty() {
            if let Err(e) = self.ledger.save() {
                tracing::error!("Failed to save poll ledger: {}", e);
            }
            tracing::info!("Successfully posted: {}", posted.join(", "));
            self.announce(outbound, generator).await;
        }

        posted
    }

    /// One announcement message per batch that actually posted a poll.
    /// Best-effort: generation or send failures are logged and ignored.
    async fn announce(&self, outbound: &dyn Outbound, generator: &dyn TextGenerator) {
        let Some(prompt) = self.announcement_prompt.as_deref() else {
            return;
        };

        match generator.generate(prompt, &[]).await {
            Ok(text) => {
                if let Err(e) = outbound.send_message(&self.group_id, &text, None).await {
                    tracing::warn!("Failed to send poll announcement: {}", e);
                }
            }
            Err(e) => {
                tracing::warn!("Poll announcement generation failed: {}", e);
            }
        }
    }
}
