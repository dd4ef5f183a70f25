use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Cadence is how often an alert is evaluated and may notify its owner.
/// Variants are ordered from most to least frequent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    RealTime,
    Daily,
    Weekly,
    Monthly,
}

impl std::fmt::Display for Cadence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl Cadence {
    pub fn name(&self) -> &'static str {
        match self {
            Cadence::RealTime => "real_time",
            Cadence::Daily => "daily",
            Cadence::Weekly => "weekly",
            Cadence::Monthly => "monthly",
        }
    }

    pub fn all() -> &'static [Cadence] {
        &[
            Cadence::RealTime,
            Cadence::Daily,
            Cadence::Weekly,
            Cadence::Monthly,
        ]
    }

    pub fn from_str(name: &str) -> Option<Cadence> {
        // Short codes submitted by the alert form.
        let name = match name.trim() {
            "rt" => "real_time",
            "dly" => "daily",
            "wly" => "weekly",
            "mly" => "monthly",
            other => other,
        };
        Cadence::all()
            .iter()
            .find(|c| name.eq_ignore_ascii_case(c.name()))
            .copied()
    }

    /// Is this cadence gated behind the real-time access policy?
    pub fn is_gated(&self) -> bool {
        matches!(self, Cadence::RealTime)
    }
}

/// Checkpoints are the calendar boundaries at which periodic cadences become
/// due. Every daily alert becomes due at the same daily checkpoint, rather
/// than a day after its own last run, so that alerts sharing a cadence
/// notify together.
///
/// - Daily: every day at `hour`:00 UTC.
/// - Weekly: every Monday at `hour`:00 UTC.
/// - Monthly: the first of every month at `hour`:00 UTC.
///
/// Real-time alerts have no checkpoint and are due on every scheduler pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoints {
    hour: u32,
}

impl Default for Checkpoints {
    fn default() -> Self {
        Self { hour: 0 }
    }
}

impl Checkpoints {
    /// Build Checkpoints which fall at the given UTC hour of day (wrapped to 0-23).
    pub fn at_hour(hour: u32) -> Self {
        Self { hour: hour % 24 }
    }

    pub fn hour(&self) -> u32 {
        self.hour
    }

    /// Returns the most recent checkpoint of `cadence` which is at or before `now`,
    /// or None for real-time cadences.
    pub fn latest(&self, cadence: Cadence, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let today = now.date_naive();

        let (current, previous) = match cadence {
            Cadence::RealTime => return None,
            Cadence::Daily => (today, today - Duration::days(1)),
            Cadence::Weekly => {
                let monday = today - Duration::days(today.weekday().num_days_from_monday() as i64);
                (monday, monday - Duration::days(7))
            }
            Cadence::Monthly => {
                let first = NaiveDate::from_ymd_opt(today.year(), today.month(), 1)?;
                let prior = if today.month() == 1 {
                    NaiveDate::from_ymd_opt(today.year() - 1, 12, 1)?
                } else {
                    NaiveDate::from_ymd_opt(today.year(), today.month() - 1, 1)?
                };
                (first, prior)
            }
        };

        let current = self.on(current)?;
        if current <= now {
            Some(current)
        } else {
            self.on(previous)
        }
    }

    /// Is an alert of `cadence`, last evaluated at `last_run`, due at `now`?
    pub fn is_due(&self, cadence: Cadence, last_run: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self.latest(cadence, now) {
            None => true,
            Some(checkpoint) => last_run < checkpoint,
        }
    }

    fn on(&self, date: NaiveDate) -> Option<DateTime<Utc>> {
        date.and_hms_opt(self.hour, 0, 0)
            .map(|naive| Utc.from_utc_datetime(&naive))
    }
}
