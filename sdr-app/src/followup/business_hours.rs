//! Confines follow-up send times to the configured business window.

use crate::config::BusinessHoursConfig;
use anyhow::{Result, anyhow};
use chrono::{
    DateTime, Datelike, Duration as ChronoDuration, FixedOffset, NaiveDate, NaiveTime, TimeZone,
    Utc, Weekday,
};
use serde::{Deserialize, Serialize};

/// How far out a follow-up was requested. Decides which canonical time of
/// day it lands on when it has to be moved into business hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayCategory {
    /// Up to 4 hours: next opening.
    Quick,
    /// Up to 24 hours: mid-morning.
    Standard,
    /// Longer: midday.
    Long,
}

impl DelayCategory {
    pub fn from_delay(delay: ChronoDuration) -> Self {
        if delay <= ChronoDuration::hours(4) {
            Self::Quick
        } else if delay <= ChronoDuration::hours(24) {
            Self::Standard
        } else {
            Self::Long
        }
    }
}

#[derive(Debug, Clone)]
pub struct BusinessHours {
    start: NaiveTime,
    end: NaiveTime,
    offset: FixedOffset,
    weekend_support: bool,
    mid_morning: NaiveTime,
    midday: NaiveTime,
}

impl BusinessHours {
    pub fn from_config(cfg: &BusinessHoursConfig) -> Result<Self> {
        let start = parse_time("business_hours.start", &cfg.start)?;
        let end = parse_time("business_hours.end", &cfg.end)?;
        if start >= end {
            return Err(anyhow!(
                "business_hours.start ({}) must be before business_hours.end ({})",
                cfg.start,
                cfg.end
            ));
        }
        let offset = parse_utc_offset(&cfg.utc_offset)?;
        let mid_morning = parse_time("business_hours.mid_morning", &cfg.mid_morning)?;
        let midday = parse_time("business_hours.midday", &cfg.midday)?;
        Ok(Self {
            start,
            end,
            offset,
            weekend_support: cfg.weekend_support,
            mid_morning: clamp_into(mid_morning, start, end),
            midday: clamp_into(midday, start, end),
        })
    }

    fn is_business_day(&self, date: NaiveDate) -> bool {
        self.weekend_support || !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
    }

    pub fn is_open(&self, at: DateTime<Utc>) -> bool {
        let local = at.with_timezone(&self.offset);
        let time = local.time();
        self.is_business_day(local.date_naive()) && time >= self.start && time < self.end
    }

    fn canonical_time(&self, category: DelayCategory) -> NaiveTime {
        match category {
            DelayCategory::Quick => self.start,
            DelayCategory::Standard => self.mid_morning,
            DelayCategory::Long => self.midday,
        }
    }

    /// Returns `scheduled_at` unchanged when it is inside business hours,
    /// otherwise the canonical time for `category` on the next business day
    /// (today, when still before opening).
    pub fn adjust(&self, scheduled_at: DateTime<Utc>, category: DelayCategory) -> DateTime<Utc> {
        if self.is_open(scheduled_at) {
            return scheduled_at;
        }
        let local = scheduled_at.with_timezone(&self.offset);
        let today = local.date_naive();
        let mut day = if self.is_business_day(today) && local.time() < self.start {
            today
        } else {
            next_day(today)
        };
        while !self.is_business_day(day) {
            day = next_day(day);
        }
        let naive = day.and_time(self.canonical_time(category));
        match self.offset.from_local_datetime(&naive).single() {
            Some(adjusted) => adjusted.with_timezone(&Utc),
            None => scheduled_at,
        }
    }
}

fn next_day(date: NaiveDate) -> NaiveDate {
    date.succ_opt().unwrap_or(date)
}

fn clamp_into(time: NaiveTime, start: NaiveTime, end: NaiveTime) -> NaiveTime {
    if time < start || time >= end {
        return start;
    }
    time
}

fn parse_time(field: &str, raw: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .map_err(|e| anyhow!("{field} must be HH:MM (got {raw:?}): {e}"))
}

fn parse_utc_offset(raw: &str) -> Result<FixedOffset> {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("z") || trimmed.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0).ok_or_else(|| anyhow!("invalid utc offset"));
    }
    let (sign, rest) = match trimmed.chars().next() {
        Some('+') => (1, &trimmed[1..]),
        Some('-') => (-1, &trimmed[1..]),
        _ => {
            return Err(anyhow!(
                "business_hours.utc_offset must look like -03:00 (got {raw:?})"
            ));
        }
    };
    let (hours, minutes) = rest.split_once(':').unwrap_or((rest, "0"));
    let hours: i32 = hours
        .parse()
        .map_err(|_| anyhow!("invalid utc offset hours in {raw:?}"))?;
    let minutes: i32 = minutes
        .parse()
        .map_err(|_| anyhow!("invalid utc offset minutes in {raw:?}"))?;
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .ok_or_else(|| anyhow!("utc offset out of range: {raw:?}"))
}
