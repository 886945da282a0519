//! Local time-of-day send windows.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::error::CampaignError;

/// When a campaign may send, in the campaign's local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendWindow {
    /// No time-of-day restriction.
    Unbounded,
    /// Sends allowed in `[start, end)` local time. `end < start` wraps past midnight.
    Windowed {
        start: NaiveTime,
        end: NaiveTime,
        tz: Tz,
    },
}

impl SendWindow {
    /// Build a window from the stored `"HH:MM"` strings and IANA zone name.
    ///
    /// A window only applies when all three parts are present.
    pub fn from_parts(
        timezone: Option<&str>,
        start: Option<&str>,
        end: Option<&str>,
    ) -> Result<Self, CampaignError> {
        fn non_empty(s: Option<&str>) -> Option<&str> {
            s.map(str::trim).filter(|s| !s.is_empty())
        }
        let (Some(tz), Some(start), Some(end)) =
            (non_empty(timezone), non_empty(start), non_empty(end))
        else {
            return Ok(Self::Unbounded);
        };

        let tz: Tz = tz
            .parse()
            .map_err(|_| CampaignError::InvalidWindow(format!("unknown timezone {tz}")))?;
        let start = parse_hhmm(start)?;
        let end = parse_hhmm(end)?;
        if start == end {
            return Err(CampaignError::InvalidWindow(
                "start and end time must differ".into(),
            ));
        }
        Ok(Self::Windowed { start, end, tz })
    }

    /// The `(timezone, start, end)` columns for persistence.
    pub fn to_parts(&self) -> (Option<String>, Option<String>, Option<String>) {
        match self {
            Self::Unbounded => (None, None, None),
            Self::Windowed { start, end, tz } => (
                Some(tz.name().to_string()),
                Some(start.format("%H:%M").to_string()),
                Some(end.format("%H:%M").to_string()),
            ),
        }
    }

    /// Whether `now` falls inside the window (minute precision).
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        match self {
            Self::Unbounded => true,
            Self::Windowed { start, end, tz } => {
                let local = now.with_timezone(tz);
                let t = NaiveTime::from_hms_opt(local.hour(), local.minute(), 0)
                    .unwrap_or(NaiveTime::MIN);
                if start < end {
                    *start <= t && t < *end
                } else {
                    t >= *start || t < *end
                }
            }
        }
    }

    /// The next instant the window opens, or `None` if it is open now.
    pub fn next_open(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let Self::Windowed { start, tz, .. } = self else {
            return None;
        };
        if self.contains(now) {
            return None;
        }

        let today = now.with_timezone(tz).date_naive();
        let opening = local_instant(tz, today, *start);
        if opening > now {
            return Some(opening);
        }
        let tomorrow = today.succ_opt().unwrap_or(today);
        Some(local_instant(tz, tomorrow, *start))
    }
}

fn parse_hhmm(s: &str) -> Result<NaiveTime, CampaignError> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .map_err(|_| CampaignError::InvalidWindow(format!("expected HH:MM, got {s:?}")))
}

/// Resolve a local wall-clock time to UTC, stepping over DST gaps.
fn local_instant(tz: &Tz, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    let naive = date.and_time(time);
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(naive + Duration::hours(1))).earliest())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| naive.and_utc())
}
