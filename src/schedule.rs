use chrono::{DateTime, Datelike, Days, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;

use crate::error::AppError;

/// Source of wall-clock time for session decisions.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Regular trading session: Monday to Friday, `[open, close)` in exchange-local time.
///
/// Holidays are not modelled; only weekends are skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarketSchedule {
    tz: Tz,
    open: NaiveTime,
    close: NaiveTime,
}

impl MarketSchedule {
    pub fn new(tz: Tz, open: NaiveTime, close: NaiveTime) -> Result<Self, AppError> {
        if open >= close {
            return Err(AppError::Config(format!(
                "session open {} must be before close {}",
                open.format("%H:%M"),
                close.format("%H:%M")
            )));
        }
        Ok(Self { tz, open, close })
    }

    /// Parse a schedule from an IANA timezone name and `HH:MM` session times.
    pub fn parse(timezone: &str, open: &str, close: &str) -> Result<Self, AppError> {
        let tz: Tz = timezone
            .trim()
            .parse()
            .map_err(|_| AppError::Config(format!("unknown timezone '{}'", timezone)))?;
        Self::new(tz, parse_hhmm(open)?, parse_hhmm(close)?)
    }

    /// NSE/BSE cash session: 09:15 to 15:30 Asia/Kolkata.
    pub fn nse() -> Self {
        Self {
            tz: chrono_tz::Asia::Kolkata,
            open: NaiveTime::from_hms_opt(9, 15, 0).unwrap_or(NaiveTime::MIN),
            close: NaiveTime::from_hms_opt(15, 30, 0).unwrap_or(NaiveTime::MIN),
        }
    }

    /// Same session hours evaluated in another timezone.
    pub fn in_timezone(self, tz: Tz) -> Self {
        Self { tz, ..self }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    pub fn open_time(&self) -> NaiveTime {
        self.open
    }

    pub fn close_time(&self) -> NaiveTime {
        self.close
    }

    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.tz);
        is_trading_weekday(local.weekday()) && self.within_session(local.time())
    }

    /// `is_open` at the clock's current time.
    pub fn is_open_now(&self, clock: &dyn Clock) -> bool {
        self.is_open(clock.now())
    }

    /// The next instant at which `is_open` flips.
    ///
    /// Inside the session this is today's close; before today's open on a weekday it
    /// is today's open; otherwise the open of the next weekday.
    pub fn next_boundary(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let local = now.with_timezone(&self.tz);
        let date = local.date_naive();
        let time = local.time();
        let weekday = local.weekday();

        if is_trading_weekday(weekday) {
            if self.within_session(time) {
                return self.at_local(date, self.close);
            }
            if time < self.open {
                return self.at_local(date, self.open);
            }
        }

        let days_ahead = match weekday {
            Weekday::Fri => 3,
            Weekday::Sat => 2,
            _ => 1,
        };
        let next_date = date
            .checked_add_days(Days::new(days_ahead))
            .unwrap_or(NaiveDate::MAX);
        self.at_local(next_date, self.open)
    }

    fn within_session(&self, time: NaiveTime) -> bool {
        time >= self.open && time < self.close
    }

    fn at_local(&self, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
        resolve_local(self.tz, date.and_time(time))
    }
}

impl Default for MarketSchedule {
    fn default() -> Self {
        Self::nse()
    }
}

fn is_trading_weekday(weekday: Weekday) -> bool {
    !matches!(weekday, Weekday::Sat | Weekday::Sun)
}

fn parse_hhmm(s: &str) -> Result<NaiveTime, AppError> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M")
        .map_err(|e| AppError::Config(format!("invalid session time '{}': {}", s, e)))
}

fn resolve_local(tz: Tz, naive: NaiveDateTime) -> DateTime<Utc> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(t) => t.with_timezone(&Utc),
        LocalResult::Ambiguous(a, b) => a.min(b).with_timezone(&Utc),
        // DST gap: take the first valid wall time an hour later.
        LocalResult::None => tz
            .from_local_datetime(&(naive + chrono::Duration::hours(1)))
            .earliest()
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&naive)),
    }
}
