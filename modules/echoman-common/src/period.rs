use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::EchomanError;

/// All period math runs in China Standard Time regardless of host timezone.
pub const CN_TZ: Tz = chrono_tz::Asia::Shanghai;

/// Current wall-clock instant in Asia/Shanghai.
pub fn now_cn() -> DateTime<Tz> {
    Utc::now().with_timezone(&CN_TZ)
}

/// One of the four daily collection windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Period {
    Morn,
    Am,
    Pm,
    Eve,
}

impl Period {
    /// Map an Asia/Shanghai hour to its period.
    pub fn from_hour(hour: u32) -> Self {
        match hour {
            h if h < 10 => Period::Morn,
            h if h < 14 => Period::Am,
            h if h < 20 => Period::Pm,
            _ => Period::Eve,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Period::Morn => "MORN",
            Period::Am => "AM",
            Period::Pm => "PM",
            Period::Eve => "EVE",
        }
    }
}

impl FromStr for Period {
    type Err = EchomanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MORN" => Ok(Period::Morn),
            "AM" => Ok(Period::Am),
            "PM" => Ok(Period::Pm),
            "EVE" => Ok(Period::Eve),
            other => Err(EchomanError::Validation(format!(
                "unknown period label: {other}"
            ))),
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The composite `YYYY-MM-DD_<MORN|AM|PM|EVE>` key that scopes normalization,
/// stage one, and stage two. Date is resolved in Asia/Shanghai.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeriodKey {
    pub date: NaiveDate,
    pub period: Period,
}

impl PeriodKey {
    pub fn new(date: NaiveDate, period: Period) -> Self {
        Self { date, period }
    }

    /// Label the period containing a UTC instant.
    pub fn for_instant(instant: DateTime<Utc>) -> Self {
        let local = instant.with_timezone(&CN_TZ);
        Self {
            date: local.date_naive(),
            period: Period::from_hour(local.hour()),
        }
    }

    /// Label the current period.
    pub fn current() -> Self {
        Self::for_instant(Utc::now())
    }

    /// The UTC instant of midnight (Asia/Shanghai) on this key's date.
    /// Used to anchor period-scoped date arithmetic.
    pub fn date_start_utc(&self) -> DateTime<Utc> {
        CN_TZ
            .from_local_datetime(&self.date.and_hms_opt(0, 0, 0).expect("midnight is valid"))
            .single()
            .expect("Asia/Shanghai has no DST gaps at midnight")
            .with_timezone(&Utc)
    }
}

impl FromStr for PeriodKey {
    type Err = EchomanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (date_part, period_part) = s.split_once('_').ok_or_else(|| {
            EchomanError::Validation(format!("period key missing '_' separator: {s}"))
        })?;
        let date = NaiveDate::parse_from_str(date_part, "%Y-%m-%d").map_err(|e| {
            EchomanError::Validation(format!("bad date in period key {s}: {e}"))
        })?;
        let period = period_part.parse()?;
        Ok(Self { date, period })
    }
}

impl fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.date.format("%Y-%m-%d"), self.period)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn hour_bands() {
        assert_eq!(Period::from_hour(0), Period::Morn);
        assert_eq!(Period::from_hour(9), Period::Morn);
        assert_eq!(Period::from_hour(10), Period::Am);
        assert_eq!(Period::from_hour(13), Period::Am);
        assert_eq!(Period::from_hour(14), Period::Pm);
        assert_eq!(Period::from_hour(19), Period::Pm);
        assert_eq!(Period::from_hour(20), Period::Eve);
        assert_eq!(Period::from_hour(23), Period::Eve);
    }

    #[test]
    fn key_formats_and_parses() {
        let key = PeriodKey::new(
            NaiveDate::from_ymd_opt(2025, 11, 7).unwrap(),
            Period::Am,
        );
        assert_eq!(key.to_string(), "2025-11-07_AM");
        assert_eq!("2025-11-07_AM".parse::<PeriodKey>().unwrap(), key);
    }

    #[test]
    fn key_rejects_garbage() {
        assert!("2025-11-07".parse::<PeriodKey>().is_err());
        assert!("2025-11-07_NIGHT".parse::<PeriodKey>().is_err());
        assert!("yesterday_AM".parse::<PeriodKey>().is_err());
    }

    #[test]
    fn instant_resolves_in_shanghai() {
        // 2025-11-07 01:30 UTC is 09:30 in Shanghai — MORN of the 7th.
        let t = Utc.with_ymd_and_hms(2025, 11, 7, 1, 30, 0).unwrap();
        let key = PeriodKey::for_instant(t);
        assert_eq!(key.to_string(), "2025-11-07_MORN");

        // 2025-11-07 18:00 UTC is 02:00 of the 8th in Shanghai.
        let t = Utc.with_ymd_and_hms(2025, 11, 7, 18, 0, 0).unwrap();
        let key = PeriodKey::for_instant(t);
        assert_eq!(key.to_string(), "2025-11-08_MORN");
    }

    #[test]
    fn eve_spans_to_midnight() {
        // 14:30 UTC = 22:30 Shanghai, still EVE of the same date.
        let t = Utc.with_ymd_and_hms(2025, 11, 7, 14, 30, 0).unwrap();
        assert_eq!(PeriodKey::for_instant(t).to_string(), "2025-11-07_EVE");
    }
}
