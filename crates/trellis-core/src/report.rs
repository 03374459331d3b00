//! Periodic user / org / industry reports and their series keys.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Result, TrellisError};

/// Reporting window a report was computed over.
///
/// Declaration order is the ordering used for interval-keyed comparison buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportInterval {
    LastWeek,
    LastTwoWeeks,
    LastMonth,
    LastTwoMonths,
    LastThreeMonths,
    LastQuarter,
    LastTwoQuarters,
    PastYear,
    MonthJan,
    MonthFeb,
    MonthMar,
    MonthApr,
    MonthMay,
    MonthJun,
    MonthJul,
    MonthAug,
    MonthSep,
    MonthOct,
    MonthNov,
    MonthDec,
}

impl ReportInterval {
    pub const MONTHS: [ReportInterval; 12] = [
        Self::MonthJan,
        Self::MonthFeb,
        Self::MonthMar,
        Self::MonthApr,
        Self::MonthMay,
        Self::MonthJun,
        Self::MonthJul,
        Self::MonthAug,
        Self::MonthSep,
        Self::MonthOct,
        Self::MonthNov,
        Self::MonthDec,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::LastWeek => "LAST_WEEK",
            Self::LastTwoWeeks => "LAST_TWO_WEEKS",
            Self::LastMonth => "LAST_MONTH",
            Self::LastTwoMonths => "LAST_TWO_MONTHS",
            Self::LastThreeMonths => "LAST_THREE_MONTHS",
            Self::LastQuarter => "LAST_QUARTER",
            Self::LastTwoQuarters => "LAST_TWO_QUARTERS",
            Self::PastYear => "PAST_YEAR",
            Self::MonthJan => "MONTH_JAN",
            Self::MonthFeb => "MONTH_FEB",
            Self::MonthMar => "MONTH_MAR",
            Self::MonthApr => "MONTH_APR",
            Self::MonthMay => "MONTH_MAY",
            Self::MonthJun => "MONTH_JUN",
            Self::MonthJul => "MONTH_JUL",
            Self::MonthAug => "MONTH_AUG",
            Self::MonthSep => "MONTH_SEP",
            Self::MonthOct => "MONTH_OCT",
            Self::MonthNov => "MONTH_NOV",
            Self::MonthDec => "MONTH_DEC",
        }
    }

    /// Weekly intervals, where a late report for an older week must not displace a newer one.
    pub fn is_periodic(self) -> bool {
        matches!(self, Self::LastWeek | Self::LastTwoWeeks)
    }

    /// Calendar month (1-12) for the `MONTH_*` intervals.
    pub fn month_number(self) -> Option<u32> {
        Self::MONTHS
            .iter()
            .position(|m| *m == self)
            .map(|i| i as u32 + 1)
    }
}

impl fmt::Display for ReportInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReportInterval {
    type Err = TrellisError;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_ascii_uppercase();
        [
            Self::LastWeek,
            Self::LastTwoWeeks,
            Self::LastMonth,
            Self::LastTwoMonths,
            Self::LastThreeMonths,
            Self::LastQuarter,
            Self::LastTwoQuarters,
            Self::PastYear,
        ]
        .into_iter()
        .chain(Self::MONTHS)
        .find(|i| i.as_str() == upper)
        .ok_or_else(|| TrellisError::validation(format!("unknown report interval `{s}`")))
    }
}

/// Aggregation granularity requested by relative-score views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AggInterval {
    Week,
    Month,
}

impl AggInterval {
    pub fn report_intervals(self) -> Vec<ReportInterval> {
        match self {
            Self::Week => vec![ReportInterval::LastWeek],
            Self::Month => ReportInterval::MONTHS.to_vec(),
        }
    }
}

/// Week/year pair for periodic reports; `-1` for both when the report is not periodic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeriodKey {
    pub week_of_year: i32,
    pub year: i32,
}

impl PeriodKey {
    pub const NONE: PeriodKey = PeriodKey {
        week_of_year: -1,
        year: -1,
    };

    pub fn new(week_of_year: Option<i32>, year: Option<i32>) -> Self {
        Self {
            week_of_year: week_of_year.unwrap_or(-1),
            year: year.unwrap_or(-1),
        }
    }
}

/// The `(ref id, profile, interval)` triple owning one latest row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReportSeries {
    pub subject_ref_id: i32,
    pub profile_id: Uuid,
    pub interval: ReportInterval,
}

/// Everything the latest-flag coordinator needs to know about a freshly written report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportStamp {
    pub subject_id: Uuid,
    pub series: ReportSeries,
    pub period: PeriodKey,
    pub start_time: DateTime<Utc>,
}

fn check_window(
    subject_id: Uuid,
    profile_id: Uuid,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
) -> Result<()> {
    if subject_id.is_nil() {
        return Err(TrellisError::validation("subject id is required"));
    }
    if profile_id.is_nil() {
        return Err(TrellisError::validation("profile id is required"));
    }
    if start_time > end_time {
        return Err(TrellisError::validation(format!(
            "start time {start_time} is after end time {end_time}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub org_user_id: Uuid,
    pub org_user_ref_id: i32,
    pub profile_id: Uuid,
    pub interval: ReportInterval,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub week_of_year: Option<i32>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub score: Option<i32>,
    #[serde(default)]
    pub report: Value,
    #[serde(default)]
    pub latest: bool,
    #[serde(default)]
    pub incomplete: bool,
    #[serde(default)]
    pub missing_features: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl UserReport {
    pub fn validate(&self) -> Result<()> {
        check_window(
            self.org_user_id,
            self.profile_id,
            self.start_time,
            self.end_time,
        )
    }

    pub fn stamp(&self) -> ReportStamp {
        ReportStamp {
            subject_id: self.org_user_id,
            series: ReportSeries {
                subject_ref_id: self.org_user_ref_id,
                profile_id: self.profile_id,
                interval: self.interval,
            },
            period: PeriodKey::new(self.week_of_year, self.year),
            start_time: self.start_time,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrgReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub ou_id: Uuid,
    pub ou_ref_id: i32,
    pub profile_id: Uuid,
    pub interval: ReportInterval,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub week_of_year: Option<i32>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub score: Option<i32>,
    #[serde(default)]
    pub report: Value,
    #[serde(default)]
    pub latest: bool,
    #[serde(default)]
    pub missing_user_reports_count: i32,
    #[serde(default)]
    pub stale_user_reports_count: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl OrgReport {
    pub fn validate(&self) -> Result<()> {
        check_window(self.ou_id, self.profile_id, self.start_time, self.end_time)
    }

    pub fn stamp(&self) -> ReportStamp {
        ReportStamp {
            subject_id: self.ou_id,
            series: ReportSeries {
                subject_ref_id: self.ou_ref_id,
                profile_id: self.profile_id,
                interval: self.interval,
            },
            period: PeriodKey::new(self.week_of_year, self.year),
            start_time: self.start_time,
        }
    }
}

/// Tenant-independent benchmark report, one per interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndustryReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub interval: ReportInterval,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub score: Option<i32>,
    #[serde(default)]
    pub report: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn user_report() -> UserReport {
        UserReport {
            id: None,
            org_user_id: Uuid::new_v4(),
            org_user_ref_id: 42,
            profile_id: Uuid::new_v4(),
            interval: ReportInterval::LastWeek,
            start_time: Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap(),
            end_time: Utc.with_ymd_and_hms(2024, 3, 10, 23, 59, 59).unwrap(),
            week_of_year: Some(10),
            year: Some(2024),
            score: Some(71),
            report: Value::Null,
            latest: false,
            incomplete: false,
            missing_features: Vec::new(),
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn interval_wire_names_round_trip_through_parse() {
        assert_eq!(
            "last_two_weeks".parse::<ReportInterval>().unwrap(),
            ReportInterval::LastTwoWeeks
        );
        assert_eq!(
            serde_json::to_string(&ReportInterval::MonthSep).unwrap(),
            "\"MONTH_SEP\""
        );
        assert!("LAST_DECADE".parse::<ReportInterval>().is_err());
    }

    #[test]
    fn month_intervals_map_to_calendar_months() {
        assert_eq!(ReportInterval::MonthJan.month_number(), Some(1));
        assert_eq!(ReportInterval::MonthDec.month_number(), Some(12));
        assert_eq!(ReportInterval::LastQuarter.month_number(), None);
        assert_eq!(AggInterval::Month.report_intervals().len(), 12);
        assert_eq!(
            AggInterval::Week.report_intervals(),
            vec![ReportInterval::LastWeek]
        );
    }

    #[test]
    fn only_weekly_intervals_are_periodic() {
        assert!(ReportInterval::LastWeek.is_periodic());
        assert!(ReportInterval::LastTwoWeeks.is_periodic());
        assert!(!ReportInterval::LastMonth.is_periodic());
    }

    #[test]
    fn stamp_defaults_missing_period_to_sentinel() {
        let mut report = user_report();
        report.week_of_year = None;
        report.year = None;
        let stamp = report.stamp();
        assert_eq!(stamp.period, PeriodKey::NONE);
        assert_eq!(stamp.series.subject_ref_id, 42);
    }

    #[test]
    fn inverted_window_is_rejected() {
        let mut report = user_report();
        assert!(report.validate().is_ok());
        std::mem::swap(&mut report.start_time, &mut report.end_time);
        assert!(matches!(report.validate(), Err(TrellisError::Validation(_))));
    }
}
