//! Decision table for the single-latest-report rule.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::report::ReportInterval;

/// The row currently flagged `latest` for a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentLatest {
    pub subject_id: Uuid,
    pub start_time: DateTime<Utc>,
}

/// Flag writes to apply after a report upsert, in field order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatestFlagPlan {
    /// Clear `latest` on every row of the series.
    pub unmark_all: bool,
    /// Clear `latest` on rows of other subjects for the written period only.
    pub unmark_current_latest: bool,
    /// Flag the written subject's row for the written period.
    pub mark_current_as_latest: bool,
}

impl LatestFlagPlan {
    /// `written` is the subject on the upserted row, `active` the directory's current subject
    /// for the same ref id.
    pub fn decide(
        written: Uuid,
        active: Uuid,
        current: Option<&CurrentLatest>,
        interval: ReportInterval,
        written_start: DateTime<Utc>,
    ) -> Self {
        let rotated = current.is_some_and(|c| c.subject_id != active);
        let mut plan = Self {
            unmark_all: false,
            unmark_current_latest: written == active && rotated,
            mark_current_as_latest: current.is_none() || (written == active && rotated),
        };

        if let Some(current) = current {
            if interval.is_periodic() {
                // a backfilled older week never displaces a newer latest row
                let newer_or_same = current.start_time <= written_start;
                plan.mark_current_as_latest = newer_or_same;
                plan.unmark_all = newer_or_same;
            }
        }
        plan
    }

    pub fn is_noop(&self) -> bool {
        !(self.unmark_all || self.unmark_current_latest || self.mark_current_as_latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn week(n: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap() + Duration::weeks(n)
    }

    #[test]
    fn first_report_becomes_latest() {
        let u = Uuid::new_v4();
        let plan = LatestFlagPlan::decide(u, u, None, ReportInterval::LastMonth, week(0));
        assert_eq!(
            plan,
            LatestFlagPlan {
                unmark_all: false,
                unmark_current_latest: false,
                mark_current_as_latest: true,
            }
        );
    }

    #[test]
    fn rewrite_of_current_latest_is_noop_for_non_periodic() {
        let u = Uuid::new_v4();
        let current = CurrentLatest {
            subject_id: u,
            start_time: week(0),
        };
        let plan =
            LatestFlagPlan::decide(u, u, Some(&current), ReportInterval::LastQuarter, week(0));
        assert!(plan.is_noop());
    }

    #[test]
    fn rotated_identity_unmarks_stale_subject() {
        let (old, new) = (Uuid::new_v4(), Uuid::new_v4());
        let current = CurrentLatest {
            subject_id: old,
            start_time: week(0),
        };
        let plan =
            LatestFlagPlan::decide(new, new, Some(&current), ReportInterval::PastYear, week(0));
        assert!(plan.unmark_current_latest);
        assert!(plan.mark_current_as_latest);
        assert!(!plan.unmark_all);
    }

    #[test]
    fn stale_subject_write_does_not_take_latest() {
        let (old, new) = (Uuid::new_v4(), Uuid::new_v4());
        let current = CurrentLatest {
            subject_id: new,
            start_time: week(0),
        };
        let plan =
            LatestFlagPlan::decide(old, new, Some(&current), ReportInterval::LastMonth, week(1));
        assert!(plan.is_noop());
    }

    #[test]
    fn periodic_late_arrival_is_not_marked() {
        let u = Uuid::new_v4();
        let current = CurrentLatest {
            subject_id: u,
            start_time: week(5),
        };
        let plan = LatestFlagPlan::decide(u, u, Some(&current), ReportInterval::LastWeek, week(4));
        assert!(plan.is_noop());
    }

    #[test]
    fn periodic_newer_week_clears_series_then_marks() {
        let u = Uuid::new_v4();
        let current = CurrentLatest {
            subject_id: u,
            start_time: week(4),
        };
        let plan =
            LatestFlagPlan::decide(u, u, Some(&current), ReportInterval::LastTwoWeeks, week(5));
        assert!(plan.unmark_all);
        assert!(plan.mark_current_as_latest);
    }
}
