//! Core domain model for trellis scoring profiles, OU assignments and periodic reports.

mod error;
pub mod latest;
pub mod ou;
pub mod profile;
pub mod relative;
pub mod report;

use serde::{Deserialize, Serialize};

pub use error::{Result, TrellisError};
pub use latest::{CurrentLatest, LatestFlagPlan};
pub use ou::{OuAssignment, OuAssignmentDiff};
pub use profile::{
    diff_sub_profiles, CriterionCondition, Feature, FeatureType, MatchingCriterion, ParentProfile,
    Section, SubProfile, SubProfileChange,
};
pub use relative::{BucketKey, ComparedReport, ComparisonSubject, IdType, RelativeScore};
pub use report::{
    AggInterval, IndustryReport, OrgReport, PeriodKey, ReportInterval, ReportSeries, ReportStamp,
    UserReport,
};

pub const CRATE_NAME: &str = "trellis-core";

/// Zero-based page request shared by every list operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub number: u32,
    pub size: u32,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            number: 0,
            size: 50,
        }
    }
}

impl Page {
    pub fn new(number: u32, size: u32) -> Self {
        Self {
            number,
            size: size.max(1),
        }
    }

    pub fn limit(&self) -> i64 {
        i64::from(self.size.max(1))
    }

    pub fn offset(&self) -> i64 {
        i64::from(self.number) * self.limit()
    }

    /// Total count derivable from the page alone.
    ///
    /// Returns `None` when the page came back full and the caller has to run a count query.
    pub fn known_total(&self, returned: usize) -> Option<i64> {
        let returned = returned as i64;
        if returned < self.limit() {
            Some(returned + self.offset())
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListResponse<T> {
    pub records: Vec<T>,
    pub total_count: i64,
}

impl<T> ListResponse<T> {
    pub fn of(records: Vec<T>, total_count: i64) -> Self {
        Self {
            records,
            total_count,
        }
    }
}
