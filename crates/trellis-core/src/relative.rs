//! Comparison subjects and bucketed relative scores.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::report::{IndustryReport, OrgReport, ReportInterval, UserReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdType {
    OuUserIds,
    IntegrationUserIds,
    OrgIds,
}

/// One population to compare: a single user (by org-user or integration-user id) or OUs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComparisonSubject {
    pub id_type: IdType,
    #[serde(default)]
    pub id: Option<Uuid>,
    #[serde(default)]
    pub org_ids: Vec<Uuid>,
}

impl ComparisonSubject {
    pub fn org(ou_id: Uuid) -> Self {
        Self {
            id_type: IdType::OrgIds,
            id: None,
            org_ids: vec![ou_id],
        }
    }

    pub fn user(id_type: IdType, id: Uuid) -> Self {
        Self {
            id_type,
            id: Some(id),
            org_ids: Vec::new(),
        }
    }

    /// OU ids named by an `ORG_IDS` subject, `id` first.
    pub fn ou_ids(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.id.into_iter().collect();
        for ou in &self.org_ids {
            if !ids.contains(ou) {
                ids.push(*ou);
            }
        }
        ids
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ComparedReport {
    Industry(IndustryReport),
    User(UserReport),
    Org(OrgReport),
}

impl ComparedReport {
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Industry(r) => r.start_time,
            Self::User(r) => Some(r.start_time),
            Self::Org(r) => Some(r.start_time),
        }
    }

    pub fn interval(&self) -> ReportInterval {
        match self {
            Self::Industry(r) => r.interval,
            Self::User(r) => r.interval,
            Self::Org(r) => r.interval,
        }
    }
}

/// Bucket identity: start epoch seconds, or the interval for reports without a start time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BucketKey {
    Start(i64),
    Interval(ReportInterval),
}

impl BucketKey {
    pub fn of(report: &ComparedReport) -> Self {
        match report.start_time() {
            Some(start) => Self::Start(start.timestamp()),
            None => Self::Interval(report.interval()),
        }
    }
}

/// Presentation order: newest start first, then interval buckets in declaration order.
impl Ord for BucketKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Start(a), Self::Start(b)) => b.cmp(a),
            (Self::Start(_), Self::Interval(_)) => Ordering::Less,
            (Self::Interval(_), Self::Start(_)) => Ordering::Greater,
            (Self::Interval(a), Self::Interval(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for BucketKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelativeScore {
    pub key: BucketKey,
    /// `"<Month>-<year>"` label, when a start time can be resolved.
    pub additional_key: Option<String>,
    pub report_list: Vec<ComparedReport>,
}
