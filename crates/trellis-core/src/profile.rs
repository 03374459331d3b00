//! Parent profile tree: parent -> sub-profiles -> sections -> features -> ticket categories.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Result, TrellisError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeatureType {
    NumberOfPrsPerMonth,
    NumberOfCommitsPerMonth,
    LinesOfCodePerMonth,
    NumberOfBugsFixedPerMonth,
    NumberOfStoriesResolvedPerMonth,
    NumberOfStoryPointsDeliveredPerMonth,
    PercentageOfRework,
    PercentageOfLegacyRework,
    AvgCodingDaysPerWeek,
    AvgPrCycleTime,
    AvgIssueResolutionTime,
    HighImpactBugsResolvedPerMonth,
    HighImpactStoriesResolvedPerMonth,
    TechnicalBreadth,
    RepoBreadth,
    NumberOfPrsReviewedPerMonth,
    NumberOfPrsCommentedOnPerMonth,
    PrApproverResponseTime,
    PrCommenterResponseTime,
}

impl FeatureType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NumberOfPrsPerMonth => "NUMBER_OF_PRS_PER_MONTH",
            Self::NumberOfCommitsPerMonth => "NUMBER_OF_COMMITS_PER_MONTH",
            Self::LinesOfCodePerMonth => "LINES_OF_CODE_PER_MONTH",
            Self::NumberOfBugsFixedPerMonth => "NUMBER_OF_BUGS_FIXED_PER_MONTH",
            Self::NumberOfStoriesResolvedPerMonth => "NUMBER_OF_STORIES_RESOLVED_PER_MONTH",
            Self::NumberOfStoryPointsDeliveredPerMonth => {
                "NUMBER_OF_STORY_POINTS_DELIVERED_PER_MONTH"
            }
            Self::PercentageOfRework => "PERCENTAGE_OF_REWORK",
            Self::PercentageOfLegacyRework => "PERCENTAGE_OF_LEGACY_REWORK",
            Self::AvgCodingDaysPerWeek => "AVG_CODING_DAYS_PER_WEEK",
            Self::AvgPrCycleTime => "AVG_PR_CYCLE_TIME",
            Self::AvgIssueResolutionTime => "AVG_ISSUE_RESOLUTION_TIME",
            Self::HighImpactBugsResolvedPerMonth => "HIGH_IMPACT_BUGS_RESOLVED_PER_MONTH",
            Self::HighImpactStoriesResolvedPerMonth => "HIGH_IMPACT_STORIES_RESOLVED_PER_MONTH",
            Self::TechnicalBreadth => "TECHNICAL_BREADTH",
            Self::RepoBreadth => "REPO_BREADTH",
            Self::NumberOfPrsReviewedPerMonth => "NUMBER_OF_PRS_REVIEWED_PER_MONTH",
            Self::NumberOfPrsCommentedOnPerMonth => "NUMBER_OF_PRS_COMMENTED_ON_PER_MONTH",
            Self::PrApproverResponseTime => "PR_APPROVER_RESPONSE_TIME",
            Self::PrCommenterResponseTime => "PR_COMMENTER_RESPONSE_TIME",
        }
    }
}

impl std::str::FromStr for FeatureType {
    type Err = TrellisError;

    fn from_str(s: &str) -> Result<Self> {
        serde_json::from_value(Value::String(s.to_ascii_uppercase()))
            .map_err(|_| TrellisError::validation(format!("unknown feature type `{s}`")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub order: i32,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub feature_type: FeatureType,
    #[serde(default)]
    pub max_value: Option<i64>,
    #[serde(default)]
    pub lower_limit_percentage: Option<i32>,
    #[serde(default)]
    pub upper_limit_percentage: Option<i32>,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ticket_categories: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, Value>,
}

impl Feature {
    /// Feature body as stored; identity and category mappings live in their own columns/rows.
    pub fn persisted_body(&self) -> Result<Value> {
        let mut body = self.clone();
        body.id = None;
        body.ticket_categories.clear();
        Ok(serde_json::to_value(body)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub order: i32,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
    #[serde(default)]
    pub weight: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub features: Vec<Feature>,
}

impl Section {
    /// Section body with the feature list stripped; features are stored as their own rows.
    pub fn persisted_body(&self) -> Result<Value> {
        let body = Section {
            id: None,
            features: Vec::new(),
            ..self.clone()
        };
        Ok(serde_json::to_value(body)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CriterionCondition {
    Eq,
    Contains,
    StartsWith,
}

/// Rule selecting which users a sub-profile applies to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchingCriterion {
    pub field: String,
    #[serde(default)]
    pub values: Vec<String>,
    pub condition: CriterionCondition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    /// `None` for legacy standalone profiles.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Unique within the parent; updates match sub-profiles on this, not on id.
    pub order: i32,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
    #[serde(default)]
    pub matching_criteria: Vec<MatchingCriterion>,
    #[serde(default)]
    pub settings: Map<String, Value>,
    #[serde(default)]
    pub sections: Vec<Section>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl SubProfile {
    fn same_scalars(&self, other: &SubProfile) -> bool {
        self.name == other.name
            && self.description == other.description
            && self.enabled == other.enabled
            && self.matching_criteria == other.matching_criteria
            && self.settings == other.settings
    }

    fn normalized(&self) -> SubProfile {
        let mut sections = self.sections.clone();
        sections.sort_by_key(|s| s.order);
        for section in &mut sections {
            section.id = None;
            section.features.sort_by_key(|f| f.order);
            for feature in &mut section.features {
                feature.id = None;
            }
        }
        SubProfile {
            id: None,
            parent_id: None,
            created_at: None,
            updated_at: None,
            sections,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub predefined_profile: bool,
    #[serde(default)]
    pub default_profile: bool,
    #[serde(default)]
    pub effort_investment_profile_id: Option<Uuid>,
    #[serde(default)]
    pub feature_ticket_categories_map: BTreeMap<FeatureType, Vec<Uuid>>,
    #[serde(default)]
    pub settings: Map<String, Value>,
    #[serde(default)]
    pub sub_profiles: Vec<SubProfile>,
    #[serde(default)]
    pub associated_ou_ref_ids: Vec<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ParentProfile {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(TrellisError::validation("profile name is required"));
        }
        let mut seen = std::collections::BTreeSet::new();
        for sub in &self.sub_profiles {
            if sub.name.trim().is_empty() {
                return Err(TrellisError::validation("sub-profile name is required"));
            }
            if !seen.insert(sub.order) {
                return Err(TrellisError::validation(format!(
                    "duplicate sub-profile order {}",
                    sub.order
                )));
            }
        }
        Ok(())
    }

    /// Copy scoped to a single set of OUs, as used when cloning per target OU.
    pub fn with_associated_ous(&self, ou_ref_ids: Vec<i32>) -> Self {
        Self {
            associated_ou_ref_ids: ou_ref_ids,
            ..self.clone()
        }
    }

    /// Copies the feature -> ticket category map into every matching feature.
    ///
    /// Only applies when the profile carries an effort investment scheme and a non-empty map.
    pub fn with_ticket_categories_propagated(&self) -> Self {
        let mut out = self.clone();
        if out.effort_investment_profile_id.is_none() || out.feature_ticket_categories_map.is_empty()
        {
            return out;
        }
        for feature in out
            .sub_profiles
            .iter_mut()
            .flat_map(|s| s.sections.iter_mut())
            .flat_map(|s| s.features.iter_mut())
        {
            if let Some(categories) = out.feature_ticket_categories_map.get(&feature.feature_type) {
                feature.ticket_categories = categories.clone();
            }
        }
        out
    }

    /// Parent-row fields only. The default flag is owned by the default marker table.
    pub fn same_scalars(&self, other: &ParentProfile) -> bool {
        self.name == other.name
            && self.description == other.description
            && self.predefined_profile == other.predefined_profile
            && self.effort_investment_profile_id == other.effort_investment_profile_id
            && self.feature_ticket_categories_map == other.feature_ticket_categories_map
            && self.settings == other.settings
    }

    /// Deep equality ignoring generated ids, timestamps, OU scope and the default flag.
    pub fn same_tree(&self, other: &ParentProfile) -> bool {
        self.same_scalars(other) && self.normalized_subs() == other.normalized_subs()
    }

    fn normalized_subs(&self) -> Vec<SubProfile> {
        let mut subs: Vec<SubProfile> = self.sub_profiles.iter().map(SubProfile::normalized).collect();
        subs.sort_by_key(|s| s.order);
        subs
    }

    pub fn sorted(mut self) -> Self {
        self.sub_profiles.sort_by_key(|s| s.order);
        for sub in &mut self.sub_profiles {
            sub.sections.sort_by_key(|s| s.order);
            for section in &mut sub.sections {
                section.features.sort_by_key(|f| f.order);
            }
        }
        self.associated_ou_ref_ids.sort_unstable();
        self
    }
}

fn enabled_default() -> bool {
    true
}

/// Outcome of matching one incoming sub-profile against the stored tree.
#[derive(Debug, Clone, PartialEq)]
pub enum SubProfileChange<'a> {
    /// No stored sub-profile holds this order index.
    Insert(&'a SubProfile),
    /// Stored sub-profile differs; its sections are dropped and rewritten.
    Replace {
        existing_id: Uuid,
        update_scalars: bool,
        incoming: &'a SubProfile,
    },
    Unchanged { existing_id: Uuid },
}

/// Positional diff of sub-profiles keyed by order index.
///
/// Stored sub-profiles whose index is absent from `incoming` are left untouched.
pub fn diff_sub_profiles<'a>(
    existing: &[SubProfile],
    incoming: &'a [SubProfile],
) -> Vec<SubProfileChange<'a>> {
    let by_order: BTreeMap<i32, (Uuid, &SubProfile)> = existing
        .iter()
        .filter_map(|s| s.id.map(|id| (s.order, (id, s))))
        .collect();

    incoming
        .iter()
        .map(|sub| match by_order.get(&sub.order) {
            None => SubProfileChange::Insert(sub),
            Some((existing_id, stored)) => {
                if stored.normalized() == sub.normalized() {
                    SubProfileChange::Unchanged {
                        existing_id: *existing_id,
                    }
                } else {
                    SubProfileChange::Replace {
                        existing_id: *existing_id,
                        update_scalars: !stored.same_scalars(sub),
                        incoming: sub,
                    }
                }
            }
        })
        .collect()
}
