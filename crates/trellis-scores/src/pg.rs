use async_trait::async_trait;
use trellis_core::{IndustryReport, OrgReport, ReportInterval, Result, UserReport};
use trellis_storage::{PgProfileStore, PgReportStore, ProfileRepository, ReportFilter, ReportRepository};
use uuid::Uuid;

use crate::{comparable_rows, ProfileResolver, ReportSource};

/// Every row of the subject's ref id; weekly history is not flagged `latest`.
fn subject_filter(subject: Uuid, profile_ids: &[Uuid], intervals: &[ReportInterval]) -> ReportFilter {
    ReportFilter {
        subject_ids: Some(vec![subject]),
        profile_ids: Some(profile_ids.to_vec()),
        intervals: Some(intervals.to_vec()),
        ..ReportFilter::default()
    }
}

#[async_trait]
impl ReportSource for PgReportStore {
    async fn user_reports(
        &self,
        org_user_id: Uuid,
        profile_ids: &[Uuid],
        intervals: &[ReportInterval],
    ) -> Result<Vec<UserReport>> {
        let rows = self
            .find_user_reports(&subject_filter(org_user_id, profile_ids, intervals))
            .await?;
        Ok(comparable_rows(rows, org_user_id))
    }

    async fn org_reports(
        &self,
        ou_id: Uuid,
        profile_ids: &[Uuid],
        intervals: &[ReportInterval],
    ) -> Result<Vec<OrgReport>> {
        let rows = self
            .find_org_reports(&subject_filter(ou_id, profile_ids, intervals))
            .await?;
        Ok(comparable_rows(rows, ou_id))
    }

    async fn industry_reports(&self, intervals: &[ReportInterval]) -> Result<Vec<IndustryReport>> {
        self.list_industry_reports(Some(intervals)).await
    }
}

#[async_trait]
impl ProfileResolver for PgProfileStore {
    async fn sub_profile_ids_for_ou(&self, ou_ref_id: i32) -> Result<Option<Vec<Uuid>>> {
        let profile = self.profile_for_ou(ou_ref_id).await?;
        Ok(profile.map(|p| p.sub_profiles.iter().filter_map(|s| s.id).collect()))
    }
}
