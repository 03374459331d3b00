//! Relative scores: lines up user, OU and industry reports into comparable buckets.

mod pg;

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, warn, Instrument};
use trellis_core::{
    AggInterval, BucketKey, ComparedReport, ComparisonSubject, IdType, IndustryReport,
    ListResponse, OrgReport, Page, PeriodKey, RelativeScore, ReportInterval, ReportSeries,
    ReportStamp, Result, TrellisError, UserReport,
};
use trellis_storage::SubjectDirectory;
use uuid::Uuid;

pub const CRATE_NAME: &str = "trellis-scores";

/// Reports a comparison reads for one subject.
///
/// User and org reads return the rows chosen by [`comparable_rows`].
#[async_trait]
pub trait ReportSource: Send + Sync {
    async fn user_reports(
        &self,
        org_user_id: Uuid,
        profile_ids: &[Uuid],
        intervals: &[ReportInterval],
    ) -> Result<Vec<UserReport>>;

    async fn org_reports(
        &self,
        ou_id: Uuid,
        profile_ids: &[Uuid],
        intervals: &[ReportInterval],
    ) -> Result<Vec<OrgReport>>;

    async fn industry_reports(&self, intervals: &[ReportInterval]) -> Result<Vec<IndustryReport>>;
}

#[async_trait]
pub trait ProfileResolver: Send + Sync {
    /// Sub-profile ids of the parent profile serving the OU, if any.
    async fn sub_profile_ids_for_ou(&self, ou_ref_id: i32) -> Result<Option<Vec<Uuid>>>;
}

fn default_page_size() -> u32 {
    50
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelativeScoreRequest {
    pub subjects: Vec<ComparisonSubject>,
    pub agg_interval: AggInterval,
    /// Overrides OU-based profile resolution for every subject.
    #[serde(default)]
    pub profile_id: Option<Uuid>,
    /// Skip the industry benchmark.
    #[serde(default)]
    pub no_comparison: bool,
    #[serde(default)]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

#[derive(Debug, Clone, PartialEq)]
enum Population {
    Users {
        org_user_ids: Vec<Uuid>,
        ou_ids: Vec<Uuid>,
    },
    Ou(Uuid),
}

pub struct RelativeScoreService<D, R, P> {
    directory: D,
    reports: R,
    profiles: P,
}

impl<D, R, P> RelativeScoreService<D, R, P>
where
    D: SubjectDirectory,
    R: ReportSource,
    P: ProfileResolver,
{
    pub fn new(directory: D, reports: R, profiles: P) -> Self {
        Self {
            directory,
            reports,
            profiles,
        }
    }

    /// `reference` anchors month-only buckets to a calendar year for their label.
    pub async fn relative_scores(
        &self,
        request: &RelativeScoreRequest,
        reference: DateTime<Utc>,
    ) -> Result<ListResponse<RelativeScore>> {
        if request.subjects.is_empty() {
            return Err(TrellisError::validation("at least one comparison subject is required"));
        }
        let span = info_span!(
            "relative_scores",
            subjects = request.subjects.len(),
            agg = ?request.agg_interval
        );
        async {
            let intervals = request.agg_interval.report_intervals();
            let populations = self.resolve_populations(&request.subjects).await?;

            let mut groups: Vec<Vec<ComparedReport>> = Vec::with_capacity(populations.len() + 1);
            if !request.no_comparison {
                let industry = self.reports.industry_reports(&intervals).await?;
                if !industry.is_empty() {
                    groups.push(industry.into_iter().map(ComparedReport::Industry).collect());
                }
            }
            for population in &populations {
                if let Some(group) = self.population_reports(population, request, &intervals).await? {
                    groups.push(group);
                }
            }

            let buckets = bucket(groups, reference);
            let total = buckets.len() as i64;
            let page = Page::new(request.page, request.page_size);
            let records = buckets
                .into_iter()
                .skip(page.offset() as usize)
                .take(page.limit() as usize)
                .collect();
            debug!(total, "relative scores built");
            Ok::<_, TrellisError>(ListResponse::of(records, total))
        }
        .instrument(span)
        .await
    }

    async fn resolve_populations(&self, subjects: &[ComparisonSubject]) -> Result<Vec<Population>> {
        let mut populations = Vec::with_capacity(subjects.len());
        let mut enclosing: Vec<Uuid> = Vec::new();

        for subject in subjects {
            match subject.id_type {
                IdType::OrgIds => {
                    let ou_ids = subject.ou_ids();
                    if ou_ids.is_empty() {
                        return Err(TrellisError::validation("ORG_IDS subject without ids"));
                    }
                    populations.extend(ou_ids.into_iter().map(Population::Ou));
                }
                IdType::OuUserIds | IdType::IntegrationUserIds => {
                    let id = subject.id.ok_or_else(|| {
                        TrellisError::validation(format!("{:?} subject without id", subject.id_type))
                    })?;
                    let org_user_ids = if subject.id_type == IdType::IntegrationUserIds {
                        let ids = self.directory.org_user_ids_for_integration_user(id).await?;
                        if ids.is_empty() {
                            return Err(TrellisError::not_found(format!(
                                "no org user for integration user {id}"
                            )));
                        }
                        ids
                    } else {
                        vec![id]
                    };
                    let mut ou_ids = Vec::new();
                    for user in &org_user_ids {
                        for ou in self.directory.ou_ids_for_org_user(*user).await? {
                            if !ou_ids.contains(&ou) {
                                ou_ids.push(ou);
                            }
                        }
                    }
                    enclosing.extend(ou_ids.iter().copied());
                    populations.push(Population::Users {
                        org_user_ids,
                        ou_ids,
                    });
                }
            }
        }

        // enclosing OUs join as ORG entries even when also requested explicitly
        let mut appended: Vec<Uuid> = Vec::new();
        for ou in enclosing {
            if !appended.contains(&ou) {
                appended.push(ou);
                populations.push(Population::Ou(ou));
            }
        }
        Ok(populations)
    }

    async fn profiles_for_ou(&self, ou_id: Uuid) -> Result<Option<Vec<Uuid>>> {
        match self.directory.ou_ref_id(ou_id).await? {
            Some(ref_id) => self.profiles.sub_profile_ids_for_ou(ref_id).await,
            None => Ok(None),
        }
    }

    async fn population_reports(
        &self,
        population: &Population,
        request: &RelativeScoreRequest,
        intervals: &[ReportInterval],
    ) -> Result<Option<Vec<ComparedReport>>> {
        match population {
            Population::Users {
                org_user_ids,
                ou_ids,
            } => {
                let profile_ids = match request.profile_id {
                    Some(id) => vec![id],
                    None => {
                        let mut found = None;
                        for ou in ou_ids {
                            if let Some(ids) = self.profiles_for_ou(*ou).await? {
                                found = Some(ids);
                                break;
                            }
                        }
                        found.ok_or_else(|| {
                            TrellisError::not_found(format!(
                                "no trellis profile for users {org_user_ids:?}"
                            ))
                        })?
                    }
                };
                let mut group = Vec::new();
                for user in org_user_ids {
                    let reports = self.reports.user_reports(*user, &profile_ids, intervals).await?;
                    group.extend(reports.into_iter().map(ComparedReport::User));
                }
                Ok(Some(group))
            }
            Population::Ou(ou_id) => {
                let profile_ids = match request.profile_id {
                    Some(id) => vec![id],
                    None => match self.profiles_for_ou(*ou_id).await? {
                        Some(ids) => ids,
                        None => {
                            warn!(%ou_id, "ou has no trellis profile; skipped");
                            return Ok(None);
                        }
                    },
                };
                let reports = self.reports.org_reports(*ou_id, &profile_ids, intervals).await?;
                Ok(Some(reports.into_iter().map(ComparedReport::Org).collect()))
            }
        }
    }
}

/// A stored user or org report, as seen by [`comparable_rows`].
pub trait SeriesRow {
    fn stamp(&self) -> ReportStamp;

    fn is_latest(&self) -> bool;
}

impl SeriesRow for UserReport {
    fn stamp(&self) -> ReportStamp {
        UserReport::stamp(self)
    }

    fn is_latest(&self) -> bool {
        self.latest
    }
}

impl SeriesRow for OrgReport {
    fn stamp(&self) -> ReportStamp {
        OrgReport::stamp(self)
    }

    fn is_latest(&self) -> bool {
        self.latest
    }
}

/// Narrows a subject's stored rows to the ones it is compared on.
///
/// Fixed intervals keep only their `latest` row. Weekly intervals keep every period, one row
/// each: the row written under `subject` if there is one, else the `latest` one, else the first
/// seen. Rows come back in input order.
pub fn comparable_rows<R: SeriesRow>(rows: Vec<R>, subject: Uuid) -> Vec<R> {
    let mut chosen: Vec<(u8, R)> = Vec::with_capacity(rows.len());
    let mut slots: HashMap<(ReportSeries, PeriodKey), usize> = HashMap::new();
    for row in rows {
        let stamp = row.stamp();
        if !stamp.series.interval.is_periodic() {
            if row.is_latest() {
                chosen.push((0, row));
            }
            continue;
        }
        let rank = 2 * u8::from(stamp.subject_id == subject) + u8::from(row.is_latest());
        let key = (stamp.series, stamp.period);
        match slots.get(&key).copied() {
            Some(slot) if chosen[slot].0 >= rank => {}
            Some(slot) => chosen[slot] = (rank, row),
            None => {
                slots.insert(key, chosen.len());
                chosen.push((rank, row));
            }
        }
    }
    chosen.into_iter().map(|(_, row)| row).collect()
}

/// Orders groups largest first (ties keep input order) and buckets every report.
///
/// Buckets come back newest start first, then interval-keyed buckets in interval order.
pub fn bucket(mut groups: Vec<Vec<ComparedReport>>, reference: DateTime<Utc>) -> Vec<RelativeScore> {
    groups.sort_by(|a, b| b.len().cmp(&a.len()));

    let mut buckets: BTreeMap<BucketKey, RelativeScore> = BTreeMap::new();
    for report in groups.into_iter().flatten() {
        let key = BucketKey::of(&report);
        buckets
            .entry(key)
            .or_insert_with(|| RelativeScore {
                key,
                additional_key: month_label(key, reference),
                report_list: Vec::new(),
            })
            .report_list
            .push(report);
    }
    buckets.into_values().collect()
}

/// `"<Month>-<year>"`, e.g. `"November-2023"`.
///
/// A month-only bucket names the most recent such month not after `reference`.
fn month_label(key: BucketKey, reference: DateTime<Utc>) -> Option<String> {
    match key {
        BucketKey::Start(epoch) => {
            DateTime::from_timestamp(epoch, 0).map(|start| start.format("%B-%Y").to_string())
        }
        BucketKey::Interval(interval) => interval
            .month_number()
            .and_then(|month| {
                let year = if month > reference.month() {
                    reference.year() - 1
                } else {
                    reference.year()
                };
                NaiveDate::from_ymd_opt(year, month, 1)
            })
            .map(|start| start.format("%B-%Y").to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use trellis_core::CurrentLatest;
    use trellis_storage::{sync_latest_flag, LatestFlagStore};

    const WEEK: i64 = 604_800;

    fn at(epoch: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(epoch, 0).unwrap()
    }

    fn period_of(interval: ReportInterval, start: i64) -> (Option<i32>, Option<i32>) {
        if !interval.is_periodic() {
            return (None, None);
        }
        let week = at(start).iso_week();
        (Some(week.week() as i32), Some(week.year()))
    }

    fn user_report(user: Uuid, profile: Uuid, interval: ReportInterval, start: i64) -> UserReport {
        let (week_of_year, year) = period_of(interval, start);
        UserReport {
            id: Some(Uuid::new_v4()),
            org_user_id: user,
            org_user_ref_id: 1,
            profile_id: profile,
            interval,
            start_time: at(start),
            end_time: at(start + 86_400),
            week_of_year,
            year,
            score: Some(70),
            report: serde_json::Value::Null,
            latest: true,
            incomplete: false,
            missing_features: Vec::new(),
            created_at: None,
            updated_at: None,
        }
    }

    fn org_report(ou: Uuid, profile: Uuid, interval: ReportInterval, start: i64) -> OrgReport {
        let (week_of_year, year) = period_of(interval, start);
        OrgReport {
            id: Some(Uuid::new_v4()),
            ou_id: ou,
            ou_ref_id: 1,
            profile_id: profile,
            interval,
            start_time: at(start),
            end_time: at(start + 86_400),
            week_of_year,
            year,
            score: Some(55),
            report: serde_json::Value::Null,
            latest: true,
            missing_user_reports_count: 0,
            stale_user_reports_count: 0,
            created_at: None,
            updated_at: None,
        }
    }

    fn industry(interval: ReportInterval, score: i32) -> IndustryReport {
        IndustryReport {
            id: None,
            interval,
            start_time: None,
            score: Some(score),
            report: serde_json::Value::Null,
            updated_at: None,
        }
    }

    #[derive(Default)]
    struct FakeDirectory {
        integration: HashMap<Uuid, Vec<Uuid>>,
        memberships: HashMap<Uuid, Vec<Uuid>>,
        ou_refs: HashMap<Uuid, i32>,
    }

    #[async_trait]
    impl SubjectDirectory for FakeDirectory {
        async fn org_user_ids_for_integration_user(&self, id: Uuid) -> Result<Vec<Uuid>> {
            Ok(self.integration.get(&id).cloned().unwrap_or_default())
        }

        async fn ou_ids_for_org_user(&self, id: Uuid) -> Result<Vec<Uuid>> {
            Ok(self.memberships.get(&id).cloned().unwrap_or_default())
        }

        async fn ou_ref_id(&self, ou_id: Uuid) -> Result<Option<i32>> {
            Ok(self.ou_refs.get(&ou_id).copied())
        }
    }

    #[derive(Default)]
    struct FakeReports {
        users: Vec<UserReport>,
        orgs: Vec<OrgReport>,
        industry: Vec<IndustryReport>,
        requested_profiles: Mutex<Vec<Vec<Uuid>>>,
    }

    #[async_trait]
    impl ReportSource for FakeReports {
        async fn user_reports(
            &self,
            org_user_id: Uuid,
            profile_ids: &[Uuid],
            intervals: &[ReportInterval],
        ) -> Result<Vec<UserReport>> {
            self.requested_profiles
                .lock()
                .unwrap()
                .push(profile_ids.to_vec());
            let rows = self
                .users
                .iter()
                .filter(|r| {
                    r.org_user_id == org_user_id
                        && profile_ids.contains(&r.profile_id)
                        && intervals.contains(&r.interval)
                })
                .cloned()
                .collect();
            Ok(comparable_rows(rows, org_user_id))
        }

        async fn org_reports(
            &self,
            ou_id: Uuid,
            profile_ids: &[Uuid],
            intervals: &[ReportInterval],
        ) -> Result<Vec<OrgReport>> {
            let rows = self
                .orgs
                .iter()
                .filter(|r| {
                    r.ou_id == ou_id
                        && profile_ids.contains(&r.profile_id)
                        && intervals.contains(&r.interval)
                })
                .cloned()
                .collect();
            Ok(comparable_rows(rows, ou_id))
        }

        async fn industry_reports(&self, intervals: &[ReportInterval]) -> Result<Vec<IndustryReport>> {
            Ok(self
                .industry
                .iter()
                .filter(|r| intervals.contains(&r.interval))
                .cloned()
                .collect())
        }
    }

    #[derive(Default)]
    struct FakeProfiles {
        by_ou_ref: HashMap<i32, Vec<Uuid>>,
    }

    #[async_trait]
    impl ProfileResolver for FakeProfiles {
        async fn sub_profile_ids_for_ou(&self, ou_ref_id: i32) -> Result<Option<Vec<Uuid>>> {
            Ok(self.by_ou_ref.get(&ou_ref_id).cloned())
        }
    }

    /// User report table maintained by the real latest-flag rule.
    #[derive(Default)]
    struct FlaggedTable {
        rows: Vec<UserReport>,
        active: HashMap<i32, Uuid>,
    }

    impl FlaggedTable {
        fn in_series<'a>(
            &'a mut self,
            series: &'a ReportSeries,
        ) -> impl Iterator<Item = &'a mut UserReport> {
            self.rows
                .iter_mut()
                .filter(move |r| r.stamp().series == *series)
        }

        async fn upsert(&mut self, mut report: UserReport) {
            report.latest = false;
            let stamp = report.stamp();
            self.rows.push(report);
            sync_latest_flag(self, &stamp).await.unwrap();
        }
    }

    #[async_trait]
    impl LatestFlagStore for FlaggedTable {
        async fn active_subject_id(&mut self, subject_ref_id: i32) -> Result<Option<Uuid>> {
            Ok(self.active.get(&subject_ref_id).copied())
        }

        async fn current_latest(&mut self, series: &ReportSeries) -> Result<Option<CurrentLatest>> {
            Ok(self
                .in_series(series)
                .filter(|r| r.latest)
                .max_by_key(|r| r.start_time)
                .map(|r| CurrentLatest {
                    subject_id: r.org_user_id,
                    start_time: r.start_time,
                }))
        }

        async fn clear_series(&mut self, series: &ReportSeries) -> Result<u64> {
            let mut n = 0;
            for row in self.in_series(series).filter(|r| r.latest) {
                row.latest = false;
                n += 1;
            }
            Ok(n)
        }

        async fn clear_stale(
            &mut self,
            series: &ReportSeries,
            period: PeriodKey,
            keep_subject: Uuid,
        ) -> Result<u64> {
            let mut n = 0;
            for row in self.in_series(series).filter(|r| {
                r.latest && r.org_user_id != keep_subject && r.stamp().period == period
            }) {
                row.latest = false;
                n += 1;
            }
            Ok(n)
        }

        async fn mark(
            &mut self,
            subject_id: Uuid,
            series: &ReportSeries,
            period: PeriodKey,
        ) -> Result<u64> {
            let mut n = 0;
            for row in self
                .in_series(series)
                .filter(|r| r.org_user_id == subject_id && r.stamp().period == period)
            {
                row.latest = true;
                n += 1;
            }
            Ok(n)
        }
    }

    struct Fixture {
        user: Uuid,
        ou: Uuid,
        profile: Uuid,
        directory: FakeDirectory,
        reports: FakeReports,
        profiles: FakeProfiles,
    }

    fn fixture() -> Fixture {
        let (user, ou, profile) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let mut directory = FakeDirectory::default();
        directory.memberships.insert(user, vec![ou]);
        directory.ou_refs.insert(ou, 11);
        let mut profiles = FakeProfiles::default();
        profiles.by_ou_ref.insert(11, vec![profile]);
        Fixture {
            user,
            ou,
            profile,
            directory,
            reports: FakeReports::default(),
            profiles,
        }
    }

    fn request(subjects: Vec<ComparisonSubject>, agg: AggInterval) -> RelativeScoreRequest {
        RelativeScoreRequest {
            subjects,
            agg_interval: agg,
            profile_id: None,
            no_comparison: false,
            page: 0,
            page_size: 100,
        }
    }

    fn reference() -> DateTime<Utc> {
        at(1_700_000_000)
    }

    #[test]
    fn timeless_and_timed_reports_land_in_separate_buckets() {
        let groups = vec![
            vec![ComparedReport::Industry(industry(ReportInterval::MonthJan, 80))],
            vec![ComparedReport::User(user_report(
                Uuid::new_v4(),
                Uuid::new_v4(),
                ReportInterval::MonthNov,
                1_700_000_000,
            ))],
        ];
        let buckets = bucket(groups, reference());
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].key, BucketKey::Start(1_700_000_000));
        assert_eq!(buckets[0].additional_key.as_deref(), Some("November-2023"));
        assert_eq!(buckets[1].key, BucketKey::Interval(ReportInterval::MonthJan));
        assert_eq!(buckets[1].additional_key.as_deref(), Some("January-2023"));
    }

    #[test]
    fn larger_groups_contribute_first_and_ties_keep_input_order() {
        let (a, b, c, p) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let start = 1_680_480_000;
        let groups = vec![
            vec![ComparedReport::User(user_report(a, p, ReportInterval::LastWeek, start))],
            vec![
                ComparedReport::Org(org_report(b, p, ReportInterval::LastWeek, start)),
                ComparedReport::Org(org_report(b, p, ReportInterval::LastWeek, start - 604_800)),
            ],
            vec![ComparedReport::User(user_report(c, p, ReportInterval::LastWeek, start))],
        ];
        let buckets = bucket(groups, reference());
        assert_eq!(buckets.len(), 2);
        let subjects: Vec<Uuid> = buckets[0]
            .report_list
            .iter()
            .map(|r| match r {
                ComparedReport::User(u) => u.org_user_id,
                ComparedReport::Org(o) => o.ou_id,
                ComparedReport::Industry(_) => Uuid::nil(),
            })
            .collect();
        assert_eq!(subjects, vec![b, a, c]);
        assert_eq!(buckets[1].key, BucketKey::Start(start - 604_800));
    }

    #[tokio::test]
    async fn user_subject_pulls_in_enclosing_ou_and_industry() {
        let mut fx = fixture();
        let weeks = [1_673_827_200, 1_674_432_000, 1_675_036_800];
        for week in weeks {
            fx.reports
                .users
                .push(user_report(fx.user, fx.profile, ReportInterval::LastWeek, week));
            fx.reports
                .orgs
                .push(org_report(fx.ou, fx.profile, ReportInterval::LastWeek, week));
        }
        fx.reports.industry.push(industry(ReportInterval::LastWeek, 80));
        fx.reports.industry.push(industry(ReportInterval::MonthJan, 75));

        let service = RelativeScoreService::new(fx.directory, fx.reports, fx.profiles);
        let req = request(
            vec![ComparisonSubject::user(IdType::OuUserIds, fx.user)],
            AggInterval::Week,
        );
        let scores = service.relative_scores(&req, reference()).await.unwrap();

        assert_eq!(scores.total_count, 4);
        assert_eq!(scores.records[0].key, BucketKey::Start(1_675_036_800));
        assert_eq!(scores.records[0].report_list.len(), 2);
        assert_eq!(
            scores.records[3].key,
            BucketKey::Interval(ReportInterval::LastWeek)
        );
        assert_eq!(scores.records[3].additional_key, None);
    }

    #[tokio::test]
    async fn no_comparison_skips_industry() {
        let mut fx = fixture();
        fx.reports
            .users
            .push(user_report(fx.user, fx.profile, ReportInterval::MonthMar, 1_677_628_800));
        fx.reports.industry.push(industry(ReportInterval::MonthMar, 80));

        let service = RelativeScoreService::new(fx.directory, fx.reports, fx.profiles);
        let mut req = request(
            vec![ComparisonSubject::user(IdType::OuUserIds, fx.user)],
            AggInterval::Month,
        );
        req.no_comparison = true;
        let scores = service.relative_scores(&req, reference()).await.unwrap();
        assert_eq!(scores.total_count, 1);
        assert!(matches!(
            scores.records[0].report_list[0],
            ComparedReport::User(_)
        ));
    }

    #[tokio::test]
    async fn pages_are_cut_after_ordering() {
        let mut fx = fixture();
        for i in 0..5 {
            fx.reports.orgs.push(org_report(
                fx.ou,
                fx.profile,
                ReportInterval::LastWeek,
                1_673_827_200 + i * 604_800,
            ));
        }
        let service = RelativeScoreService::new(fx.directory, fx.reports, fx.profiles);
        let mut req = request(vec![ComparisonSubject::org(fx.ou)], AggInterval::Week);
        req.page = 1;
        req.page_size = 2;
        let scores = service.relative_scores(&req, reference()).await.unwrap();
        assert_eq!(scores.total_count, 5);
        let keys: Vec<BucketKey> = scores.records.iter().map(|r| r.key).collect();
        assert_eq!(
            keys,
            vec![
                BucketKey::Start(1_673_827_200 + 2 * 604_800),
                BucketKey::Start(1_673_827_200 + 604_800),
            ]
        );
    }

    #[tokio::test]
    async fn user_without_profile_is_not_found() {
        let mut fx = fixture();
        fx.profiles.by_ou_ref.clear();
        let service = RelativeScoreService::new(fx.directory, fx.reports, fx.profiles);
        let req = request(
            vec![ComparisonSubject::user(IdType::OuUserIds, fx.user)],
            AggInterval::Week,
        );
        let err = service.relative_scores(&req, reference()).await.unwrap_err();
        assert!(matches!(err, TrellisError::NotFound(_)));
    }

    #[tokio::test]
    async fn ou_without_profile_is_skipped() {
        let mut fx = fixture();
        let stray = Uuid::new_v4();
        fx.directory.ou_refs.insert(stray, 99);
        fx.reports
            .orgs
            .push(org_report(fx.ou, fx.profile, ReportInterval::LastWeek, 1_673_827_200));
        let service = RelativeScoreService::new(fx.directory, fx.reports, fx.profiles);
        let req = request(
            vec![ComparisonSubject {
                id_type: IdType::OrgIds,
                id: None,
                org_ids: vec![stray, fx.ou],
            }],
            AggInterval::Week,
        );
        let scores = service.relative_scores(&req, reference()).await.unwrap();
        assert_eq!(scores.total_count, 1);
    }

    #[tokio::test]
    async fn integration_user_resolves_to_org_user_and_explicit_profile_wins() {
        let mut fx = fixture();
        let integration_user = Uuid::new_v4();
        let explicit = Uuid::new_v4();
        fx.directory
            .integration
            .insert(integration_user, vec![fx.user]);
        fx.reports
            .users
            .push(user_report(fx.user, explicit, ReportInterval::LastWeek, 1_673_827_200));

        let service = RelativeScoreService::new(fx.directory, fx.reports, fx.profiles);
        let mut req = request(
            vec![ComparisonSubject::user(IdType::IntegrationUserIds, integration_user)],
            AggInterval::Week,
        );
        req.profile_id = Some(explicit);
        req.no_comparison = true;
        let scores = service.relative_scores(&req, reference()).await.unwrap();
        assert_eq!(scores.total_count, 1);
        assert_eq!(
            service.reports.requested_profiles.lock().unwrap()[0],
            vec![explicit]
        );
    }

    #[tokio::test]
    async fn empty_request_is_rejected() {
        let fx = fixture();
        let service = RelativeScoreService::new(fx.directory, fx.reports, fx.profiles);
        let err = service
            .relative_scores(&request(Vec::new(), AggInterval::Week), reference())
            .await
            .unwrap_err();
        assert!(matches!(err, TrellisError::Validation(_)));
    }

    #[tokio::test]
    async fn every_stored_week_gets_its_own_bucket() {
        let mut fx = fixture();
        let mut table = FlaggedTable::default();
        table.active.insert(1, fx.user);
        let first = 1_670_198_400;
        for i in 0..18 {
            table
                .upsert(user_report(fx.user, fx.profile, ReportInterval::LastWeek, first + i * WEEK))
                .await;
        }
        assert_eq!(table.rows.iter().filter(|r| r.latest).count(), 1);
        fx.reports.users = table.rows;

        let service = RelativeScoreService::new(fx.directory, fx.reports, fx.profiles);
        let mut req = request(
            vec![ComparisonSubject::user(IdType::OuUserIds, fx.user)],
            AggInterval::Week,
        );
        req.no_comparison = true;
        let scores = service.relative_scores(&req, reference()).await.unwrap();

        assert_eq!(scores.total_count, 18);
        assert_eq!(scores.records[0].key, BucketKey::Start(first + 17 * WEEK));
        assert_eq!(scores.records[17].key, BucketKey::Start(first));
    }

    #[test]
    fn rotated_week_prefers_the_requested_subject() {
        let (old, new, profile) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let start = 1_673_827_200;
        let mut stale = user_report(old, profile, ReportInterval::LastWeek, start);
        stale.latest = true;
        let mut current = user_report(new, profile, ReportInterval::LastWeek, start);
        current.latest = false;
        let other_week = user_report(old, profile, ReportInterval::LastWeek, start - WEEK);
        let mut stale_month = user_report(old, profile, ReportInterval::MonthJan, start);
        stale_month.latest = false;

        let kept = comparable_rows(
            vec![stale, other_week.clone(), current.clone(), stale_month],
            new,
        );
        assert_eq!(kept, vec![current, other_week]);
    }

    #[tokio::test]
    async fn enclosing_ou_is_compared_even_when_listed() {
        let mut fx = fixture();
        for week in [1_673_827_200, 1_673_827_200 + WEEK] {
            fx.reports
                .users
                .push(user_report(fx.user, fx.profile, ReportInterval::LastWeek, week));
            fx.reports
                .orgs
                .push(org_report(fx.ou, fx.profile, ReportInterval::LastWeek, week));
        }
        let service = RelativeScoreService::new(fx.directory, fx.reports, fx.profiles);
        let mut req = request(
            vec![
                ComparisonSubject::org(fx.ou),
                ComparisonSubject::user(IdType::OuUserIds, fx.user),
            ],
            AggInterval::Week,
        );
        req.no_comparison = true;
        let scores = service.relative_scores(&req, reference()).await.unwrap();

        assert_eq!(scores.total_count, 2);
        let sources: Vec<&str> = scores.records[0]
            .report_list
            .iter()
            .map(|r| match r {
                ComparedReport::User(_) => "user",
                ComparedReport::Org(_) => "org",
                ComparedReport::Industry(_) => "industry",
            })
            .collect();
        assert_eq!(sources, vec!["org", "user", "org"]);
    }

    #[test]
    fn month_buckets_never_name_a_future_month() {
        let january = at(1_705_276_800);
        assert_eq!(
            month_label(BucketKey::Interval(ReportInterval::MonthDec), january).as_deref(),
            Some("December-2023")
        );
        assert_eq!(
            month_label(BucketKey::Interval(ReportInterval::MonthJan), january).as_deref(),
            Some("January-2024")
        );
        assert_eq!(month_label(BucketKey::Interval(ReportInterval::LastWeek), january), None);
    }
}
