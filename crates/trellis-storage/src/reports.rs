//! User, org and industry report repositories.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use tracing::{info, info_span, Instrument};
use trellis_core::{
    IndustryReport, ListResponse, OrgReport, Page, ReportInterval, Result, TrellisError,
    UserReport,
};
use uuid::Uuid;

use crate::latest::{sync_latest_flag, PgLatestFlags, ReportKind};
use crate::{db_err, Tenant, SHARED_SCHEMA};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportFilter {
    #[serde(default)]
    pub ids: Option<Vec<Uuid>>,
    /// Subject UUIDs; matched through their ref ids so reports of rotated identities are included.
    #[serde(default)]
    pub subject_ids: Option<Vec<Uuid>>,
    #[serde(default)]
    pub profile_ids: Option<Vec<Uuid>>,
    #[serde(default)]
    pub intervals: Option<Vec<ReportInterval>>,
    #[serde(default)]
    pub latest: Option<bool>,
}

impl ReportFilter {
    fn interval_names(&self) -> Option<Vec<String>> {
        self.intervals
            .as_ref()
            .map(|all| all.iter().map(|i| i.as_str().to_string()).collect())
    }
}

#[async_trait]
pub trait ReportRepository: Send + Sync {
    /// Upserts and maintains the latest flag in one transaction.
    async fn upsert_user_report(&self, report: &UserReport) -> Result<Uuid>;

    async fn upsert_org_report(&self, report: &OrgReport) -> Result<Uuid>;

    async fn get_user_report(&self, id: Uuid) -> Result<Option<UserReport>>;

    async fn get_org_report(&self, id: Uuid) -> Result<Option<OrgReport>>;

    async fn delete_user_report(&self, id: Uuid) -> Result<bool>;

    async fn delete_org_report(&self, id: Uuid) -> Result<bool>;

    async fn list_user_reports(
        &self,
        filter: &ReportFilter,
        page: Page,
    ) -> Result<ListResponse<UserReport>>;

    async fn list_org_reports(
        &self,
        filter: &ReportFilter,
        page: Page,
    ) -> Result<ListResponse<OrgReport>>;

    /// Unpaged read, newest first.
    async fn find_user_reports(&self, filter: &ReportFilter) -> Result<Vec<UserReport>>;

    async fn find_org_reports(&self, filter: &ReportFilter) -> Result<Vec<OrgReport>>;

    async fn upsert_industry_report(&self, report: &IndustryReport) -> Result<Uuid>;

    async fn list_industry_reports(
        &self,
        intervals: Option<&[ReportInterval]>,
    ) -> Result<Vec<IndustryReport>>;
}

#[derive(Clone)]
pub struct PgReportStore {
    pool: PgPool,
    tenant: Tenant,
}

impl PgReportStore {
    pub fn new(pool: PgPool, tenant: Tenant) -> Self {
        Self { pool, tenant }
    }

    fn where_clause(&self, kind: ReportKind) -> String {
        format!(
            r#"($1::uuid[] IS NULL OR r.id = ANY($1))
               AND ($2::uuid[] IS NULL OR r.{rf} IN (SELECT d.ref_id FROM {dir} d WHERE d.id = ANY($2)))
               AND ($3::uuid[] IS NULL OR r.profile_id = ANY($3))
               AND ($4::text[] IS NULL OR r.report_interval = ANY($4))
               AND ($5::boolean IS NULL OR r.latest = $5)"#,
            rf = kind.ref_column(),
            dir = self.tenant.table(kind.directory_table()),
        )
    }

    async fn select<R>(
        &self,
        kind: ReportKind,
        filter: &ReportFilter,
        page: Option<Page>,
    ) -> Result<Vec<R>>
    where
        R: for<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> + Send + Unpin,
    {
        let paging = if page.is_some() {
            " LIMIT $6 OFFSET $7"
        } else {
            ""
        };
        let sql = format!(
            "SELECT r.* FROM {t} r WHERE {criteria} ORDER BY r.updated_at DESC, r.id{paging}",
            t = self.tenant.table(kind.table()),
            criteria = self.where_clause(kind),
        );
        let mut query = sqlx::query_as::<_, R>(&sql)
            .bind(filter.ids.as_deref())
            .bind(filter.subject_ids.as_deref())
            .bind(filter.profile_ids.as_deref())
            .bind(filter.interval_names())
            .bind(filter.latest);
        if let Some(page) = page {
            query = query.bind(page.limit()).bind(page.offset());
        }
        query.fetch_all(&self.pool).await.map_err(db_err)
    }

    async fn count(&self, kind: ReportKind, filter: &ReportFilter) -> Result<i64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {t} r WHERE {criteria}",
            t = self.tenant.table(kind.table()),
            criteria = self.where_clause(kind),
        );
        sqlx::query_scalar::<_, i64>(&sql)
            .bind(filter.ids.as_deref())
            .bind(filter.subject_ids.as_deref())
            .bind(filter.profile_ids.as_deref())
            .bind(filter.interval_names())
            .bind(filter.latest)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn list<R>(
        &self,
        kind: ReportKind,
        filter: &ReportFilter,
        page: Page,
    ) -> Result<ListResponse<R>>
    where
        R: for<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> + Send + Unpin,
    {
        let rows: Vec<R> = self.select(kind, filter, Some(page)).await?;
        let total = match page.known_total(rows.len()) {
            Some(total) => total,
            None => self.count(kind, filter).await?,
        };
        Ok(ListResponse::of(rows, total))
    }

    async fn delete(&self, kind: ReportKind, id: Uuid) -> Result<bool> {
        let sql = format!(
            "DELETE FROM {} WHERE id = $1",
            self.tenant.table(kind.table())
        );
        let done = sqlx::query(&sql)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(done.rows_affected() > 0)
    }
}

#[async_trait]
impl ReportRepository for PgReportStore {
    async fn upsert_user_report(&self, report: &UserReport) -> Result<Uuid> {
        report.validate()?;
        let stamp = report.stamp();
        let span = info_span!(
            "upsert_user_report",
            tenant = %self.tenant,
            ref_id = report.org_user_ref_id,
            interval = %report.interval
        );
        async {
            let mut tx = self.pool.begin().await.map_err(db_err)?;
            let sql = format!(
                r#"
                INSERT INTO {t} (id, org_user_id, org_user_ref_id, profile_id, report_interval,
                                 start_time, end_time, week_of_year, year, score, report,
                                 incomplete, missing_features)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                ON CONFLICT (org_user_id, profile_id, report_interval, week_of_year, year) DO UPDATE
                   SET org_user_ref_id = EXCLUDED.org_user_ref_id,
                       start_time = EXCLUDED.start_time,
                       end_time = EXCLUDED.end_time,
                       score = EXCLUDED.score,
                       report = EXCLUDED.report,
                       incomplete = EXCLUDED.incomplete,
                       missing_features = EXCLUDED.missing_features,
                       updated_at = now()
                RETURNING id
                "#,
                t = self.tenant.table(ReportKind::User.table())
            );
            let id = sqlx::query_scalar::<_, Uuid>(&sql)
                .bind(Uuid::new_v4())
                .bind(report.org_user_id)
                .bind(report.org_user_ref_id)
                .bind(report.profile_id)
                .bind(report.interval.as_str())
                .bind(report.start_time)
                .bind(report.end_time)
                .bind(stamp.period.week_of_year)
                .bind(stamp.period.year)
                .bind(report.score)
                .bind(&report.report)
                .bind(report.incomplete)
                .bind(&report.missing_features)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err)?;

            let plan = {
                let mut flags = PgLatestFlags::new(&mut tx, &self.tenant, ReportKind::User);
                sync_latest_flag(&mut flags, &stamp).await?
            };
            tx.commit().await.map_err(db_err)?;
            info!(report_id = %id, latest = plan.mark_current_as_latest, "user report upserted");
            Ok::<_, TrellisError>(id)
        }
        .instrument(span)
        .await
    }

    async fn upsert_org_report(&self, report: &OrgReport) -> Result<Uuid> {
        report.validate()?;
        let stamp = report.stamp();
        let span = info_span!(
            "upsert_org_report",
            tenant = %self.tenant,
            ref_id = report.ou_ref_id,
            interval = %report.interval
        );
        async {
            let mut tx = self.pool.begin().await.map_err(db_err)?;
            let sql = format!(
                r#"
                INSERT INTO {t} (id, ou_id, ou_ref_id, profile_id, report_interval,
                                 start_time, end_time, week_of_year, year, score, report,
                                 missing_user_reports_count, stale_user_reports_count)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                ON CONFLICT (ou_id, profile_id, report_interval, week_of_year, year) DO UPDATE
                   SET ou_ref_id = EXCLUDED.ou_ref_id,
                       start_time = EXCLUDED.start_time,
                       end_time = EXCLUDED.end_time,
                       score = EXCLUDED.score,
                       report = EXCLUDED.report,
                       missing_user_reports_count = EXCLUDED.missing_user_reports_count,
                       stale_user_reports_count = EXCLUDED.stale_user_reports_count,
                       updated_at = now()
                RETURNING id
                "#,
                t = self.tenant.table(ReportKind::Org.table())
            );
            let id = sqlx::query_scalar::<_, Uuid>(&sql)
                .bind(Uuid::new_v4())
                .bind(report.ou_id)
                .bind(report.ou_ref_id)
                .bind(report.profile_id)
                .bind(report.interval.as_str())
                .bind(report.start_time)
                .bind(report.end_time)
                .bind(stamp.period.week_of_year)
                .bind(stamp.period.year)
                .bind(report.score)
                .bind(&report.report)
                .bind(report.missing_user_reports_count)
                .bind(report.stale_user_reports_count)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err)?;

            let plan = {
                let mut flags = PgLatestFlags::new(&mut tx, &self.tenant, ReportKind::Org);
                sync_latest_flag(&mut flags, &stamp).await?
            };
            tx.commit().await.map_err(db_err)?;
            info!(report_id = %id, latest = plan.mark_current_as_latest, "org report upserted");
            Ok::<_, TrellisError>(id)
        }
        .instrument(span)
        .await
    }

    async fn get_user_report(&self, id: Uuid) -> Result<Option<UserReport>> {
        let filter = ReportFilter {
            ids: Some(vec![id]),
            ..ReportFilter::default()
        };
        let rows: Vec<UserReportRow> = self.select(ReportKind::User, &filter, None).await?;
        rows.into_iter().next().map(UserReport::try_from).transpose()
    }

    async fn get_org_report(&self, id: Uuid) -> Result<Option<OrgReport>> {
        let filter = ReportFilter {
            ids: Some(vec![id]),
            ..ReportFilter::default()
        };
        let rows: Vec<OrgReportRow> = self.select(ReportKind::Org, &filter, None).await?;
        rows.into_iter().next().map(OrgReport::try_from).transpose()
    }

    async fn delete_user_report(&self, id: Uuid) -> Result<bool> {
        self.delete(ReportKind::User, id).await
    }

    async fn delete_org_report(&self, id: Uuid) -> Result<bool> {
        self.delete(ReportKind::Org, id).await
    }

    async fn list_user_reports(
        &self,
        filter: &ReportFilter,
        page: Page,
    ) -> Result<ListResponse<UserReport>> {
        let listed: ListResponse<UserReportRow> = self.list(ReportKind::User, filter, page).await?;
        let records = listed
            .records
            .into_iter()
            .map(UserReport::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(ListResponse::of(records, listed.total_count))
    }

    async fn list_org_reports(
        &self,
        filter: &ReportFilter,
        page: Page,
    ) -> Result<ListResponse<OrgReport>> {
        let listed: ListResponse<OrgReportRow> = self.list(ReportKind::Org, filter, page).await?;
        let records = listed
            .records
            .into_iter()
            .map(OrgReport::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(ListResponse::of(records, listed.total_count))
    }

    async fn find_user_reports(&self, filter: &ReportFilter) -> Result<Vec<UserReport>> {
        let rows: Vec<UserReportRow> = self.select(ReportKind::User, filter, None).await?;
        rows.into_iter().map(UserReport::try_from).collect()
    }

    async fn find_org_reports(&self, filter: &ReportFilter) -> Result<Vec<OrgReport>> {
        let rows: Vec<OrgReportRow> = self.select(ReportKind::Org, filter, None).await?;
        rows.into_iter().map(OrgReport::try_from).collect()
    }

    async fn upsert_industry_report(&self, report: &IndustryReport) -> Result<Uuid> {
        let sql = format!(
            r#"
            INSERT INTO {SHARED_SCHEMA}.industry_reports (id, report_interval, start_time, score, report)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (report_interval) DO UPDATE
               SET start_time = EXCLUDED.start_time,
                   score = EXCLUDED.score,
                   report = EXCLUDED.report,
                   updated_at = now()
            RETURNING id
            "#
        );
        let id = sqlx::query_scalar::<_, Uuid>(&sql)
            .bind(report.id.unwrap_or_else(Uuid::new_v4))
            .bind(report.interval.as_str())
            .bind(report.start_time)
            .bind(report.score)
            .bind(&report.report)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        info!(report_id = %id, interval = %report.interval, "industry report upserted");
        Ok(id)
    }

    async fn list_industry_reports(
        &self,
        intervals: Option<&[ReportInterval]>,
    ) -> Result<Vec<IndustryReport>> {
        let names: Option<Vec<&str>> = intervals.map(|all| all.iter().map(|i| i.as_str()).collect());
        let sql = format!(
            r#"
            SELECT id, report_interval, start_time, score, report, updated_at
              FROM {SHARED_SCHEMA}.industry_reports
             WHERE ($1::text[] IS NULL OR report_interval = ANY($1))
             ORDER BY report_interval
            "#
        );
        let rows = sqlx::query_as::<_, IndustryReportRow>(&sql)
            .bind(names)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.into_iter().map(IndustryReport::try_from).collect()
    }
}

#[derive(Debug, sqlx::FromRow)]
struct UserReportRow {
    id: Uuid,
    org_user_id: Uuid,
    org_user_ref_id: i32,
    profile_id: Uuid,
    report_interval: String,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    week_of_year: i32,
    year: i32,
    score: Option<i32>,
    report: Value,
    latest: bool,
    incomplete: bool,
    missing_features: Vec<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct OrgReportRow {
    id: Uuid,
    ou_id: Uuid,
    ou_ref_id: i32,
    profile_id: Uuid,
    report_interval: String,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    week_of_year: i32,
    year: i32,
    score: Option<i32>,
    report: Value,
    latest: bool,
    missing_user_reports_count: i32,
    stale_user_reports_count: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct IndustryReportRow {
    id: Uuid,
    report_interval: String,
    start_time: Option<DateTime<Utc>>,
    score: Option<i32>,
    report: Value,
    updated_at: DateTime<Utc>,
}

/// `-1` is the stored sentinel for "not periodic".
fn period_part(value: i32) -> Option<i32> {
    (value >= 0).then_some(value)
}

impl TryFrom<UserReportRow> for UserReport {
    type Error = TrellisError;

    fn try_from(row: UserReportRow) -> Result<Self> {
        Ok(Self {
            id: Some(row.id),
            org_user_id: row.org_user_id,
            org_user_ref_id: row.org_user_ref_id,
            profile_id: row.profile_id,
            interval: row.report_interval.parse()?,
            start_time: row.start_time,
            end_time: row.end_time,
            week_of_year: period_part(row.week_of_year),
            year: period_part(row.year),
            score: row.score,
            report: row.report,
            latest: row.latest,
            incomplete: row.incomplete,
            missing_features: row.missing_features,
            created_at: Some(row.created_at),
            updated_at: Some(row.updated_at),
        })
    }
}

impl TryFrom<OrgReportRow> for OrgReport {
    type Error = TrellisError;

    fn try_from(row: OrgReportRow) -> Result<Self> {
        Ok(Self {
            id: Some(row.id),
            ou_id: row.ou_id,
            ou_ref_id: row.ou_ref_id,
            profile_id: row.profile_id,
            interval: row.report_interval.parse()?,
            start_time: row.start_time,
            end_time: row.end_time,
            week_of_year: period_part(row.week_of_year),
            year: period_part(row.year),
            score: row.score,
            report: row.report,
            latest: row.latest,
            missing_user_reports_count: row.missing_user_reports_count,
            stale_user_reports_count: row.stale_user_reports_count,
            created_at: Some(row.created_at),
            updated_at: Some(row.updated_at),
        })
    }
}

impl TryFrom<IndustryReportRow> for IndustryReport {
    type Error = TrellisError;

    fn try_from(row: IndustryReportRow) -> Result<Self> {
        Ok(Self {
            id: Some(row.id),
            interval: row.report_interval.parse()?,
            start_time: row.start_time,
            score: row.score,
            report: row.report,
            updated_at: Some(row.updated_at),
        })
    }
}
