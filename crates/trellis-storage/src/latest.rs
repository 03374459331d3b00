//! Keeps a single `latest` row per report series inside the upsert transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use tracing::debug;
use trellis_core::{
    CurrentLatest, LatestFlagPlan, PeriodKey, ReportSeries, ReportStamp, Result, TrellisError,
};
use uuid::Uuid;

use crate::{db_err, Tenant};

/// Which report table (and which directory table) a series lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    User,
    Org,
}

impl ReportKind {
    pub fn table(self) -> &'static str {
        match self {
            Self::User => "user_reports",
            Self::Org => "org_reports",
        }
    }

    pub fn subject_column(self) -> &'static str {
        match self {
            Self::User => "org_user_id",
            Self::Org => "ou_id",
        }
    }

    pub fn ref_column(self) -> &'static str {
        match self {
            Self::User => "org_user_ref_id",
            Self::Org => "ou_ref_id",
        }
    }

    /// Directory table resolving a ref id to its active subject.
    pub fn directory_table(self) -> &'static str {
        match self {
            Self::User => "org_users",
            Self::Org => "ous",
        }
    }
}

#[async_trait]
pub trait LatestFlagStore: Send {
    async fn active_subject_id(&mut self, subject_ref_id: i32) -> Result<Option<Uuid>>;

    async fn current_latest(&mut self, series: &ReportSeries) -> Result<Option<CurrentLatest>>;

    async fn clear_series(&mut self, series: &ReportSeries) -> Result<u64>;

    /// Clears `latest` on rows of `period` whose subject is not `keep_subject`.
    async fn clear_stale(
        &mut self,
        series: &ReportSeries,
        period: PeriodKey,
        keep_subject: Uuid,
    ) -> Result<u64>;

    async fn mark(&mut self, subject_id: Uuid, series: &ReportSeries, period: PeriodKey)
        -> Result<u64>;
}

/// Applies the latest-flag rule for a report that was just written.
///
/// Must run in the transaction that performed the upsert.
pub async fn sync_latest_flag<S>(store: &mut S, stamp: &ReportStamp) -> Result<LatestFlagPlan>
where
    S: LatestFlagStore + ?Sized,
{
    let series = &stamp.series;
    let active = store
        .active_subject_id(series.subject_ref_id)
        .await?
        .ok_or_else(|| {
            TrellisError::not_found(format!(
                "no active subject for ref id {}",
                series.subject_ref_id
            ))
        })?;
    let current = store.current_latest(series).await?;
    let plan = LatestFlagPlan::decide(
        stamp.subject_id,
        active,
        current.as_ref(),
        series.interval,
        stamp.start_time,
    );

    if plan.unmark_all {
        store.clear_series(series).await?;
    } else if plan.unmark_current_latest {
        store
            .clear_stale(series, stamp.period, stamp.subject_id)
            .await?;
    }
    if plan.mark_current_as_latest {
        let marked = store.mark(stamp.subject_id, series, stamp.period).await?;
        if marked == 0 {
            return Err(TrellisError::storage(format!(
                "latest flag update for ref id {} affected no rows",
                series.subject_ref_id
            )));
        }
    }
    debug!(
        ref_id = series.subject_ref_id,
        profile_id = %series.profile_id,
        interval = %series.interval,
        ?plan,
        "latest flag synced"
    );
    Ok(plan)
}

pub struct PgLatestFlags<'c> {
    conn: &'c mut PgConnection,
    tenant: &'c Tenant,
    kind: ReportKind,
}

impl<'c> PgLatestFlags<'c> {
    pub fn new(conn: &'c mut PgConnection, tenant: &'c Tenant, kind: ReportKind) -> Self {
        Self { conn, tenant, kind }
    }

    fn reports(&self) -> String {
        self.tenant.table(self.kind.table())
    }
}

#[async_trait]
impl LatestFlagStore for PgLatestFlags<'_> {
    async fn active_subject_id(&mut self, subject_ref_id: i32) -> Result<Option<Uuid>> {
        let sql = format!(
            "SELECT id FROM {} WHERE ref_id = $1 AND active LIMIT 1",
            self.tenant.table(self.kind.directory_table())
        );
        sqlx::query_scalar::<_, Uuid>(&sql)
            .bind(subject_ref_id)
            .fetch_optional(&mut *self.conn)
            .await
            .map_err(db_err)
    }

    async fn current_latest(&mut self, series: &ReportSeries) -> Result<Option<CurrentLatest>> {
        let sql = format!(
            r#"
            SELECT {subject}, start_time
              FROM {t}
             WHERE {r} = $1 AND profile_id = $2 AND report_interval = $3 AND latest
             ORDER BY start_time DESC
             LIMIT 1
            "#,
            subject = self.kind.subject_column(),
            t = self.reports(),
            r = self.kind.ref_column(),
        );
        let row = sqlx::query_as::<_, (Uuid, DateTime<Utc>)>(&sql)
            .bind(series.subject_ref_id)
            .bind(series.profile_id)
            .bind(series.interval.as_str())
            .fetch_optional(&mut *self.conn)
            .await
            .map_err(db_err)?;
        Ok(row.map(|(subject_id, start_time)| CurrentLatest {
            subject_id,
            start_time,
        }))
    }

    async fn clear_series(&mut self, series: &ReportSeries) -> Result<u64> {
        let sql = format!(
            "UPDATE {t} SET latest = false WHERE {r} = $1 AND profile_id = $2 AND report_interval = $3 AND latest",
            t = self.reports(),
            r = self.kind.ref_column(),
        );
        let done = sqlx::query(&sql)
            .bind(series.subject_ref_id)
            .bind(series.profile_id)
            .bind(series.interval.as_str())
            .execute(&mut *self.conn)
            .await
            .map_err(db_err)?;
        Ok(done.rows_affected())
    }

    async fn clear_stale(
        &mut self,
        series: &ReportSeries,
        period: PeriodKey,
        keep_subject: Uuid,
    ) -> Result<u64> {
        let sql = format!(
            r#"
            UPDATE {t} SET latest = false
             WHERE {r} = $1 AND profile_id = $2 AND report_interval = $3
               AND week_of_year = $4 AND year = $5
               AND {subject} <> $6 AND latest
            "#,
            t = self.reports(),
            r = self.kind.ref_column(),
            subject = self.kind.subject_column(),
        );
        let done = sqlx::query(&sql)
            .bind(series.subject_ref_id)
            .bind(series.profile_id)
            .bind(series.interval.as_str())
            .bind(period.week_of_year)
            .bind(period.year)
            .bind(keep_subject)
            .execute(&mut *self.conn)
            .await
            .map_err(db_err)?;
        Ok(done.rows_affected())
    }

    async fn mark(
        &mut self,
        subject_id: Uuid,
        series: &ReportSeries,
        period: PeriodKey,
    ) -> Result<u64> {
        let sql = format!(
            r#"
            UPDATE {t} SET latest = true
             WHERE {subject} = $1 AND {r} = $2 AND profile_id = $3 AND report_interval = $4
               AND week_of_year = $5 AND year = $6
            "#,
            t = self.reports(),
            r = self.kind.ref_column(),
            subject = self.kind.subject_column(),
        );
        let done = sqlx::query(&sql)
            .bind(subject_id)
            .bind(series.subject_ref_id)
            .bind(series.profile_id)
            .bind(series.interval.as_str())
            .bind(period.week_of_year)
            .bind(period.year)
            .execute(&mut *self.conn)
            .await
            .map_err(db_err)?;
        Ok(done.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::collections::HashMap;
    use trellis_core::ReportInterval;

    #[derive(Debug, Clone)]
    struct Row {
        subject: Uuid,
        ref_id: i32,
        profile: Uuid,
        interval: ReportInterval,
        period: PeriodKey,
        start: DateTime<Utc>,
        latest: bool,
    }

    /// In-memory report table that enforces the partial unique index on `latest`.
    #[derive(Default)]
    struct FakeTable {
        rows: Vec<Row>,
        active: HashMap<i32, Uuid>,
    }

    impl FakeTable {
        fn in_series<'a>(&'a mut self, s: &'a ReportSeries) -> impl Iterator<Item = &'a mut Row> {
            self.rows.iter_mut().filter(move |r| {
                r.ref_id == s.subject_ref_id && r.profile == s.profile_id && r.interval == s.interval
            })
        }

        fn latest_count(&self, ref_id: i32) -> usize {
            self.rows
                .iter()
                .filter(|r| r.ref_id == ref_id && r.latest)
                .count()
        }

        fn is_latest(&self, subject: Uuid, period: PeriodKey) -> bool {
            self.rows
                .iter()
                .any(|r| r.subject == subject && r.period == period && r.latest)
        }

        /// Report upsert keyed on subject/profile/interval/period, followed by the flag sync.
        async fn upsert(&mut self, stamp: ReportStamp) -> Result<LatestFlagPlan> {
            let s = stamp.series;
            match self.rows.iter_mut().find(|r| {
                r.subject == stamp.subject_id
                    && r.profile == s.profile_id
                    && r.interval == s.interval
                    && r.period == stamp.period
            }) {
                Some(row) => row.start = stamp.start_time,
                None => self.rows.push(Row {
                    subject: stamp.subject_id,
                    ref_id: s.subject_ref_id,
                    profile: s.profile_id,
                    interval: s.interval,
                    period: stamp.period,
                    start: stamp.start_time,
                    latest: false,
                }),
            }
            sync_latest_flag(self, &stamp).await
        }
    }

    #[async_trait]
    impl LatestFlagStore for FakeTable {
        async fn active_subject_id(&mut self, subject_ref_id: i32) -> Result<Option<Uuid>> {
            Ok(self.active.get(&subject_ref_id).copied())
        }

        async fn current_latest(&mut self, series: &ReportSeries) -> Result<Option<CurrentLatest>> {
            Ok(self
                .in_series(series)
                .filter(|r| r.latest)
                .max_by_key(|r| r.start)
                .map(|r| CurrentLatest {
                    subject_id: r.subject,
                    start_time: r.start,
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
            for row in self
                .in_series(series)
                .filter(|r| r.period == period && r.subject != keep_subject && r.latest)
            {
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
            let clash = self.rows.iter().any(|r| {
                r.latest
                    && r.subject != subject_id
                    && r.ref_id == series.subject_ref_id
                    && r.profile == series.profile_id
                    && r.interval == series.interval
                    && r.period == period
            });
            if clash {
                return Err(TrellisError::storage("duplicate key violates latest index"));
            }
            let mut n = 0;
            for row in self
                .in_series(series)
                .filter(|r| r.subject == subject_id && r.period == period)
            {
                row.latest = true;
                n += 1;
            }
            Ok(n)
        }
    }

    const REF: i32 = 17;

    fn base() -> DateTime<Utc> {
        DateTime::from_timestamp(1_670_198_400, 0).unwrap()
    }

    fn stamp(
        subject: Uuid,
        profile: Uuid,
        interval: ReportInterval,
        week: i32,
    ) -> ReportStamp {
        let periodic = interval.is_periodic();
        ReportStamp {
            subject_id: subject,
            series: ReportSeries {
                subject_ref_id: REF,
                profile_id: profile,
                interval,
            },
            period: if periodic {
                PeriodKey::new(Some(week), Some(2023))
            } else {
                PeriodKey::NONE
            },
            start_time: base() + Duration::weeks(i64::from(week)),
        }
    }

    #[tokio::test]
    async fn weekly_sequence_keeps_one_latest() {
        let (user, profile) = (Uuid::new_v4(), Uuid::new_v4());
        let mut table = FakeTable::default();
        table.active.insert(REF, user);

        for week in 1..=6 {
            table
                .upsert(stamp(user, profile, ReportInterval::LastWeek, week))
                .await
                .unwrap();
            assert_eq!(table.latest_count(REF), 1);
        }
        assert!(table.is_latest(user, PeriodKey::new(Some(6), Some(2023))));
    }

    #[tokio::test]
    async fn late_week_does_not_displace_newer_week() {
        let (user, profile) = (Uuid::new_v4(), Uuid::new_v4());
        let mut table = FakeTable::default();
        table.active.insert(REF, user);

        table
            .upsert(stamp(user, profile, ReportInterval::LastWeek, 10))
            .await
            .unwrap();
        let plan = table
            .upsert(stamp(user, profile, ReportInterval::LastWeek, 9))
            .await
            .unwrap();

        assert_eq!(plan, LatestFlagPlan::default());
        assert!(table.is_latest(user, PeriodKey::new(Some(10), Some(2023))));
        assert!(!table.is_latest(user, PeriodKey::new(Some(9), Some(2023))));
        assert_eq!(table.latest_count(REF), 1);
    }

    #[tokio::test]
    async fn rotated_identity_takes_over_latest() {
        let (old, new, profile) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let mut table = FakeTable::default();
        table.active.insert(REF, old);
        table
            .upsert(stamp(old, profile, ReportInterval::LastQuarter, 0))
            .await
            .unwrap();
        assert!(table.is_latest(old, PeriodKey::NONE));

        table.active.insert(REF, new);
        let plan = table
            .upsert(stamp(new, profile, ReportInterval::LastQuarter, 0))
            .await
            .unwrap();

        assert!(plan.unmark_current_latest);
        assert!(table.is_latest(new, PeriodKey::NONE));
        assert!(!table.is_latest(old, PeriodKey::NONE));
        assert_eq!(table.latest_count(REF), 1);
    }

    #[tokio::test]
    async fn rotated_identity_on_weekly_series_clears_whole_series() {
        let (old, new, profile) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let mut table = FakeTable::default();
        table.active.insert(REF, old);
        table
            .upsert(stamp(old, profile, ReportInterval::LastTwoWeeks, 3))
            .await
            .unwrap();

        table.active.insert(REF, new);
        let plan = table
            .upsert(stamp(new, profile, ReportInterval::LastTwoWeeks, 3))
            .await
            .unwrap();

        assert!(plan.unmark_all);
        assert!(table.is_latest(new, PeriodKey::new(Some(3), Some(2023))));
        assert_eq!(table.latest_count(REF), 1);
    }

    #[tokio::test]
    async fn reupserting_same_report_keeps_it_latest() {
        let (user, profile) = (Uuid::new_v4(), Uuid::new_v4());
        let mut table = FakeTable::default();
        table.active.insert(REF, user);

        for _ in 0..3 {
            table
                .upsert(stamp(user, profile, ReportInterval::LastMonth, 0))
                .await
                .unwrap();
        }
        assert_eq!(table.rows.len(), 1);
        assert!(table.is_latest(user, PeriodKey::NONE));
    }

    #[tokio::test]
    async fn stale_subject_report_stays_unflagged() {
        let (old, new, profile) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let mut table = FakeTable::default();
        table.active.insert(REF, new);
        table
            .upsert(stamp(new, profile, ReportInterval::PastYear, 0))
            .await
            .unwrap();

        table
            .upsert(stamp(old, profile, ReportInterval::PastYear, 0))
            .await
            .unwrap();
        assert!(table.is_latest(new, PeriodKey::NONE));
        assert!(!table.is_latest(old, PeriodKey::NONE));
    }

    #[tokio::test]
    async fn missing_active_subject_is_not_found() {
        let mut table = FakeTable::default();
        let err = table
            .upsert(stamp(
                Uuid::new_v4(),
                Uuid::new_v4(),
                ReportInterval::LastWeek,
                1,
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, TrellisError::NotFound(_)));
    }
}
