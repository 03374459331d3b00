//! Idempotent DDL for tenant and shared schemas.

use sqlx::PgPool;
use tracing::info;
use trellis_core::Result;

use crate::{db_err, Tenant, SHARED_SCHEMA};

const TENANT_DDL: &[&str] = &[
    "CREATE SCHEMA IF NOT EXISTS {s}",
    r#"
    CREATE TABLE IF NOT EXISTS {s}.parent_profiles (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL,
        description TEXT,
        predefined_profile BOOLEAN NOT NULL DEFAULT false,
        effort_investment_profile_id UUID,
        feature_ticket_categories_map JSONB NOT NULL DEFAULT '{}'::jsonb,
        settings JSONB NOT NULL DEFAULT '{}'::jsonb,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS {s}.sub_profiles (
        id UUID PRIMARY KEY,
        parent_profile_id UUID REFERENCES {s}.parent_profiles(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        description TEXT,
        order_index INTEGER NOT NULL,
        enabled BOOLEAN NOT NULL DEFAULT true,
        matching_criteria JSONB NOT NULL DEFAULT '[]'::jsonb,
        settings JSONB NOT NULL DEFAULT '{}'::jsonb,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (parent_profile_id, order_index)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS {s}.profile_sections (
        id UUID PRIMARY KEY,
        sub_profile_id UUID NOT NULL REFERENCES {s}.sub_profiles(id) ON DELETE CASCADE,
        order_index INTEGER NOT NULL,
        body JSONB NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS {s}.profile_features (
        id UUID PRIMARY KEY,
        section_id UUID NOT NULL REFERENCES {s}.profile_sections(id) ON DELETE CASCADE,
        sub_profile_id UUID NOT NULL REFERENCES {s}.sub_profiles(id) ON DELETE CASCADE,
        feature_type TEXT NOT NULL,
        order_index INTEGER NOT NULL,
        body JSONB NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS {s}.feature_category_mappings (
        feature_id UUID NOT NULL REFERENCES {s}.profile_features(id) ON DELETE CASCADE,
        ticket_category_id UUID NOT NULL,
        position INTEGER NOT NULL,
        PRIMARY KEY (feature_id, ticket_category_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS {s}.parent_profile_default (
        default_col TEXT PRIMARY KEY DEFAULT 'Default',
        parent_profile_id UUID NOT NULL REFERENCES {s}.parent_profiles(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS {s}.parent_profile_ou_mappings (
        ou_ref_id INTEGER PRIMARY KEY,
        parent_profile_id UUID NOT NULL REFERENCES {s}.parent_profiles(id) ON DELETE CASCADE,
        trellis_enabled BOOLEAN NOT NULL DEFAULT true,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS parent_profile_ou_mappings_profile_idx ON {s}.parent_profile_ou_mappings (parent_profile_id)",
    r#"
    CREATE TABLE IF NOT EXISTS {s}.org_users (
        id UUID PRIMARY KEY,
        ref_id INTEGER NOT NULL,
        full_name TEXT,
        email TEXT,
        active BOOLEAN NOT NULL DEFAULT true
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS org_users_active_ref_idx ON {s}.org_users (ref_id) WHERE active",
    r#"
    CREATE TABLE IF NOT EXISTS {s}.ous (
        id UUID PRIMARY KEY,
        ref_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        active BOOLEAN NOT NULL DEFAULT true
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS ous_active_ref_idx ON {s}.ous (ref_id) WHERE active",
    r#"
    CREATE TABLE IF NOT EXISTS {s}.ou_members (
        ou_id UUID NOT NULL REFERENCES {s}.ous(id) ON DELETE CASCADE,
        org_user_id UUID NOT NULL REFERENCES {s}.org_users(id) ON DELETE CASCADE,
        PRIMARY KEY (ou_id, org_user_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS {s}.integration_users (
        id UUID PRIMARY KEY,
        org_user_ref_id INTEGER NOT NULL,
        integration_id INTEGER,
        cloud_id TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS {s}.user_reports (
        id UUID PRIMARY KEY,
        org_user_id UUID NOT NULL,
        org_user_ref_id INTEGER NOT NULL,
        profile_id UUID NOT NULL,
        report_interval TEXT NOT NULL,
        start_time TIMESTAMPTZ NOT NULL,
        end_time TIMESTAMPTZ NOT NULL,
        week_of_year INTEGER NOT NULL DEFAULT -1,
        year INTEGER NOT NULL DEFAULT -1,
        score INTEGER,
        report JSONB NOT NULL DEFAULT '{}'::jsonb,
        latest BOOLEAN NOT NULL DEFAULT false,
        incomplete BOOLEAN NOT NULL DEFAULT false,
        missing_features TEXT[] NOT NULL DEFAULT '{}',
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS user_reports_subject_period_idx ON {s}.user_reports (org_user_id, profile_id, report_interval, week_of_year, year)",
    "CREATE UNIQUE INDEX IF NOT EXISTS user_reports_latest_idx ON {s}.user_reports (org_user_ref_id, profile_id, report_interval, week_of_year, year) WHERE latest",
    r#"
    CREATE TABLE IF NOT EXISTS {s}.org_reports (
        id UUID PRIMARY KEY,
        ou_id UUID NOT NULL,
        ou_ref_id INTEGER NOT NULL,
        profile_id UUID NOT NULL,
        report_interval TEXT NOT NULL,
        start_time TIMESTAMPTZ NOT NULL,
        end_time TIMESTAMPTZ NOT NULL,
        week_of_year INTEGER NOT NULL DEFAULT -1,
        year INTEGER NOT NULL DEFAULT -1,
        score INTEGER,
        report JSONB NOT NULL DEFAULT '{}'::jsonb,
        latest BOOLEAN NOT NULL DEFAULT false,
        missing_user_reports_count INTEGER NOT NULL DEFAULT 0,
        stale_user_reports_count INTEGER NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS org_reports_subject_period_idx ON {s}.org_reports (ou_id, profile_id, report_interval, week_of_year, year)",
    "CREATE UNIQUE INDEX IF NOT EXISTS org_reports_latest_idx ON {s}.org_reports (ou_ref_id, profile_id, report_interval, week_of_year, year) WHERE latest",
];

const SHARED_DDL: &[&str] = &[
    "CREATE SCHEMA IF NOT EXISTS {s}",
    r#"
    CREATE TABLE IF NOT EXISTS {s}.industry_reports (
        id UUID PRIMARY KEY,
        report_interval TEXT NOT NULL UNIQUE,
        start_time TIMESTAMPTZ,
        score INTEGER,
        report JSONB NOT NULL DEFAULT '{}'::jsonb,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
];

fn render(statements: &[&str], schema: &str) -> Vec<String> {
    statements
        .iter()
        .map(|stmt| stmt.replace("{s}", schema))
        .collect()
}

async fn apply(pool: &PgPool, statements: Vec<String>) -> Result<()> {
    let mut tx = pool.begin().await.map_err(db_err)?;
    for stmt in &statements {
        sqlx::query(stmt).execute(&mut *tx).await.map_err(db_err)?;
    }
    tx.commit().await.map_err(db_err)
}

pub async fn ensure_tenant_schema(pool: &PgPool, tenant: &Tenant) -> Result<()> {
    apply(pool, render(TENANT_DDL, tenant.as_str())).await?;
    info!(%tenant, "tenant schema ready");
    Ok(())
}

pub async fn ensure_shared_schema(pool: &PgPool) -> Result<()> {
    apply(pool, render(SHARED_DDL, SHARED_SCHEMA)).await?;
    info!(schema = SHARED_SCHEMA, "shared schema ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_statement_is_schema_qualified() {
        for stmt in render(TENANT_DDL, "acme") {
            assert!(!stmt.contains("{s}"));
            assert!(stmt.contains("acme"), "unqualified statement: {stmt}");
        }
    }

    #[test]
    fn latest_indexes_are_partial() {
        let latest: Vec<_> = TENANT_DDL
            .iter()
            .filter(|s| s.contains("_latest_idx"))
            .collect();
        assert_eq!(latest.len(), 2);
        assert!(latest.iter().all(|s| s.trim_end().ends_with("WHERE latest")));
    }
}
