//! Read-only lookups into the tenant's user / OU directory.

use async_trait::async_trait;
use sqlx::PgPool;
use trellis_core::Result;
use uuid::Uuid;

use crate::{db_err, Tenant};

#[async_trait]
pub trait SubjectDirectory: Send + Sync {
    /// Active org users linked to an integration (tool) account.
    async fn org_user_ids_for_integration_user(&self, integration_user_id: Uuid)
        -> Result<Vec<Uuid>>;

    /// Active OUs an org user belongs to.
    async fn ou_ids_for_org_user(&self, org_user_id: Uuid) -> Result<Vec<Uuid>>;

    async fn ou_ref_id(&self, ou_id: Uuid) -> Result<Option<i32>>;
}

#[derive(Clone)]
pub struct PgSubjectDirectory {
    pool: PgPool,
    tenant: Tenant,
}

impl PgSubjectDirectory {
    pub fn new(pool: PgPool, tenant: Tenant) -> Self {
        Self { pool, tenant }
    }
}

#[async_trait]
impl SubjectDirectory for PgSubjectDirectory {
    async fn org_user_ids_for_integration_user(
        &self,
        integration_user_id: Uuid,
    ) -> Result<Vec<Uuid>> {
        let sql = format!(
            r#"
            SELECT o.id
              FROM {iu} i
              JOIN {users} o ON o.ref_id = i.org_user_ref_id AND o.active
             WHERE i.id = $1
            "#,
            iu = self.tenant.table("integration_users"),
            users = self.tenant.table("org_users"),
        );
        sqlx::query_scalar::<_, Uuid>(&sql)
            .bind(integration_user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn ou_ids_for_org_user(&self, org_user_id: Uuid) -> Result<Vec<Uuid>> {
        let sql = format!(
            r#"
            SELECT DISTINCT m.ou_id
              FROM {members} m
              JOIN {ous} o ON o.id = m.ou_id AND o.active
             WHERE m.org_user_id = $1
             ORDER BY m.ou_id
            "#,
            members = self.tenant.table("ou_members"),
            ous = self.tenant.table("ous"),
        );
        sqlx::query_scalar::<_, Uuid>(&sql)
            .bind(org_user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn ou_ref_id(&self, ou_id: Uuid) -> Result<Option<i32>> {
        let sql = format!(
            "SELECT ref_id FROM {} WHERE id = $1",
            self.tenant.table("ous")
        );
        sqlx::query_scalar::<_, i32>(&sql)
            .bind(ou_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)
    }
}
