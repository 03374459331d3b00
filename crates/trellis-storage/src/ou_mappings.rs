//! OU -> parent profile assignment sync.

use async_trait::async_trait;
use sqlx::PgConnection;
use tracing::debug;
use trellis_core::{OuAssignmentDiff, Result};
use uuid::Uuid;

use crate::{db_err, Tenant};

#[async_trait]
pub trait OuMappingStore: Send {
    async fn existing_ou_ref_ids(&mut self, profile_id: Uuid, trellis_only: bool)
        -> Result<Vec<i32>>;

    async fn delete_mappings(&mut self, profile_id: Uuid, ou_ref_ids: &[i32]) -> Result<u64>;

    /// Bulk upsert keyed on the OU alone: an OU owned by another profile moves to `profile_id`.
    async fn upsert_mappings(&mut self, profile_id: Uuid, ou_ref_ids: &[i32]) -> Result<u64>;
}

/// Reconciles the trellis-enabled OUs of `profile_id` with `desired`.
///
/// Issues at most one bulk delete and one bulk upsert; equal sets perform no writes.
pub async fn sync_ou_assignments<S>(
    store: &mut S,
    profile_id: Uuid,
    desired: &[i32],
) -> Result<OuAssignmentDiff>
where
    S: OuMappingStore + ?Sized,
{
    let existing = store.existing_ou_ref_ids(profile_id, true).await?;
    let diff = OuAssignmentDiff::between(existing, desired.iter().copied());
    if diff.is_noop() {
        debug!(%profile_id, "ou mappings unchanged");
        return Ok(diff);
    }
    if !diff.to_delete.is_empty() {
        let ids: Vec<i32> = diff.to_delete.iter().copied().collect();
        store.delete_mappings(profile_id, &ids).await?;
    }
    if !diff.to_insert.is_empty() {
        let ids: Vec<i32> = diff.to_insert.iter().copied().collect();
        store.upsert_mappings(profile_id, &ids).await?;
    }
    debug!(
        %profile_id,
        removed = diff.to_delete.len(),
        added = diff.to_insert.len(),
        "ou mappings synced"
    );
    Ok(diff)
}

pub struct PgOuMappings<'c> {
    conn: &'c mut PgConnection,
    tenant: &'c Tenant,
}

impl<'c> PgOuMappings<'c> {
    pub fn new(conn: &'c mut PgConnection, tenant: &'c Tenant) -> Self {
        Self { conn, tenant }
    }
}

#[async_trait]
impl OuMappingStore for PgOuMappings<'_> {
    async fn existing_ou_ref_ids(
        &mut self,
        profile_id: Uuid,
        trellis_only: bool,
    ) -> Result<Vec<i32>> {
        let sql = format!(
            "SELECT ou_ref_id FROM {} WHERE parent_profile_id = $1 AND ($2 = false OR trellis_enabled) ORDER BY ou_ref_id",
            self.tenant.table("parent_profile_ou_mappings")
        );
        sqlx::query_scalar::<_, i32>(&sql)
            .bind(profile_id)
            .bind(trellis_only)
            .fetch_all(&mut *self.conn)
            .await
            .map_err(db_err)
    }

    async fn delete_mappings(&mut self, profile_id: Uuid, ou_ref_ids: &[i32]) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE parent_profile_id = $1 AND ou_ref_id = ANY($2)",
            self.tenant.table("parent_profile_ou_mappings")
        );
        let done = sqlx::query(&sql)
            .bind(profile_id)
            .bind(ou_ref_ids)
            .execute(&mut *self.conn)
            .await
            .map_err(db_err)?;
        Ok(done.rows_affected())
    }

    async fn upsert_mappings(&mut self, profile_id: Uuid, ou_ref_ids: &[i32]) -> Result<u64> {
        upsert_ou_mappings(&mut *self.conn, self.tenant, profile_id, ou_ref_ids).await
    }
}

pub(crate) async fn upsert_ou_mappings(
    conn: &mut PgConnection,
    tenant: &Tenant,
    profile_id: Uuid,
    ou_ref_ids: &[i32],
) -> Result<u64> {
    if ou_ref_ids.is_empty() {
        return Ok(0);
    }
    let sql = format!(
        r#"
        INSERT INTO {t} (ou_ref_id, parent_profile_id, trellis_enabled)
        SELECT DISTINCT ou, $2::uuid, true FROM unnest($1::int[]) AS ou
        ON CONFLICT (ou_ref_id) DO UPDATE
           SET parent_profile_id = EXCLUDED.parent_profile_id,
               trellis_enabled = true,
               updated_at = now()
        "#,
        t = tenant.table("parent_profile_ou_mappings")
    );
    let done = sqlx::query(&sql)
        .bind(ou_ref_ids)
        .bind(profile_id)
        .execute(conn)
        .await
        .map_err(db_err)?;
    Ok(done.rows_affected())
}
