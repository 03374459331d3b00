//! Hierarchy store: parent profiles and their sub-profile / section / feature trees.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::{PgConnection, PgPool};
use tracing::{info, info_span, Instrument};
use trellis_core::{
    diff_sub_profiles, Feature, FeatureType, ListResponse, OuAssignmentDiff, Page, ParentProfile,
    Result, Section, SubProfile, SubProfileChange, TrellisError,
};
use uuid::Uuid;

use crate::ou_mappings::{sync_ou_assignments, upsert_ou_mappings, PgOuMappings};
use crate::{db_err, rewrap_profile_err, Tenant};

const DEFAULT_MARKER: &str = "Default";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileFilter {
    #[serde(default)]
    pub ids: Option<Vec<Uuid>>,
    #[serde(default)]
    pub names: Option<Vec<String>>,
    /// Case-insensitive substring match on the name.
    #[serde(default)]
    pub partial_name: Option<String>,
    #[serde(default)]
    pub ou_ref_ids: Option<Vec<i32>>,
}

#[async_trait]
pub trait ProfileRepository: Send + Sync {
    async fn create_profile(&self, profile: &ParentProfile) -> Result<Uuid>;

    /// Creates the profile and makes it the tenant default in one transaction.
    async fn create_and_make_default(&self, profile: &ParentProfile) -> Result<Uuid>;

    async fn update_profile(&self, id: Uuid, profile: &ParentProfile) -> Result<()>;

    /// Copies `payload` onto each target OU; returns the profile ids now serving them.
    async fn clone_profile_to_ous(
        &self,
        payload: &ParentProfile,
        target_ou_ref_ids: &[i32],
    ) -> Result<Vec<Uuid>>;

    async fn delete_profile(&self, id: Uuid) -> Result<()>;

    async fn delete_profiles_by_ou_ref_ids(&self, ou_ref_ids: &[i32]) -> Result<u64>;

    async fn get_profile(&self, id: Uuid) -> Result<Option<ParentProfile>>;

    async fn list_profiles(
        &self,
        filter: &ProfileFilter,
        page: Page,
    ) -> Result<ListResponse<ParentProfile>>;

    async fn get_default_profile(&self) -> Result<Option<ParentProfile>>;

    async fn upsert_default_profile(&self, id: Uuid) -> Result<()>;

    /// Trellis-enabled profile serving an OU.
    async fn profile_for_ou(&self, ou_ref_id: i32) -> Result<Option<ParentProfile>>;

    async fn sync_ou_assignments(&self, profile_id: Uuid, desired: &[i32])
        -> Result<OuAssignmentDiff>;

    async fn set_trellis_enabled(&self, ou_ref_ids: &[i32], enabled: bool) -> Result<u64>;

    async fn delete_ou_mapping(&self, ou_ref_id: i32) -> Result<u64>;
}

#[derive(Clone)]
pub struct PgProfileStore {
    pool: PgPool,
    tenant: Tenant,
}

impl PgProfileStore {
    pub fn new(pool: PgPool, tenant: Tenant) -> Self {
        Self { pool, tenant }
    }

    pub fn tenant(&self) -> &Tenant {
        &self.tenant
    }

    /// Installs the central profile from a JSON file unless the tenant already has a default.
    pub async fn seed_central_profile(&self, path: &Path) -> Result<Option<Uuid>> {
        if let Some(existing) = self.get_default_profile().await? {
            info!(
                tenant = %self.tenant,
                profile_id = ?existing.id,
                "central profile already present; skipping seed"
            );
            return Ok(None);
        }
        let profile = load_profile_file(path).await?;
        let id = self.create_and_make_default(&profile).await?;
        info!(tenant = %self.tenant, profile_id = %id, path = %path.display(), "central profile seeded");
        Ok(Some(id))
    }

    async fn create_in_tx(&self, profile: &ParentProfile, make_default: bool) -> Result<Uuid> {
        profile.validate()?;
        let span = info_span!("create_profile", tenant = %self.tenant, make_default);
        async {
            let mut tx = self.pool.begin().await.map_err(db_err)?;
            let id = insert_tree(&mut tx, &self.tenant, profile).await?;
            if make_default {
                upsert_default(&mut tx, &self.tenant, id).await?;
            }
            tx.commit().await.map_err(db_err)?;
            info!(profile_id = %id, sub_profiles = profile.sub_profiles.len(), "profile created");
            Ok::<_, TrellisError>(id)
        }
        .instrument(span)
        .await
        .map_err(|err| rewrap_profile_err("insert", err))
    }
}

#[async_trait]
impl ProfileRepository for PgProfileStore {
    async fn create_profile(&self, profile: &ParentProfile) -> Result<Uuid> {
        self.create_in_tx(profile, false).await
    }

    async fn create_and_make_default(&self, profile: &ParentProfile) -> Result<Uuid> {
        self.create_in_tx(profile, true).await
    }

    async fn update_profile(&self, id: Uuid, profile: &ParentProfile) -> Result<()> {
        profile.validate()?;
        let span = info_span!("update_profile", tenant = %self.tenant, profile_id = %id);
        async {
            let mut tx = self.pool.begin().await.map_err(db_err)?;
            update_tree(&mut tx, &self.tenant, id, profile).await?;
            tx.commit().await.map_err(db_err)?;
            info!("profile updated");
            Ok::<_, TrellisError>(())
        }
        .instrument(span)
        .await
        .map_err(|err| rewrap_profile_err("update", err))
    }

    async fn clone_profile_to_ous(
        &self,
        payload: &ParentProfile,
        target_ou_ref_ids: &[i32],
    ) -> Result<Vec<Uuid>> {
        payload.validate()?;
        let span = info_span!("clone_profile", tenant = %self.tenant, targets = ?target_ou_ref_ids);
        async {
            let mut tx = self.pool.begin().await.map_err(db_err)?;
            let central_id = default_profile_id(&mut tx, &self.tenant)
                .await?
                .ok_or_else(|| TrellisError::not_found("central profile is not configured"))?;
            let central = load_one(&mut tx, &self.tenant, central_id)
                .await?
                .ok_or_else(|| TrellisError::not_found(format!("central profile {central_id}")))?;

            let targets: Vec<i32> = target_ou_ref_ids
                .iter()
                .chain(payload.associated_ou_ref_ids.iter())
                .copied()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            let owners = ou_owners(&mut tx, &self.tenant, &targets).await?;

            let served = match plan_clone(payload, &central, central_id, &targets, &owners)? {
                ClonePlan::RepointToCentral { targets, orphaned } => {
                    delete_profiles_except(&mut tx, &self.tenant, &orphaned, central_id).await?;
                    upsert_ou_mappings(&mut tx, &self.tenant, central_id, &targets).await?;
                    info!(ous = targets.len(), removed = orphaned.len(), "targets repointed to central profile");
                    vec![central_id]
                }
                ClonePlan::PerOu(steps) => {
                    let mut served = Vec::with_capacity(steps.len());
                    for step in steps {
                        match step {
                            CloneTarget::Update {
                                ou_ref_id,
                                profile_id,
                            } => {
                                let scoped = payload.with_associated_ous(vec![ou_ref_id]);
                                update_tree(&mut tx, &self.tenant, profile_id, &scoped).await?;
                                served.push(profile_id);
                            }
                            CloneTarget::Insert { ou_ref_id } => {
                                let scoped = payload.with_associated_ous(vec![ou_ref_id]);
                                served.push(insert_tree(&mut tx, &self.tenant, &scoped).await?);
                            }
                        }
                    }
                    info!(ous = served.len(), "profile cloned per OU");
                    served
                }
            };
            tx.commit().await.map_err(db_err)?;
            Ok::<_, TrellisError>(served)
        }
        .instrument(span)
        .await
        .map_err(|err| rewrap_profile_err("clone", err))
    }

    async fn delete_profile(&self, id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        ensure_not_default(id, default_profile_id(&mut tx, &self.tenant).await?)?;
        let sql = format!(
            "DELETE FROM {} WHERE id = $1",
            self.tenant.table("parent_profiles")
        );
        let done = sqlx::query(&sql)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        if done.rows_affected() == 0 {
            return Err(TrellisError::not_found(format!("profile {id}")));
        }
        tx.commit().await.map_err(db_err)?;
        info!(tenant = %self.tenant, profile_id = %id, "profile deleted");
        Ok(())
    }

    async fn delete_profiles_by_ou_ref_ids(&self, ou_ref_ids: &[i32]) -> Result<u64> {
        if ou_ref_ids.is_empty() {
            return Err(TrellisError::validation("at least one ou ref id is required"));
        }
        let sql = format!(
            r#"
            DELETE FROM {p} p
             USING {m} m
             WHERE m.parent_profile_id = p.id
               AND m.ou_ref_id = ANY($1)
               AND NOT EXISTS (SELECT 1 FROM {d} d WHERE d.parent_profile_id = p.id)
            "#,
            p = self.tenant.table("parent_profiles"),
            m = self.tenant.table("parent_profile_ou_mappings"),
            d = self.tenant.table("parent_profile_default"),
        );
        let done = sqlx::query(&sql)
            .bind(ou_ref_ids)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        info!(tenant = %self.tenant, deleted = done.rows_affected(), "profiles deleted by ou");
        Ok(done.rows_affected())
    }

    async fn get_profile(&self, id: Uuid) -> Result<Option<ParentProfile>> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        load_one(&mut conn, &self.tenant, id).await
    }

    async fn list_profiles(
        &self,
        filter: &ProfileFilter,
        page: Page,
    ) -> Result<ListResponse<ParentProfile>> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        let criteria = filter_clause(&self.tenant);
        let sql = format!(
            "SELECT p.id FROM {p} p WHERE {criteria} ORDER BY p.updated_at DESC, p.id LIMIT $5 OFFSET $6",
            p = self.tenant.table("parent_profiles"),
        );
        let ids = sqlx::query_scalar::<_, Uuid>(&sql)
            .bind(filter.ids.as_deref())
            .bind(filter.names.as_deref())
            .bind(filter.partial_name.as_deref())
            .bind(filter.ou_ref_ids.as_deref())
            .bind(page.limit())
            .bind(page.offset())
            .fetch_all(&mut *conn)
            .await
            .map_err(db_err)?;

        let total = match page.known_total(ids.len()) {
            Some(total) => total,
            None => {
                let sql = format!(
                    "SELECT COUNT(*) FROM {p} p WHERE {criteria}",
                    p = self.tenant.table("parent_profiles"),
                );
                sqlx::query_scalar::<_, i64>(&sql)
                    .bind(filter.ids.as_deref())
                    .bind(filter.names.as_deref())
                    .bind(filter.partial_name.as_deref())
                    .bind(filter.ou_ref_ids.as_deref())
                    .fetch_one(&mut *conn)
                    .await
                    .map_err(db_err)?
            }
        };
        let records = load_profiles(&mut conn, &self.tenant, &ids).await?;
        Ok(ListResponse::of(records, total))
    }

    async fn get_default_profile(&self) -> Result<Option<ParentProfile>> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        match default_profile_id(&mut conn, &self.tenant).await? {
            Some(id) => load_one(&mut conn, &self.tenant, id).await,
            None => Ok(None),
        }
    }

    async fn upsert_default_profile(&self, id: Uuid) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        upsert_default(&mut conn, &self.tenant, id).await?;
        info!(tenant = %self.tenant, profile_id = %id, "default profile set");
        Ok(())
    }

    async fn profile_for_ou(&self, ou_ref_id: i32) -> Result<Option<ParentProfile>> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        let sql = format!(
            "SELECT parent_profile_id FROM {} WHERE ou_ref_id = $1 AND trellis_enabled",
            self.tenant.table("parent_profile_ou_mappings")
        );
        let id = sqlx::query_scalar::<_, Uuid>(&sql)
            .bind(ou_ref_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(db_err)?;
        match id {
            Some(id) => load_one(&mut conn, &self.tenant, id).await,
            None => Ok(None),
        }
    }

    async fn sync_ou_assignments(
        &self,
        profile_id: Uuid,
        desired: &[i32],
    ) -> Result<OuAssignmentDiff> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let sql = format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE id = $1)",
            self.tenant.table("parent_profiles")
        );
        let exists = sqlx::query_scalar::<_, bool>(&sql)
            .bind(profile_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
        if !exists {
            return Err(TrellisError::not_found(format!("profile {profile_id}")));
        }
        let diff = {
            let mut store = PgOuMappings::new(&mut tx, &self.tenant);
            sync_ou_assignments(&mut store, profile_id, desired).await?
        };
        tx.commit().await.map_err(db_err)?;
        Ok(diff)
    }

    async fn set_trellis_enabled(&self, ou_ref_ids: &[i32], enabled: bool) -> Result<u64> {
        if ou_ref_ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE {} SET trellis_enabled = $2, updated_at = now() WHERE ou_ref_id = ANY($1)",
            self.tenant.table("parent_profile_ou_mappings")
        );
        let done = sqlx::query(&sql)
            .bind(ou_ref_ids)
            .bind(enabled)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(done.rows_affected())
    }

    async fn delete_ou_mapping(&self, ou_ref_id: i32) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE ou_ref_id = $1",
            self.tenant.table("parent_profile_ou_mappings")
        );
        let done = sqlx::query(&sql)
            .bind(ou_ref_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(done.rows_affected())
    }
}

/// Reads and validates a profile tree from a JSON file.
pub async fn load_profile_file(path: &Path) -> Result<ParentProfile> {
    let raw = tokio::fs::read_to_string(path).await.map_err(|err| {
        TrellisError::validation(format!("cannot read profile {}: {err}", path.display()))
    })?;
    let profile: ParentProfile = serde_json::from_str(&raw).map_err(|err| {
        TrellisError::validation(format!("invalid profile {}: {err}", path.display()))
    })?;
    profile.validate()?;
    Ok(profile)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CloneTarget {
    Update { ou_ref_id: i32, profile_id: Uuid },
    Insert { ou_ref_id: i32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ClonePlan {
    /// Payload matches the central profile: repoint targets at it and drop the profiles they leave.
    RepointToCentral {
        targets: Vec<i32>,
        orphaned: Vec<Uuid>,
    },
    PerOu(Vec<CloneTarget>),
}

/// Deleting the central profile is a conflict, not a storage failure.
fn ensure_not_default(id: Uuid, default_id: Option<Uuid>) -> Result<()> {
    if default_id == Some(id) {
        return Err(TrellisError::conflict("cannot delete the central trellis profile"));
    }
    Ok(())
}

fn plan_clone(
    payload: &ParentProfile,
    central: &ParentProfile,
    central_id: Uuid,
    targets: &[i32],
    owners: &BTreeMap<i32, Uuid>,
) -> Result<ClonePlan> {
    if targets.is_empty() {
        return Err(TrellisError::validation("at least one target ou is required"));
    }
    if payload.same_tree(central) {
        let orphaned: BTreeSet<Uuid> = targets
            .iter()
            .filter_map(|ou| owners.get(ou))
            .copied()
            .filter(|id| *id != central_id)
            .collect();
        return Ok(ClonePlan::RepointToCentral {
            targets: targets.to_vec(),
            orphaned: orphaned.into_iter().collect(),
        });
    }
    // a profile shared by several targets is rescoped to the first one only
    let mut claimed = BTreeSet::new();
    Ok(ClonePlan::PerOu(
        targets
            .iter()
            .map(|&ou_ref_id| match owners.get(&ou_ref_id) {
                Some(&profile_id) if profile_id != central_id && claimed.insert(profile_id) => {
                    CloneTarget::Update {
                        ou_ref_id,
                        profile_id,
                    }
                }
                _ => CloneTarget::Insert { ou_ref_id },
            })
            .collect(),
    ))
}

fn filter_clause(tenant: &Tenant) -> String {
    format!(
        r#"($1::uuid[] IS NULL OR p.id = ANY($1))
           AND ($2::text[] IS NULL OR p.name = ANY($2))
           AND ($3::text IS NULL OR p.name ILIKE '%' || $3 || '%')
           AND ($4::int[] IS NULL OR EXISTS (
                SELECT 1 FROM {m} m WHERE m.parent_profile_id = p.id AND m.ou_ref_id = ANY($4)))"#,
        m = tenant.table("parent_profile_ou_mappings"),
    )
}

async fn default_profile_id(conn: &mut PgConnection, tenant: &Tenant) -> Result<Option<Uuid>> {
    let sql = format!(
        "SELECT parent_profile_id FROM {} WHERE default_col = $1",
        tenant.table("parent_profile_default")
    );
    sqlx::query_scalar::<_, Uuid>(&sql)
        .bind(DEFAULT_MARKER)
        .fetch_optional(conn)
        .await
        .map_err(db_err)
}

async fn upsert_default(conn: &mut PgConnection, tenant: &Tenant, id: Uuid) -> Result<()> {
    let sql = format!(
        r#"
        INSERT INTO {} (default_col, parent_profile_id) VALUES ($1, $2)
        ON CONFLICT (default_col) DO UPDATE SET parent_profile_id = EXCLUDED.parent_profile_id
        "#,
        tenant.table("parent_profile_default")
    );
    sqlx::query(&sql)
        .bind(DEFAULT_MARKER)
        .bind(id)
        .execute(conn)
        .await
        .map_err(db_err)?;
    Ok(())
}

async fn ou_owners(
    conn: &mut PgConnection,
    tenant: &Tenant,
    ou_ref_ids: &[i32],
) -> Result<BTreeMap<i32, Uuid>> {
    let sql = format!(
        "SELECT ou_ref_id, parent_profile_id FROM {} WHERE ou_ref_id = ANY($1)",
        tenant.table("parent_profile_ou_mappings")
    );
    let rows = sqlx::query_as::<_, (i32, Uuid)>(&sql)
        .bind(ou_ref_ids)
        .fetch_all(conn)
        .await
        .map_err(db_err)?;
    Ok(rows.into_iter().collect())
}

async fn delete_profiles_except(
    conn: &mut PgConnection,
    tenant: &Tenant,
    ids: &[Uuid],
    keep: Uuid,
) -> Result<u64> {
    if ids.is_empty() {
        return Ok(0);
    }
    let sql = format!(
        "DELETE FROM {} WHERE id = ANY($1) AND id <> $2",
        tenant.table("parent_profiles")
    );
    let done = sqlx::query(&sql)
        .bind(ids)
        .bind(keep)
        .execute(conn)
        .await
        .map_err(db_err)?;
    Ok(done.rows_affected())
}

async fn insert_tree(conn: &mut PgConnection, tenant: &Tenant, profile: &ParentProfile) -> Result<Uuid> {
    let profile = profile.with_ticket_categories_propagated();
    let id = Uuid::new_v4();
    let sql = format!(
        r#"
        INSERT INTO {} (id, name, description, predefined_profile, effort_investment_profile_id,
                        feature_ticket_categories_map, settings)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
        tenant.table("parent_profiles")
    );
    let done = sqlx::query(&sql)
        .bind(id)
        .bind(&profile.name)
        .bind(&profile.description)
        .bind(profile.predefined_profile)
        .bind(profile.effort_investment_profile_id)
        .bind(serde_json::to_value(&profile.feature_ticket_categories_map)?)
        .bind(Value::Object(profile.settings.clone()))
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
    if done.rows_affected() == 0 {
        return Err(TrellisError::storage("parent profile insert affected no rows"));
    }

    let mut subs: Vec<&SubProfile> = profile.sub_profiles.iter().collect();
    subs.sort_by_key(|s| s.order);
    for sub in subs {
        insert_sub_profile(conn, tenant, id, sub).await?;
    }
    upsert_ou_mappings(conn, tenant, id, &profile.associated_ou_ref_ids).await?;
    Ok(id)
}

async fn insert_sub_profile(
    conn: &mut PgConnection,
    tenant: &Tenant,
    parent_id: Uuid,
    sub: &SubProfile,
) -> Result<Uuid> {
    let id = Uuid::new_v4();
    let sql = format!(
        r#"
        INSERT INTO {} (id, parent_profile_id, name, description, order_index, enabled,
                        matching_criteria, settings)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
        tenant.table("sub_profiles")
    );
    let done = sqlx::query(&sql)
        .bind(id)
        .bind(parent_id)
        .bind(&sub.name)
        .bind(&sub.description)
        .bind(sub.order)
        .bind(sub.enabled)
        .bind(serde_json::to_value(&sub.matching_criteria)?)
        .bind(Value::Object(sub.settings.clone()))
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
    if done.rows_affected() == 0 {
        return Err(TrellisError::storage("sub-profile insert affected no rows"));
    }
    insert_sections(conn, tenant, id, &sub.sections).await?;
    Ok(id)
}

async fn insert_sections(
    conn: &mut PgConnection,
    tenant: &Tenant,
    sub_profile_id: Uuid,
    sections: &[Section],
) -> Result<()> {
    let section_sql = format!(
        "INSERT INTO {} (id, sub_profile_id, order_index, body) VALUES ($1, $2, $3, $4)",
        tenant.table("profile_sections")
    );
    let feature_sql = format!(
        r#"
        INSERT INTO {} (id, section_id, sub_profile_id, feature_type, order_index, body)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
        tenant.table("profile_features")
    );
    let category_sql = format!(
        r#"
        INSERT INTO {} (feature_id, ticket_category_id, position)
        SELECT $1, c.id, c.pos FROM unnest($2::uuid[]) WITH ORDINALITY AS c(id, pos)
        ON CONFLICT DO NOTHING
        "#,
        tenant.table("feature_category_mappings")
    );

    for section in sections {
        let section_id = Uuid::new_v4();
        sqlx::query(&section_sql)
            .bind(section_id)
            .bind(sub_profile_id)
            .bind(section.order)
            .bind(section.persisted_body()?)
            .execute(&mut *conn)
            .await
            .map_err(db_err)?;

        for feature in &section.features {
            let feature_id = Uuid::new_v4();
            sqlx::query(&feature_sql)
                .bind(feature_id)
                .bind(section_id)
                .bind(sub_profile_id)
                .bind(feature.feature_type.as_str())
                .bind(feature.order)
                .bind(feature.persisted_body()?)
                .execute(&mut *conn)
                .await
                .map_err(db_err)?;
            if !feature.ticket_categories.is_empty() {
                sqlx::query(&category_sql)
                    .bind(feature_id)
                    .bind(&feature.ticket_categories)
                    .execute(&mut *conn)
                    .await
                    .map_err(db_err)?;
            }
        }
    }
    Ok(())
}

/// Applies `incoming` to the stored tree `id`: parent scalars, sub-profiles by order index,
/// then the OU assignments.
async fn update_tree(
    conn: &mut PgConnection,
    tenant: &Tenant,
    id: Uuid,
    incoming: &ParentProfile,
) -> Result<()> {
    let existing = load_one(conn, tenant, id)
        .await?
        .ok_or_else(|| TrellisError::not_found(format!("profile {id}")))?;
    let incoming = if incoming.feature_ticket_categories_map != existing.feature_ticket_categories_map
    {
        incoming.with_ticket_categories_propagated()
    } else {
        incoming.clone()
    };

    let changes = diff_sub_profiles(&existing.sub_profiles, &incoming.sub_profiles);
    let tree_changed = changes
        .iter()
        .any(|c| !matches!(c, SubProfileChange::Unchanged { .. }));

    if !existing.same_scalars(&incoming) {
        let sql = format!(
            r#"
            UPDATE {} SET name = $2, description = $3, predefined_profile = $4,
                   effort_investment_profile_id = $5, feature_ticket_categories_map = $6,
                   settings = $7, updated_at = now()
             WHERE id = $1
            "#,
            tenant.table("parent_profiles")
        );
        let done = sqlx::query(&sql)
            .bind(id)
            .bind(&incoming.name)
            .bind(&incoming.description)
            .bind(incoming.predefined_profile)
            .bind(incoming.effort_investment_profile_id)
            .bind(serde_json::to_value(&incoming.feature_ticket_categories_map)?)
            .bind(Value::Object(incoming.settings.clone()))
            .execute(&mut *conn)
            .await
            .map_err(db_err)?;
        if done.rows_affected() == 0 {
            return Err(TrellisError::storage("parent profile update affected no rows"));
        }
    } else if tree_changed {
        let sql = format!(
            "UPDATE {} SET updated_at = now() WHERE id = $1",
            tenant.table("parent_profiles")
        );
        sqlx::query(&sql)
            .bind(id)
            .execute(&mut *conn)
            .await
            .map_err(db_err)?;
    }

    for change in changes {
        match change {
            SubProfileChange::Insert(sub) => {
                insert_sub_profile(conn, tenant, id, sub).await?;
            }
            SubProfileChange::Replace {
                existing_id,
                update_scalars,
                incoming: sub,
            } => {
                if update_scalars {
                    let sql = format!(
                        r#"
                        UPDATE {} SET name = $2, description = $3, enabled = $4,
                               matching_criteria = $5, settings = $6, updated_at = now()
                         WHERE id = $1
                        "#,
                        tenant.table("sub_profiles")
                    );
                    let done = sqlx::query(&sql)
                        .bind(existing_id)
                        .bind(&sub.name)
                        .bind(&sub.description)
                        .bind(sub.enabled)
                        .bind(serde_json::to_value(&sub.matching_criteria)?)
                        .bind(Value::Object(sub.settings.clone()))
                        .execute(&mut *conn)
                        .await
                        .map_err(db_err)?;
                    if done.rows_affected() == 0 {
                        return Err(TrellisError::storage("sub-profile update affected no rows"));
                    }
                }
                // sections and features carry no identity across edits
                let sql = format!(
                    "DELETE FROM {} WHERE sub_profile_id = $1",
                    tenant.table("profile_sections")
                );
                sqlx::query(&sql)
                    .bind(existing_id)
                    .execute(&mut *conn)
                    .await
                    .map_err(db_err)?;
                insert_sections(conn, tenant, existing_id, &sub.sections).await?;
            }
            SubProfileChange::Unchanged { .. } => {}
        }
    }

    let mut mappings = PgOuMappings::new(conn, tenant);
    sync_ou_assignments(&mut mappings, id, &incoming.associated_ou_ref_ids).await?;
    Ok(())
}

#[derive(Debug, sqlx::FromRow)]
struct ParentRow {
    id: Uuid,
    name: String,
    description: Option<String>,
    predefined_profile: bool,
    effort_investment_profile_id: Option<Uuid>,
    feature_ticket_categories_map: Value,
    settings: Value,
    default_profile: bool,
    ou_ref_ids: Vec<i32>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct SubRow {
    id: Uuid,
    parent_profile_id: Option<Uuid>,
    name: String,
    description: Option<String>,
    order_index: i32,
    enabled: bool,
    matching_criteria: Value,
    settings: Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct SectionRow {
    id: Uuid,
    sub_profile_id: Uuid,
    body: Value,
}

#[derive(Debug, sqlx::FromRow)]
struct FeatureRow {
    id: Uuid,
    section_id: Uuid,
    body: Value,
}

#[derive(Debug, sqlx::FromRow)]
struct CategoryRow {
    feature_id: Uuid,
    ticket_category_id: Uuid,
}

async fn load_one(conn: &mut PgConnection, tenant: &Tenant, id: Uuid) -> Result<Option<ParentProfile>> {
    Ok(load_profiles(conn, tenant, &[id]).await?.into_iter().next())
}

/// Loads full trees for `ids`, one query per level, returned in `ids` order.
async fn load_profiles(
    conn: &mut PgConnection,
    tenant: &Tenant,
    ids: &[Uuid],
) -> Result<Vec<ParentProfile>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let parent_sql = format!(
        r#"
        SELECT p.id, p.name, p.description, p.predefined_profile, p.effort_investment_profile_id,
               p.feature_ticket_categories_map, p.settings, p.created_at, p.updated_at,
               EXISTS (SELECT 1 FROM {d} d WHERE d.parent_profile_id = p.id) AS default_profile,
               COALESCE((SELECT array_agg(m.ou_ref_id ORDER BY m.ou_ref_id)
                           FROM {m} m
                          WHERE m.parent_profile_id = p.id AND m.trellis_enabled),
                        ARRAY[]::int[]) AS ou_ref_ids
          FROM {p} p
         WHERE p.id = ANY($1)
        "#,
        p = tenant.table("parent_profiles"),
        d = tenant.table("parent_profile_default"),
        m = tenant.table("parent_profile_ou_mappings"),
    );
    let parents = sqlx::query_as::<_, ParentRow>(&parent_sql)
        .bind(ids)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err)?;
    let parent_ids: Vec<Uuid> = parents.iter().map(|p| p.id).collect();

    let sub_sql = format!(
        r#"
        SELECT id, parent_profile_id, name, description, order_index, enabled,
               matching_criteria, settings, created_at, updated_at
          FROM {} WHERE parent_profile_id = ANY($1)
        "#,
        tenant.table("sub_profiles")
    );
    let subs = sqlx::query_as::<_, SubRow>(&sub_sql)
        .bind(&parent_ids)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err)?;
    let sub_ids: Vec<Uuid> = subs.iter().map(|s| s.id).collect();

    let section_sql = format!(
        "SELECT id, sub_profile_id, body FROM {} WHERE sub_profile_id = ANY($1)",
        tenant.table("profile_sections")
    );
    let sections = sqlx::query_as::<_, SectionRow>(&section_sql)
        .bind(&sub_ids)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err)?;
    let section_ids: Vec<Uuid> = sections.iter().map(|s| s.id).collect();

    let feature_sql = format!(
        "SELECT id, section_id, body FROM {} WHERE section_id = ANY($1)",
        tenant.table("profile_features")
    );
    let features = sqlx::query_as::<_, FeatureRow>(&feature_sql)
        .bind(&section_ids)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err)?;
    let feature_ids: Vec<Uuid> = features.iter().map(|f| f.id).collect();

    let category_sql = format!(
        r#"
        SELECT feature_id, ticket_category_id FROM {}
         WHERE feature_id = ANY($1)
         ORDER BY feature_id, position
        "#,
        tenant.table("feature_category_mappings")
    );
    let categories = sqlx::query_as::<_, CategoryRow>(&category_sql)
        .bind(&feature_ids)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err)?;

    let mut by_id: HashMap<Uuid, ParentProfile> =
        assemble_profiles(parents, subs, sections, features, categories)?
            .into_iter()
            .filter_map(|p| p.id.map(|id| (id, p)))
            .collect();
    Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
}

fn json_map(value: Value, what: &str) -> Result<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(TrellisError::storage(format!(
            "{what} is not a json object: {other}"
        ))),
    }
}

fn assemble_profiles(
    parents: Vec<ParentRow>,
    subs: Vec<SubRow>,
    sections: Vec<SectionRow>,
    features: Vec<FeatureRow>,
    categories: Vec<CategoryRow>,
) -> Result<Vec<ParentProfile>> {
    let mut categories_by_feature: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for row in categories {
        categories_by_feature
            .entry(row.feature_id)
            .or_default()
            .push(row.ticket_category_id);
    }

    let mut features_by_section: HashMap<Uuid, Vec<Feature>> = HashMap::new();
    for row in features {
        let mut feature: Feature = serde_json::from_value(row.body)?;
        feature.id = Some(row.id);
        feature.ticket_categories = categories_by_feature.remove(&row.id).unwrap_or_default();
        features_by_section
            .entry(row.section_id)
            .or_default()
            .push(feature);
    }

    let mut sections_by_sub: HashMap<Uuid, Vec<Section>> = HashMap::new();
    for row in sections {
        let mut section: Section = serde_json::from_value(row.body)?;
        section.id = Some(row.id);
        section.features = features_by_section.remove(&row.id).unwrap_or_default();
        sections_by_sub
            .entry(row.sub_profile_id)
            .or_default()
            .push(section);
    }

    let mut subs_by_parent: HashMap<Uuid, Vec<SubProfile>> = HashMap::new();
    for row in subs {
        let Some(parent_id) = row.parent_profile_id else {
            continue;
        };
        let sub = SubProfile {
            id: Some(row.id),
            parent_id: Some(parent_id),
            name: row.name,
            description: row.description,
            order: row.order_index,
            enabled: row.enabled,
            matching_criteria: serde_json::from_value(row.matching_criteria)?,
            settings: json_map(row.settings, "sub-profile settings")?,
            sections: sections_by_sub.remove(&row.id).unwrap_or_default(),
            created_at: Some(row.created_at),
            updated_at: Some(row.updated_at),
        };
        subs_by_parent.entry(parent_id).or_default().push(sub);
    }

    parents
        .into_iter()
        .map(|row| {
            let feature_ticket_categories_map: BTreeMap<FeatureType, Vec<Uuid>> =
                serde_json::from_value(row.feature_ticket_categories_map)?;
            let profile = ParentProfile {
                id: Some(row.id),
                name: row.name,
                description: row.description,
                predefined_profile: row.predefined_profile,
                default_profile: row.default_profile,
                effort_investment_profile_id: row.effort_investment_profile_id,
                feature_ticket_categories_map,
                settings: json_map(row.settings, "profile settings")?,
                sub_profiles: subs_by_parent.remove(&row.id).unwrap_or_default(),
                associated_ou_ref_ids: row.ou_ref_ids,
                created_at: Some(row.created_at),
                updated_at: Some(row.updated_at),
            };
            Ok(profile.sorted())
        })
        .collect()
}
