use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tracing::info;
use trellis_core::{OrgReport, Page, UserReport};
use trellis_scores::{RelativeScoreRequest, RelativeScoreService};
use trellis_storage::schema::{ensure_shared_schema, ensure_tenant_schema};
use trellis_storage::{
    connect, load_profile_file, PgProfileStore, PgReportStore, PgSubjectDirectory, ProfileFilter,
    ProfileRepository, ReportRepository, StoreConfig,
};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "trellis-cli")]
#[command(about = "Trellis profile and report operator interface")]
struct Cli {
    /// Overrides DATABASE_URL.
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Overrides TRELLIS_TENANT.
    #[arg(long, global = true)]
    tenant: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the tenant and shared schemas.
    Setup,
    /// Load the central profile and make it the default, unless one exists.
    SeedCentral { file: Option<PathBuf> },
    CreateProfile {
        file: PathBuf,
        #[arg(long)]
        make_default: bool,
    },
    UpdateProfile { id: Uuid, file: PathBuf },
    /// Copy a profile onto OUs, one profile per OU.
    CloneProfile {
        file: PathBuf,
        #[arg(long = "ou", required = true)]
        ous: Vec<i32>,
    },
    DeleteProfile { id: Uuid },
    ListProfiles {
        #[arg(long)]
        name: Option<String>,
        #[arg(long = "ou")]
        ous: Vec<i32>,
        #[arg(long, default_value_t = 0)]
        page: u32,
        #[arg(long, default_value_t = 50)]
        page_size: u32,
    },
    SyncOus {
        profile_id: Uuid,
        #[arg(long = "ou")]
        ous: Vec<i32>,
    },
    UpsertUserReport { file: PathBuf },
    UpsertOrgReport { file: PathBuf },
    RelativeScores { request: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("trellis=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = StoreConfig::from_env();
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }
    if let Some(tenant) = cli.tenant {
        config.tenant = tenant;
    }
    let tenant = config.tenant()?;
    let pool = connect(&config)
        .await
        .with_context(|| format!("connecting to {}", config.database_url))?;
    let profiles = PgProfileStore::new(pool.clone(), tenant.clone());
    let reports = PgReportStore::new(pool.clone(), tenant.clone());

    match cli.command {
        Commands::Setup => {
            ensure_tenant_schema(&pool, &tenant).await?;
            ensure_shared_schema(&pool).await?;
            info!(%tenant, "schemas ready");
            print_json(&json!({ "tenant": tenant.as_str(), "ready": true }))?;
        }
        Commands::SeedCentral { file } => {
            let Some(path) = file.or_else(|| config.central_profile_path.clone()) else {
                bail!("no central profile file given and TRELLIS_CENTRAL_PROFILE is unset");
            };
            let id = profiles.seed_central_profile(&path).await?;
            print_json(&json!({ "seeded": id }))?;
        }
        Commands::CreateProfile { file, make_default } => {
            let profile = load_profile_file(&file).await?;
            let id = if make_default {
                profiles.create_and_make_default(&profile).await?
            } else {
                profiles.create_profile(&profile).await?
            };
            print_json(&json!({ "id": id }))?;
        }
        Commands::UpdateProfile { id, file } => {
            let profile = load_profile_file(&file).await?;
            profiles.update_profile(id, &profile).await?;
            print_json(&profiles.get_profile(id).await?)?;
        }
        Commands::CloneProfile { file, ous } => {
            let profile = load_profile_file(&file).await?;
            let ids = profiles.clone_profile_to_ous(&profile, &ous).await?;
            print_json(&json!({ "profile_ids": ids }))?;
        }
        Commands::DeleteProfile { id } => {
            profiles.delete_profile(id).await?;
            print_json(&json!({ "deleted": id }))?;
        }
        Commands::ListProfiles {
            name,
            ous,
            page,
            page_size,
        } => {
            let filter = ProfileFilter {
                partial_name: name,
                ou_ref_ids: (!ous.is_empty()).then_some(ous),
                ..ProfileFilter::default()
            };
            let listed = profiles
                .list_profiles(&filter, Page::new(page, page_size))
                .await?;
            print_json(&listed)?;
        }
        Commands::SyncOus { profile_id, ous } => {
            let diff = profiles.sync_ou_assignments(profile_id, &ous).await?;
            print_json(&diff)?;
        }
        Commands::UpsertUserReport { file } => {
            let report: UserReport = read_json(&file).await?;
            let id = reports.upsert_user_report(&report).await?;
            print_json(&json!({ "id": id }))?;
        }
        Commands::UpsertOrgReport { file } => {
            let report: OrgReport = read_json(&file).await?;
            let id = reports.upsert_org_report(&report).await?;
            print_json(&json!({ "id": id }))?;
        }
        Commands::RelativeScores { request } => {
            let request: RelativeScoreRequest = read_json(&request).await?;
            let directory = PgSubjectDirectory::new(pool.clone(), tenant.clone());
            let service = RelativeScoreService::new(directory, reports, profiles);
            let scores = service
                .relative_scores(&request, chrono::Utc::now())
                .await?;
            print_json(&scores)?;
        }
    }

    Ok(())
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
