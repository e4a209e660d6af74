//! Backup jobs: SQL dump + graph export + compressed archive.
//!
//! An archive is a `.tar.gz` containing `postgres.sql` (plain dump, no
//! owner/ACL), `graph.json` (the org's entities and relationships), and
//! `metadata.json` (version, counts, per-file SHA-256). Retention is by
//! age in days.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tracing::{info, warn};
use uuid::Uuid;

use sibyl_db::queries::backups;

use super::JobContext;

/// Archive format version.
pub const ARCHIVE_VERSION: &str = "2.0";

/// Backup configuration.
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Directory completed archives land in.
    pub backup_dir: PathBuf,
    /// `pg_dump` binary.
    pub pg_dump_bin: String,
    /// Connection URL handed to `pg_dump`.
    pub database_url: String,
}

impl BackupConfig {
    pub fn new(backup_dir: impl Into<PathBuf>, database_url: impl Into<String>) -> Self {
        Self {
            backup_dir: backup_dir.into(),
            pg_dump_bin: "pg_dump".to_owned(),
            database_url: database_url.into(),
        }
    }
}

/// `metadata.json` contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub version: String,
    pub created_at: String,
    pub organization_id: String,
    pub hostname: String,
    pub pg_entities: i64,
    pub graph_entities: i64,
    pub graph_relationships: i64,
    /// File name → SHA-256 hex digest.
    pub files: BTreeMap<String, String>,
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("failed to open {} for checksum", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_owned())
}

/// Count the org's rows across the tenant-scoped tables.
async fn count_pg_entities(pool: &sqlx::PgPool, organization_id: Uuid) -> Result<i64> {
    let mut total = 0i64;
    for table in [
        "sandbox",
        "sandbox_task",
        "inter_agent_message",
        "agent_message",
        "agent_state",
        "backup",
    ] {
        let query = format!("SELECT COUNT(*) FROM {table} WHERE organization_id = $1");
        let count: (i64,) = sqlx::query_as(&query)
            .bind(organization_id)
            .fetch_one(pool)
            .await
            .with_context(|| format!("failed to count rows in {table}"))?;
        total += count.0;
    }
    Ok(total)
}

async fn dump_postgres(config: &BackupConfig, out_path: &Path) -> Result<()> {
    let output = Command::new(&config.pg_dump_bin)
        .arg("--no-owner")
        .arg("--no-acl")
        .arg("--file")
        .arg(out_path)
        .arg(&config.database_url)
        .output()
        .await
        .with_context(|| format!("failed to run {}", config.pg_dump_bin))?;

    if !output.status.success() {
        bail!(
            "pg_dump failed (exit {}): {}",
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(())
}

fn build_archive(staging: &Path, archive_path: &Path) -> Result<()> {
    let file = std::fs::File::create(archive_path)
        .with_context(|| format!("failed to create {}", archive_path.display()))?;
    let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for name in ["metadata.json", "postgres.sql", "graph.json"] {
        let path = staging.join(name);
        if path.exists() {
            builder
                .append_path_with_name(&path, name)
                .with_context(|| format!("failed to append {name} to archive"))?;
        }
    }

    builder
        .into_inner()
        .and_then(|encoder| encoder.finish())
        .context("failed to finalize archive")?;
    Ok(())
}

/// Run one backup to completion, updating the bookkeeping row as it goes.
pub async fn run_backup(ctx: &JobContext, backup_id: Uuid, organization_id: Uuid) -> Result<()> {
    backups::mark_started(&ctx.pool, backup_id).await?;
    info!(backup_id = %backup_id, org_id = %organization_id, "backup started");

    let result = run_backup_inner(ctx, backup_id, organization_id).await;
    if let Err(e) = &result {
        let message = format!("{e:#}");
        warn!(backup_id = %backup_id, error = %message, "backup failed");
        backups::mark_failed(&ctx.pool, backup_id, &message).await?;
    }
    result
}

async fn run_backup_inner(
    ctx: &JobContext,
    backup_id: Uuid,
    organization_id: Uuid,
) -> Result<()> {
    let staging = tempfile::tempdir().context("failed to create staging directory")?;
    let pg_file = staging.path().join("postgres.sql");
    let graph_file = staging.path().join("graph.json");
    let metadata_file = staging.path().join("metadata.json");

    // 1. SQL dump.
    dump_postgres(&ctx.backup, &pg_file).await?;
    let pg_entities = count_pg_entities(&ctx.pool, organization_id).await?;

    // 2. Graph export for the org.
    let export = ctx.store.graph().export(ctx.store.org_id()).await?;
    let graph_entities = export.nodes.len() as i64;
    let graph_relationships = export.edges.len() as i64;
    std::fs::write(&graph_file, serde_json::to_vec_pretty(&export)?)
        .context("failed to write graph export")?;

    // 3. Checksums + metadata.
    let mut files = BTreeMap::new();
    files.insert("postgres.sql".to_owned(), sha256_file(&pg_file)?);
    files.insert("graph.json".to_owned(), sha256_file(&graph_file)?);

    let metadata = BackupMetadata {
        version: ARCHIVE_VERSION.to_owned(),
        created_at: Utc::now().to_rfc3339(),
        organization_id: organization_id.to_string(),
        hostname: hostname(),
        pg_entities,
        graph_entities,
        graph_relationships,
        files,
    };
    std::fs::write(&metadata_file, serde_json::to_vec_pretty(&metadata)?)
        .context("failed to write backup metadata")?;

    // 4. Archive.
    std::fs::create_dir_all(&ctx.backup.backup_dir)
        .context("failed to create backup directory")?;
    let archive_name = format!(
        "sibyl_backup_{}_{}.tar.gz",
        organization_id.simple(),
        Utc::now().format("%Y%m%d%H%M%S")
    );
    let archive_path = ctx.backup.backup_dir.join(&archive_name);
    build_archive(staging.path(), &archive_path)?;

    let size_bytes = std::fs::metadata(&archive_path)
        .map(|m| m.len() as i64)
        .unwrap_or(0);

    backups::mark_completed(
        &ctx.pool,
        backup_id,
        &archive_path.to_string_lossy(),
        size_bytes,
        pg_entities,
        graph_entities,
        graph_relationships,
    )
    .await?;

    info!(
        backup_id = %backup_id,
        archive = %archive_path.display(),
        size_bytes,
        graph_entities,
        graph_relationships,
        "backup completed"
    );
    Ok(())
}

/// Delete completed backups older than the retention window, archive files
/// included. Returns the number removed.
pub async fn cleanup_old_backups(
    ctx: &JobContext,
    organization_id: Uuid,
    retention_days: u32,
) -> Result<()> {
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
    let old = backups::list_completed_before(&ctx.pool, organization_id, cutoff).await?;

    let mut removed = 0usize;
    for backup in &old {
        if let Some(archive_path) = &backup.archive_path {
            let path = Path::new(archive_path);
            if path.exists() {
                if let Err(e) = std::fs::remove_file(path) {
                    warn!(backup_id = %backup.id, error = %e, "failed to remove archive file");
                    continue;
                }
            }
        }
        backups::delete_backup(&ctx.pool, backup.id).await?;
        removed += 1;
    }

    if removed > 0 {
        info!(org_id = %organization_id, removed, retention_days, "old backups cleaned up");
    }
    Ok(())
}

/// Run a backup for every listed organization.
pub async fn run_scheduled_backups(ctx: &JobContext, organization_ids: &[Uuid]) -> Result<()> {
    for &organization_id in organization_ids {
        let backup = backups::insert_backup(&ctx.pool, organization_id).await?;
        if let Err(e) = run_backup(ctx, backup.id, organization_id).await {
            // One tenant's failure must not starve the rest.
            warn!(org_id = %organization_id, error = format!("{e:#}"), "scheduled backup failed");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_stable() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("data.txt");
        std::fs::write(&path, "deterministic contents").unwrap();

        let first = sha256_file(&path).unwrap();
        let second = sha256_file(&path).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
    }

    #[test]
    fn archive_roundtrips_contents() {
        let staging = tempfile::tempdir().unwrap();
        std::fs::write(staging.path().join("metadata.json"), "{\"version\":\"2.0\"}").unwrap();
        std::fs::write(staging.path().join("postgres.sql"), "-- dump\n").unwrap();
        std::fs::write(staging.path().join("graph.json"), "{}").unwrap();

        let out = tempfile::tempdir().unwrap();
        let archive_path = out.path().join("backup.tar.gz");
        build_archive(staging.path(), &archive_path).unwrap();
        assert!(archive_path.exists());

        // Read it back and verify the member names.
        let file = std::fs::File::open(&archive_path).unwrap();
        let decoder = flate2::read::GzDecoder::new(file);
        let mut archive = tar::Archive::new(decoder);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|entry| {
                entry
                    .unwrap()
                    .path()
                    .unwrap()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        assert_eq!(names, vec!["metadata.json", "postgres.sql", "graph.json"]);
    }

    #[test]
    fn metadata_serializes_with_version() {
        let metadata = BackupMetadata {
            version: ARCHIVE_VERSION.to_owned(),
            created_at: Utc::now().to_rfc3339(),
            organization_id: Uuid::nil().to_string(),
            hostname: "test".to_owned(),
            pg_entities: 10,
            graph_entities: 5,
            graph_relationships: 3,
            files: BTreeMap::new(),
        };
        let json = serde_json::to_value(&metadata).unwrap();
        assert_eq!(
            json.get("version").and_then(serde_json::Value::as_str),
            Some("2.0")
        );
    }
}
