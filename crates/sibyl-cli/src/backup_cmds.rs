//! Backup command handlers.

use anyhow::Result;
use uuid::Uuid;

use sibyl_core::jobs::backup;
use sibyl_db::queries::backups;

use crate::context::RuntimeContext;

/// Run a backup for one organization, synchronously.
pub async fn cmd_run(ctx: &RuntimeContext, org_id: Uuid) -> Result<()> {
    let job_ctx = ctx.job_context();
    let record = backups::insert_backup(&ctx.pool, org_id).await?;
    backup::run_backup(&job_ctx, record.id, org_id).await?;

    let finished = backups::get_backup(&ctx.pool, record.id)
        .await?
        .expect("backup row should exist");
    println!(
        "Backup {} completed: {} ({} bytes, {} graph entities, {} relationships)",
        finished.id,
        finished.archive_path.as_deref().unwrap_or("?"),
        finished.size_bytes.unwrap_or(0),
        finished.graph_entities.unwrap_or(0),
        finished.graph_relationships.unwrap_or(0),
    );
    Ok(())
}

/// Remove backups older than the retention window.
pub async fn cmd_cleanup(ctx: &RuntimeContext, org_id: Uuid, retention_days: u32) -> Result<()> {
    let job_ctx = ctx.job_context();
    backup::cleanup_old_backups(&job_ctx, org_id, retention_days).await?;
    println!("Cleanup complete (retention {retention_days} days)");
    Ok(())
}

/// List recent backups for an organization.
pub async fn cmd_list(ctx: &RuntimeContext, org_id: Uuid, limit: i64) -> Result<()> {
    let rows = backups::list_for_org(&ctx.pool, org_id, None, limit).await?;
    if rows.is_empty() {
        println!("No backups for {org_id}");
        return Ok(());
    }
    for row in &rows {
        println!(
            "{}  {}  {}  {}",
            row.id,
            row.status,
            row.created_at.format("%Y-%m-%d %H:%M:%S"),
            row.archive_path.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}
