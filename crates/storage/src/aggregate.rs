//! Derived fields kept in step with the rows they summarize. Every function
//! here runs inside the caller's transaction.

use rusqlite::OptionalExtension;
use tasksync_core::{Collection, Hlc, ProjectId, TaskId, TaskStatus, progress_percentage};
use tracing::trace;

use crate::error::StorageError;
use crate::store::{ChangeOrigin, WriteCtx};

/// `(total, completed)` over the live children of `parent`.
fn live_counts(ctx: &WriteCtx<'_>, sql: &str, parent: &[u8]) -> Result<(u32, u32), StorageError> {
    Ok(ctx.tx.query_row(sql, [parent], |row| {
        Ok((row.get::<_, u32>(0)?, row.get::<_, Option<u32>>(1)?.unwrap_or(0)))
    })?)
}

/// Refresh a project's task counters. Derived values do not advance the
/// project's `updated_at` and are never pushed.
pub(crate) fn recompute_project_counters(
    ctx: &mut WriteCtx<'_>,
    project_id: ProjectId,
) -> Result<(), StorageError> {
    let (total, completed) = live_counts(
        ctx,
        "SELECT COUNT(*), SUM(status = 'completed') FROM tasks
         WHERE project_id = ?1 AND deleted = 0",
        project_id.as_bytes(),
    )?;
    let progress = progress_percentage(completed, total);
    let changed = ctx.tx.execute(
        "UPDATE projects SET task_count = ?2, completed_task_count = ?3, progress_percentage = ?4
         WHERE id = ?1 AND (task_count != ?2 OR completed_task_count != ?3 OR progress_percentage != ?4)",
        rusqlite::params![project_id.as_bytes().as_slice(), total, completed, progress],
    )?;
    if changed > 0 {
        trace!(project = %project_id, total, completed, progress, "project counters updated");
        ctx.emit(Collection::Projects, project_id.into(), ChangeOrigin::Derived);
    }
    Ok(())
}

/// Refresh a task's progress from its subtasks and promote or demote its
/// status to match. A status change is an authored edit: it gets a fresh
/// `updated_at`, goes outbound, and moves the project counters.
pub(crate) fn recompute_task_progress(
    ctx: &mut WriteCtx<'_>,
    task_id: TaskId,
) -> Result<(), StorageError> {
    let task = ctx
        .tx
        .query_row(
            "SELECT project_id, status, updated_at FROM tasks WHERE id = ?1 AND deleted = 0",
            [task_id.as_bytes().as_slice()],
            |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            },
        )
        .optional()?;
    let Some((project_id, status, updated_at)) = task else {
        return Ok(());
    };
    let project_id = ProjectId::from_slice(&project_id)?;
    let updated_at = Hlc::from_slice(&updated_at)?;
    let status = TaskStatus::parse(&status)?;

    let (total, completed) = live_counts(
        ctx,
        "SELECT COUNT(*), SUM(completed) FROM subtasks WHERE task_id = ?1 AND deleted = 0",
        task_id.as_bytes(),
    )?;
    let progress = progress_percentage(completed, total);
    let target = match (completed, total) {
        (_, 0) | (0, _) => status,
        (c, t) if c == t => TaskStatus::Completed,
        _ => TaskStatus::InProgress,
    };

    if target != status {
        // Must outrank the stored row, which may have just arrived from remote.
        let now = ctx.tick_after(updated_at)?;
        ctx.tx.execute(
            "UPDATE tasks SET status = ?2, progress_percentage = ?3, updated_at = ?4 WHERE id = ?1",
            rusqlite::params![task_id.as_bytes().as_slice(), target.as_str(), progress, &now.to_bytes()[..]],
        )?;
        trace!(task = %task_id, from = status.as_str(), to = target.as_str(), "task status follows subtasks");
        ctx.enqueue(Collection::Tasks, task_id.into(), now)?;
        recompute_project_counters(ctx, project_id)?;
    } else {
        let changed = ctx.tx.execute(
            "UPDATE tasks SET progress_percentage = ?2 WHERE id = ?1 AND progress_percentage != ?2",
            rusqlite::params![task_id.as_bytes().as_slice(), progress],
        )?;
        if changed > 0 {
            ctx.emit(Collection::Tasks, task_id.into(), ChangeOrigin::Derived);
        }
    }
    Ok(())
}
