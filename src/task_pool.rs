//! Task pool: priority-ordered task queue with claim/in-progress/complete/fail/reset lifecycle.
//!
//! Operations are snapshot-serialized: each call does a read-modify-write of the owning
//! project's task list through [`crate::project::ProjectStore::update`], which holds the
//! atomic-snapshot read-modify-write lock for the duration. Multi-process safety comes from the
//! snapshot primitive's write-to-tmp-then-rename discipline, not from an in-process lock
//! alone — but within one process the `update` closure still serializes concurrent callers.

use crate::errors::RuntimeError;
use crate::project::ProjectStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Task lifecycle status. Transitions form the DAG:
/// `available -> claimed -> in-progress -> {completed | failed -> available}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Available,
    Claimed,
    InProgress,
    Completed,
    Failed,
}

/// Working context handed to whoever claims the task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskContext {
    pub working_directory: String,
    pub relevant_files: Option<Vec<String>>,
    pub output_paths: Option<Vec<String>>,
    pub conventions: Option<String>,
    pub notes: Option<String>,
}

/// Recorded on `complete()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub files_created: Vec<String>,
    pub files_modified: Vec<String>,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    /// 1-10, higher claims first.
    pub priority: u8,
    pub status: TaskStatus,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub context: TaskContext,
    pub result: Option<TaskResult>,
    pub failure_reason: Option<String>,
}

impl Task {
    /// Stale if claimed/in-progress and `claimed_at` is older than `max_age_ms` (default 5 min).
    pub fn is_stale(&self, now: DateTime<Utc>, max_age_ms: i64) -> bool {
        matches!(self.status, TaskStatus::Claimed | TaskStatus::InProgress)
        && self
            .claimed_at
            .map(|t| (now - t).num_milliseconds() > max_age_ms)
            .unwrap_or(false)
    }
}

fn new_task_id() -> String {
    format!("task-{}", uuid::Uuid::new_v4())
}

/// Priority-ordered task queue scoped to a single project, backed by the shared `projects.json`
/// snapshot.
pub struct TaskPool<'a> {
    store: &'a ProjectStore,
}

impl<'a> TaskPool<'a> {
    pub fn new(store: &'a ProjectStore) -> Self {
        TaskPool { store }
    }

    pub fn create_task(
        &self,
        project_id: &str,
        created_by: &str,
        title: &str,
        description: &str,
        context: TaskContext,
        priority: u8,
    ) -> Result<Task, RuntimeError> {
        let task = Task {
            id: new_task_id(),
            title: title.to_string(),
            description: description.to_string(),
            priority: priority.clamp(1, 10),
            status: TaskStatus::Available,
            created_by: created_by.to_string(),
            created_at: Utc::now(),
            claimed_by: None,
            claimed_at: None,
            context,
            result: None,
            failure_reason: None,
        };
        let created = task.clone();
        self.store.update(project_id, |project| {
                project.tasks.push(task);
                Ok(())
        })?;
        Ok(created)
    }

    /// An agent may hold at most one active (claimed or in-progress) task at a time.
    fn agent_has_active_task(tasks: &[Task], by: &str) -> bool {
        tasks.iter().any(|t| {
                t.claimed_by.as_deref() == Some(by)
                && matches!(t.status, TaskStatus::Claimed | TaskStatus::InProgress)
        })
    }

    /// Selects the highest-priority `available` task, tiebreak by creation order. Returns `None`
    /// if there is no available task.
    pub fn claim_next(&self, project_id: &str, by: &str) -> Result<Option<Task>, RuntimeError> {
        let mut claimed = None;
        self.store.update(project_id, |project| {
                if Self::agent_has_active_task(&project.tasks, by) {
                    return Err(RuntimeError::AlreadyHasTask(by.to_string()));
                }
                let mut candidates: Vec<usize> = project
                    .tasks
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| t.status == TaskStatus::Available)
                    .map(|(i, _)| i)
                    .collect();
                candidates.sort_by(|&a, &b| {
                        let ta = &project.tasks[a];
                        let tb = &project.tasks[b];
                        tb.priority
                            .cmp(&ta.priority)
                            .then(ta.created_at.cmp(&tb.created_at))
                });
                if let Some(&idx) = candidates.first() {
                    let now = Utc::now();
                    project.tasks[idx].status = TaskStatus::Claimed;
                    project.tasks[idx].claimed_by = Some(by.to_string());
                    project.tasks[idx].claimed_at = Some(now);
                    claimed = Some(project.tasks[idx].clone());
                }
                Ok(())
        })?;
        Ok(claimed)
    }

    /// Claim a specific task by id; fails with [`RuntimeError::InvalidState`] if not available.
    pub fn claim(&self, project_id: &str, task_id: &str, by: &str) -> Result<Task, RuntimeError> {
        let mut claimed = None;
        self.store.update(project_id, |project| {
                if Self::agent_has_active_task(&project.tasks, by) {
                    return Err(RuntimeError::AlreadyHasTask(by.to_string()));
                }
                let task = project
                    .tasks
                    .iter_mut()
                    .find(|t| t.id == task_id)
                    .ok_or_else(|| RuntimeError::NotFound(format!("task {}", task_id)))?;
                if task.status != TaskStatus::Available {
                    return Err(RuntimeError::InvalidState(format!(
                                "task {} is {:?}, not available",
                                task_id, task.status
                    )));
                }
                task.status = TaskStatus::Claimed;
                task.claimed_by = Some(by.to_string());
                task.claimed_at = Some(Utc::now());
                claimed = Some(task.clone());
                Ok(())
        })?;
        Ok(claimed.expect("set on success path"))
    }

    /// `claimed -> in-progress` by the same claimant.
    pub fn start(&self, project_id: &str, task_id: &str, by: &str) -> Result<Task, RuntimeError> {
        self.transition(project_id, task_id, |task| {
                if task.status != TaskStatus::Claimed || task.claimed_by.as_deref() != Some(by) {
                    return Err(RuntimeError::InvalidState(format!(
                                "task {} is not claimed by {}",
                                task_id, by
                    )));
                }
                task.status = TaskStatus::InProgress;
                Ok(())
        })
    }

    /// `{claimed|in-progress} -> completed`.
    pub fn complete(&self, project_id: &str, task_id: &str, by: &str, result: TaskResult) -> Result<Task, RuntimeError> {
        self.transition(project_id, task_id, |task| {
                if task.claimed_by.as_deref() != Some(by)
                || !matches!(task.status, TaskStatus::Claimed | TaskStatus::InProgress)
                {
                    return Err(RuntimeError::InvalidState(format!(
                                "task {} is not held by {} in a completable state",
                                task_id, by
                    )));
                }
                task.status = TaskStatus::Completed;
                task.result = Some(result.clone());
                Ok(())
        })
    }

    /// `{claimed|in-progress} -> available` with `failure_reason` recorded and `claimed_by`
    /// cleared, returning the task to the pool for retry.
    pub fn fail(&self, project_id: &str, task_id: &str, by: &str, reason: &str) -> Result<Task, RuntimeError> {
        self.transition(project_id, task_id, |task| {
                if task.claimed_by.as_deref() != Some(by)
                || !matches!(task.status, TaskStatus::Claimed | TaskStatus::InProgress)
                {
                    return Err(RuntimeError::InvalidState(format!(
                                "task {} is not held by {} in a failable state",
                                task_id, by
                    )));
                }
                task.status = TaskStatus::Available;
                task.claimed_by = None;
                task.claimed_at = None;
                task.failure_reason = Some(reason.to_string());
                Ok(())
        })
    }

    /// Any `{claimed, in-progress}` task whose `claimed_at` is older than `max_age_ms`
    /// transitions back to `available`. If `by_scope` is set, only tasks claimed by an agent id
    /// matching that scope (exact id, or an ephemeral-worker id prefixed by the scope) are reset.
    pub fn reset_stale(&self, project_id: &str, max_age_ms: i64, by_scope: Option<&str>) -> Result<Vec<Task>, RuntimeError> {
        let mut reset = Vec::new();
        self.store.update(project_id, |project| {
                let now = Utc::now();
                for task in project.tasks.iter_mut() {
                    if !task.is_stale(now, max_age_ms) {
                        continue;
                    }
                    if let Some(scope) = by_scope {
                        let claimant = task.claimed_by.as_deref().unwrap_or("");
                        if claimant != scope && !claimant.starts_with(&format!("{}-", scope)) {
                            continue;
                        }
                    }
                    task.status = TaskStatus::Available;
                    task.claimed_by = None;
                    task.claimed_at = None;
                    reset.push(task.clone());
                }
                Ok(())
        })?;
        Ok(reset)
    }

    pub fn list(&self, project_id: &str) -> Result<Vec<Task>, RuntimeError> {
        Ok(self
                .store
                .get(project_id)?
                .ok_or_else(|| RuntimeError::NotFound(format!("project {}", project_id)))?
                .tasks)
    }

    fn transition<F>(&self, project_id: &str, task_id: &str, f: F) -> Result<Task, RuntimeError>
    where
    F: FnOnce(&mut Task) -> Result<(), RuntimeError>,
    {
        let mut out = None;
        self.store.update(project_id, |project| {
                let task = project
                    .tasks
                    .iter_mut()
                    .find(|t| t.id == task_id)
                    .ok_or_else(|| RuntimeError::NotFound(format!("task {}", task_id)))?;
                f(task)?;
                out = Some(task.clone());
                Ok(())
        })?;
        Ok(out.expect("set on success path"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::Project;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, ProjectStore) {
        let dir = tempdir().unwrap();
        let store = ProjectStore::new(dir.path());
        store.create(Project::new("p1", "Demo", "demo")).unwrap();
        (dir, store)
    }

    #[test]
    fn claim_next_respects_priority_then_creation_order() {
        let (_dir, store) = setup();
        let pool = TaskPool::new(&store);
        pool.create_task("p1", "sup", "low", "d", TaskContext::default(), 1)
            .unwrap();
        pool.create_task("p1", "sup", "high", "d", TaskContext::default(), 9)
            .unwrap();
        pool.create_task("p1", "sup", "mid", "d", TaskContext::default(), 5)
            .unwrap();

        let claimed = pool.claim_next("p1", "w1").unwrap().unwrap();
        assert_eq!(claimed.title, "high");
    }

    #[test]
    fn agent_cannot_hold_two_active_tasks() {
        let (_dir, store) = setup();
        let pool = TaskPool::new(&store);
        pool.create_task("p1", "sup", "a", "d", TaskContext::default(), 5)
            .unwrap();
        pool.create_task("p1", "sup", "b", "d", TaskContext::default(), 5)
            .unwrap();
        pool.claim_next("p1", "w1").unwrap();
        let err = pool.claim_next("p1", "w1").unwrap_err();
        assert!(matches!(err, RuntimeError::AlreadyHasTask(_)));
    }

    #[test]
    fn full_lifecycle_claim_fail_reclaim() {
        let (_dir, store) = setup();
        let pool = TaskPool::new(&store);
        let task = pool
            .create_task("p1", "sup", "t", "d", TaskContext::default(), 5)
            .unwrap();
        let claimed = pool.claim("p1", &task.id, "w1").unwrap();
        pool.start("p1", &claimed.id, "w1").unwrap();
        pool.fail("p1", &claimed.id, "w1", "oops").unwrap();

        let reclaimed = pool.claim("p1", &task.id, "w2").unwrap();
        assert_eq!(reclaimed.id, task.id);
        assert_eq!(reclaimed.claimed_by.as_deref(), Some("w2"));
    }

    #[test]
    fn complete_records_result() {
        let (_dir, store) = setup();
        let pool = TaskPool::new(&store);
        let task = pool
            .create_task("p1", "sup", "t", "d", TaskContext::default(), 5)
            .unwrap();
        pool.claim("p1", &task.id, "w1").unwrap();
        let result = TaskResult {
            files_created: vec!["a.rs".into()],
            files_modified: vec![],
            summary: "done".into(),
        };
        let completed = pool.complete("p1", &task.id, "w1", result).unwrap();
        assert_eq!(completed.status, TaskStatus::Completed);
        assert_eq!(completed.result.unwrap().summary, "done");
    }

    #[test]
    fn reset_stale_returns_claimed_tasks_to_pool() {
        let (_dir, store) = setup();
        let pool = TaskPool::new(&store);
        let task = pool
            .create_task("p1", "sup", "t", "d", TaskContext::default(), 5)
            .unwrap();
        pool.claim("p1", &task.id, "w1").unwrap();
        // Force staleness by rewinding claimed_at.
        store
            .update("p1", |p| {
                p.tasks[0].claimed_at = Some(Utc::now() - chrono::Duration::minutes(10));
                Ok(())
        })
            .unwrap();
        let reset = pool.reset_stale("p1", 5 * 60 * 1000, None).unwrap();
        assert_eq!(reset.len(), 1);
        assert_eq!(reset[0].status, TaskStatus::Available);
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let (_dir, store) = setup();
        let pool = TaskPool::new(&store);
        let task = pool
            .create_task("p1", "sup", "t", "d", TaskContext::default(), 5)
            .unwrap();
        let err = pool
            .start("p1", &task.id, "nobody")
            .unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidState(_)));
    }
}
