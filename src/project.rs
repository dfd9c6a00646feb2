//! Project data model and the atomic-snapshot store that
//! backs `projects.json`.

use crate::errors::RuntimeError;
use crate::store::AtomicSnapshot;
use crate::task_pool::Task;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// A single agent slot within a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectAgentConfig {
    pub id: String,
    pub name: String,
    pub role: String,
    pub system_prompt: String,
    /// Resolved relative to `{projectsDir}/{project.folder}/{homeFolder}`; the only writable
    /// root for this agent's filesystem tools.
    pub home_folder: String,
    pub ephemeral: bool,
    pub reports_to: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub memory_summary: Option<String>,
}

impl ProjectAgentConfig {
    pub fn new(id: impl Into<String>, name: impl Into<String>, role: impl Into<String>, system_prompt: impl Into<String>, home_folder: impl Into<String>) -> Self {
        ProjectAgentConfig {
            id: id.into(),
            name: name.into(),
            role: role.into(),
            system_prompt: system_prompt.into(),
            home_folder: home_folder.into(),
            ephemeral: false,
            reports_to: None,
            provider: None,
            model: None,
            memory_summary: None,
        }
    }

    /// `{projectsDir}/{project.folder}/{homeFolder}` — this config's exclusive writable root.
    pub fn resolved_home(&self, projects_dir: &Path, project_folder: &str) -> PathBuf {
        projects_dir.join(project_folder).join(&self.home_folder)
    }
}

/// A project: a named workspace folder, its agent roster, task pool, and shared knowledge root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub folder: String,
    pub agents: Vec<ProjectAgentConfig>,
    pub knowledge: Option<String>,
    pub tasks: Vec<Task>,
    pub provider: Option<String>,
    pub model: Option<String>,
}

impl Project {
    pub fn new(id: impl Into<String>, name: impl Into<String>, folder: impl Into<String>) -> Self {
        Project {
            id: id.into(),
            name: name.into(),
            folder: folder.into(),
            agents: Vec::new(),
            knowledge: None,
            tasks: Vec::new(),
            provider: None,
            model: None,
        }
    }

    /// `agents[*].id` is unique within the project.
    pub fn add_agent(&mut self, agent: ProjectAgentConfig) -> Result<(), RuntimeError> {
        if self.agents.iter().any(|a| a.id == agent.id) {
            return Err(RuntimeError::InvalidState(format!(
                        "agent id {} already present in project {}",
                        agent.id, self.id
            )));
        }
        if let Some(reports_to) = &agent.reports_to {
            let target_exists = self
                .agents
                .iter()
                .any(|a| &a.id == reports_to && !a.ephemeral);
            if !target_exists {
                return Err(RuntimeError::InvalidState(format!(
                            "reportsTo {} does not reference a non-ephemeral agent in project {}",
                            reports_to, self.id
                )));
            }
        }
        self.agents.push(agent);
        Ok(())
    }

    pub fn remove_agent(&mut self, agent_id: &str) -> Option<ProjectAgentConfig> {
        let idx = self.agents.iter().position(|a| a.id == agent_id)?;
        Some(self.agents.remove(idx))
    }

    pub fn get_agent(&self, agent_id: &str) -> Option<&ProjectAgentConfig> {
        self.agents.iter().find(|a| a.id == agent_id)
    }

    /// Deletes ephemeral agent configs owned by `by_scope` (matched against `reports_to`), or
    /// every ephemeral agent when `by_scope` is `None`. Returns the removed configs.
    pub fn remove_ephemeral_workers(&mut self, by_scope: Option<&str>) -> Vec<ProjectAgentConfig> {
        let mut removed = Vec::new();
        self.agents.retain(|a| {
            let owned = match by_scope {
                None => true,
                Some(scope) => a.reports_to.as_deref() == Some(scope),
            };
            if a.ephemeral && owned {
                removed.push(a.clone());
                false
            } else {
                true
            }
        });
        removed
    }
}

/// Atomic-snapshot-backed store of every project under the shared directory's `projects.json`.
pub struct ProjectStore {
    snapshot: AtomicSnapshot,
}

impl ProjectStore {
    pub fn new(shared_dir: impl AsRef<Path>) -> Self {
        ProjectStore {
            snapshot: AtomicSnapshot::new(shared_dir.as_ref().join("projects.json")),
        }
    }

    pub fn create(&self, project: Project) -> Result<Project, RuntimeError> {
        let id = project.id.clone();
        Ok(self
                .snapshot
                .update(&id, |_: Option<Project>| project)?)
    }

    pub fn get(&self, project_id: &str) -> Result<Option<Project>, RuntimeError> {
        let map: HashMap<String, Project> = self.snapshot.read()?;
        Ok(map.get(project_id).cloned())
    }

    pub fn list(&self) -> Result<Vec<Project>, RuntimeError> {
        let map: HashMap<String, Project> = self.snapshot.read()?;
        Ok(map.into_values().collect())
    }

    /// Read-modify-write a single project under the snapshot lock (used by the task pool and
    /// agent-roster mutations so multi-field updates to one project stay consistent).
    pub fn update<F>(&self, project_id: &str, f: F) -> Result<Project, RuntimeError>
    where
    F: FnOnce(&mut Project) -> Result<(), RuntimeError>,
    {
        let mut err = None;
        let result = self.snapshot.update(project_id, |previous: Option<Project>| {
                let mut project = match previous {
                    Some(p) => p,
                    None => {
                        err = Some(RuntimeError::NotFound(format!("project {}", project_id)));
                        return Project::new(project_id, "", "");
                    }
                };
                if let Err(e) = f(&mut project) {
                    err = Some(e);
                }
                project
        })?;
        if let Some(e) = err {
            return Err(e);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn add_agent_rejects_duplicate_id() {
        let mut project = Project::new("p1", "Demo", "demo");
        project
            .add_agent(ProjectAgentConfig::new("sup", "Supervisor", "supervisor", "You lead.", "sup"))
            .unwrap();
        let err = project
            .add_agent(ProjectAgentConfig::new("sup", "Supervisor2", "supervisor", "..", "sup2"))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidState(_)));
    }

    #[test]
    fn add_agent_rejects_reports_to_missing_target() {
        let mut project = Project::new("p1", "Demo", "demo");
        let mut worker = ProjectAgentConfig::new("w1", "Worker", "backend", "..", "w1");
        worker.reports_to = Some("nobody".into());
        let err = project.add_agent(worker).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidState(_)));
    }

    #[test]
    fn remove_ephemeral_workers_only_removes_scoped_ephemeral_agents() {
        let mut project = Project::new("p1", "Demo", "demo");
        project
            .add_agent(ProjectAgentConfig::new("sup", "Supervisor", "supervisor", "..", "sup"))
            .unwrap();
        let mut worker = ProjectAgentConfig::new("worker-1", "Worker", "backend", "..", "sup");
        worker.ephemeral = true;
        worker.reports_to = Some("sup".into());
        project.add_agent(worker).unwrap();

        let removed = project.remove_ephemeral_workers(Some("someone-else"));
        assert!(removed.is_empty());
        assert_eq!(project.agents.len(), 2);

        let removed = project.remove_ephemeral_workers(Some("sup"));
        assert_eq!(removed.len(), 1);
        assert_eq!(project.agents.len(), 1);
        assert_eq!(project.agents[0].id, "sup");
    }

    #[test]
    fn project_store_round_trips() {
        let dir = tempdir().unwrap();
        let store = ProjectStore::new(dir.path());
        store.create(Project::new("p1", "Demo", "demo")).unwrap();
        let fetched = store.get("p1").unwrap().unwrap();
        assert_eq!(fetched.name, "Demo");
        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn project_store_update_mutates_in_place() {
        let dir = tempdir().unwrap();
        let store = ProjectStore::new(dir.path());
        store.create(Project::new("p1", "Demo", "demo")).unwrap();
        store
            .update("p1", |p| {
                p.knowledge = Some("context".into());
                Ok(())
        })
            .unwrap();
        assert_eq!(store.get("p1").unwrap().unwrap().knowledge.unwrap(), "context");
    }
}
