//! Ephemeral worker runtime: the background lifecycle behind `spawn_worker`.
//!
//! Grounded in an `Agent::fork()`/`fork_with_context()` "fork, don't clone" shape: a worker is a
//! fresh, disposable agent slot that shares its spawner's home folder rather than nesting its
//! own, is bootstrapped with a fixed instruction to claim a task, and runs under a much lower
//! iteration cap than a normal agent turn.

use crate::agentic_loop::{AgenticLoop, ConversationHistory};
use crate::client_wrapper::ClientWrapper;
use crate::errors::RuntimeError;
use crate::event::{Event, EventHandler};
use crate::project::{Project, ProjectAgentConfig, ProjectStore};
use crate::runtime::Runtime;
use crate::tool_protocol::ToolRegistry;
use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// Fixed bootstrap message every spawned worker opens its turn with.
pub const WORKER_BOOTSTRAP_MESSAGE: &str = "Start by claiming a task from the pool.";

/// Ephemeral workers cap at this many iterations per turn, well below a supervisor's 100.
pub const WORKER_MAX_ITERATIONS: usize = 20;

/// Tool names withheld from ephemeral workers: they may not recursively spawn more workers,
/// delegate tasks, create new tasks, or propose new permanent agents.
pub const EPHEMERAL_EXCLUDED_TOOLS: &[&str] =
    &["spawn_worker", "delegate_task", "create_task", "propose_new_agent"];

/// Delay between a worker settling its task and its config being removed from the project.
const SELF_DELETE_DELAY: Duration = Duration::from_secs(1);

/// Builds the client and tool registry for a freshly spawned worker. Implemented by the process
/// wiring that knows how to construct an LLM client for a given provider/model and assemble that
/// worker's restricted tool catalog (typically `full_registry.excluding(EPHEMERAL_EXCLUDED_TOOLS)`).
#[async_trait]
pub trait LoopFactory: Send + Sync {
    async fn build(
        &self,
        agent: &ProjectAgentConfig,
    ) -> Result<(Arc<dyn ClientWrapper>, Arc<ToolRegistry>), RuntimeError>;
}

/// Notified when an agent settles a task via `complete_task`/`fail_task`, so the ephemeral
/// worker runtime can schedule self-deletion. A no-op for agents it isn't tracking.
#[async_trait]
pub trait WorkerLifecycle: Send + Sync {
    async fn on_task_settled(&self, project_id: &str, agent_id: &str);
}

fn new_worker_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(5)
        .map(char::from)
        .collect::<String>()
        .to_lowercase();
    format!("worker-{}-{}", chrono::Utc::now().timestamp_millis(), suffix)
}

/// Owns the background spawn/run/self-delete lifecycle of ephemeral workers for one process.
pub struct EphemeralWorkerRuntime {
    runtime: Arc<Runtime>,
    store: Arc<ProjectStore>,
    event_handler: Arc<dyn EventHandler>,
    factory: Arc<dyn LoopFactory>,
    max_concurrent: usize,
}

impl EphemeralWorkerRuntime {
    pub fn new(
        runtime: Arc<Runtime>,
        store: Arc<ProjectStore>,
        event_handler: Arc<dyn EventHandler>,
        factory: Arc<dyn LoopFactory>,
        max_concurrent: usize,
    ) -> Self {
        EphemeralWorkerRuntime {
            runtime,
            store,
            event_handler,
            factory,
            max_concurrent,
        }
    }

    fn active_ephemeral_count(project: &Project) -> usize {
        project.agents.iter().filter(|a| a.ephemeral).count()
    }

    /// Spawns up to `min(count, maxConcurrent - active)` workers under `spawner`, returning the
    /// ids actually spawned. Each spawned worker's agentic loop runs as a detached background
    /// task; this call itself returns as soon as the configs are persisted.
    pub async fn spawn_batch(
        self: &Arc<Self>,
        project_id: &str,
        spawner: &ProjectAgentConfig,
        count: usize,
    ) -> Result<Vec<String>, RuntimeError> {
        let project = self
            .store
            .get(project_id)?
            .ok_or_else(|| RuntimeError::NotFound(format!("project {}", project_id)))?;
        let active = Self::active_ephemeral_count(&project);
        let allowed = count.min(self.max_concurrent.saturating_sub(active));

        let mut spawned = Vec::with_capacity(allowed);
        for _ in 0..allowed {
            let worker_id = new_worker_id();
            let worker = ProjectAgentConfig {
                id: worker_id.clone(),
                name: format!("Worker {}", worker_id),
                role: spawner.role.clone(),
                system_prompt: format!(
                    "You are an ephemeral worker spawned by {}. Claim a task from the pool, \
                     complete or fail it, then stop.",
                    spawner.id
                ),
                home_folder: spawner.home_folder.clone(),
                ephemeral: true,
                reports_to: Some(spawner.id.clone()),
                provider: spawner.provider.clone(),
                model: spawner.model.clone(),
                memory_summary: None,
            };
            self.store.update(project_id, |p| p.add_agent(worker.clone()))?;
            self.event_handler
                .on_event(&Event::WorkerSpawned {
                    project_id: project_id.to_string(),
                    worker_id: worker_id.clone(),
                    spawned_by: spawner.id.clone(),
                })
                .await;
            spawned.push(worker_id);
            self.clone().spawn_loop(worker);
        }
        Ok(spawned)
    }

    fn spawn_loop(self: Arc<Self>, worker: ProjectAgentConfig) {
        tokio::spawn(async move {
            let (client, tools) = match self.factory.build(&worker).await {
                Ok(pair) => pair,
                Err(e) => {
                    self.event_handler
                        .on_event(&Event::SystemEvent {
                            agent_id: worker.id.clone(),
                            message: format!("failed to start ephemeral worker: {}", e),
                        })
                        .await;
                    return;
                }
            };
            let agentic_loop = AgenticLoop::new(
                worker.id.clone(),
                client,
                tools,
                self.event_handler.clone(),
                self.runtime.clone(),
                worker.system_prompt.clone(),
            )
            .with_max_iterations(WORKER_MAX_ITERATIONS);

            let mut history = ConversationHistory::new();
            let _ = agentic_loop.run(&mut history, WORKER_BOOTSTRAP_MESSAGE).await;
        });
    }
}

#[async_trait]
impl WorkerLifecycle for EphemeralWorkerRuntime {
    async fn on_task_settled(&self, project_id: &str, agent_id: &str) {
        let project_id = project_id.to_string();
        let agent_id = agent_id.to_string();
        let store = self.store.clone();
        let event_handler = self.event_handler.clone();
        tokio::spawn(async move {
            tokio::time::sleep(SELF_DELETE_DELAY).await;
            let mut was_ephemeral = false;
            let result = store.update(&project_id, |p| {
                was_ephemeral = p.get_agent(&agent_id).map(|a| a.ephemeral).unwrap_or(false);
                if was_ephemeral {
                    p.remove_agent(&agent_id);
                }
                Ok(())
            });
            if result.is_ok() && was_ephemeral {
                event_handler
                    .on_event(&Event::WorkerFinished {
                        project_id,
                        worker_id: agent_id,
                    })
                    .await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_wrapper::{Message, Role};
    use crate::event::NullEventHandler;
    use std::error::Error;
    use tempfile::tempdir;

    struct ImmediateDoneClient;

    #[async_trait]
    impl ClientWrapper for ImmediateDoneClient {
        async fn send_message(
            &self,
            _messages: &[Message],
            _tools: Option<Vec<crate::client_wrapper::ToolDefinition>>,
        ) -> Result<Message, Box<dyn Error>> {
            let mut m = Message::new(Role::Assistant, "no tasks available, stopping");
            m.stop_reason = Some("end_turn".to_string());
            Ok(m)
        }

        fn model_name(&self) -> &str {
            "stub"
        }
    }

    struct StubFactory;

    #[async_trait]
    impl LoopFactory for StubFactory {
        async fn build(
            &self,
            _agent: &ProjectAgentConfig,
        ) -> Result<(Arc<dyn ClientWrapper>, Arc<ToolRegistry>), RuntimeError> {
            Ok((Arc::new(ImmediateDoneClient), Arc::new(ToolRegistry::empty())))
        }
    }

    #[test]
    fn worker_id_has_expected_shape() {
        let id = new_worker_id();
        assert!(id.starts_with("worker-"));
        assert_eq!(id.split('-').count(), 3);
    }

    #[tokio::test]
    async fn spawn_batch_is_bounded_by_max_concurrent_minus_active() {
        let dir = tempdir().unwrap();
        let store = Arc::new(ProjectStore::new(dir.path()));
        store.create(Project::new("p1", "Demo", "demo")).unwrap();
        let spawner = ProjectAgentConfig::new("sup", "Supervisor", "supervisor", "lead", "sup");
        store.update("p1", |p| p.add_agent(spawner.clone())).unwrap();

        let runtime = Arc::new(EphemeralWorkerRuntime::new(
            Arc::new(Runtime::new()),
            store.clone(),
            Arc::new(NullEventHandler),
            Arc::new(StubFactory),
            2,
        ));

        let spawned = runtime.spawn_batch("p1", &spawner, 5).await.unwrap();
        assert_eq!(spawned.len(), 2);
        let project = store.get("p1").unwrap().unwrap();
        assert_eq!(project.agents.iter().filter(|a| a.ephemeral).count(), 2);
    }

    #[tokio::test]
    async fn on_task_settled_removes_ephemeral_agent_after_delay() {
        let dir = tempdir().unwrap();
        let store = Arc::new(ProjectStore::new(dir.path()));
        store.create(Project::new("p1", "Demo", "demo")).unwrap();
        let mut worker = ProjectAgentConfig::new("worker-1", "Worker", "backend", "go", "sup");
        worker.ephemeral = true;
        store.update("p1", |p| p.add_agent(worker.clone())).unwrap();

        let runtime = EphemeralWorkerRuntime::new(
            Arc::new(Runtime::new()),
            store.clone(),
            Arc::new(NullEventHandler),
            Arc::new(StubFactory),
            2,
        );
        runtime.on_task_settled("p1", "worker-1").await;
        tokio::time::sleep(Duration::from_millis(1200)).await;

        let project = store.get("p1").unwrap().unwrap();
        assert!(project.get_agent("worker-1").is_none());
    }
}
