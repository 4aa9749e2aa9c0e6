//! ABOUTME: In-memory WorkflowStore for tests and the CLI demo (spec §3 port, no production backend specified)

use async_trait::async_trait;
use dashmap::DashMap;
use orchestrator_core::ports::{OrchestratorStoreError, WorkflowStore};
use orchestrator_core::workflow_types::WorkflowContext;
use uuid::Uuid;

#[derive(Default)]
pub struct InMemoryWorkflowStore {
    contexts: DashMap<Uuid, WorkflowContext>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn save(&self, ctx: &WorkflowContext) -> Result<(), OrchestratorStoreError> {
        self.contexts.insert(ctx.workflow_id, ctx.clone());
        Ok(())
    }

    async fn load(&self, workflow_id: Uuid) -> Result<Option<WorkflowContext>, OrchestratorStoreError> {
        Ok(self.contexts.get(&workflow_id).map(|e| e.value().clone()))
    }

    async fn delete(&self, workflow_id: Uuid) -> Result<(), OrchestratorStoreError> {
        self.contexts.remove(&workflow_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_core::workflow_types::WorkflowMetadata;
    use std::collections::HashMap;

    fn sample_ctx(workflow_id: Uuid) -> WorkflowContext {
        WorkflowContext {
            workflow_id,
            definition: orchestrator_core::workflow_types::WorkflowDefinition {
                name: "demo".to_string(),
                version: "1".to_string(),
                description: String::new(),
                start_stage: "A".to_string(),
                stages: HashMap::new(),
                global_timeout_ms: 1000,
                max_parallel_stages: 1,
                retry_strategy: Default::default(),
                on_failure: Default::default(),
                data_flow: None,
            },
            current_stage: "A".to_string(),
            stage_results: HashMap::new(),
            input_data: serde_json::json!({}),
            metadata: WorkflowMetadata {
                started_at: chrono::Utc::now(),
            },
        }
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let store = InMemoryWorkflowStore::new();
        let workflow_id = Uuid::new_v4();
        store.save(&sample_ctx(workflow_id)).await.unwrap();
        let loaded = store.load(workflow_id).await.unwrap();
        assert_eq!(loaded.unwrap().workflow_id, workflow_id);
    }

    #[tokio::test]
    async fn delete_removes_the_context() {
        let store = InMemoryWorkflowStore::new();
        let workflow_id = Uuid::new_v4();
        store.save(&sample_ctx(workflow_id)).await.unwrap();
        store.delete(workflow_id).await.unwrap();
        assert!(store.load(workflow_id).await.unwrap().is_none());
    }
}
