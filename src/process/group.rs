//! `ProcessGroup`: the swap/exclusive/persistent membership unit.
//!
//! Owns every member process and serializes the swap-and-activate ordering
//! within the group: at most one member of a `swap` group runs at a time.

use std::sync::Arc;

use indexmap::IndexMap;
use tokio::sync::{broadcast, Mutex};

use crate::config::GroupConfig;
use crate::error::SwapError;
use crate::process::{Process, StopStrategy};

/// A named collection of models that share a swap policy.
///
/// `members` is an `IndexMap` so listing order matches the config file,
/// for deterministic output.
pub struct ProcessGroup {
    pub id: String,
    pub config: Arc<GroupConfig>,
    pub members: IndexMap<String, Arc<Process>>,
    /// Last member this group activated; `None` until the first activation.
    /// Owned exclusively by `activate` — no other code path writes it.
    last_used: Mutex<Option<String>>,
}

impl ProcessGroup {
    pub fn new(
        config: Arc<GroupConfig>,
        model_ids: &[String],
        events: &broadcast::Sender<crate::process::StateChangeEvent>,
        model_configs: &IndexMap<String, Arc<crate::config::ModelConfig>>,
    ) -> Self {
        let mut members = IndexMap::new();
        for id in model_ids {
            let model = model_configs
                .get(id)
                .expect("group member resolved against the model table at config load")
                .clone();
            members.insert(id.clone(), Process::new(model, events.clone()));
        }
        ProcessGroup {
            id: config.id.clone(),
            config,
            members,
            last_used: Mutex::new(None),
        }
    }

    pub fn process(&self, model_id: &str) -> Option<&Arc<Process>> {
        self.members.get(model_id)
    }

    /// Activate `model_id` within this group.
    ///
    /// If `swap` is set and another member is the group's current active
    /// process, that member is stopped (waiting for its in-flight requests
    /// to drain) before the target is started, so only one member of a
    /// `swap` group ever runs at a time. `persistent` is a cross-group
    /// concern only (see `ProcessManager::swap`) — it has no bearing on
    /// whether this group swaps its own members out.
    pub async fn activate(self: &Arc<Self>, model_id: &str) -> Result<Arc<Process>, SwapError> {
        let target = self
            .process(model_id)
            .ok_or_else(|| SwapError::GroupNotFound {
                model: model_id.to_string(),
            })?
            .clone();

        let mut last_used = self.last_used.lock().await;
        if self.config.swap {
            if let Some(prev_id) = last_used.clone() {
                if prev_id != model_id {
                    if let Some(prev) = self.process(&prev_id) {
                        prev.stop(StopStrategy::WaitForInflight).await;
                    }
                }
            }
        }
        target.start().await?;
        *last_used = Some(model_id.to_string());
        Ok(target)
    }

    /// Stop every member, waiting for in-flight requests to drain.
    pub async fn stop_all(&self) {
        let stops = self
            .members
            .values()
            .map(|p| p.stop(StopStrategy::WaitForInflight));
        futures::future::join_all(stops).await;
    }

    /// Unconditional teardown: used only from daemon shutdown.
    pub async fn shutdown(&self) {
        let shutdowns = self.members.values().map(|p| p.shutdown());
        futures::future::join_all(shutdowns).await;
    }

    pub async fn last_active_process(&self) -> Option<String> {
        self.last_used.lock().await.clone()
    }
}
