//! `ProcessManager`: resolves model/alias names to groups, enforces
//! cross-group exclusivity, and owns the daemon-wide shutdown sequence.
//!
//! A single `Mutex<()>` serializes mutating operations, `shutdown_all` drains
//! every managed group, and `each_process` gives a read-only snapshot for the
//! control surface.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use tokio::sync::{broadcast, Mutex};

use crate::config::Config;
use crate::error::SwapError;
use crate::process::group::ProcessGroup;
use crate::process::{Process, StateChangeEvent};

/// A read-only snapshot of one process, for the `/processes` admin endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProcessSnapshot {
    pub group: String,
    pub model: String,
    pub state: &'static str,
    pub in_flight: u32,
    pub unlisted: bool,
}

pub struct ProcessManager {
    groups: IndexMap<String, Arc<ProcessGroup>>,
    /// model id -> owning group id, built once at construction.
    model_to_group: HashMap<String, String>,
    /// alias (including bare model ids) -> model id.
    aliases: HashMap<String, String>,
    /// Serializes `swap` calls so cross-group exclusivity checks and the
    /// stop-then-start ordering they require can't interleave.
    serialize: Mutex<()>,
    events: broadcast::Sender<StateChangeEvent>,
    last_active_group: Mutex<Option<String>>,
    /// Set once by `shutdown_all`; every subsequent `swap` fails fast
    /// instead of racing a teardown that is already in progress.
    shutting_down: AtomicBool,
}

impl ProcessManager {
    pub fn new(config: &Config) -> Self {
        let (events, _rx) = broadcast::channel(256);
        let mut groups = IndexMap::new();
        let mut model_to_group = HashMap::new();

        for (group_id, group_cfg) in &config.groups {
            let group_cfg = Arc::new(group_cfg.clone());
            let group = Arc::new(ProcessGroup::new(
                Arc::clone(&group_cfg),
                &group_cfg.members,
                &events,
                &config.models,
            ));
            for member in &group_cfg.members {
                model_to_group.insert(member.clone(), group_id.clone());
            }
            groups.insert(group_id.clone(), group);
        }

        ProcessManager {
            groups,
            model_to_group,
            aliases: config.aliases.clone(),
            serialize: Mutex::new(()),
            events,
            last_active_group: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChangeEvent> {
        self.events.subscribe()
    }

    fn resolve(&self, name: &str) -> Result<String, SwapError> {
        self.aliases
            .get(name)
            .cloned()
            .ok_or_else(|| SwapError::UnknownModel(name.to_string()))
    }

    fn group_for(&self, model_id: &str) -> Result<Arc<ProcessGroup>, SwapError> {
        let group_id =
            self.model_to_group
                .get(model_id)
                .cloned()
                .ok_or_else(|| SwapError::GroupNotFound {
                    model: model_id.to_string(),
                })?;
        Ok(Arc::clone(&self.groups[&group_id]))
    }

    /// Resolve `name` to a running `Process`, starting (and swapping) as
    /// needed. This is the single entry point both the dispatcher and the
    /// admin "preload" hook use.
    ///
    /// Cross-group policy, in the order the spec lays out:
    /// 1. cross-group swap — if the last activated group differs from the
    ///    target and both are non-persistent, stop the last one first;
    /// 2. exclusive enforcement — if the target group is `exclusive`, stop
    ///    every *other* non-persistent group;
    /// 3. delegate to the target group's own `swap`-scoped activation.
    /// Both stop passes must fully complete (children exited, states
    /// STOPPED) before the target's child is spawned.
    pub async fn swap(&self, name: &str) -> Result<Arc<Process>, SwapError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(SwapError::ShuttingDown);
        }
        let _guard = self.serialize.lock().await;
        let model_id = self.resolve(name)?;
        let group = self.group_for(&model_id)?;

        let mut last_active = self.last_active_group.lock().await;

        if let Some(active_id) = last_active.clone() {
            if active_id != group.id && !group.config.persistent {
                if let Some(active_group) = self.groups.get(&active_id) {
                    if !active_group.config.persistent {
                        active_group.stop_all().await;
                    }
                }
            }
        }

        if group.config.exclusive {
            for (other_id, other_group) in &self.groups {
                if *other_id == group.id || other_group.config.persistent {
                    continue;
                }
                other_group.stop_all().await;
            }
        }

        let process = group.activate(&model_id).await?;

        if !group.config.persistent {
            *last_active = Some(group.id.clone());
        }

        Ok(process)
    }

    /// Find the owning group for a model or alias without starting anything.
    pub fn find_group_by_model(&self, name: &str) -> Option<String> {
        let model_id = self.aliases.get(name)?;
        self.model_to_group.get(model_id).cloned()
    }

    /// Read-only snapshot of every managed process, grouped in config order.
    pub async fn each_process(&self) -> Vec<ProcessSnapshot> {
        let mut out = Vec::new();
        for group in self.groups.values() {
            for (model_id, process) in &group.members {
                out.push(ProcessSnapshot {
                    group: group.id.clone(),
                    model: model_id.clone(),
                    state: process.state().await.as_str(),
                    in_flight: process.in_flight(),
                    unlisted: process.model.unlisted,
                });
            }
        }
        out
    }

    /// Stop every group, unconditionally, for daemon shutdown. Idempotent.
    pub async fn shutdown_all(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let _guard = self.serialize.lock().await;
        let shutdowns = self.groups.values().map(|g| g.shutdown());
        futures::future::join_all(shutdowns).await;
    }

    /// The most recently *started* READY process across every group, for
    /// non-model-scoped aggregate views (`/slots`, `/props`) that have no
    /// model name to resolve against.
    pub async fn most_recently_started_ready(&self) -> Option<Arc<Process>> {
        let mut best: Option<(std::time::Instant, Arc<Process>)> = None;
        for group in self.groups.values() {
            for process in group.members.values() {
                if process.state().await != crate::process::ProcessState::Ready {
                    continue;
                }
                let Some(started) = process.started_at().await else {
                    continue;
                };
                if best.as_ref().map(|(t, _)| started > *t).unwrap_or(true) {
                    best = Some((started, Arc::clone(process)));
                }
            }
        }
        best.map(|(_, p)| p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CheckEndpoint, GroupConfig, ModelConfig};
    use std::time::Duration;

    fn test_config() -> Config {
        let mut models = IndexMap::new();
        let mut aliases = HashMap::new();
        for id in ["a", "b"] {
            let model = Arc::new(ModelConfig {
                id: id.to_string(),
                cmd: vec!["/bin/sh".to_string(), "-c".to_string(), "sleep 30".to_string()],
                cmd_stop: None,
                proxy: "http://127.0.0.1:0".to_string(),
                check_endpoint: CheckEndpoint::None,
                env: vec![],
                unload_after: None,
                aliases: vec![format!("{id}-alias")],
                use_model_name: None,
                strip_params: vec![],
                unlisted: false,
                health_check_timeout: Duration::from_secs(15),
            });
            aliases.insert(id.to_string(), id.to_string());
            aliases.insert(format!("{id}-alias"), id.to_string());
            models.insert(id.to_string(), model);
        }
        let mut groups = IndexMap::new();
        groups.insert(
            "g".to_string(),
            GroupConfig {
                id: "g".to_string(),
                members: vec!["a".to_string(), "b".to_string()],
                swap: true,
                exclusive: false,
                persistent: false,
            },
        );
        Config {
            health_check_timeout: Duration::from_secs(15),
            start_port: 5800,
            models,
            groups,
            aliases,
            preload: vec![],
        }
    }

    #[tokio::test]
    async fn unknown_name_is_rejected_before_touching_any_process() {
        let manager = ProcessManager::new(&test_config());
        let err = manager.swap("nope").await.unwrap_err();
        assert!(matches!(err, SwapError::UnknownModel(_)));
    }

    #[test]
    fn find_group_by_model_resolves_aliases_too() {
        let manager = ProcessManager::new(&test_config());
        assert_eq!(manager.find_group_by_model("a-alias").as_deref(), Some("g"));
        assert_eq!(manager.find_group_by_model("a").as_deref(), Some("g"));
        assert_eq!(manager.find_group_by_model("missing"), None);
    }

    #[tokio::test]
    async fn shutdown_all_is_idempotent() {
        let manager = ProcessManager::new(&test_config());
        manager.swap("a").await.unwrap();
        manager.shutdown_all().await;
        manager.shutdown_all().await;
        for snapshot in manager.each_process().await {
            assert_eq!(snapshot.state, "shutdown");
        }
    }

    #[tokio::test]
    async fn swap_after_shutdown_is_rejected_without_touching_any_process() {
        let manager = ProcessManager::new(&test_config());
        manager.shutdown_all().await;
        let err = manager.swap("a").await.unwrap_err();
        assert!(matches!(err, SwapError::ShuttingDown));
    }

    fn two_group_config() -> Config {
        let mut models = IndexMap::new();
        let mut aliases = HashMap::new();
        for id in ["a", "b"] {
            let model = Arc::new(ModelConfig {
                id: id.to_string(),
                cmd: vec!["/bin/sh".to_string(), "-c".to_string(), "sleep 30".to_string()],
                cmd_stop: None,
                proxy: "http://127.0.0.1:0".to_string(),
                check_endpoint: CheckEndpoint::None,
                env: vec![],
                unload_after: None,
                aliases: vec![],
                use_model_name: None,
                strip_params: vec![],
                unlisted: false,
                health_check_timeout: Duration::from_secs(15),
            });
            aliases.insert(id.to_string(), id.to_string());
            models.insert(id.to_string(), model);
        }
        let mut groups = IndexMap::new();
        groups.insert(
            "g1".to_string(),
            GroupConfig {
                id: "g1".to_string(),
                members: vec!["a".to_string()],
                swap: true,
                exclusive: false,
                persistent: false,
            },
        );
        groups.insert(
            "g2".to_string(),
            GroupConfig {
                id: "g2".to_string(),
                members: vec!["b".to_string()],
                swap: true,
                exclusive: false,
                persistent: false,
            },
        );
        Config {
            health_check_timeout: Duration::from_secs(15),
            start_port: 5800,
            models,
            groups,
            aliases,
            preload: vec![],
        }
    }

    #[tokio::test]
    async fn activating_a_different_nonpersistent_group_stops_the_previous_one() {
        let manager = ProcessManager::new(&two_group_config());
        let proc_a = manager.swap("a").await.unwrap();
        assert_eq!(proc_a.state().await, crate::process::ProcessState::Ready);

        manager.swap("b").await.unwrap();

        assert_ne!(
            proc_a.state().await,
            crate::process::ProcessState::Ready,
            "activating group g2 must stop group g1's READY process first"
        );
    }
}
