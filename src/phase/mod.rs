//! Phased startup scheduler.
//!
//! A [`PhaseMachine`] is an ordered list of phase groups, each an ordered
//! list of phases. Components hook phases by name; running a group runs its
//! phases in order and, within a phase, every hook in registration order,
//! each awaited before the next starts.
//!
//! The standard lifecycle:
//!
//! ```text
//! INIT    SYS_INIT  SYS_READY
//! LOAD    LOAD_INIT  LOAD_CONFIG  LOAD_DATA
//! CONNECT NET_CONNECT  NET_AUTH  NET_REGISTER  NET_DECLARE  NET_READY
//! CONFIG  CONFIG_INIT  CONFIG_APPLY
//! READY   APP_READY
//! RUN     APP_RUN
//! ```
//!
//! Groups run strictly in declaration order: asking for a group whose
//! predecessors have not completed fails with [`NetError::PhaseOrder`].

mod bootstrap;
mod registry;

pub use bootstrap::{BootStatus, Bootstrap, Component};
pub use registry::PhaseRegistry;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;

use crate::error::{NetError, NetResult};

/// Future returned by a phase hook.
pub type HookFuture = BoxFuture<'static, anyhow::Result<()>>;

/// Where a hook is running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseMeta {
    /// Machine name.
    pub machine: String,
    /// Group being run.
    pub group: String,
    /// Phase being run.
    pub phase: String,
}

/// A function run when its phase is reached.
#[derive(Clone)]
pub struct PhaseHook {
    f: Arc<dyn Fn(Value, PhaseMeta) -> HookFuture + Send + Sync>,
}

impl fmt::Debug for PhaseHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhaseHook").finish_non_exhaustive()
    }
}

impl PhaseHook {
    /// Wrap an async hook.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Value, PhaseMeta) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            f: Arc::new(move |payload, meta| -> HookFuture { Box::pin(f(payload, meta)) }),
        }
    }

    /// Wrap a synchronous hook.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(Value, PhaseMeta) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::new(move |payload, meta| std::future::ready(f(payload, meta)))
    }

    fn invoke(&self, payload: Value, meta: PhaseMeta) -> HookFuture {
        (self.f)(payload, meta)
    }
}

/// A named, ordered list of phases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseGroup {
    /// Group name.
    pub name: String,
    /// Phases in run order.
    pub phases: Vec<String>,
}

impl PhaseGroup {
    /// Build a group from string slices.
    pub fn new(name: &str, phases: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            phases: phases.iter().map(ToString::to_string).collect(),
        }
    }
}

/// Read-only view of a machine's progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PhaseStatus {
    /// Group most recently entered.
    pub current_group: Option<String>,
    /// Phase most recently entered.
    pub current_phase: Option<String>,
    /// Groups that ran every hook to completion.
    pub completed_groups: Vec<String>,
    /// `true` once every group has completed.
    pub done: bool,
}

/// Ordered phase groups plus the hooks registered against their phases.
pub struct PhaseMachine {
    name: String,
    groups: Vec<PhaseGroup>,
    hooks: Mutex<HashMap<String, Vec<PhaseHook>>>,
    status: Mutex<PhaseStatus>,
    /// Serializes group runs.
    run_lock: tokio::sync::Mutex<()>,
}

impl fmt::Debug for PhaseMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhaseMachine")
            .field("name", &self.name)
            .field("groups", &self.groups)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl PhaseMachine {
    /// Machine over `groups`, run in the given order.
    pub fn new(name: impl Into<String>, groups: Vec<PhaseGroup>) -> Self {
        Self {
            name: name.into(),
            groups,
            hooks: Mutex::new(HashMap::new()),
            status: Mutex::new(PhaseStatus::default()),
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Machine with the standard `INIT, LOAD, CONNECT, CONFIG, READY, RUN`
    /// lifecycle.
    pub fn lifecycle(name: impl Into<String>) -> Self {
        Self::new(
            name,
            vec![
                PhaseGroup::new("INIT", &["SYS_INIT", "SYS_READY"]),
                PhaseGroup::new("LOAD", &["LOAD_INIT", "LOAD_CONFIG", "LOAD_DATA"]),
                PhaseGroup::new(
                    "CONNECT",
                    &["NET_CONNECT", "NET_AUTH", "NET_REGISTER", "NET_DECLARE", "NET_READY"],
                ),
                PhaseGroup::new("CONFIG", &["CONFIG_INIT", "CONFIG_APPLY"]),
                PhaseGroup::new("READY", &["APP_READY"]),
                PhaseGroup::new("RUN", &["APP_RUN"]),
            ],
        )
    }

    /// Machine name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured groups in run order.
    pub fn groups(&self) -> &[PhaseGroup] {
        &self.groups
    }

    fn hooks(&self) -> MutexGuard<'_, HashMap<String, Vec<PhaseHook>>> {
        self.hooks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn status_mut(&self) -> MutexGuard<'_, PhaseStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a hook to `phase`. Phases that no group names are accepted and
    /// reported by [`dangling_hooks`](Self::dangling_hooks).
    pub fn hook_phase(&self, phase: &str, hook: PhaseHook) {
        if !self.has_phase(phase) {
            log::warn!("[Phase] {}: hook on unknown phase {phase}", self.name);
        }
        self.hooks().entry(phase.to_string()).or_default().push(hook);
    }

    /// Number of hooks on `phase`.
    pub fn hook_count(&self, phase: &str) -> usize {
        self.hooks().get(phase).map_or(0, Vec::len)
    }

    fn has_phase(&self, phase: &str) -> bool {
        self.groups
            .iter()
            .any(|g| g.phases.iter().any(|p| p == phase))
    }

    /// Phase names with hooks that no configured group contains, sorted.
    pub fn dangling_hooks(&self) -> Vec<String> {
        let mut dangling: Vec<String> = self
            .hooks()
            .keys()
            .filter(|phase| !self.has_phase(phase))
            .cloned()
            .collect();
        dangling.sort();
        dangling
    }

    /// Snapshot of progress.
    pub fn status(&self) -> PhaseStatus {
        self.status_mut().clone()
    }

    /// Run `group` with a null payload.
    pub async fn run_phase_group(&self, group: &str) -> NetResult<()> {
        self.run_phase_group_with(group, Value::Null).await
    }

    /// Run every phase of `group`, passing `payload` to each hook.
    ///
    /// # Errors
    ///
    /// - [`NetError::UnknownPhaseGroup`] if no such group is configured
    /// - [`NetError::PhaseOrder`] if an earlier group has not completed
    /// - [`NetError::HookFailed`] if a hook fails; the rest of the group is
    ///   skipped and the group is not marked complete
    pub async fn run_phase_group_with(&self, group: &str, payload: Value) -> NetResult<()> {
        let _running = self.run_lock.lock().await;

        let index = self
            .groups
            .iter()
            .position(|g| g.name == group)
            .ok_or_else(|| NetError::UnknownPhaseGroup(group.to_string()))?;

        {
            let status = self.status_mut();
            if let Some(missing) = self.groups[..index]
                .iter()
                .find(|g| !status.completed_groups.contains(&g.name))
            {
                return Err(NetError::PhaseOrder {
                    group: group.to_string(),
                    waiting_on: missing.name.clone(),
                });
            }
        }

        log::info!("[Phase] {}/{group} start", self.name);
        self.status_mut().current_group = Some(group.to_string());

        for phase in &self.groups[index].phases {
            self.status_mut().current_phase = Some(phase.clone());
            let hooks = self.hooks().get(phase).cloned().unwrap_or_default();
            log::debug!("[Phase] {}/{phase}: {} hook(s)", self.name, hooks.len());

            for hook in hooks {
                let meta = PhaseMeta {
                    machine: self.name.clone(),
                    group: group.to_string(),
                    phase: phase.clone(),
                };
                if let Err(e) = hook.invoke(payload.clone(), meta).await {
                    log::error!("[Phase] {}/{phase} hook failed: {e:#}", self.name);
                    return Err(NetError::HookFailed {
                        machine: self.name.clone(),
                        phase: phase.clone(),
                        message: format!("{e:#}"),
                    });
                }
            }
        }

        let mut status = self.status_mut();
        if !status.completed_groups.iter().any(|g| g == group) {
            status.completed_groups.push(group.to_string());
        }
        status.done = self
            .groups
            .iter()
            .all(|g| status.completed_groups.contains(&g.name));
        log::info!("[Phase] {}/{group} complete", self.name);
        Ok(())
    }

    /// Run every group in declaration order.
    pub async fn run_all(&self) -> NetResult<()> {
        for group in &self.groups {
            self.run_phase_group(&group.name).await?;
        }
        Ok(())
    }
}
