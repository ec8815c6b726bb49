//! Machines addressed by name.
//!
//! Components that load before the machine they hook into can still
//! register: `hook_phase("APP/NET_CONNECT", ..)` queues the hook until a
//! machine named `APP` is added.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use super::{PhaseHook, PhaseMachine};
use crate::error::{NetError, NetResult};

#[derive(Debug, Default)]
struct RegistryState {
    machines: HashMap<String, Arc<PhaseMachine>>,
    /// (machine, phase, hook) waiting for their machine.
    queued: Vec<(String, String, PhaseHook)>,
}

/// Process-wide set of phase machines.
#[derive(Debug, Default)]
pub struct PhaseRegistry {
    state: Mutex<RegistryState>,
}

/// Split `MACHINE/NAME`.
fn split_selector(selector: &str) -> NetResult<(&str, &str)> {
    match selector.split_once('/') {
        Some((machine, name)) if !machine.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok((machine, name))
        }
        _ => Err(NetError::InvalidSelector(selector.to_string())),
    }
}

impl PhaseRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a machine and attach any hooks queued for it.
    ///
    /// # Errors
    ///
    /// [`NetError::Rejected`] if a machine with that name exists.
    pub fn add_machine(&self, machine: PhaseMachine) -> NetResult<Arc<PhaseMachine>> {
        let mut state = self.state();
        if state.machines.contains_key(machine.name()) {
            return Err(NetError::Rejected(format!(
                "phase machine '{}' already registered",
                machine.name()
            )));
        }

        let (mine, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut state.queued)
            .into_iter()
            .partition(|(name, _, _)| name == machine.name());
        state.queued = rest;
        if !mine.is_empty() {
            log::debug!("[Phase] {}: attaching {} queued hook(s)", machine.name(), mine.len());
        }
        for (_, phase, hook) in mine {
            machine.hook_phase(&phase, hook);
        }

        let machine = Arc::new(machine);
        state
            .machines
            .insert(machine.name().to_string(), Arc::clone(&machine));
        Ok(machine)
    }

    /// Look up a machine.
    pub fn get_machine(&self, name: &str) -> Option<Arc<PhaseMachine>> {
        self.state().machines.get(name).cloned()
    }

    /// Hook `MACHINE/PHASE`, queueing if the machine is not registered yet.
    pub fn hook_phase(&self, selector: &str, hook: PhaseHook) -> NetResult<()> {
        let (machine, phase) = split_selector(selector)?;
        let mut state = self.state();
        match state.machines.get(machine).cloned() {
            Some(m) => m.hook_phase(phase, hook),
            None => {
                log::debug!("[Phase] queued hook for {selector}");
                state
                    .queued
                    .push((machine.to_string(), phase.to_string(), hook));
            }
        }
        Ok(())
    }

    /// Run `MACHINE/GROUP`.
    pub async fn run_phase_group(&self, selector: &str) -> NetResult<()> {
        self.run_phase_group_with(selector, Value::Null).await
    }

    /// Run `MACHINE/GROUP` with a payload for its hooks.
    pub async fn run_phase_group_with(&self, selector: &str, payload: Value) -> NetResult<()> {
        let (machine, group) = split_selector(selector)?;
        let machine = self
            .get_machine(machine)
            .ok_or_else(|| NetError::UnknownMachine(machine.to_string()))?;
        machine.run_phase_group_with(group, payload).await
    }

    /// `MACHINE/PHASE` for every hook that will never run: hooks on unknown
    /// phases of registered machines, and hooks queued for machines that do
    /// not exist. Sorted.
    pub fn dangling_hooks(&self) -> Vec<String> {
        let state = self.state();
        let mut dangling: Vec<String> = state
            .machines
            .values()
            .flat_map(|m| {
                m.dangling_hooks()
                    .into_iter()
                    .map(move |phase| format!("{}/{phase}", m.name()))
            })
            .chain(
                state
                    .queued
                    .iter()
                    .map(|(machine, phase, _)| format!("{machine}/{phase}")),
            )
            .collect();
        dangling.sort();
        dangling.dedup();
        dangling
    }
}
