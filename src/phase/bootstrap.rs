//! Component bootstrap over a phase machine.
//!
//! A process registers its components, sets a shared config object, and
//! calls [`Bootstrap::start`]:
//!
//! 1. every component sees the config through [`Component::pre_config`]
//! 2. every component hooks the phases it needs
//! 3. the machine runs all of its groups
//!
//! Both passes visit components in registration order.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use serde_json::{Map, Value};

use super::{PhaseHook, PhaseMachine, PhaseStatus};
use crate::error::{NetError, NetResult};

/// Phase name reported when a component rejects the config.
const PRE_CONFIG: &str = "PRE_CONFIG";

/// A unit of the process that takes part in startup.
pub trait Component: Send + Sync {
    /// Unique name within a [`Bootstrap`].
    fn name(&self) -> &str;

    /// Receive the shared config before any hook is added.
    fn pre_config(&self, _config: &Value) -> anyhow::Result<()> {
        Ok(())
    }

    /// Hook the phases this component runs in.
    fn add_lifecycle_hooks(&self, _machine: &PhaseMachine) {}
}

/// Progress of a bootstrap: the machine status plus hooks no phase will run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootStatus {
    /// Hooked phases the machine does not define.
    pub dangling_hooks: Vec<String>,
    /// Names of registered components, in registration order.
    pub components: Vec<String>,
    /// Machine progress.
    #[serde(flatten)]
    pub status: PhaseStatus,
}

#[derive(Default)]
struct BootState {
    components: Vec<Arc<dyn Component>>,
    config: Map<String, Value>,
    started: bool,
}

/// Registered components, shared config, and the machine that starts them.
pub struct Bootstrap {
    machine: Arc<PhaseMachine>,
    state: Mutex<BootState>,
}

impl fmt::Debug for Bootstrap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Bootstrap")
            .field("machine", &self.machine.name())
            .field("components", &state.components.len())
            .field("started", &state.started)
            .finish_non_exhaustive()
    }
}

impl Bootstrap {
    /// Bootstrap driving `machine`.
    pub fn new(machine: PhaseMachine) -> Self {
        Self {
            machine: Arc::new(machine),
            state: Mutex::new(BootState::default()),
        }
    }

    /// Bootstrap over the standard lifecycle machine.
    pub fn lifecycle(name: impl Into<String>) -> Self {
        Self::new(PhaseMachine::lifecycle(name))
    }

    fn state(&self) -> MutexGuard<'_, BootState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The machine being driven.
    pub fn machine(&self) -> &Arc<PhaseMachine> {
        &self.machine
    }

    /// Add a component.
    ///
    /// # Errors
    ///
    /// [`NetError::Rejected`] if the name is taken or startup has begun.
    pub fn register_component(&self, component: Arc<dyn Component>) -> NetResult<()> {
        let mut state = self.state();
        if state.started {
            return Err(NetError::Rejected(format!(
                "cannot register '{}' after start",
                component.name()
            )));
        }
        if state.components.iter().any(|c| c.name() == component.name()) {
            return Err(NetError::Rejected(format!(
                "component '{}' already registered",
                component.name()
            )));
        }
        log::debug!("[Phase] {} registered component {}", self.machine.name(), component.name());
        state.components.push(component);
        Ok(())
    }

    /// Shallow-merge `patch` into the shared config and return the result.
    /// `None` just reads it.
    ///
    /// # Errors
    ///
    /// [`NetError::Rejected`] if `patch` is not a JSON object.
    pub fn global_config(&self, patch: Option<Value>) -> NetResult<Value> {
        let mut state = self.state();
        match patch {
            Some(Value::Object(fields)) => state.config.extend(fields),
            Some(other) => {
                return Err(NetError::Rejected(format!(
                    "global config must be an object, got {other}"
                )))
            }
            None => {}
        }
        Ok(Value::Object(state.config.clone()))
    }

    /// Hook a phase directly, outside any component.
    pub fn hook(&self, phase: &str, hook: PhaseHook) {
        self.machine.hook_phase(phase, hook);
    }

    /// Configure every component, collect their hooks, and run the machine.
    ///
    /// # Errors
    ///
    /// - [`NetError::Rejected`] if already started
    /// - [`NetError::HookFailed`] with phase `PRE_CONFIG` if a component
    ///   rejects the config
    /// - any error from running the machine
    pub async fn start(&self) -> NetResult<()> {
        let (components, config) = {
            let mut state = self.state();
            if state.started {
                return Err(NetError::Rejected(format!(
                    "{} already started",
                    self.machine.name()
                )));
            }
            state.started = true;
            (state.components.clone(), Value::Object(state.config.clone()))
        };

        for component in &components {
            if let Err(e) = component.pre_config(&config) {
                return Err(NetError::HookFailed {
                    machine: self.machine.name().to_string(),
                    phase: PRE_CONFIG.to_string(),
                    message: format!("{}: {e:#}", component.name()),
                });
            }
        }
        for component in &components {
            component.add_lifecycle_hooks(&self.machine);
        }

        let dangling = self.machine.dangling_hooks();
        if !dangling.is_empty() {
            log::warn!(
                "[Phase] {} hooks on unknown phases: {}",
                self.machine.name(),
                dangling.join(", ")
            );
        }

        log::info!(
            "[Phase] {} starting {} component(s)",
            self.machine.name(),
            components.len()
        );
        self.machine.run_all().await
    }

    /// Machine status, dangling hooks and component names.
    pub fn status(&self) -> BootStatus {
        BootStatus {
            dangling_hooks: self.machine.dangling_hooks(),
            components: self
                .state()
                .components
                .iter()
                .map(|c| c.name().to_string())
                .collect(),
            status: self.machine.status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    type Trace = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        name: &'static str,
        trace: Trace,
        phase: &'static str,
    }

    impl Component for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn pre_config(&self, config: &Value) -> anyhow::Result<()> {
            if config.get("refuse").and_then(Value::as_str) == Some(self.name) {
                anyhow::bail!("refused");
            }
            self.trace.lock().unwrap().push(format!("{}:config", self.name));
            Ok(())
        }

        fn add_lifecycle_hooks(&self, machine: &PhaseMachine) {
            self.trace.lock().unwrap().push(format!("{}:hooks", self.name));
            let trace = Arc::clone(&self.trace);
            let name = self.name;
            machine.hook_phase(
                self.phase,
                PhaseHook::from_fn(move |_, meta| {
                    trace.lock().unwrap().push(format!("{name}:{}", meta.phase));
                    Ok(())
                }),
            );
        }
    }

    fn recorder(name: &'static str, phase: &'static str, trace: &Trace) -> Arc<dyn Component> {
        Arc::new(Recorder {
            name,
            trace: Arc::clone(trace),
            phase,
        })
    }

    #[tokio::test]
    async fn test_start_configures_then_hooks_then_runs() {
        let boot = Bootstrap::lifecycle("APP");
        let trace: Trace = Arc::default();
        boot.register_component(recorder("net", "NET_CONNECT", &trace)).unwrap();
        boot.register_component(recorder("data", "LOAD_DATA", &trace)).unwrap();

        boot.start().await.unwrap();

        assert_eq!(
            *trace.lock().unwrap(),
            vec![
                "net:config",
                "data:config",
                "net:hooks",
                "data:hooks",
                "data:LOAD_DATA",
                "net:NET_CONNECT",
            ]
        );
        let status = boot.status();
        assert!(status.status.done);
        assert_eq!(status.components, vec!["net", "data"]);
    }

    #[tokio::test]
    async fn test_pre_config_failure_stops_start() {
        let boot = Bootstrap::lifecycle("APP");
        let trace: Trace = Arc::default();
        boot.register_component(recorder("net", "NET_CONNECT", &trace)).unwrap();
        boot.global_config(Some(json!({"refuse": "net"}))).unwrap();

        match boot.start().await {
            Err(NetError::HookFailed { phase, message, .. }) => {
                assert_eq!(phase, "PRE_CONFIG");
                assert!(message.starts_with("net:"), "{message}");
            }
            other => panic!("expected hook failure, got {other:?}"),
        }
        assert!(trace.lock().unwrap().is_empty());
        assert!(boot.status().status.completed_groups.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_and_late_registration_rejected() {
        let boot = Bootstrap::lifecycle("APP");
        let trace: Trace = Arc::default();
        boot.register_component(recorder("net", "NET_CONNECT", &trace)).unwrap();
        assert!(matches!(
            boot.register_component(recorder("net", "APP_RUN", &trace)),
            Err(NetError::Rejected(_))
        ));

        boot.start().await.unwrap();
        assert!(matches!(
            boot.register_component(recorder("late", "APP_RUN", &trace)),
            Err(NetError::Rejected(_))
        ));
        assert!(matches!(boot.start().await, Err(NetError::Rejected(_))));
    }

    #[test]
    fn test_global_config_merges_objects() {
        let boot = Bootstrap::lifecycle("APP");
        boot.global_config(Some(json!({"a": 1, "b": 2}))).unwrap();
        let merged = boot.global_config(Some(json!({"b": 3}))).unwrap();
        assert_eq!(merged, json!({"a": 1, "b": 3}));
        assert_eq!(boot.global_config(None).unwrap(), merged);
        assert!(boot.global_config(Some(json!([1]))).is_err());
    }

    #[test]
    fn test_status_reports_dangling_hooks() {
        let boot = Bootstrap::lifecycle("APP");
        boot.hook("DOM_READY", PhaseHook::from_fn(|_, _| Ok(())));
        let status = boot.status();
        assert_eq!(status.dangling_hooks, vec!["DOM_READY"]);

        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["dangling_hooks"], json!(["DOM_READY"]));
        assert_eq!(value["done"], json!(false));
    }
}
