use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::warn;

/// Health reporting for the polling loops of the service.
///
/// The pipeline is made of many independently ticking loops, one per
/// (stage, dataset) or (stage, dataset, sink) key, and the process can only
/// be trusted with data if all of them keep ticking.
///
/// HealthRegistry allows an arbitrary number of components to be registered
/// and report their health. The process' health status is the combination
/// of these individual health status:
///   - if any component is unhealthy, the process is unhealthy
///   - if all components recently reported healthy, the process is healthy
///   - if a component failed to report healthy for its defined deadline,
///     it is considered stalled, and the check fails.
#[derive(Default, Debug)]
pub struct HealthStatus {
    /// The overall status: true if all components are healthy
    pub healthy: bool,
    /// Current status of each registered component, for display
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    /// Computes the axum status code based on the overall health status,
    /// and prints each component status in the body for debugging.
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Automatically set when a component is newly registered
    Starting,
    /// Recently reported healthy, will need to report again before the deadline
    HealthyUntil(Instant),
    /// Reported unhealthy
    Unhealthy,
    /// Set by `get_status` when the HealthyUntil deadline is reached
    Stalled,
}

type Components = Arc<RwLock<HashMap<String, ComponentStatus>>>;

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Components,
}

impl HealthHandle {
    /// Report healthy. Must be called more frequently than the configured deadline.
    pub fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(Instant::now() + self.deadline))
    }

    pub fn report_status(&self, status: ComponentStatus) {
        match self.components.write() {
            Ok(mut map) => {
                map.insert(self.component.clone(), status);
            }
            // Poisoned lock: liveness checks will fail and the process restart
            Err(_) => warn!(component = %self.component, "poisoned HealthRegistry lock"),
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Components,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Default::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers a new component in the registry. The returned handle should be passed
    /// to the component, to allow it to frequently report its health status.
    pub fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            components: self.components.clone(),
        };
        handle.report_status(ComponentStatus::Starting);
        handle
    }

    /// Returns the overall process status, computed from the status of all the components
    /// currently registered. Can be used as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let Ok(components) = self.components.read() else {
            warn!(registry = %self.name, "poisoned HealthRegistry lock");
            return HealthStatus::default();
        };

        let now = Instant::now();
        // unhealthy if no component has registered yet
        let mut result = HealthStatus {
            healthy: !components.is_empty(),
            components: HashMap::with_capacity(components.len()),
        };

        for (name, status) in components.iter() {
            let status = match status {
                ComponentStatus::HealthyUntil(until) if *until > now => *status,
                ComponentStatus::HealthyUntil(_) => ComponentStatus::Stalled,
                other => *other,
            };
            if !matches!(status, ComponentStatus::HealthyUntil(_)) {
                result.healthy = false;
            }
            result.components.insert(name.clone(), status);
        }

        result
    }
}
