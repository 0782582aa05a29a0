use std::collections::BTreeMap;
use std::ops::Add;
use std::sync::{Arc, PoisonError, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::{Duration, OffsetDateTime};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Liveness reporting for the long-running loops of a queue consumer.
///
/// Every consumer loop polls its queue forever, and a loop that hangs on a
/// stuck connection looks exactly like a loop waiting on an empty queue. To tell
/// them apart each loop registers itself as a component and promises to report
/// again before its deadline. The process status combines all components:
///   - no component registered yet: unhealthy
///   - any component unhealthy or past its deadline: unhealthy
///   - every component reported recently: healthy
///
/// Components leave the registry when their `HealthHandle` is dropped, so a
/// consumer that exits on shutdown does not linger as stalled.

#[derive(Default, Debug)]
pub struct HealthStatus {
    /// True when every registered component is healthy.
    pub healthy: bool,
    /// Per-component status, for display.
    pub components: BTreeMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    /// 200 when healthy, 500 otherwise. The body lists every component.
    fn into_response(self) -> Response {
        let body = format!("{:?}", self);
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Registered, but has not reported yet.
    Starting,
    /// Reported healthy, must report again before this instant.
    HealthyUntil(OffsetDateTime),
    /// Reported unhealthy.
    Unhealthy,
    /// Missed its reporting deadline.
    Stalled,
}

enum HealthMessage {
    Report {
        component: String,
        status: ComponentStatus,
    },
    Remove {
        component: String,
    },
}

/// Handle given to a component so it can report its own status.
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthHandle {
    pub fn component(&self) -> &str {
        &self.component
    }

    /// Report healthy until now + deadline. Returns once the report is queued.
    pub async fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            OffsetDateTime::now_utc().add(self.deadline),
        ))
        .await
    }

    pub async fn report_status(&self, status: ComponentStatus) {
        let message = HealthMessage::Report {
            component: self.component.clone(),
            status,
        };
        if let Err(err) = self.sender.send(message).await {
            warn!("failed to report health status: {}", err)
        }
    }
}

impl Drop for HealthHandle {
    fn drop(&mut self) {
        let message = HealthMessage::Remove {
            component: std::mem::take(&mut self.component),
        };
        if self.sender.try_send(message).is_err() {
            debug!("health registry unavailable, component not removed");
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<BTreeMap<String, ComponentStatus>>>,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthRegistry {
    /// Create a registry. Must be called from within a tokio runtime, the
    /// registry applies reports on a background task.
    pub fn new(name: &str) -> Self {
        let (tx, mut rx) = mpsc::channel::<HealthMessage>(64);
        let registry = Self {
            name: name.to_owned(),
            components: Default::default(),
            sender: tx,
        };

        let components = registry.components.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let mut map = components.write().unwrap_or_else(PoisonError::into_inner);
                match message {
                    HealthMessage::Report { component, status } => {
                        _ = map.insert(component, status);
                    }
                    HealthMessage::Remove { component } => {
                        _ = map.remove(&component);
                    }
                }
            }
        });

        registry
    }

    /// Register a component that must report at least every `deadline`.
    pub async fn register(&self, component: impl Into<String>, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component: component.into(),
            deadline,
            sender: self.sender.clone(),
        };
        handle.report_status(ComponentStatus::Starting).await;
        handle
    }

    /// Compute the process status from every registered component. Usable as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let components = self
            .components
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let now = OffsetDateTime::now_utc();

        let mut result = HealthStatus {
            healthy: !components.is_empty(),
            components: BTreeMap::new(),
        };

        for (name, status) in components.iter() {
            let status = match status {
                ComponentStatus::HealthyUntil(until) if *until > now => status.clone(),
                ComponentStatus::HealthyUntil(_) => ComponentStatus::Stalled,
                other => other.clone(),
            };
            if !matches!(status, ComponentStatus::HealthyUntil(_)) {
                result.healthy = false;
            }
            _ = result.components.insert(name.clone(), status);
        }

        match result.healthy {
            true => info!("{} health check ok", self.name),
            false => warn!("{} health check failed: {:?}", self.name, result.components),
        }
        result
    }
}
