use super::{Request, Resource, Response};
use crate::gate::AuthorizationGate;
use crate::observe::{ObservationEvent, ObservationScheduler};
use crate::token::Action;
use async_trait::async_trait;
use chrono::Local;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

/// Minute-precision local time, newline terminated
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M\n";

/// Observable clock. Pushes the current time to observers on every
/// scheduler tick.
#[derive(Debug)]
pub struct TimeResource {
    path: String,
    gate: AuthorizationGate,
    scheduler: ObservationScheduler,
}

impl TimeResource {
    pub fn new(path: impl Into<String>, gate: AuthorizationGate, interval: Duration) -> Self {
        let path = path.into();
        Self {
            scheduler: ObservationScheduler::new(path.clone(), interval),
            path,
            gate,
        }
    }

    pub fn scheduler(&self) -> &ObservationScheduler {
        &self.scheduler
    }
}

#[async_trait]
impl Resource for TimeResource {
    async fn render_get(&self, request: &Request) -> Response {
        info!(correlation_id = %request.correlation_id, "GET {}", self.path);

        match self
            .gate
            .authorize_for(&request.body, Action::Get, &self.path)
            .await
        {
            Ok(_) => Response::content(Local::now().format(TIME_FORMAT).to_string().into_bytes()),
            Err(_) => Response::unauthorized(),
        }
    }

    fn is_observable(&self) -> bool {
        true
    }

    fn update_observation_count(&self, count: usize) {
        self.scheduler.update_observation_count(count);
    }

    fn observations(&self) -> Option<broadcast::Receiver<ObservationEvent>> {
        Some(self.scheduler.subscribe())
    }
}
