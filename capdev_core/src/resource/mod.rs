//! Resources served by the device and the tree they are registered in.

mod simple;
mod site;
mod time;

pub use simple::{SimpleResource, DEFAULT_CONTENT};
pub use site::{Site, WELL_KNOWN_CORE};
pub use time::{TimeResource, TIME_FORMAT};

use crate::coap::{Code, ContentFormat};
use crate::observe::ObservationEvent;
use crate::token::Action;
use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

/// A transport-independent request as seen by a resource handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Action,
    pub path: Vec<String>,
    /// Envelope followed by the application payload
    pub body: Vec<u8>,
    pub correlation_id: Uuid,
}

impl Request {
    pub fn new(method: Action, path: Vec<String>, body: Vec<u8>) -> Self {
        Self {
            method,
            path,
            body,
            correlation_id: Uuid::new_v4(),
        }
    }

    pub fn path_string(&self) -> String {
        self.path.join("/")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: Code,
    pub payload: Vec<u8>,
    pub content_format: Option<ContentFormat>,
}

impl Response {
    pub fn new(code: Code) -> Self {
        Self {
            code,
            payload: Vec::new(),
            content_format: None,
        }
    }

    pub fn content(payload: Vec<u8>) -> Self {
        Self {
            code: Code::CONTENT,
            payload,
            content_format: Some(ContentFormat::TextPlain),
        }
    }

    pub fn changed(payload: Vec<u8>) -> Self {
        Self {
            code: Code::CHANGED,
            payload,
            content_format: Some(ContentFormat::TextPlain),
        }
    }

    pub fn unauthorized() -> Self {
        Self::new(Code::UNAUTHORIZED)
    }

    pub fn not_found() -> Self {
        Self::new(Code::NOT_FOUND)
    }

    pub fn method_not_allowed() -> Self {
        Self::new(Code::METHOD_NOT_ALLOWED)
    }

    pub fn is_success(&self) -> bool {
        self.code.is_success()
    }
}

/// Business logic behind one path of the resource tree
#[async_trait]
pub trait Resource: Send + Sync {
    async fn render_get(&self, _request: &Request) -> Response {
        Response::method_not_allowed()
    }

    async fn render_put(&self, _request: &Request) -> Response {
        Response::method_not_allowed()
    }

    async fn render_post(&self, _request: &Request) -> Response {
        Response::method_not_allowed()
    }

    async fn render_delete(&self, _request: &Request) -> Response {
        Response::method_not_allowed()
    }

    async fn render(&self, request: &Request) -> Response {
        match request.method {
            Action::Get => self.render_get(request).await,
            Action::Put => self.render_put(request).await,
            Action::Post => self.render_post(request).await,
            Action::Delete => self.render_delete(request).await,
        }
    }

    fn is_observable(&self) -> bool {
        false
    }

    /// Called by the transport whenever the observer count changes
    fn update_observation_count(&self, _count: usize) {}

    /// Ticks after which observers should be sent a fresh representation
    fn observations(&self) -> Option<broadcast::Receiver<ObservationEvent>> {
        None
    }
}
