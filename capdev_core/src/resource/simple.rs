use super::{Request, Resource, Response};
use crate::gate::AuthorizationGate;
use crate::token::Action;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::info;

pub const DEFAULT_CONTENT: &[u8] = b"this is an important string\n";

/// Stored content readable with GET and replaceable with PUT
#[derive(Debug)]
pub struct SimpleResource {
    path: String,
    gate: AuthorizationGate,
    content: RwLock<Vec<u8>>,
}

impl SimpleResource {
    pub fn new(path: impl Into<String>, gate: AuthorizationGate) -> Self {
        Self::with_content(path, gate, DEFAULT_CONTENT.to_vec())
    }

    pub fn with_content(path: impl Into<String>, gate: AuthorizationGate, content: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            gate,
            content: RwLock::new(content),
        }
    }

    pub async fn content(&self) -> Vec<u8> {
        self.content.read().await.clone()
    }
}

#[async_trait]
impl Resource for SimpleResource {
    async fn render_get(&self, request: &Request) -> Response {
        info!(correlation_id = %request.correlation_id, "GET {}", self.path);

        match self
            .gate
            .authorize_for(&request.body, Action::Get, &self.path)
            .await
        {
            Ok(_) => Response::content(self.content().await),
            Err(_) => Response::unauthorized(),
        }
    }

    async fn render_put(&self, request: &Request) -> Response {
        info!(correlation_id = %request.correlation_id, "PUT {}", self.path);

        let payload = match self
            .gate
            .authorize_for(&request.body, Action::Put, &self.path)
            .await
        {
            Ok(payload) => payload,
            Err(_) => return Response::unauthorized(),
        };

        // Line-oriented clients expect a trailing newline
        let mut content = Vec::with_capacity(payload.len() + 1);
        content.extend_from_slice(payload);
        content.push(b'\n');

        *self.content.write().await = content.clone();
        Response::changed(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coap::Code;
    use crate::validator::mock::MockValidator;
    use std::sync::Arc;

    fn simple_resource(validator: &MockValidator) -> SimpleResource {
        SimpleResource::new(
            "resource",
            AuthorizationGate::new(Arc::new(validator.clone())),
        )
    }

    fn request(method: Action, body: &[u8]) -> Request {
        Request::new(method, vec!["resource".to_string()], body.to_vec())
    }

    #[tokio::test]
    async fn test_get_returns_stored_content_not_payload() {
        let resource = simple_resource(&MockValidator::allowing());

        let response = resource
            .render(&request(Action::Get, br#"{"AC":"GET"}hello"#))
            .await;
        assert_eq!(response.code, Code::CONTENT);
        assert_eq!(response.payload, DEFAULT_CONTENT);
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let resource = simple_resource(&MockValidator::allowing());

        let response = resource
            .render(&request(Action::Put, br#"{"AC":"PUT"}newvalue"#))
            .await;
        assert_eq!(response.code, Code::CHANGED);
        assert_eq!(response.payload, b"newvalue\n");

        let response = resource
            .render(&request(Action::Get, br#"{"AC":"GET"}"#))
            .await;
        assert_eq!(response.code, Code::CONTENT);
        assert_eq!(response.payload, b"newvalue\n");
    }

    #[tokio::test]
    async fn test_rejected_put_leaves_content() {
        let validator = MockValidator::denying();
        let resource = simple_resource(&validator);

        let response = resource
            .render(&request(Action::Put, br#"{"AC":"PUT"}evil"#))
            .await;
        assert_eq!(response.code, Code::UNAUTHORIZED);
        assert!(response.payload.is_empty());
        assert_eq!(resource.content().await, DEFAULT_CONTENT);

        // GET token used for a PUT
        let allowing = simple_resource(&MockValidator::allowing());
        let response = allowing
            .render(&request(Action::Put, br#"{"AC":"GET"}evil"#))
            .await;
        assert_eq!(response.code, Code::UNAUTHORIZED);
        assert_eq!(allowing.content().await, DEFAULT_CONTENT);
    }

    #[tokio::test]
    async fn test_unsupported_methods() {
        let validator = MockValidator::allowing();
        let resource = simple_resource(&validator);

        let response = resource
            .render(&request(Action::Delete, br#"{"AC":"DELETE"}"#))
            .await;
        assert_eq!(response.code, Code::METHOD_NOT_ALLOWED);
        assert_eq!(validator.calls(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_puts_last_write_wins_whole() {
        let resource = Arc::new(simple_resource(&MockValidator::allowing()));

        let writers: Vec<_> = (0..8)
            .map(|i| {
                let resource = Arc::clone(&resource);
                tokio::spawn(async move {
                    let body = format!("{{\"AC\":\"PUT\"}}value-{}", i);
                    resource.render(&request(Action::Put, body.as_bytes())).await
                })
            })
            .collect();
        for writer in writers {
            assert_eq!(writer.await.unwrap().code, Code::CHANGED);
        }

        let content = String::from_utf8(resource.content().await).unwrap();
        assert!(content.starts_with("value-"));
        assert!(content.ends_with('\n'));
        assert_eq!(content.matches('\n').count(), 1);
    }
}
