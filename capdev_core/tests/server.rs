use async_trait::async_trait;
use capdev_core::coap::option::{self, OBSERVE_DEREGISTER, OBSERVE_REGISTER};
use capdev_core::coap::{CoapOption, Code, Message, MessageType};
use capdev_core::observe::ObservationPhase;
use capdev_core::server::{ClientError, MAX_DATAGRAM_SIZE};
use capdev_core::validator::Result as ValidatorResult;
use capdev_core::{
    Action, AuthorizationGate, Client, Envelope, Framing, ResourceServer, ServerConfig,
    SimpleResource, Site, TimeResource, TokenValidator, ValidationResult,
};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use futures::future::join_all;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_test::{assert_err, assert_ok};

const OBSERVE_INTERVAL: Duration = Duration::from_millis(100);

/// Validator whose answer can be flipped while the server runs
#[derive(Debug, Clone)]
struct SwitchValidator {
    allow: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
}

impl SwitchValidator {
    fn new(allow: bool) -> Self {
        Self {
            allow: Arc::new(AtomicBool::new(allow)),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn set(&self, allow: bool) {
        self.allow.store(allow, Ordering::SeqCst);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenValidator for SwitchValidator {
    async fn validate(&self, _envelope: &Envelope) -> ValidatorResult<ValidationResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ValidationResult {
            authorized: self.allow.load(Ordering::SeqCst),
        })
    }
}

struct TestServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<io::Result<()>>,
}

impl TestServer {
    async fn start(site: Site) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("capdev_core=debug")
            .with_test_writer()
            .try_init();

        let server = ResourceServer::bind("127.0.0.1:0".parse().unwrap(), site)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let (shutdown, stop) = oneshot::channel::<()>();
        let task = tokio::spawn(server.run(async {
            let _ = stop.await;
        }));

        Self {
            addr,
            shutdown: Some(shutdown),
            task,
        }
    }

    async fn client(&self) -> Client {
        Client::connect(self.addr)
            .await
            .unwrap()
            .with_timeout(Duration::from_secs(2))
    }

    async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        assert_ok!(self.task.await.unwrap());
    }
}

fn site(validator: &SwitchValidator) -> Site {
    site_with_framing(validator, Framing::Delimited)
}

fn site_with_framing(validator: &SwitchValidator, framing: Framing) -> Site {
    let gate = AuthorizationGate::new(Arc::new(validator.clone())).with_framing(framing);
    let mut site = Site::new();
    site.add_resource(
        &["time"],
        Arc::new(TimeResource::new("time", gate.clone(), OBSERVE_INTERVAL)),
    );
    site.add_resource(&["resource"], Arc::new(SimpleResource::new("resource", gate)));
    site
}

/// Read and discard messages until the line has been quiet for `quiet`
async fn drain(client: &Client, quiet: Duration) {
    loop {
        if tokio::time::timeout(quiet, client.receive()).await.is_err() {
            return;
        }
    }
}

/// Send the same Observe flag for every `(client, token)` at once
async fn observe_each(clients: &mut [(Client, Vec<u8>)], flag: u32) {
    let responses = join_all(clients.iter_mut().map(|(client, token)| {
        client.request(
            Action::Get,
            "time",
            br#"{"AC":"GET"}"#.to_vec(),
            Some(flag),
            token.clone(),
        )
    }))
    .await;
    for response in responses {
        assert_eq!(response.unwrap().code, Code::CONTENT);
    }
}

/// Nothing arrives for several observe intervals
async fn assert_silent(client: &Client) {
    let quiet = tokio::time::timeout(OBSERVE_INTERVAL * 5, client.receive()).await;
    assert!(quiet.is_err(), "unexpected message: {:?}", quiet);
}

#[tokio::test]
async fn get_returns_stored_content_not_request_payload() {
    let validator = SwitchValidator::new(true);
    let server = TestServer::start(site(&validator)).await;
    let mut client = server.client().await;

    let response = client
        .get("resource", br#"{"AC":"GET"}hello"#.to_vec())
        .await
        .unwrap();

    assert_eq!(response.message_type, MessageType::Acknowledgement);
    assert_eq!(response.code, Code::CONTENT);
    assert_eq!(response.payload, b"this is an important string\n");
    server.stop().await;
}

#[tokio::test]
async fn put_then_get_returns_payload_with_newline() {
    let validator = SwitchValidator::new(true);
    let server = TestServer::start(site(&validator)).await;
    let mut client = server.client().await;

    let response = client
        .put("resource", br#"{"AC":"PUT"}newvalue"#.to_vec())
        .await
        .unwrap();
    assert_eq!(response.code, Code::CHANGED);
    assert_eq!(response.payload, b"newvalue\n");

    let response = client
        .get("resource", br#"{"AC":"GET"}"#.to_vec())
        .await
        .unwrap();
    assert_eq!(response.code, Code::CONTENT);
    assert_eq!(response.payload, b"newvalue\n");
    server.stop().await;
}

#[tokio::test]
async fn rejections_are_unauthorized() {
    let validator = SwitchValidator::new(false);
    let server = TestServer::start(site(&validator)).await;
    let mut client = server.client().await;

    let response = client
        .put("resource", br#"{"AC":"PUT"}evil"#.to_vec())
        .await
        .unwrap();
    assert_eq!(response.code, Code::UNAUTHORIZED);
    assert!(response.payload.is_empty());
    assert_eq!(validator.calls(), 1);

    // Unparseable envelope never reaches the validator
    validator.set(true);
    let response = client
        .put("resource", b"no envelope here".to_vec())
        .await
        .unwrap();
    assert_eq!(response.code, Code::UNAUTHORIZED);

    // GET token used for PUT
    let response = client
        .put("resource", br#"{"AC":"GET"}evil"#.to_vec())
        .await
        .unwrap();
    assert_eq!(response.code, Code::UNAUTHORIZED);
    assert_eq!(validator.calls(), 1);

    let response = client
        .get("resource", br#"{"AC":"GET"}"#.to_vec())
        .await
        .unwrap();
    assert_eq!(response.payload, b"this is an important string\n");
    server.stop().await;
}

#[tokio::test]
async fn transport_errors() {
    let validator = SwitchValidator::new(true);
    let server = TestServer::start(site(&validator)).await;
    let mut client = server.client().await;

    let response = client
        .get("missing", br#"{"AC":"GET"}"#.to_vec())
        .await
        .unwrap();
    assert_eq!(response.code, Code::NOT_FOUND);

    let response = client
        .request(
            Action::Delete,
            "resource",
            br#"{"AC":"DELETE"}"#.to_vec(),
            None,
            Client::new_token(),
        )
        .await
        .unwrap();
    assert_eq!(response.code, Code::METHOD_NOT_ALLOWED);

    let response = client
        .get(".well-known/core", Vec::new())
        .await
        .unwrap();
    assert_eq!(response.code, Code::CONTENT);
    assert_eq!(
        String::from_utf8(response.payload).unwrap(),
        "</.well-known/core>;ct=40,</resource>,</time>;obs"
    );
    assert_eq!(validator.calls(), 0);

    // Unrecognized critical option
    let mut request = Message::new(MessageType::Confirmable, Code::GET, 0x0101)
        .with_token(vec![1, 2, 3]);
    request.set_uri_path("resource");
    request.add_option(CoapOption::new(9, b"x".to_vec()));
    client.send_raw(&request.encode().unwrap()).await.unwrap();
    let response = client.receive().await.unwrap();
    assert_eq!(response.message_id, 0x0101);
    assert_eq!(response.code, Code::BAD_OPTION);

    // Payload marker without payload
    client
        .send_raw(&[0x40, 0x01, 0x12, 0x34, 0xff])
        .await
        .unwrap();
    let reset = client.receive().await.unwrap();
    assert_eq!(reset.message_type, MessageType::Reset);
    assert_eq!(reset.message_id, 0x1234);

    // Garbage that is not even a header is dropped silently
    client.send_raw(&[0x40]).await.unwrap();
    assert_silent(&client).await;
    server.stop().await;
}

#[tokio::test]
async fn non_confirmable_request_gets_non_response() {
    let validator = SwitchValidator::new(true);
    let server = TestServer::start(site(&validator)).await;
    let client = server.client().await;

    let mut request = Message::new(MessageType::NonConfirmable, Code::GET, 0x0202)
        .with_token(vec![9])
        .with_payload(br#"{"AC":"GET"}"#.to_vec());
    request.set_uri_path("resource");
    client.send_raw(&request.encode().unwrap()).await.unwrap();

    let response = client.receive().await.unwrap();
    assert_eq!(response.message_type, MessageType::NonConfirmable);
    assert_eq!(response.token, vec![9]);
    assert_eq!(response.code, Code::CONTENT);
    server.stop().await;
}

#[tokio::test]
async fn length_prefixed_framing() {
    let validator = SwitchValidator::new(true);
    let server = TestServer::start(site_with_framing(&validator, Framing::LengthPrefixed)).await;
    let mut client = server.client().await;

    let envelope = br#"{"AC":"PUT","meta":{"nested":true}}"#;
    let body = Framing::LengthPrefixed.join(envelope, b"value").unwrap();
    let response = client.put("resource", body).await.unwrap();
    assert_eq!(response.code, Code::CHANGED);
    assert_eq!(response.payload, b"value\n");

    // Delimited body on a length-prefixed server
    let response = client
        .put("resource", br#"{"AC":"PUT"}value"#.to_vec())
        .await
        .unwrap();
    assert_eq!(response.code, Code::UNAUTHORIZED);
    server.stop().await;
}

#[tokio::test]
async fn observe_register_notify_deregister() {
    let validator = SwitchValidator::new(true);
    let server = TestServer::start(site(&validator)).await;
    let mut client = server.client().await;
    let token = Client::new_token();
    let body = br#"{"AC":"GET"}"#.to_vec();

    let response = client
        .request(Action::Get, "time", body.clone(), Some(OBSERVE_REGISTER), token.clone())
        .await
        .unwrap();
    assert_eq!(response.code, Code::CONTENT);
    assert_eq!(response.observe(), Some(0));

    let first = client.next_notification(&token).await.unwrap();
    let second = client.next_notification(&token).await.unwrap();
    assert_eq!(first.message_type, MessageType::NonConfirmable);
    assert_eq!(first.code, Code::CONTENT);
    assert!(first.payload.ends_with(b"\n"));
    assert!(second.observe().unwrap() > first.observe().unwrap());

    let response = client
        .request(Action::Get, "time", body, Some(OBSERVE_DEREGISTER), token)
        .await
        .unwrap();
    assert_eq!(response.code, Code::CONTENT);
    assert_eq!(response.observe(), None);

    drain(&client, OBSERVE_INTERVAL / 2).await;
    assert_silent(&client).await;
    server.stop().await;
}

#[tokio::test]
async fn reset_ends_observation() {
    let validator = SwitchValidator::new(true);
    let server = TestServer::start(site(&validator)).await;
    let mut client = server.client().await;
    let token = Client::new_token();

    client
        .request(
            Action::Get,
            "time",
            br#"{"AC":"GET"}"#.to_vec(),
            Some(OBSERVE_REGISTER),
            token.clone(),
        )
        .await
        .unwrap();

    let notification = client.next_notification(&token).await.unwrap();
    client.reset(notification.message_id).await.unwrap();

    drain(&client, OBSERVE_INTERVAL / 2).await;
    assert_silent(&client).await;
    server.stop().await;
}

#[tokio::test]
async fn unauthorized_observer_is_not_registered() {
    let validator = SwitchValidator::new(false);
    let server = TestServer::start(site(&validator)).await;
    let mut client = server.client().await;
    let token = Client::new_token();

    let response = client
        .request(
            Action::Get,
            "time",
            br#"{"AC":"GET"}"#.to_vec(),
            Some(OBSERVE_REGISTER),
            token.clone(),
        )
        .await
        .unwrap();
    assert_eq!(response.code, Code::UNAUTHORIZED);
    assert_eq!(response.observe(), None);

    assert_silent(&client).await;
    assert_eq!(validator.calls(), 1);
    server.stop().await;
}

#[tokio::test]
async fn revoked_observer_gets_error_and_is_dropped() {
    let validator = SwitchValidator::new(true);
    let server = TestServer::start(site(&validator)).await;
    let mut client = server.client().await;
    let token = Client::new_token();

    client
        .request(
            Action::Get,
            "time",
            br#"{"AC":"GET"}"#.to_vec(),
            Some(OBSERVE_REGISTER),
            token.clone(),
        )
        .await
        .unwrap();
    assert_eq!(client.next_notification(&token).await.unwrap().code, Code::CONTENT);

    validator.set(false);
    let last = loop {
        let notification = client.next_notification(&token).await.unwrap();
        if notification.code != Code::CONTENT {
            break notification;
        }
    };
    assert_eq!(last.code, Code::UNAUTHORIZED);
    assert_eq!(last.observe(), None);

    assert_silent(&client).await;
    server.stop().await;
}

#[tokio::test]
async fn client_times_out_without_server() {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = socket.local_addr().unwrap();

    let mut client = Client::connect(addr)
        .await
        .unwrap()
        .with_timeout(Duration::from_millis(100));
    let result = client.get("resource", br#"{"AC":"GET"}"#.to_vec()).await;
    assert!(matches!(assert_err!(result), ClientError::Timeout(_)));
}

#[tokio::test]
async fn device_site_from_config() {
    let validator = SwitchValidator::new(true);
    let config = ServerConfig {
        initial_content: "configured\n".to_string(),
        ..ServerConfig::default()
    };
    let gate = AuthorizationGate::new(Arc::new(validator.clone()));
    let server = TestServer::start(Site::device(&config, gate)).await;
    let mut client = server.client().await;

    let response = client
        .get("resource", br#"{"AC":"GET"}"#.to_vec())
        .await
        .unwrap();
    assert_eq!(response.payload, b"configured\n");
    server.stop().await;
}

#[tokio::test]
async fn oversized_request_is_rejected_and_never_stored() {
    let validator = SwitchValidator::new(true);
    let server = TestServer::start(site(&validator)).await;
    let mut client = server.client().await;

    let mut body = br#"{"AC":"PUT"}"#.to_vec();
    body.extend(std::iter::repeat(b'x').take(2000));
    let response = client.put("resource", body).await.unwrap();
    assert_eq!(response.message_type, MessageType::Acknowledgement);
    assert_eq!(response.code, Code::REQUEST_ENTITY_TOO_LARGE);
    let size1 = response
        .options
        .iter()
        .find(|o| o.number == option::SIZE1)
        .and_then(CoapOption::as_uint);
    assert_eq!(size1, Some(MAX_DATAGRAM_SIZE as u32));
    assert_eq!(validator.calls(), 0);

    let response = client
        .get("resource", br#"{"AC":"GET"}"#.to_vec())
        .await
        .unwrap();
    assert_eq!(response.payload, b"this is an important string\n");

    // A body that fits is stored whole
    let mut body = br#"{"AC":"PUT"}"#.to_vec();
    body.extend(std::iter::repeat(b'x').take(500));
    let response = client.put("resource", body).await.unwrap();
    assert_eq!(response.code, Code::CHANGED);
    assert_eq!(response.payload.len(), 501);

    // Oversized confirmable datagram that does not parse (token length 15)
    let mut garbage = vec![0x4f, 0x03, 0x56, 0x78];
    garbage.resize(2000, 0xaa);
    client.send_raw(&garbage).await.unwrap();
    let reset = client.receive().await.unwrap();
    assert_eq!(reset.message_type, MessageType::Reset);
    assert_eq!(reset.message_id, 0x5678);
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scheduler_follows_concurrent_observers() {
    let validator = SwitchValidator::new(true);
    let gate = AuthorizationGate::new(Arc::new(validator.clone()));
    let time = Arc::new(TimeResource::new("time", gate, OBSERVE_INTERVAL));
    let mut site = Site::new();
    site.add_resource(&["time"], time.clone());
    let server = TestServer::start(site).await;

    let mut clients = Vec::new();
    for _ in 0..8 {
        clients.push((server.client().await, Client::new_token()));
    }

    for _ in 0..5 {
        observe_each(&mut clients, OBSERVE_REGISTER).await;
        assert_eq!(time.scheduler().phase(), ObservationPhase::Active);

        // Half leave while the other half refresh, then swap
        let (first, second) = clients.split_at_mut(4);
        tokio::join!(
            observe_each(first, OBSERVE_DEREGISTER),
            observe_each(second, OBSERVE_REGISTER)
        );
        assert_eq!(time.scheduler().phase(), ObservationPhase::Active);
        tokio::join!(
            observe_each(first, OBSERVE_REGISTER),
            observe_each(second, OBSERVE_DEREGISTER)
        );
        assert_eq!(time.scheduler().phase(), ObservationPhase::Active);

        observe_each(&mut clients, OBSERVE_DEREGISTER).await;
        assert_eq!(time.scheduler().phase(), ObservationPhase::Idle);
    }

    // RST on a notification is the last observer leaving
    let (client, token) = &mut clients[0];
    client
        .request(
            Action::Get,
            "time",
            br#"{"AC":"GET"}"#.to_vec(),
            Some(OBSERVE_REGISTER),
            token.clone(),
        )
        .await
        .unwrap();
    let notification = client.next_notification(token).await.unwrap();
    client.reset(notification.message_id).await.unwrap();
    let idle = tokio::time::timeout(Duration::from_secs(2), async {
        while time.scheduler().phase() != ObservationPhase::Idle {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert_ok!(idle);
    server.stop().await;
}
