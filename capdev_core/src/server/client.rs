use crate::coap::{option, CoapOption, CodecError, Message, MessageType};
use crate::token::Action;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::debug;
use uuid::Uuid;

use super::RECV_BUFFER_SIZE;

pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("No response within {0:?}")]
    Timeout(Duration),

    #[error("Server reset the exchange")]
    Reset,
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Minimal CoAP client talking to one server. Used by the CLI and tests.
#[derive(Debug)]
pub struct Client {
    socket: UdpSocket,
    server: SocketAddr,
    timeout: Duration,
    next_message_id: u16,
}

impl Client {
    pub async fn connect(server: SocketAddr) -> Result<Self> {
        let local: SocketAddr = if server.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(server).await?;

        Ok(Self {
            socket,
            server,
            timeout: DEFAULT_CLIENT_TIMEOUT,
            next_message_id: (Uuid::new_v4().as_u128() & 0xffff) as u16,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    fn message_id(&mut self) -> u16 {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        id
    }

    /// Fresh 4-byte token
    pub fn new_token() -> Vec<u8> {
        Uuid::new_v4().as_bytes()[..4].to_vec()
    }

    /// Send a confirmable request and wait for its piggy-backed response
    pub async fn request(
        &mut self,
        method: Action,
        path: &str,
        body: Vec<u8>,
        observe: Option<u32>,
        token: Vec<u8>,
    ) -> Result<Message> {
        let message_id = self.message_id();
        let mut request = Message::new(MessageType::Confirmable, method.into(), message_id)
            .with_token(token.clone())
            .with_payload(body);
        if let Some(flag) = observe {
            request.add_option(CoapOption::uint(option::OBSERVE, flag));
        }
        request.set_uri_path(path);

        debug!("Sending {} /{} (mid {})", method, path, message_id);
        self.socket.send(&request.encode()?).await?;

        loop {
            let message = self.receive().await?;
            match message.message_type {
                MessageType::Reset if message.message_id == message_id => {
                    return Err(ClientError::Reset)
                }
                MessageType::Acknowledgement
                    if message.message_id == message_id && message.token == token =>
                {
                    return Ok(message)
                }
                _ => debug!("Ignoring unrelated message {}", message.message_id),
            }
        }
    }

    pub async fn get(&mut self, path: &str, body: Vec<u8>) -> Result<Message> {
        self.request(Action::Get, path, body, None, Self::new_token())
            .await
    }

    pub async fn put(&mut self, path: &str, body: Vec<u8>) -> Result<Message> {
        self.request(Action::Put, path, body, None, Self::new_token())
            .await
    }

    /// Wait for the next notification carrying `token`
    pub async fn next_notification(&mut self, token: &[u8]) -> Result<Message> {
        loop {
            let message = self.receive().await?;
            if message.token == token && message.message_type != MessageType::Acknowledgement {
                return Ok(message);
            }
        }
    }

    /// Reject a notification, ending the observation on the server
    pub async fn reset(&self, message_id: u16) -> Result<()> {
        self.socket
            .send(&Message::reset(message_id).encode()?)
            .await?;
        Ok(())
    }

    /// Send raw bytes, for exercising the server with malformed input
    pub async fn send_raw(&self, bytes: &[u8]) -> Result<()> {
        self.socket.send(bytes).await?;
        Ok(())
    }

    pub async fn receive(&self) -> Result<Message> {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let len = timeout(self.timeout, self.socket.recv(&mut buf))
            .await
            .map_err(|_| ClientError::Timeout(self.timeout))??;
        Ok(Message::decode(&buf[..len])?)
    }
}
