//! Communications with the tunnel service.
//!
//! One connection carries both request/response traffic and, after
//! `subscribe`, the live event stream. A background task reads every frame:
//! responses are routed to the waiting caller by request id and events are
//! forwarded to the [`EventStream`] handed out by [`ServiceClient::connect`].

use log::{debug, error, warn};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tunnel_ipc::transport::{connect, receive_message, send_message};
use tunnel_ipc::{
    CreateTunnelRequest, IpcError, Request, RequestEnvelope, RequestId, ResponseBody,
    ServiceError, ServiceEvent, ServiceMessage, TunnelSnapshot, TunnelUpdate,
};

/// Errors seen by a client of the service.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    #[error("{0}")]
    Service(#[from] ServiceError),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("connection to the service was lost")]
    Disconnected,

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Events pushed by the service after a successful `subscribe`.
pub type EventStream = mpsc::UnboundedReceiver<ServiceEvent>;

/// Callers waiting for a response. `None` once the connection is gone.
type Pending = Arc<Mutex<Option<HashMap<RequestId, oneshot::Sender<ResponseBody>>>>>;

/// Client for the tunnel service
pub struct ServiceClient {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Pending,
    next_id: AtomicU64,
    timeout: Duration,
    reader_task: JoinHandle<()>,
}

impl ServiceClient {
    /// Connect to the service. Requests that get no response within
    /// `timeout` fail with [`ClientError::Timeout`].
    pub async fn connect<P: AsRef<Path>>(
        socket_path: P,
        timeout: Duration,
    ) -> ClientResult<(Self, EventStream)> {
        let stream = connect(&socket_path).await?;
        debug!("Connected to service at {}", socket_path.as_ref().display());

        let (mut reader, writer) = stream.into_split();
        let pending: Pending = Arc::new(Mutex::new(Some(HashMap::new())));
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let reader_pending = Arc::clone(&pending);
        let reader_task = tokio::spawn(async move {
            loop {
                match receive_message::<_, ServiceMessage>(&mut reader).await {
                    Ok(Some(ServiceMessage::Response { id, body })) => {
                        let waiter = lock(&reader_pending)
                            .as_mut()
                            .and_then(|pending| pending.remove(&id));
                        match waiter {
                            Some(waiter) => {
                                let _ = waiter.send(body);
                            }
                            None => warn!("Dropping response to unknown request {}", id),
                        }
                    }
                    Ok(Some(ServiceMessage::Event(event))) => {
                        // The receiver may have been dropped by a client
                        // that only issues commands
                        let _ = event_tx.send(event);
                    }
                    Ok(None) => {
                        debug!("Service closed the connection");
                        break;
                    }
                    Err(e) => {
                        error!("Failed to read from service: {}", e);
                        break;
                    }
                }
            }

            // Fail everything still waiting
            lock(&reader_pending).take();
        });

        Ok((
            Self {
                writer: tokio::sync::Mutex::new(writer),
                pending,
                next_id: AtomicU64::new(1),
                timeout,
                reader_task,
            },
            event_rx,
        ))
    }

    async fn request(&self, request: Request) -> ClientResult<ResponseBody> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        match lock(&self.pending).as_mut() {
            Some(pending) => {
                pending.insert(id, tx);
            }
            None => return Err(ClientError::Disconnected),
        }

        debug!("Sending request {}: {:?}", id, request);
        let sent = {
            let mut writer = self.writer.lock().await;
            send_message(&mut *writer, &RequestEnvelope { id, request }).await
        };
        if let Err(e) = sent {
            self.forget(id);
            return Err(e.into());
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Err(_) => {
                self.forget(id);
                Err(ClientError::Timeout(self.timeout))
            }
            Ok(Err(_)) => Err(ClientError::Disconnected),
            Ok(Ok(ResponseBody::Error(e))) => Err(ClientError::Service(e)),
            Ok(Ok(body)) => Ok(body),
        }
    }

    fn forget(&self, id: RequestId) {
        if let Some(pending) = lock(&self.pending).as_mut() {
            pending.remove(&id);
        }
    }

    async fn request_tunnel(&self, request: Request) -> ClientResult<TunnelUpdate> {
        match self.request(request).await? {
            ResponseBody::Tunnel(update) => Ok(update),
            other => Err(unexpected(other)),
        }
    }

    async fn request_ack(&self, request: Request) -> ClientResult<()> {
        match self.request(request).await? {
            ResponseBody::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Ping the service
    pub async fn ping(&self) -> ClientResult<()> {
        match self.request(Request::Ping).await? {
            ResponseBody::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn create(&self, name: &str, config: &str) -> ClientResult<TunnelUpdate> {
        self.request_tunnel(Request::CreateTunnel(CreateTunnelRequest {
            name: name.to_string(),
            config: config.to_string(),
        }))
        .await
    }

    pub async fn start(&self, name: &str) -> ClientResult<TunnelUpdate> {
        self.request_tunnel(Request::StartTunnel {
            name: name.to_string(),
        })
        .await
    }

    pub async fn stop(&self, name: &str) -> ClientResult<TunnelUpdate> {
        self.request_tunnel(Request::StopTunnel {
            name: name.to_string(),
        })
        .await
    }

    pub async fn delete(&self, name: &str) -> ClientResult<()> {
        self.request_ack(Request::DeleteTunnel {
            name: name.to_string(),
        })
        .await
    }

    pub async fn list(&self) -> ClientResult<TunnelSnapshot> {
        match self.request(Request::ListTunnels).await? {
            ResponseBody::Snapshot(snapshot) => Ok(snapshot),
            other => Err(unexpected(other)),
        }
    }

    pub async fn state(&self, name: &str) -> ClientResult<TunnelUpdate> {
        self.request_tunnel(Request::GetTunnelState {
            name: name.to_string(),
        })
        .await
    }

    /// Start receiving events. Every transition after this returns is
    /// delivered on the [`EventStream`].
    pub async fn subscribe(&self) -> ClientResult<()> {
        match self.request(Request::Subscribe).await? {
            ResponseBody::Subscribed => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Ask the service to halt.
    pub async fn quit(&self, stop_outstanding: bool) -> ClientResult<()> {
        self.request_ack(Request::Quit { stop_outstanding }).await
    }
}

impl Drop for ServiceClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn unexpected(body: ResponseBody) -> ClientError {
    ClientError::UnexpectedResponse(format!("{body:?}"))
}
