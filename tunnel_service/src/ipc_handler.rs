//! IPC server for the tunnel service.
//!
//! Accepts client connections on a Unix domain socket. Each connection gets
//! its own task; every request on it runs in a further task so that a slow
//! bring-up never holds up other commands or the event stream. Responses are
//! tagged with the request id and may arrive out of order.

use crate::bus::Subscription;
use crate::controller::LifecycleController;
use anyhow::Context;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tunnel_ipc::transport::{receive_message, send_message};
use tunnel_ipc::{
    IpcResult, Request, RequestEnvelope, ResponseBody, ServiceError, ServiceEvent, ServiceMessage,
    UnixSocketListener,
};

/// Requests buffered per connection before the reader applies backpressure.
const REQUEST_QUEUE: usize = 32;

/// IPC server for the service
pub struct IpcServer {
    listener: UnixSocketListener,
    controller: Arc<LifecycleController>,
}

impl IpcServer {
    /// Bind the socket at `path` with permission bits `mode`.
    pub fn bind<P: AsRef<Path>>(
        path: P,
        mode: u32,
        controller: Arc<LifecycleController>,
    ) -> IpcResult<Self> {
        let listener = UnixSocketListener::bind(path, mode)?;
        Ok(Self {
            listener,
            controller,
        })
    }

    pub fn socket_path(&self) -> &Path {
        self.listener.path()
    }

    /// Serve clients until the controller halts.
    pub async fn run(self) -> anyhow::Result<()> {
        info!(socket = %self.listener.path().display(), "IPC server listening");

        let mut shutdown = self.controller.shutdown_signal();
        let mut halted = *shutdown.borrow();

        // Channel for client tasks to signal completion
        let (client_done_tx, mut client_done_rx) = mpsc::channel::<u64>(16);
        let mut client_tasks = HashMap::new();
        let mut next_client_id: u64 = 0;

        while !halted {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok(stream) => {
                            next_client_id += 1;
                            let client_id = next_client_id;
                            info!(client_id, "Accepted connection");

                            let controller = Arc::clone(&self.controller);
                            let client_done_tx = client_done_tx.clone();

                            let handle = tokio::spawn(async move {
                                if let Err(e) = handle_client(stream, client_id, controller).await {
                                    error!(client_id, error = %e, "Error handling client");
                                }

                                // Fails once the server has stopped accepting
                                if client_done_tx.send(client_id).await.is_err() {
                                    debug!(client_id, "Server no longer tracking client");
                                }
                            });

                            client_tasks.insert(client_id, handle);
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                },

                Some(client_id) = client_done_rx.recv() => {
                    debug!(client_id, "Client task completed");
                    client_tasks.remove(&client_id);
                },

                _ = shutdown.changed() => {
                    info!("Service halted, closing IPC server");
                    halted = true;
                }
            }
        }

        // Nothing drains completions past this point
        drop(client_done_rx);

        // Connections notice the halt on their own and close
        for (client_id, handle) in client_tasks {
            debug!(client_id, "Waiting for client task to complete");
            if let Err(e) = handle.await {
                error!(client_id, error = %e, "Client task failed");
            }
        }

        info!("IPC server shut down");
        Ok(())
    }
}

/// Next event for a subscribed connection; pending forever otherwise.
async fn next_event(subscription: &mut Option<Subscription>) -> Option<ServiceEvent> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

/// Serve one client connection.
async fn handle_client(
    stream: UnixStream,
    client_id: u64,
    controller: Arc<LifecycleController>,
) -> anyhow::Result<()> {
    let (mut reader, mut writer) = stream.into_split();

    // Frames are read on a dedicated task since a partial read cannot be
    // resumed after being cancelled by `select!`.
    let (request_tx, mut request_rx) = mpsc::channel::<RequestEnvelope>(REQUEST_QUEUE);
    let reader_task = tokio::spawn(async move {
        loop {
            match receive_message::<_, RequestEnvelope>(&mut reader).await {
                Ok(Some(envelope)) => {
                    if request_tx.send(envelope).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!(client_id, "Client disconnected");
                    break;
                }
                Err(e) => {
                    warn!(client_id, error = %e, "Failed to read request");
                    break;
                }
            }
        }
    });

    let (response_tx, mut response_rx) = mpsc::unbounded_channel::<ServiceMessage>();
    let mut shutdown = controller.shutdown_signal();
    let mut closing = *shutdown.borrow();
    let mut subscription: Option<Subscription> = None;
    let mut in_flight: usize = 0;

    let result: anyhow::Result<()> = async {
        // Once halting, stay until every accepted request got its response
        while !(closing && in_flight == 0) {
            tokio::select! {
                envelope = request_rx.recv() => {
                    // Commands still running finish on their own
                    let Some(RequestEnvelope { id, request }) = envelope else {
                        break;
                    };
                    debug!(client_id, id, ?request, "Received request");

                    if matches!(request, Request::Subscribe) {
                        // Register before checking for a halt and before
                        // acknowledging, so neither a later transition nor
                        // the final ShuttingDown can be missed
                        let body = if subscription.is_some() {
                            ResponseBody::Subscribed
                        } else {
                            let candidate = controller.subscribe();
                            if controller.is_shut_down() {
                                ResponseBody::Error(ServiceError::ShuttingDown)
                            } else {
                                subscription = Some(candidate);
                                ResponseBody::Subscribed
                            }
                        };
                        send_message(&mut writer, &ServiceMessage::Response { id, body })
                            .await
                            .context("failed to send subscribe ack")?;
                        continue;
                    }

                    in_flight += 1;
                    let controller = Arc::clone(&controller);
                    let response_tx = response_tx.clone();
                    tokio::spawn(async move {
                        let body = dispatch(&controller, request).await;
                        let _ = response_tx.send(ServiceMessage::Response { id, body });
                    });
                },

                Some(response) = response_rx.recv() => {
                    in_flight -= 1;
                    send_message(&mut writer, &response)
                        .await
                        .context("failed to send response")?;
                },

                Some(event) = next_event(&mut subscription), if !closing => {
                    let halting = event == ServiceEvent::ShuttingDown;
                    send_message(&mut writer, &ServiceMessage::Event(event))
                        .await
                        .context("failed to send event")?;
                    closing |= halting;
                },

                // Subscribed connections close on the ShuttingDown event
                _ = shutdown.changed(), if !closing && subscription.is_none() => {
                    closing = true;
                }
            }
        }
        Ok(())
    }
    .await;

    reader_task.abort();
    debug!(client_id, "Connection closed");
    result
}

/// Run a single request against the controller.
async fn dispatch(controller: &LifecycleController, request: Request) -> ResponseBody {
    let result = match request {
        Request::Ping => Ok(ResponseBody::Pong),
        Request::CreateTunnel(req) => controller
            .create(&req.name, &req.config)
            .await
            .map(ResponseBody::Tunnel),
        Request::StartTunnel { name } => controller.start(&name).await.map(ResponseBody::Tunnel),
        Request::StopTunnel { name } => controller.stop(&name).await.map(ResponseBody::Tunnel),
        Request::DeleteTunnel { name } => controller.delete(&name).await.map(|()| ResponseBody::Ack),
        Request::ListTunnels => Ok(ResponseBody::Snapshot(controller.list())),
        Request::GetTunnelState { name } => controller.state(&name).map(ResponseBody::Tunnel),
        Request::Quit { stop_outstanding } => controller
            .quit(stop_outstanding)
            .await
            .map(|()| ResponseBody::Ack),
        Request::Subscribe => Err(ServiceError::Internal(
            "subscribe is handled by the connection".to_string(),
        )),
    };

    result.unwrap_or_else(ResponseBody::Error)
}
