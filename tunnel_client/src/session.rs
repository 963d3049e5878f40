//! Keeps a [`ClientMirror`] in sync with the service.
//!
//! The mirror is owned by a single task. Live events and list snapshots are
//! both funnelled into that task through one channel, so the mirror is never
//! shared and never locked. A `Resync` from the service triggers a fresh
//! list.

use crate::mirror::{ClientMirror, MirrorChange};
use crate::service_comms::{ClientError, ClientResult, EventStream, ServiceClient};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tunnel_ipc::{ServiceEvent, TunnelSnapshot, TunnelUpdate};

/// Changes buffered for [`MirrorSession::next_change`]. Further changes are
/// dropped until the caller catches up; the view stays current regardless.
pub const CHANGE_QUEUE: usize = 256;

/// Input to the mirror task.
#[derive(Debug)]
enum MirrorInput {
    Event(ServiceEvent),
    Snapshot(ClientResult<TunnelSnapshot>),
    /// The event stream ended
    Closed,
}

/// Handle to a running mirror task.
pub struct MirrorSession {
    view: watch::Receiver<Vec<TunnelUpdate>>,
    changes: mpsc::Receiver<MirrorChange>,
    task: JoinHandle<()>,
}

impl MirrorSession {
    /// Subscribe on `client` and start mirroring.
    ///
    /// `events` must be the stream returned alongside `client`. The initial
    /// list is only issued after the subscription is acknowledged, so no
    /// transition can slip between the two.
    pub async fn start(client: Arc<ServiceClient>, events: EventStream) -> ClientResult<Self> {
        client.subscribe().await?;
        debug!("Subscribed to service events");

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (view_tx, view) = watch::channel(Vec::new());
        let (changes_tx, changes) = mpsc::channel(CHANGE_QUEUE);

        tokio::spawn(forward_events(events, input_tx.clone()));
        request_snapshot(&client, &input_tx);

        let task = tokio::spawn(run(client, input_tx, input_rx, view_tx, changes_tx));
        Ok(Self {
            view,
            changes,
            task,
        })
    }

    /// Current contents of the mirror, sorted by name.
    pub fn tunnels(&self) -> Vec<TunnelUpdate> {
        self.view.borrow().clone()
    }

    pub fn get(&self, name: &str) -> Option<TunnelUpdate> {
        self.view.borrow().iter().find(|t| t.name == name).cloned()
    }

    /// Next change to the mirror. `None` once the session has ended.
    ///
    /// Changes are dropped while the queue is full, so a caller that only
    /// reads [`tunnels`](Self::tunnels) or [`wait_until`](Self::wait_until)
    /// holds no backlog.
    pub async fn next_change(&mut self) -> Option<MirrorChange> {
        self.changes.recv().await
    }

    /// Wait until the mirror satisfies `predicate`. Fails if the session
    /// ends first.
    pub async fn wait_until<F>(&mut self, mut predicate: F) -> ClientResult<()>
    where
        F: FnMut(&[TunnelUpdate]) -> bool,
    {
        self.view
            .wait_for(|tunnels| predicate(tunnels))
            .await
            .map(|_| ())
            .map_err(|_| ClientError::Disconnected)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for MirrorSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn forward_events(mut events: EventStream, input: mpsc::UnboundedSender<MirrorInput>) {
    while let Some(event) = events.recv().await {
        if input.send(MirrorInput::Event(event)).is_err() {
            return;
        }
    }
    let _ = input.send(MirrorInput::Closed);
}

fn request_snapshot(client: &Arc<ServiceClient>, input: &mpsc::UnboundedSender<MirrorInput>) {
    let client = Arc::clone(client);
    let input = input.clone();
    tokio::spawn(async move {
        let snapshot = client.list().await;
        let _ = input.send(MirrorInput::Snapshot(snapshot));
    });
}

async fn run(
    client: Arc<ServiceClient>,
    input_tx: mpsc::UnboundedSender<MirrorInput>,
    mut input_rx: mpsc::UnboundedReceiver<MirrorInput>,
    view: watch::Sender<Vec<TunnelUpdate>>,
    changes: mpsc::Sender<MirrorChange>,
) {
    let mut mirror = ClientMirror::new();

    while let Some(input) = input_rx.recv().await {
        let applied: Vec<MirrorChange> = match input {
            MirrorInput::Event(ServiceEvent::StateChanged(update)) => {
                mirror.apply_update(update).into_iter().collect()
            }
            MirrorInput::Event(ServiceEvent::Removed { name, seq }) => {
                mirror.apply_removal(&name, seq).into_iter().collect()
            }
            MirrorInput::Event(ServiceEvent::Resync) => {
                info!("Missed service events, re-listing tunnels");
                request_snapshot(&client, &input_tx);
                Vec::new()
            }
            MirrorInput::Event(ServiceEvent::ShuttingDown) => {
                info!("Service is shutting down");
                break;
            }
            MirrorInput::Snapshot(Ok(snapshot)) => {
                debug!(
                    "Applying snapshot of {} tunnels as of {}",
                    snapshot.tunnels.len(),
                    snapshot.as_of
                );
                mirror.apply_snapshot(snapshot)
            }
            MirrorInput::Snapshot(Err(e)) => {
                warn!("Failed to list tunnels: {}", e);
                break;
            }
            MirrorInput::Closed => {
                info!("Connection to service closed");
                break;
            }
        };

        if applied.is_empty() {
            continue;
        }
        view.send_replace(mirror.iter().collect());
        for change in applied {
            debug!("Mirror change: {:?}", change);
            if let Err(e) = changes.try_send(change) {
                debug!("Change queue full, dropping {:?}", e.into_inner());
            }
        }
    }
}
