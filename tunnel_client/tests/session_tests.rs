use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use tunnel_client::session::CHANGE_QUEUE;
use tunnel_client::{ClientError, MirrorChange, MirrorSession, ServiceClient};
use tunnel_ipc::{ServiceError, TunnelState};
use tunnel_service::{
    IniConfigParser, IpcServer, LifecycleController, NotificationBus, NullDataplane,
    TunnelRegistry,
};

const CONFIG: &str = "[Interface]\nAddress = 10.0.0.2/32\n";
const TIMEOUT: Duration = Duration::from_secs(5);

struct TestService {
    _dir: TempDir,
    socket_path: PathBuf,
    controller: Arc<LifecycleController>,
    server: tokio::task::JoinHandle<anyhow::Result<()>>,
}

fn spawn_service(event_queue_capacity: usize) -> anyhow::Result<TestService> {
    let dir = tempdir()?;
    let socket_path = dir.path().join("tunneld.sock");

    let registry = Arc::new(TunnelRegistry::new(NotificationBus::new(event_queue_capacity)));
    let controller = Arc::new(LifecycleController::new(
        registry,
        Arc::new(NullDataplane),
        Arc::new(IniConfigParser),
    ));
    let server = IpcServer::bind(&socket_path, 0o600, Arc::clone(&controller))?;
    let server = tokio::spawn(server.run());

    Ok(TestService {
        _dir: dir,
        socket_path,
        controller,
        server,
    })
}

async fn client(path: &Path) -> anyhow::Result<ServiceClient> {
    let (client, _events) = ServiceClient::connect(path, TIMEOUT).await?;
    Ok(client)
}

async fn session(path: &Path) -> anyhow::Result<MirrorSession> {
    let (client, events) = ServiceClient::connect(path, TIMEOUT).await?;
    Ok(MirrorSession::start(Arc::new(client), events).await?)
}

async fn wait_for_state(
    session: &mut MirrorSession,
    name: &str,
    state: Option<TunnelState>,
) -> anyhow::Result<()> {
    tokio::time::timeout(
        TIMEOUT,
        session.wait_until(|tunnels| {
            tunnels.iter().find(|t| t.name == name).map(|t| t.state) == state
        }),
    )
    .await??;
    Ok(())
}

#[tokio::test]
async fn commands_round_trip() -> anyhow::Result<()> {
    let service = spawn_service(64)?;
    let client = client(&service.socket_path).await?;

    client.ping().await?;

    let created = client.create("t1", CONFIG).await?;
    assert_eq!(created.state, TunnelState::Stopped);
    assert_eq!(client.start("t1").await?.state, TunnelState::Started);
    assert_eq!(client.state("t1").await?.state, TunnelState::Started);

    match client.delete("t1").await {
        Err(ClientError::Service(ServiceError::InvalidTransition { from, .. })) => {
            assert_eq!(from, TunnelState::Started)
        }
        other => panic!("expected InvalidTransition, got {other:?}"),
    }

    assert_eq!(client.stop("t1").await?.state, TunnelState::Stopped);
    client.delete("t1").await?;
    assert!(client.list().await?.tunnels.is_empty());

    assert!(matches!(
        client.state("t1").await,
        Err(ClientError::Service(ServiceError::NotFound(_)))
    ));
    Ok(())
}

#[tokio::test]
async fn mirrors_converge_with_late_joiner() -> anyhow::Result<()> {
    let service = spawn_service(64)?;
    let commander = client(&service.socket_path).await?;

    let mut early = session(&service.socket_path).await?;

    commander.create("a", CONFIG).await?;
    commander.create("b", CONFIG).await?;
    commander.start("a").await?;
    commander.delete("b").await?;

    let mut late = session(&service.socket_path).await?;
    commander.create("c", CONFIG).await?;

    for mirror in [&mut early, &mut late] {
        wait_for_state(mirror, "a", Some(TunnelState::Started)).await?;
        wait_for_state(mirror, "b", None).await?;
        wait_for_state(mirror, "c", Some(TunnelState::Stopped)).await?;
    }

    let listed: Vec<_> = commander
        .list()
        .await?
        .tunnels
        .into_iter()
        .map(|t| (t.name, t.state, t.seq))
        .collect();
    let view = |session: &MirrorSession| -> Vec<_> {
        session
            .tunnels()
            .into_iter()
            .map(|t| (t.name, t.state, t.seq))
            .collect()
    };
    assert_eq!(view(&early), listed);
    assert_eq!(view(&late), listed);
    Ok(())
}

#[tokio::test]
async fn session_reports_changes_in_order() -> anyhow::Result<()> {
    let service = spawn_service(64)?;
    let commander = client(&service.socket_path).await?;
    let mut session = session(&service.socket_path).await?;

    commander.create("t1", CONFIG).await?;
    commander.start("t1").await?;
    commander.stop("t1").await?;
    commander.delete("t1").await?;

    let mut states = Vec::new();
    loop {
        match tokio::time::timeout(TIMEOUT, session.next_change()).await? {
            Some(MirrorChange::Updated(update)) => states.push(update.state),
            Some(MirrorChange::Removed { name }) => {
                assert_eq!(name, "t1");
                break;
            }
            None => panic!("session ended early"),
        }
    }
    assert_eq!(
        states,
        vec![
            TunnelState::Stopped,
            TunnelState::Starting,
            TunnelState::Started,
            TunnelState::Stopping,
            TunnelState::Stopped,
            TunnelState::Deleting,
        ]
    );
    Ok(())
}

#[tokio::test]
async fn overflowing_subscriber_resyncs() -> anyhow::Result<()> {
    // A queue this small overflows on any burst
    let service = spawn_service(1)?;
    let mut session = session(&service.socket_path).await?;

    for i in 0..20 {
        service
            .controller
            .create(&format!("t{i}"), CONFIG)
            .await?;
    }
    service.controller.start("t7").await?;

    tokio::time::timeout(
        TIMEOUT,
        session.wait_until(|tunnels| {
            tunnels.len() == 20
                && tunnels
                    .iter()
                    .any(|t| t.name == "t7" && t.state == TunnelState::Started)
        }),
    )
    .await??;
    Ok(())
}

#[tokio::test]
async fn quit_ends_sessions_and_server() -> anyhow::Result<()> {
    let service = spawn_service(64)?;
    let commander = client(&service.socket_path).await?;
    let mut session = session(&service.socket_path).await?;

    commander.create("t1", CONFIG).await?;
    commander.start("t1").await?;
    wait_for_state(&mut session, "t1", Some(TunnelState::Started)).await?;

    commander.quit(true).await?;

    // The mirror sees the stop before the session ends
    let mut last = None;
    while let Some(change) = tokio::time::timeout(TIMEOUT, session.next_change()).await? {
        last = Some(change);
    }
    match last {
        Some(MirrorChange::Updated(update)) => assert_eq!(update.state, TunnelState::Stopped),
        other => panic!("unexpected final change {other:?}"),
    }

    tokio::time::timeout(TIMEOUT, service.server).await???;
    assert!(matches!(
        commander.ping().await,
        Err(ClientError::Disconnected) | Err(ClientError::Ipc(_))
    ));
    Ok(())
}

#[tokio::test]
async fn undrained_changes_are_bounded() -> anyhow::Result<()> {
    let service = spawn_service(1024)?;
    let mut session = session(&service.socket_path).await?;

    let total = CHANGE_QUEUE + 40;
    for i in 0..total {
        service
            .controller
            .create(&format!("t{i}"), CONFIG)
            .await?;
    }

    // The view keeps up even though nobody reads the changes
    tokio::time::timeout(TIMEOUT, session.wait_until(|tunnels| tunnels.len() == total)).await??;

    let mut queued = 0;
    while let Ok(Some(_)) =
        tokio::time::timeout(Duration::from_millis(200), session.next_change()).await
    {
        queued += 1;
    }
    assert_eq!(queued, CHANGE_QUEUE);
    Ok(())
}
