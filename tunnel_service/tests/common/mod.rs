#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tunnel_ipc::{ServiceEvent, TunnelState, TunnelUpdate};
use tunnel_service::{
    Dataplane, DataplaneError, DataplaneResult, IniConfigParser, LifecycleController,
    NotificationBus, Subscription, TunnelConfig, TunnelRegistry,
};

pub const CONFIG: &str = "[Interface]\nAddress = 10.0.0.2/32\n\n[Peer]\nEndpoint = vpn.example.com:51820\n";

/// Dataplane whose calls can be held open or made to fail per tunnel.
#[derive(Default)]
pub struct TestDataplane {
    failing_up: Mutex<HashSet<String>>,
    failing_down: Mutex<HashSet<String>>,
    held: Mutex<HashMap<String, Arc<Notify>>>,
    discovered: Mutex<Vec<String>>,
    calls: Mutex<Vec<String>>,
}

impl TestDataplane {
    pub fn fail_bring_up(&self, name: &str) {
        self.failing_up.lock().unwrap().insert(name.to_string());
    }

    pub fn fail_tear_down(&self, name: &str) {
        self.failing_down.lock().unwrap().insert(name.to_string());
    }

    /// Make the next bring-up of `name` wait until the returned handle is
    /// notified.
    pub fn hold(&self, name: &str) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.held
            .lock()
            .unwrap()
            .insert(name.to_string(), Arc::clone(&notify));
        notify
    }

    pub fn set_discovered(&self, names: &[&str]) {
        *self.discovered.lock().unwrap() = names.iter().map(|n| n.to_string()).collect();
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Dataplane for TestDataplane {
    async fn bring_up(&self, name: &str, _config: &TunnelConfig) -> DataplaneResult<()> {
        self.calls.lock().unwrap().push(format!("up:{name}"));
        let held = self.held.lock().unwrap().remove(name);
        if let Some(notify) = held {
            notify.notified().await;
        }
        if self.failing_up.lock().unwrap().contains(name) {
            return Err(DataplaneError::Other("injected bring-up failure".to_string()));
        }
        Ok(())
    }

    async fn tear_down(&self, name: &str) -> DataplaneResult<()> {
        self.calls.lock().unwrap().push(format!("down:{name}"));
        if self.failing_down.lock().unwrap().contains(name) {
            return Err(DataplaneError::Other("injected tear-down failure".to_string()));
        }
        Ok(())
    }

    async fn discover(&self) -> DataplaneResult<Vec<(String, TunnelConfig)>> {
        Ok(self
            .discovered
            .lock()
            .unwrap()
            .iter()
            .map(|name| (name.clone(), TunnelConfig::unknown()))
            .collect())
    }
}

pub fn controller(dataplane: Arc<TestDataplane>) -> Arc<LifecycleController> {
    let registry = Arc::new(TunnelRegistry::new(NotificationBus::new(64)));
    Arc::new(LifecycleController::new(
        registry,
        dataplane,
        Arc::new(IniConfigParser),
    ))
}

/// Next event, failing the test if none arrives promptly.
pub async fn next_event(sub: &mut Subscription) -> ServiceEvent {
    tokio::time::timeout(Duration::from_secs(5), sub.recv())
        .await
        .expect("timed out waiting for event")
        .expect("bus closed")
}

pub async fn next_update(sub: &mut Subscription) -> TunnelUpdate {
    match next_event(sub).await {
        ServiceEvent::StateChanged(update) => update,
        other => panic!("expected a state change, got {other:?}"),
    }
}

/// Assert that no event is pending right now.
pub async fn assert_quiet(sub: &mut Subscription) {
    let pending = tokio::time::timeout(Duration::from_millis(50), sub.recv()).await;
    assert!(pending.is_err(), "unexpected event {pending:?}");
}

pub fn states(updates: &[TunnelUpdate]) -> Vec<TunnelState> {
    updates.iter().map(|u| u.state).collect()
}
