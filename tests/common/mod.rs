#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use remote_dispatch::{
    api::{self, AppState, RouterConfig},
    bus::DirtyTagBus,
    config::SimulationSection,
    executor::MainThreadExecutor,
    resolve::ResolverTable,
    session::{SessionConfig, SessionRegistry},
    shutdown::ShutdownCoordinator,
    sim::{self, SimulationThread, World},
    tag::{GlobalKind, KeyedKind},
};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Session timeouts short enough for tests to observe a timed-out poll.
pub fn fast_sessions() -> SessionConfig {
    SessionConfig {
        session_timeout: Duration::from_secs(5),
        long_poll_timeout: Duration::from_millis(300),
    }
}

/// A small world: 2 trainsets of 3 cars, 4 junctions, a 20 ms tick.
pub fn small_world() -> SimulationSection {
    SimulationSection {
        tick_ms: 20,
        trainsets: 2,
        cars_per_trainset: 3,
        junctions: 4,
    }
}

/// Resolvers that answer without any simulation: globals resolve to their
/// wire name, keyed tags echo their id.
pub fn static_resolvers() -> ResolverTable {
    let mut table = ResolverTable::new();
    for kind in GlobalKind::ALL {
        table = table.global(kind, move || async move { Ok::<_, anyhow::Error>(json!(kind.as_str())) });
    }
    table
        .keyed(KeyedKind::CarGuid, |id| async move { Ok::<_, anyhow::Error>(json!({ "guid": &*id })) })
        .keyed(KeyedKind::Trainset, |id| async move { Ok::<_, anyhow::Error>(json!({ "trainset": &*id })) })
}

/// A live server on an ephemeral port, wired the way `main` wires it.
pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    simulation: Option<SimulationThread>,
    server_shutdown: Option<oneshot::Sender<()>>,
    http: Option<JoinHandle<()>>,
}

impl TestServer {
    pub async fn start(sessions: SessionConfig) -> Self {
        let (executor, queue) = MainThreadExecutor::<World>::new();
        let registry = SessionRegistry::new(sessions, sim::resolvers(executor.clone()));
        let bus = DirtyTagBus::new(registry.clone());

        let cfg = small_world();
        let mut world = World::generate(&cfg, 11);
        world.register_change_listener(bus.listener());
        let simulation =
            SimulationThread::spawn(world, queue, cfg.tick()).expect("spawn simulation thread");
        // Two round trips guarantee a full tick has run, so the initial
        // player report is out before any session exists.
        for _ in 0..2 {
            executor.submit(|_: &mut World| ()).await.unwrap();
        }

        let state = AppState {
            sessions: registry,
            bus,
            executor,
            shutdown: ShutdownCoordinator::new(),
        };
        let app = api::router(state.clone(), RouterConfig::default());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let http = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    rx.await.ok();
                })
                .await
                .unwrap();
        });

        Self {
            addr,
            state,
            simulation: Some(simulation),
            server_shutdown: Some(tx),
            http: Some(http),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    /// Run `f` against the world on the simulation thread.
    pub async fn on_sim<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&mut World) -> T + Send + 'static,
        T: Send + 'static,
    {
        self.state.executor.submit(f).await.expect("simulation call")
    }

    /// Guid of the first locomotive in the world.
    pub async fn first_loco(&self) -> String {
        self.on_sim(|w| w.loco_guids()[0].clone()).await
    }

    /// The shutdown sequence `main` runs on Ctrl+C.
    pub async fn shutdown(mut self) -> World {
        self.state.shutdown.shutdown();
        self.state.shutdown.wait_for_drain(Duration::from_secs(2)).await;
        if let Some(tx) = self.server_shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(http) = self.http.take() {
            http.await.unwrap();
        }
        self.state.sessions.clear();
        self.simulation
            .take()
            .expect("simulation running")
            .stop()
            .expect("simulation stopped cleanly")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(http) = self.http.take() {
            http.abort();
        }
    }
}

/// GET `url` and parse the body as JSON.
pub async fn get_json(client: &reqwest::Client, url: &str) -> (reqwest::StatusCode, Value) {
    let resp = client.get(url).send().await.unwrap();
    let status = resp.status();
    let text = resp.text().await.unwrap();
    let body = if text.is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&text).unwrap()
    };
    (status, body)
}

/// Keys of a JSON object, sorted.
pub fn keys(value: &Value) -> Vec<String> {
    let mut keys: Vec<String> = value
        .as_object()
        .map(|o| o.keys().cloned().collect())
        .unwrap_or_default();
    keys.sort();
    keys
}
