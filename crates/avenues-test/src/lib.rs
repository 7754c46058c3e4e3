//! Helpers for testing avenues.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`HitCounter`], make sure that it is held until all requests to the server have
//!    been made. If the server is dropped, the ports remain open and all connections to it will
//!    time out. To avoid this, assign it to a variable: `let server = HitCounter::new();`.
//!
//!  - [`ManualProducer`] never completes on its own. Drive it from the test with
//!    [`ManualProducer::succeed`] and [`ManualProducer::fail`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::Hash;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use avenues::{Completion, ProcessingState, ProduceError, Producer, ResourceState};
use axum::extract;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Router, middleware};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;
use url::Url;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `avenues` crate and mutes all
///    other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("avenues=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

struct Productions<K, V> {
    starts: Vec<K>,
    cancels: Vec<K>,
    running: HashSet<K>,
    pending: Vec<(K, Completion<V>)>,
}

/// A [`Producer`] that only completes when the test tells it to.
///
/// It records every call made by the avenue. Cancelled productions keep their completion, so
/// tests can deliver results the avenue no longer waits for.
pub struct ManualProducer<K, V> {
    productions: Mutex<Productions<K, V>>,
    cancel_alls: AtomicUsize,
}

impl<K, V> ManualProducer<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            productions: Mutex::new(Productions {
                starts: Vec::new(),
                cancels: Vec::new(),
                running: HashSet::new(),
                pending: Vec::new(),
            }),
            cancel_alls: AtomicUsize::new(0),
        }
    }

    /// Creates a producer already wrapped in an [`Arc`], to share it with an avenue.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// All keys started so far, in order.
    pub fn starts(&self) -> Vec<K> {
        self.productions.lock().unwrap().starts.clone()
    }

    /// The number of times `key` was started.
    pub fn start_count(&self, key: &K) -> usize {
        let productions = self.productions.lock().unwrap();
        productions.starts.iter().filter(|k| *k == key).count()
    }

    /// All keys cancelled so far, in order.
    pub fn cancels(&self) -> Vec<K> {
        self.productions.lock().unwrap().cancels.clone()
    }

    /// The number of times all productions were cancelled.
    pub fn cancel_alls(&self) -> usize {
        self.cancel_alls.load(Ordering::SeqCst)
    }

    /// The number of completions for `key` waiting to be completed.
    pub fn pending(&self, key: &K) -> usize {
        let productions = self.productions.lock().unwrap();
        productions.pending.iter().filter(|(k, _)| k == key).count()
    }

    /// Completes the oldest pending production of `key`, returning whether there was one.
    ///
    /// The completion runs on the calling thread, after the producer's lock was released.
    pub fn try_complete(&self, key: &K, result: Result<V, ProduceError>) -> bool {
        let completion = {
            let mut productions = self.productions.lock().unwrap();
            let Some(position) = productions.pending.iter().position(|(k, _)| k == key) else {
                return false;
            };
            productions.running.remove(key);
            productions.pending.remove(position).1
        };
        completion.complete(result);
        true
    }

    /// Completes the oldest pending production of `key` with `value`.
    ///
    /// # Panics
    ///
    /// Panics if no production of `key` is pending.
    pub fn succeed(&self, key: &K, value: V) {
        assert!(self.try_complete(key, Ok(value)), "no pending production");
    }

    /// Fails the oldest pending production of `key`.
    ///
    /// # Panics
    ///
    /// Panics if no production of `key` is pending.
    pub fn fail(&self, key: &K, error: ProduceError) {
        assert!(self.try_complete(key, Err(error)), "no pending production");
    }
}

impl<K, V> Default for ManualProducer<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Producer<K, V> for ManualProducer<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Send,
{
    fn start(&self, key: K, completion: Completion<V>) {
        let mut productions = self.productions.lock().unwrap();
        productions.starts.push(key.clone());
        productions.running.insert(key.clone());
        productions.pending.push((key, completion));
    }

    fn cancel(&self, key: &K) {
        let mut productions = self.productions.lock().unwrap();
        productions.cancels.push(key.clone());
        productions.running.remove(key);
    }

    fn cancel_all(&self) {
        self.cancel_alls.fetch_add(1, Ordering::SeqCst);
        self.productions.lock().unwrap().running.clear();
    }

    fn status(&self, key: &K) -> ProcessingState {
        match self.productions.lock().unwrap().running.contains(key) {
            true => ProcessingState::Running,
            false => ProcessingState::None,
        }
    }
}

/// Records the states delivered to claim callbacks, per claimer.
pub struct Recorder<V> {
    states: Arc<Mutex<HashMap<&'static str, Vec<ResourceState<V>>>>>,
}

impl<V> Clone for Recorder<V> {
    fn clone(&self) -> Self {
        Self {
            states: Arc::clone(&self.states),
        }
    }
}

impl<V> Default for Recorder<V> {
    fn default() -> Self {
        Self {
            states: Default::default(),
        }
    }
}

impl<V> Recorder<V>
where
    V: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a claim callback recording into `claimer`.
    pub fn callback(
        &self,
        claimer: &'static str,
    ) -> impl Fn(ResourceState<V>) + Send + Sync + 'static {
        let states = Arc::clone(&self.states);
        move |state| {
            states
                .lock()
                .unwrap()
                .entry(claimer)
                .or_default()
                .push(state)
        }
    }

    /// All states delivered to `claimer`, in order.
    pub fn states(&self, claimer: &'static str) -> Vec<ResourceState<V>> {
        self.states
            .lock()
            .unwrap()
            .get(claimer)
            .cloned()
            .unwrap_or_default()
    }

    /// The final states delivered to `claimer`, i.e. everything but `Processing`.
    pub fn finals(&self, claimer: &'static str) -> Vec<ResourceState<V>> {
        self.states(claimer)
            .into_iter()
            .filter(ResourceState::is_final)
            .collect()
    }

    /// Waits until `claimer` received at least `count` states, returning them.
    ///
    /// # Panics
    ///
    /// Panics if the states do not arrive within five seconds.
    pub async fn wait_for(&self, claimer: &'static str, count: usize) -> Vec<ResourceState<V>> {
        let wait = async {
            loop {
                let states = self.states(claimer);
                if states.len() >= count {
                    return states;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        };
        match tokio::time::timeout(Duration::from_secs(5), wait).await {
            Ok(states) => states,
            Err(_) => panic!("`{claimer}` did not receive {count} states in time"),
        }
    }
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    pub fn with_router(router: Router) -> Self {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = std::net::TcpListener::bind(addr).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            axum::serve(listener, router.into_make_service())
                .await
                .unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A test server counting the requests it serves.
///
/// Routes:
///  - `/respond_statuscode/:num/*tail`: responds with the given status code.
///  - `/delay/:millis/*path`: redirects to `/path` after the given number of milliseconds.
///  - `/redirect/*path`: redirects to `/path`.
///  - `/garbage_data/*tail`: responds with `tail` as body.
pub struct HitCounter {
    server: Server,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl HitCounter {
    pub fn new() -> Self {
        let hits = Arc::new(Mutex::new(BTreeMap::new()));

        let hitcounter = {
            let hits = hits.clone();
            move |extract::OriginalUri(uri), req: extract::Request, next: middleware::Next| {
                let hits = hits.clone();
                async move {
                    {
                        let mut hits = hits.lock().unwrap();
                        let hits = hits.entry(uri.to_string()).or_default();
                        *hits += 1;
                    }

                    next.run(req).await
                }
            }
        };

        let router = Router::new()
            .route(
                "/redirect/*path",
                get(|extract::Path(path): extract::Path<String>| async move {
                    (StatusCode::FOUND, [("Location", format!("/{path}"))])
                }),
            )
            .route(
                "/delay/:millis/*path",
                get(
                    |extract::Path((millis, path)): extract::Path<(u64, String)>| async move {
                        tokio::time::sleep(Duration::from_millis(millis)).await;
                        (StatusCode::FOUND, [("Location", format!("/{path}"))])
                    },
                ),
            )
            .route(
                "/respond_statuscode/:num/*tail",
                get(
                    |extract::Path((num, _)): extract::Path<(u16, String)>| async move {
                        StatusCode::from_u16(num).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                    },
                ),
            )
            .route(
                "/garbage_data/*tail",
                get(|extract::Path(tail): extract::Path<String>| async move { tail }),
            )
            .layer(middleware::from_fn(hitcounter));

        let server = Server::with_router(router);

        Self { server, hits }
    }

    /// The number of requests served since the last call, resetting the count.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_values().sum()
    }

    /// All paths requested since the last call, along with their hits, resetting the count.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_iter().collect()
    }

    pub fn url(&self, path: &str) -> Url {
        self.server.url(path)
    }
}

impl Default for HitCounter {
    fn default() -> Self {
        Self::new()
    }
}
