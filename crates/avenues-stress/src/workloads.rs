use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Result, ensure};
use avenues::config::Config;
use avenues::{Avenue, Delivery, ProduceError, ResourceState, TaskProducer};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    pub concurrency: usize,
    /// The number of distinct keys claims are spread over.
    pub keys: u64,
    /// How long every production takes.
    #[serde(with = "humantime_serde")]
    pub latency: Duration,
    /// The share of productions that fail.
    #[serde(default)]
    pub failure_rate: f64,
    /// The share of pending claims that are cancelled instead of awaited.
    #[serde(default)]
    pub cancel_rate: f64,
    /// The share of claims that invalidate their key once it is available.
    #[serde(default)]
    pub invalidate_rate: f64,
}

/// How a single claim ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Outcome {
    Existing,
    Arrived,
    Failed,
    Cancelled,
    TimedOut,
}

type StressAvenue = Avenue<u64, u64, Arc<str>>;

pub struct PreparedWorkload {
    avenue: StressAvenue,
    keys: u64,
    cancel_rate: f64,
    invalidate_rate: f64,
    timeout: Duration,
    next_claimer: AtomicU64,
    starts: Arc<AtomicUsize>,
}

impl PreparedWorkload {
    /// The number of productions started so far.
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::Relaxed)
    }
}

fn check_rate(name: &str, rate: f64) -> Result<()> {
    ensure!(
        (0.0..=1.0).contains(&rate),
        "`{name}` must be between 0 and 1, got {rate}"
    );
    Ok(())
}

pub fn prepare_workload(config: &Config, workload: &Workload) -> Result<PreparedWorkload> {
    ensure!(workload.keys > 0, "`keys` must not be zero");
    check_rate("failure_rate", workload.failure_rate)?;
    check_rate("cancel_rate", workload.cancel_rate)?;
    check_rate("invalidate_rate", workload.invalidate_rate)?;

    let starts = Arc::new(AtomicUsize::new(0));
    let producer = {
        let starts = Arc::clone(&starts);
        let latency = workload.latency;
        let failure_rate = workload.failure_rate;
        TaskProducer::with_name(
            "stresstest",
            tokio::runtime::Handle::current(),
            move |key: u64| {
                starts.fetch_add(1, Ordering::Relaxed);
                let fail = rand::rng().random_bool(failure_rate);
                async move {
                    tokio::time::sleep(latency).await;
                    match fail {
                        true => Err(ProduceError::other("simulated failure")),
                        false => Ok(Arc::from(key.to_string())),
                    }
                }
            },
        )
    };

    // Telling pending claims apart from cache hits relies on inline delivery.
    let avenue = StressAvenue::builder(producer)
        .name("stresstest")
        .with_config(config)
        .delivery(Delivery::Inline)
        .build();

    Ok(PreparedWorkload {
        avenue,
        keys: workload.keys,
        cancel_rate: workload.cancel_rate,
        invalidate_rate: workload.invalidate_rate,
        timeout: workload.latency * 10 + Duration::from_secs(1),
        next_claimer: AtomicU64::new(0),
        starts,
    })
}

/// Makes a single claim on a random key, and waits for it to end.
pub async fn process_workload(workload: &PreparedWorkload) -> Outcome {
    let (key, cancel, invalidate) = {
        let mut rng = rand::rng();
        (
            rng.random_range(0..workload.keys),
            rng.random_bool(workload.cancel_rate),
            rng.random_bool(workload.invalidate_rate),
        )
    };
    let claimer = workload.next_claimer.fetch_add(1, Ordering::Relaxed);
    let avenue = &workload.avenue;

    let (tx, mut rx) = oneshot::channel();
    let tx = Mutex::new(Some(tx));
    avenue.register(claimer, key, move |state: ResourceState<Arc<str>>| {
        if !state.is_final() {
            return;
        }
        let tx = tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(tx) = tx {
            tx.send(state).ok();
        }
    });

    let state = match rx.try_recv() {
        Ok(state) => Some(state),
        Err(_) if cancel => {
            avenue.cancel(&key);
            avenue.unregister(&claimer);
            return Outcome::Cancelled;
        }
        Err(_) => tokio::time::timeout(workload.timeout, rx).await.ok().and_then(Result::ok),
    };
    avenue.unregister(&claimer);

    let outcome = match state {
        Some(ResourceState::Existing(_)) => Outcome::Existing,
        Some(ResourceState::Arrived(_)) => Outcome::Arrived,
        Some(ResourceState::Failed(_)) => return Outcome::Failed,
        Some(ResourceState::Processing) | None => {
            tracing::warn!(key, "claim did not finish in time");
            return Outcome::TimedOut;
        }
    };

    if invalidate {
        avenue.invalidate(&key);
    }
    outcome
}
