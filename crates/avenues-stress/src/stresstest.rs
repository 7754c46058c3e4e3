use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use avenues::config::Config;
use sentry::SentryFutureExt;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use crate::workloads::{Outcome, WorkloadsConfig, prepare_workload, process_workload};

#[derive(Default)]
struct Stats {
    durations: DDSketch,
    outcomes: BTreeMap<Outcome, usize>,
}

pub async fn perform_stresstest(
    config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    // initialize workloads
    let workloads = workloads
        .workloads
        .iter()
        .map(|workload| {
            let prepared = prepare_workload(&config, workload)?;
            Ok((workload.concurrency, Arc::new(prepared)))
        })
        .collect::<Result<Vec<_>>>()?;

    // warmup: run each workload once to make sure every avenue is set up
    {
        let start = Instant::now();

        let futures = workloads.iter().map(|(_, workload)| {
            let workload = Arc::clone(workload);
            tokio::spawn(async move {
                process_workload(&workload).await;
            })
        });

        let _results = futures::future::join_all(futures).await;

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();
    tracing::info!(workloads = workloads.len(), ?duration, "starting stresstest");

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for (concurrency, workload) in workloads.into_iter() {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let starts_before = workload.starts();

        let task = tokio::spawn(async move {
            let stats = Arc::new(Mutex::new(Stats::default()));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let workload = Arc::clone(&workload);
                        let stats = Arc::clone(&stats);
                        let task_start = Instant::now();

                        let hub = sentry::Hub::new_from_top(sentry::Hub::current());
                        let ctx = sentry::TransactionContext::new("stresstest", "stresstest");
                        let transaction = hub.start_transaction(ctx);

                        let future = async move {
                            let outcome = process_workload(&workload).await;

                            transaction.finish();

                            {
                                let mut stats = stats.lock().unwrap();
                                stats.durations.add(task_start.elapsed().as_secs_f64());
                                *stats.outcomes.entry(outcome).or_default() += 1;
                            }

                            drop(permit);
                        };
                        let future = future.bind_hub(hub);

                        tokio::spawn(future);
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let stats = std::mem::take(&mut *stats.lock().unwrap());
            let starts = workload.starts() - starts_before;

            (concurrency, starts, stats)
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, task) in finished_tasks.into_iter().enumerate() {
        let (concurrency, starts, stats) = task?;
        let Stats {
            durations,
            outcomes,
        } = stats;

        let ops = durations.count();
        let ops_ps = ops as f32 / duration.as_secs_f32();
        println!("Workload {i} (concurrency: {concurrency}): {ops} claims, {ops_ps:.2} claims/s");
        println!("  productions started: {starts}");
        println!("  outcomes: {outcomes:?}");

        if ops == 0 {
            continue;
        }
        let quantile = |q| {
            let secs = durations.quantile(q).ok().flatten().unwrap_or_default();
            Duration::from_secs_f64(secs)
        };
        let avg = Duration::from_secs_f64(durations.sum().unwrap_or_default() / ops as f64);
        let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }

    Ok(())
}
