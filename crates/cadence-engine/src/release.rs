// Release scheduler
//
// Drives the cron schedules of every stored workflow. Ticks at 1-minute
// granularity; at each fire time it invokes Driver::release on a worker
// pool with a per-release timeout. Same-minute collisions fire in
// declaration order and deduplicate by (workflow, logical minute).

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Map;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use cadence_core::{truncate_minute, CronEvaluator, Result};

use crate::driver::Driver;

/// Default worker pool size for concurrent releases.
const DEFAULT_RELEASE_POOL: usize = 4;

/// How long a (workflow, minute) pair stays in the dedup set.
const DEDUP_RETENTION_HOURS: i64 = 3;

/// One workflow's compiled schedules, in declaration order.
struct Subscription {
    workflow: String,
    evaluators: Vec<CronEvaluator>,
}

/// Cron-driven release loop over the driver's workflow store.
pub struct ReleaseScheduler {
    driver: Driver,
    pool: usize,
}

impl ReleaseScheduler {
    pub fn new(driver: Driver) -> Self {
        Self { driver, pool: DEFAULT_RELEASE_POOL }
    }

    pub fn with_pool(mut self, pool: usize) -> Self {
        self.pool = pool.max(1);
        self
    }

    /// Subscribe to every stored workflow that carries cron schedules.
    async fn subscriptions(&self) -> Result<Vec<Subscription>> {
        let runtime = self.driver.runtime();
        let mut subs = Vec::new();
        for name in runtime.store.names().await? {
            let workflow = runtime.store.get(&name).await?;
            let evaluators = workflow.on.compile(&runtime.config.timezone)?;
            if !evaluators.is_empty() {
                subs.push(Subscription { workflow: name, evaluators });
            }
        }
        Ok(subs)
    }

    /// Run until the token fires. In-flight releases drain on shutdown.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        let subs = self.subscriptions().await?;
        if subs.is_empty() {
            tracing::info!("no workflows carry schedules, release scheduler idle");
            token.cancelled().await;
            return Ok(());
        }
        tracing::info!(workflows = subs.len(), "release scheduler started");

        let semaphore = Arc::new(Semaphore::new(self.pool));
        let mut released: HashSet<(String, DateTime<Utc>)> = HashSet::new();
        let mut inflight: JoinSet<()> = JoinSet::new();

        loop {
            // Cancellable wait up to the next minute boundary
            let now = Utc::now();
            let next_minute = truncate_minute(now) + ChronoDuration::minutes(1);
            let wait = (next_minute - now).to_std().unwrap_or_default();
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = token.cancelled() => break,
            }

            let tick = truncate_minute(Utc::now());
            for sub in &subs {
                for evaluator in &sub.evaluators {
                    if !evaluator.includes_minute(tick) {
                        continue;
                    }
                    // Dedup: two schedules colliding in the same minute
                    // release once
                    if !released.insert((sub.workflow.clone(), tick)) {
                        continue;
                    }
                    let driver = self.driver.clone();
                    let workflow = sub.workflow.clone();
                    let semaphore = semaphore.clone();
                    let timeout = driver.runtime().config.release_timeout;
                    inflight.spawn(async move {
                        let _permit = semaphore.acquire_owned().await.expect("semaphore open");
                        tracing::info!(workflow = %workflow, logical_date = %tick, "releasing");
                        let run =
                            driver.release(&workflow, tick, Map::new());
                        match tokio::time::timeout(timeout, run).await {
                            Ok(Ok(result)) => tracing::info!(
                                workflow = %workflow,
                                run_id = %result.run_id,
                                status = %result.status,
                                "release finished"
                            ),
                            Ok(Err(err)) => tracing::error!(
                                workflow = %workflow,
                                error = %err,
                                "release failed to start"
                            ),
                            Err(_) => tracing::error!(
                                workflow = %workflow,
                                "release exceeded the {timeout:?} release timeout"
                            ),
                        }
                    });
                }
            }

            // Reap finished releases without blocking the tick
            while inflight.try_join_next().is_some() {}
            let floor = tick - ChronoDuration::hours(DEDUP_RETENTION_HOURS);
            released.retain(|(_, minute)| *minute > floor);
        }

        tracing::info!("release scheduler stopping, draining in-flight releases");
        while inflight.join_next().await.is_some() {}
        Ok(())
    }
}
