//! Fan-out of one per-host operation across many hosts.
//!
//! A fixed pool of workers pulls `(slot, host)` jobs from a channel. Each
//! operation runs in its own task, so a panic is contained to its slot.
//! Results are written back by slot, which restores input order no matter
//! which host finishes first.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, warn};

use crate::config::DEFAULT_POOL_WIDTH;
use crate::host::HostTarget;

#[derive(Debug, Clone)]
pub struct ConcurrentStatusAggregator {
    width: usize,
}

impl Default for ConcurrentStatusAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_WIDTH)
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "operation panicked".to_string()
    }
}

impl ConcurrentStatusAggregator {
    pub fn new(width: usize) -> Self {
        Self {
            width: width.max(1),
        }
    }

    /// Runs `op` once per entry of `hosts`, at most `min(width, hosts.len())`
    /// at a time. Returns exactly one result per entry, in input order.
    /// A host whose operation panics or vanishes gets `on_fault(host, message)`.
    pub async fn aggregate<R, F, Fut, E>(&self, hosts: &[HostTarget], op: F, on_fault: E) -> Vec<R>
    where
        R: Send + 'static,
        F: Fn(HostTarget) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        E: Fn(&HostTarget, String) -> R,
    {
        if hosts.is_empty() {
            return vec![];
        }
        let width = self.width.min(hosts.len());
        debug!("fanning out to {} hosts with {} workers", hosts.len(), width);

        // Job queue holds every host up front; workers drain it.
        let (job_tx, job_rx) = flume::unbounded::<(usize, HostTarget)>();
        for job in hosts.iter().cloned().enumerate() {
            // Cannot fail: `job_rx` is alive.
            let _ = job_tx.send(job);
        }
        drop(job_tx);

        let (result_tx, result_rx) = flume::unbounded::<(usize, Result<R, String>)>();
        let op = Arc::new(op);
        let mut workers = Vec::with_capacity(width);
        for _ in 0..width {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            let op = Arc::clone(&op);
            workers.push(tokio::spawn(async move {
                while let Ok((slot, host)) = job_rx.recv_async().await {
                    let op = Arc::clone(&op);
                    let outcome = tokio::spawn(async move { op(host).await })
                        .await
                        .map_err(|e| match e.try_into_panic() {
                            Ok(payload) => format!("error: {}", panic_message(payload)),
                            Err(e) => format!("error: {}", e),
                        });
                    if result_tx.send_async((slot, outcome)).await.is_err() {
                        break;
                    }
                }
            }));
        }
        drop(result_tx);

        let mut slots: Vec<Option<Result<R, String>>> = hosts.iter().map(|_| None).collect();
        while let Ok((slot, outcome)) = result_rx.recv_async().await {
            slots[slot] = Some(outcome);
        }
        join_all(workers).await;

        slots
            .into_iter()
            .zip(hosts)
            .map(|(slot, host)| match slot {
                Some(Ok(result)) => result,
                Some(Err(message)) => {
                    warn!("{} operation faulted: {}", host, message);
                    on_fault(host, message)
                }
                None => on_fault(host, "missing".to_string()),
            })
            .collect()
    }
}
