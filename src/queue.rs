// src/queue.rs
//
// One FIFO waiting line per service. A scheduler task per queue wakes on new
// enqueues, pool change notifications, and lockout ticks; it admits the
// head-of-line waiter once the pool reports a usable key and the concurrency
// gate has room. The queue talks to the pool only through
// `get_lockout_period`/`get` and the change notifier, never through shared
// mutable state.

use crate::error::{AppError, Result};
use crate::keys::pool::KeyPool;
use crate::keys::record::{BoundKey, Service};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// Idle scheduler fallback; enqueues and pool changes wake it earlier.
const IDLE_TICK: Duration = Duration::from_secs(60);

/// Re-check interval while waiting for the checker's first verdicts.
const GRACE_TICK: Duration = Duration::from_millis(250);

/// Poll interval when the concurrency gate is saturated.
const PERMIT_TICK: Duration = Duration::from_millis(50);

/// A successful admission: the bound key plus the concurrency permit that is
/// held for the duration of the upstream dispatch.
#[derive(Debug)]
pub struct Admission {
    pub key: BoundKey,
    pub permit: OwnedSemaphorePermit,
}

struct Waiter {
    model: String,
    tx: oneshot::Sender<Result<Admission>>,
    enqueued_at: Instant,
}

struct QueueInner {
    service: Service,
    pool: Arc<KeyPool>,
    waiters: Mutex<VecDeque<Waiter>>,
    wake: Notify,
    gate: Arc<Semaphore>,
    unchecked_grace: Duration,
}

impl QueueInner {
    fn lock_waiters(&self) -> std::sync::MutexGuard<'_, VecDeque<Waiter>> {
        self.waiters.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// The per-service queue handle.
#[derive(Clone)]
pub struct ServiceQueue {
    inner: Arc<QueueInner>,
}

impl ServiceQueue {
    pub fn new(service: Service, pool: Arc<KeyPool>, unchecked_grace: Duration) -> Self {
        // Soft cap on concurrent upstream requests: one in-flight request per
        // non-disabled key.
        let permits = pool.available(service).max(1);
        let inner = Arc::new(QueueInner {
            service,
            pool,
            waiters: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            gate: Arc::new(Semaphore::new(permits)),
            unchecked_grace,
        });
        let queue = Self { inner };
        queue.spawn_scheduler();
        queue
    }

    /// Join the line. The returned future resolves once a key is bound for
    /// this request; dropping it (client disconnect) withdraws the waiter.
    pub fn enqueue(&self, model: &str) -> oneshot::Receiver<Result<Admission>> {
        let (tx, rx) = oneshot::channel();
        {
            let mut waiters = self.inner.lock_waiters();
            waiters.push_back(Waiter {
                model: model.to_string(),
                tx,
                enqueued_at: Instant::now(),
            });
        }
        self.inner.wake.notify_one();
        rx
    }

    /// Enqueue and wait for admission.
    pub async fn admit(&self, model: &str) -> Result<Admission> {
        self.enqueue(model)
            .await
            .map_err(|_| AppError::internal("queue scheduler dropped a waiter"))?
    }

    pub fn depth(&self) -> usize {
        self.inner.lock_waiters().len()
    }

    fn spawn_scheduler(&self) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let pool_changes = inner
                .pool
                .provider(inner.service)
                .map(|p| p.change_notifier());
            loop {
                let hint = dispatch_ready(&inner);
                match pool_changes.as_ref() {
                    Some(notify) => {
                        tokio::select! {
                            _ = inner.wake.notified() => {}
                            _ = notify.notified() => {}
                            _ = tokio::time::sleep(hint) => {}
                        }
                    }
                    None => {
                        tokio::select! {
                            _ = inner.wake.notified() => {}
                            _ = tokio::time::sleep(hint) => {}
                        }
                    }
                }
            }
        });
    }
}

/// One scheduling pass: admit head-of-line waiters while the pool has usable
/// keys, and return how long to sleep before the next pass.
fn dispatch_ready(inner: &QueueInner) -> Duration {
    loop {
        let (head_model, head_age) = {
            let mut waiters = inner.lock_waiters();
            // Discard waiters whose client is already gone so no key ever
            // gets bound on their behalf.
            waiters.retain(|w| !w.tx.is_closed());
            match waiters.front() {
                Some(w) => (w.model.clone(), w.enqueued_at.elapsed()),
                None => return IDLE_TICK,
            }
        };

        // Stall guard: with zero usable keys there is nothing to wait for,
        // unless the checker has not yet delivered a first verdict.
        if inner.pool.available(inner.service) == 0 {
            if inner.pool.any_unchecked(inner.service) && head_age < inner.unchecked_grace {
                return GRACE_TICK;
            }
            drain_all(inner);
            continue;
        }

        let lockout = inner.pool.get_lockout_period(inner.service, &head_model);
        if !lockout.is_zero() {
            debug!(
                service = %inner.service,
                wait_ms = lockout.as_millis() as u64,
                "Head-of-line waiter is locked out"
            );
            return lockout.min(IDLE_TICK);
        }

        let Ok(permit) = Arc::clone(&inner.gate).try_acquire_owned() else {
            return PERMIT_TICK;
        };

        // Bind at the latest possible moment: key selection happens only
        // when the waiter is actually leaving the line.
        let outcome = inner.pool.get(&head_model);
        let waiter = {
            let mut waiters = inner.lock_waiters();
            match waiters.pop_front() {
                Some(w) => w,
                None => continue,
            }
        };

        match outcome {
            Ok(key) => {
                let admission = Admission { key, permit };
                if waiter.tx.send(Ok(admission)).is_err() {
                    // Client went away while queued; the key keeps its reuse
                    // throttle and is never charged.
                    debug!(service = %inner.service, "Waiter cancelled before dispatch");
                }
            }
            Err(err) => {
                // Pool failures that are not transient lockouts are not
                // retried from the queue.
                let _ = waiter.tx.send(Err(err));
            }
        }
    }
}

fn drain_all(inner: &QueueInner) {
    let drained: Vec<Waiter> = {
        let mut waiters = inner.lock_waiters();
        waiters.drain(..).collect()
    };
    if drained.is_empty() {
        return;
    }
    warn!(
        service = %inner.service,
        count = drained.len(),
        "No usable keys; draining queue"
    );
    crate::metrics::METRICS.queue_drains_total.increment(1);
    for waiter in drained {
        let _ = waiter.tx.send(Err(AppError::NoKeysAvailable {
            service: inner.service.to_string(),
        }));
    }
}

/// All per-service queues, one per configured provider.
pub struct RequestQueues {
    queues: Vec<(Service, ServiceQueue)>,
}

impl RequestQueues {
    pub fn new(pool: &Arc<KeyPool>, unchecked_grace: Duration) -> Self {
        let queues = pool
            .services()
            .into_iter()
            .map(|service| {
                (
                    service,
                    ServiceQueue::new(service, Arc::clone(pool), unchecked_grace),
                )
            })
            .collect();
        Self { queues }
    }

    pub fn queue(&self, service: Service) -> Option<&ServiceQueue> {
        self.queues
            .iter()
            .find(|(s, _)| *s == service)
            .map(|(_, q)| q)
    }

    /// Wait in line for `service` and come back with a bound key.
    pub async fn admit(&self, service: Service, model: &str) -> Result<Admission> {
        match self.queue(service) {
            Some(queue) => queue.admit(model).await,
            None => Err(AppError::NoKeysAvailable {
                service: service.to_string(),
            }),
        }
    }

    pub fn total_depth(&self) -> usize {
        self.queues.iter().map(|(_, q)| q.depth()).sum()
    }
}
