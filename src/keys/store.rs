// src/keys/store.rs

use crate::error::{AppError, Result};
use crate::keys::record::{BoundKey, KeyPatch, KeyRecord, KeyView, Service, ServiceExtra};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Pacing knobs for one service's store.
#[derive(Debug, Clone)]
pub struct StoreTuning {
    /// Window after a 429 during which a key ranks below non-limited keys.
    pub rate_limit_lockout: Duration,
    /// Post-selection throttle arming `rate_limited_until`.
    pub key_reuse_delay: Duration,
    /// OpenAI-style keys whose header-reported remaining requests fall below
    /// this floor are treated as currently locked out.
    pub remaining_requests_floor: u64,
}

impl Default for StoreTuning {
    fn default() -> Self {
        Self {
            rate_limit_lockout: Duration::from_millis(2000),
            key_reuse_delay: Duration::from_millis(500),
            remaining_requests_floor: 1,
        }
    }
}

/// The mutable key list of one provider, guarded by a single lock.
///
/// The provider owning this store is the sole writer; every external caller
/// addresses records by hash and passes patches. Operations are O(n) over a
/// short list and never block on I/O.
pub struct KeyStore {
    service: Service,
    records: Mutex<Vec<KeyRecord>>,
    /// Woken on any state change that could unblock a queued request.
    notify: Arc<Notify>,
    tuning: StoreTuning,
}

impl KeyStore {
    pub fn new(
        service: Service,
        secrets: Vec<String>,
        default_families: &[&str],
        tuning: StoreTuning,
    ) -> Self {
        let mut seen: HashSet<String> = HashSet::new();
        let mut records = Vec::new();
        for secret in secrets {
            let secret = secret.trim().to_string();
            if secret.is_empty() {
                continue;
            }
            if !seen.insert(secret.clone()) {
                warn!(service = %service, "Skipping duplicate API key in configuration");
                continue;
            }
            records.push(KeyRecord::new(service, secret, default_families));
        }
        info!(
            service = %service,
            key_count = records.len(),
            "Initialized key store"
        );
        Self {
            service,
            records: Mutex::new(records),
            notify: Arc::new(Notify::new()),
            tuning,
        }
    }

    pub fn service(&self) -> Service {
        self.service
    }

    pub fn change_notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }

    /// Whether a record is currently locked out for selection purposes.
    fn is_locked_out(&self, record: &KeyRecord, now: Instant) -> bool {
        if let Some(at) = record.rate_limited_at {
            if now.saturating_duration_since(at) < self.tuning.rate_limit_lockout {
                return true;
            }
        }
        // Header-derived exhaustion counts as a lockout even without a 429.
        if let ServiceExtra::OpenAi {
            remaining_requests: Some(remaining),
            ..
        } = &record.extra
        {
            if *remaining < self.tuning.remaining_requests_floor {
                return true;
            }
        }
        false
    }

    fn is_eligible(record: &KeyRecord, family: &str) -> bool {
        !record.is_disabled && record.model_families.contains(family)
    }

    /// Select a key for `family` at `now`.
    ///
    /// Ordering, strictly decreasing priority: not locked out beats locked
    /// out; among locked-out keys the earlier `rate_limited_at` wins (its
    /// lockout clears first); otherwise least-recently-used wins. Ties are
    /// broken by stable configuration order.
    pub(crate) fn select_at(&self, family: &str, now: Instant) -> Result<BoundKey> {
        let mut records = self.lock_records();

        let mut best: Option<usize> = None;
        for (idx, record) in records.iter().enumerate() {
            if !Self::is_eligible(record, family) {
                continue;
            }
            best = Some(match best {
                None => idx,
                Some(current) => {
                    if self.ranks_higher(record, &records[current], now) {
                        idx
                    } else {
                        current
                    }
                }
            });
        }

        let idx = best.ok_or_else(|| AppError::NoKeysAvailable {
            service: self.service.to_string(),
        })?;

        let record = &mut records[idx];
        record.last_used = Some(now);
        // Reuse throttle: keep the key out of lockout-period math for a short
        // window so a burst cannot pin a single key before feedback arrives.
        let throttle_until = now + self.tuning.key_reuse_delay;
        record.rate_limited_until = Some(match record.rate_limited_until {
            Some(until) if until > throttle_until => until,
            _ => throttle_until,
        });

        debug!(
            service = %self.service,
            key.hash = %record.hash,
            family = family,
            "Selected key"
        );
        Ok(BoundKey {
            hash: record.hash.clone(),
            service: record.service,
            secret: record.key.clone(),
        })
    }

    /// `true` when `a` ranks strictly higher than `b` in the selection order.
    fn ranks_higher(&self, a: &KeyRecord, b: &KeyRecord, now: Instant) -> bool {
        let a_locked = self.is_locked_out(a, now);
        let b_locked = self.is_locked_out(b, now);
        if a_locked != b_locked {
            return !a_locked;
        }
        if a_locked && b_locked {
            // The oldest lockout clears first.
            return match (a.rate_limited_at, b.rate_limited_at) {
                (Some(ta), Some(tb)) => ta < tb,
                (None, Some(_)) => true,
                _ => false,
            };
        }
        match (a.last_used, b.last_used) {
            (None, Some(_)) => true,
            (Some(ta), Some(tb)) => ta < tb,
            _ => false,
        }
    }

    pub fn select(&self, family: &str) -> Result<BoundKey> {
        self.select_at(family, Instant::now())
    }

    /// Time the queue should sleep before a key for `family` becomes usable:
    /// zero when any eligible key is usable now, otherwise the smallest
    /// remaining lockout window.
    pub(crate) fn lockout_period_at(&self, family: &str, now: Instant) -> Duration {
        let records = self.lock_records();
        let mut min_wait: Option<Duration> = None;
        let mut any_eligible = false;

        for record in records.iter().filter(|r| Self::is_eligible(r, family)) {
            any_eligible = true;
            let window = record
                .rate_limited_until
                .map(|until| until.saturating_duration_since(now))
                .unwrap_or(Duration::ZERO);
            if window.is_zero() && !self.is_locked_out(record, now) {
                return Duration::ZERO;
            }
            let wait = if window.is_zero() {
                // Locked out without a window (header floor): re-evaluate
                // after one full lockout.
                self.tuning.rate_limit_lockout
            } else {
                window
            };
            min_wait = Some(match min_wait {
                Some(current) if current < wait => current,
                _ => wait,
            });
        }

        if !any_eligible {
            // Not a transient condition; selection will fail immediately with
            // NoKeysAvailable and the caller surfaces that.
            return Duration::ZERO;
        }
        min_wait.unwrap_or(Duration::ZERO)
    }

    pub fn lockout_period(&self, family: &str) -> Duration {
        self.lockout_period_at(family, Instant::now())
    }

    /// Record a 429 from upstream: stamp the event and arm the lockout.
    /// Idempotent under duplicate signals.
    pub fn mark_rate_limited(&self, hash: &str) {
        self.mark_rate_limited_at(hash, Instant::now());
    }

    pub(crate) fn mark_rate_limited_at(&self, hash: &str, now: Instant) {
        let mut records = self.lock_records();
        if let Some(record) = records.iter_mut().find(|r| r.hash == hash) {
            record.rate_limited_at = Some(now);
            let until = now + self.tuning.rate_limit_lockout;
            record.rate_limited_until = Some(match record.rate_limited_until {
                Some(existing) if existing > until => existing,
                _ => until,
            });
            warn!(service = %self.service, key.hash = %hash, "Key rate-limited by upstream");
        }
        drop(records);
        self.notify.notify_waiters();
    }

    /// Disable the named key; idempotent.
    pub fn disable(&self, hash: &str) {
        {
            let mut records = self.lock_records();
            if let Some(record) = records.iter_mut().find(|r| r.hash == hash) {
                if !record.is_disabled {
                    record.is_disabled = true;
                    warn!(service = %self.service, key.hash = %hash, "Key disabled");
                }
            }
        }
        self.notify.notify_waiters();
    }

    /// Merge a patch into the named record and stamp `last_checked`.
    pub fn update(&self, hash: &str, patch: KeyPatch) {
        {
            let mut records = self.lock_records();
            let Some(record) = records.iter_mut().find(|r| r.hash == hash) else {
                warn!(service = %self.service, key.hash = %hash, "Update for unknown key hash");
                return;
            };
            if let Some(families) = patch.model_families {
                record.model_families = families;
            }
            if let Some(revoked) = patch.revoked {
                record.is_revoked = revoked;
                if revoked {
                    record.is_disabled = true;
                }
            }
            if let Some(disabled) = patch.disabled {
                // Revocation is terminal; a revoked key cannot be re-enabled.
                record.is_disabled = disabled || record.is_revoked;
            }
            match (&mut record.extra, patch.tier, patch.model_ids) {
                (ServiceExtra::Anthropic { tier }, Some(new_tier), _) => *tier = Some(new_tier),
                (ServiceExtra::GoogleAi { model_ids }, _, Some(ids)) => *model_ids = ids,
                _ => {}
            }
            record.last_checked = Some(Instant::now());
        }
        self.notify.notify_waiters();
    }

    pub fn increment_prompt(&self, hash: &str) {
        let mut records = self.lock_records();
        if let Some(record) = records.iter_mut().find(|r| r.hash == hash) {
            record.prompt_count += 1;
        }
    }

    pub fn increment_usage(&self, hash: &str, family: &str, tokens: u64) {
        let mut records = self.lock_records();
        if let Some(record) = records.iter_mut().find(|r| r.hash == hash) {
            *record.token_counts.entry(family.to_string()).or_insert(0) += tokens;
        }
    }

    /// Count of non-disabled keys.
    pub fn available(&self) -> usize {
        self.lock_records().iter().filter(|r| !r.is_disabled).count()
    }

    /// `true` iff any non-disabled key has never been probed.
    pub fn any_unchecked(&self) -> bool {
        self.lock_records()
            .iter()
            .any(|r| !r.is_disabled && r.last_checked.is_none())
    }

    pub fn views(&self) -> Vec<KeyView> {
        let now = Instant::now();
        self.lock_records().iter().map(|r| KeyView::of(r, now)).collect()
    }

    /// Non-disabled credentials for the background checker.
    pub fn checkable(&self) -> Vec<(String, secrecy::Secret<String>)> {
        self.lock_records()
            .iter()
            .filter(|r| !r.is_disabled)
            .map(|r| (r.hash.clone(), r.key.clone()))
            .collect()
    }

    /// Fraction of the configured pool that is still usable.
    pub fn remaining_quota(&self) -> f64 {
        let records = self.lock_records();
        if records.is_empty() {
            return 0.0;
        }
        records.iter().filter(|r| !r.is_disabled).count() as f64 / records.len() as f64
    }

    /// Run `f` against the named record under the store lock.
    pub(crate) fn with_record<R>(
        &self,
        hash: &str,
        f: impl FnOnce(&mut KeyRecord) -> R,
    ) -> Option<R> {
        let mut records = self.lock_records();
        records.iter_mut().find(|r| r.hash == hash).map(f)
    }

    /// Sum a value over all records.
    pub(crate) fn fold<A>(&self, init: A, f: impl FnMut(A, &KeyRecord) -> A) -> A {
        self.lock_records().iter().fold(init, f)
    }

    fn lock_records(&self) -> std::sync::MutexGuard<'_, Vec<KeyRecord>> {
        // Lock poisoning only happens if a holder panicked; the records are
        // still structurally valid, so recover the guard.
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}
