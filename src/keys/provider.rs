// src/keys/provider.rs

use crate::error::Result;
use crate::keys::record::{BoundKey, KeyPatch, KeyView, Service};
use http::HeaderMap;
use secrecy::Secret;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Contract shared by every service's key provider.
///
/// The provider exclusively owns its key records; callers address records by
/// public hash and never hold a mutable reference. All methods are
/// non-blocking; the pool and pipeline call them from request tasks.
///
/// `update_rate_limits` is part of the universal contract: providers that do
/// not trust response headers inherit the no-op default, and the pool never
/// needs to know which concrete provider it is talking to.
pub trait KeyProvider: Send + Sync {
    fn service(&self) -> Service;

    /// Every key record with the secret redacted.
    fn list(&self) -> Vec<KeyView>;

    /// Select one key capable of serving `model`.
    ///
    /// # Errors
    ///
    /// Fails with `NoKeysAvailable` when the eligible subset is empty.
    fn get(&self, model: &str) -> Result<BoundKey>;

    /// Mark the named key disabled; idempotent.
    fn disable(&self, hash: &str);

    /// Merge a patch into the named key and stamp `last_checked`. The sole
    /// write path used by the background checker.
    fn update(&self, hash: &str, patch: KeyPatch);

    /// Count of non-disabled keys.
    fn available(&self) -> usize;

    /// `true` iff any non-disabled key has never been probed.
    fn any_unchecked(&self) -> bool;

    fn increment_prompt(&self, hash: &str);

    fn increment_usage(&self, hash: &str, model: &str, tokens: u64);

    /// Record a 429 event and arm a lockout.
    fn mark_rate_limited(&self, hash: &str);

    /// Time the queue should sleep before retrying `model`: zero when an
    /// eligible key is usable now, otherwise the smallest remaining window.
    fn get_lockout_period(&self, model: &str) -> Duration;

    /// Fraction of the configured pool still usable, in `[0, 1]`.
    fn remaining_quota(&self) -> f64;

    /// Human-readable aggregate spend estimate.
    fn usage_in_usd(&self) -> String;

    /// Harvest rate-limit hints from upstream response headers. Providers
    /// that do not trust headers keep the default no-op.
    fn update_rate_limits(&self, _hash: &str, _headers: &HeaderMap) {}

    /// Map a model id to the capability family used by selection.
    fn family_of(&self, model: &str) -> String;

    /// Families a key is assumed to have before (or without) a probe.
    fn default_families(&self) -> Vec<String>;

    /// Non-disabled credentials for the background checker.
    fn checkable_keys(&self) -> Vec<(String, Secret<String>)>;

    /// Woken whenever pool state changes in a way that could unblock a
    /// queued request.
    fn change_notifier(&self) -> Arc<Notify>;

    /// Upstream base URL for this service (configurable for tests).
    fn base_url(&self) -> &str;
}
