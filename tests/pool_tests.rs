// tests/pool_tests.rs
//
// Pool invariants and selection laws exercised through the public provider
// and pool APIs.

use llm_key_proxy::config::{AppConfig, ServiceConfig};
use llm_key_proxy::keys::pool::KeyPool;
use llm_key_proxy::keys::provider::KeyProvider;
use llm_key_proxy::keys::record::{KeyPatch, Service};
use std::collections::HashSet;
use std::time::Duration;

fn pool(openai_keys: &[&str], anthropic_keys: &[&str]) -> KeyPool {
    let mut config = AppConfig::default();
    config.services.openai = ServiceConfig {
        keys: openai_keys.iter().map(|k| k.to_string()).collect(),
        ..ServiceConfig::default()
    };
    config.services.anthropic = ServiceConfig {
        keys: anthropic_keys.iter().map(|k| k.to_string()).collect(),
        ..ServiceConfig::default()
    };
    KeyPool::new(&config)
}

#[test]
fn hashes_are_unique_within_a_provider() {
    // I1, including the duplicate-secret case.
    let pool = pool(&["k1", "k2", "k1", "k3"], &[]);
    let hashes: HashSet<String> = pool.list().into_iter().map(|v| v.hash).collect();
    assert_eq!(hashes.len(), 3);
}

#[test]
fn available_counts_non_disabled_records() {
    // I4.
    let pool = pool(&["k1", "k2", "k3"], &[]);
    let provider = pool.provider(Service::OpenAi).unwrap();
    assert_eq!(provider.available(), 3);
    let hash = provider.list()[0].hash.clone();
    provider.disable(&hash);
    assert_eq!(provider.available(), 2);
    // Idempotent.
    provider.disable(&hash);
    assert_eq!(provider.available(), 2);
}

#[test]
fn revoked_keys_stay_disabled() {
    // I3: is_revoked implies is_disabled, and revocation is terminal.
    let pool = pool(&["k1"], &[]);
    let provider = pool.provider(Service::OpenAi).unwrap();
    let hash = provider.list()[0].hash.clone();
    provider.update(&hash, KeyPatch::revoke());
    let view = &provider.list()[0];
    assert!(view.is_revoked && view.is_disabled);
    provider.update(
        &hash,
        KeyPatch {
            disabled: Some(false),
            ..KeyPatch::default()
        },
    );
    assert!(provider.list()[0].is_disabled);
}

#[test]
fn selection_never_returns_disabled_or_wrong_family_keys() {
    // I5 over a mixed pool.
    let pool = pool(&["k1", "k2"], &[]);
    let provider = pool.provider(Service::OpenAi).unwrap();
    let hashes: Vec<String> = provider.list().iter().map(|v| v.hash.clone()).collect();
    // k1 loses the gpt-4 family; k2 is disabled entirely.
    provider.update(&hashes[0], KeyPatch::families(vec!["gpt-3.5-turbo".to_string()]));
    provider.update(
        &hashes[1],
        KeyPatch {
            disabled: Some(true),
            ..KeyPatch::default()
        },
    );
    assert!(provider.get("gpt-4").is_err());
    let bound = provider.get("gpt-3.5-turbo").unwrap();
    assert_eq!(bound.hash, hashes[0]);
}

#[test]
fn locked_out_keys_rank_below_fresh_keys() {
    // L1.
    let pool = pool(&["k1", "k2"], &[]);
    let provider = pool.provider(Service::OpenAi).unwrap();
    let first = provider.get("gpt-4").unwrap();
    provider.mark_rate_limited(&first.hash);
    let second = provider.get("gpt-4").unwrap();
    assert_ne!(second.hash, first.hash);
}

#[test]
fn least_recently_used_wins() {
    // L2/L3: a burst of selections rotates over the pool.
    let pool = pool(&["k1", "k2", "k3"], &[]);
    let provider = pool.provider(Service::OpenAi).unwrap();
    let mut seen = HashSet::new();
    for _ in 0..3 {
        seen.insert(provider.get("gpt-4").unwrap().hash);
    }
    assert_eq!(seen.len(), 3, "burst selection must rotate across all keys");
}

#[test]
fn lockout_period_is_zero_with_usable_keys_and_positive_without() {
    let pool = pool(&["k1"], &[]);
    let provider = pool.provider(Service::OpenAi).unwrap();
    assert_eq!(provider.get_lockout_period("gpt-4"), Duration::ZERO);

    let bound = provider.get("gpt-4").unwrap();
    provider.mark_rate_limited(&bound.hash);
    let wait = provider.get_lockout_period("gpt-4");
    assert!(wait > Duration::ZERO);
    assert!(wait <= Duration::from_millis(2000));
}

#[test]
fn pool_routes_accounting_to_the_owning_provider() {
    let pool = pool(&["k-openai"], &["k-anthropic"]);
    let bound = pool.get("claude-2").unwrap();
    pool.increment_prompt(&bound);
    pool.increment_usage(&bound, "claude-2", 42);

    let anthropic = pool.provider(Service::Anthropic).unwrap();
    let view = &anthropic.list()[0];
    assert_eq!(view.prompt_count, 1);
    assert_eq!(view.total_tokens, 42);

    let openai = pool.provider(Service::OpenAi).unwrap();
    assert_eq!(openai.list()[0].prompt_count, 0);
}

#[test]
fn remaining_quota_tracks_disabled_fraction() {
    let pool = pool(&["k1", "k2", "k3", "k4"], &[]);
    let provider = pool.provider(Service::OpenAi).unwrap();
    assert!((provider.remaining_quota() - 1.0).abs() < f64::EPSILON);
    let hash = provider.list()[0].hash.clone();
    provider.update(&hash, KeyPatch::revoke());
    assert!((provider.remaining_quota() - 0.75).abs() < 1e-9);
}
