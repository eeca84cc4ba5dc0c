//! Pluggable pre-auth fraud screening
//!
//! The server consults a [`FraudPredicate`] before accepting a control
//! channel or dispatching a public HTTP request. The real implementation is
//! an external API client; the core only depends on this trait and ships an
//! allow-everything default plus a TTL cache wrapper.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Screening outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny(String),
}

impl Verdict {
    pub fn is_allow(&self) -> bool {
        matches!(self, Verdict::Allow)
    }
}

/// Pre-auth predicate over the client address and user agent.
#[async_trait]
pub trait FraudPredicate: Send + Sync {
    async fn verify(&self, ip: &str, user_agent: &str) -> Verdict;
}

/// Default predicate: everything passes.
pub struct AllowAllPredicate;

#[async_trait]
impl FraudPredicate for AllowAllPredicate {
    async fn verify(&self, _ip: &str, _user_agent: &str) -> Verdict {
        Verdict::Allow
    }
}

#[async_trait]
impl FraudPredicate for std::sync::Arc<dyn FraudPredicate> {
    async fn verify(&self, ip: &str, user_agent: &str) -> Verdict {
        (**self).verify(ip, user_agent).await
    }
}

/// Caches verdicts per IP for a TTL so a chatty client costs one upstream
/// lookup instead of one per request.
pub struct CachedPredicate<P> {
    inner: P,
    ttl: Duration,
    cache: DashMap<String, (Instant, Verdict)>,
}

impl<P: FraudPredicate> CachedPredicate<P> {
    pub fn new(inner: P, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: DashMap::new(),
        }
    }
}

#[async_trait]
impl<P: FraudPredicate> FraudPredicate for CachedPredicate<P> {
    async fn verify(&self, ip: &str, user_agent: &str) -> Verdict {
        if let Some(entry) = self.cache.get(ip) {
            let (cached_at, verdict) = entry.value();
            if cached_at.elapsed() < self.ttl {
                return verdict.clone();
            }
        }

        let verdict = self.inner.verify(ip, user_agent).await;
        self.cache
            .insert(ip.to_string(), (Instant::now(), verdict.clone()));
        verdict
    }
}
