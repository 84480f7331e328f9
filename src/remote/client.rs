//! Remote reasoning client with verdict cache and single-flight calls
//!
//! - A fresh cache entry for the request fingerprint is returned without a call.
//! - Otherwise at most one call per fingerprint is in flight; later requests
//!   for the same fingerprint wait on that call's result.
//! - Calls run in their own task, so a waiter that gives up (the arbiter's
//!   tick deadline) does not cancel the call. A late success still lands in
//!   the cache for later ticks.
//! - Only successful verdicts are cached.
//!
//! The state lock is never held across an `.await`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::RemoteError;
use crate::remote::context::{fingerprint, ReasoningContext};
use crate::remote::keys::KeyProvider;
use crate::remote::provider::{ProviderRequest, ReasoningProvider};
use crate::remote::transport::Transport;
use crate::types::Decision;

type CallResult = Result<Decision, RemoteError>;
type CallReceiver = watch::Receiver<Option<CallResult>>;

/// Cached remote verdict
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub decision: Decision,
    pub expires_at: Instant,
}

impl CacheEntry {
    fn is_fresh(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

#[derive(Default)]
struct ClientState {
    cache: HashMap<String, CacheEntry>,
    in_flight: HashMap<String, CallReceiver>,
}

/// Remote reasoning client, shared by every tick of one session
pub struct RemoteReasoningClient {
    provider: Arc<dyn ReasoningProvider>,
    transport: Arc<dyn Transport>,
    keys: Arc<dyn KeyProvider>,
    cache_ttl: Duration,
    timeout: Duration,
    state: Arc<Mutex<ClientState>>,
    network_calls: Arc<AtomicU64>,
    token: CancellationToken,
}

impl std::fmt::Debug for RemoteReasoningClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteReasoningClient")
            .field("provider", &self.provider.id())
            .field("model", &self.provider.model())
            .field("cache_ttl", &self.cache_ttl)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RemoteReasoningClient {
    pub fn new(
        provider: Arc<dyn ReasoningProvider>,
        transport: Arc<dyn Transport>,
        keys: Arc<dyn KeyProvider>,
        cache_ttl: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            transport,
            keys,
            cache_ttl,
            timeout,
            state: Arc::new(Mutex::new(ClientState::default())),
            network_calls: Arc::new(AtomicU64::new(0)),
            token: CancellationToken::new(),
        }
    }

    /// Evaluate a context remotely, going through the cache and in-flight registry
    pub async fn evaluate(&self, context: &ReasoningContext) -> Result<Decision, RemoteError> {
        if self.token.is_cancelled() {
            return Err(RemoteError::Unavailable("session has ended".to_string()));
        }

        let bundle = context
            .bundle()
            .map_err(|e| RemoteError::Unavailable(format!("could not encode context: {}", e)))?;
        let fp = fingerprint(self.provider.id(), self.provider.model(), &bundle);

        let receiver = {
            let mut state = self.state.lock();
            let now = Instant::now();

            let cached = state
                .cache
                .get(&fp)
                .map(|entry| (entry.is_fresh(now), entry.decision.clone()));
            match cached {
                Some((true, decision)) => {
                    debug!(fingerprint = %short(&fp), "remote verdict cache hit");
                    return Ok(decision);
                }
                Some((false, _)) => {
                    state.cache.remove(&fp);
                }
                None => {}
            }

            if let Some(receiver) = state.in_flight.get(&fp) {
                debug!(fingerprint = %short(&fp), "joining in-flight remote call");
                receiver.clone()
            } else {
                let secret = self.keys.get(self.provider.id()).ok_or_else(|| {
                    RemoteError::Unavailable(format!(
                        "no credential for provider {}",
                        self.provider.id()
                    ))
                })?;
                let request = self.provider.build_request(&bundle, &secret);
                let (tx, receiver) = watch::channel(None);
                state.in_flight.insert(fp.clone(), receiver.clone());
                self.spawn_call(fp, request, tx);
                receiver
            }
        };

        wait_for(receiver).await
    }

    fn spawn_call(&self, fp: String, request: ProviderRequest, tx: watch::Sender<Option<CallResult>>) {
        let provider = Arc::clone(&self.provider);
        let transport = Arc::clone(&self.transport);
        let state = Arc::clone(&self.state);
        let network_calls = Arc::clone(&self.network_calls);
        let token = self.token.clone();
        let timeout = self.timeout;
        let ttl = self.cache_ttl;

        tokio::spawn(async move {
            network_calls.fetch_add(1, Ordering::SeqCst);
            debug!(fingerprint = %short(&fp), provider = %provider.id(), "issuing remote call");

            let outcome = tokio::select! {
                _ = token.cancelled() => None,
                res = tokio::time::timeout(timeout, transport.send(request)) => Some(match res {
                    Ok(Ok(body)) => provider.parse_response(&body).map(|v| v.into_decision()),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(RemoteError::Timeout(timeout)),
                }),
            };

            let mut guard = state.lock();
            guard.in_flight.remove(&fp);

            let Some(result) = outcome else {
                // Cancelled: drop the sender without a value, waiters see Unavailable
                debug!(fingerprint = %short(&fp), "remote call cancelled");
                return;
            };

            match &result {
                Ok(decision) if !token.is_cancelled() => {
                    guard.cache.insert(
                        fp.clone(),
                        CacheEntry {
                            decision: decision.clone(),
                            expires_at: Instant::now() + ttl,
                        },
                    );
                }
                Ok(_) => {}
                Err(e) => warn!(fingerprint = %short(&fp), error = %e, "remote call failed"),
            }
            drop(guard);

            let _ = tx.send(Some(result));
        });
    }

    /// Cancel every in-flight call and drop all cached verdicts.
    ///
    /// Called at session end; the client refuses further evaluations.
    pub fn shutdown(&self) {
        self.token.cancel();
        let mut state = self.state.lock();
        let cached = state.cache.len();
        let in_flight = state.in_flight.len();
        state.cache.clear();
        state.in_flight.clear();
        info!(cached, in_flight, "remote reasoning client shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Remove expired cache entries, returning how many were dropped
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();
        let before = state.cache.len();
        state.cache.retain(|_, entry| entry.is_fresh(now));
        before - state.cache.len()
    }

    pub fn cache_len(&self) -> usize {
        self.state.lock().cache.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Total outbound calls issued
    pub fn network_calls(&self) -> u64 {
        self.network_calls.load(Ordering::SeqCst)
    }

    pub fn provider(&self) -> &dyn ReasoningProvider {
        self.provider.as_ref()
    }
}

async fn wait_for(mut receiver: CallReceiver) -> CallResult {
    loop {
        let current = receiver.borrow_and_update().clone();
        if let Some(result) = current {
            return result;
        }
        if receiver.changed().await.is_err() {
            let last = receiver.borrow().clone();
            return last.unwrap_or_else(|| {
                Err(RemoteError::Unavailable("remote call cancelled".to_string()))
            });
        }
    }
}

fn short(fp: &str) -> &str {
    fp.get(..12).unwrap_or(fp)
}
