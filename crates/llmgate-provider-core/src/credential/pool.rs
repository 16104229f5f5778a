use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use rand::Rng;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::config::KeyLoadBalance;
use crate::events::{Event, ModelUnavailableStartEvent, OperationalEvent, UnavailableStartEvent};
use crate::{Credential, CredentialId, CredentialState, EventHub, UnavailableReason};

use super::model_unavailable_queue::ModelUnavailableQueue;
use super::unavailable_queue::UnavailableQueue;

type ModelStateKey = (CredentialId, String);
type ModelStateValue = (Instant, UnavailableReason);

#[derive(Debug, Clone)]
pub enum AcquireError {
    ProviderUnknown,
    NoActiveCredentials,
}

pub struct CredentialPool {
    creds: RwLock<HashMap<CredentialId, Credential>>,
    by_provider: RwLock<HashMap<String, Vec<CredentialId>>>,
    states: Arc<RwLock<HashMap<CredentialId, CredentialState>>>,
    model_states: Arc<RwLock<HashMap<ModelStateKey, ModelStateValue>>>,
    /// Last time each key failed (any reason), for the `least_recent_failure`
    /// rotation strategy. Absent means "never failed" and sorts first.
    last_failure: RwLock<HashMap<CredentialId, Instant>>,
    /// Round-robin cursor, one per provider/channel id.
    round_robin_cursor: RwLock<HashMap<String, AtomicUsize>>,
    events: EventHub,
    queue: Arc<UnavailableQueue>,
    model_queue: Arc<ModelUnavailableQueue>,
}

impl CredentialPool {
    pub fn new(events: EventHub) -> Self {
        let states = Arc::new(RwLock::new(HashMap::new()));
        let model_states = Arc::new(RwLock::new(HashMap::new()));
        let queue = Arc::new(UnavailableQueue::new());
        let model_queue = Arc::new(ModelUnavailableQueue::new());
        queue
            .clone()
            .spawn_recover_task(states.clone(), events.clone());
        model_queue
            .clone()
            .spawn_recover_task(model_states.clone(), events.clone());
        Self {
            creds: RwLock::new(HashMap::new()),
            by_provider: RwLock::new(HashMap::new()),
            states,
            model_states,
            last_failure: RwLock::new(HashMap::new()),
            round_robin_cursor: RwLock::new(HashMap::new()),
            events,
            queue,
            model_queue,
        }
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub async fn insert(&self, provider: impl Into<String>, id: CredentialId, cred: Credential) {
        let provider = provider.into();
        self.creds.write().await.insert(id, cred);
        // Avoid duplicated IDs in the provider index; insert() can be called on enable toggles.
        let mut by_provider = self.by_provider.write().await;
        let ids = by_provider.entry(provider).or_default();
        if !ids.contains(&id) {
            ids.push(id);
        }
        self.states
            .write()
            .await
            .entry(id)
            .or_insert(CredentialState::Active);
    }

    pub async fn update_credential(&self, id: CredentialId, cred: Credential) {
        self.creds.write().await.insert(id, cred);
    }

    pub async fn set_enabled(&self, provider: &str, id: CredentialId, enabled: bool) {
        if enabled {
            let mut by_provider = self.by_provider.write().await;
            let ids = by_provider.entry(provider.to_string()).or_default();
            if !ids.contains(&id) {
                ids.push(id);
            }
            drop(by_provider);

            // If the credential was never inserted before, keep state as Active.
            self.states
                .write()
                .await
                .entry(id)
                .or_insert(CredentialState::Active);
        } else {
            let mut by_provider = self.by_provider.write().await;
            if let Some(ids) = by_provider.get_mut(provider) {
                ids.retain(|x| *x != id);
            }
            let mut model_states = self.model_states.write().await;
            model_states.retain(|(cred_id, _), _| *cred_id != id);
        }
    }

    /// Orders a provider's usable key ids (not `Failed`) per `strategy`,
    /// non-deprioritized keys first, deprioritized ones appended at the end
    /// so they're still tried once everything else is exhausted.
    async fn ordered_candidates(&self, provider: &str, strategy: KeyLoadBalance) -> Vec<CredentialId> {
        let ids = {
            let guard = self.by_provider.read().await;
            guard.get(provider).cloned().unwrap_or_default()
        };
        let states = self.states.read().await;
        let now = Instant::now();

        let mut usable: Vec<CredentialId> = ids
            .iter()
            .copied()
            .filter(|id| !matches!(states.get(id), Some(CredentialState::Failed { .. })))
            .collect();
        drop(states);

        match strategy {
            KeyLoadBalance::Sequential => {}
            KeyLoadBalance::RoundRobin => {
                let cursor = self.round_robin_position(provider, usable.len()).await;
                usable.rotate_left(cursor);
            }
            KeyLoadBalance::Random => {
                let mut rng = rand::rng();
                for i in (1..usable.len()).rev() {
                    let j = rng.random_range(0..=i);
                    usable.swap(i, j);
                }
            }
            KeyLoadBalance::LeastRecentFailure => {
                let last_failure = self.last_failure.read().await;
                usable.sort_by_key(|id| last_failure.get(id).copied().unwrap_or(Instant::now() - Duration::from_secs(u32::MAX as u64)));
            }
        }

        // Within the ordering just applied, still try non-deprioritized keys
        // before deprioritized ones.
        let states = self.states.read().await;
        usable.sort_by_key(|id| !states.get(id).map(|s| s.is_usable(now)).unwrap_or(true));
        usable
    }

    async fn round_robin_position(&self, provider: &str, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        let guard = self.round_robin_cursor.read().await;
        if let Some(cursor) = guard.get(provider) {
            return cursor.fetch_add(1, Ordering::Relaxed) % len;
        }
        drop(guard);
        let mut guard = self.round_robin_cursor.write().await;
        let cursor = guard
            .entry(provider.to_string())
            .or_insert_with(|| AtomicUsize::new(0));
        cursor.fetch_add(1, Ordering::Relaxed) % len
    }

    pub async fn acquire(
        &self,
        provider: &str,
    ) -> Result<(CredentialId, Credential), AcquireError> {
        self.acquire_with_strategy(provider, KeyLoadBalance::Sequential)
            .await
    }

    pub async fn acquire_with_strategy(
        &self,
        provider: &str,
        strategy: KeyLoadBalance,
    ) -> Result<(CredentialId, Credential), AcquireError> {
        let has_provider = self.by_provider.read().await.contains_key(provider);
        if !has_provider {
            return Err(AcquireError::ProviderUnknown);
        }

        let candidates = self.ordered_candidates(provider, strategy).await;
        let Some(id) = candidates.into_iter().next() else {
            return Err(AcquireError::NoActiveCredentials);
        };
        let cred = self
            .creds
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(AcquireError::NoActiveCredentials)?;
        Ok((id, cred))
    }

    pub async fn acquire_for_model(
        &self,
        provider: &str,
        model: &str,
    ) -> Result<(CredentialId, Credential), AcquireError> {
        self.acquire_for_model_with_strategy(provider, model, KeyLoadBalance::Sequential)
            .await
    }

    pub async fn acquire_for_model_with_strategy(
        &self,
        provider: &str,
        model: &str,
        strategy: KeyLoadBalance,
    ) -> Result<(CredentialId, Credential), AcquireError> {
        let has_provider = self.by_provider.read().await.contains_key(provider);
        if !has_provider {
            return Err(AcquireError::ProviderUnknown);
        }

        let candidates = self.ordered_candidates(provider, strategy).await;
        let model_states = self.model_states.read().await;
        let now = Instant::now();
        let chosen = candidates.into_iter().find(|id| {
            let key = (*id, model.to_string());
            match model_states.get(&key) {
                Some((until, _reason)) => *until <= now,
                None => true,
            }
        });
        drop(model_states);

        let Some(id) = chosen else {
            return Err(AcquireError::NoActiveCredentials);
        };
        let cred = self
            .creds
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(AcquireError::NoActiveCredentials)?;
        Ok((id, cred))
    }

    /// Soft, TTL-bound cooldown. The key is still tried once every
    /// non-deprioritized key in the provider is exhausted.
    pub async fn mark_unavailable(
        &self,
        credential_id: CredentialId,
        duration: Duration,
        reason: UnavailableReason,
    ) {
        let until_instant = Instant::now() + duration;
        {
            let mut guard = self.states.write().await;
            guard.insert(
                credential_id,
                CredentialState::Deprioritized {
                    until: until_instant,
                    reason,
                },
            );
        }
        self.last_failure
            .write()
            .await
            .insert(credential_id, Instant::now());
        self.queue.push(until_instant, credential_id).await;

        let until_wall = SystemTime::now()
            .checked_add(duration)
            .unwrap_or_else(SystemTime::now);
        self.events
            .emit(Event::Operational(OperationalEvent::UnavailableStart(
                UnavailableStartEvent {
                    at: SystemTime::now(),
                    credential_id,
                    reason,
                    until: until_wall,
                },
            )))
            .await;
    }

    /// Persistent failure. The key stays excluded from scheduling until an
    /// operator calls `clear_failed`; there is no automatic recovery sweep.
    pub async fn mark_failed(&self, credential_id: CredentialId, reason: UnavailableReason) {
        self.states
            .write()
            .await
            .insert(credential_id, CredentialState::Failed { reason });
        self.last_failure
            .write()
            .await
            .insert(credential_id, Instant::now());

        self.events
            .emit(Event::Operational(OperationalEvent::UnavailableStart(
                UnavailableStartEvent {
                    at: SystemTime::now(),
                    credential_id,
                    reason,
                    // Persistent: no scheduled recovery, so this is advisory only.
                    until: SystemTime::now() + Duration::from_secs(365 * 24 * 60 * 60),
                },
            )))
            .await;
    }

    /// Admin action: clears a persistent failure and returns the key to
    /// `Active`. Has no effect on a merely deprioritized key (it will clear
    /// itself on schedule).
    pub async fn clear_failed(&self, credential_id: CredentialId) -> bool {
        let mut guard = self.states.write().await;
        match guard.get(&credential_id) {
            Some(CredentialState::Failed { .. }) => {
                guard.insert(credential_id, CredentialState::Active);
                true
            }
            _ => false,
        }
    }

    pub async fn mark_model_unavailable(
        &self,
        credential_id: CredentialId,
        model: impl Into<String>,
        duration: Duration,
        reason: UnavailableReason,
    ) {
        let model = model.into();
        let until_instant = Instant::now() + duration;
        {
            let mut guard = self.model_states.write().await;
            guard.insert((credential_id, model.clone()), (until_instant, reason));
        }
        self.model_queue
            .push(until_instant, credential_id, model.clone())
            .await;

        let until_wall = SystemTime::now()
            .checked_add(duration)
            .unwrap_or_else(SystemTime::now);
        self.events
            .emit(Event::Operational(OperationalEvent::ModelUnavailableStart(
                ModelUnavailableStartEvent {
                    at: SystemTime::now(),
                    credential_id,
                    model,
                    reason,
                    until: until_wall,
                },
            )))
            .await;
    }

    pub async fn state(&self, credential_id: CredentialId) -> Option<CredentialState> {
        self.states.read().await.get(&credential_id).cloned()
    }

    pub async fn model_states(
        &self,
        credential_id: CredentialId,
    ) -> Vec<(String, Instant, UnavailableReason)> {
        let now = Instant::now();
        let guard = self.model_states.read().await;
        let mut rows = Vec::new();
        for ((id, model), (until, reason)) in guard.iter() {
            if *id != credential_id {
                continue;
            }
            if *until <= now {
                continue;
            }
            rows.push((model.clone(), *until, *reason));
        }
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cred() -> Credential {
        Credential::ApiKey(crate::ApiKeyCredential {
            api_key: "sk-test".into(),
        })
    }

    #[tokio::test]
    async fn round_robin_rotates_through_keys() {
        let pool = CredentialPool::new(EventHub::new(16));
        pool.insert("c1", 1, cred()).await;
        pool.insert("c1", 2, cred()).await;
        pool.insert("c1", 3, cred()).await;

        let mut seen = Vec::new();
        for _ in 0..3 {
            let (id, _) = pool
                .acquire_with_strategy("c1", KeyLoadBalance::RoundRobin)
                .await
                .unwrap();
            seen.push(id);
        }
        // Every key should appear exactly once across a full cycle.
        seen.sort();
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn deprioritized_key_falls_back_only_when_exhausted() {
        let pool = CredentialPool::new(EventHub::new(16));
        pool.insert("c1", 1, cred()).await;
        pool.insert("c1", 2, cred()).await;

        pool.mark_unavailable(1, Duration::from_secs(60), UnavailableReason::RateLimit)
            .await;

        let (id, _) = pool
            .acquire_with_strategy("c1", KeyLoadBalance::Sequential)
            .await
            .unwrap();
        assert_eq!(id, 2);
    }

    #[tokio::test]
    async fn failed_key_never_returned_until_cleared() {
        let pool = CredentialPool::new(EventHub::new(16));
        pool.insert("c1", 1, cred()).await;

        pool.mark_failed(1, UnavailableReason::AuthInvalid).await;
        assert!(
            pool.acquire_with_strategy("c1", KeyLoadBalance::Sequential)
                .await
                .is_err()
        );

        assert!(pool.clear_failed(1).await);
        let (id, _) = pool
            .acquire_with_strategy("c1", KeyLoadBalance::Sequential)
            .await
            .unwrap();
        assert_eq!(id, 1);
    }

    #[tokio::test]
    async fn least_recent_failure_prefers_the_longest_idle_key() {
        let pool = CredentialPool::new(EventHub::new(16));
        pool.insert("c1", 1, cred()).await;
        pool.insert("c1", 2, cred()).await;

        // Key 1 failed (and recovered) more recently than key 2, which has
        // never failed, so key 2 should be preferred.
        pool.mark_unavailable(1, Duration::from_millis(1), UnavailableReason::Timeout)
            .await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        let (id, _) = pool
            .acquire_with_strategy("c1", KeyLoadBalance::LeastRecentFailure)
            .await
            .unwrap();
        assert_eq!(id, 2);
    }
}
