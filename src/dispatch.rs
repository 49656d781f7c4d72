//! Notification dispatch loop.
//!
//! # Loop
//!
//! ```text
//! ┌─▶ wait(delay) ──cancelled──▶ Ok(())
//! │      │
//! │   poll gateway ──error/timeout──▶ Err(GatewayPollFailure)
//! │      │
//! │   for each id: resolve → users (none: skip)
//! │      │
//! │   send ──InvalidToken──▶ delete user, continue
//! │      │ ──other error/timeout──▶ Err(ProviderOtherFailure)
//! └──────┘
//! ```
//!
//! Gateway ids that parse as a decimal `i64` are ephemeral ids and resolve
//! through the live epoch records to every owner of the identity. Anything
//! else is looked up directly as a key fingerprint. A hex fingerprint is
//! 64 characters long and can never parse as an `i64`.
//!
//! Within one batch each device is notified at most once.

use std::collections::HashSet;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::clock::SharedClock;
use crate::gateway::{GatewayError, SharedGateway};
use crate::notifications::{Notification, PushError, SharedPushProvider};
use crate::storage::{EphemeralId, Fingerprint, SharedStorage, StorageError, User};

/// Why the dispatch loop stopped.
#[derive(Debug)]
pub enum DispatchError {
    /// Polling the gateway failed or timed out.
    GatewayPollFailure(String),
    /// The provider failed for a reason other than an invalid token.
    ProviderOtherFailure(String),
    /// Storage failed.
    Storage(StorageError),
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GatewayPollFailure(msg) => write!(f, "Gateway poll failed: {msg}"),
            Self::ProviderOtherFailure(msg) => write!(f, "Push provider failed: {msg}"),
            Self::Storage(e) => write!(f, "Storage failure during dispatch: {e}"),
        }
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StorageError> for DispatchError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<GatewayError> for DispatchError {
    fn from(e: GatewayError) -> Self {
        Self::GatewayPollFailure(e.to_string())
    }
}

/// Timing knobs of the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSettings {
    /// Pause before each poll.
    pub delay: Duration,
    /// Upper bound for one gateway poll.
    pub poll_timeout: Duration,
    /// Upper bound for one provider call.
    pub provider_timeout: Duration,
}

/// Counters for one iteration.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    /// Notifications accepted by the provider.
    pub sent: usize,
    /// Gateway ids that resolved to no device.
    pub skipped: usize,
    /// Devices removed because the provider rejected their token.
    pub unregistered: usize,
}

/// Polls the gateway and notifies the matching devices.
pub struct Dispatcher {
    gateway: SharedGateway,
    provider: SharedPushProvider,
    storage: SharedStorage,
    clock: SharedClock,
    settings: DispatchSettings,
    notification: Notification,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("settings", &self.settings)
            .field("notification", &self.notification)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Create a dispatcher.
    pub fn new(
        gateway: SharedGateway,
        provider: SharedPushProvider,
        storage: SharedStorage,
        clock: SharedClock,
        settings: DispatchSettings,
        notification: Notification,
    ) -> Self {
        Self {
            gateway,
            provider,
            storage,
            clock,
            settings,
            notification,
        }
    }

    /// Run until `cancel` fires (`Ok`) or a fatal error occurs.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), DispatchError> {
        log::info!(
            "[Dispatch] Started (poll every {:?})",
            self.settings.delay
        );

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    log::info!("[Dispatch] Stopped");
                    return Ok(());
                }
                () = tokio::time::sleep(self.settings.delay) => {}
            }

            let ids = self.poll().await?;
            if ids.is_empty() {
                continue;
            }

            let report = self.dispatch_batch(&ids).await?;
            log::info!(
                "[Dispatch] {} ids: {} sent, {} skipped, {} unregistered",
                ids.len(),
                report.sent,
                report.skipped,
                report.unregistered
            );
        }
    }

    async fn poll(&self) -> Result<Vec<String>, DispatchError> {
        match tokio::time::timeout(self.settings.poll_timeout, self.gateway.poll_pending()).await
        {
            Ok(result) => Ok(result?),
            Err(_elapsed) => Err(DispatchError::GatewayPollFailure(format!(
                "timed out after {:?}",
                self.settings.poll_timeout
            ))),
        }
    }

    /// Notify every device behind `ids`.
    pub async fn dispatch_batch(&self, ids: &[String]) -> Result<DispatchReport, DispatchError> {
        let mut report = DispatchReport::default();
        let mut notified: HashSet<Fingerprint> = HashSet::new();

        for id in ids {
            let users = self.resolve(id).await?;
            if users.is_empty() {
                log::debug!("[Dispatch] No registration for {id}");
                report.skipped += 1;
                continue;
            }

            for user in users {
                if !notified.insert(user.fingerprint.clone()) {
                    continue;
                }
                self.notify(&user, &mut report).await?;
            }
        }

        Ok(report)
    }

    async fn resolve(&self, id: &str) -> Result<Vec<User>, DispatchError> {
        if let Ok(ephemeral_id) = id.parse::<EphemeralId>() {
            return Ok(self
                .storage
                .users_for_ephemeral(ephemeral_id, self.clock.now())
                .await?);
        }
        Ok(self
            .storage
            .get_user(&Fingerprint::from(id))
            .await?
            .into_iter()
            .collect())
    }

    async fn notify(&self, user: &User, report: &mut DispatchReport) -> Result<(), DispatchError> {
        let send = self.provider.send(&user.token, &self.notification);
        match tokio::time::timeout(self.settings.provider_timeout, send).await {
            Ok(Ok(message_id)) => {
                log::debug!(
                    "[Dispatch] Notified {} ({message_id})",
                    user.fingerprint.short()
                );
                report.sent += 1;
                Ok(())
            }
            Ok(Err(PushError::InvalidToken(reason))) => {
                log::warn!(
                    "[Dispatch] Token for {} is invalid ({reason}), unregistering",
                    user.fingerprint.short()
                );
                self.storage.delete_user(&user.fingerprint).await?;
                report.unregistered += 1;
                Ok(())
            }
            Ok(Err(PushError::Other(reason))) => Err(DispatchError::ProviderOtherFailure(format!(
                "{} for {}",
                reason,
                user.fingerprint.short()
            ))),
            Err(_elapsed) => Err(DispatchError::ProviderOtherFailure(format!(
                "timed out after {:?} for {}",
                self.settings.provider_timeout,
                user.fingerprint.short()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::gateway::GatewayClient;
    use crate::notifications::PushProvider;
    use crate::storage::{EphemeralRecord, IntermediaryId, MemoryStore, Storage};
    use crate::topology::derive_ephemeral_id;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::{Arc, Mutex};

    /// Gateway returning a scripted sequence of poll results.
    struct ScriptedGateway {
        polls: Mutex<Vec<Result<Vec<String>, GatewayError>>>,
    }

    #[async_trait]
    impl GatewayClient for ScriptedGateway {
        async fn poll_pending(&self) -> Result<Vec<String>, GatewayError> {
            let mut polls = self.polls.lock().expect("lock");
            if polls.is_empty() {
                Ok(Vec::new())
            } else {
                polls.remove(0)
            }
        }
    }

    /// Gateway whose poll never completes.
    struct HangingGateway;

    #[async_trait]
    impl GatewayClient for HangingGateway {
        async fn poll_pending(&self) -> Result<Vec<String>, GatewayError> {
            std::future::pending().await
        }
    }

    /// Provider answering per token and recording what it sent.
    #[derive(Default)]
    struct RecordingProvider {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PushProvider for RecordingProvider {
        async fn send(&self, token: &str, _n: &Notification) -> Result<String, PushError> {
            match token {
                "dead" => Err(PushError::InvalidToken("HTTP 404".to_string())),
                "broken" => Err(PushError::Other("HTTP 500".to_string())),
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok("late".to_string())
                }
                _ => {
                    self.sent.lock().expect("lock").push(token.to_string());
                    Ok(format!("msg-{token}"))
                }
            }
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).expect("valid timestamp")
    }

    fn settings() -> DispatchSettings {
        DispatchSettings {
            delay: Duration::from_millis(5),
            poll_timeout: Duration::from_millis(200),
            provider_timeout: Duration::from_millis(200),
        }
    }

    async fn add_user(store: &MemoryStore, fp: &str, token: &str) {
        store
            .add_user(User {
                fingerprint: Fingerprint::from(fp),
                token: token.to_string(),
                app_id: "app".to_string(),
                public_key_pem: String::new(),
                registered_at: at(0),
            })
            .await
            .expect("add user");
    }

    fn dispatcher(
        store: Arc<MemoryStore>,
        provider: Arc<RecordingProvider>,
        polls: Vec<Result<Vec<String>, GatewayError>>,
    ) -> Dispatcher {
        Dispatcher::new(
            Arc::new(ScriptedGateway {
                polls: Mutex::new(polls),
            }),
            provider,
            store,
            Arc::new(ManualClock::new(at(1_000))),
            settings(),
            Notification::default(),
        )
    }

    #[tokio::test]
    async fn test_success_keeps_user() {
        let store = Arc::new(MemoryStore::new());
        add_user(&store, "fp-a", "tok-a").await;
        let provider = Arc::new(RecordingProvider::default());
        let d = dispatcher(store.clone(), provider.clone(), Vec::new());

        let report = d.dispatch_batch(&["fp-a".to_string()]).await.expect("batch");
        assert_eq!(report.sent, 1);
        assert_eq!(*provider.sent.lock().expect("lock"), vec!["tok-a".to_string()]);
        assert!(store
            .get_user(&Fingerprint::from("fp-a"))
            .await
            .expect("get")
            .is_some());
    }

    #[tokio::test]
    async fn test_invalid_token_deletes_user_and_continues() {
        let store = Arc::new(MemoryStore::new());
        add_user(&store, "fp-dead", "dead").await;
        add_user(&store, "fp-b", "tok-b").await;
        let provider = Arc::new(RecordingProvider::default());
        let d = dispatcher(store.clone(), provider.clone(), Vec::new());

        let report = d
            .dispatch_batch(&["fp-dead".to_string(), "fp-b".to_string()])
            .await
            .expect("batch");
        assert_eq!(
            report,
            DispatchReport {
                sent: 1,
                skipped: 0,
                unregistered: 1
            }
        );
        assert!(store
            .get_user(&Fingerprint::from("fp-dead"))
            .await
            .expect("get")
            .is_none());
    }

    #[tokio::test]
    async fn test_unknown_identity_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(RecordingProvider::default());
        let d = dispatcher(store, provider.clone(), Vec::new());

        let report = d
            .dispatch_batch(&["nobody".to_string(), "12345".to_string()])
            .await
            .expect("batch");
        assert_eq!(report.skipped, 2);
        assert!(provider.sent.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn test_ephemeral_id_fans_out_to_owners_once() {
        let store = Arc::new(MemoryStore::new());
        add_user(&store, "fp-a", "tok-a").await;
        add_user(&store, "fp-b", "tok-b").await;
        let iid = IntermediaryId::new(b"abc123".to_vec());
        for owner in ["fp-a", "fp-b"] {
            store
                .register_tracked_id(&iid, &Fingerprint::from(owner), 0, 16, at(0))
                .await
                .expect("track");
        }
        let eid = derive_ephemeral_id(&iid, 0, 16);
        store
            .add_latest_ephemeral(EphemeralRecord {
                intermediary_id: iid.clone(),
                ephemeral_id: eid,
                offset: 0,
                address_space_size: 16,
                created_at: at(0),
                expires_at: at(86_400),
            })
            .await
            .expect("record");

        let provider = Arc::new(RecordingProvider::default());
        let d = dispatcher(store, provider.clone(), Vec::new());
        let report = d
            .dispatch_batch(&[eid.to_string(), eid.to_string(), "fp-a".to_string()])
            .await
            .expect("batch");
        assert_eq!(report.sent, 2);
        let mut sent = provider.sent.lock().expect("lock").clone();
        sent.sort();
        assert_eq!(sent, vec!["tok-a".to_string(), "tok-b".to_string()]);
    }

    #[tokio::test]
    async fn test_other_provider_error_ends_loop() {
        let store = Arc::new(MemoryStore::new());
        add_user(&store, "fp-x", "broken").await;
        let provider = Arc::new(RecordingProvider::default());
        let d = dispatcher(store, provider, vec![Ok(vec!["fp-x".to_string()])]);

        let result = d.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(DispatchError::ProviderOtherFailure(_))));
    }

    #[tokio::test]
    async fn test_poll_failure_ends_loop() {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(RecordingProvider::default());
        let d = dispatcher(
            store,
            provider,
            vec![Ok(Vec::new()), Err(GatewayError::Status(503))],
        );

        let result = d.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(DispatchError::GatewayPollFailure(_))));
    }

    #[tokio::test]
    async fn test_provider_timeout_ends_loop() {
        let store = Arc::new(MemoryStore::new());
        add_user(&store, "fp-slow", "slow").await;
        let provider = Arc::new(RecordingProvider::default());
        let d = dispatcher(
            Arc::clone(&store),
            provider,
            vec![Ok(vec!["fp-slow".to_string()])],
        );

        let result = tokio::time::timeout(Duration::from_secs(5), d.run(CancellationToken::new()))
            .await
            .expect("loop ends on its own");
        match result {
            Err(DispatchError::ProviderOtherFailure(msg)) => assert!(msg.contains("timed out")),
            other => panic!("expected provider failure, got {other:?}"),
        }
        // A slow provider is not a reason to drop the device.
        assert!(store
            .get_user(&Fingerprint::from("fp-slow"))
            .await
            .expect("get")
            .is_some());
    }

    #[tokio::test]
    async fn test_poll_timeout_ends_loop() {
        let d = Dispatcher::new(
            Arc::new(HangingGateway),
            Arc::new(RecordingProvider::default()),
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::new(at(1_000))),
            settings(),
            Notification::default(),
        );

        let result = tokio::time::timeout(Duration::from_secs(5), d.run(CancellationToken::new()))
            .await
            .expect("loop ends on its own");
        match result {
            Err(DispatchError::GatewayPollFailure(msg)) => assert!(msg.contains("timed out")),
            other => panic!("expected poll failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_ends_loop_cleanly() {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(RecordingProvider::default());
        let d = dispatcher(store, provider, Vec::new());

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(d.run(cancel).await.is_ok());
    }
}
