//! Service wiring and lifecycle.
//!
//! # Tasks
//!
//! ```text
//! Service::run
//!   ├── api        axum server (registration)
//!   ├── creator    EpochManager::spawn_creator
//!   ├── deleter    EpochManager::spawn_deleter
//!   ├── snapshot   MemoryStore::spawn_flusher
//!   ├── ndf        SharedTopology::spawn_refresher (when enabled)
//!   └── dispatch   Dispatcher::run
//! ```
//!
//! All tasks share one [`CancellationToken`]. The service stops when the
//! shutdown future resolves, when the dispatch loop ends on its own (a fatal
//! poll or provider failure) or when the API server exits. Either way the
//! token is cancelled, every task is joined and the store snapshot is
//! flushed.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::api::{self, ApiState};
use crate::authority::{SharedAuthorityKeys, StaticAuthorities};
use crate::clock::{SharedClock, SystemClock};
use crate::config::{Config, ProviderKind};
use crate::dispatch::{DispatchError, DispatchSettings, Dispatcher};
use crate::epoch::EpochManager;
use crate::gateway::{HttpGateway, SharedGateway, SharedNdfSource};
use crate::notifications::oauth::SharedAccessTokenSource;
use crate::notifications::{
    FcmProvider, LogProvider, ServiceAccountKey, ServiceAccountTokens, SharedPushProvider,
    StaticToken, VapidKeys, WebPushProvider,
};
use crate::registration::Registrar;
use crate::storage::{MemoryStore, SharedStorage};
use crate::topology::{SharedTopology, SharedTopologySource};

/// External collaborators of the service.
#[derive(Clone)]
pub struct Collaborators {
    /// Gateway to poll.
    pub gateway: SharedGateway,
    /// Push provider.
    pub provider: SharedPushProvider,
    /// Trusted permissioning authorities.
    pub authorities: SharedAuthorityKeys,
    /// Wall clock.
    pub clock: SharedClock,
    /// Network definition source; the configured params stay fixed without one.
    pub ndf: Option<SharedNdfSource>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

impl Collaborators {
    /// Production collaborators described by `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("mixnotify/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        let clock: SharedClock = Arc::new(SystemClock);
        let gateway = Arc::new(HttpGateway::new(
            client.clone(),
            &config.gateway_url,
            config.gateway_api_key.clone(),
        ));
        let ndf = config
            .ndf_refresh_interval()
            .map(|_| Arc::clone(&gateway) as SharedNdfSource);

        let provider: SharedPushProvider = match config.provider {
            ProviderKind::Fcm => {
                let (project, tokens): (String, SharedAccessTokenSource) =
                    match &config.fcm_credentials_path {
                        Some(path) => {
                            let key = ServiceAccountKey::load(path)?;
                            let project = config
                                .fcm_project_id
                                .clone()
                                .or_else(|| key.project_id.clone())
                                .context("No FCM project id in config or credentials")?;
                            let tokens =
                                ServiceAccountTokens::new(client.clone(), &key, Arc::clone(&clock))?;
                            (project, Arc::new(tokens) as SharedAccessTokenSource)
                        }
                        None => {
                            let project = config
                                .fcm_project_id
                                .clone()
                                .context("fcm_project_id is not set")?;
                            let token = config
                                .fcm_access_token
                                .clone()
                                .context("FCM access token is not set")?;
                            log::warn!(
                                "Using a fixed FCM access token; delivery stops when it expires"
                            );
                            (
                                project,
                                Arc::new(StaticToken::new(token)) as SharedAccessTokenSource,
                            )
                        }
                    };
                Arc::new(FcmProvider::new(client, &project, tokens))
            }
            ProviderKind::WebPush => {
                let vapid = VapidKeys::from_base64url(
                    config.vapid_public_key.as_deref().unwrap_or_default(),
                    config.vapid_private_key.as_deref().unwrap_or_default(),
                )
                .context("Invalid VAPID keys")?;
                Arc::new(WebPushProvider::new(
                    client,
                    vapid,
                    config.vapid_subject.clone(),
                ))
            }
            ProviderKind::Log => {
                log::warn!("Using log-only push provider; no notifications will be delivered");
                Arc::new(LogProvider)
            }
        };

        let mut authorities = StaticAuthorities::new();
        match &config.authority_key_path {
            Some(path) => authorities = authorities.load_pem_file(&config.authority_id, path)?,
            None => log::warn!(
                "No authority key configured; every registration will be rejected as untrusted"
            ),
        }

        Ok(Self {
            gateway,
            provider,
            authorities: Arc::new(authorities),
            clock,
            ndf,
        })
    }
}

/// The assembled service.
pub struct Service {
    config: Config,
    store: Arc<MemoryStore>,
    topology: Arc<SharedTopology>,
    epochs: Arc<EpochManager>,
    registrar: Arc<Registrar>,
    dispatcher: Arc<Dispatcher>,
    ndf: Option<SharedNdfSource>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("config", &self.config)
            .field("topology", &self.topology)
            .field("ndf_refresh", &self.ndf.is_some())
            .finish_non_exhaustive()
    }
}

impl Service {
    /// Assemble the service from `config` and explicit collaborators.
    pub fn new(config: Config, collaborators: Collaborators) -> Result<Self> {
        let store = Arc::new(match &config.state_path {
            Some(path) => MemoryStore::open(path)
                .with_context(|| format!("Failed to open state {}", path.display()))?,
            None => MemoryStore::new(),
        });
        let topology = Arc::new(SharedTopology::new(config.network_params()));
        let storage: SharedStorage = Arc::clone(&store) as SharedStorage;

        let epochs = Arc::new(EpochManager::new(
            Arc::clone(&storage),
            Arc::clone(&topology) as SharedTopologySource,
            Arc::clone(&collaborators.clock),
        ));
        let registrar = Arc::new(Registrar::new(
            Arc::clone(&storage),
            collaborators.authorities,
            config.authority_id.clone(),
            Arc::clone(&collaborators.clock),
            Arc::clone(&epochs),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            collaborators.gateway,
            collaborators.provider,
            storage,
            collaborators.clock,
            DispatchSettings {
                delay: config.poll_delay(),
                poll_timeout: config.poll_timeout(),
                provider_timeout: config.provider_timeout(),
            },
            config.notification(),
        ));

        Ok(Self {
            config,
            store,
            topology,
            epochs,
            registrar,
            dispatcher,
            ndf: collaborators.ndf,
        })
    }

    /// Assemble the service with production collaborators.
    pub fn from_config(config: Config) -> Result<Self> {
        let collaborators = Collaborators::from_config(&config)?;
        Self::new(config, collaborators)
    }

    /// Topology handle, for pushing new network parameters.
    pub fn topology(&self) -> Arc<SharedTopology> {
        Arc::clone(&self.topology)
    }

    /// Bind the configured address and run until `shutdown` resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let addr = self.config.listen_socket_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;
        self.run_with_listener(listener, shutdown).await
    }

    /// Run on an already bound listener until `shutdown` resolves.
    pub async fn run_with_listener(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        let cancel = CancellationToken::new();

        let mut api_task = tokio::spawn(api::serve(
            listener,
            ApiState::new(Arc::clone(&self.registrar)),
            cancel.clone(),
        ));
        let creator_task = Arc::clone(&self.epochs)
            .spawn_creator(self.config.creator_interval(), cancel.clone());
        let deleter_task = Arc::clone(&self.epochs)
            .spawn_deleter(self.config.deleter_interval(), cancel.clone());
        let flusher_task = Arc::clone(&self.store)
            .spawn_flusher(self.config.snapshot_interval(), cancel.clone());
        let refresher_task = match (&self.ndf, self.config.ndf_refresh_interval()) {
            (Some(source), Some(interval)) => Some(Arc::clone(&self.topology).spawn_refresher(
                Arc::clone(source),
                interval,
                cancel.clone(),
            )),
            _ => None,
        };
        let mut dispatch_task: JoinHandle<Result<(), DispatchError>> = {
            let dispatcher = Arc::clone(&self.dispatcher);
            let cancel = cancel.clone();
            tokio::spawn(async move { dispatcher.run(cancel).await })
        };

        log::info!("mixnotify running");

        let exit = wait_for_exit(shutdown, &mut dispatch_task, &mut api_task).await;
        cancel.cancel();

        let (dispatch_result, api_result) = match exit {
            ExitCause::Shutdown => (dispatch_task.await, api_task.await),
            ExitCause::Dispatch(joined) => (joined, api_task.await),
            ExitCause::Api(joined) => (dispatch_task.await, joined.map(|served| {
                served.and_then(|()| {
                    Err(std::io::Error::other("server exited before shutdown"))
                })
            })),
        };
        for (name, task) in [
            ("Epoch creator", Some(creator_task)),
            ("Epoch deleter", Some(deleter_task)),
            ("Snapshot writer", Some(flusher_task)),
            ("NDF refresher", refresher_task),
        ] {
            if let Some(task) = task {
                if let Err(e) = task.await {
                    log::error!("{name} task panicked: {e}");
                }
            }
        }

        self.store.flush().context("Failed to write state snapshot")?;

        match api_result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e).context("Registration API failed"),
            Err(e) => return Err(e).context("Registration API task panicked"),
        }
        dispatch_result
            .context("Dispatch task panicked")?
            .context("Dispatch loop stopped")?;

        log::info!("mixnotify stopped");
        Ok(())
    }
}

/// Why the service left its main wait.
#[derive(Debug)]
enum ExitCause {
    /// The shutdown future resolved.
    Shutdown,
    /// The dispatch loop ended on its own.
    Dispatch(Result<Result<(), DispatchError>, JoinError>),
    /// The API server ended on its own.
    Api(Result<std::io::Result<()>, JoinError>),
}

/// Wait for shutdown or for a task that should run forever to end.
async fn wait_for_exit(
    shutdown: impl Future<Output = ()>,
    dispatch_task: &mut JoinHandle<Result<(), DispatchError>>,
    api_task: &mut JoinHandle<std::io::Result<()>>,
) -> ExitCause {
    tokio::select! {
        () = shutdown => {
            log::info!("Shutdown requested");
            ExitCause::Shutdown
        }
        joined = dispatch_task => ExitCause::Dispatch(joined),
        joined = api_task => {
            log::error!("Registration API exited before shutdown");
            ExitCause::Api(joined)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_api_exit_ends_wait() {
        let mut dispatch_task: JoinHandle<Result<(), DispatchError>> =
            tokio::spawn(std::future::pending());
        let mut api_task: JoinHandle<std::io::Result<()>> =
            tokio::spawn(async { Err(std::io::Error::other("listener closed")) });

        let exit = wait_for_exit(std::future::pending(), &mut dispatch_task, &mut api_task).await;
        assert!(matches!(exit, ExitCause::Api(Ok(Err(_)))));
        dispatch_task.abort();
    }

    #[tokio::test]
    async fn test_dispatch_exit_ends_wait() {
        let mut dispatch_task: JoinHandle<Result<(), DispatchError>> = tokio::spawn(async {
            Err(DispatchError::GatewayPollFailure("HTTP 500".to_string()))
        });
        let mut api_task: JoinHandle<std::io::Result<()>> = tokio::spawn(std::future::pending());

        let exit = wait_for_exit(std::future::pending(), &mut dispatch_task, &mut api_task).await;
        assert!(matches!(exit, ExitCause::Dispatch(Ok(Err(_)))));
        api_task.abort();
    }

    #[tokio::test]
    async fn test_shutdown_ends_wait() {
        let mut dispatch_task: JoinHandle<Result<(), DispatchError>> =
            tokio::spawn(std::future::pending());
        let mut api_task: JoinHandle<std::io::Result<()>> = tokio::spawn(std::future::pending());

        let exit = wait_for_exit(async {}, &mut dispatch_task, &mut api_task).await;
        assert!(matches!(exit, ExitCause::Shutdown));
        dispatch_task.abort();
        api_task.abort();
    }
}
