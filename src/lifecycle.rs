//! Wiring of the gateway, its store and the background workers into one service.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use crate::acme::{self, repo, replay};
use crate::ca::SigningAuthority;
use crate::validator::ChallengeProbe;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] repo::StoreError),
    #[error(transparent)]
    Setup(#[from] acme::SetupError),
}

/// Running background workers and the channel that stops them.
pub struct Workers {
    shutdown: tokio::sync::watch::Sender<bool>,
    handles: Vec<(&'static str, tokio::task::JoinHandle<()>)>,
}

impl Workers {
    /// Spawns the challenge validator and the certificate enroller.
    pub fn spawn(
        repo: Arc<repo::Repository>, probe: Arc<dyn ChallengeProbe>, authority: Arc<dyn SigningAuthority>,
        config: &crate::config::WorkersConfig,
    ) -> Self {
        let (shutdown, rx) = tokio::sync::watch::channel(false);
        let validator = crate::validator::worker::ChallengeValidator::new(repo.clone(), probe, config);
        let enroller = crate::enroller::CertEnroller::new(repo, authority, config);
        Workers {
            shutdown,
            handles: vec![
                ("challenge validator", tokio::spawn(validator.run(rx.clone()))),
                ("certificate enroller", tokio::spawn(enroller.run(rx))),
            ],
        }
    }

    /// Signals every worker to stop and waits up to `grace` for each, aborting stragglers.
    pub async fn shutdown(self, grace: Duration) {
        let _ = self.shutdown.send(true);
        for (name, mut handle) in self.handles {
            match tokio::time::timeout(grace, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!("The {} failed: {}", name, err),
                Err(_) => {
                    warn!("The {} did not stop within {:?}, aborting it", name, grace);
                    handle.abort();
                }
            }
        }
    }
}

pub struct Service {
    gateway: acme::Gateway,
    repo: Arc<repo::Repository>,
    nonces: Arc<replay::NonceManager>,
    probe: Arc<dyn ChallengeProbe>,
    authority: Arc<dyn SigningAuthority>,
    config: Arc<crate::config::Config>,
    workers: Mutex<Option<Workers>>,
}

impl Service {
    /// Loads all stored state and sets up the gateway. Nothing runs until [`Service::start`].
    pub async fn build(
        config: crate::config::Config, backend: Arc<dyn repo::Backend>,
        probe: Arc<dyn ChallengeProbe>, authority: Arc<dyn SigningAuthority>,
    ) -> Result<Self, ServiceError> {
        let config = Arc::new(config);
        let repo = Arc::new(repo::Repository::load(backend).await?);
        let nonces = Arc::new(replay::NonceManager::new(config.nonce_num_bytes, config.nonce_lifetime()));
        let gateway = acme::Gateway::new(config.clone(), repo.clone(), nonces.clone(), authority.clone())?;
        Ok(Service {
            gateway,
            repo,
            nonces,
            probe,
            authority,
            config,
            workers: Mutex::new(None),
        })
    }

    pub fn gateway(&self) -> &acme::Gateway {
        &self.gateway
    }

    pub fn repo(&self) -> &Arc<repo::Repository> {
        &self.repo
    }

    /// Starts nonce housekeeping and the background workers. Must be called within a tokio runtime.
    pub fn start(&self) {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if workers.is_some() {
            return;
        }
        self.nonces.start_housekeeping();
        *workers = Some(Workers::spawn(
            self.repo.clone(), self.probe.clone(), self.authority.clone(), &self.config.workers,
        ));
        info!("Background workers started");
    }

    pub async fn shutdown(&self) {
        let workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.nonces.shutdown();
        if let Some(workers) = workers {
            workers.shutdown(self.config.workers.shutdown_grace()).await;
            info!("Background workers stopped");
        }
    }
}
