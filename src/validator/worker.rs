use std::sync::Arc;
use std::time::Duration;
use chrono::prelude::*;
use futures::StreamExt;
use crate::acme::models::{ChallengeId, Order};
use crate::acme::repo::{PendingChallenge, Repository};
use crate::types;
use super::{ChallengeProbe, ProbeOutcome};

/// Background task that settles `processing` challenges.
pub struct ChallengeValidator {
    repo: Arc<Repository>,
    probe: Arc<dyn ChallengeProbe>,
    interval: Duration,
    probe_timeout: Duration,
    concurrency: usize,
}

impl ChallengeValidator {
    pub fn new(repo: Arc<Repository>, probe: Arc<dyn ChallengeProbe>, config: &crate::config::WorkersConfig) -> Self {
        ChallengeValidator {
            repo,
            probe,
            interval: config.validation_interval(),
            probe_timeout: config.probe_timeout(),
            concurrency: config.validation_concurrency.max(1),
        }
    }

    /// Runs passes until `shutdown` changes or its sender is dropped.
    ///
    /// A pass in progress is finished before the loop exits; every probe in it is
    /// bounded by the probe timeout.
    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!("Challenge validator started");
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            self.run_pass().await;
        }
        info!("Challenge validator stopped");
    }

    /// Probes everything currently queued and returns how many challenges were looked at.
    pub async fn run_pass(&self) -> usize {
        let pending = self.repo.take_pending_validation().await;
        let count = pending.len();
        if count > 0 {
            debug!("Validating {} challenges", count);
        }
        futures::stream::iter(pending)
            .for_each_concurrent(self.concurrency, |chall| self.validate(chall))
            .await;
        count
    }

    async fn validate(&self, chall: PendingChallenge) {
        let result = if chall.authz_expires <= Utc::now() {
            Err(crate::problem!(
                Unauthorized, 403, "Authorization expired",
                format!("Authorization for {} expired before it could be validated", chall.identifier.value)
            ))
        } else {
            let domain = chall.identifier.base_domain().to_string();
            let probe = self.probe.probe(chall.challenge_type, &domain, &chall.token, &chall.expected_authorization);
            let outcome = match tokio::time::timeout(self.probe_timeout, probe).await {
                Ok(o) => o,
                Err(_) => ProbeOutcome::Transient(format!("probe timed out after {:?}", self.probe_timeout)),
            };
            match outcome {
                ProbeOutcome::Valid => Ok(()),
                ProbeOutcome::Invalid(err) => Err(err),
                ProbeOutcome::Transient(reason) => {
                    warn!(
                        "Unable to complete {} check for {}, will retry: {}",
                        chall.challenge_type.as_str(), domain, reason
                    );
                    self.repo.requeue_validation(chall.order_id);
                    return;
                }
            }
        };

        let valid = result.is_ok();
        match self.repo.update_order(chall.order_id, |order| apply_outcome(order, chall.id, result, Utc::now())).await {
            Ok(Some(true)) => info!(
                "{} challenge for {} is {}", chall.challenge_type.as_str(), chall.identifier.value,
                if valid { "valid" } else { "invalid" }
            ),
            Ok(Some(false)) => debug!("Challenge {:?} changed while it was being validated", chall.id),
            Ok(None) => debug!("Order {} removed while its challenge was being validated", chall.order_id),
            Err(err) => {
                error!("Unable to store validation result for order {}: {}", chall.order_id, err);
                self.repo.requeue_validation(chall.order_id);
            }
        }
    }
}

/// Records a validation result if the challenge is still `processing` under a `pending`
/// authorization, then recomputes the order status. Returns whether anything was applied.
pub fn apply_outcome(
    order: &mut Order, id: ChallengeId, result: Result<(), types::error::Error>, now: DateTime<Utc>,
) -> bool {
    let authz = match order.authorization_mut(id.authz_id) {
        Some(a) => a,
        None => return false,
    };
    if authz.status != types::authorization::Status::Pending {
        return false;
    }
    let identifier = authz.identifier.clone();
    let chall = match authz.challenge_mut(id.sub_id) {
        Some(c) => c,
        None => return false,
    };
    if chall.status != types::challenge::Status::Processing {
        return false;
    }

    match result {
        Ok(()) => {
            chall.status = types::challenge::Status::Valid;
            chall.validated = Some(now);
            authz.status = types::authorization::Status::Valid;
        }
        Err(mut err) => {
            err.identifier = Some(identifier);
            chall.status = types::challenge::Status::Invalid;
            chall.error = Some(err);
            authz.status = types::authorization::Status::Invalid;
        }
    }
    order.refresh_status(now);
    true
}
