//! Background submission of finalized orders to the signing authority.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use chrono::prelude::*;
use crate::acme::models::Order;
use crate::acme::repo::Repository;
use crate::ca::{CaError, SigningAuthority};
use crate::types;

/// What became of one enrollment attempt.
#[derive(Debug, Clone, PartialEq)]
enum Enrollment {
    Issued { certificate: Vec<u8>, not_after: DateTime<Utc> },
    Rejected(types::error::Error),
    Retry(String),
}

pub struct CertEnroller {
    repo: Arc<Repository>,
    authority: Arc<dyn SigningAuthority>,
    interval: Duration,
    timeout: Duration,
    /// Settled results whose store write failed, keyed by order id.
    unsaved: Mutex<HashMap<u64, Enrollment>>,
}

impl CertEnroller {
    pub fn new(
        repo: Arc<Repository>, authority: Arc<dyn SigningAuthority>, config: &crate::config::WorkersConfig,
    ) -> Self {
        CertEnroller {
            repo,
            authority,
            interval: config.enrollment_interval(),
            timeout: config.enrollment_timeout(),
            unsaved: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!("Certificate enroller started");
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            self.run_pass().await;
        }
        info!("Certificate enroller stopped");
    }

    /// Submits every queued order, one at a time. Returns how many were attempted.
    pub async fn run_pass(&self) -> usize {
        let pending = self.repo.take_pending_enrollment().await;
        let count = pending.len();
        for order in pending {
            self.enroll(order).await;
        }
        count
    }

    async fn submit(&self, order: &Order) -> Enrollment {
        let (csr, meta) = match (&order.csr, &order.cert_req_meta) {
            (Some(csr), Some(meta)) => (csr, meta),
            _ => return Enrollment::Rejected(rejection("Order has no certificate request")),
        };
        let (ca, profile) = match (&meta.ca, &meta.profile) {
            (Some(ca), Some(profile)) => (ca, profile),
            _ => return Enrollment::Rejected(rejection("Order has no CA profile")),
        };

        let issue = self.authority.issue_certificate(ca, profile, csr, meta.not_before, meta.not_after);
        match tokio::time::timeout(self.timeout, issue).await {
            Err(_) => Enrollment::Retry(format!("signing authority did not answer within {:?}", self.timeout)),
            Ok(Err(CaError::Unavailable(reason))) => Enrollment::Retry(reason),
            Ok(Err(CaError::Rejected(reason))) => Enrollment::Rejected(rejection(reason)),
            Ok(Ok(certificate)) => match certificate_not_after(&certificate) {
                Some(not_after) => Enrollment::Issued { certificate, not_after },
                None => {
                    error!("Signing authority returned an unparsable certificate for order {}", order.id);
                    Enrollment::Rejected(rejection("Issued certificate could not be parsed"))
                }
            },
        }
    }

    async fn enroll(&self, order: Order) {
        let unsaved = self.unsaved.lock().unwrap_or_else(PoisonError::into_inner).remove(&order.id);
        let result = match unsaved {
            Some(result) => {
                debug!("Retrying store of enrollment result for order {}", order.id);
                result
            }
            None => self.submit(&order).await,
        };
        if let Enrollment::Retry(reason) = &result {
            warn!("Enrollment of order {} failed, will retry: {}", order.id, reason);
            self.repo.requeue_enrollment(order.id);
            return;
        }

        let issued = matches!(result, Enrollment::Issued { .. });
        match self.repo.update_order(order.id, |o| apply_enrollment(o, result.clone())).await {
            Ok(Some(true)) if issued => info!("Issued certificate for order {}", order.id),
            Ok(Some(true)) => info!("Enrollment of order {} was rejected", order.id),
            Ok(Some(false)) => debug!("Order {} changed while it was being enrolled", order.id),
            Ok(None) => debug!("Order {} removed while it was being enrolled", order.id),
            Err(err) => {
                error!("Unable to store enrollment result for order {}: {}", order.id, err);
                self.unsaved.lock().unwrap_or_else(PoisonError::into_inner).insert(order.id, result);
                self.repo.requeue_enrollment(order.id);
            }
        }
    }
}

fn rejection<D: ToString>(detail: D) -> types::error::Error {
    crate::problem!(Unauthorized, 403, "Certificate issuance refused", detail)
}

fn certificate_not_after(der: &[u8]) -> Option<DateTime<Utc>> {
    let cert = openssl::x509::X509::from_der(der).ok()?;
    crate::util::asn1_time_to_chrono(cert.not_after())
}

/// Settles an order that is still `processing` without a certificate.
fn apply_enrollment(order: &mut Order, result: Enrollment) -> bool {
    if order.status != types::order::Status::Processing || order.certificate.is_some() {
        return false;
    }
    match result {
        Enrollment::Issued { certificate, not_after } => {
            order.certificate = Some(certificate);
            order.cert_not_after = Some(not_after);
            order.status = types::order::Status::Valid;
        }
        Enrollment::Rejected(err) => {
            order.error = Some(err);
            order.status = types::order::Status::Invalid;
        }
        Enrollment::Retry(_) => return false,
    }
    true
}
