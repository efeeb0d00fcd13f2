use std::time::Duration;

/// Gateway configuration, read from the `acme` table of the Rocket figment.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Absolute external URL the ACME resources live under, e.g. `https://acme.example.com/acme/`.
    pub base_url: String,
    #[serde(default = "default_num_bytes")]
    pub nonce_num_bytes: usize,
    #[serde(default = "default_nonce_lifetime")]
    pub nonce_lifetime_secs: u64,
    #[serde(default = "default_num_bytes")]
    pub token_num_bytes: usize,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub terms_of_service: Option<String>,
    #[serde(default)]
    pub caa_identities: Vec<String>,
    #[serde(default)]
    pub ca_profiles: Vec<CaProfile>,
    #[serde(default)]
    pub cleanup_order: Option<CleanupOrder>,
    #[serde(default)]
    pub contact_verifier: crate::acme::contact::ContactVerifier,
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default)]
    pub signing_authority: SigningAuthorityConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaProfile {
    pub ca: String,
    pub tls_profile: String,
    /// Public key algorithm OIDs this profile accepts in a CSR.
    pub key_types: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CleanupOrder {
    #[serde(default = "default_cleanup_days")]
    pub expired_cert_days: i64,
    #[serde(default = "default_cleanup_days")]
    pub expired_order_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SigningAuthorityConfig {
    #[serde(default = "default_sa_url")]
    pub url: String,
    #[serde(default = "default_sa_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkersConfig {
    #[serde(default = "default_validation_interval")]
    pub validation_interval_secs: u64,
    #[serde(default = "default_enrollment_interval")]
    pub enrollment_interval_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_enrollment_timeout")]
    pub enrollment_timeout_secs: u64,
    #[serde(default = "default_concurrency")]
    pub validation_concurrency: usize,
    #[serde(default = "default_grace")]
    pub shutdown_grace_secs: u64,
}

fn default_num_bytes() -> usize { 16 }
fn default_nonce_lifetime() -> u64 { 3600 }
fn default_cleanup_days() -> i64 { 365 }
fn default_sa_url() -> String { "http://localhost:8080/ca".to_string() }
fn default_sa_timeout() -> u64 { 30 }
fn default_validation_interval() -> u64 { 2 }
fn default_enrollment_interval() -> u64 { 2 }
fn default_probe_timeout() -> u64 { 20 }
fn default_enrollment_timeout() -> u64 { 60 }
fn default_concurrency() -> usize { 8 }
fn default_grace() -> u64 { 10 }

impl Default for SigningAuthorityConfig {
    fn default() -> Self {
        SigningAuthorityConfig {
            url: default_sa_url(),
            timeout_secs: default_sa_timeout(),
        }
    }
}

impl Default for WorkersConfig {
    fn default() -> Self {
        WorkersConfig {
            validation_interval_secs: default_validation_interval(),
            enrollment_interval_secs: default_enrollment_interval(),
            probe_timeout_secs: default_probe_timeout(),
            enrollment_timeout_secs: default_enrollment_timeout(),
            validation_concurrency: default_concurrency(),
            shutdown_grace_secs: default_grace(),
        }
    }
}

const MIN_CLEANUP_DAYS: i64 = 10;

impl Config {
    /// Certificate expiry age and unfinished order age after which orders are removed.
    pub fn cleanup_ages(&self) -> (chrono::Duration, chrono::Duration) {
        match &self.cleanup_order {
            None => (chrono::Duration::days(365), chrono::Duration::days(365)),
            Some(c) => (
                chrono::Duration::days(c.expired_cert_days.max(MIN_CLEANUP_DAYS)),
                chrono::Duration::days(c.expired_order_days.max(MIN_CLEANUP_DAYS)),
            ),
        }
    }

    pub fn nonce_lifetime(&self) -> Duration {
        Duration::from_secs(self.nonce_lifetime_secs)
    }
}

impl WorkersConfig {
    pub fn validation_interval(&self) -> Duration {
        Duration::from_secs(self.validation_interval_secs.max(1))
    }

    pub fn enrollment_interval(&self) -> Duration {
        Duration::from_secs(self.enrollment_interval_secs.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn enrollment_timeout(&self) -> Duration {
        Duration::from_secs(self.enrollment_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
