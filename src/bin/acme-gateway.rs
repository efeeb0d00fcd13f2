#[macro_use]
extern crate log;

#[rocket::launch]
fn rocket() -> _ {
    pretty_env_logger::init();
    info!("ACME gateway version {} starting up...", env!("CARGO_PKG_VERSION"));

    // ACME_BASE_URL, ACME_WORKERS__PROBE_TIMEOUT_SECS etc. override the `acme` table.
    let figment = rocket::Config::figment()
        .merge(figment::providers::Env::prefixed("ACME_")
            .split("__")
            .map(|key| format!("acme.{}", key).into()));

    rocket::custom(figment)
        .attach(acme_gateway::server::GatewayFairing)
}
