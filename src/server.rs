//! Rocket front end: every request under the base path is handed to the [`acme::Gateway`].

use std::sync::Arc;
use rocket::data::ToByteUnit;
use crate::acme;
use crate::lifecycle::Service;

const BODY_LIMIT_KIB: u64 = 64;

/// Transport details the gateway needs besides the body.
pub struct RequestMeta {
    method: acme::Method,
    path: String,
    host: Option<String>,
    content_type: Option<String>,
}

#[rocket::async_trait]
impl<'r> rocket::request::FromRequest<'r> for RequestMeta {
    type Error = std::convert::Infallible;

    async fn from_request(request: &'r rocket::request::Request<'_>) -> rocket::request::Outcome<Self, Self::Error> {
        let method = match request.method() {
            rocket::http::Method::Get => acme::Method::Get,
            rocket::http::Method::Head => acme::Method::Head,
            rocket::http::Method::Post => acme::Method::Post,
            _ => acme::Method::Other,
        };
        rocket::request::Outcome::Success(RequestMeta {
            method,
            path: request.uri().path().as_str().to_string(),
            host: request.headers().get_one("Host").map(|h| h.to_string()),
            content_type: request.headers().get_one("Content-Type").map(|c| c.to_string()),
        })
    }
}

impl<'r> rocket::response::Responder<'r, 'static> for acme::Response {
    fn respond_to(self, _req: &'r rocket::request::Request<'_>) -> rocket::response::Result<'static> {
        let mut builder = rocket::response::Response::build();
        builder.status(rocket::http::Status::new(self.status));
        if let Some(content_type) = self.content_type {
            builder.raw_header("Content-Type", content_type);
        }
        for (name, value) in self.headers {
            builder.raw_header_adjoin(name, value);
        }
        builder.sized_body(self.body.len(), std::io::Cursor::new(self.body));
        builder.ok()
    }
}

async fn forward(service: &Service, meta: RequestMeta, body: Vec<u8>) -> acme::Response {
    service.gateway().handle(acme::Request {
        method: meta.method,
        path: meta.path,
        host: meta.host,
        content_type: meta.content_type,
        body,
    }).await
}

async fn forward_with_body(service: &Service, meta: RequestMeta, data: rocket::Data<'_>) -> acme::Response {
    let body = match data.open(BODY_LIMIT_KIB.kibibytes()).into_bytes().await {
        Ok(b) if b.is_complete() => b.into_inner(),
        Ok(_) => return acme::Response::empty(413),
        Err(err) => {
            warn!("Unable to read request body: {}", err);
            return acme::Response::empty(400);
        }
    };
    forward(service, meta, body).await
}

#[rocket::get("/<_path..>")]
async fn get(
    _path: rocket::http::uri::Segments<'_, rocket::http::uri::fmt::Path>, meta: RequestMeta,
    service: &rocket::State<Arc<Service>>,
) -> acme::Response {
    forward(service, meta, vec![]).await
}

#[rocket::head("/<_path..>")]
async fn head(
    _path: rocket::http::uri::Segments<'_, rocket::http::uri::fmt::Path>, meta: RequestMeta,
    service: &rocket::State<Arc<Service>>,
) -> acme::Response {
    forward(service, meta, vec![]).await
}

#[rocket::post("/<_path..>", data = "<data>")]
async fn post(
    _path: rocket::http::uri::Segments<'_, rocket::http::uri::fmt::Path>, meta: RequestMeta,
    data: rocket::Data<'_>, service: &rocket::State<Arc<Service>>,
) -> acme::Response {
    forward_with_body(service, meta, data).await
}

#[rocket::put("/<_path..>", data = "<data>")]
async fn put(
    _path: rocket::http::uri::Segments<'_, rocket::http::uri::fmt::Path>, meta: RequestMeta,
    data: rocket::Data<'_>, service: &rocket::State<Arc<Service>>,
) -> acme::Response {
    forward_with_body(service, meta, data).await
}

#[rocket::delete("/<_path..>")]
async fn delete(
    _path: rocket::http::uri::Segments<'_, rocket::http::uri::fmt::Path>, meta: RequestMeta,
    service: &rocket::State<Arc<Service>>,
) -> acme::Response {
    forward(service, meta, vec![]).await
}

async fn build_service(config: crate::config::Config) -> Result<Service, String> {
    let backend: Arc<dyn acme::repo::Backend> = match &config.database_url {
        Some(url) => Arc::new(acme::db::PgBackend::connect(url).await.map_err(|e| e.to_string())?),
        None => {
            warn!("No database_url configured, state will be lost on restart");
            Arc::new(acme::repo::MemoryBackend::new())
        }
    };
    let authority = crate::ca::RestSigningAuthority::new(&config.signing_authority)
        .map_err(|e| format!("unable to set up signing authority client: {}", e))?;
    let probe = crate::validator::Validator::new().map_err(|e| e.to_string())?;
    Service::build(config, backend, Arc::new(probe), Arc::new(authority)).await
        .map_err(|e| e.to_string())
}

/// Builds the service from the `acme` config table, mounts the routes under the base path,
/// and runs the background workers between liftoff and shutdown.
pub struct GatewayFairing;

#[rocket::async_trait]
impl rocket::fairing::Fairing for GatewayFairing {
    fn info(&self) -> rocket::fairing::Info {
        rocket::fairing::Info {
            name: "ACME gateway",
            kind: rocket::fairing::Kind::Ignite | rocket::fairing::Kind::Liftoff | rocket::fairing::Kind::Shutdown,
        }
    }

    async fn on_ignite(&self, rocket: rocket::Rocket<rocket::Build>) -> rocket::fairing::Result {
        let config = match rocket.figment().extract_inner::<crate::config::Config>("acme") {
            Ok(c) => c,
            Err(err) => {
                error!("Unable to load ACME config: {}", err);
                return Err(rocket);
            }
        };
        let service = match build_service(config).await {
            Ok(s) => s,
            Err(err) => {
                error!("Unable to start ACME gateway: {}", err);
                return Err(rocket);
            }
        };
        let mount_path = match service.gateway().base_path().trim_end_matches('/') {
            "" => "/".to_string(),
            p => p.to_string(),
        };
        info!("Serving ACME at {}", service.gateway().base_url());
        Ok(rocket
            .manage(Arc::new(service))
            .mount(mount_path, rocket::routes![get, head, post, put, delete]))
    }

    async fn on_liftoff(&self, rocket: &rocket::Rocket<rocket::Orbit>) {
        if let Some(service) = rocket.state::<Arc<Service>>() {
            service.start();
        }
    }

    async fn on_shutdown(&self, rocket: &rocket::Rocket<rocket::Orbit>) {
        if let Some(service) = rocket.state::<Arc<Service>>() {
            service.shutdown().await;
        }
    }
}
