use crate::services::{
    credentials::CredentialStore,
    network::{NetworkMode, OrchestratorHandle, RequestError, SavedNetwork},
};
use actix_web::{HttpResponse, Responder, web};
use anyhow::Result;
use log::{debug, error, warn};
use serde_valid::Validate;
use std::sync::Arc;

/// Trait for converting service results into HTTP responses
pub trait ServiceResultResponse {
    fn into_response(self) -> HttpResponse;
}

impl ServiceResultResponse for () {
    fn into_response(self) -> HttpResponse {
        HttpResponse::Ok().finish()
    }
}

impl ServiceResultResponse for Vec<String> {
    fn into_response(self) -> HttpResponse {
        HttpResponse::Ok().json(self)
    }
}

/// Turn a service result into a response, logging failures with `operation`.
pub fn handle_service_result<T>(result: Result<T>, operation: &str) -> HttpResponse
where
    T: ServiceResultResponse,
{
    match result {
        Ok(data) => data.into_response(),
        Err(e) => {
            error!("{operation} failed: {e:#}");
            HttpResponse::InternalServerError().body(e.to_string())
        }
    }
}

/// Queued requests are accepted, not completed: progress shows up in `/status`.
fn handle_request_result(result: Result<(), RequestError>, operation: &str) -> HttpResponse {
    match result {
        Ok(()) => HttpResponse::Accepted().finish(),
        Err(e) => {
            warn!("{operation} rejected: {e}");
            HttpResponse::ServiceUnavailable().body(e.to_string())
        }
    }
}

#[derive(Clone)]
pub struct Api {
    pub orchestrator: OrchestratorHandle,
    pub store: Arc<CredentialStore>,
}

impl Api {
    pub fn new(orchestrator: OrchestratorHandle, store: Arc<CredentialStore>) -> Self {
        Api {
            orchestrator,
            store,
        }
    }

    pub async fn status(api: web::Data<Self>) -> impl Responder {
        debug!("status() called");
        HttpResponse::Ok().json(api.orchestrator.status())
    }

    pub async fn healthcheck(api: web::Data<Self>) -> impl Responder {
        debug!("healthcheck() called");

        let status = api.orchestrator.status();

        if status.mode == NetworkMode::Degraded {
            HttpResponse::ServiceUnavailable().json(&status)
        } else {
            HttpResponse::Ok().json(&status)
        }
    }

    pub async fn version() -> impl Responder {
        HttpResponse::Ok().body(env!("CARGO_PKG_VERSION"))
    }

    pub async fn ensure_connectivity(api: web::Data<Self>) -> impl Responder {
        debug!("ensure_connectivity() called");

        handle_request_result(
            api.orchestrator.ensure_connectivity(),
            "ensure_connectivity",
        )
    }

    pub async fn force_ap_mode(api: web::Data<Self>) -> impl Responder {
        debug!("force_ap_mode() called");

        handle_request_result(api.orchestrator.force_ap_mode(), "force_ap_mode")
    }

    pub async fn connect_to(body: web::Json<SavedNetwork>, api: web::Data<Self>) -> impl Responder {
        debug!("connect_to() called: {body:?}");

        let network = body.into_inner();

        if let Err(e) = network.validate() {
            return HttpResponse::BadRequest().body(e.to_string());
        }

        handle_request_result(api.orchestrator.connect_to(network), "connect_to")
    }

    pub async fn saved_networks(api: web::Data<Self>) -> impl Responder {
        debug!("saved_networks() called");

        handle_service_result(
            api.store.saved_networks().map(|networks| {
                networks
                    .into_iter()
                    .map(|network| network.ssid)
                    .collect::<Vec<_>>()
            }),
            "saved_networks",
        )
    }

    pub async fn add_network(
        body: web::Json<SavedNetwork>,
        api: web::Data<Self>,
    ) -> impl Responder {
        debug!("add_network() called: {body:?}");

        let network = body.into_inner();

        if let Err(e) = network.validate() {
            return HttpResponse::BadRequest().body(e.to_string());
        }

        handle_service_result(api.store.add_network(network), "add_network")
    }

    pub async fn remove_network(ssid: web::Path<String>, api: web::Data<Self>) -> impl Responder {
        debug!("remove_network() called: {ssid}");

        match api.store.remove_network(&ssid) {
            Ok(true) => HttpResponse::Ok().finish(),
            Ok(false) => HttpResponse::NotFound().body(format!("no saved network {ssid}")),
            Err(e) => {
                error!("remove_network failed: {e:#}");
                HttpResponse::InternalServerError().body(e.to_string())
            }
        }
    }

    /// Register all routes on an actix app.
    pub fn configure(config: &mut web::ServiceConfig) {
        config
            .route("/status", web::get().to(Self::status))
            .route("/healthcheck", web::get().to(Self::healthcheck))
            .route("/version", web::get().to(Self::version))
            .route("/network/ensure", web::post().to(Self::ensure_connectivity))
            .route("/network/access-point", web::post().to(Self::force_ap_mode))
            .route("/network/connect", web::post().to(Self::connect_to))
            .route("/networks", web::get().to(Self::saved_networks))
            .route("/networks", web::post().to(Self::add_network))
            .route("/networks/{ssid}", web::delete().to(Self::remove_network));
    }
}
