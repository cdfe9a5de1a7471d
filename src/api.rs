//! REST API for managing apps
//!
//! Registration, deploy, stop and delete plus descriptor and log reads. The
//! deploy endpoint streams the live build+console log as plain text while
//! the attempt runs; its 200 means "the attempt was accepted and ran", the
//! build outcome is visible only in the returned status fields and log
//! text. Listens on its own port so the proxy keeps the whole path
//! namespace for apps.

use crate::app::AppManager;
use crate::error::AppError;
use crate::estate::AppEstate;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Bytes, Frame, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

type ApiBody = BoxBody<Bytes, hyper::Error>;

#[derive(Debug, Deserialize)]
struct CreateAppRequest {
    #[serde(rename = "gitUrl")]
    git_url: Option<String>,
    #[serde(rename = "appName")]
    app_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpdateAppRequest {
    #[serde(rename = "gitUrl")]
    git_url: Option<String>,
}

pub struct ApiServer {
    listener: TcpListener,
    estate: Arc<AppEstate>,
    proxy_port: u16,
    shutdown_rx: watch::Receiver<bool>,
}

impl ApiServer {
    pub async fn bind(
        addr: SocketAddr,
        estate: Arc<AppEstate>,
        proxy_port: u16,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            estate,
            proxy_port,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr().expect("bound listener has an address")
    }

    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        info!(addr = %self.local_addr(), "API server listening");
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let api = Arc::clone(&self);
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let api = Arc::clone(&api);
                                    async move { api.handle_request(req).await }
                                });
                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("API server shutting down");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_request(
        self: Arc<Self>,
        req: Request<Incoming>,
    ) -> Result<Response<ApiBody>, hyper::Error> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        debug!(%method, %path, "API request");

        let host = req
            .headers()
            .get(hyper::header::HOST)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("localhost")
            .to_string();

        let segments: Vec<String> = path
            .trim_start_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        let segments: Vec<&str> = segments.iter().map(String::as_str).collect();

        match (method, segments.as_slice()) {
            (Method::GET, ["apps"]) => Ok(self.list_apps(&host)),
            (Method::POST, ["apps"]) => self.create_app(req, &host).await,
            (Method::GET, ["apps", name]) => Ok(self.get_app(name, &host)),
            (Method::PUT, ["apps", name]) => {
                let name = name.to_string();
                self.update_app(&name, req, &host).await
            }
            (Method::DELETE, ["apps", name]) => {
                let name = name.to_string();
                Ok(self.delete_app(&name, &host).await)
            }
            (Method::POST, ["apps", name, "deploy"]) => {
                let name = name.to_string();
                Ok(self.deploy_app(&name, &req, &host).await)
            }
            (Method::PUT, ["apps", name, "stop"]) => {
                let name = name.to_string();
                Ok(self.stop_app(&name, &host).await)
            }
            (Method::GET, ["apps", name, "build.log"]) => {
                Ok(self.app_log(name, |m| m.build_log()))
            }
            (Method::GET, ["apps", name, "console.log"]) => {
                Ok(self.app_log(name, |m| m.console_log()))
            }
            _ => Ok(json_message(StatusCode::NOT_FOUND, "Not found")),
        }
    }

    fn list_apps(&self, host: &str) -> Response<ApiBody> {
        let apps: Vec<_> = self
            .estate
            .all()
            .iter()
            .map(|m| self.app_json(m, host))
            .collect();
        json_response(
            StatusCode::OK,
            json!({ "appCount": apps.len(), "apps": apps }).to_string(),
        )
    }

    async fn create_app(
        &self,
        req: Request<Incoming>,
        host: &str,
    ) -> Result<Response<ApiBody>, hyper::Error> {
        let host = host.to_string();
        let body = req.into_body().collect().await?.to_bytes();
        let parsed: CreateAppRequest = match serde_json::from_slice(&body) {
            Ok(parsed) => parsed,
            Err(e) => {
                return Ok(json_message(
                    StatusCode::BAD_REQUEST,
                    &format!("Invalid request body: {}", e),
                ))
            }
        };

        let Some(git_url) = parsed.git_url.filter(|u| !u.is_empty()) else {
            return Ok(json_message(StatusCode::BAD_REQUEST, "No git URL was specified"));
        };

        info!(url = %git_url, "Received request to create app");
        match self.estate.add_app(&git_url, parsed.app_name.as_deref()).await {
            Ok(manager) => {
                let mut response = json_response(
                    StatusCode::CREATED,
                    self.app_json(&manager, &host).to_string(),
                );
                if let Ok(location) =
                    hyper::header::HeaderValue::from_str(&format!("/apps/{}", manager.name()))
                {
                    response
                        .headers_mut()
                        .insert(hyper::header::LOCATION, location);
                }
                Ok(response)
            }
            Err(e) => Ok(error_json(&e)),
        }
    }

    fn get_app(&self, name: &str, host: &str) -> Response<ApiBody> {
        match self.estate.app(name) {
            Some(manager) => {
                json_response(StatusCode::OK, self.app_json(&manager, host).to_string())
            }
            None => json_message(StatusCode::NOT_FOUND, &format!("No app found with name '{}'", name)),
        }
    }

    async fn update_app(
        &self,
        name: &str,
        req: Request<Incoming>,
        host: &str,
    ) -> Result<Response<ApiBody>, hyper::Error> {
        let body = req.into_body().collect().await?.to_bytes();
        let parsed: UpdateAppRequest = serde_json::from_slice(&body).unwrap_or(UpdateAppRequest {
            git_url: None,
        });
        let Some(git_url) = parsed.git_url.filter(|u| !u.is_empty()) else {
            return Ok(json_message(StatusCode::BAD_REQUEST, "No git URL was specified"));
        };

        match self.estate.update_git_url(name, &git_url).await {
            Ok(()) => Ok(self.get_app(name, host)),
            Err(e) => Ok(error_json(&e)),
        }
    }

    async fn delete_app(&self, name: &str, host: &str) -> Response<ApiBody> {
        match self.estate.remove(name).await {
            Ok(manager) => json_response(StatusCode::OK, self.app_json(&manager, host).to_string()),
            // Deleting an unknown app is a bad request rather than a 404
            Err(AppError::AppNotFound(name)) => json_message(
                StatusCode::BAD_REQUEST,
                &format!("No app found with name '{}'", name),
            ),
            Err(e) => error_json(&e),
        }
    }

    async fn stop_app(&self, name: &str, host: &str) -> Response<ApiBody> {
        match self.estate.stop(name).await {
            Ok(()) => self.get_app(name, host),
            Err(e) => error_json(&e),
        }
    }

    /// Run a deploy. Default response streams the live log as plain text;
    /// with `Accept: application/json` the attempt runs to completion and
    /// the descriptor is returned. Both are 200 regardless of build outcome.
    async fn deploy_app(
        &self,
        name: &str,
        req: &Request<Incoming>,
        host: &str,
    ) -> Response<ApiBody> {
        if self.estate.app(name).is_none() {
            return json_message(
                StatusCode::NOT_FOUND,
                &format!("No app found with name '{}'", name),
            );
        }

        let wants_json = req
            .headers()
            .get(hyper::header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("application/json"))
            .unwrap_or(false);

        if wants_json {
            if let Err(e) = self.estate.deploy(name, None).await {
                // Recorded in the build status; the request itself succeeded
                debug!(app = %name, error = %e, "Deploy attempt failed");
            }
            return self.get_app(name, host);
        }

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        let estate = Arc::clone(&self.estate);
        let app_name = name.to_string();
        tokio::spawn(async move {
            if let Err(e) = estate.deploy(&app_name, Some(tx)).await {
                debug!(app = %app_name, error = %e, "Deploy attempt failed");
            }
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv()
                .await
                .map(|line| (Ok::<_, hyper::Error>(Frame::data(Bytes::from(line))), rx))
        });
        Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, "text/plain;charset=utf-8")
            .body(StreamBody::new(stream).boxed())
            .expect("valid response with static headers")
    }

    fn app_log<F>(&self, name: &str, read: F) -> Response<ApiBody>
    where
        F: Fn(&AppManager) -> String,
    {
        match self.estate.app(name) {
            Some(manager) => text_response(StatusCode::OK, read(&manager)),
            None => json_message(
                StatusCode::NOT_FOUND,
                &format!("No app found with name '{}'", name),
            ),
        }
    }

    /// Descriptor for one app as returned by every endpoint
    fn app_json(&self, manager: &Arc<AppManager>, host: &str) -> serde_json::Value {
        let name = manager.name();
        let hostname = host.split(':').next().unwrap_or("localhost");
        let availability = manager.availability();
        json!({
            "name": name,
            "gitUrl": manager.git_url(),
            "url": format!("http://{}:{}/{}/", hostname, self.proxy_port, name),
            "available": availability.available,
            "availableStatus": availability.status_text,
            "lastBuild": manager.last_build(),
            "lastSuccessfulBuild": manager.last_successful_build(),
            "buildLogUrl": format!("http://{}/apps/{}/build.log", host, name),
            "consoleLogUrl": format!("http://{}/apps/{}/console.log", host, name),
            "deployUrl": format!("http://{}/apps/{}/deploy", host, name),
        })
    }
}

fn json_response(status: StatusCode, body: String) -> Response<ApiBody> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response with static headers")
}

fn json_message(status: StatusCode, message: &str) -> Response<ApiBody> {
    json_response(status, json!({ "message": message }).to_string())
}

fn text_response(status: StatusCode, body: String) -> Response<ApiBody> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain;charset=utf-8")
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response with static headers")
}

/// Map a domain error onto its HTTP shape
fn error_json(error: &AppError) -> Response<ApiBody> {
    let message = match error {
        AppError::UnsupportedProjectType(_) => "No suitable runner found for this app".to_string(),
        AppError::Git(e) => format!("Could not clone git repository: {}", e),
        other => other.to_string(),
    };
    json_message(error.status_code(), &message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_json_status_and_message() {
        let response = error_json(&AppError::AppExists("blog".into()));
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = error_json(&AppError::UnsupportedProjectType("/x".into()));
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);

        let response = error_json(&AppError::Git("remote hung up".into()));
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_json_message_shape() {
        let response = json_message(StatusCode::NOT_FOUND, "nope");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json"
        );
    }
}
