//! Client for the legacy per-service HTTP API.
//!
//! Every instance lives under `/resources/{name}`. Parameters are form
//! encoded for writes and sent as a query string for reads. Status codes
//! carry meaning (409, 404, 412) and are mapped to distinct errors.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use axum::body::{Body, Bytes};
use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::Response;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONNECTION};
use reqwest::{Client, Method};
use serde_json::Value;

use tsuru_types::{BindAppParameters, Plan, ServiceInstance, Unit};

use super::client::{CallMeta, ServiceClient};
use crate::bind::App;
use crate::error::{Result, TsuruError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Query parameters added by the API router that must not reach the service.
const PROXY_STRIPPED_QUERY: &[&str] = &[
    "callback",
    ":service",
    ":instance",
    ":mux-route-name",
    ":mux-path-template",
];

/// Proxied request bodies buffer at most this many frames ahead of the service.
const PROXY_BODY_FRAMES: usize = 8;

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

pub const HEADER_USER: &str = "X-Tsuru-User";
pub const HEADER_EVENT_ID: &str = "X-Tsuru-Eventid";

type Params = Vec<(String, String)>;

pub struct EndpointClient {
    service_name: String,
    endpoint: String,
    username: String,
    password: String,
    request_id_header: Option<String>,
    http: Client,
}

impl EndpointClient {
    pub fn new(
        service_name: &str,
        endpoint: &str,
        username: &str,
        password: &str,
        request_id_header: Option<String>,
    ) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .pool_max_idle_per_host(0)
            .build()?;
        Ok(Self {
            service_name: service_name.to_string(),
            endpoint: endpoint.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            request_id_header,
            http,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.endpoint.trim_end_matches('/'),
            path.trim_matches('/')
        )
    }

    fn base_headers(&self, meta: &CallMeta) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if meta.event_id.is_some() {
            if let Ok(v) = HeaderValue::from_str(&meta.user) {
                headers.insert(HeaderName::from_static("x-tsuru-user"), v);
            }
            if let Ok(v) = HeaderValue::from_str(&meta.event_hex()) {
                headers.insert(HeaderName::from_static("x-tsuru-eventid"), v);
            }
        }
        if let (Some(name), Some(id)) = (&self.request_id_header, &meta.request_id) {
            if let (Ok(n), Ok(v)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(id),
            ) {
                headers.insert(n, v);
            }
        }
        headers
    }

    async fn issue(
        &self,
        method: Method,
        path: &str,
        params: &Params,
        meta: &CallMeta,
    ) -> Result<reqwest::Response> {
        let url = self.url(path);
        let mut req = self
            .http
            .request(method.clone(), &url)
            .headers(self.base_headers(meta))
            .header(ACCEPT, "application/json")
            .header(CONNECTION, "close")
            .basic_auth(&self.username, Some(&self.password));
        req = if method == Method::GET {
            req.query(params)
        } else {
            req.form(params)
        };
        let started = Instant::now();
        let result = req.send().await;
        tracing::debug!(
            service = %self.service_name,
            method = %method,
            path = %path,
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "service request"
        );
        Ok(result?)
    }

    fn resource(instance: &ServiceInstance) -> String {
        format!("/resources/{}", instance.name)
    }
}

/// Reads the body of a rejected response into an error.
async fn unexpected(path: &str, resp: reqwest::Response) -> TsuruError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    TsuruError::UnexpectedStatus {
        url: path.to_string(),
        status,
        body,
    }
}

fn app_hosts(app: &dyn App, params: &mut Params) {
    let ip = app.ip();
    if !ip.is_empty() {
        params.push(("app-hosts".into(), ip.to_string()));
        params.push(("app-host".into(), ip.to_string()));
    }
}

fn event_params(meta: &CallMeta, params: &mut Params) {
    params.push(("user".into(), meta.user.clone()));
    params.push(("eventid".into(), meta.event_hex()));
}

/// Flattens free-form parameters into `parameters.<path>` form fields.
pub fn add_parameters(params: &mut Params, values: &BTreeMap<String, Value>) {
    for (key, value) in values {
        flatten(&format!("parameters.{key}"), value, params);
    }
}

fn flatten(prefix: &str, value: &Value, params: &mut Params) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                flatten(&format!("{prefix}.{k}"), v, params);
            }
        }
        Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                flatten(&format!("{prefix}.{i}"), v, params);
            }
        }
        Value::Null => params.push((prefix.to_string(), String::new())),
        Value::String(s) => params.push((prefix.to_string(), s.clone())),
        other => params.push((prefix.to_string(), other.to_string())),
    }
}

#[async_trait]
impl ServiceClient for EndpointClient {
    async fn create(&self, instance: &mut ServiceInstance, meta: &CallMeta) -> Result<()> {
        let mut params: Params = vec![
            ("name".into(), instance.name.clone()),
            ("team".into(), instance.team_owner.clone()),
        ];
        event_params(meta, &mut params);
        for tag in &instance.tags {
            params.push(("tags".into(), tag.clone()));
        }
        if !instance.plan_name.is_empty() {
            params.push(("plan".into(), instance.plan_name.clone()));
        }
        if !instance.description.is_empty() {
            params.push(("description".into(), instance.description.clone()));
        }
        add_parameters(&mut params, &instance.parameters);
        tracing::debug!(
            service = %instance.service_name,
            instance = %instance.name,
            "creating service instance"
        );
        let path = "/resources";
        let resp = self
            .issue(Method::POST, path, &params, meta)
            .await
            .map_err(|e| TsuruError::endpoint("create", &instance.name, e))?;
        match resp.status().as_u16() {
            s if s < 300 => Ok(()),
            409 => Err(TsuruError::InstanceAlreadyExistsInApi),
            _ => Err(TsuruError::endpoint(
                "create",
                &instance.name,
                unexpected(path, resp).await,
            )),
        }
    }

    async fn update(&self, instance: &mut ServiceInstance, meta: &CallMeta) -> Result<()> {
        let mut params: Params = vec![
            ("description".into(), instance.description.clone()),
            ("team".into(), instance.team_owner.clone()),
            ("plan".into(), instance.plan_name.clone()),
        ];
        for tag in &instance.tags {
            params.push(("tags".into(), tag.clone()));
        }
        event_params(meta, &mut params);
        add_parameters(&mut params, &instance.parameters);
        let path = Self::resource(instance);
        let resp = self
            .issue(Method::PUT, &path, &params, meta)
            .await
            .map_err(|e| TsuruError::endpoint("update", &instance.name, e))?;
        match resp.status().as_u16() {
            s if s < 300 => Ok(()),
            // Services predating the update call answer 404.
            404 => Ok(()),
            _ => Err(TsuruError::endpoint(
                "update",
                &instance.name,
                unexpected(&path, resp).await,
            )),
        }
    }

    async fn destroy(&self, instance: &ServiceInstance, meta: &CallMeta) -> Result<()> {
        let mut params = Params::new();
        event_params(meta, &mut params);
        let path = Self::resource(instance);
        let resp = self
            .issue(Method::DELETE, &path, &params, meta)
            .await
            .map_err(|e| TsuruError::endpoint("destroy", &instance.name, e))?;
        match resp.status().as_u16() {
            s if s < 300 => Ok(()),
            404 => Err(TsuruError::InstanceNotFoundInApi),
            _ => Err(TsuruError::endpoint(
                "destroy",
                &instance.name,
                unexpected(&path, resp).await,
            )),
        }
    }

    async fn bind_app(
        &self,
        instance: &ServiceInstance,
        app: &dyn App,
        bind_params: &BindAppParameters,
        meta: &CallMeta,
    ) -> Result<BTreeMap<String, String>> {
        let mut params = Params::new();
        add_parameters(&mut params, bind_params);
        params.push(("app-name".into(), app.name().to_string()));
        event_params(meta, &mut params);
        app_hosts(app, &mut params);

        let mut path = format!("{}/bind-app", Self::resource(instance));
        let mut resp = self
            .issue(Method::POST, &path, &params, meta)
            .await
            .map_err(|e| TsuruError::endpoint("bind", &instance.name, e))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            tracing::debug!(
                instance = %instance.name,
                "bind-app not found, retrying legacy bind route"
            );
            path = format!("{}/bind", Self::resource(instance));
            resp = self
                .issue(Method::POST, &path, &params, meta)
                .await
                .map_err(|e| TsuruError::endpoint("bind", &instance.name, e))?;
        }
        match resp.status().as_u16() {
            s if s < 300 => {
                let body = resp.bytes().await?;
                if body.iter().all(u8::is_ascii_whitespace) {
                    return Ok(BTreeMap::new());
                }
                Ok(serde_json::from_slice(&body)?)
            }
            412 => Err(TsuruError::InstanceNotReady),
            404 => Err(TsuruError::InstanceNotFoundInApi),
            _ => Err(TsuruError::endpoint(
                "bind",
                &instance.name,
                unexpected(&path, resp).await,
            )),
        }
    }

    async fn bind_unit(
        &self,
        instance: &ServiceInstance,
        app: &dyn App,
        unit: &Unit,
    ) -> Result<()> {
        let mut params: Params = vec![
            ("app-name".into(), app.name().to_string()),
            ("unit-host".into(), unit.ip.clone()),
        ];
        app_hosts(app, &mut params);
        let path = format!("{}/bind", Self::resource(instance));
        let resp = self
            .issue(Method::POST, &path, &params, &CallMeta::default())
            .await
            .map_err(|e| TsuruError::endpoint("bind", &instance.name, e))?;
        match resp.status().as_u16() {
            412 => Err(TsuruError::InstanceNotReady),
            404 => Err(TsuruError::InstanceNotFoundInApi),
            s if s < 300 => Ok(()),
            _ => Err(TsuruError::endpoint(
                "bind",
                &instance.name,
                unexpected(&path, resp).await,
            )),
        }
    }

    async fn unbind_app(
        &self,
        instance: &ServiceInstance,
        app: &dyn App,
        meta: &CallMeta,
    ) -> Result<()> {
        let mut params: Params = vec![("app-name".into(), app.name().to_string())];
        app_hosts(app, &mut params);
        event_params(meta, &mut params);
        let path = format!("{}/bind-app", Self::resource(instance));
        let resp = self
            .issue(Method::DELETE, &path, &params, meta)
            .await
            .map_err(|e| TsuruError::endpoint("unbind", &instance.name, e))?;
        match resp.status().as_u16() {
            s if s < 300 => Ok(()),
            404 => Err(TsuruError::InstanceNotFoundInApi),
            _ => Err(TsuruError::endpoint(
                "unbind",
                &instance.name,
                unexpected(&path, resp).await,
            )),
        }
    }

    async fn unbind_unit(
        &self,
        instance: &ServiceInstance,
        app: &dyn App,
        unit: &Unit,
    ) -> Result<()> {
        let mut params: Params = vec![("unit-host".into(), unit.ip.clone())];
        app_hosts(app, &mut params);
        let path = format!("{}/bind", Self::resource(instance));
        let resp = self
            .issue(Method::DELETE, &path, &params, &CallMeta::default())
            .await
            .map_err(|e| TsuruError::endpoint("unbind", &instance.name, e))?;
        match resp.status().as_u16() {
            s if s < 300 => Ok(()),
            404 => Err(TsuruError::InstanceNotFoundInApi),
            _ => Err(TsuruError::endpoint(
                "unbind",
                &instance.name,
                unexpected(&path, resp).await,
            )),
        }
    }

    async fn status(&self, instance: &ServiceInstance, meta: &CallMeta) -> Result<String> {
        let path = format!("{}/status", Self::resource(instance));
        let resp = self
            .issue(Method::GET, &path, &Params::new(), meta)
            .await
            .map_err(|e| TsuruError::endpoint("get status of", &instance.name, e))?;
        match resp.status().as_u16() {
            200 => Ok(resp.text().await?),
            202 => Ok("pending".to_string()),
            204 => Ok("up".to_string()),
            404 => Ok("not implemented for this service".to_string()),
            500 => Ok("down".to_string()),
            _ => Err(TsuruError::endpoint(
                "get status of",
                &instance.name,
                unexpected(&path, resp).await,
            )),
        }
    }

    async fn info(
        &self,
        instance: &ServiceInstance,
        meta: &CallMeta,
    ) -> Result<Vec<BTreeMap<String, String>>> {
        let path = Self::resource(instance);
        let resp = self.issue(Method::GET, &path, &Params::new(), meta).await?;
        if resp.status() != reqwest::StatusCode::OK {
            return Ok(Vec::new());
        }
        Ok(resp.json().await?)
    }

    async fn plans(&self, meta: &CallMeta) -> Result<Vec<Plan>> {
        let resp = self
            .issue(Method::GET, "/resources/plans", &Params::new(), meta)
            .await?;
        if resp.status() != reqwest::StatusCode::OK {
            return Ok(Vec::new());
        }
        Ok(resp.json().await?)
    }

    async fn proxy(&self, path: &str, meta: &CallMeta, request: Request) -> Result<Response> {
        let (parts, body) = request.into_parts();
        let mut target = url::Url::parse(&self.url(path))
            .map_err(|e| TsuruError::InvalidInput(format!("invalid proxy url: {e}")))?;
        if let Some(query) = parts.uri.query() {
            let kept: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
                .into_owned()
                .filter(|(k, _)| !PROXY_STRIPPED_QUERY.contains(&k.as_str()))
                .collect();
            if !kept.is_empty() {
                target.query_pairs_mut().extend_pairs(kept);
            }
        }

        let method = Method::from_bytes(parts.method.as_str().as_bytes())
            .map_err(|e| TsuruError::InvalidInput(format!("invalid method: {e}")))?;
        let mut headers = HeaderMap::new();
        for (name, value) in parts.headers.iter() {
            if HOP_BY_HOP.contains(&name.as_str()) {
                continue;
            }
            if let (Ok(n), Ok(v)) = (
                HeaderName::from_bytes(name.as_str().as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                headers.append(n, v);
            }
        }
        headers.extend(self.base_headers(meta));
        tracing::debug!(service = %self.service_name, url = %target, "proxying request");
        let resp = self
            .http
            .request(method, target)
            .headers(headers)
            .basic_auth(&self.username, Some(&self.password))
            .body(streaming_body(body))
            .send()
            .await?;

        let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        let mut builder = Response::builder().status(status);
        for (name, value) in resp.headers() {
            if HOP_BY_HOP.contains(&name.as_str()) {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_bytes());
        }
        builder
            .body(Body::from_stream(resp.bytes_stream()))
            .map_err(|e| TsuruError::Internal(anyhow::Error::new(e)))
    }
}

/// Forwards `body` frame by frame. axum bodies are not `Sync`, so the frames
/// go through a channel that reqwest can own.
fn streaming_body(body: Body) -> reqwest::Body {
    let (mut tx, rx) = mpsc::channel::<std::result::Result<Bytes, axum::Error>>(PROXY_BODY_FRAMES);
    tokio::spawn(async move {
        let mut frames = body.into_data_stream();
        while let Some(frame) = frames.next().await {
            let failed = frame.is_err();
            if tx.send(frame).await.is_err() || failed {
                break;
            }
        }
    });
    reqwest::Body::wrap_stream(rx)
}
