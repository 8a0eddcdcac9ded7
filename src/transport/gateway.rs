//! Public gateway HTTP client
//!
//! The resolver talks to gateways through [`GatewayClient`] so racing logic can
//! be exercised against scripted backends. [`HttpGateway`] is the `reqwest`
//! implementation.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{redirect, Client, StatusCode};
use std::time::Duration;
use tracing::debug;

use crate::error::{Result, StrandError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
}

#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub method: Method,
    pub url: String,
    pub timeout: Duration,
}

impl GatewayRequest {
    pub fn get(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            timeout,
        }
    }

    pub fn head(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method: Method::Head,
            url: url.into(),
            timeout,
        }
    }
}

/// A non-error gateway answer (2xx or 3xx)
#[derive(Debug, Clone, Default)]
pub struct GatewayResponse {
    pub status: u16,
    /// Header names are lowercase
    pub headers: Vec<(String, String)>,
    /// URL after redirects
    pub final_url: String,
    pub body: Bytes,
}

impl GatewayResponse {
    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// Issue one request.
    ///
    /// 429 maps to [`StrandError::RateLimited`], other 4xx/5xx to
    /// [`StrandError::Gateway`], an elapsed timeout to [`StrandError::Timeout`].
    async fn request(&self, request: GatewayRequest) -> Result<GatewayResponse>;
}

const USER_AGENT: &str = concat!("strand/", env!("CARGO_PKG_VERSION"));

/// `reqwest`-backed gateway client
#[derive(Clone)]
pub struct HttpGateway {
    /// GET: follows redirects
    client: Client,
    /// HEAD: redirects are surfaced as answers
    no_redirect: Client,
}

impl HttpGateway {
    pub fn new() -> Result<Self> {
        let client = Client::builder().user_agent(USER_AGENT).build()?;
        let no_redirect = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(redirect::Policy::none())
            .build()?;
        Ok(Self {
            client,
            no_redirect,
        })
    }

    /// Use preconfigured clients (proxies, TLS). `no_redirect` should be
    /// built with [`redirect::Policy::none`].
    pub fn with_clients(client: Client, no_redirect: Client) -> Self {
        Self {
            client,
            no_redirect,
        }
    }
}

#[async_trait]
impl GatewayClient for HttpGateway {
    async fn request(&self, request: GatewayRequest) -> Result<GatewayResponse> {
        let builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Head => self.no_redirect.head(&request.url),
        };

        let response = builder
            .timeout(request.timeout)
            .send()
            .await
            .map_err(|e| map_send_error(e, &request.url))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(StrandError::RateLimited(request.url));
        }
        if status.is_client_error() || status.is_server_error() {
            return Err(StrandError::Gateway {
                status: status.as_u16(),
                url: request.url,
            });
        }

        let final_url = response.url().to_string();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
            .collect();

        let body = match request.method {
            Method::Get => response
                .bytes()
                .await
                .map_err(|e| map_send_error(e, &request.url))?,
            Method::Head => Bytes::new(),
        };

        debug!(
            url = %request.url,
            status = status.as_u16(),
            size = body.len(),
            "Gateway responded"
        );

        Ok(GatewayResponse {
            status: status.as_u16(),
            headers,
            final_url,
            body,
        })
    }
}

fn map_send_error(e: reqwest::Error, url: &str) -> StrandError {
    if e.is_timeout() {
        StrandError::Timeout(url.to_string())
    } else {
        StrandError::Http(e)
    }
}
