//! Local daemon RPC client (Kubo-compatible `/api/v0`)
//!
//! Every call is a POST with query arguments. Heavy calls (`add`,
//! `name/publish`, `block/put`) go through [`with_retry`]; reads do not,
//! because the resolver already races them against public gateways.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use super::retry::{with_retry, RetryPolicy};
use crate::backend::origin_of;
use crate::error::{Result, StrandError};
use crate::ids::ContentAddress;
use crate::publish::ContentWriter;
use crate::resolver::LocalBackend;

/// Where the local daemon lives and how to authenticate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonEndpoint {
    /// API base, e.g. `http://127.0.0.1:5001`
    pub url: String,
    /// Optional basic-auth pair
    pub credentials: Option<(String, String)>,
}

impl DaemonEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, user: impl Into<String>, pass: impl Into<String>) -> Self {
        self.credentials = Some((user.into(), pass.into()));
        self
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IdResponse {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PathResponse {
    path: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AddResponse {
    hash: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PublishResponse {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BlockPutResponse {
    key: String,
}

/// RPC client for one daemon endpoint
#[derive(Clone)]
pub struct DaemonClient {
    client: Client,
    endpoint: DaemonEndpoint,
    retry: RetryPolicy,
}

impl DaemonClient {
    pub fn new(endpoint: DaemonEndpoint, retry: RetryPolicy) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("strand/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_client(client, endpoint, retry))
    }

    /// Share a connection pool across short-lived clients
    pub fn with_client(client: Client, endpoint: DaemonEndpoint, retry: RetryPolicy) -> Self {
        Self {
            client,
            endpoint,
            retry,
        }
    }

    pub fn endpoint(&self) -> &DaemonEndpoint {
        &self.endpoint
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v0/{}", self.endpoint.url.trim_end_matches('/'), path)
    }

    fn post(&self, url: &str, timeout: Duration) -> RequestBuilder {
        let builder = self.client.post(url).timeout(timeout);
        match &self.endpoint.credentials {
            Some((user, pass)) => builder.basic_auth(user, Some(pass)),
            None => builder,
        }
    }

    /// Identity check; doubles as a reachability probe
    pub async fn id(&self, timeout: Duration) -> Result<String> {
        let url = self.url("id");
        let response = send(self.post(&url, timeout), &url).await?;
        let body: IdResponse = parse_json(response, &url).await?;
        Ok(body.id)
    }

    pub async fn name_resolve(&self, name: &str, timeout: Duration) -> Result<ContentAddress> {
        let url = format!(
            "{}?arg={}&recursive=true",
            self.url("name/resolve"),
            urlencoding::encode(name)
        );
        let response = send(self.post(&url, timeout), &url).await?;
        let body: PathResponse = parse_json(response, &url).await?;
        ContentAddress::parse(&body.path)
    }

    /// Point the daemon key `key` at `address`; returns the published name
    pub async fn name_publish(
        &self,
        address: &ContentAddress,
        key: &str,
        timeout: Duration,
    ) -> Result<String> {
        let url = format!(
            "{}?arg={}&key={}&allow-offline=true",
            self.url("name/publish"),
            urlencoding::encode(&format!("/ipfs/{}", address)),
            urlencoding::encode(key)
        );

        let body: PublishResponse = with_retry(&self.retry, "name/publish", || async {
            let response = send(self.post(&url, timeout), &url).await?;
            parse_json(response, &url).await
        })
        .await?;

        info!(name = %body.name, address = %address, "Published name");
        Ok(body.name)
    }

    /// Add and pin bytes, returning their CIDv1
    pub async fn add(&self, data: Bytes, timeout: Duration) -> Result<ContentAddress> {
        let url = format!("{}?pin=true&cid-version=1", self.url("add"));

        let body: AddResponse = with_retry(&self.retry, "add", || async {
            // Forms are single-use, rebuild per attempt
            let form = Form::new().part("file", Part::bytes(data.to_vec()).file_name("data"));
            let response = send(self.post(&url, timeout).multipart(form), &url).await?;
            parse_json(response, &url).await
        })
        .await?;

        debug!(address = %body.hash, size = data.len(), "Added content");
        ContentAddress::parse(&body.hash)
    }

    pub async fn cat(&self, address: &ContentAddress, timeout: Duration) -> Result<Bytes> {
        let url = format!("{}?arg={}", self.url("cat"), address);
        let response = send(self.post(&url, timeout), &url).await?;
        read_body(response, &url).await
    }

    /// Write a raw block
    pub async fn block_put(&self, data: Bytes, timeout: Duration) -> Result<ContentAddress> {
        let url = format!("{}?cid-codec=raw&pin=true", self.url("block/put"));

        let body: BlockPutResponse = with_retry(&self.retry, "block/put", || async {
            let form = Form::new().part("data", Part::bytes(data.to_vec()).file_name("block"));
            let response = send(self.post(&url, timeout).multipart(form), &url).await?;
            parse_json(response, &url).await
        })
        .await?;

        ContentAddress::parse(&body.key)
    }
}

async fn send(builder: RequestBuilder, url: &str) -> Result<Response> {
    let response = builder.send().await.map_err(|e| transport_error(e, url))?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = response.text().await.unwrap_or_default();
    debug!(url = %url, status = status.as_u16(), message = %message, "Daemon call failed");
    if status == StatusCode::TOO_MANY_REQUESTS {
        Err(StrandError::RateLimited(url.to_string()))
    } else {
        Err(StrandError::Gateway {
            status: status.as_u16(),
            url: url.to_string(),
        })
    }
}

async fn parse_json<T: DeserializeOwned>(response: Response, url: &str) -> Result<T> {
    let bytes = read_body(response, url).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

async fn read_body(response: Response, url: &str) -> Result<Bytes> {
    response.bytes().await.map_err(|e| transport_error(e, url))
}

fn transport_error(e: reqwest::Error, url: &str) -> StrandError {
    if e.is_timeout() {
        StrandError::Timeout(url.to_string())
    } else {
        StrandError::Http(e)
    }
}

#[async_trait]
impl LocalBackend for DaemonClient {
    fn origin(&self) -> String {
        origin_of(&self.endpoint.url).unwrap_or_else(|| self.endpoint.url.clone())
    }

    async fn resolve_name(&self, name: &str, timeout: Duration) -> Result<ContentAddress> {
        self.name_resolve(name, timeout).await
    }

    async fn fetch(&self, address: &ContentAddress, timeout: Duration) -> Result<Bytes> {
        let bytes = self.cat(address, timeout).await?;
        if bytes.is_empty() {
            return Err(StrandError::NoAnswer(self.url("cat")));
        }
        Ok(bytes)
    }
}

#[async_trait]
impl ContentWriter for DaemonClient {
    async fn add(&self, data: Bytes, timeout: Duration) -> Result<ContentAddress> {
        DaemonClient::add(self, data, timeout).await
    }

    async fn publish(&self, address: &ContentAddress, key: &str, timeout: Duration) -> Result<String> {
        self.name_publish(address, key, timeout).await
    }
}
