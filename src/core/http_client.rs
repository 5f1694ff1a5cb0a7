use std::collections::HashMap;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};

use streamsave_core::models::settings::ProxySettings;

pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

pub type Headers = HashMap<String, String>;

pub struct HttpResponse {
    pub status: u16,
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
    pub body: BoxStream<'static, anyhow::Result<Bytes>>,
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .field("content_type", &self.content_type)
            .finish()
    }
}

/// GET-only HTTP capability. Non-2xx responses are errors.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get(
        &self,
        url: &str,
        headers: &Headers,
        range_start: Option<u64>,
    ) -> anyhow::Result<HttpResponse>;

    async fn get_bytes(&self, url: &str, headers: &Headers) -> anyhow::Result<Vec<u8>> {
        let response = self.get(url, headers, None).await?;
        let chunks: Vec<Bytes> = response.body.try_collect().await?;
        Ok(chunks.concat())
    }

    async fn get_text(&self, url: &str, headers: &Headers) -> anyhow::Result<String> {
        let bytes = self.get_bytes(url, headers).await?;
        String::from_utf8(bytes).map_err(|e| anyhow!("Response from {} is not UTF-8: {}", url, e))
    }
}

pub fn default_headers() -> Headers {
    HashMap::from([
        ("User-Agent".to_string(), USER_AGENT.to_string()),
        ("Accept".to_string(), "*/*".to_string()),
        ("Accept-Encoding".to_string(), "identity".to_string()),
    ])
}

/// Caller headers win over defaults; keys compare case-insensitively.
pub fn merge_headers(caller: &Headers, defaults: &Headers) -> Headers {
    let mut merged = caller.clone();
    for (key, value) in defaults {
        if !merged.keys().any(|k| k.eq_ignore_ascii_case(key)) {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

pub fn link_headers(link_headers: &Headers, referer: &str) -> Headers {
    let mut caller = link_headers.clone();
    if !referer.is_empty() && !caller.keys().any(|k| k.eq_ignore_ascii_case("referer")) {
        caller.insert("Referer".into(), referer.into());
    }
    merge_headers(&caller, &default_headers())
}

pub fn apply_proxy(
    builder: reqwest::ClientBuilder,
    proxy: &ProxySettings,
) -> reqwest::ClientBuilder {
    if !proxy.enabled || proxy.host.is_empty() {
        return builder;
    }
    let scheme = match proxy.proxy_type.as_str() {
        "socks5" => "socks5",
        "https" => "https",
        _ => "http",
    };
    let proxy_url = if !proxy.username.is_empty() {
        format!(
            "{}://{}:{}@{}:{}",
            scheme, proxy.username, proxy.password, proxy.host, proxy.port
        )
    } else {
        format!("{}://{}:{}", scheme, proxy.host, proxy.port)
    };
    match reqwest::Proxy::all(&proxy_url) {
        Ok(p) => builder.proxy(p),
        Err(e) => {
            tracing::warn!("Invalid proxy URL: {}", e);
            builder
        }
    }
}

pub struct ReqwestHttp {
    client: reqwest::Client,
}

impl ReqwestHttp {
    pub fn new(proxy: &ProxySettings) -> anyhow::Result<Self> {
        let builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(50)
            .pool_idle_timeout(Duration::from_secs(30));
        let client = apply_proxy(builder, proxy).build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpClient for ReqwestHttp {
    async fn get(
        &self,
        url: &str,
        headers: &Headers,
        range_start: Option<u64>,
    ) -> anyhow::Result<HttpResponse> {
        let mut request = self.client.get(url);
        for (key, value) in headers {
            request = request.header(key.as_str(), value.as_str());
        }
        if let Some(start) = range_start.filter(|s| *s > 0) {
            request = request.header("Range", format!("bytes={}-", start));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("HTTP {} for {}", status.as_u16(), url);
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());

        Ok(HttpResponse {
            status: status.as_u16(),
            content_length: response.content_length(),
            content_type,
            body: response.bytes_stream().map_err(anyhow::Error::from).boxed(),
        })
    }
}
