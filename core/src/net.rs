use std::collections::HashMap;
use std::io::Read;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, RANGE};
use url::Url;

use crate::config::EngineConfig;
use crate::error::{CoreError, CoreResult};
use crate::segment::Segment;

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub index: usize,
    pub url: String,
    pub range: Option<(u64, u64)>,
}

impl FetchRequest {
    pub fn for_segment(segment: &Segment) -> Self {
        Self {
            index: segment.index,
            url: segment.uri.clone(),
            range: segment.range,
        }
    }
}

pub struct FetchResponse {
    pub status: u16,
    pub content_length: Option<u64>,
    pub body: Box<dyn Read + Send>,
}

impl FetchResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub trait SegmentTransport: Send + Sync {
    fn get(&self, req: &FetchRequest) -> CoreResult<FetchResponse>;
}

#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
    headers: HeaderMap,
}

impl ReqwestTransport {
    pub fn new(config: &EngineConfig) -> CoreResult<Self> {
        let mut builder = Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)));
        if let Some(proxy_url) = &config.proxy {
            let proxy = reqwest::Proxy::all(proxy_url.as_str())
                .map_err(|err| CoreError::Network(err.to_string()))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|err| CoreError::Network(err.to_string()))?;
        Ok(Self {
            client,
            headers: build_headers(&config.headers)?,
        })
    }
}

fn build_headers(headers: &HashMap<String, String>) -> CoreResult<HeaderMap> {
    let mut map = HeaderMap::new();
    for (key, value) in headers {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|err| CoreError::InvalidInput(err.to_string()))?;
        let value =
            HeaderValue::from_str(value).map_err(|err| CoreError::InvalidInput(err.to_string()))?;
        map.insert(name, value);
    }
    Ok(map)
}

impl SegmentTransport for ReqwestTransport {
    fn get(&self, req: &FetchRequest) -> CoreResult<FetchResponse> {
        let url = Url::parse(&req.url)
            .map_err(|err| CoreError::InvalidInput(format!("{}: {}", req.url, err)))?;
        let mut headers = self.headers.clone();
        if let Some((start, end)) = req.range {
            let value = format!("bytes={}-{}", start, end);
            headers.insert(
                RANGE,
                HeaderValue::from_str(&value).map_err(|err| CoreError::Network(err.to_string()))?,
            );
        }
        let resp = self
            .client
            .get(url)
            .headers(headers)
            .send()
            .map_err(|err| CoreError::Network(err.to_string()))?;
        let status = resp.status().as_u16();
        let content_length = resp
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok());
        Ok(FetchResponse {
            status,
            content_length,
            body: Box::new(resp),
        })
    }
}
