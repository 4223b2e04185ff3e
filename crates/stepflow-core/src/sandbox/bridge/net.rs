use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, Url};

use super::{BridgeState, HttpResponse};
use crate::sandbox::abi;

impl BridgeState {
    /// Whether the guest may reach `url`: http/https only, and prefixed by
    /// an allow-list entry.
    pub fn url_permitted(&self, url: &Url) -> bool {
        if !matches!(url.scheme(), "http" | "https") {
            return false;
        }
        self.config
            .url_allow_list
            .iter()
            .any(|prefix| url.as_str().starts_with(prefix.as_str()))
    }

    /// Parse and check `url`. An unparsable URL is not permitted.
    pub fn url_allowed(&self, url: &str) -> Option<Url> {
        let parsed = Url::parse(url).ok()?;
        self.url_permitted(&parsed).then_some(parsed)
    }

    /// Perform an HTTP request and buffer its status, headers and body for
    /// the `get_last_response_*` functions.
    pub fn http_request(&mut self, method: &str, url: &str, body: Vec<u8>, headers: Option<&str>) -> u32 {
        if self.cancelled() {
            return abi::CANCELLED;
        }
        let Some(parsed) = self.url_allowed(url) else {
            tracing::warn!("[HostBridge] URL not permitted: {}", url);
            return abi::NOT_PERMITTED;
        };
        self.last_response = None;

        let headers: HashMap<String, String> = match headers {
            Some(raw) if !raw.trim().is_empty() => match serde_json::from_str(raw) {
                Ok(h) => h,
                Err(e) => {
                    tracing::warn!("[HostBridge] Invalid headers JSON: {}", e);
                    return abi::PARSE_FAILED;
                }
            },
            _ => HashMap::new(),
        };

        let method = match Method::from_bytes(method.to_ascii_uppercase().as_bytes()) {
            Ok(m) => m,
            Err(_) => return abi::BUILD_FAILED,
        };

        let needs_json_type = (method == Method::POST || method == Method::PUT)
            && !body.is_empty()
            && !headers.keys().any(|k| k.eq_ignore_ascii_case("content-type"));

        let mut builder = self
            .http
            .request(method.clone(), parsed)
            .timeout(Duration::from_secs(self.config.http_timeout_secs));
        for (name, value) in &headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if needs_json_type {
            builder = builder.header(CONTENT_TYPE, "application/json");
        }
        if !body.is_empty() {
            builder = builder.body(body);
        }
        let request = match builder.build() {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("[HostBridge] Failed to build request: {}", e);
                return abi::BUILD_FAILED;
            }
        };

        tracing::debug!("[HostBridge] {} {}", method, url);

        let client = self.http.clone();
        let max_bytes = self.config.max_buffer_bytes;
        let deadline = tokio::time::Instant::from_std(self.invocation.deadline);
        let outcome = self.handle.block_on(async move {
            tokio::time::timeout_at(deadline, async move {
                let mut response = client
                    .execute(request)
                    .await
                    .map_err(|e| (abi::SEND_FAILED, e.to_string()))?;
                let status = response.status().as_u16();
                let headers = response
                    .headers()
                    .iter()
                    .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
                    .collect::<Vec<_>>();
                let mut body = Vec::new();
                while let Some(chunk) = response
                    .chunk()
                    .await
                    .map_err(|e| (abi::READ_BODY_FAILED, e.to_string()))?
                {
                    if body.len() + chunk.len() > max_bytes {
                        return Err((
                            abi::READ_BODY_FAILED,
                            format!("response body exceeds {} bytes", max_bytes),
                        ));
                    }
                    body.extend_from_slice(&chunk);
                }
                Ok(HttpResponse {
                    status,
                    headers,
                    body: Arc::from(body),
                })
            })
            .await
        });

        match outcome {
            Ok(Ok(response)) => {
                tracing::debug!(
                    "[HostBridge] {} {} -> {} ({} bytes)",
                    method,
                    url,
                    response.status,
                    response.body.len()
                );
                self.last_response = Some(response);
                abi::SUCCESS
            }
            Ok(Err((code, msg))) => {
                tracing::warn!("[HostBridge] {} {} failed: {}", method, url, msg);
                code
            }
            Err(_) => {
                tracing::warn!("[HostBridge] {} {} cancelled at job deadline", method, url);
                abi::CANCELLED
            }
        }
    }
}
