/// Generic HTTP request handler (`http_request`)
///
/// Params (templates already resolved):
/// `{ "url", "method"?: "GET", "headers"?: {..}, "query"?: {..}, "body"? }`
///
/// Output: `{ "status", "headers", "data", "success" }` where `data` is the JSON
/// body if it parses, otherwise the raw text. Non-2xx responses are failures
/// so they count against the `http` circuit breaker.

use crate::runtime::dispatch::NodeHandler;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;

pub struct HttpRequestHandler {
    client: reqwest::Client,
}

impl HttpRequestHandler {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client })
    }
}

/// String-valued entries of a JSON object param; other values are skipped
fn string_map(params: &Value, key: &str) -> Vec<(String, String)> {
    params
        .get(key)
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| match v {
                    Value::String(s) => Some((k.clone(), s.clone())),
                    Value::Number(_) | Value::Bool(_) => Some((k.clone(), v.to_string())),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl NodeHandler for HttpRequestHandler {
    async fn execute(&self, params: &Value, _context: &Value) -> Result<Value> {
        let url = params
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("http_request missing 'url' parameter"))?;
        let method = params
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_uppercase();

        tracing::debug!("🌍 HTTP Request: {} {}", method, url);

        let mut request = match method.as_str() {
            "GET" => self.client.get(url),
            "POST" => self.client.post(url),
            "PUT" => self.client.put(url),
            "DELETE" => self.client.delete(url),
            "PATCH" => self.client.patch(url),
            "HEAD" => self.client.head(url),
            other => bail!("unsupported HTTP method: {other}"),
        };

        for (name, value) in string_map(params, "headers") {
            request = request.header(name, value);
        }
        let query = string_map(params, "query");
        if !query.is_empty() {
            request = request.query(&query);
        }

        match params.get("body") {
            None | Some(Value::Null) => {}
            Some(Value::String(text)) => {
                request = request.header("Content-Type", "text/plain").body(text.clone());
            }
            Some(body) => request = request.json(body),
        }

        let response = request
            .send()
            .await
            .map_err(|e| anyhow!("HTTP request failed: {e}"))?;

        let status = response.status();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), s.to_string())))
            .collect();
        let text = response
            .text()
            .await
            .map_err(|e| anyhow!("failed to read response body: {e}"))?;
        let data = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

        if !status.is_success() {
            bail!("{} {} returned {}", method, url, status);
        }

        tracing::debug!("📡 {} {} -> {}", method, url, status);
        Ok(json!({
            "status": status.as_u16(),
            "headers": headers,
            "data": data,
            "success": true,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_map_keeps_scalars_only() {
        let params = json!({ "headers": { "x-a": "1", "x-b": 2, "x-c": { "nested": true } } });
        let mut map = string_map(&params, "headers");
        map.sort();
        assert_eq!(
            map,
            vec![("x-a".to_string(), "1".to_string()), ("x-b".to_string(), "2".to_string())]
        );
        assert!(string_map(&params, "query").is_empty());
    }

    #[tokio::test]
    async fn missing_url_is_an_error() {
        let handler = HttpRequestHandler::new(Duration::from_secs(1)).unwrap();
        let err = handler.execute(&json!({}), &Value::Null).await.unwrap_err();
        assert!(err.to_string().contains("'url'"));
    }

    #[tokio::test]
    async fn unsupported_method_is_an_error() {
        let handler = HttpRequestHandler::new(Duration::from_secs(1)).unwrap();
        let err = handler
            .execute(&json!({ "url": "http://127.0.0.1:9", "method": "BREW" }), &Value::Null)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("BREW"));
    }
}
