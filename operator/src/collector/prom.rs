use std::{collections::HashMap, time::Duration};

use anyhow::{anyhow, Context, Result};
use resources::config::{MetricsAuth, OperatorConfig};
use serde_json::Value as JsonValue;

use crate::guard::EndpointGuard;

/// One element of an instant-vector response.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorSample {
    pub labels: HashMap<String, String>,
    pub timestamp: f64,
    pub value: f64,
}

/// Prometheus HTTP API client. With a tenant id configured every request
/// carries `X-Scope-OrgID` (Grafana Mimir); without one this degrades to a
/// plain Prometheus client.
pub struct PromClient {
    http: reqwest::Client,
    base: String,
    tenant: Option<String>,
    auth: MetricsAuth,
    guard: EndpointGuard,
}

impl PromClient {
    pub fn new(config: &OperatorConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.prom_timeout_secs))
            .build()
            .with_context(|| "Failed to build metrics HTTP client")?;
        Ok(Self {
            http,
            base: config.metrics_url.trim_end_matches('/').to_owned(),
            tenant: config.mimir_tenant_id.clone(),
            auth: config.metrics_auth.clone(),
            guard: EndpointGuard::new("prometheus", config.prom_rate_limit),
        })
    }

    /// Run an instant query, returning the vector result. Transport
    /// failures are retried with bounded backoff behind the guard; a
    /// malformed body is not, so the caller can advance its fallback list.
    pub async fn instant(&self, query: &str) -> Result<Vec<VectorSample>> {
        let body = self
            .guard
            .retry(|| async {
                let body = self
                    .build_request(query)
                    .send()
                    .await?
                    .error_for_status()?
                    .json::<JsonValue>()
                    .await?;
                Ok::<JsonValue, anyhow::Error>(body)
            })
            .await?;
        parse_instant_vector(&body)
    }

    fn build_request(&self, query: &str) -> reqwest::RequestBuilder {
        let mut request = self
            .http
            .get(format!("{}/api/v1/query", self.base))
            .query(&[("query", query)]);
        if let Some(tenant) = &self.tenant {
            request = request.header("X-Scope-OrgID", tenant);
        }
        match &self.auth {
            MetricsAuth::None => request,
            MetricsAuth::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            },
            MetricsAuth::Bearer { token } => request.bearer_auth(token),
            MetricsAuth::Headers { headers } => {
                for (name, value) in headers {
                    request = request.header(name.as_str(), value.as_str());
                }
                request
            },
        }
    }
}

/// Unwrap `{"status": "success", "data": {"resultType": "vector", ...}}`.
pub fn parse_instant_vector(body: &JsonValue) -> Result<Vec<VectorSample>> {
    let status = body
        .get("status")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| anyhow!("Missing status in metrics response"))?;
    if status != "success" {
        return Err(anyhow!("Metrics query failed with status {}", status));
    }
    let data = body
        .get("data")
        .ok_or_else(|| anyhow!("Missing data in metrics response"))?;
    let result_type = data
        .get("resultType")
        .and_then(JsonValue::as_str)
        .unwrap_or_default();
    if result_type != "vector" {
        return Err(anyhow!("Expecting vector result, got {}", result_type));
    }
    let result = data
        .get("result")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| anyhow!("Expecting result array"))?;

    let mut samples = Vec::with_capacity(result.len());
    for entry in result {
        let labels = entry
            .get("metric")
            .and_then(JsonValue::as_object)
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.to_owned(), v.to_owned())))
                    .collect::<HashMap<_, _>>()
            })
            .unwrap_or_default();
        let (timestamp, value) = unwrap_instant_value(
            entry
                .get("value")
                .and_then(JsonValue::as_array)
                .ok_or_else(|| anyhow!("Expecting instant value pair"))?,
        )?;
        samples.push(VectorSample {
            labels,
            timestamp,
            value,
        });
    }
    Ok(samples)
}

fn unwrap_instant_value(value: &[JsonValue]) -> Result<(f64, f64)> {
    if value.len() != 2 {
        return Err(anyhow!("Expecting array of length 2"));
    }
    match (value[0].as_f64(), value[1].as_str()) {
        (Some(timestamp), Some(value)) => value
            .parse::<f64>()
            .map(|value| (timestamp, value))
            .with_context(|| "Failed to parse value as f64"),
        _ => Err(anyhow!("Expecting pair of f64 and string")),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_vector_response() {
        let body = json!({
            "status": "success",
            "data": {
                "resultType": "vector",
                "result": [
                    {
                        "metric": {"instance": "node-a"},
                        "value": [1700000000.0, "42.5"]
                    }
                ]
            }
        });
        let samples = parse_instant_vector(&body).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].labels.get("instance").unwrap(), "node-a");
        assert_eq!(samples[0].value, 42.5);
    }

    #[test]
    fn rejects_list_shaped_response() {
        let body = json!([{"value": [1.0, "2"]}]);
        assert!(parse_instant_vector(&body).is_err());
    }

    #[test]
    fn rejects_matrix_result() {
        let body = json!({
            "status": "success",
            "data": {"resultType": "matrix", "result": []}
        });
        assert!(parse_instant_vector(&body).is_err());
    }
}
