//! 远端工具提供方：启动时从 HTTP 协作方发现工具，之后按名调用
//!
//! - `GET  {base_url}/tools`          -> `[{name, description, parameters}]`
//! - `POST {base_url}/tools/{name}`   body 为 args，返回工具结果 JSON；`{"error": "..."}` 视为失败

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use crate::tools::{Tool, ToolError, ToolRegistry, ToolSpec};

#[derive(Debug, Clone)]
pub struct RemoteToolProvider {
    base_url: String,
    client: Client,
}

impl RemoteToolProvider {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ToolError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ToolError::Failed(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    /// 拉取工具清单
    pub async fn discover(&self) -> Result<Vec<RemoteTool>, ToolError> {
        let url = format!("{}/tools", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ToolError::Failed(format!("GET {url}: {e}")))?;
        if !response.status().is_success() {
            return Err(ToolError::Failed(format!("GET {url}: HTTP {}", response.status())));
        }
        let specs: Vec<ToolSpec> = response
            .json()
            .await
            .map_err(|e| ToolError::Failed(format!("GET {url}: invalid tool list: {e}")))?;

        tracing::info!(count = specs.len(), url = %url, "discovered remote tools");
        Ok(specs
            .into_iter()
            .map(|spec| RemoteTool {
                spec,
                base_url: self.base_url.clone(),
                client: self.client.clone(),
            })
            .collect())
    }

    /// 发现并注册到注册表，返回注册数量
    pub async fn register_into(&self, registry: &mut ToolRegistry) -> Result<usize, ToolError> {
        let tools = self.discover().await?;
        let count = tools.len();
        for tool in tools {
            registry.register(tool);
        }
        Ok(count)
    }
}

/// 由远端协作方实现的工具
pub struct RemoteTool {
    spec: ToolSpec,
    base_url: String,
    client: Client,
}

#[async_trait]
impl Tool for RemoteTool {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn description(&self) -> &str {
        &self.spec.description
    }

    fn parameters_schema(&self) -> Value {
        self.spec.parameters.clone()
    }

    async fn invoke(&self, args: Value) -> Result<Value, ToolError> {
        let url = format!("{}/tools/{}", self.base_url, self.spec.name);
        let response = self
            .client
            .post(&url)
            .json(&args)
            .send()
            .await
            .map_err(|e| ToolError::Failed(format!("POST {url}: {e}")))?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .unwrap_or_else(|e| serde_json::json!({ "error": format!("invalid response body: {e}") }));
        if status == reqwest::StatusCode::BAD_REQUEST || status == reqwest::StatusCode::UNPROCESSABLE_ENTITY {
            return Err(ToolError::InvalidArguments(error_text(&body)));
        }
        if !status.is_success() {
            return Err(ToolError::Failed(format!("HTTP {status}: {}", error_text(&body))));
        }
        interpret_response(body)
    }
}

/// `{"data": ...}` 取 data；`{"error": "..."}` 视为失败；其余整体作为结果
fn interpret_response(body: Value) -> Result<Value, ToolError> {
    if let Some(obj) = body.as_object() {
        if let Some(err) = obj.get("error").filter(|e| !e.is_null()) {
            if !obj.contains_key("data") {
                return Err(ToolError::Failed(value_text(err)));
            }
        }
        if let Some(data) = obj.get("data") {
            return Ok(data.clone());
        }
    }
    Ok(body)
}

fn error_text(body: &Value) -> String {
    body.get("error").map(value_text).unwrap_or_else(|| body.to_string())
}

fn value_text(v: &Value) -> String {
    v.as_str().map(String::from).unwrap_or_else(|| v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_interpret_response() {
        assert_eq!(interpret_response(json!({"data": [1]})).unwrap(), json!([1]));
        assert_eq!(interpret_response(json!({"role": "master"})).unwrap(), json!({"role": "master"}));
        assert_eq!(
            interpret_response(json!({"error": "NOAUTH"})).unwrap_err(),
            ToolError::Failed("NOAUTH".into())
        );
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let provider = RemoteToolProvider::new("http://127.0.0.1:8900/", Duration::from_secs(1)).unwrap();
        assert_eq!(provider.base_url, "http://127.0.0.1:8900");
    }
}
