//! Remote API contract consumed by the sync engine
//!
//! [`RemoteApi`] is the seam between the engine and the server. [`HttpRemote`]
//! implements it over HTTP with `reqwest`; tests substitute an in-memory
//! implementation.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;
use tracing::debug;

use crate::config::RemoteConfig;
use crate::error::RemoteError;

/// Result of a single remote call
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Request/response contract of the retail API
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// `POST /invoices`; returns the canonical invoice including its id
    async fn create_invoice(&self, invoice: &Value, idempotency_key: &str) -> RemoteResult<Value>;

    /// `PUT /invoices/:id`
    async fn update_invoice(&self, id: &str, invoice: &Value) -> RemoteResult<Value>;

    /// `DELETE /invoices/:id`
    async fn delete_invoice(&self, id: &str) -> RemoteResult<()>;

    /// `POST /invoices/:id/pay`; returns the updated invoice
    async fn pay_invoice(&self, id: &str, payment: &Value) -> RemoteResult<Value>;

    /// `PATCH /products/:id/stock`; returns the updated product
    async fn update_stock(&self, id: &str, stock: &Value) -> RemoteResult<Value>;

    /// `GET /products`
    async fn fetch_products(&self) -> RemoteResult<Vec<Value>>;

    /// `GET /customers`
    async fn fetch_customers(&self) -> RemoteResult<Vec<Value>>;

    /// `GET /invoices?startDate=&limit=`
    async fn fetch_invoices(&self, since: DateTime<Utc>, limit: u32) -> RemoteResult<Vec<Value>>;
}

/// Supplies the bearer credential for each request
pub trait TokenSource: Send + Sync {
    fn token(&self) -> Option<String>;
}

/// A fixed token, as used by the CLI
pub struct StaticToken(pub Option<String>);

impl TokenSource for StaticToken {
    fn token(&self) -> Option<String> {
        self.0.clone()
    }
}

impl<F> TokenSource for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn token(&self) -> Option<String> {
        self()
    }
}

/// [`RemoteApi`] over HTTP
pub struct HttpRemote {
    client: Client,
    base_url: String,
    tokens: Arc<dyn TokenSource>,
}

impl HttpRemote {
    pub fn new(config: RemoteConfig, tokens: Arc<dyn TokenSource>) -> RemoteResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| RemoteError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            tokens,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match self.tokens.token() {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send(&self, req: RequestBuilder) -> RemoteResult<Response> {
        let resp = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| RemoteError::Network(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(RemoteError::Status {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        Ok(resp)
    }

    async fn send_json(&self, req: RequestBuilder) -> RemoteResult<Value> {
        let resp = self.send(req).await?;
        let body: Value = resp
            .json()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))?;
        Ok(unwrap_envelope(body))
    }

    async fn send_list(&self, req: RequestBuilder) -> RemoteResult<Vec<Value>> {
        match self.send_json(req).await? {
            Value::Array(items) => Ok(items),
            other => Err(RemoteError::Decode(format!(
                "expected a JSON array, got {}",
                kind_of(&other)
            ))),
        }
    }
}

#[async_trait]
impl RemoteApi for HttpRemote {
    async fn create_invoice(&self, invoice: &Value, idempotency_key: &str) -> RemoteResult<Value> {
        debug!(idempotency_key, "POST /invoices");
        let req = self
            .client
            .post(self.url("/invoices"))
            .header("Idempotency-Key", idempotency_key)
            .json(invoice);
        self.send_json(req).await
    }

    async fn update_invoice(&self, id: &str, invoice: &Value) -> RemoteResult<Value> {
        let req = self
            .client
            .put(self.url(&format!("/invoices/{}", id)))
            .json(invoice);
        self.send_json(req).await
    }

    async fn delete_invoice(&self, id: &str) -> RemoteResult<()> {
        let req = self.client.delete(self.url(&format!("/invoices/{}", id)));
        self.send(req).await?;
        Ok(())
    }

    async fn pay_invoice(&self, id: &str, payment: &Value) -> RemoteResult<Value> {
        let req = self
            .client
            .post(self.url(&format!("/invoices/{}/pay", id)))
            .json(payment);
        self.send_json(req).await
    }

    async fn update_stock(&self, id: &str, stock: &Value) -> RemoteResult<Value> {
        let req = self
            .client
            .patch(self.url(&format!("/products/{}/stock", id)))
            .json(stock);
        self.send_json(req).await
    }

    async fn fetch_products(&self) -> RemoteResult<Vec<Value>> {
        self.send_list(self.client.get(self.url("/products"))).await
    }

    async fn fetch_customers(&self) -> RemoteResult<Vec<Value>> {
        self.send_list(self.client.get(self.url("/customers"))).await
    }

    async fn fetch_invoices(&self, since: DateTime<Utc>, limit: u32) -> RemoteResult<Vec<Value>> {
        let req = self.client.get(self.url("/invoices")).query(&[
            ("startDate", since.to_rfc3339()),
            ("limit", limit.to_string()),
        ]);
        self.send_list(req).await
    }
}

/// Strip a `{ "data": ... }` wrapper if the server uses one
pub fn unwrap_envelope(body: Value) -> Value {
    match body {
        Value::Object(mut obj) if obj.contains_key("data") => {
            obj.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_unwrap_envelope() {
        assert_eq!(
            unwrap_envelope(json!({"success": true, "data": [1, 2]})),
            json!([1, 2])
        );
        assert_eq!(unwrap_envelope(json!([1, 2])), json!([1, 2]));
        assert_eq!(
            unwrap_envelope(json!({"id": "inv-1"})),
            json!({"id": "inv-1"})
        );
    }

    #[test]
    fn test_url_joining_strips_trailing_slash() {
        let remote = HttpRemote::new(
            RemoteConfig {
                base_url: "https://pos.example.com/api/".into(),
                ..Default::default()
            },
            Arc::new(StaticToken(None)),
        )
        .unwrap();
        assert_eq!(remote.url("/products"), "https://pos.example.com/api/products");
    }

    #[test]
    fn test_closure_token_source() {
        let source: Arc<dyn TokenSource> = Arc::new(|| Some("abc".to_string()));
        assert_eq!(source.token().as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_a_network_error() {
        let remote = HttpRemote::new(
            RemoteConfig {
                base_url: "http://127.0.0.1:1".into(),
                timeout: Duration::from_secs(2),
            },
            Arc::new(StaticToken(None)),
        )
        .unwrap();

        let err = remote.fetch_products().await.unwrap_err();
        assert!(matches!(err, RemoteError::Network(_)));
        assert!(err.is_retryable());
    }
}
