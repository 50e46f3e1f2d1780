use crate::error::TransportError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    #[serde(rename = "Title")]
    pub title: String,
}

/// Bearer-authenticated access to the to-do list API.
#[async_trait]
pub trait TodoTransport: Send + Sync {
    async fn get_items(&self, token: &str) -> Result<Vec<TodoItem>, TransportError>;

    async fn post_item(&self, token: &str, title: &str) -> Result<(), TransportError>;
}

pub struct ReqwestTransport {
    client: Client,
    todo_list_url: String,
}

impl ReqwestTransport {
    pub fn new(api_base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .build()
            .context("Failed to build HTTP client")?;
        Ok(ReqwestTransport {
            client,
            todo_list_url: format!("{}/api/todolist", api_base_url.trim_end_matches('/')),
        })
    }
}

/// Turns a non-2xx response into `TransportError::Status` carrying the
/// reason phrase.
fn check_status(response: Response) -> Result<Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let reason = status
        .canonical_reason()
        .map(str::to_string)
        .unwrap_or_else(|| status.as_str().to_string());
    warn!(status = status.as_u16(), %reason, "To-do list API refused the request");
    Err(TransportError::Status {
        code: status.as_u16(),
        reason,
    })
}

#[async_trait]
impl TodoTransport for ReqwestTransport {
    async fn get_items(&self, token: &str) -> Result<Vec<TodoItem>, TransportError> {
        debug!(url = %self.todo_list_url, "GET to-do list");
        let response = self
            .client
            .get(&self.todo_list_url)
            .bearer_auth(token)
            .send()
            .await?;
        let body = check_status(response)?.text().await?;
        let items: Vec<TodoItem> =
            serde_json::from_str(&body).map_err(|err| TransportError::Decode(err.to_string()))?;
        debug!(count = items.len(), "To-do list received");
        Ok(items)
    }

    async fn post_item(&self, token: &str, title: &str) -> Result<(), TransportError> {
        debug!(url = %self.todo_list_url, "POST to-do item");
        let response = self
            .client
            .post(&self.todo_list_url)
            .bearer_auth(token)
            .form(&[("Title", title)])
            .send()
            .await?;
        check_status(response)?;
        Ok(())
    }
}
