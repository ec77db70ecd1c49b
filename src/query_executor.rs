use async_trait::async_trait;
use graphql_parser::query::Document;
use serde_json::Value;
use tracing::debug;

use crate::{GraphQLRequest, error::ExecutorError};

/// Executes GraphQL documents against one remote service.
///
/// The returned value is the raw JSON body; a `{data, errors}` envelope is
/// passed through untouched and callers decide what an `errors` entry means.
#[async_trait]
pub trait RemoteExecutor {
    async fn execute(&self, document: &str, variables: Option<Value>)
    -> Result<Value, ExecutorError>;

    async fn execute_document(
        &self,
        document: &Document<'_, String>,
        variables: Option<Value>,
    ) -> Result<Value, ExecutorError> {
        let query = document.to_string();
        self.execute(&query, variables).await
    }
}

pub struct HttpRemoteExecutor {
    client: reqwest::Client,
    url: String,
}

impl HttpRemoteExecutor {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), url)
    }

    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        HttpRemoteExecutor {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl RemoteExecutor for HttpRemoteExecutor {
    async fn execute(
        &self,
        document: &str,
        variables: Option<Value>,
    ) -> Result<Value, ExecutorError> {
        let request_body = GraphQLRequest {
            query: document.to_string(),
            variables,
        };

        debug!(url = %self.url, "executing remote document");
        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(&request_body)
            .send()
            .await
            .map_err(|source| ExecutorError::Request {
                url: self.url.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExecutorError::Status {
                url: self.url.clone(),
                status,
                body,
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|source| ExecutorError::Decode {
                url: self.url.clone(),
                source,
            })
    }
}
