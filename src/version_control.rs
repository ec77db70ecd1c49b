use async_trait::async_trait;
use http::StatusCode;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use tracing::debug;

use crate::{config::GitHubConfig, error::VcsError, registry_file::RegistryFile};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitObject {
    pub sha: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitRef {
    #[serde(rename = "ref")]
    pub name: String,
    pub object: GitObject,
}

/// Branch, tree, commit and pull request operations against one hosted
/// repository. Owner, repository and main branch are fixed per client.
#[async_trait]
pub trait VersionControlClient {
    fn owner(&self) -> &str;
    fn repo(&self) -> &str;
    fn main_branch(&self) -> &str;

    async fn get_head(&self, branch: &str) -> Result<GitRef, VcsError>;
    /// Branches off the main branch head. Fails with [`VcsError::Conflict`]
    /// when `branch` already exists.
    async fn create_head(&self, branch: &str) -> Result<GitRef, VcsError>;
    async fn create_tree(&self, base_sha: &str, files: &[RegistryFile])
    -> Result<GitObject, VcsError>;
    async fn create_commit(
        &self,
        base_sha: &str,
        tree_sha: &str,
        message: &str,
    ) -> Result<GitObject, VcsError>;
    async fn update_head(&self, branch: &str, commit_sha: &str) -> Result<(), VcsError>;
    async fn create_pull_request(&self, branch: &str) -> Result<(), VcsError>;
    async fn delete_head(&self, branch: &str) -> Result<(), VcsError>;
    /// Runs a read query against the host's GraphQL API and returns `data`.
    async fn graphql(&self, document: &str, variables: Value) -> Result<Value, VcsError>;
}

pub struct GitHubClient {
    client: reqwest::Client,
    api_url: String,
    owner: String,
    repo: String,
    main_branch: String,
    token: Option<String>,
}

impl GitHubClient {
    pub fn new(config: &GitHubConfig, token: Option<String>) -> Self {
        GitHubClient {
            client: reqwest::Client::new(),
            api_url: config.api_url.trim_end_matches('/').to_string(),
            owner: config.owner.clone(),
            repo: config.repo.clone(),
            main_branch: config.main_branch.clone(),
            token,
        }
    }

    fn repo_url(&self, path: &str) -> String {
        format!(
            "{}/repos/{}/{}/{}",
            self.api_url, self.owner, self.repo, path
        )
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, url)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "stitchgate");
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<T, VcsError> {
        let body = self.send_raw(request, what).await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Returns the response body of a successful call without decoding it.
    async fn send_raw(
        &self,
        request: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<String, VcsError> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        debug!(%status, what, "version control response");

        match status {
            s if s.is_success() => Ok(body),
            StatusCode::NOT_FOUND => Err(VcsError::NotFound {
                what: what.to_string(),
            }),
            status => Err(VcsError::Status { status, body }),
        }
    }
}

#[async_trait]
impl VersionControlClient for GitHubClient {
    fn owner(&self) -> &str {
        &self.owner
    }

    fn repo(&self) -> &str {
        &self.repo
    }

    fn main_branch(&self) -> &str {
        &self.main_branch
    }

    async fn get_head(&self, branch: &str) -> Result<GitRef, VcsError> {
        let url = self.repo_url(&format!("git/ref/heads/{branch}"));
        self.send(self.request(reqwest::Method::GET, url), &format!("branch {branch}"))
            .await
    }

    async fn create_head(&self, branch: &str) -> Result<GitRef, VcsError> {
        let base = self.get_head(&self.main_branch).await?;
        let request = self
            .request(reqwest::Method::POST, self.repo_url("git/refs"))
            .json(&json!({
                "ref": format!("refs/heads/{branch}"),
                "sha": base.object.sha,
            }));

        match self.send(request, &format!("branch {branch}")).await {
            Err(VcsError::Status { status, .. }) if status == StatusCode::UNPROCESSABLE_ENTITY => {
                Err(VcsError::Conflict {
                    branch: branch.to_string(),
                })
            }
            result => result,
        }
    }

    async fn create_tree(
        &self,
        base_sha: &str,
        files: &[RegistryFile],
    ) -> Result<GitObject, VcsError> {
        let request = self
            .request(reqwest::Method::POST, self.repo_url("git/trees"))
            .json(&json!({ "base_tree": base_sha, "tree": files }));
        self.send(request, "tree").await
    }

    async fn create_commit(
        &self,
        base_sha: &str,
        tree_sha: &str,
        message: &str,
    ) -> Result<GitObject, VcsError> {
        let request = self
            .request(reqwest::Method::POST, self.repo_url("git/commits"))
            .json(&json!({
                "message": message,
                "tree": tree_sha,
                "parents": [base_sha],
            }));
        self.send(request, "commit").await
    }

    async fn update_head(&self, branch: &str, commit_sha: &str) -> Result<(), VcsError> {
        let url = self.repo_url(&format!("git/refs/heads/{branch}"));
        let request = self
            .request(reqwest::Method::PATCH, url)
            .json(&json!({ "sha": commit_sha, "force": false }));
        let _: GitRef = self.send(request, &format!("branch {branch}")).await?;
        Ok(())
    }

    async fn create_pull_request(&self, branch: &str) -> Result<(), VcsError> {
        let request = self
            .request(reqwest::Method::POST, self.repo_url("pulls"))
            .json(&json!({
                "title": branch,
                "head": branch,
                "base": self.main_branch,
            }));
        let _: Value = self.send(request, "pull request").await?;
        Ok(())
    }

    async fn delete_head(&self, branch: &str) -> Result<(), VcsError> {
        let url = self.repo_url(&format!("git/refs/heads/{branch}"));
        // 204 with an empty body.
        self.send_raw(self.request(reqwest::Method::DELETE, url), &format!("branch {branch}"))
            .await?;
        Ok(())
    }

    async fn graphql(&self, document: &str, variables: Value) -> Result<Value, VcsError> {
        let request = self
            .request(reqwest::Method::POST, format!("{}/graphql", self.api_url))
            .json(&json!({ "query": document, "variables": variables }));
        let mut response: Value = self.send(request, "graphql").await?;

        if let Some(errors) = response.get("errors").filter(|e| !e.is_null()) {
            return Err(VcsError::GraphQL {
                errors: errors.clone(),
            });
        }
        Ok(response.get_mut("data").map(Value::take).unwrap_or(Value::Null))
    }
}
