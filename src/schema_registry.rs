//! Git-backed schema registry.
//!
//! Production gateways read service SDL from a published tree on the main
//! branch (`{main}:{registry_path}`); every other environment probes the live
//! services directly. New registry snapshots are published as release
//! candidates: one branch per slugified release name, one pull request per
//! branch, one commit per publish.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, try_join_all};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{
    RegistryVersion, ReleaseCandidate, ServiceDescriptor,
    config::{Config, Endpoint, Environment},
    error::{RegistryError, VcsError},
    federation_gateway::GatewayBuilder,
    query_executor::HttpRemoteExecutor,
    registry_file::{self, RegistryFile, slugify},
    retry::{RetryPolicy, fetch_sdl},
    version_control::{GitRef, VersionControlClient},
};

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_millis(5000);

const CREATE_MESSAGE: &str = "create release candidate";
const UPDATE_MESSAGE: &str = "update release candidate";

const FETCH_REGISTRY_VERSION: &str = r#"query FetchRegistryVersion($owner: String!, $repo: String!, $path: String!) {
  repository(owner: $owner, name: $repo) {
    object(expression: $path) { oid }
  }
}"#;

const FETCH_REGISTRY_FILES: &str = r#"query FetchRegistryFiles($owner: String!, $repo: String!, $path: String!) {
  repository(owner: $owner, name: $repo) {
    object(expression: $path) {
      oid
      ... on Tree {
        entries {
          name
          type
          object {
            ... on Blob { text }
          }
        }
      }
    }
  }
}"#;

#[derive(Deserialize)]
struct RegistryQuery {
    repository: Option<Repository>,
}

#[derive(Deserialize)]
struct Repository {
    object: Option<TreeObject>,
}

#[derive(Deserialize)]
struct TreeObject {
    oid: String,
    #[serde(default)]
    entries: Vec<TreeEntry>,
}

#[derive(Deserialize)]
struct TreeEntry {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    object: Option<BlobObject>,
}

#[derive(Deserialize)]
struct BlobObject {
    text: Option<String>,
}

struct RegistryState<S> {
    registry_version: Option<RegistryVersion>,
    /// Registry OID `schema` was built from; `None` for live-built schemas.
    schema_version: Option<RegistryVersion>,
    schema: Option<S>,
    services: Vec<ServiceDescriptor>,
}

pub struct SchemaRegistry<B: GatewayBuilder> {
    env: Environment,
    registry_path: String,
    endpoints: Vec<Endpoint>,
    client: Arc<dyn VersionControlClient + Send + Sync>,
    builder: B,
    http: reqwest::Client,
    probe_policy: RetryPolicy,
    load_lock: Mutex<()>,
    state: RwLock<RegistryState<B::Schema>>,
    refresh_task: StdMutex<Option<JoinHandle<()>>>,
}

impl<B> SchemaRegistry<B>
where
    B: GatewayBuilder + Send + Sync + 'static,
{
    pub fn new(
        config: &Config,
        client: Arc<dyn VersionControlClient + Send + Sync>,
        builder: B,
    ) -> Self {
        SchemaRegistry {
            env: config.env.clone(),
            registry_path: config.github.registry_path.trim_end_matches('/').to_string(),
            endpoints: config.endpoints.clone(),
            client,
            builder,
            http: reqwest::Client::new(),
            probe_policy: RetryPolicy::REFRESH,
            load_lock: Mutex::new(()),
            state: RwLock::new(RegistryState {
                registry_version: None,
                schema_version: None,
                schema: None,
                services: Vec::new(),
            }),
            refresh_task: StdMutex::new(None),
        }
    }

    /// Overrides the retry policy used when probing live services.
    pub fn with_probe_policy(mut self, policy: RetryPolicy) -> Self {
        self.probe_policy = policy;
        self
    }

    pub fn probe_policy(&self) -> RetryPolicy {
        self.probe_policy
    }

    pub async fn schema(&self) -> Option<B::Schema> {
        self.state.read().await.schema.clone()
    }

    pub async fn services(&self) -> Vec<ServiceDescriptor> {
        self.state.read().await.services.clone()
    }

    pub async fn registry_version(&self) -> Option<RegistryVersion> {
        self.state.read().await.registry_version.clone()
    }

    /// Runs one load cycle and returns the schema now being served.
    ///
    /// Production trusts the published registry and only refetches it when
    /// the tree OID moved; other environments always probe live services.
    /// Concurrent calls are serialized.
    pub async fn load(&self) -> Result<B::Schema, RegistryError> {
        let _guard = self.load_lock.lock().await;

        let (services, version) = if self.env.is_production() {
            let (cached_version, cached_schema) = {
                let state = self.state.read().await;
                (state.schema_version.clone(), state.schema.clone())
            };

            if let (Some(cached_version), Some(schema)) = (cached_version, cached_schema) {
                let live_version = self.get_registry_version().await?;
                if live_version == cached_version {
                    debug!(version = %live_version, "registry unchanged, keeping current schema");
                    return Ok(schema);
                }
                info!(from = %cached_version, to = %live_version, "registry changed, reloading");
            }

            let (version, services) = self.fetch_registry_services().await?;
            (services, Some(version))
        } else {
            (self.load_local_services().await?, None)
        };

        self.install(services, version).await
    }

    /// Probes the live services and serves a schema built from them, in
    /// every environment. Release candidates are cut from this state; the
    /// next production `load()` goes back to the published registry.
    pub async fn load_live(&self) -> Result<B::Schema, RegistryError> {
        let _guard = self.load_lock.lock().await;
        let services = self.load_local_services().await?;
        self.install(services, None).await
    }

    async fn install(
        &self,
        services: Vec<ServiceDescriptor>,
        version: Option<RegistryVersion>,
    ) -> Result<B::Schema, RegistryError> {
        let schema = self.builder.build_schema(&services).await?;
        info!(
            env = %self.env,
            services = services.len(),
            version = version.as_deref().unwrap_or("live"),
            "schema loaded"
        );

        let mut state = self.state.write().await;
        if version.is_some() {
            state.registry_version = version.clone();
        }
        state.schema_version = version;
        state.services = services;
        state.schema = Some(schema.clone());
        Ok(schema)
    }

    /// Probes every configured endpoint for its SDL, in parallel.
    pub async fn load_local_services(&self) -> Result<Vec<ServiceDescriptor>, RegistryError> {
        let probes: Vec<BoxFuture<'_, Result<ServiceDescriptor, RegistryError>>> = self
            .endpoints
            .iter()
            .map(|endpoint| self.load_local_service(endpoint).boxed())
            .collect();
        try_join_all(probes).await
    }

    async fn load_local_service(
        &self,
        endpoint: &Endpoint,
    ) -> Result<ServiceDescriptor, RegistryError> {
        let url = endpoint.url_for(&self.env)?;
        let executor = HttpRemoteExecutor::with_client(self.http.clone(), url);
        let sdl = fetch_sdl(&executor, url, self.probe_policy).await?;
        debug!(service = %endpoint.name, url, "fetched live SDL");

        Ok(ServiceDescriptor {
            name: endpoint.name.clone(),
            url: url.to_string(),
            sdl,
        })
    }

    /// Reads the published registry tree and records its OID as the last seen
    /// registry version. The served schema is left untouched.
    pub async fn load_registry_services(&self) -> Result<Vec<ServiceDescriptor>, RegistryError> {
        let (version, services) = self.fetch_registry_services().await?;
        self.state.write().await.registry_version = Some(version);
        Ok(services)
    }

    /// Current OID of the registry tree on the main branch.
    pub async fn get_registry_version(&self) -> Result<RegistryVersion, RegistryError> {
        Ok(self.query_registry(FETCH_REGISTRY_VERSION).await?.oid)
    }

    async fn fetch_registry_services(
        &self,
    ) -> Result<(RegistryVersion, Vec<ServiceDescriptor>), RegistryError> {
        let tree = self.query_registry(FETCH_REGISTRY_FILES).await?;

        let services = tree
            .entries
            .into_iter()
            .filter(|entry| entry.kind == "blob")
            .map(|entry| {
                let text = entry.object.and_then(|blob| blob.text).ok_or_else(|| {
                    RegistryError::MalformedRegistryEntry {
                        file: entry.name.clone(),
                    }
                })?;
                registry_file::decode_entry(&entry.name, &text)
            })
            .collect::<Result<Vec<_>, _>>()?;

        debug!(version = %tree.oid, services = services.len(), "read registry tree");
        Ok((tree.oid, services))
    }

    async fn query_registry(&self, document: &str) -> Result<TreeObject, RegistryError> {
        let path = format!("{}:{}", self.client.main_branch(), self.registry_path);
        let variables = json!({
            "owner": self.client.owner(),
            "repo": self.client.repo(),
            "path": path,
        });

        let data = self.client.graphql(document, variables).await?;
        let response: RegistryQuery =
            serde_json::from_value(data).map_err(VcsError::from)?;

        response
            .repository
            .and_then(|repository| repository.object)
            .ok_or(RegistryError::MissingRegistryPath { path })
    }

    /// Encodes the current services as registry files. The recorded URL is
    /// the endpoint's production URL when one is configured.
    pub async fn current_files(&self) -> Vec<RegistryFile> {
        let state = self.state.read().await;
        state
            .services
            .iter()
            .map(|service| {
                let url = self
                    .endpoints
                    .iter()
                    .find(|endpoint| endpoint.name == service.name)
                    .and_then(Endpoint::publish_url)
                    .unwrap_or(&service.url);
                RegistryFile::blob(
                    registry_file::file_path(&self.registry_path, &service.name),
                    registry_file::encode(url, &service.sdl),
                )
            })
            .collect()
    }

    /// Publishes the current services to the release branch named after
    /// `name`, creating the branch and its pull request on first use.
    pub async fn create_or_update_release(
        &self,
        name: &str,
        message: Option<&str>,
    ) -> Result<ReleaseCandidate, RegistryError> {
        let branch = release_branch(name)?;
        let files = self.release_files().await?;

        match self.client.create_head(&branch).await {
            Ok(head) => {
                self.open_release(&branch, &head, files, message.unwrap_or(CREATE_MESSAGE))
                    .await
            }
            Err(err) if err.is_conflict() => {
                debug!(%branch, "release branch exists, updating");
                let head = self.client.get_head(&branch).await?;
                self.publish(&branch, &head, files, message.unwrap_or(UPDATE_MESSAGE))
                    .await
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Like [`Self::create_or_update_release`] but fails if the branch exists.
    pub async fn create_release(
        &self,
        name: &str,
        message: Option<&str>,
    ) -> Result<ReleaseCandidate, RegistryError> {
        let branch = release_branch(name)?;
        let files = self.release_files().await?;
        let head = self.client.create_head(&branch).await?;
        self.open_release(&branch, &head, files, message.unwrap_or(CREATE_MESSAGE))
            .await
    }

    /// Like [`Self::create_or_update_release`] but fails if the branch is missing.
    pub async fn update_release(
        &self,
        name: &str,
        message: Option<&str>,
    ) -> Result<ReleaseCandidate, RegistryError> {
        let branch = release_branch(name)?;
        let files = self.release_files().await?;
        let head = self.client.get_head(&branch).await?;
        self.publish(&branch, &head, files, message.unwrap_or(UPDATE_MESSAGE))
            .await
    }

    async fn release_files(&self) -> Result<Vec<RegistryFile>, RegistryError> {
        let files = self.current_files().await;
        if files.is_empty() {
            return Err(RegistryError::NoServicesLoaded);
        }
        Ok(files)
    }

    /// First publish to a freshly created branch. A release candidate is a
    /// branch with a pull request, so the branch is deleted again when either
    /// half fails.
    async fn open_release(
        &self,
        branch: &str,
        head: &GitRef,
        files: Vec<RegistryFile>,
        message: &str,
    ) -> Result<ReleaseCandidate, RegistryError> {
        let opened = async {
            let candidate = self.publish(branch, head, files, message).await?;
            self.client.create_pull_request(branch).await?;
            info!(%branch, "opened release candidate pull request");
            Ok::<_, RegistryError>(candidate)
        }
        .await;

        if opened.is_err() {
            match self.client.delete_head(branch).await {
                Ok(()) => warn!(%branch, "release failed, deleted new branch"),
                Err(err) => error!(%branch, error = %err, "release failed and the new branch could not be deleted"),
            }
        }
        opened
    }

    async fn publish(
        &self,
        branch: &str,
        head: &GitRef,
        files: Vec<RegistryFile>,
        message: &str,
    ) -> Result<ReleaseCandidate, RegistryError> {
        let tree = self.client.create_tree(&head.object.sha, &files).await?;
        let commit = self
            .client
            .create_commit(&head.object.sha, &tree.sha, message)
            .await?;
        self.client.update_head(branch, &commit.sha).await?;

        info!(
            %branch,
            commit = %commit.sha,
            files = files.len(),
            commit_message = message,
            "published registry snapshot"
        );
        Ok(ReleaseCandidate {
            name: branch.to_string(),
            version: commit.sha,
        })
    }

    /// Reloads every `interval` until stopped. The next tick is scheduled
    /// only after the previous load finished; failures are logged and the
    /// loop keeps going.
    pub fn auto_refresh(self: &Arc<Self>, interval: Duration) {
        self.stop_auto_refresh();

        let registry = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                match registry.load().await {
                    Ok(_) => debug!("registry refreshed"),
                    Err(err) => error!(error = %err, "registry refresh failed"),
                }
            }
        });

        *self.refresh_task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    pub fn stop_auto_refresh(&self) {
        let handle = self
            .refresh_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
            debug!("stopped registry auto refresh");
        }
    }

    pub fn is_auto_refreshing(&self) -> bool {
        self.refresh_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl<B: GatewayBuilder> Drop for SchemaRegistry<B> {
    fn drop(&mut self) {
        let task = self
            .refresh_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = task {
            handle.abort();
        }
    }
}

fn release_branch(name: &str) -> Result<String, RegistryError> {
    let branch = slugify(name);
    if branch.is_empty() {
        return Err(RegistryError::InvalidReleaseName {
            name: name.to_string(),
        });
    }
    Ok(branch)
}
