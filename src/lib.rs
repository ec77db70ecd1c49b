pub mod config;
pub mod error;
pub mod federation_gateway;
pub mod query_executor;
pub mod registry_file;
pub mod retry;
pub mod schema_registry;
pub mod version_control;

pub use config::{Config, Endpoint, Environment, GitHubConfig};
pub use error::{BuildError, ExecutorError, RegistryError, VcsError};
pub use federation_gateway::{GatewayBuilder, TypeMapGatewayBuilder};
pub use query_executor::{HttpRemoteExecutor, RemoteExecutor};
pub use retry::{RetryPolicy, fetch_sdl, retry};
pub use schema_registry::SchemaRegistry;
pub use version_control::{GitHubClient, VersionControlClient};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

type ServiceMap = HashMap<String, ServiceDescriptor>;

/// One service as the gateway sees it: a unique name, the endpoint resolved
/// for the running environment, and the raw SDL text it serves.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    pub url: String,
    pub sdl: String,
}

/// Opaque content identifier (a git tree OID) naming one published registry state.
pub type RegistryVersion = String;

/// A release line: the slugified branch name and the commit produced by the
/// most recent publish to it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseCandidate {
    pub name: String,
    pub version: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct GraphQLRequest {
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,
}

#[derive(Clone, Debug)]
pub struct FederatedSchema {
    pub services: ServiceMap,
    pub type_to_service_map: HashMap<String, Vec<String>>,
}
