use http::StatusCode;
use serde_json::Value;

/// Failures talking to a single GraphQL service.
#[derive(thiserror::Error, Debug)]
pub enum ExecutorError {
    #[error("Failed to send request to {url}: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("Service at {url} answered with status {status}: {body}")]
    Status {
        url: String,
        status: StatusCode,
        body: String,
    },
    #[error("Failed to parse response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("Service at {url} did not return an SDL string (errors: {errors})")]
    MissingSdl { url: String, errors: Value },
}

/// Failures reported by the version-control host.
#[derive(thiserror::Error, Debug)]
pub enum VcsError {
    #[error("Branch {branch} already exists")]
    Conflict { branch: String },
    #[error("Not found: {what}")]
    NotFound { what: String },
    #[error("Version control host answered with status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("Failed to reach version control host: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Failed to decode version control response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("Version control query failed: {errors}")]
    GraphQL { errors: Value },
}

impl VcsError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, VcsError::Conflict { .. })
    }
}

#[derive(thiserror::Error, Debug)]
pub enum BuildError {
    #[error("Failed to parse schema for service {service}: {message}")]
    InvalidSdl { service: String, message: String },
}

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    VersionControl(#[from] VcsError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error("Malformed registry entry {file}: missing `# $url` header")]
    MalformedRegistryEntry { file: String },
    #[error("Registry path {path} does not exist on the main branch")]
    MissingRegistryPath { path: String },
    #[error("No services loaded; run a load before publishing a release")]
    NoServicesLoaded,
    #[error("Release name {name:?} does not produce a branch name")]
    InvalidReleaseName { name: String },
    #[error("Endpoint {name} has no URL for environment {env}")]
    UnknownEndpoint { name: String, env: String },
}
