//! Cluster scheduler boundary: job descriptors, job status, and the Kubernetes batch API client.

use crate::config::Config;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::time::Duration;

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const COMPLETION_INDEX_ANNOTATION: &str =
    "metadata.annotations['batch.kubernetes.io/job-completion-index']";
const MAX_NAME_LEN: usize = 63;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler request failed: {0}")]
    Request(String),

    #[error("scheduler rejected {action} (HTTP {status}): {body}")]
    Api {
        action: &'static str,
        status: u16,
        body: String,
    },

    #[error("scheduler configuration error: {0}")]
    Config(String),

    #[error("unexpected scheduler response: {0}")]
    Response(String),
}

impl From<reqwest::Error> for SchedulerError {
    fn from(e: reqwest::Error) -> Self {
        SchedulerError::Request(e.to_string())
    }
}

/// Observed state of a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running { active: u32 },
    Succeeded,
    Failed,
    NotFound,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

/// Shared persistent volume mounted into every replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub claim_name: String,
    pub mount_path: String,
}

/// Everything the scheduler needs to create one job. Restart policy is always "Never"; retries
/// happen through `backoff_limit` and, for fleets, through the monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDescriptor {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Name of an env var that receives the replica's completion index. Implies an indexed job.
    pub completion_index_env: Option<String>,
    pub cpu_request: String,
    pub memory_request: String,
    pub parallelism: u32,
    pub completions: u32,
    pub backoff_limit: u32,
    pub volume: Option<VolumeMount>,
}

impl JobDescriptor {
    /// A single-replica job with default resources.
    pub fn new(name: &str, image: &str) -> Self {
        Self {
            name: sanitize_job_name(name),
            image: image.to_string(),
            command: Vec::new(),
            args: Vec::new(),
            env: BTreeMap::new(),
            completion_index_env: None,
            cpu_request: Config::CPU_REQUEST.to_string(),
            memory_request: Config::MEMORY_REQUEST.to_string(),
            parallelism: 1,
            completions: 1,
            backoff_limit: Config::BACKOFF_LIMIT,
            volume: None,
        }
    }

    /// Same job under a different name.
    pub fn renamed(&self, name: &str) -> Self {
        Self {
            name: sanitize_job_name(name),
            ..self.clone()
        }
    }

    /// `batch/v1` Job manifest.
    pub fn to_manifest(&self) -> Value {
        let mut env: Vec<Value> = self
            .env
            .iter()
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect();
        if let Some(var) = &self.completion_index_env {
            env.push(json!({
                "name": var,
                "valueFrom": { "fieldRef": { "fieldPath": COMPLETION_INDEX_ANNOTATION } }
            }));
        }

        let mut container = json!({
            "name": self.name,
            "image": self.image,
            "args": self.args,
            "env": env,
            "resources": {
                "requests": { "cpu": self.cpu_request, "memory": self.memory_request }
            }
        });
        if !self.command.is_empty() {
            container["command"] = json!(self.command);
        }

        let mut pod_spec = json!({
            "restartPolicy": "Never",
            "containers": [container]
        });
        if let Some(volume) = &self.volume {
            pod_spec["containers"][0]["volumeMounts"] =
                json!([{ "name": "data", "mountPath": volume.mount_path }]);
            pod_spec["volumes"] = json!([{
                "name": "data",
                "persistentVolumeClaim": { "claimName": volume.claim_name }
            }]);
        }

        let mut spec = json!({
            "parallelism": self.parallelism,
            "completions": self.completions,
            "backoffLimit": self.backoff_limit,
            "template": {
                "metadata": { "labels": { "app": self.name } },
                "spec": pod_spec
            }
        });
        if self.completion_index_env.is_some() {
            spec["completionMode"] = json!("Indexed");
        }

        json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": { "name": self.name, "labels": { "app": self.name } },
            "spec": spec
        })
    }
}

/// Lower-case, `[a-z0-9-]` only, no leading/trailing dash, at most 63 characters.
pub fn sanitize_job_name(raw: &str) -> String {
    let mapped: String = raw
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_lowercase() || c.is_ascii_digit() { c } else { '-' })
        .collect();
    let mut name = mapped.trim_matches('-').to_string();
    if name.len() > MAX_NAME_LEN {
        name.truncate(MAX_NAME_LEN);
        name = name.trim_end_matches('-').to_string();
    }
    if name.is_empty() {
        "job".to_string()
    } else {
        name
    }
}

/// Operations the executor and the fleet monitor need from a cluster scheduler.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Create the job and return its identifier. Not retried.
    async fn submit(&self, job: &JobDescriptor) -> Result<String, SchedulerError>;

    async fn status(&self, job_id: &str) -> Result<JobStatus, SchedulerError>;

    async fn delete(&self, job_id: &str) -> Result<(), SchedulerError>;

    /// Whether a persistent volume claim with this name exists.
    async fn claim_exists(&self, claim_name: &str) -> Result<bool, SchedulerError>;
}

/// Talks to the Kubernetes API server over its REST interface.
#[derive(Debug, Clone)]
pub struct KubeScheduler {
    client: reqwest::Client,
    api_base: String,
    namespace: String,
    token: Option<String>,
}

impl KubeScheduler {
    /// `api_base` like `https://10.0.0.1:443` or a `kubectl proxy` address.
    pub fn new(
        api_base: &str,
        namespace: &str,
        token: Option<String>,
    ) -> Result<Self, SchedulerError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self::with_client(client, api_base, namespace, token))
    }

    fn with_client(
        client: reqwest::Client,
        api_base: &str,
        namespace: &str,
        token: Option<String>,
    ) -> Self {
        Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            namespace: namespace.to_string(),
            token,
        }
    }

    /// Use the pod's service account: API host from the environment, token and CA from the
    /// mounted secret.
    pub fn in_cluster(namespace: Option<&str>) -> Result<Self, SchedulerError> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| SchedulerError::Config("KUBERNETES_SERVICE_HOST not set".to_string()))?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());

        let read = |file: &str| {
            std::fs::read_to_string(format!("{}/{}", SERVICE_ACCOUNT_DIR, file))
                .map_err(|e| SchedulerError::Config(format!("reading {}: {}", file, e)))
        };
        let token = read("token")?.trim().to_string();
        let ca = read("ca.crt")?;
        let namespace = match namespace {
            Some(ns) => ns.to_string(),
            None => read("namespace")?.trim().to_string(),
        };

        let certificate = reqwest::Certificate::from_pem(ca.as_bytes())?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .add_root_certificate(certificate)
            .build()?;

        let api_base = if host.contains(':') {
            format!("https://[{}]:{}", host, port)
        } else {
            format!("https://{}:{}", host, port)
        };
        Ok(Self::with_client(client, &api_base, &namespace, Some(token)))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn jobs_url(&self) -> String {
        format!(
            "{}/apis/batch/v1/namespaces/{}/jobs",
            self.api_base, self.namespace
        )
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn api_error(action: &'static str, response: reqwest::Response) -> SchedulerError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        SchedulerError::Api {
            action,
            status,
            body,
        }
    }
}

#[async_trait]
impl Scheduler for KubeScheduler {
    async fn submit(&self, job: &JobDescriptor) -> Result<String, SchedulerError> {
        let response = self
            .authorize(self.client.post(self.jobs_url()))
            .json(&job.to_manifest())
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::api_error("job creation", response).await);
        }

        let created: Value = response.json().await?;
        created["metadata"]["name"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| SchedulerError::Response("created job has no metadata.name".to_string()))
    }

    async fn status(&self, job_id: &str) -> Result<JobStatus, SchedulerError> {
        let url = format!("{}/{}", self.jobs_url(), job_id);
        let response = self.authorize(self.client.get(url)).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(JobStatus::NotFound);
        }
        if !response.status().is_success() {
            return Err(Self::api_error("job status", response).await);
        }

        let job: Value = response.json().await?;
        Ok(parse_job_status(&job))
    }

    async fn delete(&self, job_id: &str) -> Result<(), SchedulerError> {
        let url = format!("{}/{}", self.jobs_url(), job_id);
        let response = self
            .authorize(self.client.delete(url))
            .json(&json!({ "propagationPolicy": "Background" }))
            .send()
            .await?;

        if response.status().is_success() || response.status() == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(Self::api_error("job deletion", response).await)
        }
    }

    async fn claim_exists(&self, claim_name: &str) -> Result<bool, SchedulerError> {
        let url = format!(
            "{}/api/v1/namespaces/{}/persistentvolumeclaims/{}",
            self.api_base, self.namespace, claim_name
        );
        let response = self.authorize(self.client.get(url)).send().await?;

        match response.status() {
            s if s.is_success() => Ok(true),
            reqwest::StatusCode::NOT_FOUND => Ok(false),
            _ => Err(Self::api_error("volume claim lookup", response).await),
        }
    }
}

/// Map a `batch/v1` Job object onto [`JobStatus`] using its terminal conditions.
pub fn parse_job_status(job: &Value) -> JobStatus {
    let status = &job["status"];
    let condition_true = |kind: &str| {
        status["conditions"]
            .as_array()
            .map(|conditions| {
                conditions
                    .iter()
                    .any(|c| c["type"] == kind && c["status"] == "True")
            })
            .unwrap_or(false)
    };

    if condition_true("Failed") {
        JobStatus::Failed
    } else if condition_true("Complete") {
        JobStatus::Succeeded
    } else {
        match status["active"].as_u64() {
            Some(active) if active > 0 => JobStatus::Running {
                active: active as u32,
            },
            _ => JobStatus::Pending,
        }
    }
}
