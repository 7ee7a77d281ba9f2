//! Configuration type definitions for the worker
//!
//! A deployment describes three things: how to reach the broker and which
//! topology to bind (`broker`), how hard to constrain each sandbox run
//! (`sandbox`), and where the submission handler stages its inputs
//! (`handler`). Every field has a default so a minimal YAML file only needs
//! the routing key.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub handler: HandlerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Full AMQP URI; takes precedence over the individual connection fields.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_password")]
    pub password: String,
    #[serde(default)]
    pub routing_key: String,
    #[serde(default = "default_exchange")]
    pub exchange: String,
    #[serde(default)]
    pub exchange_kind: ExchangeKind,
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default = "default_tag")]
    pub tag: String,
    #[serde(default)]
    pub redelivery: RedeliveryPolicy,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: default_host(),
            port: default_port(),
            user: default_user(),
            password: default_password(),
            routing_key: String::new(),
            exchange: default_exchange(),
            exchange_kind: ExchangeKind::default(),
            queue: default_queue(),
            tag: default_tag(),
            redelivery: RedeliveryPolicy::default(),
        }
    }
}

impl BrokerConfig {
    /// Connection string for the broker, either given verbatim or assembled
    /// from host, port and credentials.
    pub fn address(&self) -> String {
        match &self.url {
            Some(url) => url.clone(),
            None => format!(
                "amqp://{}:{}@{}:{}/%2f",
                self.user, self.password, self.host, self.port
            ),
        }
    }

    /// Freeze the broker section into the immutable value shared by
    /// consumers and producers.
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            identity: self.tag.clone(),
            broker_address: self.address(),
            exchange_name: self.exchange.clone(),
            exchange_kind: self.exchange_kind,
            queue_name: self.queue.clone(),
            routing_key: self.routing_key.clone(),
            redelivery: self.redelivery,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
        }
    }
}

/// What to do with a delivery whose handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedeliveryPolicy {
    /// Always requeue. A job that can never succeed is redelivered forever.
    #[default]
    Requeue,
    /// Requeue the first failure, reject a failing redelivery without requeue.
    DropRedelivered,
}

impl RedeliveryPolicy {
    pub fn should_requeue(&self, redelivered: bool) -> bool {
        match self {
            RedeliveryPolicy::Requeue => true,
            RedeliveryPolicy::DropRedelivered => !redelivered,
        }
    }
}

/// Process-wide broker topology and identity. Constructed once at startup
/// and shared read-only behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub identity: String,
    pub broker_address: String,
    pub exchange_name: String,
    pub exchange_kind: ExchangeKind,
    pub queue_name: String,
    pub routing_key: String,
    pub redelivery: RedeliveryPolicy,
}

impl WorkerConfig {
    /// Broker address with any credentials masked, for log output.
    pub fn redacted_address(&self) -> String {
        let address = &self.broker_address;
        let Some(scheme_end) = address.find("://") else {
            return address.clone();
        };
        match address[scheme_end + 3..].rfind('@') {
            Some(at) => format!(
                "{}://***@{}",
                &address[..scheme_end],
                &address[scheme_end + 3 + at + 1..]
            ),
            None => address.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default = "default_memory_limit")]
    pub memory_limit_bytes: u64,
    #[serde(default = "default_output_limit")]
    pub output_limit_bytes: usize,
    #[serde(default = "default_cpu_period")]
    pub cpu_period: i64,
    #[serde(default = "default_cpu_quota")]
    pub cpu_quota: i64,
    #[serde(default)]
    pub docker_host: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            memory_limit_bytes: default_memory_limit(),
            output_limit_bytes: default_output_limit(),
            cpu_period: default_cpu_period(),
            cpu_quota: default_cpu_quota(),
            docker_host: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerConfig {
    #[serde(default = "default_workdir")]
    pub workdir: PathBuf,
    /// Decode jobs and acknowledge them without running anything.
    #[serde(default)]
    pub void: bool,
    /// Largest archive a job may have downloaded.
    #[serde(default = "default_max_archive_bytes")]
    pub max_archive_bytes: u64,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            workdir: default_workdir(),
            void: false,
            max_archive_bytes: default_max_archive_bytes(),
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5672
}

fn default_user() -> String {
    "guest".to_string()
}

fn default_password() -> String {
    "guest".to_string()
}

fn default_exchange() -> String {
    "sandgrade-worker-exchange".to_string()
}

fn default_queue() -> String {
    "sandgrade-worker-submissions".to_string()
}

fn default_tag() -> String {
    "SimpleSubmission".to_string()
}

fn default_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_memory_limit() -> u64 {
    200 * 1024 * 1024
}

fn default_output_limit() -> usize {
    32 * 1024
}

fn default_cpu_period() -> i64 {
    100_000
}

fn default_cpu_quota() -> i64 {
    100_000
}

fn default_workdir() -> PathBuf {
    std::env::temp_dir().join("sandgrade")
}

fn default_max_archive_bytes() -> u64 {
    256 * 1024 * 1024
}
