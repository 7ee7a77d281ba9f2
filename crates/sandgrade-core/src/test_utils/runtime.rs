use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use crate::errors::RuntimeError;
use crate::sandbox::{ContainerRuntime, ContainerSpec};

#[derive(Debug, Clone)]
pub enum WaitBehaviour {
    Exit(i64),
    /// Exit after sleeping, so tests can race it against the timeout.
    ExitAfter(Duration, i64),
    Hang,
}

/// A container runtime that plays back a fixed script and records every call.
pub struct ScriptedRuntime {
    pub create_error: Option<String>,
    pub start_error: Option<String>,
    pub wait: WaitBehaviour,
    pub output: Vec<u8>,
    calls: Mutex<Vec<String>>,
    specs: Mutex<Vec<ContainerSpec>>,
    live: Mutex<HashSet<String>>,
}

impl ScriptedRuntime {
    pub fn printing(output: impl Into<Vec<u8>>) -> Self {
        Self {
            create_error: None,
            start_error: None,
            wait: WaitBehaviour::Exit(0),
            output: output.into(),
            calls: Mutex::new(Vec::new()),
            specs: Mutex::new(Vec::new()),
            live: Mutex::new(HashSet::new()),
        }
    }

    pub fn hanging() -> Self {
        Self {
            wait: WaitBehaviour::Hang,
            ..Self::printing("")
        }
    }

    pub fn missing_image() -> Self {
        Self {
            create_error: Some("No such image: grader:missing".to_string()),
            ..Self::printing("")
        }
    }

    pub fn with_wait(mut self, wait: WaitBehaviour) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_start_error(mut self, message: impl Into<String>) -> Self {
        self.start_error = Some(message.into());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn specs(&self) -> Vec<ContainerSpec> {
        self.specs.lock().unwrap().clone()
    }

    pub fn live_containers(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    fn record(&self, call: &str, id: &str) {
        self.calls.lock().unwrap().push(format!("{}:{}", call, id));
    }
}

#[async_trait]
impl ContainerRuntime for ScriptedRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        self.record("create", &spec.name);
        if let Some(message) = &self.create_error {
            return Err(RuntimeError::Other(message.clone()));
        }
        self.specs.lock().unwrap().push(spec.clone());
        self.live.lock().unwrap().insert(spec.name.clone());
        Ok(spec.name.clone())
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.record("start", id);
        match &self.start_error {
            Some(message) => Err(RuntimeError::Other(message.clone())),
            None => Ok(()),
        }
    }

    async fn wait(&self, id: &str) -> Result<i64, RuntimeError> {
        self.record("wait", id);
        match &self.wait {
            WaitBehaviour::Exit(code) => Ok(*code),
            WaitBehaviour::ExitAfter(delay, code) => {
                tokio::time::sleep(*delay).await;
                Ok(*code)
            }
            WaitBehaviour::Hang => std::future::pending().await,
        }
    }

    async fn logs(&self, id: &str, max_bytes: usize) -> Result<Vec<u8>, RuntimeError> {
        self.record("logs", id);
        let take = self.output.len().min(max_bytes + 1);
        Ok(self.output[..take].to_vec())
    }

    async fn kill(&self, id: &str) -> Result<(), RuntimeError> {
        self.record("kill", id);
        if self.live.lock().unwrap().contains(id) {
            Ok(())
        } else {
            Err(RuntimeError::NotFound(id.to_string()))
        }
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        self.record("remove", id);
        self.live.lock().unwrap().remove(id);
        Ok(())
    }
}
