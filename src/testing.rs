//! In-memory container runtime for tests.
//!
//! Provides:
//! - [`FakeRuntime`]: a configurable [`ContainerRuntime`] that records calls
//! - [`RuntimeCall`]: the recorded call log entries
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mysqlbox::testing::FakeRuntime;
//!
//! let runtime = Arc::new(FakeRuntime::new().with_missing_image());
//! // hand `runtime` to `ContainerController::new` or `MySqlBox::start_with_runtime`
//! ```

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};

use crate::runtime::{ContainerRuntime, ContainerSpec, LogChunk, PullProgress, RuntimeError};

/// A call made against a [`FakeRuntime`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    Create,
    Pull(String),
    Start(String),
    HostPort(String),
    Logs(String),
    Stop(String, Duration),
    WaitRemoved(String),
    Remove(String),
    ListLabeled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImageState {
    Present,
    MissingUntilPulled,
    NeverAvailable,
}

/// A scriptable container runtime that keeps containers in memory.
pub struct FakeRuntime {
    image: Mutex<ImageState>,
    create_error: Option<RuntimeError>,
    start_error: Option<RuntimeError>,
    stop_error: Option<RuntimeError>,
    wait_error: Option<RuntimeError>,
    remove_error: Option<RuntimeError>,
    list_error: Option<RuntimeError>,
    pull_error: Option<String>,
    host_port: Option<String>,
    log_frames: Vec<LogChunk>,
    logs_stay_open: bool,
    containers: Mutex<HashMap<String, HashMap<String, String>>>,
    calls: Mutex<Vec<RuntimeCall>>,
    specs: Mutex<Vec<ContainerSpec>>,
    next_id: AtomicU32,
    pulled: AtomicBool,
}

impl FakeRuntime {
    /// A runtime where everything succeeds, the image is present, port
    /// 49153 is bound and the log stream stays open until stopped.
    pub fn new() -> Self {
        Self {
            image: Mutex::new(ImageState::Present),
            create_error: None,
            start_error: None,
            stop_error: None,
            wait_error: None,
            remove_error: None,
            list_error: None,
            pull_error: None,
            host_port: Some("49153".to_string()),
            log_frames: Vec::new(),
            logs_stay_open: true,
            containers: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            specs: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(1),
            pulled: AtomicBool::new(false),
        }
    }

    /// Creation reports a missing image until it has been pulled.
    pub fn with_missing_image(mut self) -> Self {
        self.image = Mutex::new(ImageState::MissingUntilPulled);
        self
    }

    /// Creation reports a missing image even after pulling.
    pub fn with_image_never_available(mut self) -> Self {
        self.image = Mutex::new(ImageState::NeverAvailable);
        self
    }

    pub fn with_create_error(mut self, error: RuntimeError) -> Self {
        self.create_error = Some(error);
        self
    }

    pub fn with_start_error(mut self, error: RuntimeError) -> Self {
        self.start_error = Some(error);
        self
    }

    pub fn with_stop_error(mut self, error: RuntimeError) -> Self {
        self.stop_error = Some(error);
        self
    }

    pub fn with_wait_error(mut self, error: RuntimeError) -> Self {
        self.wait_error = Some(error);
        self
    }

    pub fn with_remove_error(mut self, error: RuntimeError) -> Self {
        self.remove_error = Some(error);
        self
    }

    pub fn with_list_error(mut self, error: RuntimeError) -> Self {
        self.list_error = Some(error);
        self
    }

    pub fn with_pull_error(mut self, reason: impl Into<String>) -> Self {
        self.pull_error = Some(reason.into());
        self
    }

    pub fn with_host_port(mut self, port: impl Into<String>) -> Self {
        self.host_port = Some(port.into());
        self
    }

    pub fn without_host_port(mut self) -> Self {
        self.host_port = None;
        self
    }

    /// Frames replayed by the log stream. When `stay_open` is false the
    /// stream ends after the frames, as if the container had exited.
    pub fn with_logs(mut self, frames: Vec<LogChunk>, stay_open: bool) -> Self {
        self.log_frames = frames;
        self.logs_stay_open = stay_open;
        self
    }

    /// Convenience for a stderr frame.
    pub fn stderr(text: &str) -> LogChunk {
        LogChunk::Stderr(Bytes::from(text.to_string()))
    }

    /// Convenience for a stdout frame.
    pub fn stdout(text: &str) -> LogChunk {
        LogChunk::Stdout(Bytes::from(text.to_string()))
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// IDs of containers that currently exist.
    pub fn containers(&self) -> Vec<String> {
        self.containers
            .lock()
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Specs of every successfully created container, in order.
    pub fn created_specs(&self) -> Vec<ContainerSpec> {
        self.specs.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn record(&self, call: RuntimeCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    fn image_state(&self) -> ImageState {
        self.image.lock().map(|s| *s).unwrap_or(ImageState::Present)
    }
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        self.record(RuntimeCall::Create);

        if let Some(error) = &self.create_error {
            return Err(error.clone());
        }
        match self.image_state() {
            ImageState::NeverAvailable => {
                return Err(RuntimeError::NotFound(format!("No such image: {}", spec.image)));
            }
            ImageState::MissingUntilPulled if !self.pulled.load(Ordering::SeqCst) => {
                return Err(RuntimeError::NotFound(format!("No such image: {}", spec.image)));
            }
            _ => {}
        }

        let id = format!("fake{:04}", self.next_id.fetch_add(1, Ordering::SeqCst));
        if let Ok(mut containers) = self.containers.lock() {
            containers.insert(id.clone(), spec.labels.clone());
        }
        if let Ok(mut specs) = self.specs.lock() {
            specs.push(spec.clone());
        }
        Ok(id)
    }

    fn pull_image(&self, image: &str) -> BoxStream<'static, Result<PullProgress, RuntimeError>> {
        self.record(RuntimeCall::Pull(image.to_string()));

        if let Some(reason) = &self.pull_error {
            return stream::iter(vec![Err(RuntimeError::Api(reason.clone()))]).boxed();
        }

        self.pulled.store(true, Ordering::SeqCst);
        let events = vec![
            Ok(PullProgress {
                status: Some(format!("Pulling from {}", image)),
                ..Default::default()
            }),
            Ok(PullProgress {
                status: Some("Pull complete".to_string()),
                ..Default::default()
            }),
        ];
        stream::iter(events).boxed()
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.record(RuntimeCall::Start(id.to_string()));
        match &self.start_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    async fn host_port(
        &self,
        id: &str,
        _container_port: &str,
    ) -> Result<Option<String>, RuntimeError> {
        self.record(RuntimeCall::HostPort(id.to_string()));
        Ok(self.host_port.clone())
    }

    fn logs(&self, id: &str) -> BoxStream<'static, Result<LogChunk, RuntimeError>> {
        self.record(RuntimeCall::Logs(id.to_string()));

        let frames = stream::iter(self.log_frames.clone().into_iter().map(Ok));
        if self.logs_stay_open {
            frames.chain(stream::pending()).boxed()
        } else {
            frames.boxed()
        }
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), RuntimeError> {
        self.record(RuntimeCall::Stop(id.to_string(), grace));
        if let Some(error) = &self.stop_error {
            return Err(error.clone());
        }

        let existed = self
            .containers
            .lock()
            .map(|mut c| c.remove(id).is_some())
            .unwrap_or(false);
        if existed {
            Ok(())
        } else {
            Err(RuntimeError::NotFound(format!("No such container: {}", id)))
        }
    }

    async fn wait_removed(&self, id: &str) -> Result<(), RuntimeError> {
        self.record(RuntimeCall::WaitRemoved(id.to_string()));
        match &self.wait_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.record(RuntimeCall::Remove(id.to_string()));
        if let Some(error) = &self.remove_error {
            return Err(error.clone());
        }
        let existed = self
            .containers
            .lock()
            .map(|mut c| c.remove(id).is_some())
            .unwrap_or(false);
        if existed {
            Ok(())
        } else {
            Err(RuntimeError::NotFound(format!("No such container: {}", id)))
        }
    }

    async fn list_labeled(&self, key: &str, value: &str) -> Result<Vec<String>, RuntimeError> {
        self.record(RuntimeCall::ListLabeled);
        if let Some(error) = &self.list_error {
            return Err(error.clone());
        }
        let containers = self
            .containers
            .lock()
            .map_err(|_| RuntimeError::Api("state lock poisoned".to_string()))?;

        Ok(containers
            .iter()
            .filter(|(_, labels)| labels.get(key).map(String::as_str) == Some(value))
            .map(|(id, _)| id.clone())
            .collect())
    }
}
