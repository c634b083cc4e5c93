//! Scriptable stand-in for the remote API.

use async_trait::async_trait;
use outbox_sync::error::RemoteError;
use outbox_sync::remote::{CreatedRecord, RemoteApi};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// One request the engine sent
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCall {
    Create {
        resource: String,
        body: Value,
    },
    Update {
        resource: String,
        external_id: String,
        body: Value,
    },
    Delete {
        resource: String,
        external_id: String,
    },
}

impl RemoteCall {
    pub fn resource(&self) -> &str {
        match self {
            Self::Create { resource, .. }
            | Self::Update { resource, .. }
            | Self::Delete { resource, .. } => resource,
        }
    }

    pub fn body(&self) -> Option<&Value> {
        match self {
            Self::Create { body, .. } | Self::Update { body, .. } => Some(body),
            Self::Delete { .. } => None,
        }
    }
}

/// Records every call and answers from a per-resource script.
///
/// Creates succeed with `{"id": "<resource>-<n>"}` unless a failure is queued.
#[derive(Debug, Default)]
pub struct MockRemoteApi {
    calls: Mutex<Vec<RemoteCall>>,
    queued_failures: Mutex<HashMap<String, VecDeque<RemoteError>>>,
    permanent_failures: Mutex<HashMap<String, RemoteError>>,
    created: AtomicUsize,
    latency: Duration,
}

impl MockRemoteApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call, so concurrent workers overlap
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    /// Fail the next `times` calls against `resource`
    pub fn fail_next(&self, resource: &str, times: usize, error: RemoteError) {
        let mut queued = self.queued_failures.lock();
        let queue = queued.entry(resource.to_string()).or_default();
        for _ in 0..times {
            queue.push_back(error.clone());
        }
    }

    /// Fail every call against `resource`
    pub fn fail_always(&self, resource: &str, error: RemoteError) {
        self.permanent_failures
            .lock()
            .insert(resource.to_string(), error);
    }

    pub fn recover(&self, resource: &str) {
        self.permanent_failures.lock().remove(resource);
        self.queued_failures.lock().remove(resource);
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, resource: &str) -> Vec<RemoteCall> {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.resource() == resource)
            .cloned()
            .collect()
    }

    async fn answer(&self, call: RemoteCall) -> Result<(), RemoteError> {
        let resource = call.resource().to_string();
        self.calls.lock().push(call);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if let Some(error) = self.permanent_failures.lock().get(&resource) {
            return Err(error.clone());
        }
        let queued = self
            .queued_failures
            .lock()
            .get_mut(&resource)
            .and_then(VecDeque::pop_front);
        match queued {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteApi for MockRemoteApi {
    async fn create(&self, resource: &str, body: &Value) -> Result<CreatedRecord, RemoteError> {
        self.answer(RemoteCall::Create {
            resource: resource.to_string(),
            body: body.clone(),
        })
        .await?;

        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        let external_id = format!("{resource}-{n}");
        let mut response = body.clone();
        if let Some(fields) = response.as_object_mut() {
            fields.insert("id".to_string(), json!(external_id));
        }
        Ok(CreatedRecord {
            external_id,
            response,
        })
    }

    async fn update(
        &self,
        resource: &str,
        external_id: &str,
        body: &Value,
    ) -> Result<(), RemoteError> {
        self.answer(RemoteCall::Update {
            resource: resource.to_string(),
            external_id: external_id.to_string(),
            body: body.clone(),
        })
        .await
    }

    async fn delete(&self, resource: &str, external_id: &str) -> Result<(), RemoteError> {
        self.answer(RemoteCall::Delete {
            resource: resource.to_string(),
            external_id: external_id.to_string(),
        })
        .await
    }
}
