// Payload registry: maps stable keys to the work a job runs

use crate::errors::ExecutionError;
use crate::models::TriggerSource;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use uuid::Uuid;

/// What a payload returns: optional output text or an error
pub type PayloadResult = Result<Option<String>, ExecutionError>;

/// Everything a payload gets to see about the fire it serves
#[derive(Debug, Clone)]
pub struct PayloadContext {
    pub job_id: Uuid,
    pub job_name: String,
    pub execution_id: Uuid,
    pub trigger_source: TriggerSource,
    pub scheduled_fire_time: Option<DateTime<Utc>>,
    pub args: serde_json::Value,
    pub kwargs: serde_json::Map<String, serde_json::Value>,
}

/// JobPayload is the unit of work behind a `payload_ref`
#[async_trait]
pub trait JobPayload: Send + Sync {
    async fn invoke(&self, ctx: PayloadContext) -> PayloadResult;
}

type PayloadFn = dyn Fn(PayloadContext) -> BoxFuture<'static, PayloadResult> + Send + Sync;

struct FnPayload {
    f: Box<PayloadFn>,
}

#[async_trait]
impl JobPayload for FnPayload {
    async fn invoke(&self, ctx: PayloadContext) -> PayloadResult {
        (self.f)(ctx).await
    }
}

/// Registry of payloads, resolved by key at dispatch time
#[derive(Default)]
pub struct PayloadRegistry {
    payloads: RwLock<HashMap<String, Arc<dyn JobPayload>>>,
}

impl PayloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with `echo`, `sleep` and `fail`
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register_fn("echo", |ctx| async move {
            let echoed = serde_json::json!({ "args": ctx.args, "kwargs": ctx.kwargs });
            Ok(Some(echoed.to_string()))
        });
        registry.register_fn("sleep", |ctx| async move {
            let seconds = ctx
                .kwargs
                .get("seconds")
                .and_then(|v| v.as_f64())
                .unwrap_or(1.0)
                .max(0.0);
            tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
            Ok(Some(format!("slept {}s", seconds)))
        });
        registry.register_fn("fail", |ctx| async move {
            let message = ctx
                .kwargs
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("job failed")
                .to_string();
            Err(ExecutionError::Failed(message))
        });
        registry
    }

    /// Register (or replace) a payload under `key`
    pub fn register(&self, key: impl Into<String>, payload: Arc<dyn JobPayload>) {
        let key = key.into();
        tracing::debug!(payload_ref = %key, "Payload registered");
        self.payloads
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, payload);
    }

    /// Register an async closure as a payload
    pub fn register_fn<F, Fut>(&self, key: impl Into<String>, f: F)
    where
        F: Fn(PayloadContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = PayloadResult> + Send + 'static,
    {
        let invoke: Box<PayloadFn> = Box::new(move |ctx: PayloadContext| f(ctx).boxed());
        self.register(key, Arc::new(FnPayload { f: invoke }));
    }

    pub fn unregister(&self, key: &str) -> bool {
        self.payloads
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key)
            .is_some()
    }

    pub fn resolve(&self, key: &str) -> Option<Arc<dyn JobPayload>> {
        self.payloads
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.payloads
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .payloads
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}
