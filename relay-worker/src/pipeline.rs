//! # Pipeline
//!
//! Lifecycle of a relay: resolve the destination and the encoding once at start, accept records
//! from a producer, and hand back whatever was not delivered when stopped.
use std::sync::{Arc, Mutex, PoisonError};
use std::time;

use relay_common::config_source::ConfigSource;
use relay_common::health::HealthHandle;
use relay_common::record::{Record, Schema};
use relay_common::retry::RetryPolicy;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::{ClientSettings, DeliveryClient, HttpDeliveryClient};
use crate::encoder::{EncodingMode, FieldMapping, PayloadEncoder};
use crate::error::{ConfigurationError, EnqueueError};
use crate::queue::{DeliveryQueue, OverflowPolicy};
use crate::resolver::{ConfigBinding, Endpoint, EndpointResolver, EndpointSettings};
use crate::worker::DeliveryWorker;

/// Construction-time settings of a pipeline. Values from the configuration source, when one is
/// bound, take precedence over the endpoint and field mapping given here.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub endpoint: EndpointSettings,
    pub field_mapping: FieldMapping,
    pub delivery_interval: time::Duration,
    /// Zero leaves the queue unbounded.
    pub max_queue_size: usize,
    pub overflow_policy: OverflowPolicy,
    /// Zero only refreshes the endpoint on start and after a 404.
    pub max_endpoint_age: time::Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            endpoint: EndpointSettings::default(),
            field_mapping: FieldMapping::default(),
            delivery_interval: time::Duration::from_secs(1),
            max_queue_size: 0,
            overflow_policy: OverflowPolicy::default(),
            max_endpoint_age: time::Duration::ZERO,
            retry_policy: RetryPolicy::default(),
        }
    }
}

pub struct PipelineBuilder {
    schema: Schema,
    settings: PipelineSettings,
    binding: Option<ConfigBinding>,
    client: Option<Arc<dyn DeliveryClient>>,
    client_settings: ClientSettings,
    liveness: Option<HealthHandle>,
}

impl PipelineBuilder {
    pub fn settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Read the endpoint and field mapping from the configuration called `name` in `source`.
    pub fn config_source(mut self, source: Arc<dyn ConfigSource>, name: &str) -> Self {
        self.binding = Some(ConfigBinding::new(source, name));
        self
    }

    /// Deliver with `client` instead of an HTTP client built from `ClientSettings`.
    pub fn client(mut self, client: Arc<dyn DeliveryClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn client_settings(mut self, client_settings: ClientSettings) -> Self {
        self.client_settings = client_settings;
        self
    }

    pub fn liveness(mut self, liveness: HealthHandle) -> Self {
        self.liveness = Some(liveness);
        self
    }

    /// Resolve the endpoint, select the encoding mode and spawn the delivery worker.
    /// Must be called within a tokio runtime.
    pub async fn start(self) -> Result<Pipeline, ConfigurationError> {
        let settings = self.settings;

        let (resolver, snapshot) =
            EndpointResolver::start(settings.endpoint.clone(), self.binding).await?;
        let resolver = Arc::new(resolver.max_age(settings.max_endpoint_age));

        let mapping = settings.field_mapping.overridden_by(&snapshot);
        let encoder = PayloadEncoder::for_schema(&self.schema, &mapping)?;
        tracing::info!(
            mode = encoder.mode().name(),
            fields = self.schema.len(),
            "selected payload encoding"
        );

        let client = match self.client {
            Some(client) => client,
            None => Arc::new(HttpDeliveryClient::new(&self.client_settings)?),
        };

        let queue = Arc::new(DeliveryQueue::new(
            settings.max_queue_size,
            settings.overflow_policy,
        ));

        let mut worker = DeliveryWorker::new(
            queue.clone(),
            resolver.clone(),
            encoder.clone(),
            client,
        )
        .delivery_interval(settings.delivery_interval)
        .retry_policy(settings.retry_policy);
        if let Some(liveness) = self.liveness {
            worker = worker.liveness(liveness);
        }

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(worker.run(shutdown.clone()));

        Ok(Pipeline {
            queue,
            resolver,
            encoder,
            shutdown,
            worker: Mutex::new(Some(handle)),
        })
    }
}

/// A running relay. Dropping it stops the worker without waiting for it.
pub struct Pipeline {
    queue: Arc<DeliveryQueue>,
    resolver: Arc<EndpointResolver>,
    encoder: PayloadEncoder,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Pipeline {
    pub fn builder(schema: Schema) -> PipelineBuilder {
        PipelineBuilder {
            schema,
            settings: PipelineSettings::default(),
            binding: None,
            client: None,
            client_settings: ClientSettings::default(),
            liveness: None,
        }
    }

    /// Queue a record for delivery without waiting for it to be sent.
    pub fn on_record(&self, record: Record) -> Result<(), EnqueueError> {
        self.queue.push(record)
    }

    /// Wait until every queued record has been delivered or dropped.
    pub async fn flush(&self) {
        self.queue.wait_until_empty().await
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn encoding_mode(&self) -> &EncodingMode {
        self.encoder.mode()
    }

    /// The endpoint records are currently delivered to.
    pub fn endpoint(&self) -> Arc<Endpoint> {
        self.resolver.cached().0
    }

    /// Stop delivering and return the records that were not delivered, oldest first.
    /// Any attempt in flight completes first; a pending wait is cut short.
    pub async fn stop(&self) -> Vec<Record> {
        self.shutdown.cancel();

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(error) = handle.await {
                tracing::error!("delivery worker failed: {}", error);
            }
        }

        let undelivered = self.queue.close_and_drain();
        tracing::info!(undelivered = undelivered.len(), "pipeline stopped");
        undelivered
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
