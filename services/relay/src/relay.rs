use crate::broker::{BrokerError, DeliveryStream, InboundDelivery, OutgoingMessage, Publisher};
use crate::config::{Config, FailurePolicy};
use crate::envelope::{EnvelopeError, WorkRequest};
use crate::object_stager::{Stager, StagingError};
use futures::StreamExt;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn, Span};

/// Lifecycle of the relay process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Connecting to the broker and declaring the topology
    Starting,
    /// Every configured bucket exists
    BucketsReady,
    /// Deliveries are being relayed
    Consuming,
    /// Startup or the consumer failed; the process exits
    Fatal,
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RelayState::Starting => "starting",
            RelayState::BucketsReady => "buckets_ready",
            RelayState::Consuming => "consuming",
            RelayState::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

/// Why a single delivery was not relayed
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error("Upload timed out after {0:?}")]
    UploadTimeout(Duration),

    #[error(transparent)]
    Publish(#[from] BrokerError),

    #[error("Publish timed out after {0:?}")]
    PublishTimeout(Duration),
}

impl DeliveryError {
    /// Short label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            DeliveryError::Envelope(_) => "validation",
            DeliveryError::Staging(StagingError::SourceNotFound { .. }) => "source_not_found",
            DeliveryError::Staging(_) | DeliveryError::UploadTimeout(_) => "upload",
            DeliveryError::Publish(_) | DeliveryError::PublishTimeout(_) => "publish",
        }
    }
}

/// Errors that stop the relay loop
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Consumer failed: {0}")]
    Consumer(#[source] BrokerError),

    #[error("Consumer stream closed by the broker")]
    ConsumerClosed,

    /// The relay never closes its semaphore; acquiring a permit fails only
    /// after a close
    #[error("In-flight limiter closed")]
    LimiterClosed,
}

/// How a delivery is settled with the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Reject { requeue: bool },
}

impl Settlement {
    /// Settlement for a finished delivery.
    ///
    /// Malformed requests are never requeued; they would fail the same way.
    pub fn for_outcome(
        outcome: Result<(), &DeliveryError>,
        policy: FailurePolicy,
        redelivered: bool,
    ) -> Self {
        let error = match outcome {
            Ok(()) => return Settlement::Ack,
            Err(error) => error,
        };

        match policy {
            FailurePolicy::Drop => Settlement::Ack,
            FailurePolicy::DeadLetter => Settlement::Reject { requeue: false },
            FailurePolicy::Requeue => Settlement::Reject {
                requeue: !redelivered && !matches!(error, DeliveryError::Envelope(_)),
            },
        }
    }
}

/// Settings the relay loop runs with
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub source_bucket: String,
    pub url_ttl: Duration,
    pub outbound_exchange: String,
    pub outbound_routing_key: String,
    pub max_in_flight: usize,
    pub upload_timeout: Duration,
    pub publish_timeout: Duration,
    pub failure_policy: FailurePolicy,
    pub shutdown_grace: Duration,
}

impl RelaySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            source_bucket: config.storage.source_bucket.clone(),
            url_ttl: config.presigned_url_ttl(),
            outbound_exchange: config.broker.outbound.exchange.clone(),
            outbound_routing_key: config.broker.outbound.routing_key.clone(),
            max_in_flight: config.relay.max_in_flight,
            upload_timeout: config.upload_timeout(),
            publish_timeout: config.publish_timeout(),
            failure_policy: config.relay.failure_policy,
            shutdown_grace: config.shutdown_grace(),
        }
    }
}

/// Create every bucket the relay needs; the first failure aborts
pub async fn provision_buckets<S>(stager: &S, buckets: &[&str]) -> Result<(), StagingError>
where
    S: Stager + ?Sized,
{
    for bucket in buckets {
        stager.ensure_bucket(bucket).await?;
    }
    Ok(())
}

/// Consume → stage → enrich → republish
pub struct Relay<S, P> {
    stager: Arc<S>,
    publisher: Arc<P>,
    settings: RelaySettings,
    in_flight: Arc<Semaphore>,
}

impl<S, P> Relay<S, P>
where
    S: Stager + 'static,
    P: Publisher + 'static,
{
    pub fn new(stager: Arc<S>, publisher: Arc<P>, settings: RelaySettings) -> Self {
        let in_flight = Arc::new(Semaphore::new(settings.max_in_flight));
        Self {
            stager,
            publisher,
            settings,
            in_flight,
        }
    }

    /// Consume until shutdown or until the consumer breaks.
    ///
    /// Each delivery runs on its own task. A permit is taken before the next
    /// delivery is pulled, so at most `max_in_flight` are handled at once.
    /// In-flight deliveries are drained for up to `shutdown_grace` on exit.
    #[instrument(skip_all)]
    pub async fn run(
        self: Arc<Self>,
        mut deliveries: DeliveryStream,
        shutdown: CancellationToken,
    ) -> Result<(), RelayError> {
        let tracker = TaskTracker::new();

        info!(
            max_in_flight = self.settings.max_in_flight,
            "Starting relay loop"
        );

        let result = loop {
            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                permit = Arc::clone(&self.in_flight).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break Err(RelayError::LimiterClosed),
                },
            };

            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    let relay = Arc::clone(&self);
                    tracker.spawn(async move {
                        relay.process(delivery).await;
                        drop(permit);
                    });
                }
                Some(Err(e)) => break Err(RelayError::Consumer(e)),
                None => break Err(RelayError::ConsumerClosed),
            }
        };

        tracker.close();
        debug!(in_flight = tracker.len(), "Draining in-flight deliveries");
        if timeout(self.settings.shutdown_grace, tracker.wait())
            .await
            .is_err()
        {
            warn!(
                in_flight = tracker.len(),
                "Shutdown grace period elapsed with deliveries still in flight"
            );
        }

        result
    }

    /// Relay one delivery, log the outcome and settle it with the broker
    #[instrument(
        skip(self, delivery),
        fields(delivery_tag = delivery.delivery_tag, file_id = tracing::field::Empty)
    )]
    pub async fn process(&self, delivery: InboundDelivery) {
        metrics::counter!("relay.deliveries.received").increment(1);

        let outcome = self.relay(&delivery).await;

        match &outcome {
            Ok(request) => {
                metrics::counter!("relay.deliveries.published").increment(1);
                info!(
                    file_id = %request.file_id(),
                    "Adaptation request forwarded"
                );
            }
            Err(DeliveryError::Envelope(e)) => {
                metrics::counter!("relay.deliveries.rejected").increment(1);
                warn!(
                    field = e.field(),
                    error = %e,
                    "Dropping invalid adaptation request"
                );
            }
            Err(e) => {
                metrics::counter!("relay.deliveries.failed", "kind" => e.kind()).increment(1);
                error!(
                    kind = e.kind(),
                    error = %e,
                    "Failed to relay adaptation request"
                );
            }
        }

        let settlement = Settlement::for_outcome(
            outcome.as_ref().map(|_| ()),
            self.settings.failure_policy,
            delivery.redelivered,
        );

        let settled = match settlement {
            Settlement::Ack => delivery.acker.ack().await,
            Settlement::Reject { requeue } => delivery.acker.reject(requeue).await,
        };

        if let Err(e) = settled {
            warn!(error = %e, ?settlement, "Failed to settle delivery");
        }
    }

    /// Validate, upload, enrich and publish, strictly in that order.
    ///
    /// Nothing touches the store or the broker until validation passed.
    pub async fn relay(&self, delivery: &InboundDelivery) -> Result<WorkRequest, DeliveryError> {
        let mut request = WorkRequest::validate(&delivery.headers)?;
        Span::current().record("file_id", request.file_id());

        debug!(
            source = %request.source_file_location(),
            rebuilt = %request.rebuilt_file_location(),
            "Received adaptation request"
        );

        let started = Instant::now();
        let staged = timeout(
            self.settings.upload_timeout,
            self.stager.upload_and_sign(
                &self.settings.source_bucket,
                request.source_file_location(),
                self.settings.url_ttl,
            ),
        )
        .await
        .map_err(|_| DeliveryError::UploadTimeout(self.settings.upload_timeout))??;
        metrics::histogram!("relay.upload.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        debug!(
            key = %staged.key,
            expires_at = %staged.expires_at,
            "Source staged"
        );

        request.enrich(staged.url, delivery.reply_to.clone().unwrap_or_default());

        let message = OutgoingMessage::headers_only(
            &self.settings.outbound_exchange,
            &self.settings.outbound_routing_key,
            request.to_headers(),
        );

        timeout(
            self.settings.publish_timeout,
            self.publisher.publish(message),
        )
        .await
        .map_err(|_| DeliveryError::PublishTimeout(self.settings.publish_timeout))??;

        Ok(request)
    }
}
