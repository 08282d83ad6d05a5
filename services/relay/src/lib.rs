//! Adaptation Relay
//!
//! Front stage of the file adaptation pipeline. The relay consumes adaptation
//! requests from the message broker, stages the referenced source file in an
//! S3-compatible object store, and forwards the request downstream with a
//! presigned URL so the processing stage can fetch the file over HTTP.
//!
//! ## Features
//!
//! - **Header-only Messages**: Requests carry everything in AMQP headers; the
//!   relay adds `source-presigned-url` and `reply-to` and leaves every other
//!   header exactly as it arrived
//! - **Object Staging**: Date-partitioned keys, multipart uploads for large
//!   files, idempotent bucket provisioning at startup
//! - **Bounded Concurrency**: Deliveries run concurrently up to a configured
//!   limit that also sets the broker prefetch
//! - **Configurable Failure Handling**: Drop, dead-letter or requeue
//!   deliveries that could not be relayed
//!
//! ## Architecture
//!
//! ```text
//! adaptation-exchange          MinIO / S3               processing-exchange
//! ┌──────────────┐           ┌──────────────┐          ┌──────────────┐
//! │ adaptation-  │           │ {bucket}/    │          │ processing-  │
//! │ request-queue│           │   {date}/    │          │ queue        │
//! └──────────────┘           │   {uuid}/    │          └──────────────┘
//!        │                   └──────────────┘                 ▲
//!        ▼                          ▲                         │
//! ┌──────────────┐           ┌──────────────┐          ┌──────────────┐
//! │ Envelope     │──────────▶│ Object       │─────────▶│ Publisher    │
//! │ validation   │           │ Stager       │  enrich  │ (confirms)   │
//! └──────────────┘           └──────────────┘          └──────────────┘
//! ```

pub mod broker;
pub mod config;
pub mod envelope;
pub mod object_stager;
pub mod relay;

pub use broker::{AmqpBroker, BrokerError, InboundDelivery, OutgoingMessage, Publisher};
pub use config::{Config, FailurePolicy};
pub use envelope::{EnvelopeError, WorkRequest};
pub use object_stager::{S3Stager, StagedObject, Stager, StagingError};
pub use relay::{provision_buckets, DeliveryError, Relay, RelayError, RelaySettings, RelayState};
