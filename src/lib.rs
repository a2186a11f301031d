#![doc = include_str!("../README.md")]

pub mod broker;
pub mod config;
mod consumer;
pub mod dead_letter;
pub mod envelope;
pub mod hook;
pub mod outcome;
mod publisher;
pub mod retry;

#[doc(inline)]
pub use envelope::{Envelope, MessageId};

#[doc(inline)]
pub use outcome::{DeliveryOutcome, FailureReason};

#[doc(inline)]
pub use config::DeliveryConfig;

#[doc(inline)]
pub use broker::{BrokerClient, BrokerError, BrokerErrorKind, InMemoryBroker};

#[doc(inline)]
pub use dead_letter::{
    DeadLetterReason, DeadLetterRecord, DeadLetterSink, InMemoryDeadLetterSink, SinkError,
    SinkErrorKind,
};

#[doc(inline)]
pub use retry::{RetryDecision, RetryPolicy};

#[doc(inline)]
pub use hook::{DefaultDeliveryHook, DeliveryHook};

#[doc(inline)]
pub use publisher::{BrokerService, PublishError, PublishErrorKind, Publisher};

#[doc(inline)]
pub use consumer::{ConsumerLoop, Handler};
