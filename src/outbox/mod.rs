//! Durable notification outbox. Messages are written in the same unit of
//! work as the balance change they describe and shipped afterwards.

pub mod sink;
pub mod worker;

pub use sink::{KafkaNotificationSink, LoggingNotificationSink, NotificationSink};
pub use worker::{OutboxRunReport, OutboxWorker};
