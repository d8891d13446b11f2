pub mod handler;
pub mod key_generator;
pub mod storage;

pub use handler::{
    IdempotencyCleanupJob, IdempotencyGuard, IdempotencyGuardConfig, IdempotencyMetrics,
    MetricsSnapshot, Replayable, Reservation, ReservationToken,
};
pub use key_generator::IdempotencyKeyGenerator;
pub use storage::{
    IdempotencyRecord, IdempotencyScope, IdempotencyStatus, IdempotencyStore,
    InMemoryIdempotencyStore, PostgresIdempotencyStore, ReserveOutcome,
};
