/// PostgreSQL-backed step log.
///
/// Provides [`PostgresStepLog`], a durable implementation of the
/// [`StepLog`](crate::steplog::StepLog) trait.
pub mod postgres;

pub use postgres::PostgresStepLog;
