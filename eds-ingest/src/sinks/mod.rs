pub mod postgres;

pub use postgres::{BatchWriter, PendingBuffer, PgStorage, PostgresSink, Storage};
