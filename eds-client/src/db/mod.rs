mod env_queries;

pub use env_queries::{ensure_schema, insert_datapoint};
