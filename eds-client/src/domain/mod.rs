mod datapoint;

pub use datapoint::{truncate, Datapoint};
