pub mod eds_device;

pub use eds_device::{acquire, fetch_with_retry, EdsDeviceSource, Fetch, HttpFetcher, RetryPolicy};
