//! Safe retirement of AWS storage: S3 buckets and CloudWatch log groups.
//!
//! Everything destructive is preceded by a local snapshot, deletes go out in
//! bounded sequential batches, and retention changes only follow a complete
//! export. Work fans out over regions and then over resources.

pub mod client;
pub mod config;
pub mod confirm;
pub mod destroy;
pub mod error;
pub mod logging;
pub mod logs_aux;
pub mod memory;
pub mod orchestrator;
pub mod paginate;
pub mod poller;
pub mod provider;
pub mod retention;
pub mod s3_aux;
pub mod snapshot;
pub mod summary;
pub mod types;

pub use client::AwsContext;
pub use config::RunConfig;
pub use error::{ProviderError, Result, RetireError};
pub use types::{Action, OperationMode, ResourceHandle};
