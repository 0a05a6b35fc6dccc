use aws_config::{timeout::TimeoutConfig as SdkTimeouts, BehaviorVersion, Region, SdkConfig};
use std::sync::Arc;

use crate::config::TimeoutConfig;

/// Loaded SDK configuration for one region. Clients are created from it
/// explicitly and handed to each component; nothing is process-global.
#[derive(Clone)]
pub struct AwsContext {
    config: Arc<SdkConfig>,
    region: String,
}

impl AwsContext {
    /// Load credentials and settings for `region`, with bounded connect/read timeouts.
    pub async fn new(region: &str, timeouts: &TimeoutConfig, profile: Option<&str>) -> Self {
        let sdk_timeouts = SdkTimeouts::builder()
            .connect_timeout(timeouts.connect)
            .read_timeout(timeouts.read)
            .build();

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .timeout_config(sdk_timeouts);
        if let Some(profile) = profile {
            loader = loader.profile_name(profile);
        }

        Self {
            config: Arc::new(loader.load().await),
            region: region.to_string(),
        }
    }

    /// Same credentials and timeouts, different region.
    pub fn for_region(&self, region: &str) -> Self {
        let config = self
            .config
            .to_builder()
            .region(Region::new(region.to_string()))
            .build();
        Self {
            config: Arc::new(config),
            region: region.to_string(),
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn s3_client(&self) -> aws_sdk_s3::Client {
        aws_sdk_s3::Client::new(&self.config)
    }

    pub fn logs_client(&self) -> aws_sdk_cloudwatchlogs::Client {
        aws_sdk_cloudwatchlogs::Client::new(&self.config)
    }

    pub fn sts_client(&self) -> aws_sdk_sts::Client {
        aws_sdk_sts::Client::new(&self.config)
    }
}

impl std::fmt::Debug for AwsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsContext")
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}
