use async_trait::async_trait;
use aws_sdk_s3::types::{
    BucketLocationConstraint, BucketVersioningStatus, CreateBucketConfiguration, Delete,
    ObjectIdentifier,
};
use aws_sdk_s3::Client;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::client::AwsContext;
use crate::error::{from_sdk, ProviderError, RetireError};
use crate::provider::{ObjectStore, Page};
use crate::types::{ItemError, ObjectEntry, ResourceHandle};

/// `ObjectStore` backed by Amazon S3.
#[derive(Debug, Clone)]
pub struct S3Store {
    client: Client,
    region: String,
}

impl S3Store {
    pub fn from_context(ctx: &AwsContext) -> Self {
        Self {
            client: ctx.s3_client(),
            region: ctx.region().to_string(),
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Create `bucket` in this store's region unless it is already there.
    pub async fn ensure_bucket(&self, bucket: &str) -> Result<(), ProviderError> {
        if self.bucket_exists(bucket).await? {
            info!(bucket = %bucket, "Bucket already exists");
            return Ok(());
        }

        info!(bucket = %bucket, region = %self.region, "Creating bucket");
        let mut request = self.client.create_bucket().bucket(bucket);
        // us-east-1 rejects an explicit location constraint
        if self.region != "us-east-1" {
            let cfg = CreateBucketConfiguration::builder()
                .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                .build();
            request = request.create_bucket_configuration(cfg);
        }
        request
            .send()
            .await
            .map_err(|e| from_sdk("create_bucket", e))?;
        Ok(())
    }

    /// Allow CloudWatch Logs to write export tasks into `bucket`.
    pub async fn allow_log_exports(&self, bucket: &str) -> Result<(), ProviderError> {
        let policy = serde_json::json!({
            "Version": "2012-10-17",
            "Statement": [{
                "Sid": "AllowCloudWatchLogsExport",
                "Effect": "Allow",
                "Principal": {"Service": "logs.amazonaws.com"},
                "Action": ["s3:GetBucketAcl", "s3:PutObject"],
                "Resource": [
                    format!("arn:aws:s3:::{bucket}"),
                    format!("arn:aws:s3:::{bucket}/*"),
                ],
            }],
        });
        self.client
            .put_bucket_policy()
            .bucket(bucket)
            .policy(policy.to_string())
            .send()
            .await
            .map_err(|e| from_sdk("put_bucket_policy", e))?;
        info!(bucket = %bucket, "Attached log export policy");
        Ok(())
    }
}

const VERSION_CURSOR_SEPARATOR: char = '\n';

/// Version listings need two markers; they travel as one opaque cursor.
fn encode_version_cursor(key: Option<&str>, version: Option<&str>) -> Option<String> {
    key.map(|k| format!("{k}{VERSION_CURSOR_SEPARATOR}{}", version.unwrap_or_default()))
}

fn decode_version_cursor(cursor: &str) -> (String, Option<String>) {
    match cursor.split_once(VERSION_CURSOR_SEPARATOR) {
        Some((key, "")) => (key.to_string(), None),
        Some((key, version)) => (key.to_string(), Some(version.to_string())),
        None => (cursor.to_string(), None),
    }
}

/// `LocationConstraint` of a bucket mapped to a region name.
fn region_from_location(location: Option<&str>) -> String {
    match location {
        None | Some("") => "us-east-1".to_string(),
        Some("EU") => "eu-west-1".to_string(),
        Some(region) => region.to_string(),
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, ProviderError> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(true),
            Err(err) => {
                let err = from_sdk("head_bucket", err);
                if err.is_not_found() {
                    Ok(false)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn bucket_tags(&self, bucket: &str) -> Result<Vec<(String, String)>, ProviderError> {
        match self.client.get_bucket_tagging().bucket(bucket).send().await {
            Ok(resp) => Ok(resp
                .tag_set()
                .iter()
                .map(|t| (t.key().to_string(), t.value().to_string()))
                .collect()),
            Err(err) => {
                let err = from_sdk("get_bucket_tagging", err);
                if err.code() == Some("NoSuchTagSet") {
                    Ok(Vec::new())
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn bucket_region(&self, bucket: &str) -> Result<String, ProviderError> {
        let resp = self
            .client
            .get_bucket_location()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| from_sdk("get_bucket_location", e))?;
        Ok(region_from_location(
            resp.location_constraint().map(|c| c.as_str()),
        ))
    }

    async fn is_versioned(&self, bucket: &str) -> Result<bool, ProviderError> {
        let resp = self
            .client
            .get_bucket_versioning()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| from_sdk("get_bucket_versioning", e))?;
        // suspended buckets still hold the versions written before suspension
        Ok(matches!(
            resp.status(),
            Some(BucketVersioningStatus::Enabled) | Some(BucketVersioningStatus::Suspended)
        ))
    }

    async fn list_objects(
        &self,
        bucket: &str,
        cursor: Option<String>,
    ) -> Result<Page<ObjectEntry>, ProviderError> {
        let resp = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .set_continuation_token(cursor)
            .send()
            .await
            .map_err(|e| from_sdk("list_objects_v2", e))?;

        let items = resp
            .contents()
            .iter()
            .filter_map(|obj| {
                let key = obj.key()?;
                let size = obj.size().unwrap_or_default().max(0) as u64;
                Some(ObjectEntry::object(ResourceHandle::new(bucket, key), size))
            })
            .collect();

        let next = if resp.is_truncated() == Some(true) {
            resp.next_continuation_token().map(str::to_string)
        } else {
            None
        };
        Ok(Page::new(items, next))
    }

    async fn list_versions(
        &self,
        bucket: &str,
        cursor: Option<String>,
    ) -> Result<Page<ObjectEntry>, ProviderError> {
        let (key_marker, version_marker) = match cursor.as_deref().map(decode_version_cursor) {
            Some((key, version)) => (Some(key), version),
            None => (None, None),
        };
        let resp = self
            .client
            .list_object_versions()
            .bucket(bucket)
            .set_key_marker(key_marker)
            .set_version_id_marker(version_marker)
            .send()
            .await
            .map_err(|e| from_sdk("list_object_versions", e))?;

        let mut items: Vec<ObjectEntry> = resp
            .versions()
            .iter()
            .filter_map(|v| {
                let handle = ResourceHandle {
                    collection: bucket.to_string(),
                    key: v.key()?.to_string(),
                    version_id: v.version_id().map(str::to_string),
                };
                Some(ObjectEntry::object(handle, v.size().unwrap_or_default().max(0) as u64))
            })
            .collect();
        items.extend(resp.delete_markers().iter().filter_map(|m| {
            Some(ObjectEntry::delete_marker(ResourceHandle {
                collection: bucket.to_string(),
                key: m.key()?.to_string(),
                version_id: m.version_id().map(str::to_string),
            }))
        }));

        let next = if resp.is_truncated() == Some(true) {
            encode_version_cursor(resp.next_key_marker(), resp.next_version_id_marker())
        } else {
            None
        };
        Ok(Page::new(items, next))
    }

    async fn download(&self, handle: &ResourceHandle, dest: &Path) -> Result<u64, RetireError> {
        let resp = self
            .client
            .get_object()
            .bucket(&handle.collection)
            .key(&handle.key)
            .set_version_id(handle.version_id.clone())
            .send()
            .await
            .map_err(|e| from_sdk("get_object", e))?;

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| RetireError::io(dest, e))?;
        let mut body = resp.body;
        let mut written = 0_u64;
        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|e| ProviderError::transient("get_object", e.to_string()))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|e| RetireError::io(dest, e))?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| RetireError::io(dest, e))?;
        debug!(handle = %handle, bytes = written, "Downloaded object");
        Ok(written)
    }

    async fn delete_batch(
        &self,
        bucket: &str,
        handles: &[ResourceHandle],
    ) -> Result<Vec<ItemError>, ProviderError> {
        let invalid = |e: aws_sdk_s3::error::BuildError| {
            ProviderError::permanent("delete_objects", "InvalidRequest", e.to_string())
        };
        let objects = handles
            .iter()
            .map(|h| {
                ObjectIdentifier::builder()
                    .key(&h.key)
                    .set_version_id(h.version_id.clone())
                    .build()
                    .map_err(invalid)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let delete = Delete::builder()
            .set_objects(Some(objects))
            .quiet(true)
            .build()
            .map_err(invalid)?;

        let resp = self
            .client
            .delete_objects()
            .bucket(bucket)
            .delete(delete)
            .send()
            .await
            .map_err(|e| from_sdk("delete_objects", e))?;

        Ok(resp
            .errors()
            .iter()
            .map(|e| ItemError {
                handle: ResourceHandle {
                    collection: bucket.to_string(),
                    key: e.key().unwrap_or_default().to_string(),
                    version_id: e.version_id().map(str::to_string),
                },
                code: e.code().unwrap_or("Unknown").to_string(),
                message: e.message().unwrap_or_default().to_string(),
            })
            .collect())
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<(), ProviderError> {
        self.client
            .delete_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| from_sdk("delete_bucket", e))?;
        info!(bucket = %bucket, "Bucket deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_cursor_round_trip_keeps_both_markers() {
        let cursor = encode_version_cursor(Some("a/b.txt"), Some("v7")).unwrap();
        assert_eq!(
            decode_version_cursor(&cursor),
            ("a/b.txt".to_string(), Some("v7".to_string()))
        );
        let cursor = encode_version_cursor(Some("k"), None).unwrap();
        assert_eq!(decode_version_cursor(&cursor), ("k".to_string(), None));
        assert_eq!(encode_version_cursor(None, Some("v")), None);
    }

    #[test]
    fn location_constraint_to_region() {
        assert_eq!(region_from_location(None), "us-east-1");
        assert_eq!(region_from_location(Some("")), "us-east-1");
        assert_eq!(region_from_location(Some("EU")), "eu-west-1");
        assert_eq!(region_from_location(Some("eu-central-1")), "eu-central-1");
    }
}
