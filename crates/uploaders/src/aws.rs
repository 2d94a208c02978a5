//! AWS S3 uploader backed by the official SDK with static credentials.

use std::collections::HashMap;

use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::primitives::ByteStream;
use tokio_util::sync::CancellationToken;

use crate::options::required;
use crate::{checksum, ProgressCallback, SourceFile, UploadError, UploadFuture, Uploader};

/// Option keys recognized by the AWS provider.
pub const AWS_REGION: &str = "aws.region";
pub const AWS_ACCESS_KEY_ID: &str = "aws.access.key.id";
pub const AWS_SECRET_ACCESS_KEY: &str = "aws.secret.access.key";
pub const AWS_SESSION_TOKEN: &str = "aws.session.token";
pub const AWS_BUCKET: &str = "aws.s3.bucket";
pub const AWS_OBJECT_KEY: &str = "aws.object.key";

/// Uploads files to S3-compatible object storage.
///
/// The SDK owns the request body, so no fine-grained progress is reported;
/// the lifecycle engine accounts a finished object at its full size.
#[derive(Debug)]
pub struct AwsUploader {
    region: String,
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
    bucket: String,
    object_key: Option<String>,
}

impl AwsUploader {
    /// Builds an uploader from `start` operation options.
    pub fn new(options: &HashMap<String, String>) -> Result<Self, UploadError> {
        let bucket = required(options, AWS_BUCKET)?.to_string();
        let access_key_id = required(options, AWS_ACCESS_KEY_ID)?.to_string();
        let region = required(options, AWS_REGION)?.to_string();
        let secret_access_key = required(options, AWS_SECRET_ACCESS_KEY)?.to_string();

        let session_token = options
            .get(AWS_SESSION_TOKEN)
            .filter(|t| !t.is_empty())
            .cloned();
        let object_key = options
            .get(AWS_OBJECT_KEY)
            .filter(|k| !k.is_empty())
            .cloned();

        Ok(Self {
            region,
            access_key_id,
            secret_access_key,
            session_token,
            bucket,
            object_key,
        })
    }
}

impl Uploader for AwsUploader {
    fn upload(
        &self,
        source: SourceFile,
        use_checksum: bool,
        _progress: ProgressCallback,
        cancel: CancellationToken,
    ) -> UploadFuture<'_> {
        Box::pin(async move {
            let credentials = Credentials::new(
                self.access_key_id.clone(),
                self.secret_access_key.clone(),
                self.session_token.clone(),
                None,
                "uplift-start-options",
            );
            let config = aws_config::defaults(BehaviorVersion::latest())
                .region(Region::new(self.region.clone()))
                .credentials_provider(credentials)
                .load()
                .await;
            let client = aws_sdk_s3::Client::new(&config);

            let key = match &self.object_key {
                Some(key) => key.clone(),
                None => source.base_name(),
            };

            let SourceFile { mut file, .. } = source;
            let content_md5 = if use_checksum {
                let digest = checksum::compute_md5(&mut file).await?;
                Some(checksum::md5_base64(&digest))
            } else {
                None
            };

            let body = ByteStream::read_from()
                .file(file)
                .build()
                .await
                .map_err(|e| UploadError::S3(e.to_string()))?;

            let mut request = client
                .put_object()
                .bucket(&self.bucket)
                .key(&key)
                .body(body);
            if let Some(md5) = content_md5 {
                request = request.content_md5(md5);
            }

            let result = tokio::select! {
                r = request.send() => r,
                _ = cancel.cancelled() => return Err(UploadError::Canceled),
            };
            result.map_err(|e| UploadError::S3(e.to_string()))?;

            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_options() -> HashMap<String, String> {
        [
            ("aws.region", "eu-central-1"),
            ("aws.access.key.id", "AKIA_TEST"),
            ("aws.secret.access.key", "secret"),
            ("aws.s3.bucket", "device-uploads"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn all_credentials_required() {
        for missing in [
            AWS_BUCKET,
            AWS_ACCESS_KEY_ID,
            AWS_REGION,
            AWS_SECRET_ACCESS_KEY,
        ] {
            let mut opts = full_options();
            opts.remove(missing);
            let err = AwsUploader::new(&opts).unwrap_err();
            assert_eq!(
                err.to_string(),
                format!("required parameter '{missing}' missing or empty")
            );
        }
    }

    #[test]
    fn session_token_is_optional() {
        let uploader = AwsUploader::new(&full_options()).unwrap();
        assert!(uploader.session_token.is_none());

        let mut opts = full_options();
        opts.insert("aws.session.token".into(), "token".into());
        let uploader = AwsUploader::new(&opts).unwrap();
        assert_eq!(uploader.session_token.as_deref(), Some("token"));
    }

    #[test]
    fn object_key_defaults_to_base_name() {
        let uploader = AwsUploader::new(&full_options()).unwrap();
        assert!(uploader.object_key.is_none());

        let mut opts = full_options();
        opts.insert("aws.object.key".into(), "devices/gw-01/log.txt".into());
        let uploader = AwsUploader::new(&opts).unwrap();
        assert_eq!(uploader.object_key.as_deref(), Some("devices/gw-01/log.txt"));
    }
}
