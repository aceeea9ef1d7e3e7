use async_trait::async_trait;
use aws_sdk_s3::{
    config::{http::HttpResponse, Credentials, Region},
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    operation::put_object::PutObjectError,
    primitives::ByteStream,
    Client,
};
use bytes::Bytes;
use tracing::{debug, info, instrument};

use super::ObjectBackend;
use crate::config::S3Destination;
use crate::error::{BackendErrorKind, ExtractError, Result};

/// S3 (or any S3-compatible endpoint) bucket
#[derive(Clone)]
pub struct S3Backend {
    client: Client,
    bucket: String,
}

impl S3Backend {
    /// Static keys when configured, otherwise the default AWS provider chain
    pub async fn new(config: &S3Destination) -> Result<Self> {
        let bucket = config.bucket_name().to_string();
        if bucket.is_empty() {
            return Err(ExtractError::Config(format!(
                "invalid S3 bucket '{}'",
                config.bucket
            )));
        }

        let mut builder = match (&config.access_key, &config.secret_key) {
            (Some(access_key), Some(secret_key)) => {
                let credentials = Credentials::new(
                    access_key.expose(),
                    secret_key.expose(),
                    None,
                    None,
                    "pgl-extractor",
                );
                aws_sdk_s3::Config::builder()
                    .behavior_version_latest()
                    .credentials_provider(credentials)
                    .region(Region::new(config.region.clone()))
            },
            _ => {
                let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
                    .region(Region::new(config.region.clone()))
                    .load()
                    .await;
                aws_sdk_s3::config::Builder::from(&shared)
            },
        };

        builder = builder.force_path_style(config.path_style);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(builder.build());
        info!("S3 client initialized for bucket: {}", bucket);

        Ok(Self { client, bucket })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl ObjectBackend for S3Backend {
    fn describe(&self) -> String {
        format!("s3://{}", self.bucket)
    }

    #[instrument(skip(self, data))]
    async fn put(&self, key: &str, data: Bytes) -> Result<String> {
        debug!("Uploading {} bytes to s3://{}/{}", data.len(), self.bucket, key);

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/vnd.apache.parquet")
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| {
                ExtractError::backend(classify(&e), format!("s3 put {}: {}", key, DisplayErrorContext(&e)))
            })?;

        Ok(format!("s3://{}/{}", self.bucket, key))
    }
}

fn classify(err: &SdkError<PutObjectError, HttpResponse>) -> BackendErrorKind {
    match err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) | SdkError::ResponseError(_) => {
            BackendErrorKind::Transient
        },
        SdkError::ServiceError(service) => {
            classify_status(service.raw().status().as_u16(), service.err().code())
        },
        _ => BackendErrorKind::Permanent,
    }
}

pub(crate) fn classify_status(status: u16, code: Option<&str>) -> BackendErrorKind {
    match (status, code) {
        (429, _) | (503, _) | (_, Some("SlowDown")) | (_, Some("RequestLimitExceeded")) => {
            BackendErrorKind::Throttled
        },
        (500..=599, _) | (_, Some("RequestTimeout")) | (_, Some("InternalError")) => BackendErrorKind::Transient,
        _ => BackendErrorKind::Permanent,
    }
}
