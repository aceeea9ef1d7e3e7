use async_trait::async_trait;
use bytes::Bytes;
use object_store::azure::{MicrosoftAzure, MicrosoftAzureBuilder};
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload, RetryConfig};
use tracing::{debug, info, instrument};

use super::ObjectBackend;
use crate::config::AzureDestination;
use crate::error::{BackendErrorKind, ExtractError, Result};

/// Azure Blob Storage container
#[derive(Debug)]
pub struct AzureBlobBackend {
    store: MicrosoftAzure,
    account: String,
    container: String,
}

impl AzureBlobBackend {
    pub fn new(config: &AzureDestination) -> Result<Self> {
        let mut builder = MicrosoftAzureBuilder::new()
            .with_account(&config.account)
            .with_container_name(&config.container)
            .with_use_emulator(config.use_emulator)
            // Retries are owned by the upload dispatcher
            .with_retry(RetryConfig {
                max_retries: 0,
                ..RetryConfig::default()
            });
        if let Some(key) = &config.access_key {
            builder = builder.with_access_key(key.expose());
        }

        let store = builder
            .build()
            .map_err(|e| ExtractError::Config(format!("azure container '{}': {}", config.container, e)))?;

        info!(
            "Azure Blob client initialized for {}/{}",
            config.account, config.container
        );

        Ok(Self {
            store,
            account: config.account.clone(),
            container: config.container.clone(),
        })
    }
}

#[async_trait]
impl ObjectBackend for AzureBlobBackend {
    fn describe(&self) -> String {
        format!("az://{}/{}", self.account, self.container)
    }

    #[instrument(skip(self, data))]
    async fn put(&self, key: &str, data: Bytes) -> Result<String> {
        debug!("Uploading {} bytes to {}/{}", data.len(), self.describe(), key);

        let location = Path::parse(key)
            .map_err(|e| ExtractError::backend(BackendErrorKind::Permanent, format!("invalid key {}: {}", key, e)))?;

        self.store
            .put(&location, PutPayload::from(data))
            .await
            .map_err(|e| ExtractError::backend(classify(&e), format!("azure put {}: {}", key, e)))?;

        Ok(format!("{}/{}", self.describe(), key))
    }
}

fn classify(err: &object_store::Error) -> BackendErrorKind {
    match err {
        object_store::Error::Generic { .. } => classify_message(&err.to_string()),
        object_store::Error::JoinError { .. } => BackendErrorKind::Transient,
        _ => BackendErrorKind::Permanent,
    }
}

/// The Azure client reports HTTP failures as generic errors with the status in the text
///
/// Only a status that follows the word "status" counts, so digits inside a
/// response body (request ids, timestamps) never decide the outcome.
pub(crate) fn classify_message(message: &str) -> BackendErrorKind {
    const THROTTLED: &[&str] = &["ServerBusy", "Too Many Requests", "OperationTimedOut"];
    const TRANSIENT: &[&str] = &[
        "InternalError",
        "timed out",
        "connection",
        "Connection",
        "error sending request",
    ];

    if let Some(status) = status_code(message) {
        return super::s3::classify_status(status, None);
    }
    if THROTTLED.iter().any(|needle| message.contains(needle)) {
        BackendErrorKind::Throttled
    } else if TRANSIENT.iter().any(|needle| message.contains(needle)) {
        BackendErrorKind::Transient
    } else {
        BackendErrorKind::Permanent
    }
}

/// `"... non-2xx status code: 503 Service Unavailable ..."` -> `503`
fn status_code(message: &str) -> Option<u16> {
    message.match_indices("status").find_map(|(at, word)| {
        let rest = &message[at + word.len()..];
        let rest = rest.strip_prefix(" code").unwrap_or(rest);
        let rest = rest.trim_start_matches([':', ' ']);
        let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
        match digits.parse::<u16>() {
            Ok(code) if digits.len() == 3 && (100..=599).contains(&code) => Some(code),
            _ => None,
        }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_message_classification() {
        assert_eq!(
            classify_message("Server returned non-2xx status code: 503 Service Unavailable: ServerBusy"),
            BackendErrorKind::Throttled
        );
        assert_eq!(
            classify_message("Error performing put request: error sending request for url"),
            BackendErrorKind::Transient
        );
        assert_eq!(
            classify_message("Server returned non-2xx status code: 403 Forbidden: AuthenticationFailed"),
            BackendErrorKind::Permanent
        );
        assert_eq!(
            classify_message("Client error with status 429 Too Many Requests: slow down"),
            BackendErrorKind::Throttled
        );
        assert_eq!(
            classify_message("Server returned non-2xx status code: 500 Internal Server Error: "),
            BackendErrorKind::Transient
        );
    }

    #[test]
    fn test_digits_in_body_do_not_make_a_client_error_retryable() {
        let message = "Server returned non-2xx status code: 400 Bad Request: \
            <Error><Code>InvalidBlobOrBlock</Code>\
            <Message>RequestId:5030a429-0001-0050-5002-429500000000 \
            Time:2025-03-01T02:00:00.5034290Z</Message></Error>";
        assert_eq!(classify_message(message), BackendErrorKind::Permanent);

        let message = "Client error with status 404 Not Found: RequestId:9f1d503c Time:12:00:00.4290000Z";
        assert_eq!(classify_message(message), BackendErrorKind::Permanent);
        assert_eq!(status_code(message), Some(404));
    }

    #[test]
    fn test_emulator_backend_builds_without_network() {
        let config = AzureDestination {
            account: "devstoreaccount1".into(),
            container: "pgl".into(),
            access_key: None,
            access_key_env: None,
            use_emulator: true,
        };
        let backend = AzureBlobBackend::new(&config).unwrap();
        assert_eq!(backend.describe(), "az://devstoreaccount1/pgl");
    }
}
