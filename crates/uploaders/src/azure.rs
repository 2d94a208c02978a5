//! Azure Blob uploader: a block-blob PUT against a SAS-scoped container URL.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use reqwest::header::CONTENT_LENGTH;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use crate::options::required;
use crate::{checksum, ProgressCallback, SourceFile, UploadError, UploadFuture, Uploader};

/// Option keys recognized by the Azure provider.
pub const AZURE_ENDPOINT: &str = "azure.storage.endpoint";
pub const AZURE_SAS: &str = "azure.shared.access.signature";
pub const AZURE_CONTAINER: &str = "azure.blob.container";

const BLOB_TYPE_HEADER: &str = "x-ms-blob-type";
const BLOB_MD5_HEADER: &str = "x-ms-blob-content-md5";

/// Uploads files as block blobs, authorized by a shared access signature.
#[derive(Debug)]
pub struct AzureUploader {
    endpoint: String,
    sas: String,
    container: String,
    client: reqwest::Client,
}

impl AzureUploader {
    /// Builds an uploader from `start` operation options.
    pub fn new(options: &HashMap<String, String>) -> Result<Self, UploadError> {
        let endpoint = required(options, AZURE_ENDPOINT)?.to_string();
        let sas = required(options, AZURE_SAS)?.to_string();
        let container = required(options, AZURE_CONTAINER)?.to_string();

        Ok(Self {
            endpoint,
            sas,
            container,
            client: reqwest::Client::new(),
        })
    }

    /// Target URL for a blob named after the uploaded file.
    fn blob_url(&self, blob_name: &str) -> String {
        format!(
            "{}{}/{}?{}",
            self.endpoint, self.container, blob_name, self.sas
        )
    }
}

impl Uploader for AzureUploader {
    fn upload(
        &self,
        source: SourceFile,
        use_checksum: bool,
        progress: ProgressCallback,
        cancel: CancellationToken,
    ) -> UploadFuture<'_> {
        Box::pin(async move {
            let url = self.blob_url(&source.base_name());
            let SourceFile { mut file, .. } = source;
            let size = file.metadata().await?.len();

            let mut request = self
                .client
                .put(&url)
                .header(BLOB_TYPE_HEADER, "BlockBlob")
                .header(CONTENT_LENGTH, size);

            if use_checksum {
                // The stored blob property is the raw digest; the wire header
                // carries its base64 form.
                let digest = checksum::compute_md5(&mut file).await?;
                request = request.header(BLOB_MD5_HEADER, checksum::md5_base64(&digest));
            }

            let transferred = Arc::new(AtomicI64::new(0));
            let counter = Arc::clone(&transferred);
            let body = ReaderStream::new(file).map(move |chunk| {
                if let Ok(data) = &chunk {
                    let total =
                        counter.fetch_add(data.len() as i64, Ordering::Relaxed) + data.len() as i64;
                    progress(total);
                }
                chunk
            });

            let response = tokio::select! {
                r = request.body(reqwest::Body::wrap_stream(body)).send() => r?,
                _ = cancel.cancelled() => return Err(UploadError::Canceled),
            };

            let status = response.status();
            if !status.is_success() {
                return Err(UploadError::Status {
                    code: status.as_u16(),
                    status: status.to_string(),
                });
            }

            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn full_options() -> HashMap<String, String> {
        options(&[
            ("azure.storage.endpoint", "https://account.blob.example/"),
            ("azure.shared.access.signature", "sv=2024&sig=abc"),
            ("azure.blob.container", "device-logs"),
        ])
    }

    #[test]
    fn all_parameters_required() {
        for missing in [AZURE_ENDPOINT, AZURE_SAS, AZURE_CONTAINER] {
            let mut opts = full_options();
            opts.remove(missing);
            let err = AzureUploader::new(&opts).unwrap_err();
            assert_eq!(
                err.to_string(),
                format!("required parameter '{missing}' missing or empty")
            );
        }
    }

    #[test]
    fn blob_url_layout() {
        let uploader = AzureUploader::new(&full_options()).unwrap();
        assert_eq!(
            uploader.blob_url("metrics.json"),
            "https://account.blob.example/device-logs/metrics.json?sv=2024&sig=abc"
        );
    }
}
