//! Generic HTTP uploader: a single PUT or POST with the file as the body.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::Method;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use crate::options::required;
use crate::{
    checksum, extract_dictionary, ProgressCallback, SourceFile, UploadError, UploadFuture,
    Uploader,
};

/// Option keys recognized by the generic HTTP provider.
pub const URL_PROP: &str = "https.url";
pub const METHOD_PROP: &str = "https.method";
pub const HEADERS_PREFIX: &str = "https.header.";

/// `Content-MD5` request header name.
pub const CONTENT_MD5: &str = "Content-MD5";

/// Pushes files to a pre-signed or otherwise prepared HTTP endpoint.
#[derive(Debug)]
pub struct HttpUploader {
    url: String,
    method: Method,
    headers: HashMap<String, String>,
    client: reqwest::Client,
}

impl HttpUploader {
    /// Builds an uploader from `start` operation options.
    ///
    /// `server_cert` optionally points to a PEM certificate added to the
    /// client's trusted roots for validating the storage endpoint.
    pub fn new(
        options: &HashMap<String, String>,
        server_cert: Option<&str>,
    ) -> Result<Self, UploadError> {
        let url = required(options, URL_PROP)?.to_string();

        let method = match options.get(METHOD_PROP) {
            None => Method::PUT,
            Some(m) => match m.to_uppercase().as_str() {
                "PUT" => Method::PUT,
                "POST" => Method::POST,
                other => return Err(UploadError::UnsupportedMethod(other.to_string())),
            },
        };

        let headers = extract_dictionary(options, HEADERS_PREFIX);

        let mut builder = reqwest::Client::builder();
        if let Some(path) = server_cert {
            let pem = std::fs::read(path)?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }

        Ok(Self {
            url,
            method,
            headers,
            client: builder.build()?,
        })
    }
}

impl Uploader for HttpUploader {
    fn upload(
        &self,
        source: SourceFile,
        use_checksum: bool,
        progress: ProgressCallback,
        cancel: CancellationToken,
    ) -> UploadFuture<'_> {
        Box::pin(async move {
            let SourceFile { mut file, .. } = source;
            let size = file.metadata().await?.len();

            let mut request = self
                .client
                .request(self.method.clone(), &self.url)
                .header(CONTENT_TYPE, "application/x-binary")
                .header(CONTENT_LENGTH, size);
            for (name, value) in &self.headers {
                request = request.header(name.as_str(), value.as_str());
            }

            if use_checksum {
                let digest = checksum::compute_md5(&mut file).await?;
                request = request.header(CONTENT_MD5, checksum::md5_base64(&digest));
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
