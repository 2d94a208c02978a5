//! MD5 helpers for upload integrity headers.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use md5::Context;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Computes the MD5 digest of `file` from its current position and rewinds
/// the handle to the start so the upload re-reads the full content.
pub async fn compute_md5(file: &mut File) -> std::io::Result<[u8; 16]> {
    let mut context = Context::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        context.consume(&buf[..n]);
    }
    file.seek(std::io::SeekFrom::Start(0)).await?;

    Ok(context.compute().0)
}

/// Base64 form of a digest, as carried by `Content-MD5` headers.
pub fn md5_base64(digest: &[u8; 16]) -> String {
    BASE64.encode(digest)
}
