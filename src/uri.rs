//! URI resolution for injected file sources.
//!
//! The prepare pipeline accepts `file://` URIs as file-injection sources;
//! other schemes are rejected here so callers get a uniform error instead
//! of a confusing open(2) failure.

use crate::error::{Error, Result};
use std::path::Path;
use tokio::io::AsyncRead;

/// Scheme prefix for local file sources.
const FILE_SCHEME: &str = "file://";

/// Opens the resource named by `uri` for reading.
///
/// Only `file://` URIs are supported. The path component is used verbatim,
/// so `file:///etc/resolv.conf` opens `/etc/resolv.conf`.
pub async fn uri_reader(uri: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
    let Some(path) = uri.strip_prefix(FILE_SCHEME) else {
        return Err(Error::ValidationFailed(format!(
            "unsupported uri scheme: {uri}"
        )));
    };

    let file = tokio::fs::File::open(Path::new(path)).await?;
    Ok(Box::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn reads_file_uri() {
        let dir = std::env::temp_dir();
        let path = dir.join("podvisor-uri-test");
        std::fs::write(&path, b"resolver").unwrap();

        let mut reader = uri_reader(&format!("file://{}", path.display()))
            .await
            .unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"resolver");

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn rejects_unknown_scheme() {
        assert!(uri_reader("http://example.com/x").await.is_err());
    }
}
