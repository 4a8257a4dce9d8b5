//! `file:` URI conversions.

use std::path::{Path, PathBuf};

use crate::error::ClientError;

/// Encode an absolute path as a `file://` URI.
pub fn file_path_to_uri(path: &Path) -> Result<String, ClientError> {
    url::Url::from_file_path(path)
        .map(|url| url.to_string())
        .map_err(|()| ClientError::InvalidUri(path.display().to_string()))
}

/// Decode a `file://` URI back into a path.
///
/// Any scheme other than `file`, and anything that does not parse as an
/// absolute URI, is rejected.
pub fn uri_to_file_path(uri: &str) -> Result<PathBuf, ClientError> {
    let parsed =
        url::Url::parse(uri).map_err(|_| ClientError::InvalidUri(uri.to_string()))?;
    if parsed.scheme() != "file" {
        return Err(ClientError::InvalidUri(uri.to_string()));
    }
    parsed
        .to_file_path()
        .map_err(|()| ClientError::InvalidUri(uri.to_string()))
}
