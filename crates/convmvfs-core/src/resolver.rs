//! Mount configuration and virtual-path resolution.
//!
//! The resolver maps every incoming caller path to its storage-side
//! counterpart (transcode, then prefix the configured source root) and maps
//! outgoing names (directory entries, symlink targets) back the other way.
//! Resolution is pure and per-call; the only state is the immutable mount
//! configuration and the transcoder it shares with the rest of the core.

use crate::charset::{Transcoder, lookup_charset};
use encoding_rs::Encoding;
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default source directory: the root of the local filesystem tree.
pub const DEFAULT_SRCDIR: &str = "/";

/// Default charset on both sides of the mount.
pub const DEFAULT_CHARSET: &str = "UTF-8";

/// Errors raised while validating the mount configuration at startup.
///
/// These are the only fatal errors in the system.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The charset label is unknown or has no usable encoder.
    #[error("unsupported charset: {0}")]
    UnsupportedCharset(String),
}

/// Immutable mount configuration, set once at startup.
#[derive(Debug)]
pub struct MountConfig {
    /// Normalized source directory: no trailing separator, no doubled
    /// separators.
    pub srcdir: PathBuf,
    /// Charset of filenames in the source directory (storage side).
    pub icharset: &'static Encoding,
    /// Charset presented on the mounted filesystem (caller side).
    pub ocharset: &'static Encoding,
}

impl MountConfig {
    /// Builds and validates a configuration from raw option values.
    pub fn new(srcdir: &Path, icharset: &str, ocharset: &str) -> Result<Self, ConfigError> {
        let icharset = lookup_charset(icharset)
            .ok_or_else(|| ConfigError::UnsupportedCharset(icharset.to_string()))?;
        let ocharset = lookup_charset(ocharset)
            .ok_or_else(|| ConfigError::UnsupportedCharset(ocharset.to_string()))?;
        Ok(Self {
            srcdir: normalize_srcdir(srcdir),
            icharset,
            ocharset,
        })
    }
}

impl Default for MountConfig {
    fn default() -> Self {
        Self::new(Path::new(DEFAULT_SRCDIR), DEFAULT_CHARSET, DEFAULT_CHARSET)
            .expect("default charsets are valid")
    }
}

/// Strips the trailing separator and collapses doubled separators.
fn normalize_srcdir(srcdir: &Path) -> PathBuf {
    let bytes = srcdir.as_os_str().as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    for &b in bytes {
        if b == b'/' && out.last() == Some(&b'/') {
            continue;
        }
        out.push(b);
    }
    if out.len() > 1 && out.last() == Some(&b'/') {
        out.pop();
    }
    PathBuf::from(OsString::from_vec(out))
}

/// Maps caller paths to storage paths and storage names back to caller
/// names.
#[derive(Debug)]
pub struct PathResolver {
    config: MountConfig,
    transcoder: Transcoder,
}

impl PathResolver {
    /// Creates a resolver, wiring the transcoder to the configured charset
    /// pair.
    pub fn new(config: MountConfig) -> Self {
        let transcoder = Transcoder::new(config.icharset, config.ocharset);
        Self { config, transcoder }
    }

    /// The normalized source directory.
    pub fn srcdir(&self) -> &Path {
        &self.config.srcdir
    }

    /// Resolves an incoming caller path to its storage-side path:
    /// transcoded caller→storage and prefixed with the source root.
    pub fn to_storage(&self, caller_path: &OsStr) -> PathBuf {
        let converted = self.transcoder.caller_to_storage(caller_path);
        let mut bytes = self.config.srcdir.as_os_str().as_bytes().to_vec();
        let mut conv = converted.as_bytes();
        if bytes.last() == Some(&b'/') && conv.starts_with(b"/") {
            conv = &conv[1..];
        } else if !conv.is_empty() && !conv.starts_with(b"/") && bytes.last() != Some(&b'/') {
            bytes.push(b'/');
        }
        bytes.extend_from_slice(conv);
        // The caller root maps to srcdir itself
        if bytes.len() > 1 && bytes.last() == Some(&b'/') {
            bytes.pop();
        }
        PathBuf::from(OsString::from_vec(bytes))
    }

    /// Converts an outgoing storage-side name (directory entry, symlink
    /// target) to the caller encoding.
    pub fn to_caller(&self, storage_name: &OsStr) -> OsString {
        self.transcoder.storage_to_caller(storage_name)
    }

    /// Converts a caller-side name fragment to the storage encoding without
    /// prefixing the source root (symlink targets).
    pub fn fragment_to_storage(&self, caller_name: &OsStr) -> OsString {
        self.transcoder.caller_to_storage(caller_name)
    }
}
