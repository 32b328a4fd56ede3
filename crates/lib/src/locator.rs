//! Addresses of command inputs and outputs.
//!
//! A [`Locator`] names either a plain file on disk or a storage URL inside the
//! output directory. Locators are the join key between a command's declared
//! output and other commands' declared inputs, so storage URLs are kept in a
//! canonical form: `textures/stone`, `/textures//stone/` and
//! `/textures/./stone` all name the same output.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Address of a file or of a storage URL.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Locator {
  /// A plain file or directory, used as-is.
  File(PathBuf),
  /// A storage URL, mapped into the output directory.
  Url(StorageUrl),
}

/// A storage URL in canonical form.
///
/// Always starts with `/` and never contains empty, `.` or `..` segments.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorageUrl(String);

impl StorageUrl {
  pub fn new(raw: &str) -> Self {
    let mut canonical = String::with_capacity(raw.len() + 1);
    for segment in raw.split('/').filter(|s| !s.is_empty() && *s != "." && *s != "..") {
      canonical.push('/');
      canonical.push_str(segment);
    }
    if canonical.is_empty() {
      canonical.push('/');
    }
    Self(canonical)
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  pub fn segments(&self) -> impl Iterator<Item = &str> {
    self.0.split('/').filter(|s| !s.is_empty())
  }
}

impl fmt::Display for StorageUrl {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl Locator {
  pub fn file(path: impl Into<PathBuf>) -> Self {
    Locator::File(path.into())
  }

  pub fn url(url: impl AsRef<str>) -> Self {
    Locator::Url(StorageUrl::new(url.as_ref()))
  }

  /// Resolve this locator to a path on disk.
  ///
  /// URLs are placed under `output_dir`; a canonical URL has no `..` segment,
  /// so it can never escape the output directory.
  pub fn resolve(&self, output_dir: &Path) -> PathBuf {
    match self {
      Locator::File(path) => path.clone(),
      Locator::Url(url) => url.segments().fold(output_dir.to_path_buf(), |dir, segment| dir.join(segment)),
    }
  }
}

impl fmt::Display for Locator {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Locator::File(path) => write!(f, "file:{}", path.display()),
      Locator::Url(url) => write!(f, "url:{}", url),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid locator '{0}': expected 'file:<path>' or 'url:<path>'")]
pub struct ParseLocatorError(pub String);

impl FromStr for Locator {
  type Err = ParseLocatorError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    if let Some(path) = s.strip_prefix("file:") {
      Ok(Locator::file(path))
    } else if let Some(url) = s.strip_prefix("url:") {
      Ok(Locator::url(url))
    } else {
      Err(ParseLocatorError(s.to_string()))
    }
  }
}

impl Serialize for Locator {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(self)
  }
}

impl<'de> Deserialize<'de> for Locator {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
  }
}
