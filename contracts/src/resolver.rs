//! Contract URI → schema document.

use crate::bundled::bundled_schema;
use crate::error::SchemaError;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Namespace every contract URI lives under.
pub const CONTRACTS_BASE_URI: &str = "https://contracts.logistrack/schemas/";

/// Where a shared contracts checkout is expected, relative to the working directory.
pub const DEFAULT_SHARED_CONTRACTS_DIR: &str = "../logistrack-contracts/schemas";

/// A place schemas are looked up in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SchemaSource {
    /// A directory laid out like the namespace.
    Directory(PathBuf),
    /// Schemas compiled into the binary.
    Bundled,
}

impl fmt::Display for SchemaSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Directory(dir) => write!(f, "{}", dir.display()),
            Self::Bundled => f.write_str("<bundled>"),
        }
    }
}

/// Resolves contract URIs against an ordered list of [`SchemaSource`]s.
///
/// Results are cached per URI for the lifetime of the resolver; failures are
/// not cached.
#[derive(Debug)]
pub struct SchemaResolver {
    sources: Vec<SchemaSource>,
    cache: RwLock<HashMap<String, Arc<Value>>>,
}

impl SchemaResolver {
    /// Builder with the default search order: shared checkout, then bundled.
    #[must_use]
    pub fn builder() -> SchemaResolverBuilder {
        SchemaResolverBuilder::default()
    }

    /// Resolver that only serves the bundled schemas.
    #[must_use]
    pub fn bundled_only() -> Self {
        Self::from_sources(vec![SchemaSource::Bundled])
    }

    /// Resolver over an explicit search order.
    #[must_use]
    pub fn from_sources(sources: Vec<SchemaSource>) -> Self {
        Self {
            sources,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// The search order.
    #[must_use]
    pub fn sources(&self) -> &[SchemaSource] {
        &self.sources
    }

    /// The path of `uri` inside the namespace, without fragment.
    ///
    /// # Errors
    ///
    /// [`SchemaError::NotFound`] (with nothing tried) when `uri` is outside
    /// the namespace or its path escapes it.
    pub fn relative_path(uri: &str) -> Result<&str, SchemaError> {
        let outside = || SchemaError::NotFound {
            uri: uri.to_owned(),
            tried: Vec::new(),
        };
        let relative = uri.strip_prefix(CONTRACTS_BASE_URI).ok_or_else(outside)?;
        let relative = relative.split('#').next().unwrap_or_default();
        let escapes = Path::new(relative)
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if relative.is_empty() || escapes {
            return Err(outside());
        }
        Ok(relative)
    }

    /// Resolve `uri` to its schema document.
    ///
    /// # Errors
    ///
    /// - [`SchemaError::NotFound`]: outside the namespace, or no source has it
    /// - [`SchemaError::InvalidSchema`]: the first source holding it has invalid JSON
    /// - [`SchemaError::Io`]: a file exists but cannot be read
    pub fn resolve(&self, uri: &str) -> Result<Arc<Value>, SchemaError> {
        let relative = Self::relative_path(uri)?;
        let key = format!("{CONTRACTS_BASE_URI}{relative}");

        if let Some(schema) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Ok(Arc::clone(schema));
        }

        let mut tried = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            let Some((location, text)) = Self::load(source, relative)? else {
                tried.push(source.to_string());
                continue;
            };
            let schema: Value = serde_json::from_str(&text).map_err(|e| SchemaError::InvalidSchema {
                location: location.clone(),
                reason: e.to_string(),
            })?;
            debug!(uri = %key, location = %location, "schema resolved");
            let schema = Arc::new(schema);
            self.cache
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(key, Arc::clone(&schema));
            return Ok(schema);
        }

        Err(SchemaError::NotFound { uri: key, tried })
    }

    fn load(source: &SchemaSource, relative: &str) -> Result<Option<(String, String)>, SchemaError> {
        match source {
            SchemaSource::Bundled => Ok(bundled_schema(relative)
                .map(|text| (format!("<bundled>/{relative}"), text.to_owned()))),
            SchemaSource::Directory(dir) => {
                let path = dir.join(relative);
                match std::fs::read_to_string(&path) {
                    Ok(text) => Ok(Some((path.display().to_string(), text))),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
                    Err(e) => Err(SchemaError::Io {
                        location: path.display().to_string(),
                        reason: e.to_string(),
                    }),
                }
            }
        }
    }
}

/// Builder for [`SchemaResolver`].
///
/// Search order: override directory, shared checkout, bundled.
#[derive(Clone, Debug)]
pub struct SchemaResolverBuilder {
    override_dir: Option<PathBuf>,
    shared_dir: Option<PathBuf>,
    bundled: bool,
}

impl Default for SchemaResolverBuilder {
    fn default() -> Self {
        Self {
            override_dir: None,
            shared_dir: Some(PathBuf::from(DEFAULT_SHARED_CONTRACTS_DIR)),
            bundled: true,
        }
    }
}

impl SchemaResolverBuilder {
    /// Operator override directory, searched first.
    #[must_use]
    pub fn override_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.override_dir = Some(dir.into());
        self
    }

    /// Shared contracts checkout, searched second. `None` disables it.
    #[must_use]
    pub fn shared_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.shared_dir = dir;
        self
    }

    /// Do not fall back to the bundled schemas.
    #[must_use]
    pub const fn without_bundled(mut self) -> Self {
        self.bundled = false;
        self
    }

    /// Build the resolver.
    #[must_use]
    pub fn build(self) -> SchemaResolver {
        let sources = self
            .override_dir
            .into_iter()
            .chain(self.shared_dir)
            .map(SchemaSource::Directory)
            .chain(self.bundled.then_some(SchemaSource::Bundled))
            .collect();
        SchemaResolver::from_sources(sources)
    }
}
