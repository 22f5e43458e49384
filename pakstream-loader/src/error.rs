use crate::object_model::ObjectRef;
use pakstream_base::PackageName;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Why a package failed to load. Package-level failures only ever surface
/// through completion callbacks, never as panics out of the scheduler loop.
#[derive(Debug, Error)]
pub enum LoadError {
    /// The package file does not exist. Also returned for names in the
    /// known-missing cache, which short-circuits without touching disk.
    #[error("package file not found for {name} (looked for {path})")]
    FileNotFound { name: PackageName, path: PathBuf },

    /// Format tag or version mismatch, or a header that claims to extend
    /// past the end of the file.
    #[error("malformed header in {name}: {reason}")]
    MalformedHeader { name: PackageName, reason: String },

    /// A symbol that other objects require to be constructible (a class or
    /// superclass) could not be resolved. Ordinary symbols degrade to null
    /// instead of raising this.
    #[error("could not resolve required symbol {symbol} in {name}")]
    SymbolResolutionFailed { name: PackageName, symbol: String },

    /// The object model rejected a payload.
    #[error("failed to deserialize object {object} in {name}")]
    DeserializeFailed {
        name: PackageName,
        object: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A read errored or was torn down mid-flight. Fatal for the task, not
    /// for sibling tasks.
    #[error("i/o failure while loading {name}")]
    Io {
        name: PackageName,
        #[source]
        source: std::io::Error,
    },

    /// A symbol was about to be deserialized while its bytes were not inside
    /// the resident precache range. Indicates a scheduler bug, surfaced as a
    /// task failure.
    #[error(
        "precache miss in {name}: symbol range [{offset}, +{len}) not resident"
    )]
    PrecacheMiss {
        name: PackageName,
        offset: u64,
        len: u64,
    },

    /// The scheduler ran out of runnable work while the package was still in
    /// flight. The dependency arrangement cannot be satisfied, e.g. a payload
    /// ordering the single resident read window cannot serve.
    #[error("load of {name} stalled with no runnable work")]
    Stalled { name: PackageName },
}

/// Delivered to each completion callback, exactly once per request.
#[derive(Clone, Debug)]
pub enum LoadResult {
    /// The package completed; carries the package root object.
    Succeeded(ObjectRef),
    Failed(Arc<LoadError>),
    Canceled,
}

impl LoadResult {
    pub fn is_succeeded(&self) -> bool {
        matches!(self, LoadResult::Succeeded(_))
    }
}
