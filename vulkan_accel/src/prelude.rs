use thiserror::Error;

pub type AccelResult<T> = Result<T, AccelError>;

/// Caller bugs detected before any GPU command is recorded or any device
/// memory is allocated. None of these are recoverable at this layer: the
/// scene setup that triggered them must be fixed, not retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("no geometry inputs were provided")]
    EmptyInputs,

    #[error("geometry input {input} holds no geometry descriptors")]
    EmptyGeometry { input: usize },

    #[error("geometry input {input} declares a build range with zero primitives")]
    ZeroPrimitives { input: usize },

    #[error(
        "geometry input {input} has {geometries} geometry descriptors but {ranges} build ranges"
    )]
    RangeCountMismatch {
        input: usize,
        geometries: usize,
        ranges: usize,
    },

    #[error(
        "compaction must be requested by every input of a build or by none: \
         {requested} of {total} inputs request it"
    )]
    MixedCompaction { requested: usize, total: usize },

    #[error("refit requested on a structure that was not built with the allow-update flag")]
    RefitWithoutAllowUpdate,

    #[error("refit with {actual} instances but the structure was built for {expected}")]
    RefitCountMismatch { expected: u32, actual: u32 },

    #[error("no top-level acceleration structure has been built")]
    TlasNotBuilt,
}

#[derive(Debug, Clone, Error)]
pub enum AccelError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("acceleration structure index {index} is out of range ({len} structures)")]
    OutOfRange { index: usize, len: usize },

    #[error("device resources exhausted: {0}")]
    ResourceExhaustion(String),

    /// A failure reported by the device or the submission facility,
    /// propagated unchanged. No recovery is attempted here.
    #[error("device error ({0}): {msg}", msg = .1.as_deref().unwrap_or("no details"))]
    Device(i32, Option<String>),
}

impl AccelError {
    #[inline]
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}
