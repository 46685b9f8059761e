use thiserror::Error;

/// Errors raised by the pyramid access layer when opening or reading slides
#[derive(Debug, Clone, Error)]
pub enum SlideError {
    /// Slide container format is not supported by the accessor
    #[error("Unsupported format: {reason}")]
    UnsupportedFormat { reason: String },

    /// Slide data could not be decoded
    #[error("Corrupt slide data: {detail}")]
    CorruptData { detail: String },

    /// Slide not found by the source
    #[error("Slide not found: {0}")]
    NotFound(String),

    /// I/O error while listing or opening slides
    #[error("I/O error: {0}")]
    Io(String),

    /// Requested pyramid level does not exist
    #[error("Invalid level {level}: slide has {level_count} levels")]
    InvalidLevel { level: usize, level_count: usize },

    /// Requested region exceeds the level bounds
    #[error(
        "Region out of bounds at level {level}: {width}x{height}+{x}+{y} exceeds {level_width}x{level_height}"
    )]
    RegionOutOfBounds {
        level: usize,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        level_width: u32,
        level_height: u32,
    },

    /// Requested channel index does not exist
    #[error("Channel {channel} out of range: slide has {channel_count} channels")]
    ChannelOutOfRange { channel: usize, channel_count: usize },
}

/// Errors raised by the registration pipeline
///
/// Per-pair alignment problems (too few matches, a refinement that fails to
/// improve) are not errors: they degrade to the best available transform and
/// are recorded in the error table. This enum covers structural failures that
/// leave no valid registration to report.
#[derive(Debug, Clone, Error)]
pub enum RegisterError {
    /// A slide failed at the access layer
    #[error("Slide '{slide}': {source}")]
    Slide {
        slide: String,
        #[source]
        source: SlideError,
    },

    /// The slide source failed to enumerate its collection
    #[error("Slide listing failed: {0}")]
    Listing(#[source] SlideError),

    /// No usable reference slide remains (e.g. the designated reference
    /// failed to decode and no replacement could be chosen)
    #[error("No usable reference slide")]
    NoReference,

    /// The candidate edges do not connect every slide to the reference
    #[error("Registration graph is disconnected: unreachable slides {unreachable:?}")]
    GraphDisconnected { unreachable: Vec<String> },

    /// Fewer than two usable slides
    #[error("Need at least 2 usable slides, found {found}")]
    TooFewSlides { found: usize },

    /// Configuration rejected by validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A stage was invoked out of order (e.g. micro refinement before
    /// rigid registration)
    #[error("Registration stage not ready: {0}")]
    StageNotReady(String),

    /// A worker task failed or the runtime rejected it
    #[error("Worker failure: {detail}")]
    Worker { detail: String },

    /// Failed to write a diagnostic artifact
    #[error("Failed to write artifact {path}: {detail}")]
    Artifact { path: String, detail: String },
}

/// Errors raised while warping registered slides to an output
#[derive(Debug, Clone, Error)]
pub enum WarpError {
    /// A slide failed at the access layer
    #[error("Slide '{slide}': {source}")]
    Slide {
        slide: String,
        #[source]
        source: SlideError,
    },

    /// The slide has no transform yet
    #[error("Slide '{slide}' is not registered")]
    NotRegistered { slide: String },

    /// Quality factor outside the valid range
    #[error("Invalid quality {quality}: must be between 1 and 100")]
    InvalidQuality { quality: u8 },

    /// The encoder rejected the output
    #[error("Encoding failure: {detail}")]
    Encoding { detail: String },

    /// Nothing to merge (all channels dropped or no slides selected)
    #[error("Merge produced no channels")]
    NothingToMerge,

    /// A channel rename list does not match the slide's channel count
    #[error("Channel rename for '{slide}' has {given} names, slide has {expected} channels")]
    ChannelMismatch {
        slide: String,
        given: usize,
        expected: usize,
    },

    /// A worker task failed or the runtime rejected it
    #[error("Worker failure: {detail}")]
    Worker { detail: String },

    /// I/O error while writing output
    #[error("I/O error: {0}")]
    Io(String),
}

/// Errors raised when saving or loading a registration snapshot
#[derive(Debug, Clone, Error)]
pub enum SnapshotError {
    /// I/O error while reading or writing the snapshot file
    #[error("I/O error: {0}")]
    Io(String),

    /// Snapshot JSON could not be produced or parsed
    #[error("Snapshot serialization error: {0}")]
    Json(String),

    /// Snapshot was written by an incompatible version of the format
    #[error("Unsupported snapshot version {found}, supported version is {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },

    /// Snapshot references a slide the source cannot open
    #[error("Snapshot slide '{slide}' could not be reopened: {source}")]
    MissingSlide {
        slide: String,
        #[source]
        source: SlideError,
    },
}

impl RegisterError {
    /// Attach a slide identity to a slide-layer error.
    pub fn for_slide(slide: impl Into<String>, source: SlideError) -> Self {
        Self::Slide {
            slide: slide.into(),
            source,
        }
    }
}

impl WarpError {
    /// Attach a slide identity to a slide-layer error.
    pub fn for_slide(slide: impl Into<String>, source: SlideError) -> Self {
        Self::Slide {
            slide: slide.into(),
            source,
        }
    }
}
