//! Slide source abstraction.
//!
//! A [`SlideSource`] knows how to enumerate a collection of slides and open
//! a [`PyramidAccessor`] for each one. The registration engine never touches
//! storage directly; everything flows through this trait so in-memory
//! fixtures and on-disk readers are interchangeable.

use async_trait::async_trait;

use crate::error::SlideError;

use super::PyramidAccessor;

/// Provides pyramid accessors for a collection of slides.
///
/// # Ordering
///
/// `list_slides` must return a deterministic order (implementations sort by
/// identity). Registration treats this order as the acquisition order of an
/// ordered series.
#[async_trait]
pub trait SlideSource: Send + Sync {
    /// The accessor type this source produces.
    type Accessor: PyramidAccessor + Send + Sync + 'static;

    /// List the identities of all slides in this source.
    async fn list_slides(&self) -> Result<Vec<String>, SlideError>;

    /// Open an accessor for one slide.
    ///
    /// # Errors
    ///
    /// Returns [`SlideError::NotFound`] for unknown identities and
    /// [`SlideError::UnsupportedFormat`] / [`SlideError::CorruptData`] when
    /// the container cannot be read.
    async fn open(&self, slide_id: &str) -> Result<Self::Accessor, SlideError>;

    /// Release any per-slide resources held by the source.
    ///
    /// The default implementation does nothing; sources that hold file
    /// handles or decoder state override this.
    async fn close(&self, slide_id: &str) -> Result<(), SlideError> {
        let _ = slide_id;
        Ok(())
    }
}
