//! Registration orchestration.
//!
//! [`Registrar`] drives the full pipeline over a [`SlideSource`]: scanning
//! the collection, rigid alignment into a shared canvas, non-rigid
//! refinement, and the warp/export surface. It owns the per-slide mutable
//! state (transform, displacement field, stage) and the diagnostic output
//! directory.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                             Registrar                              │
//! │                                                                    │
//! │  scan() ──► register() ──► register_micro() ──► warp_and_save()    │
//! │     │           │                 │                    │           │
//! │     ▼           ▼                 ▼                    ▼           │
//! │ ┌─────────┐ ┌─────────────┐ ┌─────────────┐  ┌──────────────────┐  │
//! │ │ Slide   │ │ features +  │ │  nonrigid   │  │ warp tiles into  │  │
//! │ │ Source  │ │ rigid/graph │ │  refiners   │  │ SlideEncoder     │  │
//! │ └─────────┘ └─────────────┘ └─────────────┘  └──────────────────┘  │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Stages are strictly ordered and gated: calling one before its
//! predecessor has run fails with [`RegisterError::StageNotReady`]. A
//! completed stage leaves valid state behind, so a snapshot can be taken
//! after any stage and warping can resume from it on other hardware.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::RegistrarConfig;
use crate::diagnostics::{
    draw_deformation_mesh, draw_match_overlay, measure_pair, overlay_images, save_gray_png,
    save_rgb_png, ArtifactLayout, ErrorTable, PairMeasurement,
};
use crate::error::{RegisterError, SlideError, SnapshotError, WarpError};
use crate::features::{extract_features, FeatureSet};
use crate::graph::{PairEdge, RegistrationGraph};
use crate::nonrigid::{
    warp_working, AlignedPair, FlowRefiner, MicroFeatureRefiner, NonRigidRefiner,
};
use crate::raster::{LuminancePreprocessor, Preprocessor, WorkingImage};
use crate::rigid::{align_pair, compose_into_canvas, pair_seed, PairAlignment};
use crate::slide::{
    validate_levels, CachedAccessor, PhysicalPixelSize, PyramidAccessor, RegionCache,
    RegistrationState, Slide, SlideSource,
};
use crate::snapshot::{
    CanvasSnapshot, FieldSnapshot, SlideSnapshot, Snapshot, TransformSnapshot, SNAPSHOT_VERSION,
};
use crate::transform::{CanvasInfo, DisplacementField, RigidTransform};
use crate::warp::{
    warp_and_merge, warp_slide, Compression, MergeChannel, MergePlan, OutputMetadata, SlideEncoder,
    SlidePlacement, TileSink, WarpOptions, WarpStats,
};

/// Grid spacing of the deformation mesh thumbnails, in thumbnail pixels.
const MESH_SPACING: u32 = 24;

// =============================================================================
// Results
// =============================================================================

/// What one `register()` run produced.
#[derive(Debug, Clone)]
pub struct RegistrationResult {
    /// Identity of the reference slide everything is aligned to
    pub reference: String,

    /// Shared canvas geometry at the working scale
    pub canvas: CanvasInfo,

    /// Fraction of full resolution the transforms were estimated at
    pub working_scale: f64,

    /// Slides dropped because they could not be read
    pub skipped: Vec<String>,

    /// Slides placed with an inherited transform because their pair
    /// produced no trusted similarity
    pub low_confidence: Vec<String>,

    /// Slides whose non-rigid refinement diverged and was discarded
    pub non_rigid_fallbacks: Vec<String>,

    /// Per-pair alignment error through every stage
    pub errors: ErrorTable,
}

/// What one `register_micro()` run produced.
#[derive(Debug, Clone)]
pub struct MicroResult {
    /// Fraction of full resolution the refinement ran at
    pub scale: f64,

    /// Slides whose field was replaced by the micro pass
    pub refined: Vec<String>,

    /// Slides that kept their previous field
    pub fallbacks: Vec<String>,

    /// Error table re-measured with the refined fields
    pub errors: ErrorTable,
}

/// What one merged warp produced.
#[derive(Debug, Clone)]
pub struct MergeOutput {
    /// Channels in output order with their originating slides
    pub channels: Vec<MergeChannel>,

    /// Metadata the sink was opened with
    pub metadata: OutputMetadata,

    /// Tile statistics of the merged warp
    pub stats: WarpStats,
}

/// Per-stage outcome of one refinement pass.
struct RefineOutcome {
    refined: Vec<String>,
    fallbacks: Vec<String>,
}

// =============================================================================
// Slide Entries
// =============================================================================

/// One scanned slide with its mutable registration state.
///
/// The immutable metadata lives in [`Slide`]; everything a stage computes
/// (transform, field, flags, working image) lives here and is replaced
/// wholesale by the owning stage.
struct SlideEntry<A> {
    accessor: Arc<A>,
    slide: Slide,
    state: RegistrationState,
    rigid: RigidTransform,
    field: Option<DisplacementField>,
    low_confidence: bool,
    non_rigid_fallback: bool,
    working: Option<Arc<WorkingImage>>,
}

// =============================================================================
// Registrar
// =============================================================================

/// Orchestrates registration of one slide series.
///
/// The registrar holds the slide table and walks it through the stage
/// machine `Unregistered → RigidAligned → NonRigidRefined → MicroRefined`.
/// Pixel output goes through an external [`SlideEncoder`]; diagnostics go
/// into the destination directory passed at construction.
///
/// # Type Parameters
///
/// * `S` - The slide source the series is read from
///
/// # Example
///
/// ```ignore
/// use wsi_registrar::{Registrar, RegistrarConfig};
///
/// let mut registrar = Registrar::new(source, "out/series", RegistrarConfig::default())?;
/// registrar.scan().await?;
/// let result = registrar.register().await?;
/// println!("max rigid error: {:.2}", result.errors.max_rigid_d());
/// ```
pub struct Registrar<S: SlideSource> {
    /// Where slides are listed and opened
    source: S,

    /// Diagnostic output directory layout
    layout: ArtifactLayout,

    config: RegistrarConfig,

    /// Normalization applied to every decoded working image
    preprocessor: Arc<dyn Preprocessor>,

    /// Decoded-region cache shared by every accessor in the table
    region_cache: Arc<RegionCache>,

    /// Slide table in scan order; indices are stable within a run
    entries: Vec<SlideEntry<CachedAccessor<S::Accessor>>>,

    /// Identities dropped at scan or decode time
    skipped: Vec<String>,

    /// Shared estimation scale, set by `register()`
    working_scale: f64,

    canvas: Option<CanvasInfo>,
    reference_index: Option<usize>,
    graph: Option<RegistrationGraph>,

    /// Pairwise alignments keyed by `(a, b)` slide indices
    pairs: HashMap<(usize, usize), PairAlignment>,

    /// Error table of the most recent stage
    errors: ErrorTable,
}

impl<S: SlideSource> std::fmt::Debug for Registrar<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registrar")
            .field("config", &self.config)
            .field("canvas", &self.canvas)
            .field("reference_index", &self.reference_index)
            .finish_non_exhaustive()
    }
}

impl<S: SlideSource> Registrar<S> {
    /// Create a registrar over `source`, writing diagnostics under
    /// `dst_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`RegisterError::InvalidConfig`] when the configuration
    /// fails validation.
    pub fn new(
        source: S,
        dst_dir: impl Into<PathBuf>,
        config: RegistrarConfig,
    ) -> Result<Self, RegisterError> {
        config.validate().map_err(RegisterError::InvalidConfig)?;
        let region_cache = Arc::new(RegionCache::with_capacity(config.region_cache_bytes));
        Ok(Self {
            source,
            layout: ArtifactLayout::new(dst_dir),
            config,
            preprocessor: Arc::new(LuminancePreprocessor::default()),
            region_cache,
            entries: Vec::new(),
            skipped: Vec::new(),
            working_scale: 1.0,
            canvas: None,
            reference_index: None,
            graph: None,
            pairs: HashMap::new(),
            errors: ErrorTable::default(),
        })
    }

    /// Replace the default [`LuminancePreprocessor`].
    pub fn with_preprocessor(mut self, preprocessor: Arc<dyn Preprocessor>) -> Self {
        self.preprocessor = preprocessor;
        self
    }

    pub fn config(&self) -> &RegistrarConfig {
        &self.config
    }

    /// Canvas shared by all registered slides, once composed.
    pub fn canvas(&self) -> Option<CanvasInfo> {
        self.canvas
    }

    /// Shared estimation scale of the current run.
    pub fn working_scale(&self) -> f64 {
        self.working_scale
    }

    /// Metadata of every slide in the table, in scan order.
    pub fn slides(&self) -> impl Iterator<Item = &Slide> {
        self.entries.iter().map(|e| &e.slide)
    }

    /// Registration stage of one slide.
    pub fn slide_state(&self, slide: &str) -> Option<RegistrationState> {
        self.index_of(slide).map(|i| self.entries[i].state)
    }

    /// Identity of the reference slide, once chosen.
    pub fn reference(&self) -> Option<&str> {
        self.reference_index
            .map(|i| self.entries[i].slide.identity.as_str())
    }

    /// Identities dropped from the run so far.
    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }

    /// Error table of the most recent registration stage.
    pub fn error_table(&self) -> &ErrorTable {
        &self.errors
    }

    /// Root of the diagnostic output tree.
    pub fn artifact_root(&self) -> &Path {
        self.layout.root()
    }

    fn index_of(&self, slide: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.slide.identity == slide)
    }

    // =========================================================================
    // Scanning
    // =========================================================================

    /// Enumerate the source and open an accessor per slide.
    ///
    /// Slides that fail to open or carry an invalid pyramid are dropped
    /// with a warning; the scan only fails when the source cannot be
    /// listed or fewer than two usable slides remain.
    ///
    /// # Errors
    ///
    /// Returns [`RegisterError::Listing`] when the source cannot be
    /// enumerated and [`RegisterError::TooFewSlides`] when fewer than two
    /// slides survive.
    pub async fn scan(&mut self) -> Result<usize, RegisterError> {
        let ids = self
            .source
            .list_slides()
            .await
            .map_err(RegisterError::Listing)?;
        info!(count = ids.len(), "scanning slide source");

        self.entries.clear();
        self.skipped.clear();
        self.pairs.clear();
        self.graph = None;
        self.canvas = None;
        self.reference_index = None;
        self.errors = ErrorTable::default();
        self.working_scale = 1.0;
        // A rescan may reopen changed slides under the same identity.
        self.region_cache.clear().await;

        for id in ids {
            let accessor = match self.source.open(&id).await {
                Ok(accessor) => accessor,
                Err(e) => {
                    warn!(slide = %id, error = %e, "dropping unreadable slide");
                    self.skipped.push(id);
                    continue;
                }
            };
            if let Err(e) = validate_levels(accessor.levels()) {
                warn!(slide = %id, error = %e, "dropping slide with an invalid pyramid");
                self.skipped.push(id);
                continue;
            }
            let slide = Slide::from_accessor(&accessor);
            let (width, height) = slide.dimensions();
            debug!(
                slide = %slide.identity,
                width,
                height,
                channels = slide.channel_count(),
                "opened slide"
            );
            self.entries.push(SlideEntry {
                accessor: Arc::new(CachedAccessor::new(
                    accessor,
                    Arc::clone(&self.region_cache),
                )),
                slide,
                state: RegistrationState::Unregistered,
                rigid: RigidTransform::identity(1.0),
                field: None,
                low_confidence: false,
                non_rigid_fallback: false,
                working: None,
            });
        }

        if self.entries.len() < 2 {
            return Err(RegisterError::TooFewSlides {
                found: self.entries.len(),
            });
        }
        Ok(self.entries.len())
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Run rigid alignment and non-rigid refinement over the scanned set.
    ///
    /// All slides are processed at one shared working scale so pairwise
    /// similarities rescale exactly. Unordered sets go through a full
    /// pairwise match search reduced to a maximum-quality spanning tree;
    /// ordered sets align consecutive pairs along an acquisition chain.
    /// Composition places every slide in a common non-negative canvas, and
    /// dense flow refinement then walks the tree from the reference
    /// outward. Diagnostics and a snapshot are written to the destination
    /// directory before returning.
    ///
    /// Degradations are not errors: undecodable slides are dropped,
    /// untrusted pairs inherit their parent's placement with a
    /// low-confidence flag, and a diverging refinement keeps the rigid
    /// transform with a fallback flag. All three are reported in the
    /// result.
    ///
    /// # Errors
    ///
    /// Fails when no slides are scanned, fewer than two survive decoding,
    /// the candidate graph is disconnected, the designated reference is
    /// unusable, or a worker task dies.
    pub async fn register(&mut self) -> Result<RegistrationResult, RegisterError> {
        if self.entries.is_empty() {
            return Err(RegisterError::StageNotReady(
                "no slides scanned; call scan() first".to_string(),
            ));
        }

        // One shared working scale keeps all pairwise estimates in the
        // same coordinate system, so rescaling only touches translations.
        let mut scale = 1.0f64;
        for entry in &self.entries {
            let (w, h) = entry.slide.dimensions();
            scale = scale.min(self.config.max_processed_dim as f64 / w.max(h).max(1) as f64);
        }
        let scale = scale.min(1.0);
        self.working_scale = scale;
        info!(slides = self.entries.len(), scale, "preparing working images");

        let semaphore = Arc::new(Semaphore::new(self.config.worker_count.max(1)));
        let mut prepare_tasks = Vec::with_capacity(self.entries.len());
        for (i, entry) in self.entries.iter().enumerate() {
            let accessor = Arc::clone(&entry.accessor);
            let preprocessor = Arc::clone(&self.preprocessor);
            let semaphore = Arc::clone(&semaphore);
            let max_features = self.config.max_features;
            prepare_tasks.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| RegisterError::Worker {
                        detail: e.to_string(),
                    })?;
                let region = match accessor.read_scaled(scale).await {
                    Ok(region) => region,
                    Err(e) => return Ok((i, Err(e))),
                };
                let out = tokio::task::spawn_blocking(move || {
                    let image = preprocessor.process(&region);
                    let features = extract_features(&image, max_features);
                    (image, features)
                })
                .await
                .map_err(|e| RegisterError::Worker {
                    detail: e.to_string(),
                })?;
                Ok((i, Ok(out)))
            }));
        }

        let mut prepared: Vec<Option<(WorkingImage, FeatureSet)>> =
            (0..self.entries.len()).map(|_| None).collect();
        for task in prepare_tasks {
            let (i, outcome) = task.await.map_err(|e| RegisterError::Worker {
                detail: e.to_string(),
            })??;
            match outcome {
                Ok(pair) => prepared[i] = Some(pair),
                Err(e) => {
                    warn!(
                        slide = %self.entries[i].slide.identity,
                        error = %e,
                        "dropping slide that failed to decode"
                    );
                }
            }
        }

        // Compact the table: undecodable slides leave the run here.
        let previous = std::mem::take(&mut self.entries);
        let mut features: Vec<Arc<FeatureSet>> = Vec::new();
        let mut working_dims: Vec<(u32, u32)> = Vec::new();
        for (mut entry, slot) in previous.into_iter().zip(prepared) {
            match slot {
                Some((image, feats)) => {
                    debug!(
                        slide = %entry.slide.identity,
                        keypoints = feats.keypoints.len(),
                        "extracted features"
                    );
                    working_dims.push((image.width(), image.height()));
                    entry.working = Some(Arc::new(image));
                    entry.state = RegistrationState::Unregistered;
                    entry.field = None;
                    entry.low_confidence = false;
                    entry.non_rigid_fallback = false;
                    features.push(Arc::new(feats));
                    self.entries.push(entry);
                }
                None => self.skipped.push(entry.slide.identity),
            }
        }
        let n = self.entries.len();
        if n < 2 {
            return Err(RegisterError::TooFewSlides { found: n });
        }

        let reference = match &self.config.reference {
            Some(name) => match self.index_of(name) {
                Some(i) => Some(i),
                None if self.skipped.iter().any(|s| s == name) => {
                    return Err(RegisterError::NoReference)
                }
                None => {
                    return Err(RegisterError::InvalidConfig(format!(
                        "reference slide '{name}' is not in the scanned set"
                    )))
                }
            },
            None => None,
        };

        // Pairwise alignment, parallel under the worker semaphore.
        let candidates: Vec<(usize, usize)> = if self.config.ordered {
            (0..n - 1).map(|i| (i, i + 1)).collect()
        } else {
            let mut all = Vec::with_capacity(n * (n - 1) / 2);
            for a in 0..n {
                for b in (a + 1)..n {
                    all.push((a, b));
                }
            }
            all
        };
        info!(
            pairs = candidates.len(),
            ordered = self.config.ordered,
            "aligning candidate pairs"
        );

        let mut align_tasks = Vec::with_capacity(candidates.len());
        for (a, b) in candidates {
            let features_a = Arc::clone(&features[a]);
            let features_b = Arc::clone(&features[b]);
            let config = self.config.clone();
            let semaphore = Arc::clone(&semaphore);
            let seed = pair_seed(self.config.seed, a, b);
            align_tasks.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| RegisterError::Worker {
                        detail: e.to_string(),
                    })?;
                tokio::task::spawn_blocking(move || {
                    align_pair(a, b, &features_a, &features_b, &config, seed)
                })
                .await
                .map_err(|e| RegisterError::Worker {
                    detail: e.to_string(),
                })
            }));
        }
        self.pairs.clear();
        for task in align_tasks {
            let pair = task.await.map_err(|e| RegisterError::Worker {
                detail: e.to_string(),
            })??;
            debug!(
                a = %self.entries[pair.a].slide.identity,
                b = %self.entries[pair.b].slide.identity,
                matches = pair.match_count,
                inliers = pair.inlier_count,
                "aligned pair"
            );
            self.pairs.insert((pair.a, pair.b), pair);
        }

        // Reduce candidates to the registration tree.
        let graph = if self.config.ordered {
            RegistrationGraph::chain(n, reference)
        } else {
            let edges: Vec<PairEdge> = self
                .pairs
                .values()
                .filter(|p| p.transform.is_some())
                .map(|p| PairEdge::new(p.a, p.b, p.quality()))
                .collect();
            RegistrationGraph::spanning_tree(n, &edges, reference).map_err(|d| {
                RegisterError::GraphDisconnected {
                    unreachable: d
                        .unreachable
                        .iter()
                        .map(|&i| self.entries[i].slide.identity.clone())
                        .collect(),
                }
            })?
        };
        let reference_index = graph.reference();

        let composed = compose_into_canvas(&graph, &self.pairs, &working_dims, scale);
        info!(
            canvas_width = composed.canvas.width,
            canvas_height = composed.canvas.height,
            reference = %self.entries[reference_index].slide.identity,
            "rigid composition complete"
        );
        for (entry, (transform, low)) in self.entries.iter_mut().zip(
            composed
                .transforms
                .into_iter()
                .zip(composed.low_confidence),
        ) {
            entry.rigid = transform;
            entry.low_confidence = low;
            entry.state = RegistrationState::RigidAligned;
        }
        self.canvas = Some(composed.canvas);
        self.reference_index = Some(reference_index);
        self.graph = Some(graph);

        // Non-rigid refinement over canvas-frame images.
        let (full_w, full_h) = composed.canvas.full_dimensions();
        let non_rigid_scale =
            (self.config.max_non_rigid_dim as f64 / full_w.max(full_h).max(1) as f64).min(1.0);
        let refiner: Arc<dyn NonRigidRefiner> = Arc::new(FlowRefiner::from_config(&self.config));
        info!(scale = non_rigid_scale, "non-rigid refinement");
        self.run_refinement(
            refiner,
            non_rigid_scale,
            false,
            RegistrationState::NonRigidRefined,
        )
        .await?;

        let errors = self.build_error_table()?;
        self.errors = errors.clone();
        self.write_registration_artifacts(&errors)?;

        Ok(RegistrationResult {
            reference: self.entries[reference_index].slide.identity.clone(),
            canvas: composed.canvas,
            working_scale: scale,
            skipped: self.skipped.clone(),
            low_confidence: self.flagged(|e| e.low_confidence),
            non_rigid_fallbacks: self.flagged(|e| e.non_rigid_fallback),
            errors,
        })
    }

    fn flagged(
        &self,
        predicate: impl Fn(&SlideEntry<CachedAccessor<S::Accessor>>) -> bool,
    ) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| predicate(e))
            .map(|e| e.slide.identity.clone())
            .collect()
    }

    // =========================================================================
    // Micro Refinement
    // =========================================================================

    /// Re-run non-rigid refinement at a higher resolution.
    ///
    /// Each slide is re-read at the micro scale and refined with the
    /// feature-based micro refiner, seeded by its upscaled prior field;
    /// the prior and the residual compose into the replacement field.
    /// Memory grows with the square of the target dimension, since the
    /// canvas-frame images are materialized at that scale.
    ///
    /// # Arguments
    ///
    /// * `max_dim` - Cap on the canvas long edge in pixels. `None` uses
    ///   `micro_fraction` of full resolution.
    ///
    /// # Errors
    ///
    /// Returns [`RegisterError::StageNotReady`] unless every slide has
    /// been through non-rigid refinement.
    pub async fn register_micro(
        &mut self,
        max_dim: Option<u32>,
    ) -> Result<MicroResult, RegisterError> {
        let refiner: Arc<dyn NonRigidRefiner> =
            Arc::new(MicroFeatureRefiner::from_config(&self.config));
        self.register_micro_with(refiner, max_dim).await
    }

    /// Micro refinement with a caller-supplied strategy.
    ///
    /// The refiner sees the same contract as the shipped strategies: a
    /// pre-warped canvas-frame pair whose residual motion it estimates.
    /// Swapping strategies changes no other stage.
    ///
    /// # Errors
    ///
    /// Same as [`Registrar::register_micro`].
    pub async fn register_micro_with(
        &mut self,
        refiner: Arc<dyn NonRigidRefiner>,
        max_dim: Option<u32>,
    ) -> Result<MicroResult, RegisterError> {
        if self.entries.is_empty()
            || self
                .entries
                .iter()
                .any(|e| e.state < RegistrationState::NonRigidRefined)
        {
            return Err(RegisterError::StageNotReady(
                "non-rigid registration has not run; call register() first".to_string(),
            ));
        }
        let canvas = self.require_canvas()?;
        let (full_w, full_h) = canvas.full_dimensions();
        let long_edge = full_w.max(full_h).max(1) as f64;
        let scale = match max_dim {
            Some(dim) => (dim as f64 / long_edge).min(1.0),
            None => self.config.micro_fraction.min(1.0),
        };
        if !(scale > 0.0) {
            return Err(RegisterError::InvalidConfig(
                "micro refinement scale must be positive".to_string(),
            ));
        }
        info!(scale, "micro refinement");

        let outcome = self
            .run_refinement(refiner, scale, true, RegistrationState::MicroRefined)
            .await?;

        let errors = self.build_error_table()?;
        self.errors = errors.clone();
        self.write_registration_artifacts(&errors)?;

        Ok(MicroResult {
            scale,
            refined: outcome.refined,
            fallbacks: outcome.fallbacks,
            errors,
        })
    }

    // =========================================================================
    // Non-Rigid Driver
    // =========================================================================

    /// Walk the tree from the reference outward and refine each slide
    /// against its parent's refined canvas image.
    ///
    /// The moving image is pre-warped by the slide's prior field, so the
    /// refiner always solves a residual; a diverging refinement keeps the
    /// prior alignment.
    async fn run_refinement(
        &mut self,
        refiner: Arc<dyn NonRigidRefiner>,
        target_scale: f64,
        reread: bool,
        stage: RegistrationState,
    ) -> Result<RefineOutcome, RegisterError> {
        let canvas = self.require_canvas()?;
        let (order, parent_of, reference) = {
            let graph = self.graph.as_ref().ok_or_else(|| {
                RegisterError::StageNotReady(
                    "the registration graph is not available; call register() first".to_string(),
                )
            })?;
            let parents: Vec<Option<usize>> =
                (0..self.entries.len()).map(|i| graph.parent(i)).collect();
            (graph.compose_order().to_vec(), parents, graph.reference())
        };
        let (canvas_w, canvas_h) = canvas.dimensions_at(target_scale);
        debug!(
            scale = target_scale,
            width = canvas_w,
            height = canvas_h,
            "projecting slides onto the canvas grid"
        );

        let sources = self.canvas_images(canvas, target_scale, reread).await?;
        let mut refined_images: Vec<Option<Arc<WorkingImage>>> =
            (0..self.entries.len()).map(|_| None).collect();
        let mut outcome = RefineOutcome {
            refined: Vec::new(),
            fallbacks: Vec::new(),
        };

        for node in order {
            let identity = self.entries[node].slide.identity.clone();
            let Some(source) = sources[node].clone() else {
                // Re-read failed for this slide; its prior field stays.
                outcome.fallbacks.push(identity);
                continue;
            };

            if node == reference {
                refined_images[node] = Some(source);
                self.entries[node].state = stage;
                outcome.refined.push(identity);
                continue;
            }
            let Some(parent) = parent_of[node] else {
                continue;
            };
            let Some(fixed) = refined_images[parent].clone() else {
                // Parent fell out of this pass; refining against a stale
                // image would chase the wrong target.
                outcome.fallbacks.push(identity);
                continue;
            };

            // Pre-warp by the prior field so the refiner solves a residual.
            let prior_on_grid = self.entries[node]
                .field
                .as_ref()
                .map(|f| f.resampled_to(canvas_w, canvas_h, target_scale));
            let moving = match &prior_on_grid {
                Some(field) => Arc::new(warp_working(&source, field)),
                None => Arc::clone(&source),
            };

            let pair = AlignedPair {
                fixed,
                moving: Arc::clone(&moving),
                scale: target_scale,
            };
            let refiner = Arc::clone(&refiner);
            let refinement = tokio::task::spawn_blocking(move || refiner.refine(&pair))
                .await
                .map_err(|e| RegisterError::Worker {
                    detail: e.to_string(),
                })?;

            if refinement.diverged() {
                debug!(
                    slide = %identity,
                    before = refinement.residual_before,
                    after = refinement.residual_after,
                    "refinement diverged, keeping prior alignment"
                );
                refined_images[node] = Some(moving);
                if prior_on_grid.is_none() {
                    self.entries[node].non_rigid_fallback = true;
                    self.entries[node].state =
                        self.entries[node].state.max(RegistrationState::NonRigidRefined);
                }
                outcome.fallbacks.push(identity);
                continue;
            }

            let total = match prior_on_grid {
                Some(prior) => prior.compose(&refinement.field),
                None => refinement.field,
            };
            debug!(
                slide = %identity,
                before = refinement.residual_before,
                after = refinement.residual_after,
                mean_displacement = total.mean_magnitude(),
                "refined"
            );
            refined_images[node] = Some(Arc::new(warp_working(&source, &total)));
            self.entries[node].field = Some(total);
            self.entries[node].non_rigid_fallback = false;
            self.entries[node].state = stage;
            outcome.refined.push(identity);
        }
        Ok(outcome)
    }

    /// Canvas-frame image per slide at `target_scale`.
    ///
    /// With `reread` the slide is decoded again at the target scale
    /// (micro pass); otherwise the stored working image is reprojected.
    /// A failed re-read yields `None` for that slide instead of failing
    /// the pass.
    async fn canvas_images(
        &self,
        canvas: CanvasInfo,
        target_scale: f64,
        reread: bool,
    ) -> Result<Vec<Option<Arc<WorkingImage>>>, RegisterError> {
        let semaphore = Arc::new(Semaphore::new(self.config.worker_count.max(1)));
        let mut tasks = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            let accessor = reread.then(|| Arc::clone(&entry.accessor));
            let working = entry.working.clone();
            let preprocessor = Arc::clone(&self.preprocessor);
            let rigid = entry.rigid;
            let working_scale = self.working_scale;
            let identity = entry.slide.identity.clone();
            let semaphore = Arc::clone(&semaphore);
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| RegisterError::Worker {
                        detail: e.to_string(),
                    })?;

                let (source, source_scale) = match accessor {
                    Some(accessor) => match accessor.read_scaled(target_scale).await {
                        Ok(region) => {
                            let image =
                                tokio::task::spawn_blocking(move || preprocessor.process(&region))
                                    .await
                                    .map_err(|e| RegisterError::Worker {
                                        detail: e.to_string(),
                                    })?;
                            (Arc::new(image), target_scale)
                        }
                        Err(e) => {
                            warn!(slide = %identity, error = %e, "re-read failed, keeping the prior field");
                            return Ok(None);
                        }
                    },
                    None => match working {
                        Some(image) => (image, working_scale),
                        None => {
                            return Err(RegisterError::StageNotReady(
                                "working images are not available; call register() first"
                                    .to_string(),
                            ))
                        }
                    },
                };

                let projected = tokio::task::spawn_blocking(move || {
                    project_to_canvas(&source, source_scale, &rigid, canvas, target_scale)
                })
                .await
                .map_err(|e| RegisterError::Worker {
                    detail: e.to_string(),
                })??;
                Ok(Some(Arc::new(projected)))
            }));
        }

        let mut out = Vec::with_capacity(tasks.len());
        for task in tasks {
            out.push(task.await.map_err(|e| RegisterError::Worker {
                detail: e.to_string(),
            })??);
        }
        Ok(out)
    }

    fn require_canvas(&self) -> Result<CanvasInfo, RegisterError> {
        self.canvas.ok_or_else(|| {
            RegisterError::StageNotReady(
                "slides are not composed into a canvas yet; call register() first".to_string(),
            )
        })
    }

    // =========================================================================
    // Error Table
    // =========================================================================

    /// Measure every tree edge through the current transform chain.
    fn build_error_table(&self) -> Result<ErrorTable, RegisterError> {
        let graph = self.graph.as_ref().ok_or_else(|| {
            RegisterError::StageNotReady(
                "the registration graph is not available; call register() first".to_string(),
            )
        })?;
        let mut rows = Vec::new();
        for (child, parent) in graph.tree_edges() {
            let (points_from, points_to) = match (
                self.pairs.get(&(parent, child)),
                self.pairs.get(&(child, parent)),
            ) {
                (Some(pair), _) => (&pair.points_a, &pair.points_b),
                (None, Some(pair)) => (&pair.points_b, &pair.points_a),
                (None, None) => continue,
            };
            let placement_from = self.placement_of(parent)?;
            let placement_to = self.placement_of(child)?;
            let child_entry = &self.entries[child];
            let (width, height) = child_entry.slide.dimensions();
            rows.push(measure_pair(&PairMeasurement {
                from: &self.entries[parent].slide.identity,
                to: &child_entry.slide.identity,
                points_from,
                points_to,
                placement_from: &placement_from,
                placement_to: &placement_to,
                working_scale: self.working_scale,
                pixel_size: child_entry.slide.pixel_size.as_ref(),
                full_dims: (width as u64, height as u64),
                low_confidence: child_entry.low_confidence,
                non_rigid_fallback: child_entry.non_rigid_fallback,
            }));
        }
        Ok(ErrorTable::new(rows))
    }

    // =========================================================================
    // Placements & Points
    // =========================================================================

    fn placement_of(&self, index: usize) -> Result<SlidePlacement, RegisterError> {
        let canvas = self.require_canvas()?;
        let entry = &self.entries[index];
        if entry.state == RegistrationState::Unregistered {
            return Err(RegisterError::StageNotReady(format!(
                "slide '{}' has no transform yet",
                entry.slide.identity
            )));
        }
        Ok(SlidePlacement {
            rigid: entry.rigid,
            field: entry.field.clone(),
            canvas,
            source_dims: entry.slide.dimensions(),
        })
    }

    /// Map a full-resolution slide point into the registered frame.
    ///
    /// # Errors
    ///
    /// Fails for an unknown identity or before registration.
    pub fn warp_point(&self, slide: &str, x: f64, y: f64) -> Result<(f64, f64), RegisterError> {
        let index = self.index_of(slide).ok_or_else(|| {
            RegisterError::for_slide(slide, SlideError::NotFound(slide.to_string()))
        })?;
        let placement = self.placement_of(index)?;
        Ok(placement.registered_point(x, y))
    }

    /// Map a registered-frame point back to full-resolution slide
    /// coordinates.
    ///
    /// # Errors
    ///
    /// Fails for an unknown identity, before registration, or when the
    /// slide's rigid transform is degenerate.
    pub fn invert_point(&self, slide: &str, x: f64, y: f64) -> Result<(f64, f64), RegisterError> {
        let index = self.index_of(slide).ok_or_else(|| {
            RegisterError::for_slide(slide, SlideError::NotFound(slide.to_string()))
        })?;
        let placement = self.placement_of(index)?;
        placement
            .source_point(x, y)
            .ok_or_else(|| RegisterError::Worker {
                detail: format!("rigid transform of '{slide}' is not invertible"),
            })
    }

    // =========================================================================
    // Warp Surface
    // =========================================================================

    fn warp_placement(&self, index: usize) -> Result<SlidePlacement, WarpError> {
        let entry = &self.entries[index];
        if entry.state == RegistrationState::Unregistered || self.canvas.is_none() {
            return Err(WarpError::NotRegistered {
                slide: entry.slide.identity.clone(),
            });
        }
        self.placement_of(index).map_err(|e| WarpError::Worker {
            detail: e.to_string(),
        })
    }

    fn output_metadata(
        &self,
        name: &str,
        canvas: CanvasInfo,
        options: &WarpOptions,
        compression: Compression,
        channel_names: Vec<String>,
        pixel_size: Option<PhysicalPixelSize>,
    ) -> OutputMetadata {
        let (width, height) = canvas.dimensions_at(options.output_scale);
        let pixel_size = pixel_size.map(|p| PhysicalPixelSize {
            x: p.x / options.output_scale,
            y: p.y / options.output_scale,
            unit: p.unit,
        });
        OutputMetadata {
            name: name.to_string(),
            width,
            height,
            tile_size: options.tile_size,
            channel_names,
            pixel_size,
            compression,
        }
    }

    /// Warp every registered slide to full canvas resolution and stream
    /// it into `encoder`, one output per slide.
    ///
    /// # Errors
    ///
    /// Fails on an unregistered slide, an invalid quality factor, an
    /// accessor read error, or a sink failure. A failure abandons the
    /// current slide's output; earlier outputs are already sealed.
    pub async fn warp_and_save_slides<E>(
        &self,
        encoder: &E,
        compression: Compression,
    ) -> Result<Vec<WarpStats>, WarpError>
    where
        E: SlideEncoder,
    {
        compression.validate()?;
        let options = WarpOptions::from_config(&self.config);
        let mut stats = Vec::with_capacity(self.entries.len());
        for index in 0..self.entries.len() {
            let placement = Arc::new(self.warp_placement(index)?);
            let entry = &self.entries[index];
            let metadata = self.output_metadata(
                &entry.slide.identity,
                placement.canvas,
                &options,
                compression,
                entry.slide.channel_names.clone(),
                entry.slide.pixel_size.clone(),
            );
            let mut sink = encoder.begin(metadata).await?;
            let slide_stats = warp_slide(
                Arc::clone(&entry.accessor),
                placement,
                entry.slide.channel_count() as u16,
                &options,
                &mut sink,
            )
            .await?;
            sink.finish().await?;
            info!(
                slide = %entry.slide.identity,
                tiles = slide_stats.tiles,
                width = slide_stats.width,
                height = slide_stats.height,
                "saved registered slide"
            );
            stats.push(slide_stats);
        }
        Ok(stats)
    }

    /// Warp all slides and interleave their channels into one
    /// multi-channel output.
    ///
    /// Channels concatenate in registration order. `channel_names` may
    /// rename a slide's channels (keyed by identity, one name per
    /// channel); `drop_duplicates` keeps the first occurrence of each
    /// name, preserving order.
    ///
    /// # Errors
    ///
    /// Fails when a rename list does not match a slide's channel count,
    /// when the merge plan is empty, or on any warp/sink failure.
    pub async fn warp_and_merge_slides<E>(
        &self,
        encoder: &E,
        name: &str,
        channel_names: Option<&HashMap<String, Vec<String>>>,
        drop_duplicates: bool,
        compression: Compression,
    ) -> Result<MergeOutput, WarpError>
    where
        E: SlideEncoder,
    {
        compression.validate()?;
        let options = WarpOptions::from_config(&self.config);

        let mut lists = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            let list = match channel_names.and_then(|m| m.get(&entry.slide.identity)) {
                Some(renamed) => {
                    if renamed.len() != entry.slide.channel_count() {
                        return Err(WarpError::ChannelMismatch {
                            slide: entry.slide.identity.clone(),
                            given: renamed.len(),
                            expected: entry.slide.channel_count(),
                        });
                    }
                    renamed.clone()
                }
                None => entry.slide.channel_names.clone(),
            };
            lists.push(list);
        }
        let plan = MergePlan::build(&lists, drop_duplicates)?;

        let mut placements = Vec::with_capacity(self.entries.len());
        let mut accessors = Vec::with_capacity(self.entries.len());
        for index in 0..self.entries.len() {
            placements.push(Arc::new(self.warp_placement(index)?));
            accessors.push(Arc::clone(&self.entries[index].accessor));
        }
        let canvas = placements[0].canvas;
        let pixel_size = self
            .reference_index
            .and_then(|i| self.entries[i].slide.pixel_size.clone());

        let metadata = self.output_metadata(
            name,
            canvas,
            &options,
            compression,
            plan.channel_names(),
            pixel_size,
        );
        let mut sink = encoder.begin(metadata.clone()).await?;
        let stats = warp_and_merge(&accessors, &placements, &plan, &options, &mut sink).await?;
        sink.finish().await?;
        info!(
            output = name,
            channels = plan.len(),
            tiles = stats.tiles,
            "saved merged output"
        );
        Ok(MergeOutput {
            channels: plan.entries().to_vec(),
            metadata,
            stats,
        })
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Capture the current registration state.
    ///
    /// # Errors
    ///
    /// Returns [`RegisterError::StageNotReady`] before rigid composition.
    pub fn snapshot(&self) -> Result<Snapshot, RegisterError> {
        let canvas = self.require_canvas()?;
        let reference = self.reference_index.ok_or_else(|| {
            RegisterError::StageNotReady(
                "no reference chosen yet; call register() first".to_string(),
            )
        })?;
        let slides = self
            .entries
            .iter()
            .map(|e| SlideSnapshot {
                identity: e.slide.identity.clone(),
                levels: e.slide.levels.clone(),
                channel_names: e.slide.channel_names.clone(),
                pixel_size: e.slide.pixel_size.clone(),
                rigid: TransformSnapshot::capture(&e.rigid),
                field: e.field.as_ref().map(FieldSnapshot::capture),
                low_confidence: e.low_confidence,
                non_rigid_fallback: e.non_rigid_fallback,
            })
            .collect();
        Ok(Snapshot {
            version: SNAPSHOT_VERSION,
            config: self.config.clone(),
            working_scale: self.working_scale,
            reference,
            canvas: CanvasSnapshot::capture(&canvas),
            slides,
        })
    }

    /// Write the registration state as versioned JSON.
    pub fn save_snapshot(&self, path: &Path) -> Result<(), RegisterError> {
        self.snapshot()?
            .save(path)
            .map_err(|e| RegisterError::Artifact {
                path: path.display().to_string(),
                detail: e.to_string(),
            })
    }

    /// Restore a registrar from a snapshot file, reopening every slide
    /// through `source`.
    pub async fn load_snapshot(
        path: &Path,
        source: S,
        dst_dir: impl Into<PathBuf>,
    ) -> Result<Self, SnapshotError> {
        let snapshot = Snapshot::load(path)?;
        Self::from_snapshot(snapshot, source, dst_dir).await
    }

    /// Restore a registrar from an in-memory snapshot.
    ///
    /// Every slide is reopened and its full-resolution dimensions are
    /// checked against the recorded pyramid, so a silently swapped file
    /// cannot be warped with a stale transform.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::MissingSlide`] when a slide cannot be
    /// reopened or no longer matches the snapshot.
    pub async fn from_snapshot(
        snapshot: Snapshot,
        source: S,
        dst_dir: impl Into<PathBuf>,
    ) -> Result<Self, SnapshotError> {
        if snapshot.reference >= snapshot.slides.len() {
            return Err(SnapshotError::Json(format!(
                "reference index {} out of range for {} slides",
                snapshot.reference,
                snapshot.slides.len()
            )));
        }
        let region_cache = Arc::new(RegionCache::with_capacity(
            snapshot.config.region_cache_bytes,
        ));
        let mut entries = Vec::with_capacity(snapshot.slides.len());
        for slide in &snapshot.slides {
            let accessor = source.open(&slide.identity).await.map_err(|e| {
                SnapshotError::MissingSlide {
                    slide: slide.identity.clone(),
                    source: e,
                }
            })?;
            let recorded = slide
                .levels
                .first()
                .map(|l| (l.width, l.height))
                .unwrap_or((0, 0));
            let current = Slide::from_accessor(&accessor);
            if current.dimensions() != recorded {
                return Err(SnapshotError::MissingSlide {
                    slide: slide.identity.clone(),
                    source: SlideError::CorruptData {
                        detail: format!(
                            "dimensions changed from {:?} to {:?} since the snapshot",
                            recorded,
                            current.dimensions()
                        ),
                    },
                });
            }
            let state = if slide.field.is_some() {
                RegistrationState::NonRigidRefined
            } else {
                RegistrationState::RigidAligned
            };
            entries.push(SlideEntry {
                accessor: Arc::new(CachedAccessor::new(
                    accessor,
                    Arc::clone(&region_cache),
                )),
                slide: Slide {
                    identity: slide.identity.clone(),
                    levels: slide.levels.clone(),
                    channel_names: slide.channel_names.clone(),
                    pixel_size: slide.pixel_size.clone(),
                },
                state,
                rigid: slide.rigid.restore(),
                field: slide.field.as_ref().map(|f| f.restore()),
                low_confidence: slide.low_confidence,
                non_rigid_fallback: slide.non_rigid_fallback,
                working: None,
            });
        }
        info!(slides = entries.len(), "restored registration snapshot");
        Ok(Self {
            source,
            layout: ArtifactLayout::new(dst_dir),
            config: snapshot.config,
            preprocessor: Arc::new(LuminancePreprocessor::default()),
            region_cache,
            entries,
            skipped: Vec::new(),
            working_scale: snapshot.working_scale,
            canvas: Some(snapshot.canvas.restore()),
            reference_index: Some(snapshot.reference),
            graph: None,
            pairs: HashMap::new(),
            errors: ErrorTable::default(),
        })
    }

    // =========================================================================
    // Diagnostics Output
    // =========================================================================

    /// Draw side-by-side keypoint match overlays for every aligned pair
    /// into `dst`, returning the written paths.
    ///
    /// # Errors
    ///
    /// Returns [`RegisterError::StageNotReady`] before pair alignment and
    /// [`RegisterError::Artifact`] on a write failure.
    pub fn draw_matches(&self, dst: &Path) -> Result<Vec<PathBuf>, RegisterError> {
        if self.pairs.is_empty() {
            return Err(RegisterError::StageNotReady(
                "no aligned pairs; call register() first".to_string(),
            ));
        }
        std::fs::create_dir_all(dst).map_err(|e| RegisterError::Artifact {
            path: dst.display().to_string(),
            detail: e.to_string(),
        })?;

        let mut pairs: Vec<(&(usize, usize), &PairAlignment)> = self.pairs.iter().collect();
        pairs.sort_by_key(|(key, _)| **key);

        let mut written = Vec::new();
        for (_, pair) in pairs {
            if pair.points_a.is_empty() {
                continue;
            }
            let (Some(image_a), Some(image_b)) = (
                self.entries[pair.a].working.as_ref(),
                self.entries[pair.b].working.as_ref(),
            ) else {
                continue;
            };
            let overlay = draw_match_overlay(image_a, image_b, &pair.points_a, &pair.points_b);
            let path = dst.join(format!(
                "{}__{}_matches.png",
                sanitize(&self.entries[pair.a].slide.identity),
                sanitize(&self.entries[pair.b].slide.identity),
            ));
            save_rgb_png(&path, &overlay)?;
            written.push(path);
        }
        Ok(written)
    }

    /// Write the diagnostic tree: summary CSV, snapshot, processed and
    /// aligned thumbnails, overlap composites, and deformation meshes.
    fn write_registration_artifacts(&self, errors: &ErrorTable) -> Result<(), RegisterError> {
        let canvas = self.require_canvas()?;
        self.layout.ensure_dirs()?;
        errors.write_csv(&self.layout.summary_csv())?;

        let thumb_dim = self.config.thumbnail_dim.max(64);
        let (full_w, full_h) = canvas.full_dimensions();
        let thumb_scale = (thumb_dim as f64 / full_w.max(full_h).max(1) as f64).min(1.0);
        let (thumb_w, thumb_h) = canvas.dimensions_at(thumb_scale);

        let mut originals = Vec::with_capacity(self.entries.len());
        let mut rigid_thumbs = Vec::with_capacity(self.entries.len());
        let mut aligned_thumbs = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            // Snapshot-restored registrars have no working images; the
            // numeric outputs above still apply.
            let Some(working) = entry.working.as_ref() else {
                continue;
            };
            let name = sanitize(&entry.slide.identity);

            let processed = thumbnail_of(working, thumb_dim);
            save_gray_png(
                &self.layout.processed_dir().join(format!("{name}_processed.png")),
                &processed,
            )?;
            originals.push(processed);

            let rigid_thumb =
                project_to_canvas(working, self.working_scale, &entry.rigid, canvas, thumb_scale)?;
            save_gray_png(
                &self.layout.rigid_dir().join(format!("{name}_rigid.png")),
                &rigid_thumb,
            )?;

            let aligned = match entry.field.as_ref() {
                Some(field) => {
                    let on_grid = field.resampled_to(thumb_w, thumb_h, thumb_scale);
                    let warped = warp_working(&rigid_thumb, &on_grid);
                    let mesh = draw_deformation_mesh(&warped, field, MESH_SPACING);
                    save_rgb_png(
                        &self
                            .layout
                            .deformation_dir()
                            .join(format!("{name}_deformation.png")),
                        &mesh,
                    )?;
                    warped
                }
                None => rigid_thumb.clone(),
            };
            save_gray_png(
                &self.layout.non_rigid_dir().join(format!("{name}_non_rigid.png")),
                &aligned,
            )?;
            rigid_thumbs.push(rigid_thumb);
            aligned_thumbs.push(aligned);
        }

        if let Some(overlay) = overlay_images(&pad_all(&originals)) {
            save_rgb_png(
                &self.layout.overlaps_dir().join("unregistered_overlap.png"),
                &overlay,
            )?;
        }
        if let Some(overlay) = overlay_images(&rigid_thumbs) {
            save_rgb_png(&self.layout.overlaps_dir().join("rigid_overlap.png"), &overlay)?;
        }
        if let Some(overlay) = overlay_images(&aligned_thumbs) {
            save_rgb_png(
                &self.layout.overlaps_dir().join("non_rigid_overlap.png"),
                &overlay,
            )?;
        }

        let snapshot_path = self.layout.snapshot_path();
        self.snapshot()?
            .save(&snapshot_path)
            .map_err(|e| RegisterError::Artifact {
                path: snapshot_path.display().to_string(),
                detail: e.to_string(),
            })?;
        debug!(root = %self.layout.root().display(), "registration artifacts written");
        Ok(())
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Release every slide held open by the source and clear the table.
    ///
    /// After shutdown the registrar must be re-scanned before any further
    /// stage.
    pub async fn shutdown(&mut self) -> Result<(), RegisterError> {
        for entry in &self.entries {
            self.region_cache.evict_slide(&entry.slide.identity).await;
            self.source
                .close(&entry.slide.identity)
                .await
                .map_err(|e| RegisterError::for_slide(entry.slide.identity.clone(), e))?;
        }
        self.entries.clear();
        self.pairs.clear();
        self.graph = None;
        self.canvas = None;
        self.reference_index = None;
        info!("slide source released");
        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Rigidly project a slide image onto the canvas grid.
///
/// `source_scale` is the resolution the source image was decoded at; the
/// output covers the whole canvas at `target_scale`, zero-filled where
/// the slide does not reach.
fn project_to_canvas(
    source: &WorkingImage,
    source_scale: f64,
    rigid: &RigidTransform,
    canvas: CanvasInfo,
    target_scale: f64,
) -> Result<WorkingImage, RegisterError> {
    let (out_w, out_h) = canvas.dimensions_at(target_scale);
    let inverse = rigid
        .rescaled(target_scale)
        .inverse()
        .ok_or_else(|| RegisterError::Worker {
            detail: "rigid transform is not invertible".to_string(),
        })?;
    let ratio = source_scale / target_scale;
    let (width, height) = (source.width() as f64, source.height() as f64);
    Ok(WorkingImage::from_fn(out_w, out_h, |x, y| {
        let (sx, sy) = inverse.apply(x as f64, y as f64);
        let (px, py) = (sx * ratio, sy * ratio);
        if px < -0.5 || py < -0.5 || px > width - 0.5 || py > height - 0.5 {
            0.0
        } else {
            source.sample_bilinear(px, py)
        }
    }))
}

/// Shrink to fit inside `max_dim`, keeping the aspect ratio.
fn thumbnail_of(image: &WorkingImage, max_dim: u32) -> WorkingImage {
    let long = image.width().max(image.height()).max(1);
    if long <= max_dim {
        return image.clone();
    }
    let ratio = max_dim as f64 / long as f64;
    image.resized(
        (image.width() as f64 * ratio).round().max(1.0) as u32,
        (image.height() as f64 * ratio).round().max(1.0) as u32,
    )
}

/// Zero-pad every image to the largest dimensions in the set, so images
/// of unregistered slides can be overlaid.
fn pad_all(images: &[WorkingImage]) -> Vec<WorkingImage> {
    let width = images.iter().map(|i| i.width()).max().unwrap_or(0);
    let height = images.iter().map(|i| i.height()).max().unwrap_or(0);
    images.iter().map(|i| pad_to(i, width, height)).collect()
}

fn pad_to(image: &WorkingImage, width: u32, height: u32) -> WorkingImage {
    if image.width() == width && image.height() == height {
        return image.clone();
    }
    WorkingImage::from_fn(width, height, |x, y| {
        if x < image.width() && y < image.height() {
            image.get(x, y)
        } else {
            0.0
        }
    })
}

/// File-name-safe form of a slide identity.
fn sanitize(identity: &str) -> String {
    identity
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '.' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
