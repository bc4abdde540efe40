//! Core control-surface modules

pub mod reconcile;
pub mod select;
pub mod composite;
pub mod derive;
pub mod compositor;
pub mod pipeline;

// Re-export main types
pub use reconcile::{GridReconciler, GdalWarpResampler, ResampleKernel, Resampler, SourceFailure};
pub use select::{select_land_cover, CoordinateTransformer, Footprint, LandCoverChoice};
pub use composite::{median, CompositeParams, TemporalCompositor};
pub use derive::{suppress_glaciers, EmptyCompositePolicy, MaskDeriver, MaskThresholds};
pub use compositor::{ControlSurface, MaskCompositor};
pub use pipeline::{
    output_path, Collaborators, ControlSurfacePipeline, GdalCollaborators, PipelineConfig, PipelineInputs,
    PipelineReport, PipelineRun, SourceStatus,
};
