//! ctrlsurf: control-surface masks for DEM co-registration
//!
//! Fuses land cover, bare-ground fraction, glacier outlines, modelled snow
//! depth, fractional snow cover and optional top-of-atmosphere reflectance
//! onto a DEM's grid and keeps only stable, snow-free, non-glaciated cells.

pub mod types;
pub mod io;
pub mod core;

// Re-export main types and functions for easier access
pub use crate::types::{
    BoundingBox, CompositeStats, GeoTransform, GridSpec, MaskError, MaskLayer, MaskResult, Observation, Raster,
    SourceBundle, SourceKind, Statistic, TemporalSeries,
};

pub use crate::core::{
    ControlSurface, ControlSurfacePipeline, GridReconciler, MaskCompositor, MaskDeriver, PipelineConfig,
    PipelineInputs, PipelineReport, TemporalCompositor,
};
pub use crate::io::{DataDirs, GdalRasterIo, RasterIo, TileFetcher};
