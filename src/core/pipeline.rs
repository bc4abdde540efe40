//! Per-DEM orchestration: gather sources, align them to the DEM grid, derive
//! per-source masks, combine, and persist the products next to the DEM.

use crate::core::composite::{CompositeParams, TemporalCompositor};
use crate::core::compositor::{ControlSurface, MaskCompositor};
use crate::core::derive::{MaskDeriver, MaskThresholds};
use crate::core::reconcile::{GdalWarpResampler, GridReconciler, ResampleKernel, Resampler};
use crate::core::select::{select_land_cover, CoordinateTransformer, Footprint, LandCoverChoice};
use crate::io::dates::extract_acquisition_date;
use crate::io::fetch::{modis_tiles_for_bounds, DataDirs, FetchConfig, HttpTileFetcher, TileFetcher, SNOW_DEPTH_PRODUCT};
use crate::io::geometry::{GdalCoordinateTransformer, WGS84};
use crate::io::glacier::{GlacierRasterizer, OgrGlacierRasterizer};
use crate::io::raster::{GdalRasterIo, RasterIo};
use crate::types::{
    CompositeStats, GridSpec, MaskError, MaskLayer, MaskResult, Raster, SourceBundle, SourceKind, Statistic,
};
use chrono::NaiveDate;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Output suffixes, appended to the DEM file stem
pub mod suffix {
    pub const ROCK_MASK: &str = "_rockmask";
    pub const SNOW_DEPTH: &str = "_snowdepth";
    pub const SNOW_DEPTH_MASK: &str = "_snowdepth_mask";
    pub const SNOW_COVER_PREFIX: &str = "_fsc";
    pub const SNOW_COVER_MASK: &str = "_fsc_mask";
    pub const REFLECTANCE_MASK: &str = "_toamask";
    pub const MASKED_DEM: &str = "_ref";
}

/// Full pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub thresholds: MaskThresholds,
    pub composite: CompositeParams,
    pub kernel: ResampleKernel,

    pub use_snow_depth: bool,
    pub use_snow_cover: bool,
    /// Use the reflectance raster when one is supplied
    pub use_reflectance: bool,
    /// Remove glacier outlines from the land-cover mask
    pub mask_glaciers: bool,

    /// Sources whose absence or misalignment aborts the run
    pub required_sources: Vec<SourceKind>,
    /// Write every per-source product, not only the masked DEM
    pub write_intermediates: bool,
    /// Output directory; next to the DEM when unset
    pub output_dir: Option<PathBuf>,

    pub data: DataDirs,
    pub fetch: FetchConfig,
    /// Tile id of the snow depth grid; unused by the archive layout, which
    /// ships one national grid per date
    pub snow_depth_tile: String,
    /// First date with snow depth grids
    pub snow_depth_start: NaiveDate,
    /// First date with fractional snow cover tiles
    pub snow_cover_start: NaiveDate,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            thresholds: MaskThresholds::default(),
            composite: CompositeParams::default(),
            kernel: ResampleKernel::default(),
            use_snow_depth: true,
            use_snow_cover: true,
            use_reflectance: true,
            mask_glaciers: true,
            required_sources: vec![SourceKind::LandCover],
            write_intermediates: true,
            output_dir: None,
            data: DataDirs::from_env(),
            fetch: FetchConfig::default(),
            snow_depth_tile: "us".to_string(),
            snow_depth_start: NaiveDate::from_ymd_opt(2003, 9, 30).unwrap_or(NaiveDate::MIN),
            snow_cover_start: NaiveDate::from_ymd_opt(2000, 2, 24).unwrap_or(NaiveDate::MIN),
        }
    }
}

impl PipelineConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> MaskResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text).map_err(|e| {
            MaskError::Config(format!("Invalid configuration {}: {}", path.as_ref().display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> MaskResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| MaskError::Config(format!("Cannot serialize configuration: {}", e)))
    }

    pub fn validate(&self) -> MaskResult<()> {
        self.thresholds.validate()?;
        self.composite.validate()?;
        if self.use_snow_depth && self.snow_depth_tile.trim().is_empty() {
            return Err(MaskError::Config("Snow depth tile id is empty".to_string()));
        }
        if let Some(kind) = self.required_sources.iter().find(|&&k| !self.is_requested(k)) {
            return Err(MaskError::Config(format!("Required source {} is disabled", kind)));
        }
        Ok(())
    }

    fn is_required(&self, kind: SourceKind) -> bool {
        self.required_sources.contains(&kind)
    }

    fn is_requested(&self, kind: SourceKind) -> bool {
        match kind {
            SourceKind::LandCover => true,
            SourceKind::SnowDepth => self.use_snow_depth,
            SourceKind::FractionalSnowCover => self.use_snow_cover,
            SourceKind::Reflectance => self.use_reflectance,
        }
    }
}

/// Per-DEM inputs
#[derive(Debug, Clone, Default)]
pub struct PipelineInputs {
    pub dem_path: PathBuf,
    /// Top-of-atmosphere reflectance raster of the same acquisition
    pub reflectance_path: Option<PathBuf>,
    /// Overrides the date parsed from the DEM file name
    pub acquisition_date: Option<NaiveDate>,
}

impl PipelineInputs {
    pub fn new<P: Into<PathBuf>>(dem_path: P) -> Self {
        Self { dem_path: dem_path.into(), ..Self::default() }
    }

    pub fn with_reflectance<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.reflectance_path = Some(path.into());
        self
    }

    pub fn with_date(mut self, date: NaiveDate) -> Self {
        self.acquisition_date = Some(date);
        self
    }
}

/// The collaborators one run talks to
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub io: &'a dyn RasterIo,
    pub resampler: &'a dyn Resampler,
    pub transformer: &'a dyn CoordinateTransformer,
    pub rasterizer: &'a dyn GlacierRasterizer,
    pub fetcher: &'a dyn TileFetcher,
}

/// GDAL / HTTP backed collaborators
pub struct GdalCollaborators {
    pub io: GdalRasterIo,
    pub resampler: GdalWarpResampler,
    pub transformer: GdalCoordinateTransformer,
    pub rasterizer: OgrGlacierRasterizer,
    pub fetcher: HttpTileFetcher,
}

impl GdalCollaborators {
    pub fn new(config: &PipelineConfig) -> MaskResult<Self> {
        Ok(Self {
            io: GdalRasterIo,
            resampler: GdalWarpResampler,
            transformer: GdalCoordinateTransformer,
            rasterizer: OgrGlacierRasterizer,
            fetcher: HttpTileFetcher::new(config.data.clone(), config.fetch.clone())?,
        })
    }

    pub fn collaborators(&self) -> Collaborators<'_> {
        Collaborators {
            io: &self.io,
            resampler: &self.resampler,
            transformer: &self.transformer,
            rasterizer: &self.rasterizer,
            fetcher: &self.fetcher,
        }
    }
}

/// What happened to one source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Used,
    Omitted(String),
    NotRequested,
}

/// Summary of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub dem_path: PathBuf,
    pub acquisition_date: Option<NaiveDate>,
    pub land_cover: Option<LandCoverChoice>,
    pub sources: BTreeMap<SourceKind, SourceStatus>,
    /// Dates that contributed to the snow cover composite
    pub snow_cover_dates: Vec<NaiveDate>,
    pub dem_valid_cells: usize,
    pub valid_cells: usize,
    pub outputs: Vec<PathBuf>,
}

impl PipelineReport {
    pub fn status(&self, kind: SourceKind) -> Option<&SourceStatus> {
        self.sources.get(&kind)
    }

    pub fn used_sources(&self) -> Vec<SourceKind> {
        self.sources
            .iter()
            .filter(|(_, status)| **status == SourceStatus::Used)
            .map(|(kind, _)| *kind)
            .collect()
    }
}

/// Result of a run: the control surface and its report
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub surface: ControlSurface,
    pub report: PipelineReport,
}

/// `<output_dir or DEM dir>/<DEM stem><suffix>.tif`
pub fn output_path(dem_path: &Path, output_dir: Option<&Path>, suffix: &str) -> PathBuf {
    let stem = dem_path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let dir = match output_dir {
        Some(dir) => dir.to_path_buf(),
        None => dem_path.parent().map(Path::to_path_buf).unwrap_or_default(),
    };
    dir.join(format!("{}{}.tif", stem, suffix))
}

/// Control-surface pipeline for a single DEM
pub struct ControlSurfacePipeline<'a> {
    config: PipelineConfig,
    deriver: MaskDeriver,
    compositor: TemporalCompositor,
    with: Collaborators<'a>,
}

/// Working state of one run
struct RunState {
    report: PipelineReport,
    sources: Vec<(SourceKind, Option<Raster>)>,
    glaciers: Option<Array2<bool>>,
    snow_cover: Option<CompositeStats>,
}

impl RunState {
    fn set(&mut self, kind: SourceKind, status: SourceStatus) {
        self.report.sources.insert(kind, status);
    }
}

impl<'a> ControlSurfacePipeline<'a> {
    pub fn new(config: PipelineConfig, with: Collaborators<'a>) -> MaskResult<Self> {
        config.validate()?;
        let deriver = MaskDeriver::new(config.thresholds.clone())?;
        let compositor = TemporalCompositor::new(config.composite.clone());
        Ok(Self { config, deriver, compositor, with })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn run(&self, inputs: &PipelineInputs) -> MaskResult<PipelineRun> {
        let dem_path = inputs.dem_path.as_path();
        log::info!("Building control surface for {}", dem_path.display());

        let dem = self.with.io.open(dem_path)?;
        let grid = dem.grid_spec()?;
        let footprint = Footprint::from_grid(&grid);
        let reconciler = GridReconciler::new(self.with.resampler).with_kernel(self.config.kernel);

        let date = match inputs.acquisition_date {
            Some(date) => Some(date),
            None => match extract_acquisition_date(dem_path) {
                Ok(date) => Some(date),
                Err(e) => {
                    log::warn!("{}, time-dependent sources are skipped", e);
                    None
                }
            },
        };
        if let Some(date) = date {
            log::info!("Acquisition date: {}", date);
        }

        let mut state = RunState {
            report: PipelineReport {
                dem_path: dem_path.to_path_buf(),
                acquisition_date: date,
                land_cover: None,
                sources: SourceKind::ALL.iter().map(|&k| (k, SourceStatus::NotRequested)).collect(),
                snow_cover_dates: Vec::new(),
                dem_valid_cells: 0,
                valid_cells: 0,
                outputs: Vec::new(),
            },
            sources: Vec::new(),
            glaciers: None,
            snow_cover: None,
        };

        self.gather_land_cover(&footprint, &grid, &mut state)?;
        if self.config.is_requested(SourceKind::SnowDepth) {
            self.gather_snow_depth(date, &mut state)?;
        }
        if self.config.is_requested(SourceKind::FractionalSnowCover) {
            self.gather_snow_cover(date, &footprint, &grid, &reconciler, &mut state)?;
        }
        if self.config.is_requested(SourceKind::Reflectance) {
            self.gather_reflectance(inputs.reflectance_path.as_deref(), &mut state)?;
        }

        // Snow cover is composited directly on the DEM grid
        let bundle = SourceBundle::from_optional(std::mem::take(&mut state.sources));
        let (aligned, failures) = reconciler.reconcile_bundle(bundle, &dem, &self.config.required_sources)?;
        for failure in failures {
            state.set(failure.source, SourceStatus::Omitted(failure.error.to_string()));
        }

        let layers = self.derive_layers(dem_path, &grid, &aligned, &mut state)?;
        let surface = MaskCompositor::new().combine(&dem, layers)?;

        let ref_path = self.output(dem_path, suffix::MASKED_DEM);
        self.with.io.write(&surface.masked_dem, &ref_path)?;
        state.report.outputs.push(ref_path);

        state.report.dem_valid_cells = surface.dem_valid_cells;
        state.report.valid_cells = surface.valid_cells;
        log::info!(
            "Sources used: {:?}, {} valid control-surface cells",
            state.report.used_sources(),
            surface.valid_cells
        );
        Ok(PipelineRun { surface, report: state.report })
    }

    fn output(&self, dem_path: &Path, suffix: &str) -> PathBuf {
        output_path(dem_path, self.config.output_dir.as_deref(), suffix)
    }

    /// Record an acquisition failure, or abort for required sources and
    /// configuration errors
    fn omit(&self, kind: SourceKind, error: MaskError, state: &mut RunState) -> MaskResult<()> {
        if matches!(error, MaskError::Config(_)) || self.config.is_required(kind) {
            return Err(error);
        }
        log::warn!("Omitting {} source: {}", kind, error);
        state.set(kind, SourceStatus::Omitted(error.to_string()));
        Ok(())
    }

    fn gather_land_cover(&self, footprint: &Footprint, grid: &GridSpec, state: &mut RunState) -> MaskResult<()> {
        let primary_path = self.config.data.primary_land_cover_path();
        let choice = match self.with.io.grid(&primary_path) {
            Ok(coverage) => select_land_cover(footprint, &Footprint::from_grid(&coverage), self.with.transformer)?,
            Err(e @ MaskError::Config(_)) => return Err(e),
            Err(e) => {
                log::warn!("Primary land cover unavailable ({}), using bare-ground fallback", e);
                LandCoverChoice::Fallback
            }
        };
        state.report.land_cover = Some(choice);

        let path = match choice {
            LandCoverChoice::Primary => primary_path,
            LandCoverChoice::Fallback => self.config.data.bare_ground_path(),
        };
        match self.with.io.open(&path) {
            Ok(raster) => state.sources.push((SourceKind::LandCover, Some(raster))),
            Err(e) => return self.omit(SourceKind::LandCover, e, state),
        }

        if self.config.mask_glaciers {
            let outlines = self.config.data.glacier_outlines_path();
            match self.with.rasterizer.rasterize(&outlines, grid) {
                Ok(glaciers) => state.glaciers = Some(glaciers),
                Err(e @ MaskError::Config(_)) => return Err(e),
                Err(e) => log::warn!("Glacier outlines unavailable, not masking glaciers: {}", e),
            }
        }
        Ok(())
    }

    fn gather_snow_depth(&self, date: Option<NaiveDate>, state: &mut RunState) -> MaskResult<()> {
        let kind = SourceKind::SnowDepth;
        let date = match date {
            Some(date) if date >= self.config.snow_depth_start => date,
            Some(date) => {
                let reason = MaskError::Unavailable(format!("No snow depth grids before {} ({})", self.config.snow_depth_start, date));
                return self.omit(kind, reason, state);
            }
            None => return self.omit(kind, MaskError::Unavailable("Unknown acquisition date".to_string()), state),
        };

        let path = match self.with.fetcher.fetch_tile(SNOW_DEPTH_PRODUCT, date, &self.config.snow_depth_tile) {
            Ok(Some(path)) => path,
            Ok(None) => return self.omit(kind, MaskError::Unavailable(format!("No snow depth grid for {}", date)), state),
            Err(e) => return self.omit(kind, e, state),
        };
        match self.with.io.open(&path) {
            Ok(raster) => state.sources.push((kind, Some(raster))),
            Err(e) => return self.omit(kind, e, state),
        }
        Ok(())
    }

    fn gather_snow_cover(
        &self,
        date: Option<NaiveDate>,
        footprint: &Footprint,
        grid: &GridSpec,
        reconciler: &GridReconciler<'_>,
        state: &mut RunState,
    ) -> MaskResult<()> {
        let kind = SourceKind::FractionalSnowCover;
        let date = match date {
            Some(date) if date >= self.config.snow_cover_start => date,
            Some(date) => {
                let reason =
                    MaskError::Unavailable(format!("No snow cover tiles before {} ({})", self.config.snow_cover_start, date));
                return self.omit(kind, reason, state);
            }
            None => return self.omit(kind, MaskError::Unavailable("Unknown acquisition date".to_string()), state),
        };

        let tiles = if self.config.composite.tiles.is_empty() {
            let bounds = self.with.transformer.reproject(footprint, WGS84).and_then(|g| g.bounds());
            match bounds {
                Ok(bounds) => modis_tiles_for_bounds(&bounds),
                Err(e) => return self.omit(kind, e, state),
            }
        } else {
            self.config.composite.tiles.clone()
        };
        if tiles.is_empty() {
            return self.omit(kind, MaskError::Unavailable("DEM footprint outside the tile grid".to_string()), state);
        }

        match self.compositor.run(date, &tiles, self.with.fetcher, self.with.io, reconciler, grid) {
            Ok(stats) => {
                state.report.snow_cover_dates = stats.dates.clone();
                state.snow_cover = Some(stats);
                Ok(())
            }
            Err(e) => self.omit(kind, e, state),
        }
    }

    fn gather_reflectance(&self, path: Option<&Path>, state: &mut RunState) -> MaskResult<()> {
        let kind = SourceKind::Reflectance;
        let path = match path {
            Some(path) => path,
            None if self.config.is_required(kind) => {
                return Err(MaskError::InvalidInput("Reflectance is required but no raster was supplied".to_string()));
            }
            None => {
                log::debug!("No reflectance raster supplied");
                return Ok(());
            }
        };
        match self.with.io.open(path) {
            Ok(raster) => state.sources.push((kind, Some(raster))),
            Err(e) => return self.omit(kind, e, state),
        }
        Ok(())
    }

    /// One layer per aligned source, writing intermediates as configured
    fn derive_layers(
        &self,
        dem_path: &Path,
        grid: &GridSpec,
        aligned: &SourceBundle,
        state: &mut RunState,
    ) -> MaskResult<Vec<MaskLayer>> {
        let mut layers = Vec::new();
        let mut products: Vec<(Raster, &str)> = Vec::new();
        let mut stat_products: Vec<(Raster, String)> = Vec::new();

        for (kind, raster) in aligned.iter() {
            let layer = match kind {
                SourceKind::LandCover => {
                    let choice = state.report.land_cover.unwrap_or(LandCoverChoice::Fallback);
                    let layer = self.deriver.land_cover_mask(choice, raster, state.glaciers.as_ref())?;
                    products.push((layer.to_raster(grid), suffix::ROCK_MASK));
                    layer
                }
                SourceKind::SnowDepth => {
                    let (depth_m, layer) = self.deriver.snow_depth_mask(raster);
                    products.push((depth_m, suffix::SNOW_DEPTH));
                    products.push((layer.to_raster(grid), suffix::SNOW_DEPTH_MASK));
                    layer
                }
                SourceKind::Reflectance => {
                    let layer = self.deriver.reflectance_mask(raster);
                    products.push((layer.to_raster(grid), suffix::REFLECTANCE_MASK));
                    layer
                }
                SourceKind::FractionalSnowCover => continue,
            };
            state.set(kind, SourceStatus::Used);
            layers.push(layer);
        }

        if let Some(stats) = state.snow_cover.take() {
            let layer = self.deriver.snow_cover_mask(&stats.median);
            for stat in [Statistic::Count, Statistic::Min, Statistic::Max, Statistic::Median] {
                stat_products.push((stats.to_raster(stat), format!("{}_{}", suffix::SNOW_COVER_PREFIX, stat.suffix())));
            }
            products.push((layer.to_raster(grid), suffix::SNOW_COVER_MASK));
            state.set(SourceKind::FractionalSnowCover, SourceStatus::Used);
            layers.push(layer);
        }

        if self.config.write_intermediates {
            let named = products
                .iter()
                .map(|(r, s)| (r, *s))
                .chain(stat_products.iter().map(|(r, s)| (r, s.as_str())));
            for (raster, suffix) in named {
                let path = self.output(dem_path, suffix);
                self.with.io.write(raster, &path)?;
                state.report.outputs.push(path);
            }
        }
        Ok(layers)
    }
}
