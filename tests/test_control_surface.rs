use chrono::NaiveDate;
use ctrlsurf::core::pipeline::{suffix, Collaborators, ControlSurfacePipeline, PipelineConfig, PipelineInputs, SourceStatus};
use ctrlsurf::core::reconcile::{ResampleKernel, Resampler};
use ctrlsurf::core::select::{CoordinateTransformer, Footprint, LandCoverChoice};
use ctrlsurf::io::fetch::{DataDirs, TileFetcher, FSC_PRODUCT};
use ctrlsurf::io::glacier::GlacierRasterizer;
use ctrlsurf::io::raster::RasterIo;
use ctrlsurf::types::{GeoTransform, GridSpec, MaskError, MaskResult, Raster, SourceKind};
use ndarray::{array, s, Array2};
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const UTM: &str = "EPSG:32610";
const DEM_PATH: &str = "/dems/20150422_WV02_dem.tif";
const REFLECTANCE_PATH: &str = "/dems/20150422_WV02_toa.tif";

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn geo(origin_x: f64, origin_y: f64) -> GeoTransform {
    GeoTransform::from_gdal(&[origin_x, 30.0, 0.0, origin_y, 0.0, -30.0])
}

fn on_grid(data: Array2<f64>, gt: GeoTransform, crs: &str, nodata: Option<f64>) -> Raster {
    Raster::new(data, Some(gt), Some(crs.to_string()), nodata)
}

/// Raster store keyed by path; writes are kept for inspection
#[derive(Default)]
struct MemoryIo {
    rasters: RefCell<HashMap<PathBuf, Raster>>,
    written: RefCell<Vec<PathBuf>>,
}

impl MemoryIo {
    fn insert<P: Into<PathBuf>>(&self, path: P, raster: Raster) {
        self.rasters.borrow_mut().insert(path.into(), raster);
    }

    fn stored(&self, path: &Path) -> Option<Raster> {
        self.rasters.borrow().get(path).cloned()
    }
}

impl RasterIo for MemoryIo {
    fn open(&self, path: &Path) -> MaskResult<Raster> {
        self.rasters.borrow().get(path).cloned().ok_or_else(|| {
            MaskError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, path.display().to_string()))
        })
    }

    fn write(&self, raster: &Raster, path: &Path) -> MaskResult<()> {
        self.written.borrow_mut().push(path.to_path_buf());
        self.insert(path, raster.clone());
        Ok(())
    }
}

/// Cuts the reference window out of a same-resolution, same-CRS source
struct WindowResampler;

impl Resampler for WindowResampler {
    fn resample(&self, source: &Raster, reference: &GridSpec, _kernel: ResampleKernel) -> MaskResult<Raster> {
        let grid = source.grid_spec()?;
        if grid.crs != reference.crs {
            return Err(MaskError::GeometryMismatch(format!("{} is not {}", grid.crs, reference.crs)));
        }
        let col = ((reference.geo_transform.top_left_x - grid.geo_transform.top_left_x) / 30.0).round() as usize;
        let row = ((grid.geo_transform.top_left_y - reference.geo_transform.top_left_y) / 30.0).round() as usize;
        if row + reference.rows > grid.rows || col + reference.cols > grid.cols {
            return Err(MaskError::GeometryMismatch("window outside source".to_string()));
        }
        let window = s![row..row + reference.rows, col..col + reference.cols];
        Raster::with_validity(
            source.data.slice(window).to_owned(),
            source.valid.slice(window).to_owned(),
            Some(reference.geo_transform),
            Some(reference.crs.clone()),
            source.nodata,
        )
    }
}

struct SameCrs;

impl CoordinateTransformer for SameCrs {
    fn reproject(&self, footprint: &Footprint, target_crs: &str) -> MaskResult<Footprint> {
        Ok(footprint.with_exterior(&footprint.exterior(), target_crs))
    }
}

struct FixedGlaciers(Array2<bool>);

impl GlacierRasterizer for FixedGlaciers {
    fn rasterize(&self, _outlines: &Path, grid: &GridSpec) -> MaskResult<Array2<bool>> {
        assert_eq!(grid.dim(), self.0.dim());
        Ok(self.0.clone())
    }
}

/// Serves fractional snow cover tiles from a table; snow depth is offline
struct TableFetcher(HashMap<(NaiveDate, String), PathBuf>);

impl TileFetcher for TableFetcher {
    fn fetch_tile(&self, product: &str, date: NaiveDate, tile: &str) -> MaskResult<Option<PathBuf>> {
        if product != FSC_PRODUCT {
            return Err(MaskError::Fetch(format!("{} server unreachable", product)));
        }
        Ok(self.0.get(&(date, tile.to_string())).cloned())
    }
}

struct Scene {
    io: MemoryIo,
    fetcher: TableFetcher,
    glaciers: FixedGlaciers,
    config: PipelineConfig,
}

impl Scene {
    /// 2x3 DEM at 30 m with one no-data cell, a larger primary land-cover
    /// raster, two snow cover dates around 2015-04-22 and an off-CRS
    /// reflectance raster
    fn new() -> Self {
        let io = MemoryIo::default();
        let dem_gt = geo(500_000.0, 5_000_000.0);
        io.insert(
            DEM_PATH,
            on_grid(array![[1000.0, 1100.0, -9999.0], [1200.0, 1300.0, 1400.0]], dem_gt, UTM, Some(-9999.0)),
        );

        let data = DataDirs::with_root("/data");
        let land_cover = array![
            [11.0, 11.0, 11.0, 11.0, 11.0],
            [11.0, 31.0, 31.0, 31.0, 11.0],
            [11.0, 31.0, 11.0, 31.0, 11.0],
            [11.0, 11.0, 11.0, 11.0, 11.0],
        ];
        io.insert(
            data.primary_land_cover_path(),
            on_grid(land_cover, geo(499_970.0, 5_000_030.0), UTM, None),
        );

        let mut tiles = HashMap::new();
        for (date, values) in [
            (ymd(2015, 4, 21), array![[10.0, 80.0, 10.0], [255.0, 20.0, 250.0]]),
            (ymd(2015, 4, 23), array![[30.0, 90.0, 20.0], [255.0, 40.0, 250.0]]),
        ] {
            let path = PathBuf::from(format!("/data/fsc/{}_h09v04.tif", date.format("%Y%m%d")));
            io.insert(&path, on_grid(values, dem_gt, UTM, Some(255.0)));
            tiles.insert((date, "h09v04".to_string()), path);
        }

        io.insert(
            REFLECTANCE_PATH,
            on_grid(Array2::from_elem((2, 3), 0.1), dem_gt, "EPSG:32611", None),
        );

        let mut config = PipelineConfig { data, ..PipelineConfig::default() };
        config.composite.pad_days = 1;
        config.composite.tiles = vec!["h09v04".to_string()];

        Self {
            io,
            fetcher: TableFetcher(tiles),
            glaciers: FixedGlaciers(array![[false, true, false], [false, false, false]]),
            config,
        }
    }

    fn collaborators(&self) -> Collaborators<'_> {
        Collaborators {
            io: &self.io,
            resampler: &WindowResampler,
            transformer: &SameCrs,
            rasterizer: &self.glaciers,
            fetcher: &self.fetcher,
        }
    }
}

#[test]
fn test_pipeline_end_to_end_with_failing_optional_sources() {
    init_logging();
    let scene = Scene::new();
    let pipeline = ControlSurfacePipeline::new(scene.config.clone(), scene.collaborators()).unwrap();

    let run = pipeline.run(&PipelineInputs::new(DEM_PATH).with_reflectance(REFLECTANCE_PATH)).unwrap();
    let report = &run.report;
    println!("=== Control surface report ===");
    println!("{:#?}", report);

    assert_eq!(report.acquisition_date, Some(ymd(2015, 4, 22)));
    assert_eq!(report.land_cover, Some(LandCoverChoice::Primary));
    assert_eq!(report.status(SourceKind::LandCover), Some(&SourceStatus::Used));
    assert_eq!(report.status(SourceKind::FractionalSnowCover), Some(&SourceStatus::Used));
    assert!(matches!(report.status(SourceKind::SnowDepth), Some(SourceStatus::Omitted(_))));
    assert!(matches!(report.status(SourceKind::Reflectance), Some(SourceStatus::Omitted(_))));
    assert_eq!(report.snow_cover_dates, vec![ymd(2015, 4, 21), ymd(2015, 4, 23)]);

    // rock minus glacier: [[T, F, T], [T, F, T]]
    let rock = run.surface.layer(SourceKind::LandCover).unwrap();
    assert_eq!(rock.mask, array![[true, false, true], [true, false, true]]);

    // medians [[20, 85, 15], [none, 30, cloud]]; empty cells count as covered
    let snow = run.surface.layer(SourceKind::FractionalSnowCover).unwrap();
    assert_eq!(snow.mask, array![[true, false, true], [false, true, false]]);

    assert_eq!(run.surface.final_mask, array![[true, false, false], [false, false, false]]);
    assert_eq!(report.dem_valid_cells, 5);
    assert_eq!(report.valid_cells, 1);

    let masked = scene.io.stored(Path::new("/dems/20150422_WV02_dem_ref.tif")).unwrap();
    assert_eq!(masked.data[[0, 0]], 1000.0);
    assert_eq!(masked.data[[1, 1]], -9999.0);
    assert_eq!(masked.valid_count(), 1);

    let median = scene.io.stored(Path::new("/dems/20150422_WV02_dem_fsc_med.tif")).unwrap();
    assert_eq!(median.data[[0, 1]], 85.0);
    assert!(!median.valid[[1, 0]]);

    assert_eq!(report.outputs.len(), 7);
    assert_eq!(report.outputs, *scene.io.written.borrow());
    assert!(report
        .outputs
        .iter()
        .any(|p| p.to_string_lossy().ends_with(&format!("{}.tif", suffix::ROCK_MASK))));
}

#[test]
fn test_required_source_failure_aborts() {
    init_logging();
    let scene = Scene::new();
    let mut config = scene.config.clone();
    config.required_sources = vec![SourceKind::LandCover, SourceKind::SnowDepth];
    let pipeline = ControlSurfacePipeline::new(config, scene.collaborators()).unwrap();

    let err = pipeline.run(&PipelineInputs::new(DEM_PATH)).unwrap_err();
    assert!(matches!(err, MaskError::Fetch(_)));
    assert!(scene.io.written.borrow().is_empty());
}

#[test]
fn test_only_masked_dem_written_without_intermediates() {
    init_logging();
    let scene = Scene::new();
    let mut config = scene.config.clone();
    config.write_intermediates = false;
    config.output_dir = Some(PathBuf::from("/out"));
    let pipeline = ControlSurfacePipeline::new(config, scene.collaborators()).unwrap();

    let run = pipeline.run(&PipelineInputs::new(DEM_PATH)).unwrap();
    assert_eq!(run.report.outputs, vec![PathBuf::from("/out/20150422_WV02_dem_ref.tif")]);
    assert_eq!(run.report.status(SourceKind::Reflectance), Some(&SourceStatus::NotRequested));
}

#[test]
fn test_undated_dem_skips_time_dependent_sources() {
    init_logging();
    let scene = Scene::new();
    let undated = "/dems/site_dem.tif";
    let dem = scene.io.open(Path::new(DEM_PATH)).unwrap();
    scene.io.insert(undated, dem);

    let pipeline = ControlSurfacePipeline::new(scene.config.clone(), scene.collaborators()).unwrap();
    let run = pipeline.run(&PipelineInputs::new(undated)).unwrap();

    assert_eq!(run.report.acquisition_date, None);
    assert!(matches!(run.report.status(SourceKind::SnowDepth), Some(SourceStatus::Omitted(_))));
    assert!(matches!(run.report.status(SourceKind::FractionalSnowCover), Some(SourceStatus::Omitted(_))));
    assert_eq!(run.report.used_sources(), vec![SourceKind::LandCover]);
    // DEM validity AND rock mask
    assert_eq!(run.surface.final_mask, array![[true, false, false], [true, false, true]]);
}

#[test]
fn test_fallback_land_cover_outside_primary_coverage() {
    init_logging();
    let scene = Scene::new();
    // Primary product far away, bare ground on the DEM grid
    let far = on_grid(Array2::from_elem((2, 2), 31.0), geo(100_000.0, 4_000_000.0), UTM, None);
    scene.io.insert(scene.config.data.primary_land_cover_path(), far);
    scene.io.insert(
        scene.config.data.bare_ground_path(),
        on_grid(array![[90.0, 90.0, 90.0], [80.0, 95.0, 255.0]], geo(500_000.0, 5_000_000.0), UTM, Some(255.0)),
    );

    let mut config = scene.config.clone();
    config.use_snow_cover = false;
    config.use_snow_depth = false;
    let pipeline = ControlSurfacePipeline::new(config, scene.collaborators()).unwrap();
    let run = pipeline.run(&PipelineInputs::new(DEM_PATH)).unwrap();

    assert_eq!(run.report.land_cover, Some(LandCoverChoice::Fallback));
    let bare = run.surface.layer(SourceKind::LandCover).unwrap();
    assert_eq!(bare.mask, array![[true, false, true], [false, true, false]]);
}

#[test]
fn test_all_cloud_snow_cover_is_omitted_not_all_covered() {
    init_logging();
    let scene = Scene::new();
    let dem_gt = geo(500_000.0, 5_000_000.0);
    for day in ["20150421", "20150423"] {
        scene.io.insert(
            format!("/data/fsc/{}_h09v04.tif", day),
            on_grid(Array2::from_elem((2, 3), 250.0), dem_gt, UTM, Some(255.0)),
        );
    }

    let pipeline = ControlSurfacePipeline::new(scene.config.clone(), scene.collaborators()).unwrap();
    let run = pipeline.run(&PipelineInputs::new(DEM_PATH)).unwrap();

    assert!(matches!(run.report.status(SourceKind::FractionalSnowCover), Some(SourceStatus::Omitted(_))));
    assert!(run.report.snow_cover_dates.is_empty());
    assert!(run.surface.layer(SourceKind::FractionalSnowCover).is_none());
    // DEM validity AND rock mask only
    assert_eq!(run.surface.final_mask, array![[true, false, false], [true, false, true]]);
}

#[test]
fn test_primary_land_cover_without_crs_is_fatal() {
    init_logging();
    let scene = Scene::new();
    let mut primary = scene.io.stored(&scene.config.data.primary_land_cover_path()).unwrap();
    primary.crs = None;
    scene.io.insert(scene.config.data.primary_land_cover_path(), primary);
    scene.io.insert(
        scene.config.data.bare_ground_path(),
        on_grid(Array2::from_elem((2, 3), 90.0), geo(500_000.0, 5_000_000.0), UTM, None),
    );

    let pipeline = ControlSurfacePipeline::new(scene.config.clone(), scene.collaborators()).unwrap();
    let err = pipeline.run(&PipelineInputs::new(DEM_PATH)).unwrap_err();
    assert!(matches!(err, MaskError::Config(_)));
    assert!(scene.io.written.borrow().is_empty());
}
