use crate::types::{GeoTransform, GridSpec, MaskError, MaskResult, Raster, DEFAULT_NODATA};
use gdal::raster::Buffer;
use gdal::spatial_ref::SpatialRef;
use gdal::{Dataset, DriverManager};
use ndarray::Array2;
use std::path::Path;

/// Raster I/O collaborator
pub trait RasterIo {
    /// Open the first band of a georeferenced raster
    fn open(&self, path: &Path) -> MaskResult<Raster>;

    /// Write a single-band raster; invalid cells take the raster's no-data
    /// value (or `DEFAULT_NODATA`).
    fn write(&self, raster: &Raster, path: &Path) -> MaskResult<()>;

    /// Grid of a raster without keeping its data
    fn grid(&self, path: &Path) -> MaskResult<GridSpec> {
        self.open(path)?.grid_spec()
    }
}

/// GDAL-backed raster reader/writer producing GeoTIFF output
#[derive(Debug, Default, Clone, Copy)]
pub struct GdalRasterIo;

impl RasterIo for GdalRasterIo {
    fn open(&self, path: &Path) -> MaskResult<Raster> {
        log::info!("Opening raster: {}", path.display());
        let dataset = Dataset::open(path)?;
        read_dataset(&dataset)
    }

    fn write(&self, raster: &Raster, path: &Path) -> MaskResult<()> {
        let grid = raster.grid_spec()?;
        let fill = raster.nodata.unwrap_or(DEFAULT_NODATA);
        let nodata = if raster.nodata.is_some() || raster.valid.iter().any(|&v| !v) {
            Some(fill)
        } else {
            None
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        log::info!("Writing out {}", path.display());
        create_dataset("GTiff", path, &raster.filled(fill), &grid, nodata)?;
        Ok(())
    }

    fn grid(&self, path: &Path) -> MaskResult<GridSpec> {
        let dataset = Dataset::open(path)?;
        let (cols, rows) = dataset.raster_size();
        let projection = dataset.projection();
        if projection.trim().is_empty() {
            return Err(MaskError::Config(format!("{} has no coordinate reference system", path.display())));
        }
        Ok(GridSpec {
            rows,
            cols,
            geo_transform: GeoTransform::from_gdal(&dataset.geo_transform()?),
            crs: projection,
        })
    }
}

/// Read band 1 of an open dataset into a `Raster`
pub(crate) fn read_dataset(dataset: &Dataset) -> MaskResult<Raster> {
    let (width, height) = dataset.raster_size();
    let geo_transform = dataset.geo_transform().ok().map(|gt| GeoTransform::from_gdal(&gt));
    let projection = dataset.projection();
    let crs = if projection.trim().is_empty() { None } else { Some(projection) };

    let band = dataset.rasterband(1)?;
    let nodata = band.no_data_value();
    let data: Array2<f64> = band.read_as_array::<f64>((0, 0), (width, height), (width, height), None)?;

    log::debug!("Raster size: {}x{}, nodata: {:?}", width, height, nodata);
    log::debug!("Raster geotransform: {:?}", geo_transform);

    if data.dim() != (height, width) {
        return Err(MaskError::Processing(format!(
            "Band shape {:?} does not match raster size {}x{}",
            data.dim(),
            width,
            height
        )));
    }

    Ok(Raster::new(data, geo_transform, crs, nodata))
}

/// Create a single-band Float64 dataset on `grid` holding `data`.
///
/// Used both for GeoTIFF output and for GDAL `MEM` datasets during warping.
pub(crate) fn create_dataset(
    driver_name: &str,
    path: &Path,
    data: &Array2<f64>,
    grid: &GridSpec,
    nodata: Option<f64>,
) -> MaskResult<Dataset> {
    let (rows, cols) = data.dim();
    if (rows, cols) != grid.dim() {
        return Err(MaskError::GeometryMismatch(format!(
            "Data {:?} does not fit grid {:?}",
            data.dim(),
            grid.dim()
        )));
    }

    let driver = DriverManager::get_driver_by_name(driver_name)?;
    let mut dataset = driver.create_with_band_type::<f64, _>(path, cols as isize, rows as isize, 1)?;
    dataset.set_geo_transform(&grid.geo_transform.to_gdal())?;
    dataset.set_projection(&crs_to_wkt(&grid.crs)?)?;

    {
        let mut band = dataset.rasterband(1)?;
        if nodata.is_some() {
            band.set_no_data_value(nodata)?;
        }
        let buffer = Buffer::new((cols, rows), data.iter().copied().collect());
        band.write((0, 0), (cols, rows), &buffer)?;
    }

    Ok(dataset)
}

/// Normalise a CRS definition (WKT, `EPSG:n`, PROJ string) to WKT
pub(crate) fn crs_to_wkt(definition: &str) -> MaskResult<String> {
    let srs = SpatialRef::from_definition(definition).map_err(|e| {
        MaskError::Config(format!("Unrecognised coordinate reference system '{}': {}", definition, e))
    })?;
    Ok(srs.to_wkt()?)
}
