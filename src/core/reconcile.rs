use crate::io::raster::create_dataset;
use crate::types::{
    GridSpec, MaskError, MaskResult, Raster, SourceBundle, SourceKind, DEFAULT_NODATA,
};
use gdal::raster::Buffer;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Resampling kernel used when moving a source onto the reference grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResampleKernel {
    /// Smooth kernel without the ringing/negative-value artifacts of cubic
    /// convolution at class boundaries
    CubicSpline,
    Bilinear,
    Nearest,
}

impl Default for ResampleKernel {
    fn default() -> Self {
        ResampleKernel::CubicSpline
    }
}

impl ResampleKernel {
    fn to_gdal(self) -> gdal_sys::GDALResampleAlg::Type {
        match self {
            ResampleKernel::CubicSpline => gdal_sys::GDALResampleAlg::GRA_CubicSpline,
            ResampleKernel::Bilinear => gdal_sys::GDALResampleAlg::GRA_Bilinear,
            ResampleKernel::Nearest => gdal_sys::GDALResampleAlg::GRA_NearestNeighbour,
        }
    }
}

/// Resampling collaborator
pub trait Resampler {
    fn resample(&self, source: &Raster, reference: &GridSpec, kernel: ResampleKernel) -> MaskResult<Raster>;
}

/// A source dropped during reconciliation
#[derive(Debug)]
pub struct SourceFailure {
    pub source: SourceKind,
    pub error: MaskError,
}

/// Aligns rasters to the reference (DEM) grid
pub struct GridReconciler<'a> {
    resampler: &'a dyn Resampler,
    kernel: ResampleKernel,
}

impl<'a> GridReconciler<'a> {
    pub fn new(resampler: &'a dyn Resampler) -> Self {
        Self { resampler, kernel: ResampleKernel::default() }
    }

    pub fn with_kernel(mut self, kernel: ResampleKernel) -> Self {
        self.kernel = kernel;
        self
    }

    pub fn kernel(&self) -> ResampleKernel {
        self.kernel
    }

    /// Reproject/resample `source` onto the grid of `reference`
    pub fn reconcile(&self, source: &Raster, reference: &Raster) -> MaskResult<Raster> {
        let grid = reference.grid_spec()?;
        self.reconcile_to_grid(source, &grid)
    }

    /// Reproject/resample `source` onto `grid`. A raster already on the grid
    /// is returned unchanged.
    pub fn reconcile_to_grid(&self, source: &Raster, grid: &GridSpec) -> MaskResult<Raster> {
        let source_grid = source.grid_spec()?;
        if source_grid == *grid {
            log::debug!("Source already on reference grid, no resampling");
            return Ok(source.clone());
        }

        log::debug!(
            "Resampling {}x{} source onto {}x{} reference grid ({:?})",
            source_grid.rows,
            source_grid.cols,
            grid.rows,
            grid.cols,
            self.kernel
        );
        let aligned = self.resampler.resample(source, grid, self.kernel)?;

        if !aligned.is_on_grid(grid) {
            return Err(MaskError::GeometryMismatch(format!(
                "Resampled raster {:?} does not match the reference grid {:?}",
                aligned.dim(),
                grid.dim()
            )));
        }
        Ok(aligned)
    }

    pub fn reconcile_all(&self, sources: &[Raster], reference: &Raster) -> MaskResult<Vec<Raster>> {
        let grid = reference.grid_spec()?;
        sources.iter().map(|s| self.reconcile_to_grid(s, &grid)).collect()
    }

    /// Align every source of a bundle. Geometry mismatches drop that source
    /// unless it is required; configuration errors always abort.
    pub fn reconcile_bundle(
        &self,
        bundle: SourceBundle,
        reference: &Raster,
        required: &[SourceKind],
    ) -> MaskResult<(SourceBundle, Vec<SourceFailure>)> {
        let grid = reference.grid_spec()?;
        let mut aligned = Vec::with_capacity(bundle.len());
        let mut failures = Vec::new();

        for (kind, raster) in bundle.into_entries() {
            match self.reconcile_to_grid(&raster, &grid) {
                Ok(raster) => aligned.push((kind, Some(raster))),
                Err(MaskError::GeometryMismatch(msg)) if !required.contains(&kind) => {
                    log::warn!("Dropping {} source, cannot align to DEM grid: {}", kind, msg);
                    failures.push(SourceFailure { source: kind, error: MaskError::GeometryMismatch(msg) });
                }
                Err(e) => return Err(e),
            }
        }

        Ok((SourceBundle::from_optional(aligned), failures))
    }
}

/// Resampling with GDAL's warper on in-memory datasets
#[derive(Debug, Default, Clone, Copy)]
pub struct GdalWarpResampler;

impl Resampler for GdalWarpResampler {
    fn resample(&self, source: &Raster, reference: &GridSpec, kernel: ResampleKernel) -> MaskResult<Raster> {
        let source_grid = source.grid_spec()?;
        let fill = source.nodata.unwrap_or(DEFAULT_NODATA);
        let mem = Path::new("");

        let src_ds = create_dataset("MEM", mem, &source.filled(fill), &source_grid, Some(fill))?;
        let dst_ds = create_dataset(
            "MEM",
            mem,
            &Array2::from_elem(reference.dim(), fill),
            reference,
            Some(fill),
        )?;

        let rc = unsafe {
            gdal_sys::GDALReprojectImage(
                src_ds.c_dataset(),
                std::ptr::null(),
                dst_ds.c_dataset(),
                std::ptr::null(),
                kernel.to_gdal(),
                0.0,
                0.0,
                None,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };
        if rc != gdal_sys::CPLErr::CE_None {
            return Err(MaskError::GeometryMismatch(format!(
                "GDAL warp to reference grid failed (CPLErr {})",
                rc
            )));
        }

        let (rows, cols) = reference.dim();
        let band = dst_ds.rasterband(1)?;
        let buffer: Buffer<f64> = band.read_as::<f64>((0, 0), (cols, rows), (cols, rows), None)?;
        let data = Array2::from_shape_vec((rows, cols), buffer.data)
            .map_err(|e| MaskError::Processing(format!("Failed to reshape warped data: {}", e)))?;

        Ok(Raster::new(data, Some(reference.geo_transform), Some(reference.crs.clone()), Some(fill)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GeoTransform;
    use ndarray::array;
    use std::cell::Cell;

    fn grid(origin_x: f64, size: usize) -> GridSpec {
        GridSpec {
            rows: size,
            cols: size,
            geo_transform: GeoTransform::from_gdal(&[origin_x, 30.0, 0.0, 5_000_000.0, 0.0, -30.0]),
            crs: "EPSG:32610".to_string(),
        }
    }

    fn raster_on(grid: &GridSpec, value: f64) -> Raster {
        Raster::new(
            Array2::from_elem(grid.dim(), value),
            Some(grid.geo_transform),
            Some(grid.crs.clone()),
            Some(-1.0),
        )
    }

    /// Counts calls and answers with a constant raster of the requested shape
    struct CountingResampler {
        calls: Cell<usize>,
        wrong_shape: bool,
    }

    impl Resampler for CountingResampler {
        fn resample(&self, source: &Raster, reference: &GridSpec, _kernel: ResampleKernel) -> MaskResult<Raster> {
            self.calls.set(self.calls.get() + 1);
            let mut out = raster_on(reference, source.data[[0, 0]]);
            if self.wrong_shape {
                out.data = Array2::zeros((1, 1));
                out.valid = Array2::from_elem((1, 1), true);
            }
            Ok(out)
        }
    }

    fn counting(wrong_shape: bool) -> CountingResampler {
        CountingResampler { calls: Cell::new(0), wrong_shape }
    }

    #[test]
    fn test_on_grid_raster_returned_unchanged() {
        let reference = raster_on(&grid(500_000.0, 3), 1.0);
        let mut source = reference.clone();
        source.data = array![[1.0, 2.0, 3.0], [4.0, -1.0, 6.0], [7.0, 8.0, 9.0]];
        source.valid = source.data.mapv(|v| v != -1.0);

        let resampler = counting(false);
        let reconciler = GridReconciler::new(&resampler);
        let aligned = reconciler.reconcile(&source, &reference).unwrap();

        assert_eq!(aligned, source);
        assert_eq!(resampler.calls.get(), 0);
    }

    #[test]
    fn test_off_grid_raster_is_resampled() {
        let reference = raster_on(&grid(500_000.0, 3), 1.0);
        let source = raster_on(&grid(499_970.0, 5), 7.0);
        let resampler = counting(false);
        let aligned = GridReconciler::new(&resampler).reconcile(&source, &reference).unwrap();
        assert_eq!(resampler.calls.get(), 1);
        assert!(aligned.is_on_grid(&reference.grid_spec().unwrap()));
    }

    #[test]
    fn test_reconcile_all_aligns_every_source() {
        let reference = raster_on(&grid(500_000.0, 3), 1.0);
        let sources = vec![raster_on(&grid(500_000.0, 3), 2.0), raster_on(&grid(499_970.0, 5), 7.0)];
        let resampler = counting(false);
        let aligned = GridReconciler::new(&resampler).reconcile_all(&sources, &reference).unwrap();
        assert_eq!(aligned.len(), 2);
        assert_eq!(resampler.calls.get(), 1);
        assert!(aligned.iter().all(|r| r.is_on_grid(&reference.grid_spec().unwrap())));
    }

    #[test]
    fn test_missing_crs_is_fatal() {
        let reference = raster_on(&grid(500_000.0, 3), 1.0);
        let mut source = raster_on(&grid(499_970.0, 5), 7.0);
        source.crs = None;
        let resampler = counting(false);
        let err = GridReconciler::new(&resampler).reconcile(&source, &reference).unwrap_err();
        assert!(matches!(err, MaskError::Config(_)));
    }

    #[test]
    fn test_bundle_drops_optional_mismatch_and_aborts_on_required() {
        let reference = raster_on(&grid(500_000.0, 3), 1.0);
        let off_grid = raster_on(&grid(499_970.0, 5), 7.0);
        let on_grid = raster_on(&grid(500_000.0, 3), 2.0);
        let bundle = SourceBundle::from_optional(vec![
            (SourceKind::LandCover, Some(on_grid.clone())),
            (SourceKind::Reflectance, Some(off_grid.clone())),
        ]);

        let resampler = counting(true);
        let reconciler = GridReconciler::new(&resampler);
        let (aligned, failures) = reconciler
            .reconcile_bundle(bundle.clone(), &reference, &[SourceKind::LandCover])
            .unwrap();
        assert_eq!(aligned.kinds(), vec![SourceKind::LandCover]);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].source, SourceKind::Reflectance);

        let err = reconciler
            .reconcile_bundle(bundle, &reference, &[SourceKind::Reflectance])
            .unwrap_err();
        assert!(matches!(err, MaskError::GeometryMismatch(_)));
    }

    #[test]
    fn test_gdal_warp_constant_field() {
        // Source covers the reference with a margin; a constant field stays constant
        let reference = grid(500_000.0, 4);
        let source = raster_on(&grid(499_880.0, 12), 42.0);
        let aligned = GdalWarpResampler
            .resample(&source, &reference, ResampleKernel::CubicSpline)
            .unwrap();
        assert!(aligned.is_on_grid(&reference));
        assert_eq!(aligned.valid_count(), 16);
        for v in aligned.data.iter() {
            approx::assert_abs_diff_eq!(*v, 42.0, epsilon = 1e-6);
        }
    }
}
