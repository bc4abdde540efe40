use crate::core::select::{CoordinateTransformer, Footprint};
use crate::types::{MaskError, MaskResult};
use gdal::spatial_ref::{CoordTransform, SpatialRef};

/// Definition of geographic WGS84 coordinates (lon/lat order)
pub const WGS84: &str = "EPSG:4326";

/// GDAL/PROJ-backed footprint reprojection
#[derive(Debug, Default, Clone, Copy)]
pub struct GdalCoordinateTransformer;

impl GdalCoordinateTransformer {
    fn spatial_ref(definition: &str) -> MaskResult<SpatialRef> {
        #[allow(unused_mut)]
        let mut srs = SpatialRef::from_definition(definition).map_err(|e| {
            MaskError::Config(format!("Unrecognised coordinate reference system '{}': {}", definition, e))
        })?;
        // Keep x = easting/longitude regardless of the authority axis order
        srs.set_axis_mapping_strategy(gdal_sys::OSRAxisMappingStrategy::OAMS_TRADITIONAL_GIS_ORDER);
        Ok(srs)
    }
}

impl CoordinateTransformer for GdalCoordinateTransformer {
    fn reproject(&self, footprint: &Footprint, target_crs: &str) -> MaskResult<Footprint> {
        let source = Self::spatial_ref(&footprint.crs)?;
        let target = Self::spatial_ref(target_crs)?;
        let transform = CoordTransform::new(&source, &target)?;

        let points = footprint.exterior();
        let mut xs: Vec<f64> = points.iter().map(|p| p.0).collect();
        let mut ys: Vec<f64> = points.iter().map(|p| p.1).collect();
        let mut zs = vec![0.0; points.len()];
        transform.transform_coords(&mut xs, &mut ys, &mut zs)?;

        let moved: Vec<(f64, f64)> = xs.into_iter().zip(ys).collect();
        log::debug!("Reprojected footprint {:?} -> {:?}", points, moved);
        Ok(footprint.with_exterior(&moved, target_crs))
    }
}
