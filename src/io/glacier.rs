use crate::types::{GridSpec, MaskResult};
use gdal::spatial_ref::{CoordTransform, SpatialRef};
use gdal::vector::LayerAccess;
use gdal::Dataset;
use geo::{BoundingRect, Contains, Geometry, Point, Polygon, Rect};
use ndarray::{Array2, Zip};
use std::path::Path;

/// Vector rasterizer collaborator for glacier / perennial snow outlines
pub trait GlacierRasterizer {
    /// `true` where a cell centre falls inside any outline polygon
    fn rasterize(&self, outlines: &Path, grid: &GridSpec) -> MaskResult<Array2<bool>>;
}

/// Reads outline polygons with OGR and burns them onto the reference grid
#[derive(Debug, Default, Clone, Copy)]
pub struct OgrGlacierRasterizer;

impl GlacierRasterizer for OgrGlacierRasterizer {
    fn rasterize(&self, outlines: &Path, grid: &GridSpec) -> MaskResult<Array2<bool>> {
        log::info!("Masking glaciers from {}", outlines.display());
        let polygons = read_outline_polygons(outlines, &grid.crs)?;
        log::debug!("Loaded {} outline polygons", polygons.len());
        Ok(rasterize_polygons(&polygons, grid))
    }
}

/// Load every polygon of the first layer, reprojected into `target_crs`
pub fn read_outline_polygons(path: &Path, target_crs: &str) -> MaskResult<Vec<Polygon<f64>>> {
    let dataset = Dataset::open(path)?;
    let mut layer = dataset.layer(0)?;

    let transform = match layer.spatial_ref() {
        #[allow(unused_mut)]
        Some(mut layer_srs) => {
            #[allow(unused_mut)]
            let mut target = SpatialRef::from_definition(target_crs)?;
            layer_srs.set_axis_mapping_strategy(gdal_sys::OSRAxisMappingStrategy::OAMS_TRADITIONAL_GIS_ORDER);
            target.set_axis_mapping_strategy(gdal_sys::OSRAxisMappingStrategy::OAMS_TRADITIONAL_GIS_ORDER);
            Some(CoordTransform::new(&layer_srs, &target)?)
        }
        None => {
            log::warn!("Outline layer has no spatial reference, assuming grid CRS");
            None
        }
    };

    let mut polygons = Vec::new();
    for feature in layer.features() {
        let geometry = match feature.geometry_by_index(0) {
            Ok(geometry) => geometry,
            Err(_) => continue,
        };
        let geometry = match &transform {
            Some(transform) => geometry.transform(transform)?.to_geo()?,
            None => geometry.to_geo()?,
        };
        collect_polygons(geometry, &mut polygons);
    }
    Ok(polygons)
}

fn collect_polygons(geometry: Geometry<f64>, out: &mut Vec<Polygon<f64>>) {
    match geometry {
        Geometry::Polygon(polygon) => out.push(polygon),
        Geometry::MultiPolygon(multi) => out.extend(multi.0),
        Geometry::GeometryCollection(collection) => {
            for inner in collection.0 {
                collect_polygons(inner, out);
            }
        }
        _ => {}
    }
}

/// Burn polygons onto a grid by cell-centre containment
pub fn rasterize_polygons(polygons: &[Polygon<f64>], grid: &GridSpec) -> Array2<bool> {
    let indexed: Vec<(Rect<f64>, &Polygon<f64>)> = polygons
        .iter()
        .filter_map(|p| p.bounding_rect().map(|rect| (rect, p)))
        .collect();

    let mut burned = Array2::from_elem(grid.dim(), false);
    if indexed.is_empty() {
        return burned;
    }

    let gt = grid.geo_transform;
    let burn = |(row, col): (usize, usize), cell: &mut bool| {
        let (x, y) = gt.pixel_center(row, col);
        *cell = indexed.iter().any(|(rect, polygon)| {
            x >= rect.min().x
                && x <= rect.max().x
                && y >= rect.min().y
                && y <= rect.max().y
                && polygon.contains(&Point::new(x, y))
        });
    };

    #[cfg(feature = "parallel")]
    Zip::indexed(&mut burned).par_for_each(burn);
    #[cfg(not(feature = "parallel"))]
    Zip::indexed(&mut burned).for_each(burn);

    burned
}
