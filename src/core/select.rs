use crate::types::{BoundingBox, GridSpec, MaskError, MaskResult, Raster};
use geo::{Contains, Coord, LineString, Polygon};
use serde::{Deserialize, Serialize};

/// Which land-cover product classifies the DEM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LandCoverChoice {
    /// Regional class map (exposed rock/ice classes)
    Primary,
    /// Global bare-ground percentage
    Fallback,
}

impl std::fmt::Display for LandCoverChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LandCoverChoice::Primary => write!(f, "primary"),
            LandCoverChoice::Fallback => write!(f, "fallback"),
        }
    }
}

/// Polygon outline of a raster or a product's coverage, tagged with its CRS
#[derive(Debug, Clone, PartialEq)]
pub struct Footprint {
    pub polygon: Polygon<f64>,
    pub crs: String,
}

impl Footprint {
    pub fn new(polygon: Polygon<f64>, crs: impl Into<String>) -> Self {
        Self { polygon, crs: crs.into() }
    }

    /// Axis-aligned rectangle
    pub fn from_bounds(bbox: &BoundingBox, crs: impl Into<String>) -> Self {
        let ring = vec![
            (bbox.min_x, bbox.min_y),
            (bbox.max_x, bbox.min_y),
            (bbox.max_x, bbox.max_y),
            (bbox.min_x, bbox.max_y),
            (bbox.min_x, bbox.min_y),
        ];
        Self::new(Polygon::new(LineString::from(ring), vec![]), crs)
    }

    /// Four-corner outline of a georeferenced raster
    pub fn from_raster(raster: &Raster) -> MaskResult<Self> {
        Ok(Self::from_grid(&raster.grid_spec()?))
    }

    pub fn from_grid(grid: &GridSpec) -> Self {
        let mut ring: Vec<(f64, f64)> = grid.geo_transform.corners(grid.rows, grid.cols).to_vec();
        ring.push(ring[0]);
        Self::new(Polygon::new(LineString::from(ring), vec![]), grid.crs.clone())
    }

    pub fn exterior(&self) -> Vec<(f64, f64)> {
        self.polygon.exterior().coords().map(|c| (c.x, c.y)).collect()
    }

    /// Same outline with every exterior vertex replaced
    pub fn with_exterior(&self, points: &[(f64, f64)], crs: impl Into<String>) -> Self {
        let ring: Vec<Coord<f64>> = points.iter().map(|&(x, y)| Coord { x, y }).collect();
        Self::new(Polygon::new(LineString::new(ring), vec![]), crs)
    }

    pub fn bounds(&self) -> MaskResult<BoundingBox> {
        BoundingBox::from_points(&self.exterior())
            .ok_or_else(|| MaskError::InvalidInput("Footprint has no vertices".to_string()))
    }
}

/// Geometry collaborator: moves footprints between coordinate systems
pub trait CoordinateTransformer {
    fn reproject(&self, footprint: &Footprint, target_crs: &str) -> MaskResult<Footprint>;
}

/// Pick the primary land-cover product only when its coverage fully contains
/// the DEM footprint. Touching or partially overlapping footprints resolve to
/// the fallback product.
pub fn select_land_cover(
    dem_footprint: &Footprint,
    primary_coverage: &Footprint,
    transformer: &dyn CoordinateTransformer,
) -> MaskResult<LandCoverChoice> {
    let footprint = if dem_footprint.crs == primary_coverage.crs {
        dem_footprint.clone()
    } else {
        transformer.reproject(dem_footprint, &primary_coverage.crs)?
    };

    let choice = if primary_coverage.polygon.contains(&footprint.polygon) {
        LandCoverChoice::Primary
    } else {
        LandCoverChoice::Fallback
    };

    match choice {
        LandCoverChoice::Primary => log::info!("DEM footprint inside primary land-cover coverage"),
        LandCoverChoice::Fallback => {
            log::info!("DEM footprint not fully covered by primary land cover, using bare-ground fallback")
        }
    }
    Ok(choice)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GeoTransform;
    use ndarray::Array2;

    /// Only same-CRS inputs are expected in these tests
    struct NoReprojection;

    impl CoordinateTransformer for NoReprojection {
        fn reproject(&self, _footprint: &Footprint, target_crs: &str) -> MaskResult<Footprint> {
            Err(MaskError::Processing(format!("unexpected reprojection to {}", target_crs)))
        }
    }

    /// Shifts x by a fixed offset, standing in for a CRS change
    struct ShiftX(f64);

    impl CoordinateTransformer for ShiftX {
        fn reproject(&self, footprint: &Footprint, target_crs: &str) -> MaskResult<Footprint> {
            let moved: Vec<(f64, f64)> = footprint.exterior().iter().map(|&(x, y)| (x + self.0, y)).collect();
            Ok(footprint.with_exterior(&moved, target_crs))
        }
    }

    fn bbox_fp(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Footprint {
        Footprint::from_bounds(&BoundingBox::new(min_x, min_y, max_x, max_y), "EPSG:5070")
    }

    #[test]
    fn test_contained_footprint_selects_primary() {
        let coverage = bbox_fp(0.0, 0.0, 100.0, 100.0);
        let dem = bbox_fp(10.0, 10.0, 20.0, 20.0);
        assert_eq!(select_land_cover(&dem, &coverage, &NoReprojection).unwrap(), LandCoverChoice::Primary);
    }

    #[test]
    fn test_partial_overlap_selects_fallback() {
        let coverage = bbox_fp(0.0, 0.0, 100.0, 100.0);
        let dem = bbox_fp(95.0, 95.0, 105.0, 105.0);
        assert_eq!(select_land_cover(&dem, &coverage, &NoReprojection).unwrap(), LandCoverChoice::Fallback);
    }

    #[test]
    fn test_disjoint_footprint_selects_fallback() {
        let coverage = bbox_fp(0.0, 0.0, 100.0, 100.0);
        let dem = bbox_fp(200.0, 200.0, 210.0, 210.0);
        assert_eq!(select_land_cover(&dem, &coverage, &NoReprojection).unwrap(), LandCoverChoice::Fallback);
    }

    #[test]
    fn test_footprint_reprojected_before_containment() {
        let coverage = bbox_fp(0.0, 0.0, 100.0, 100.0);
        // Outside in its own CRS, inside once shifted into the coverage CRS
        let dem = Footprint::from_bounds(&BoundingBox::new(-50.0, 10.0, -40.0, 20.0), "EPSG:4326");
        assert_eq!(select_land_cover(&dem, &coverage, &ShiftX(60.0)).unwrap(), LandCoverChoice::Primary);
        assert_eq!(select_land_cover(&dem, &coverage, &ShiftX(0.0)).unwrap(), LandCoverChoice::Fallback);
    }

    #[test]
    fn test_footprint_from_raster_corners() {
        let raster = Raster::new(
            Array2::zeros((10, 20)),
            Some(GeoTransform::from_gdal(&[10.0, 0.5, 0.0, 20.0, 0.0, -1.0])),
            Some("EPSG:5070".to_string()),
            None,
        );
        let fp = Footprint::from_raster(&raster).unwrap();
        assert_eq!(fp.bounds().unwrap(), BoundingBox::new(10.0, 10.0, 20.0, 20.0));
        let coverage = bbox_fp(0.0, 0.0, 100.0, 100.0);
        assert_eq!(select_land_cover(&fp, &coverage, &NoReprojection).unwrap(), LandCoverChoice::Primary);
    }
}
