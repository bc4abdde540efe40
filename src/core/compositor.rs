use crate::types::{MaskError, MaskLayer, MaskResult, Raster, DEFAULT_NODATA};
use ndarray::{Array2, Zip};

/// Final control-surface product of one DEM
#[derive(Debug, Clone)]
pub struct ControlSurface {
    /// Cells usable as control surface
    pub final_mask: Array2<bool>,
    /// DEM with every excluded cell set to no-data
    pub masked_dem: Raster,
    /// Every per-source layer that contributed, in input order
    pub layers: Vec<MaskLayer>,
    /// Valid DEM cells before any source mask
    pub dem_valid_cells: usize,
    pub valid_cells: usize,
}

impl ControlSurface {
    pub fn layer(&self, source: crate::types::SourceKind) -> Option<&MaskLayer> {
        self.layers.iter().find(|l| l.source == source)
    }

    /// Fraction of valid DEM cells retained
    pub fn retained_fraction(&self) -> f64 {
        if self.dem_valid_cells == 0 {
            0.0
        } else {
            self.valid_cells as f64 / self.dem_valid_cells as f64
        }
    }
}

/// AND fan-in of per-source layers over DEM validity
#[derive(Debug, Default, Clone, Copy)]
pub struct MaskCompositor;

impl MaskCompositor {
    pub fn new() -> Self {
        Self
    }

    /// DEM validity: finite and not equal to the DEM's no-data value
    pub fn dem_validity(dem: &Raster) -> Array2<bool> {
        dem.valid.clone()
    }

    /// AND every layer into the DEM validity. Layer order does not matter.
    pub fn combine(&self, dem: &Raster, layers: Vec<MaskLayer>) -> MaskResult<ControlSurface> {
        let mut final_mask = Self::dem_validity(dem);
        let dem_valid_cells = final_mask.iter().filter(|&&v| v).count();
        log::info!("DEM has {} valid cells", dem_valid_cells);

        for layer in &layers {
            if layer.dim() != dem.dim() {
                return Err(MaskError::GeometryMismatch(format!(
                    "{} mask {:?} does not match DEM {:?}",
                    layer.source,
                    layer.dim(),
                    dem.dim()
                )));
            }
            Zip::from(&mut final_mask).and(&layer.mask).for_each(|acc, &ok| *acc = *acc && ok);
            log::debug!("After {} mask: {} valid cells", layer.source, final_mask.iter().filter(|&&v| v).count());
        }

        let valid_cells = final_mask.iter().filter(|&&v| v).count();
        let masked_dem = Self::apply(dem, &final_mask)?;
        log::info!(
            "Control surface retains {}/{} valid DEM cells",
            valid_cells,
            dem_valid_cells
        );

        Ok(ControlSurface { final_mask, masked_dem, layers, dem_valid_cells, valid_cells })
    }

    /// Copy of `dem` with mask-false cells set to no-data
    pub fn apply(dem: &Raster, mask: &Array2<bool>) -> MaskResult<Raster> {
        if mask.dim() != dem.dim() {
            return Err(MaskError::GeometryMismatch(format!(
                "Mask {:?} does not match DEM {:?}",
                mask.dim(),
                dem.dim()
            )));
        }
        let fill = dem.nodata.unwrap_or(DEFAULT_NODATA);
        let data = Zip::from(&dem.data).and(mask).map_collect(|&v, &keep| if keep { v } else { fill });
        Ok(Raster {
            data,
            valid: mask.clone(),
            geo_transform: dem.geo_transform,
            crs: dem.crs.clone(),
            nodata: Some(fill),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SourceKind;
    use ndarray::array;

    fn dem() -> Raster {
        Raster::new(array![[100.0, 200.0, -9999.0], [300.0, 400.0, 500.0]], None, None, Some(-9999.0))
    }

    fn layer(source: SourceKind, mask: Array2<bool>) -> MaskLayer {
        MaskLayer::new(source, mask)
    }

    #[test]
    fn test_dem_nodata_is_never_valid() {
        let all_true = layer(SourceKind::LandCover, Array2::from_elem((2, 3), true));
        let surface = MaskCompositor.combine(&dem(), vec![all_true]).unwrap();
        assert!(!surface.final_mask[[0, 2]]);
        assert_eq!(surface.dem_valid_cells, 5);
        assert_eq!(surface.valid_cells, 5);
    }

    #[test]
    fn test_combine_is_order_independent() {
        let a = layer(SourceKind::LandCover, array![[true, true, true], [false, true, true]]);
        let b = layer(SourceKind::Reflectance, array![[true, false, true], [true, true, false]]);
        let ab = MaskCompositor.combine(&dem(), vec![a.clone(), b.clone()]).unwrap();
        let ba = MaskCompositor.combine(&dem(), vec![b, a]).unwrap();
        assert_eq!(ab.final_mask, ba.final_mask);
        assert_eq!(ab.final_mask, array![[true, false, false], [false, true, false]]);
    }

    #[test]
    fn test_adding_layer_never_increases_valid_cells() {
        let a = layer(SourceKind::LandCover, array![[true, true, true], [true, false, true]]);
        let b = layer(SourceKind::SnowDepth, array![[true, false, true], [true, true, true]]);
        let one = MaskCompositor.combine(&dem(), vec![a.clone()]).unwrap();
        let two = MaskCompositor.combine(&dem(), vec![a, b]).unwrap();
        assert!(two.valid_cells <= one.valid_cells);
        assert_eq!(two.layers.len(), 2);
        assert!(two.layer(SourceKind::SnowDepth).is_some());
    }

    #[test]
    fn test_masked_dem_fill() {
        let a = layer(SourceKind::LandCover, array![[false, true, true], [true, true, true]]);
        let surface = MaskCompositor.combine(&dem(), vec![a]).unwrap();
        assert_eq!(surface.masked_dem.data[[0, 0]], -9999.0);
        assert_eq!(surface.masked_dem.data[[0, 1]], 200.0);
        assert_eq!(surface.masked_dem.valid_count(), 4);

        let mut no_nodata = dem();
        no_nodata.nodata = None;
        let masked = MaskCompositor::apply(&no_nodata, &Array2::from_elem((2, 3), false)).unwrap();
        assert!(masked.data.iter().all(|&v| v == DEFAULT_NODATA));
    }

    #[test]
    fn test_shape_mismatch() {
        let wrong = layer(SourceKind::LandCover, Array2::from_elem((3, 3), true));
        let err = MaskCompositor.combine(&dem(), vec![wrong]).unwrap_err();
        assert!(matches!(err, MaskError::GeometryMismatch(_)));
    }

    #[test]
    fn test_no_layers_is_dem_validity() {
        let surface = MaskCompositor.combine(&dem(), Vec::new()).unwrap();
        assert_eq!(surface.final_mask, MaskCompositor::dem_validity(&dem()));
        approx::assert_abs_diff_eq!(surface.retained_fraction(), 1.0);
    }
}
