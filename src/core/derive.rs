use crate::core::select::LandCoverChoice;
use crate::types::{MaskError, MaskLayer, MaskResult, Observation, Raster, SourceKind};
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};

/// Exposed rock class of the regional land-cover product
pub const ROCK_CLASS: i64 = 31;
/// Perennial ice/snow class of the regional land-cover product
pub const ICE_CLASS: i64 = 12;

/// Vote of a fractional-snow-cover cell that has no valid observation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyCompositePolicy {
    /// Assume snow: the cell is excluded
    TreatAsCovered,
    /// Cast no vote: the cell stays usable for this source only
    Abstain,
}

impl Default for EmptyCompositePolicy {
    fn default() -> Self {
        EmptyCompositePolicy::TreatAsCovered
    }
}

/// Per-source threshold rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskThresholds {
    /// Land-cover classes counted as stable exposed surface
    pub rock_classes: Vec<i64>,
    /// Also accept the ice class
    pub include_ice: bool,
    pub ice_class: i64,
    /// Minimum bare-ground percentage (strictly exceeded)
    pub bare_ground_min_percent: f64,
    /// Maximum snow depth in meters
    pub snow_depth_max_m: f64,
    /// Factor from raw snow depth units to meters (mm -> m)
    pub snow_depth_scale: f64,
    /// Fractional snow cover percentage at which a cell counts as covered
    pub snow_cover_percent: f64,
    pub empty_composite: EmptyCompositePolicy,
    /// Maximum top-of-atmosphere reflectance (0-1)
    pub reflectance_max: f64,
}

impl Default for MaskThresholds {
    fn default() -> Self {
        Self {
            rock_classes: vec![ROCK_CLASS],
            include_ice: false,
            ice_class: ICE_CLASS,
            bare_ground_min_percent: 80.0,
            snow_depth_max_m: 0.2,
            snow_depth_scale: 0.001,
            snow_cover_percent: 50.0,
            empty_composite: EmptyCompositePolicy::default(),
            reflectance_max: 0.4,
        }
    }
}

impl MaskThresholds {
    pub fn validate(&self) -> MaskResult<()> {
        if !(0.0..=100.0).contains(&self.bare_ground_min_percent) {
            return Err(MaskError::Config(format!(
                "Invalid bare ground percentage: {}",
                self.bare_ground_min_percent
            )));
        }
        if !(0.0..=100.0).contains(&self.snow_cover_percent) {
            return Err(MaskError::Config(format!(
                "Invalid snow cover percentage: {}",
                self.snow_cover_percent
            )));
        }
        if !self.snow_depth_max_m.is_finite() || self.snow_depth_max_m < 0.0 {
            return Err(MaskError::Config(format!("Invalid maximum snow depth: {}", self.snow_depth_max_m)));
        }
        if !self.snow_depth_scale.is_finite() || self.snow_depth_scale <= 0.0 {
            return Err(MaskError::Config(format!("Invalid snow depth scale: {}", self.snow_depth_scale)));
        }
        if !self.reflectance_max.is_finite() {
            return Err(MaskError::Config(format!("Invalid reflectance threshold: {}", self.reflectance_max)));
        }
        if self.rock_classes.is_empty() && !self.include_ice {
            return Err(MaskError::Config("No land-cover classes accepted".to_string()));
        }
        Ok(())
    }

    fn accepted_classes(&self) -> Vec<i64> {
        let mut classes = self.rock_classes.clone();
        if self.include_ice && !classes.contains(&self.ice_class) {
            classes.push(self.ice_class);
        }
        classes
    }
}

/// Converts aligned source rasters into per-source validity masks
#[derive(Debug, Clone)]
pub struct MaskDeriver {
    thresholds: MaskThresholds,
}

impl MaskDeriver {
    pub fn new(thresholds: MaskThresholds) -> MaskResult<Self> {
        thresholds.validate()?;
        Ok(Self { thresholds })
    }

    pub fn thresholds(&self) -> &MaskThresholds {
        &self.thresholds
    }

    /// Exposed rock (optionally ice) from the regional class map
    pub fn rock_mask(&self, land_cover: &Raster, glaciers: Option<&Array2<bool>>) -> MaskResult<MaskLayer> {
        let classes = self.thresholds.accepted_classes();
        log::info!("Isolating land-cover classes {:?}", classes);
        let mask = threshold(land_cover, |v| classes.contains(&(v.round() as i64)));
        suppress_glaciers(MaskLayer::new(SourceKind::LandCover, mask), glaciers)
    }

    /// Bare ground strictly above the configured percentage
    pub fn bare_ground_mask(&self, bare_ground: &Raster, glaciers: Option<&Array2<bool>>) -> MaskResult<MaskLayer> {
        let min_percent = self.thresholds.bare_ground_min_percent;
        log::info!("Masking pixels with <{:.1}% bare ground", min_percent);
        // Out-of-range percentages are missing data, not ground
        let mask = threshold(bare_ground, |v| (0.0..=100.0).contains(&v) && v > min_percent);
        suppress_glaciers(MaskLayer::new(SourceKind::LandCover, mask), glaciers)
    }

    pub fn land_cover_mask(
        &self,
        choice: LandCoverChoice,
        land_cover: &Raster,
        glaciers: Option<&Array2<bool>>,
    ) -> MaskResult<MaskLayer> {
        match choice {
            LandCoverChoice::Primary => self.rock_mask(land_cover, glaciers),
            LandCoverChoice::Fallback => self.bare_ground_mask(land_cover, glaciers),
        }
    }

    /// Depth in meters and the shallow-snow mask
    pub fn snow_depth_mask(&self, raw_depth: &Raster) -> (Raster, MaskLayer) {
        let scale = self.thresholds.snow_depth_scale;
        let max_depth = self.thresholds.snow_depth_max_m;
        let depth_m = raw_depth.map_valid(|v| v * scale);
        let mask = threshold(&depth_m, |d| d <= max_depth);
        (depth_m, MaskLayer::new(SourceKind::SnowDepth, mask))
    }

    /// Snow-free cells from a composite median or a single-date view:
    /// covered = percent >= threshold, mask = not covered.
    pub fn snow_cover_mask(&self, percent: &Array2<Observation>) -> MaskLayer {
        let limit = self.thresholds.snow_cover_percent;
        let empty_vote = match self.thresholds.empty_composite {
            EmptyCompositePolicy::TreatAsCovered => false,
            EmptyCompositePolicy::Abstain => true,
        };
        let mask = percent.mapv(|cell| match cell {
            Observation::Value(v) => v < limit,
            Observation::Invalid | Observation::NoData => empty_vote,
        });
        MaskLayer::new(SourceKind::FractionalSnowCover, mask)
    }

    /// Dark (snow-free) cells from top-of-atmosphere reflectance
    pub fn reflectance_mask(&self, reflectance: &Raster) -> MaskLayer {
        let max = self.thresholds.reflectance_max;
        MaskLayer::new(SourceKind::Reflectance, threshold(reflectance, |v| v <= max))
    }
}

/// Apply `rule` to valid cells; no-data cells are always excluded
fn threshold<F>(raster: &Raster, rule: F) -> Array2<bool>
where
    F: Fn(f64) -> bool,
{
    Zip::from(&raster.data)
        .and(&raster.valid)
        .map_collect(|&v, &ok| ok && rule(v))
}

/// Force cells inside glacier outlines to invalid
pub fn suppress_glaciers(layer: MaskLayer, glaciers: Option<&Array2<bool>>) -> MaskResult<MaskLayer> {
    let glaciers = match glaciers {
        Some(glaciers) => glaciers,
        None => return Ok(layer),
    };
    if glaciers.dim() != layer.dim() {
        return Err(MaskError::GeometryMismatch(format!(
            "Glacier mask {:?} does not match {} mask {:?}",
            glaciers.dim(),
            layer.source,
            layer.dim()
        )));
    }
    let mask = Zip::from(&layer.mask).and(glaciers).map_collect(|&ok, &ice| ok && !ice);
    Ok(MaskLayer::new(layer.source, mask))
}
