use chrono::NaiveDate;
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};

/// Fill value used when a raster without a declared no-data value has to be
/// written or warped with gaps.
pub const DEFAULT_NODATA: f64 = -9999.0;

/// No-data value of written min/max/median composites. Fractional snow cover
/// lies in [0, 100], so 0 stays a real observation.
pub const COMPOSITE_NODATA: f64 = 255.0;

/// Geospatial bounding box in the units of its CRS
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self { min_x, min_y, max_x, max_y }
    }

    /// Smallest box enclosing all points
    pub fn from_points(points: &[(f64, f64)]) -> Option<Self> {
        let (first, rest) = points.split_first()?;
        let mut bbox = Self::new(first.0, first.1, first.0, first.1);
        for &(x, y) in rest {
            bbox.min_x = bbox.min_x.min(x);
            bbox.min_y = bbox.min_y.min(y);
            bbox.max_x = bbox.max_x.max(x);
            bbox.max_y = bbox.max_y.max(y);
        }
        Some(bbox)
    }
}

/// Geospatial transformation parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// Build from the GDAL coefficient order
    pub fn from_gdal(gt: &[f64; 6]) -> Self {
        Self {
            top_left_x: gt[0],
            pixel_width: gt[1],
            rotation_x: gt[2],
            top_left_y: gt[3],
            rotation_y: gt[4],
            pixel_height: gt[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }

    /// Georeferenced coordinate of a fractional pixel position (col, row)
    pub fn apply(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.top_left_x + col * self.pixel_width + row * self.rotation_x,
            self.top_left_y + col * self.rotation_y + row * self.pixel_height,
        )
    }

    /// Coordinate of the centre of pixel (row, col)
    pub fn pixel_center(&self, row: usize, col: usize) -> (f64, f64) {
        self.apply(col as f64 + 0.5, row as f64 + 0.5)
    }

    /// Corner coordinates of a rows x cols grid, clockwise from the origin
    pub fn corners(&self, rows: usize, cols: usize) -> [(f64, f64); 4] {
        let (r, c) = (rows as f64, cols as f64);
        [
            self.apply(0.0, 0.0),
            self.apply(c, 0.0),
            self.apply(c, r),
            self.apply(0.0, r),
        ]
    }
}

/// Identity of a raster grid: shape, geotransform and CRS
#[derive(Debug, Clone, PartialEq)]
pub struct GridSpec {
    pub rows: usize,
    pub cols: usize,
    pub geo_transform: GeoTransform,
    pub crs: String,
}

impl GridSpec {
    pub fn dim(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn bounds(&self) -> BoundingBox {
        let corners = self.geo_transform.corners(self.rows, self.cols);
        // Four corners always yield a box
        BoundingBox::from_points(&corners).unwrap_or(BoundingBox::new(0.0, 0.0, 0.0, 0.0))
    }
}

/// Single-band georeferenced raster with per-cell validity
///
/// `valid[[r, c]] == false` marks a no-data cell; its entry in `data` carries
/// no meaning.
#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    pub data: Array2<f64>,
    pub valid: Array2<bool>,
    pub geo_transform: Option<GeoTransform>,
    pub crs: Option<String>,
    pub nodata: Option<f64>,
}

impl Raster {
    /// Create a raster, deriving validity from the no-data value and finiteness
    pub fn new(
        data: Array2<f64>,
        geo_transform: Option<GeoTransform>,
        crs: Option<String>,
        nodata: Option<f64>,
    ) -> Self {
        let valid = data.mapv(|v| v.is_finite() && nodata.map_or(true, |nd| v != nd));
        Self { data, valid, geo_transform, crs, nodata }
    }

    /// Create a raster with an explicit validity grid
    pub fn with_validity(
        data: Array2<f64>,
        valid: Array2<bool>,
        geo_transform: Option<GeoTransform>,
        crs: Option<String>,
        nodata: Option<f64>,
    ) -> MaskResult<Self> {
        if data.dim() != valid.dim() {
            return Err(MaskError::InvalidInput(format!(
                "Validity grid {:?} does not match data grid {:?}",
                valid.dim(),
                data.dim()
            )));
        }
        Ok(Self { data, valid, geo_transform, crs, nodata })
    }

    pub fn dim(&self) -> (usize, usize) {
        self.data.dim()
    }

    /// Value at (row, col), `None` for no-data or out of range
    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        match self.valid.get((row, col)) {
            Some(true) => self.data.get((row, col)).copied(),
            _ => None,
        }
    }

    /// Grid identity; a raster without CRS or geotransform cannot be placed
    pub fn grid_spec(&self) -> MaskResult<GridSpec> {
        let geo_transform = self.geo_transform.ok_or_else(|| {
            MaskError::Config("Raster has no geotransform".to_string())
        })?;
        let crs = self
            .crs
            .as_ref()
            .filter(|crs| !crs.trim().is_empty())
            .ok_or_else(|| MaskError::Config("Raster has no coordinate reference system".to_string()))?;
        let (rows, cols) = self.dim();
        Ok(GridSpec { rows, cols, geo_transform, crs: crs.clone() })
    }

    pub fn is_on_grid(&self, grid: &GridSpec) -> bool {
        self.grid_spec().map_or(false, |own| own == *grid)
    }

    pub fn valid_count(&self) -> usize {
        self.valid.iter().filter(|&&v| v).count()
    }

    /// Data with every invalid cell replaced by `fill`
    pub fn filled(&self, fill: f64) -> Array2<f64> {
        let mut out = self.data.clone();
        Zip::from(&mut out).and(&self.valid).for_each(|v, &ok| {
            if !ok {
                *v = fill;
            }
        });
        out
    }

    /// New raster on the same grid with `f` applied to valid cells
    pub fn map_valid<F>(&self, f: F) -> Raster
    where
        F: Fn(f64) -> f64,
    {
        let data = Zip::from(&self.data)
            .and(&self.valid)
            .map_collect(|&v, &ok| if ok { f(v) } else { v });
        Raster {
            data,
            valid: self.valid.clone(),
            geo_transform: self.geo_transform,
            crs: self.crs.clone(),
            nodata: self.nodata,
        }
    }

    /// Empty raster (all no-data) on a grid
    pub fn empty_on(grid: &GridSpec, nodata: f64) -> Raster {
        Raster {
            data: Array2::from_elem(grid.dim(), nodata),
            valid: Array2::from_elem(grid.dim(), false),
            geo_transform: Some(grid.geo_transform),
            crs: Some(grid.crs.clone()),
            nodata: Some(nodata),
        }
    }
}

/// Input sources that can vote on the final mask, in declared order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    LandCover,
    SnowDepth,
    FractionalSnowCover,
    Reflectance,
}

impl SourceKind {
    pub const ALL: [SourceKind; 4] = [
        SourceKind::LandCover,
        SourceKind::SnowDepth,
        SourceKind::FractionalSnowCover,
        SourceKind::Reflectance,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SourceKind::LandCover => "land-cover",
            SourceKind::SnowDepth => "snow-depth",
            SourceKind::FractionalSnowCover => "fractional-snow-cover",
            SourceKind::Reflectance => "reflectance",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Boolean validity grid produced by one source (`true` = usable surface)
#[derive(Debug, Clone, PartialEq)]
pub struct MaskLayer {
    pub source: SourceKind,
    pub mask: Array2<bool>,
}

impl MaskLayer {
    pub fn new(source: SourceKind, mask: Array2<bool>) -> Self {
        Self { source, mask }
    }

    pub fn dim(&self) -> (usize, usize) {
        self.mask.dim()
    }

    pub fn valid_count(&self) -> usize {
        self.mask.iter().filter(|&&v| v).count()
    }

    /// 1/0 raster on the given grid for writing
    pub fn to_raster(&self, grid: &GridSpec) -> Raster {
        bool_raster(&self.mask, grid)
    }
}

/// 1/0 raster from a boolean grid, every cell valid
pub fn bool_raster(mask: &Array2<bool>, grid: &GridSpec) -> Raster {
    Raster {
        data: mask.mapv(|v| if v { 1.0 } else { 0.0 }),
        valid: Array2::from_elem(mask.dim(), true),
        geo_transform: Some(grid.geo_transform),
        crs: Some(grid.crs.clone()),
        nodata: None,
    }
}

/// Ordered collection of the sources present for one DEM run
#[derive(Debug, Clone, Default)]
pub struct SourceBundle {
    entries: Vec<(SourceKind, Raster)>,
}

impl SourceBundle {
    /// Keep only the entries that carry a raster, sorted in declared order.
    /// A later duplicate of a kind replaces the earlier one.
    pub fn from_optional<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (SourceKind, Option<Raster>)>,
    {
        let mut present: Vec<(SourceKind, Raster)> = Vec::new();
        for (kind, raster) in entries {
            if let Some(raster) = raster {
                present.retain(|(k, _)| *k != kind);
                present.push((kind, raster));
            }
        }
        present.sort_by_key(|(kind, _)| *kind);
        Self { entries: present }
    }

    pub fn get(&self, kind: SourceKind) -> Option<&Raster> {
        self.entries.iter().find(|(k, _)| *k == kind).map(|(_, r)| r)
    }

    pub fn contains(&self, kind: SourceKind) -> bool {
        self.get(kind).is_some()
    }

    pub fn kinds(&self) -> Vec<SourceKind> {
        self.entries.iter().map(|(k, _)| *k).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SourceKind, &Raster)> {
        self.entries.iter().map(|(k, r)| (*k, r))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_entries(self) -> Vec<(SourceKind, Raster)> {
        self.entries
    }
}

/// Per-cell state of a noisy observation
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Observation {
    /// Usable measurement
    Value(f64),
    /// Something was observed but outside the physical range (cloud, fill code)
    Invalid,
    /// Nothing observed
    NoData,
}

impl Observation {
    pub fn value(&self) -> Option<f64> {
        match self {
            Observation::Value(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_value(&self) -> bool {
        matches!(self, Observation::Value(_))
    }
}

/// One date's mosaic of a temporally noisy source
#[derive(Debug, Clone)]
pub struct DailyMosaic {
    pub date: NaiveDate,
    pub cells: Array2<Observation>,
    pub tiles_used: usize,
}

/// Date-ordered mosaics on one grid
#[derive(Debug, Clone)]
pub struct TemporalSeries {
    pub grid: GridSpec,
    days: Vec<DailyMosaic>,
}

impl TemporalSeries {
    pub fn new(grid: GridSpec) -> Self {
        Self { grid, days: Vec::new() }
    }

    /// Insert a mosaic keeping date order
    pub fn push(&mut self, day: DailyMosaic) -> MaskResult<()> {
        if day.cells.dim() != self.grid.dim() {
            return Err(MaskError::GeometryMismatch(format!(
                "Mosaic for {} is {:?}, series grid is {:?}",
                day.date,
                day.cells.dim(),
                self.grid.dim()
            )));
        }
        let at = self.days.partition_point(|d| d.date <= day.date);
        self.days.insert(at, day);
        Ok(())
    }

    pub fn days(&self) -> &[DailyMosaic] {
        &self.days
    }

    pub fn len(&self) -> usize {
        self.days.len()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }
}

/// Named statistic of a temporal composite
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Statistic {
    Count,
    Min,
    Max,
    Median,
}

impl Statistic {
    pub fn suffix(&self) -> &'static str {
        match self {
            Statistic::Count => "count",
            Statistic::Min => "min",
            Statistic::Max => "max",
            Statistic::Median => "med",
        }
    }
}

/// Per-cell count/min/max/median of a temporal series
#[derive(Debug, Clone)]
pub struct CompositeStats {
    pub count: Array2<u32>,
    pub min: Array2<Observation>,
    pub max: Array2<Observation>,
    pub median: Array2<Observation>,
    pub dates: Vec<NaiveDate>,
    pub grid: GridSpec,
}

impl CompositeStats {
    /// Number of dates that contributed at least one tile
    pub fn dates_used(&self) -> usize {
        self.dates.len()
    }

    /// Written form of a statistic. Cells without an observation are flagged
    /// invalid and written as 0 for the count, `COMPOSITE_NODATA` otherwise.
    pub fn to_raster(&self, stat: Statistic) -> Raster {
        let (data, valid, nodata) = match stat {
            Statistic::Count => (
                self.count.mapv(|n| n as f64),
                self.count.mapv(|n| n > 0),
                0.0,
            ),
            Statistic::Min => observation_grid(&self.min),
            Statistic::Max => observation_grid(&self.max),
            Statistic::Median => observation_grid(&self.median),
        };
        Raster {
            data,
            valid,
            geo_transform: Some(self.grid.geo_transform),
            crs: Some(self.grid.crs.clone()),
            nodata: Some(nodata),
        }
    }
}

fn observation_grid(cells: &Array2<Observation>) -> (Array2<f64>, Array2<bool>, f64) {
    (
        cells.mapv(|o| o.value().unwrap_or(COMPOSITE_NODATA)),
        cells.mapv(|o| o.is_value()),
        COMPOSITE_NODATA,
    )
}

/// Error types for control surface processing
#[derive(Debug, thiserror::Error)]
pub enum MaskError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Geometry mismatch: {0}")]
    GeometryMismatch(String),

    #[error("Source unavailable: {0}")]
    Unavailable(String),

    #[error("Fetch error: {0}")]
    Fetch(String),

    #[error("Processing error: {0}")]
    Processing(String),
}

impl MaskError {
    /// Gaps in data availability; the run continues without the date or source
    pub fn is_recoverable(&self) -> bool {
        matches!(self, MaskError::Unavailable(_) | MaskError::Fetch(_))
    }
}

/// Result type for control surface operations
pub type MaskResult<T> = Result<T, MaskError>;
