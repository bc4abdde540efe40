use crate::core::reconcile::GridReconciler;
use crate::io::dates::date_range;
use crate::io::fetch::{TileFetcher, FSC_PRODUCT};
use crate::io::raster::RasterIo;
use crate::types::{
    CompositeStats, DailyMosaic, GridSpec, MaskError, MaskResult, Observation, Raster, TemporalSeries,
};
use chrono::{Duration, NaiveDate};
use ndarray::{Array2, Zip};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Temporal compositing parameters for fractional snow cover
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositeParams {
    /// Days on each side of the acquisition date
    pub pad_days: i64,
    /// Values strictly above this are cloud/fill codes, not observations
    pub invalid_above: f64,
    /// Product identifier handed to the tile fetcher
    pub product: String,
    /// Tile ids to mosaic; empty means derive them from the DEM footprint
    pub tiles: Vec<String>,
}

impl Default for CompositeParams {
    fn default() -> Self {
        Self {
            pad_days: 7,
            invalid_above: 100.0,
            product: FSC_PRODUCT.to_string(),
            tiles: Vec::new(),
        }
    }
}

impl CompositeParams {
    pub fn validate(&self) -> MaskResult<()> {
        if self.pad_days < 0 {
            return Err(MaskError::Config(format!("Negative composite pad: {} days", self.pad_days)));
        }
        if !self.invalid_above.is_finite() {
            return Err(MaskError::Config("Composite validity limit must be finite".to_string()));
        }
        Ok(())
    }
}

/// Median with even-count averaging; sorts `values` in place
pub fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

/// Builds per-cell count/min/max/median composites over a date window
pub struct TemporalCompositor {
    params: CompositeParams,
}

impl TemporalCompositor {
    pub fn new(params: CompositeParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &CompositeParams {
        &self.params
    }

    /// `[center - pad, center + pad + 1)` in daily steps
    pub fn date_window(&self, center: NaiveDate) -> Vec<NaiveDate> {
        let pad = Duration::days(self.params.pad_days);
        date_range(center - pad, center + pad + Duration::days(1), Duration::days(1))
    }

    /// Tri-state view of one aligned tile
    pub fn classify(&self, raster: &Raster) -> Array2<Observation> {
        let limit = self.params.invalid_above;
        Zip::from(&raster.data).and(&raster.valid).map_collect(|&v, &ok| {
            if !ok {
                Observation::NoData
            } else if v > limit {
                Observation::Invalid
            } else {
                Observation::Value(v)
            }
        })
    }

    /// Merge same-date tiles: the first real value wins, an invalid code beats
    /// no data. `None` for an empty tile list.
    pub fn mosaic(tiles: &[Array2<Observation>]) -> Option<Array2<Observation>> {
        let (first, rest) = tiles.split_first()?;
        let mut merged = first.clone();
        for tile in rest {
            Zip::from(&mut merged).and(tile).for_each(|m, &t| {
                *m = match (*m, t) {
                    (Observation::Value(v), _) => Observation::Value(v),
                    (_, Observation::Value(v)) => Observation::Value(v),
                    (Observation::Invalid, _) | (_, Observation::Invalid) => Observation::Invalid,
                    _ => Observation::NoData,
                };
            });
        }
        Some(merged)
    }

    /// Fetch, align and mosaic every date of the window around `center`.
    ///
    /// Missing tiles and dates without any tile are skipped with a warning.
    /// Raw tiles are dropped as soon as their date's mosaic exists.
    pub fn build_series(
        &self,
        center: NaiveDate,
        tiles: &[String],
        fetcher: &dyn TileFetcher,
        io: &dyn RasterIo,
        reconciler: &GridReconciler<'_>,
        grid: &GridSpec,
    ) -> MaskResult<TemporalSeries> {
        let window = self.date_window(center);
        log::info!(
            "Compositing {} over {} dates ({} to {}), tiles {:?}",
            self.params.product,
            window.len(),
            window.first().map(|d| d.to_string()).unwrap_or_default(),
            window.last().map(|d| d.to_string()).unwrap_or_default(),
            tiles
        );

        let mut series = TemporalSeries::new(grid.clone());
        for date in window {
            let aligned = self.fetch_date(date, tiles, fetcher, io, reconciler, grid)?;
            if aligned.is_empty() {
                log::warn!("Unable to fetch any {} tile for {}, skipping date", self.params.product, date);
                continue;
            }

            let classified: Vec<Array2<Observation>> = aligned.par_iter().map(|r| self.classify(r)).collect();
            let tiles_used = aligned.len();
            drop(aligned);

            if let Some(cells) = Self::mosaic(&classified) {
                series.push(DailyMosaic { date, cells, tiles_used })?;
            }
        }
        Ok(series)
    }

    fn fetch_date(
        &self,
        date: NaiveDate,
        tiles: &[String],
        fetcher: &dyn TileFetcher,
        io: &dyn RasterIo,
        reconciler: &GridReconciler<'_>,
        grid: &GridSpec,
    ) -> MaskResult<Vec<Raster>> {
        let mut aligned = Vec::with_capacity(tiles.len());
        for tile in tiles {
            let path = match fetcher.fetch_tile(&self.params.product, date, tile) {
                Ok(Some(path)) => path,
                Ok(None) => {
                    log::debug!("No {} tile {} for {}", self.params.product, tile, date);
                    continue;
                }
                Err(e) if e.is_recoverable() => {
                    log::warn!("Fetching tile {} for {} failed: {}", tile, date, e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let raster = match io.open(&path) {
                Ok(raster) => raster,
                Err(e @ MaskError::Gdal(_)) | Err(e @ MaskError::Io(_)) => {
                    log::warn!("Unreadable tile {}: {}", path.display(), e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            match reconciler.reconcile_to_grid(&raster, grid) {
                Ok(raster) => aligned.push(raster),
                Err(MaskError::GeometryMismatch(msg)) => {
                    log::warn!("Tile {} for {} cannot be aligned: {}", tile, date, msg);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(aligned)
    }

    /// Reduce a series to per-cell statistics over valid observations only.
    ///
    /// Cells without any valid observation stay `Invalid` (an invalid code was
    /// seen) or `NoData` in min/max/median. A series without a single valid
    /// observation is `Unavailable`; only dates that contributed a value are
    /// listed in the result.
    pub fn composite(&self, series: &TemporalSeries) -> MaskResult<CompositeStats> {
        if series.is_empty() {
            return Err(MaskError::Unavailable(format!(
                "No {} observations in the date window",
                self.params.product
            )));
        }

        let days = series.days();
        let dim = series.grid.dim();
        let mut count = Array2::<u32>::zeros(dim);
        let mut min = Array2::from_elem(dim, Observation::NoData);
        let mut max = Array2::from_elem(dim, Observation::NoData);
        let mut med = Array2::from_elem(dim, Observation::NoData);

        let reduce = |(row, col): (usize, usize),
                      n: &mut u32,
                      lo: &mut Observation,
                      hi: &mut Observation,
                      mid: &mut Observation| {
            let mut values = Vec::with_capacity(days.len());
            let mut saw_invalid = false;
            for day in days {
                match day.cells[[row, col]] {
                    Observation::Value(v) => values.push(v),
                    Observation::Invalid => saw_invalid = true,
                    Observation::NoData => {}
                }
            }

            *n = values.len() as u32;
            match median(&mut values) {
                Some(m) => {
                    // sorted by median()
                    *lo = Observation::Value(values[0]);
                    *hi = Observation::Value(values[values.len() - 1]);
                    *mid = Observation::Value(m);
                }
                None => {
                    let empty = if saw_invalid { Observation::Invalid } else { Observation::NoData };
                    *lo = empty;
                    *hi = empty;
                    *mid = empty;
                }
            }
        };

        #[cfg(feature = "parallel")]
        Zip::indexed(&mut count).and(&mut min).and(&mut max).and(&mut med).par_for_each(reduce);
        #[cfg(not(feature = "parallel"))]
        Zip::indexed(&mut count).and(&mut min).and(&mut max).and(&mut med).for_each(reduce);

        let observed = count.iter().filter(|&&n| n > 0).count();
        if observed == 0 {
            return Err(MaskError::Unavailable(format!(
                "No valid {} observation on any of {} dates",
                self.params.product,
                days.len()
            )));
        }
        let dates: Vec<NaiveDate> = days
            .iter()
            .filter(|d| d.cells.iter().any(Observation::is_value))
            .map(|d| d.date)
            .collect();
        log::info!(
            "Composite from {} dates: {}/{} cells with at least one valid observation",
            dates.len(),
            observed,
            count.len()
        );

        Ok(CompositeStats { count, min, max, median: med, dates, grid: series.grid.clone() })
    }

    /// `build_series` followed by `composite`
    pub fn run(
        &self,
        center: NaiveDate,
        tiles: &[String],
        fetcher: &dyn TileFetcher,
        io: &dyn RasterIo,
        reconciler: &GridReconciler<'_>,
        grid: &GridSpec,
    ) -> MaskResult<CompositeStats> {
        let series = self.build_series(center, tiles, fetcher, io, reconciler, grid)?;
        self.composite(&series)
    }
}
