//! Collaborator implementations: raster and vector I/O, CRS transforms,
//! tile retrieval and date handling

pub mod raster;
pub mod geometry;
pub mod glacier;
pub mod fetch;
pub mod dates;

pub use raster::{GdalRasterIo, RasterIo};
pub use geometry::{GdalCoordinateTransformer, WGS84};
pub use glacier::{rasterize_polygons, GlacierRasterizer, OgrGlacierRasterizer};
pub use fetch::{modis_tiles_for_bounds, ArchiveEra, DataDirs, FetchConfig, HttpTileFetcher, ProductSource, TileFetcher};
pub use dates::{date_range, extract_acquisition_date};
