use crate::types::{BoundingBox, MaskError, MaskResult};
use chrono::NaiveDate;
use flate2::read::GzDecoder;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the default data directory
pub const DATADIR_ENV: &str = "CTRLSURF_DATADIR";

/// Product identifier of the fractional snow cover tiles
pub const FSC_PRODUCT: &str = "fractional-snow-cover";
/// Product identifier of the modelled snow depth grids
pub const SNOW_DEPTH_PRODUCT: &str = "snow-depth";

/// Location of downloaded and static source products
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataDirs {
    pub root: PathBuf,
    /// Primary regional land-cover class raster, relative to `root`
    pub primary_land_cover: PathBuf,
    /// Global bare-ground percentage mosaic, relative to `root`
    pub bare_ground: PathBuf,
    /// Glacier / perennial snow outlines, relative to `root`
    pub glacier_outlines: PathBuf,
}

impl Default for DataDirs {
    fn default() -> Self {
        let root = dirs::data_dir()
            .map(|dir| dir.join("ctrlsurf"))
            .unwrap_or_else(|| PathBuf::from("data"));
        Self::with_root(root)
    }
}

impl DataDirs {
    pub fn with_root<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: root.into(),
            primary_land_cover: PathBuf::from("nlcd_2011_landcover_2011_edition_2014_10_10/nlcd_2011_landcover_2011_edition_2014_10_10.img"),
            bare_ground: PathBuf::from("bare2010/bare2010.vrt"),
            glacier_outlines: PathBuf::from("rgi50/regions/rgi50_merge.shp"),
        }
    }

    /// Root from `CTRLSURF_DATADIR` when set, platform data dir otherwise
    pub fn from_env() -> Self {
        match std::env::var_os(DATADIR_ENV) {
            Some(root) if !root.is_empty() => Self::with_root(PathBuf::from(root)),
            _ => Self::default(),
        }
    }

    pub fn primary_land_cover_path(&self) -> PathBuf {
        self.root.join(&self.primary_land_cover)
    }

    pub fn bare_ground_path(&self) -> PathBuf {
        self.root.join(&self.bare_ground)
    }

    pub fn glacier_outlines_path(&self) -> PathBuf {
        self.root.join(&self.glacier_outlines)
    }

    /// Cache directory of a downloadable product
    pub fn product_dir(&self, product: &str) -> PathBuf {
        self.root.join(product)
    }
}

/// Tile fetcher collaborator; `Ok(None)` means the tile does not exist for
/// that date.
pub trait TileFetcher {
    fn fetch_tile(&self, product: &str, date: NaiveDate, tile: &str) -> MaskResult<Option<PathBuf>>;
}

/// Gzip'd archive members unpacked for the snow depth product
const DATA_EXT: &str = "dat";
const HEADER_EXT: &str = "Hdr";
/// Header lines GDAL cannot parse (overlong free text)
const HEADER_JUNK: &str = "Created by module comment";

/// Remote layout of one product. Templates take `{tile}` plus strftime date
/// codes, e.g. `https://host/%Y/%j/MOD09GA.A%Y%j.{tile}.tif`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "layout", rename_all = "snake_case")]
pub enum ProductSource {
    /// One file per tile and date at a known URL
    Direct { url_template: String, file_template: String },
    /// Per-day directory listings searched in order for the first file whose
    /// name matches `file_pattern` (a regex after template rendering)
    Listing { listing_templates: Vec<String>, file_pattern: String },
    /// One tar archive per date holding gzip'd `.dat`/`.Hdr` members. The
    /// era covering the date picks the URL and member names; the unpacked
    /// header is the product path.
    Archive { eras: Vec<ArchiveEra> },
}

/// Archive layout valid from `start` up to `end` (exclusive, open when unset)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveEra {
    pub start: NaiveDate,
    pub end: Option<NaiveDate>,
    pub url_template: String,
    /// Member name with `{ext}` standing for `dat` or `Hdr`
    pub member_template: String,
}

impl ArchiveEra {
    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && self.end.map_or(true, |end| date < end)
    }

    pub fn member(&self, date: NaiveDate, ext: &str) -> MaskResult<String> {
        Ok(render_template(&self.member_template, date, "")?.replace("{ext}", ext))
    }
}

/// HTTP download settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub products: BTreeMap<String, ProductSource>,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        let mut products = BTreeMap::new();
        // Historic reprocessing first, real-time products for recent days
        products.insert(
            FSC_PRODUCT.to_string(),
            ProductSource::Listing {
                listing_templates: vec![
                    "https://snow-data.jpl.nasa.gov/modscag-historic/%Y/%j/".to_string(),
                    "https://snow-data.jpl.nasa.gov/modscag/%Y/%j/".to_string(),
                ],
                file_pattern: r"MOD09GA\.A%Y%j\.{tile}\..*snow_fraction\.tif".to_string(),
            },
        );
        // CONUS-masked grids until 2010, unmasked from then on
        let snodas = "https://noaadata.apps.nsidc.org/NOAA/G02158";
        products.insert(
            SNOW_DEPTH_PRODUCT.to_string(),
            ProductSource::Archive {
                eras: vec![
                    ArchiveEra {
                        start: NaiveDate::from_ymd_opt(2003, 9, 30).unwrap_or(NaiveDate::MIN),
                        end: NaiveDate::from_ymd_opt(2010, 1, 1),
                        url_template: format!("{}/masked/%Y/%m_%b/SNODAS_%Y%m%d.tar", snodas),
                        member_template: "us_ssmv11036tS__T0001TTNATS%Y%m%d05HP001.{ext}.gz".to_string(),
                    },
                    ArchiveEra {
                        start: NaiveDate::from_ymd_opt(2010, 1, 1).unwrap_or(NaiveDate::MIN),
                        end: None,
                        url_template: format!("{}/unmasked/%Y/%m_%b/SNODAS_unmasked_%Y%m%d.tar", snodas),
                        member_template: "./zz_ssmv11036tS__T0001TTNATS%Y%m%d05HP001.{ext}.gz".to_string(),
                    },
                ],
            },
        );
        Self {
            products,
            timeout_secs: 300,
            max_retries: 3,
            retry_delay_secs: 2,
            username: None,
            password: None,
        }
    }
}

/// Substitute `{tile}` and strftime codes
pub fn render_template(template: &str, date: NaiveDate, tile: &str) -> MaskResult<String> {
    let with_tile = template.replace("{tile}", tile);
    let mut rendered = String::new();
    write!(rendered, "{}", date.format(&with_tile))
        .map_err(|_| MaskError::Config(format!("Invalid date codes in template '{}'", template)))?;
    Ok(rendered)
}

/// Whole-name regex for one tile and date
fn file_regex(pattern: &str, date: NaiveDate, tile: &str) -> MaskResult<Regex> {
    let rendered = render_template(pattern, date, tile)?;
    Regex::new(&format!("^(?:{})$", rendered))
        .map_err(|e| MaskError::Config(format!("Invalid file pattern '{}': {}", pattern, e)))
}

/// First linked file name in an HTML directory listing matching `pattern`
pub fn pick_listed_file(listing: &str, pattern: &Regex) -> Option<String> {
    let href = Regex::new(r#"href\s*=\s*"([^"]+)""#).ok()?;
    let found = href.captures_iter(listing)
        .filter_map(|cap| cap.get(1))
        .filter_map(|m| m.as_str().rsplit('/').next())
        .find(|name| pattern.is_match(name))
        .map(str::to_string);
    found
}

/// First file in `dir` whose name matches `pattern`
fn find_cached(dir: &Path, pattern: &Regex) -> MaskResult<Option<PathBuf>> {
    if !dir.is_dir() {
        return Ok(None);
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.file_name().and_then(|n| n.to_str()).map_or(false, |n| pattern.is_match(n)) {
            return Ok(Some(path));
        }
    }
    Ok(None)
}

fn member_file_name(member: &str) -> &str {
    Path::new(member).file_name().and_then(|n| n.to_str()).unwrap_or(member)
}

fn unpacked_name(member: &str) -> String {
    let name = member_file_name(member);
    name.strip_suffix(".gz").unwrap_or(name).to_string()
}

/// Gunzip the named members of a tar archive into `out_dir`. Members are
/// matched by file name, so a leading `./` in the archive does not matter.
pub fn unpack_gzip_members(archive_path: &Path, members: &[String], out_dir: &Path) -> MaskResult<Vec<PathBuf>> {
    let wanted: Vec<&str> = members.iter().map(|m| member_file_name(m)).collect();
    let mut archive = tar::Archive::new(std::fs::File::open(archive_path)?);
    let mut unpacked = Vec::new();
    std::fs::create_dir_all(out_dir)?;

    for entry in archive.entries()? {
        let entry = entry?;
        let path = entry.path()?.into_owned();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) if wanted.contains(&name) => name.to_string(),
            _ => continue,
        };

        let target = out_dir.join(unpacked_name(&name));
        let partial = out_dir.join(format!("{}.part", name));
        log::debug!("Unpacking {} to {}", name, target.display());
        let mut decoder = GzDecoder::new(entry);
        let mut file = std::fs::File::create(&partial)?;
        std::io::copy(&mut decoder, &mut file)?;
        std::fs::rename(&partial, &target)?;
        unpacked.push(target);
    }

    if unpacked.len() < wanted.len() {
        return Err(MaskError::Unavailable(format!(
            "{} lacks some of {:?}",
            archive_path.display(),
            wanted
        )));
    }
    Ok(unpacked)
}

/// Drop header lines GDAL rejects; returns the number removed
pub fn strip_header_comments(header: &Path) -> MaskResult<usize> {
    let text = std::fs::read_to_string(header)?;
    let kept: Vec<&str> = text.lines().filter(|line| !line.contains(HEADER_JUNK)).collect();
    let removed = text.lines().count() - kept.len();
    if removed > 0 {
        let mut cleaned = kept.join("\n");
        cleaned.push('\n');
        std::fs::write(header, cleaned)?;
    }
    Ok(removed)
}

/// Blocking HTTP fetcher with an on-disk cache: files already present are
/// never downloaded again.
pub struct HttpTileFetcher {
    dirs: DataDirs,
    config: FetchConfig,
    client: reqwest::blocking::Client,
}

impl HttpTileFetcher {
    pub fn new(dirs: DataDirs, config: FetchConfig) -> MaskResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("ctrlsurf/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| MaskError::Fetch(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { dirs, config, client })
    }

    fn source(&self, product: &str) -> MaskResult<&ProductSource> {
        self.config
            .products
            .get(product)
            .ok_or_else(|| MaskError::Config(format!("No download source configured for product '{}'", product)))
    }

    /// GET with optional basic auth; 404 is `Ok(None)`
    fn get(&self, url: &str) -> MaskResult<Option<reqwest::blocking::Response>> {
        let mut request = self.client.get(url);
        if let Some(username) = &self.config.username {
            request = request.basic_auth(username, self.config.password.as_ref());
        }

        let response = request
            .send()
            .map_err(|e| MaskError::Fetch(format!("HTTP request failed: {}", e)))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(MaskError::Fetch(format!(
                "HTTP request failed with status: {}",
                response.status()
            )));
        }
        Ok(Some(response))
    }

    /// Retry transient fetch failures up to `max_retries` attempts
    fn with_retries<T>(&self, url: &str, mut attempt_once: impl FnMut() -> MaskResult<T>) -> MaskResult<T> {
        let attempts = self.config.max_retries.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            log::debug!("Request attempt {} of {}: {}", attempt, attempts, url);
            match attempt_once() {
                Err(MaskError::Fetch(msg)) => {
                    last_error = Some(MaskError::Fetch(msg));
                    if attempt < attempts {
                        log::warn!("Request attempt {} failed, retrying...", attempt);
                        std::thread::sleep(Duration::from_secs(self.config.retry_delay_secs));
                    }
                }
                other => return other,
            }
        }

        Err(last_error.unwrap_or_else(|| MaskError::Fetch(format!("Request failed after all retries: {}", url))))
    }

    fn try_download_once(&self, url: &str, output_path: &Path) -> MaskResult<bool> {
        let response = match self.get(url)? {
            Some(response) => response,
            None => return Ok(false),
        };
        let bytes = response
            .bytes()
            .map_err(|e| MaskError::Fetch(format!("Failed to read response bytes: {}", e)))?;

        if let Some(parent) = output_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Partial downloads never sit at the cached path
        let partial = output_path.with_extension("part");
        std::fs::write(&partial, &bytes)?;
        std::fs::rename(&partial, output_path)?;
        Ok(true)
    }

    /// Download `url` to `output_path`; `false` when the server has no such file
    fn download(&self, url: &str, output_path: &Path) -> MaskResult<bool> {
        let found = self.with_retries(url, || self.try_download_once(url, output_path))?;
        if found {
            log::info!("Downloaded {} to {}", url, output_path.display());
        }
        Ok(found)
    }

    fn fetch_listing(&self, url: &str) -> MaskResult<Option<String>> {
        self.with_retries(url, || match self.get(url)? {
            Some(response) => response
                .text()
                .map(Some)
                .map_err(|e| MaskError::Fetch(format!("Failed to read listing {}: {}", url, e))),
            None => Ok(None),
        })
    }

    fn fetch_direct(
        &self,
        product: &str,
        url_template: &str,
        file_template: &str,
        date: NaiveDate,
        tile: &str,
    ) -> MaskResult<Option<PathBuf>> {
        let output_path = self.dirs.product_dir(product).join(render_template(file_template, date, tile)?);
        if output_path.exists() {
            log::info!("Tile {} for {} already exists, skipping download", tile, date);
            return Ok(Some(output_path));
        }

        let url = render_template(url_template, date, tile)?;
        if self.download(&url, &output_path)? {
            Ok(Some(output_path))
        } else {
            log::warn!("Unable to fetch {} tile {} for {}", product, tile, date);
            Ok(None)
        }
    }

    fn fetch_listed(
        &self,
        product: &str,
        listing_templates: &[String],
        file_pattern: &str,
        date: NaiveDate,
        tile: &str,
    ) -> MaskResult<Option<PathBuf>> {
        let dir = self.dirs.product_dir(product);
        let pattern = file_regex(file_pattern, date, tile)?;
        if let Some(cached) = find_cached(&dir, &pattern)? {
            log::info!("Tile {} for {} already exists, skipping download", tile, date);
            return Ok(Some(cached));
        }

        // Not every tile is published for the same days in every listing
        for template in listing_templates {
            let base = render_template(template, date, tile)?;
            log::info!("Searching {} for {} tile {}", base, product, tile);
            let name = match self.fetch_listing(&base)? {
                Some(listing) => pick_listed_file(&listing, &pattern),
                None => None,
            };
            if let Some(name) = name {
                let url = format!("{}/{}", base.trim_end_matches('/'), name);
                let output_path = dir.join(&name);
                if self.download(&url, &output_path)? {
                    return Ok(Some(output_path));
                }
            }
        }

        log::warn!("Unable to fetch {} tile {} for {}", product, tile, date);
        Ok(None)
    }

    fn fetch_archived(&self, product: &str, eras: &[ArchiveEra], date: NaiveDate) -> MaskResult<Option<PathBuf>> {
        let era = match eras.iter().find(|era| era.contains(date)) {
            Some(era) => era,
            None => {
                log::warn!("No {} archive covers {}", product, date);
                return Ok(None);
            }
        };

        let dir = self.dirs.product_dir(product);
        let members = vec![era.member(date, DATA_EXT)?, era.member(date, HEADER_EXT)?];
        let header = dir.join(unpacked_name(&members[1]));
        if header.exists() {
            log::info!("{} for {} already unpacked, skipping download", product, date);
            return Ok(Some(header));
        }

        let url = render_template(&era.url_template, date, "")?;
        let archive = dir.join(url.rsplit('/').next().unwrap_or("archive.tar"));
        if !archive.exists() && !self.download(&url, &archive)? {
            log::warn!("Unable to fetch {} archive for {}", product, date);
            return Ok(None);
        }

        log::info!("Unpacking {}", archive.display());
        unpack_gzip_members(&archive, &members, &dir)?;
        let removed = strip_header_comments(&header)?;
        log::debug!("Removed {} unreadable header lines from {}", removed, header.display());
        std::fs::remove_file(&archive)?;
        Ok(Some(header))
    }
}

impl TileFetcher for HttpTileFetcher {
    fn fetch_tile(&self, product: &str, date: NaiveDate, tile: &str) -> MaskResult<Option<PathBuf>> {
        match self.source(product)? {
            ProductSource::Direct { url_template, file_template } => {
                self.fetch_direct(product, url_template, file_template, date, tile)
            }
            ProductSource::Listing { listing_templates, file_pattern } => {
                self.fetch_listed(product, listing_templates, file_pattern, date, tile)
            }
            ProductSource::Archive { eras } => self.fetch_archived(product, eras, date),
        }
    }
}

/// MODIS sinusoidal grid constants
const MODIS_SPHERE_RADIUS: f64 = 6_371_007.181;
const MODIS_TILE_SIZE: f64 = 1_111_950.519_766_7;
const MODIS_H_TILES: i64 = 36;
const MODIS_V_TILES: i64 = 18;
/// Sample spacing in degrees, well under the 10 degree tile height
const MODIS_SAMPLE_DEG: f64 = 0.5;

/// `hHHvVV` ids of the MODIS sinusoidal tiles covering a lon/lat box
pub fn modis_tiles_for_bounds(bbox: &BoundingBox) -> Vec<String> {
    let half_width = MODIS_SPHERE_RADIUS * std::f64::consts::PI;
    let half_height = half_width / 2.0;

    // Sample the box densely enough that no tile column is skipped
    let steps = |span: f64| ((span.abs() / MODIS_SAMPLE_DEG).ceil() as usize).max(32);
    let lon_steps = steps(bbox.max_x - bbox.min_x);
    let lat_steps = steps(bbox.max_y - bbox.min_y);
    let mut tiles = std::collections::BTreeSet::new();
    for i in 0..=lon_steps {
        for j in 0..=lat_steps {
            let lon = bbox.min_x + (bbox.max_x - bbox.min_x) * i as f64 / lon_steps as f64;
            let lat = bbox.min_y + (bbox.max_y - bbox.min_y) * j as f64 / lat_steps as f64;
            let lat = lat.clamp(-90.0, 90.0);
            let x = MODIS_SPHERE_RADIUS * lon.to_radians() * lat.to_radians().cos();
            let y = MODIS_SPHERE_RADIUS * lat.to_radians();
            let h = (((x + half_width) / MODIS_TILE_SIZE).floor() as i64).clamp(0, MODIS_H_TILES - 1);
            let v = (((half_height - y) / MODIS_TILE_SIZE).floor() as i64).clamp(0, MODIS_V_TILES - 1);
            tiles.insert((v, h));
        }
    }

    tiles
        .into_iter()
        .map(|(v, h)| format!("h{:02}v{:02}", h, v))
        .collect()
}
