use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Utc};
use ndarray::{Array2, Array4, Axis};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Geographic position as (longitude, latitude) in degrees
pub type LonLat = [f64; 2];

/// Closed ring of geographic positions
pub type Ring = Vec<LonLat>;

/// Binary segmentation mask (y x x), values in {0, 1}
pub type SegmentationMask = Array2<u8>;

/// Name of the mask layer attached to every training example
pub const SEGMENTATION_MAP_LAYER: &str = "segmentation_map";

/// Coordinate reference system of a raster grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Crs {
    /// WGS84 longitude/latitude (EPSG:4326)
    Geographic,
    /// WGS84 / UTM (EPSG:326xx north, EPSG:327xx south)
    Utm { zone: u8, north: bool },
    /// Any other EPSG code, resolved through GDAL/PROJ
    Epsg(u32),
}

impl Crs {
    pub fn from_epsg(code: u32) -> Self {
        match code {
            4326 => Crs::Geographic,
            32601..=32660 => Crs::Utm { zone: (code - 32600) as u8, north: true },
            32701..=32760 => Crs::Utm { zone: (code - 32700) as u8, north: false },
            other => Crs::Epsg(other),
        }
    }

    pub fn epsg(&self) -> u32 {
        match self {
            Crs::Geographic => 4326,
            Crs::Utm { zone, north: true } => 32600 + *zone as u32,
            Crs::Utm { zone, north: false } => 32700 + *zone as u32,
            Crs::Epsg(code) => *code,
        }
    }
}

impl std::fmt::Display for Crs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EPSG:{}", self.epsg())
    }
}

/// Geospatial bounding box in the coordinates of some CRS
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    /// Smallest box containing every point, `None` for an empty iterator
    pub fn from_points<I: IntoIterator<Item = (f64, f64)>>(points: I) -> Option<Self> {
        let mut iter = points.into_iter();
        let (x0, y0) = iter.next()?;
        let mut bbox = BoundingBox { min_x: x0, min_y: y0, max_x: x0, max_y: y0 };
        for (x, y) in iter {
            bbox.min_x = bbox.min_x.min(x);
            bbox.min_y = bbox.min_y.min(y);
            bbox.max_x = bbox.max_x.max(x);
            bbox.max_y = bbox.max_y.max(y);
        }
        Some(bbox)
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_x <= other.max_x
            && other.min_x <= self.max_x
            && self.min_y <= other.max_y
            && other.min_y <= self.max_y
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }
}

/// Affine geotransform in GDAL coefficient order
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
    /// North-up transform with square-ish pixels
    pub fn north_up(top_left_x: f64, top_left_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self {
            top_left_x,
            pixel_width,
            rotation_x: 0.0,
            top_left_y,
            rotation_y: 0.0,
            pixel_height: -pixel_height.abs(),
        }
    }

    pub fn from_gdal(coefficients: [f64; 6]) -> Self {
        Self {
            top_left_x: coefficients[0],
            pixel_width: coefficients[1],
            rotation_x: coefficients[2],
            top_left_y: coefficients[3],
            rotation_y: coefficients[4],
            pixel_height: coefficients[5],
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

    /// Map coordinates of a (fractional) pixel position
    pub fn apply(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.top_left_x + col * self.pixel_width + row * self.rotation_x,
            self.top_left_y + col * self.rotation_y + row * self.pixel_height,
        )
    }

    /// Fractional pixel position (col, row) of map coordinates
    pub fn invert(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        let det = self.pixel_width * self.pixel_height - self.rotation_x * self.rotation_y;
        if det == 0.0 || !det.is_finite() {
            return None;
        }
        let dx = x - self.top_left_x;
        let dy = y - self.top_left_y;
        let col = (dx * self.pixel_height - dy * self.rotation_x) / det;
        let row = (dy * self.pixel_width - dx * self.rotation_y) / det;
        Some((col, row))
    }

    /// Transform of the sub-grid starting at (col_off, row_off)
    pub fn offset(&self, col_off: usize, row_off: usize) -> Self {
        let (x, y) = self.apply(col_off as f64, row_off as f64);
        Self { top_left_x: x, top_left_y: y, ..*self }
    }

    /// Pixel window (col_off, row_off, width, height) covering `bounds`,
    /// clipped to a grid of `shape` = (height, width)
    pub fn window_from_bounds(
        &self,
        bounds: &BoundingBox,
        shape: (usize, usize),
    ) -> Option<(usize, usize, usize, usize)> {
        let corners = [
            self.invert(bounds.min_x, bounds.min_y)?,
            self.invert(bounds.min_x, bounds.max_y)?,
            self.invert(bounds.max_x, bounds.min_y)?,
            self.invert(bounds.max_x, bounds.max_y)?,
        ];
        let pixel_box = BoundingBox::from_points(corners)?;
        let (height, width) = shape;

        let col_start = pixel_box.min_x.floor().max(0.0) as usize;
        let row_start = pixel_box.min_y.floor().max(0.0) as usize;
        let col_end = (pixel_box.max_x.ceil().max(0.0) as usize).min(width);
        let row_end = (pixel_box.max_y.ceil().max(0.0) as usize).min(height);

        if col_start >= col_end || row_start >= row_end {
            return None;
        }
        Some((col_start, row_start, col_end - col_start, row_end - row_start))
    }
}

/// Pixel grid with its georeferencing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoGrid {
    pub transform: GeoTransform,
    pub crs: Option<Crs>,
    pub height: usize,
    pub width: usize,
}

impl GeoGrid {
    pub fn new(transform: GeoTransform, crs: Option<Crs>, height: usize, width: usize) -> Self {
        Self { transform, crs, height, width }
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    /// Map-coordinate bounds of the full grid
    pub fn bounds(&self) -> BoundingBox {
        let w = self.width as f64;
        let h = self.height as f64;
        let corners = [
            self.transform.apply(0.0, 0.0),
            self.transform.apply(w, 0.0),
            self.transform.apply(0.0, h),
            self.transform.apply(w, h),
        ];
        // four corners are always present
        BoundingBox::from_points(corners).unwrap_or(BoundingBox {
            min_x: self.transform.top_left_x,
            min_y: self.transform.top_left_y,
            max_x: self.transform.top_left_x,
            max_y: self.transform.top_left_y,
        })
    }

    /// Pixel size along x and y in map units
    pub fn resolution(&self) -> (f64, f64) {
        let t = &self.transform;
        (
            t.pixel_width.hypot(t.rotation_y),
            t.pixel_height.hypot(t.rotation_x),
        )
    }
}

/// Closed time interval `[start, end]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn contains(&self, time: DateTime<Utc>) -> bool {
        time >= self.start && time <= self.end
    }

    /// STAC `datetime` range string
    pub fn to_stac_range(&self) -> String {
        format!("{}/{}", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// Vector footprint of a PV site with its GeoJSON properties.
///
/// Rings are only reachable through [`PolygonFeature::new`], so every feature
/// has at least one closed ring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PolygonFeatureParts")]
pub struct PolygonFeature {
    pub id: Option<String>,
    /// First ring is the exterior; further rings are holes or extra parts
    rings: Vec<Ring>,
    pub properties: Map<String, Value>,
}

#[derive(Deserialize)]
struct PolygonFeatureParts {
    id: Option<String>,
    rings: Vec<Ring>,
    #[serde(default)]
    properties: Map<String, Value>,
}

impl TryFrom<PolygonFeatureParts> for PolygonFeature {
    type Error = SolarError;

    fn try_from(parts: PolygonFeatureParts) -> SolarResult<Self> {
        Self::new(parts.id, parts.rings, parts.properties)
    }
}

impl PolygonFeature {
    /// Build a feature, closing any ring whose last position differs from the first
    pub fn new(id: Option<String>, rings: Vec<Ring>, properties: Map<String, Value>) -> SolarResult<Self> {
        if rings.is_empty() {
            return Err(SolarError::InvalidGeometry("polygon has no rings".to_string()));
        }

        let mut closed = Vec::with_capacity(rings.len());
        for (i, mut ring) in rings.into_iter().enumerate() {
            if ring.iter().any(|p| !p[0].is_finite() || !p[1].is_finite()) {
                return Err(SolarError::InvalidGeometry(format!(
                    "ring {} contains a non-finite coordinate", i
                )));
            }
            if let (Some(first), Some(last)) = (ring.first().copied(), ring.last().copied()) {
                if first != last {
                    log::debug!("Closing unclosed ring {} of feature {:?}", i, id);
                    ring.push(first);
                }
            }
            if ring.len() < 4 {
                return Err(SolarError::InvalidGeometry(format!(
                    "ring {} has {} positions, need at least 4", i, ring.len()
                )));
            }
            closed.push(ring);
        }

        Ok(Self { id, rings: closed, properties })
    }

    /// Single-ring polygon without properties
    pub fn from_ring(ring: Ring) -> SolarResult<Self> {
        Self::new(None, vec![ring], Map::new())
    }

    pub fn rings(&self) -> &[Ring] {
        &self.rings
    }

    pub fn exterior(&self) -> &Ring {
        &self.rings[0]
    }

    /// Geographic bounds over every ring
    pub fn bounds(&self) -> BoundingBox {
        let points = self.rings.iter().flatten().map(|p| (p[0], p[1]));
        // rings are non-empty by construction
        BoundingBox::from_points(points).unwrap_or(BoundingBox {
            min_x: 0.0,
            min_y: 0.0,
            max_x: 0.0,
            max_y: 0.0,
        })
    }

    /// Installation date from `Date`, falling back to `Start year`
    pub fn install_date(&self) -> SolarResult<Option<DateTime<Utc>>> {
        match self.property_date("Date")? {
            Some(date) => Ok(Some(date)),
            None => self.property_date("Start year"),
        }
    }

    pub fn install_year(&self) -> SolarResult<Option<i32>> {
        Ok(self.install_date()?.map(|date| date.year()))
    }

    pub fn retirement_year(&self) -> SolarResult<Option<i32>> {
        Ok(self.property_date("Retired year")?.map(|date| date.year()))
    }

    fn property_date(&self, key: &str) -> SolarResult<Option<DateTime<Utc>>> {
        match self.properties.get(key) {
            None => Ok(None),
            Some(value) => parse_date_value(value)
                .map_err(|e| SolarError::MalformedDate(format!("property '{}': {}", key, e))),
        }
    }
}

/// Parse a GeoJSON property holding a date, datetime or bare year.
/// Null, empty strings and "NaN" count as absent.
pub fn parse_date_value(value: &Value) -> Result<Option<DateTime<Utc>>, String> {
    match value {
        Value::Null => Ok(None),
        Value::Number(number) => {
            let year = number
                .as_f64()
                .ok_or_else(|| format!("unrepresentable number {}", number))?;
            year_start(year).map(Some)
        }
        Value::String(text) => parse_date_str(text),
        other => Err(format!("unsupported value {}", other)),
    }
}

fn parse_date_str(text: &str) -> Result<Option<DateTime<Utc>>, String> {
    let text = text.trim();
    if text.is_empty() || text.eq_ignore_ascii_case("nan") || text.eq_ignore_ascii_case("none") {
        return Ok(None);
    }

    if let Ok(datetime) = DateTime::parse_from_rfc3339(text) {
        return Ok(Some(datetime.with_timezone(&Utc)));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(Some(naive.and_utc()));
        }
    }
    for format in ["%Y-%m-%d", "%Y/%m/%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return Ok(date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc()));
        }
    }
    if let Ok(year) = text.parse::<f64>() {
        if year.is_nan() {
            return Ok(None);
        }
        return year_start(year).map(Some);
    }

    Err(format!("unrecognised date '{}'", text))
}

fn year_start(year: f64) -> Result<DateTime<Utc>, String> {
    if year.is_nan() {
        return Err("NaN year".to_string());
    }
    if !year.is_finite() || year.fract() != 0.0 || !(1.0..=9999.0).contains(&year) {
        return Err(format!("invalid year {}", year));
    }
    NaiveDate::from_ymd_opt(year as i32, 1, 1)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| format!("invalid year {}", year))
}

/// Time-ordered stack of co-registered scenes
#[derive(Debug, Clone)]
pub struct ImageryStack {
    /// Pixel values with dims (time, y, x, band)
    pub data: Array4<f32>,
    pub times: Vec<DateTime<Utc>>,
    pub scene_ids: Vec<String>,
    pub cloud_cover: Vec<f64>,
    pub bands: Vec<String>,
    pub geo_transform: GeoTransform,
    pub crs: Option<Crs>,
}

impl ImageryStack {
    /// Stack with no scenes on the given grid
    pub fn empty(grid: &GeoGrid, bands: Vec<String>) -> Self {
        Self {
            data: Array4::zeros((0, grid.height, grid.width, bands.len())),
            times: Vec::new(),
            scene_ids: Vec::new(),
            cloud_cover: Vec::new(),
            bands,
            geo_transform: grid.transform,
            crs: grid.crs,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (y, x) shape of one time slice
    pub fn spatial_shape(&self) -> (usize, usize) {
        let (_, height, width, _) = self.data.dim();
        (height, width)
    }

    pub fn grid(&self) -> GeoGrid {
        let (height, width) = self.spatial_shape();
        GeoGrid::new(self.geo_transform, self.crs, height, width)
    }

    pub fn is_time_ordered(&self) -> bool {
        self.times.windows(2).all(|pair| pair[0] <= pair[1])
    }
}

/// One sampled training example: imagery plus named 2D layers
#[derive(Debug, Clone)]
pub struct TrainingExample {
    pub window: TimeWindow,
    pub stack: ImageryStack,
    pub layers: BTreeMap<String, Array2<u8>>,
}

impl TrainingExample {
    pub fn segmentation_map(&self) -> Option<&SegmentationMask> {
        self.layers.get(SEGMENTATION_MAP_LAYER)
    }
}

/// Error types for training example assembly
#[derive(Debug, thiserror::Error)]
pub enum SolarError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No imagery available: {0}")]
    NoData(String),

    #[error("Missing spatial reference: {0}")]
    MissingSpatialReference(String),

    #[error("Malformed date: {0}")]
    MalformedDate(String),

    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("Invalid time window: {0}")]
    InvalidWindow(String),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("Projection error: {0}")]
    Projection(String),

    #[error("Download error: {0}")]
    Download(String),

    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("GeoJSON error: {0}")]
    GeoJson(#[from] geojson::Error),
}

impl SolarError {
    /// Whether drawing another random example may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, SolarError::NoData(_))
    }
}

/// Result type for solar mapper operations
pub type SolarResult<T> = Result<T, SolarError>;

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::Timelike;

    #[test]
    fn test_crs_epsg_round_trip() {
        assert_eq!(Crs::from_epsg(4326), Crs::Geographic);
        assert_eq!(Crs::from_epsg(32617), Crs::Utm { zone: 17, north: true });
        assert_eq!(Crs::from_epsg(32755), Crs::Utm { zone: 55, north: false });
        assert_eq!(Crs::from_epsg(3857), Crs::Epsg(3857));
        assert_eq!(Crs::Utm { zone: 17, north: true }.epsg(), 32617);
        assert_eq!(format!("{}", Crs::Geographic), "EPSG:4326");
    }

    #[test]
    fn test_geotransform_invert() {
        let gt = GeoTransform::north_up(500_000.0, 4_800_000.0, 10.0, 10.0);
        let (x, y) = gt.apply(12.5, 7.5);
        assert_relative_eq!(x, 500_125.0);
        assert_relative_eq!(y, 4_799_925.0);

        let (col, row) = gt.invert(x, y).unwrap();
        assert_relative_eq!(col, 12.5, epsilon = 1e-9);
        assert_relative_eq!(row, 7.5, epsilon = 1e-9);
    }

    #[test]
    fn test_window_from_bounds_clips_to_grid() {
        let gt = GeoTransform::north_up(0.0, 100.0, 1.0, 1.0);
        let bounds = BoundingBox { min_x: 10.2, min_y: 50.0, max_x: 20.7, max_y: 60.0 };
        assert_eq!(gt.window_from_bounds(&bounds, (100, 100)), Some((10, 40, 11, 10)));

        let outside = BoundingBox { min_x: 200.0, min_y: 0.0, max_x: 300.0, max_y: 10.0 };
        assert_eq!(gt.window_from_bounds(&outside, (100, 100)), None);

        let partial = BoundingBox { min_x: -5.0, min_y: 95.0, max_x: 3.0, max_y: 105.0 };
        assert_eq!(gt.window_from_bounds(&partial, (100, 100)), Some((0, 0, 3, 5)));
    }

    #[test]
    fn test_grid_resolution_and_bounds() {
        let grid = GeoGrid::new(GeoTransform::north_up(0.0, 30.0, 10.0, 10.0), None, 3, 2);
        assert_eq!(grid.resolution(), (10.0, 10.0));
        assert_eq!(grid.transform.to_gdal(), [0.0, 10.0, 0.0, 30.0, 0.0, -10.0]);
        let bounds = grid.bounds();
        assert_relative_eq!(bounds.max_y, 30.0);
        assert_relative_eq!(bounds.min_y, 0.0);
    }

    #[test]
    fn test_only_no_data_is_retryable() {
        assert!(SolarError::NoData("empty".to_string()).is_retryable());
        assert!(!SolarError::MalformedDate("x".to_string()).is_retryable());
        assert!(!SolarError::MissingSpatialReference("x".to_string()).is_retryable());
    }

    fn feature_with(properties: serde_json::Value) -> PolygonFeature {
        let ring = vec![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0], [0.0, 0.0]];
        let props = properties.as_object().cloned().unwrap_or_default();
        PolygonFeature::new(Some("site".to_string()), vec![ring], props).unwrap()
    }

    #[test]
    fn test_unclosed_ring_is_closed() {
        let feature = PolygonFeature::from_ring(vec![[0.0, 0.0], [2.0, 0.0], [2.0, 1.0]]).unwrap();
        assert_eq!(feature.exterior().len(), 4);
        assert_eq!(feature.exterior().first(), feature.exterior().last());

        assert!(PolygonFeature::from_ring(vec![[0.0, 0.0], [1.0, 1.0]]).is_err());
        assert!(PolygonFeature::new(None, vec![], Map::new()).is_err());
    }

    #[test]
    fn test_deserialized_feature_is_validated() {
        let empty: Result<PolygonFeature, _> =
            serde_json::from_str(r#"{"id": "empty", "rings": []}"#);
        assert!(empty.is_err());

        let open: PolygonFeature = serde_json::from_str(
            r#"{"id": "open", "rings": [[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0]]]}"#,
        )
        .unwrap();
        assert_eq!(open.exterior().len(), 4);
        assert!(open.properties.is_empty());
    }

    #[test]
    fn test_install_date_sources() {
        let dated = feature_with(serde_json::json!({"Date": "2016-05-20"}));
        let date = dated.install_date().unwrap().unwrap();
        assert_eq!((date.year(), date.month(), date.day()), (2016, 5, 20));

        let from_year = feature_with(serde_json::json!({"Date": null, "Start year": 2017.0}));
        assert_eq!(from_year.install_year().unwrap(), Some(2017));

        let string_year = feature_with(serde_json::json!({"Start year": "2014"}));
        assert_eq!(string_year.install_year().unwrap(), Some(2014));

        let datetime = feature_with(serde_json::json!({"Date": "2018-02-03T12:30:00"}));
        assert_eq!(datetime.install_date().unwrap().unwrap().hour(), 12);

        let undated = feature_with(serde_json::json!({"Start year": "NaN"}));
        assert_eq!(undated.install_date().unwrap(), None);
    }

    #[test]
    fn test_malformed_date_is_reported() {
        let feature = feature_with(serde_json::json!({"Date": "sometime in spring"}));
        match feature.install_date() {
            Err(SolarError::MalformedDate(msg)) => assert!(msg.contains("Date")),
            other => panic!("expected malformed date, got {:?}", other),
        }

        let fractional = feature_with(serde_json::json!({"Retired year": 2019.5}));
        assert!(fractional.retirement_year().is_err());
    }
}
