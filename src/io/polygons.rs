use crate::types::{LonLat, PolygonFeature, Ring, SolarError, SolarResult, TimeWindow};
use chrono::Datelike;
use geojson::feature::Id;
use geojson::{Feature, GeoJson, PolygonType};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::{Path, PathBuf};

/// Zenodo record hosting the global PV mapping polygons
pub const ZENODO_RECORD_URL: &str = "https://zenodo.org/record/5005868/files";

const TRAIN_FILE: &str = "trn_polygons.geojson";
const TEST_FILE: &str = "test_polygons.geojson";
const VALIDATION_FILE: &str = "cv_polygons.geojson";

/// Where polygon files come from and where they are cached
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolygonStoreConfig {
    pub base_url: String,
    pub cache_dir: PathBuf,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for PolygonStoreConfig {
    fn default() -> Self {
        Self {
            base_url: ZENODO_RECORD_URL.to_string(),
            cache_dir: dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("solar_mapper")
                .join("polygons"),
            timeout_secs: 300,
            max_retries: 3,
        }
    }
}

/// Labelled site polygons split for training
#[derive(Debug, Clone, Default)]
pub struct TrainingPolygons {
    pub train: Vec<PolygonFeature>,
    pub test: Vec<PolygonFeature>,
    pub validation: Vec<PolygonFeature>,
}

/// Loads PV site polygons from GeoJSON, downloading them on first use
#[derive(Debug, Clone, Default)]
pub struct PolygonStore {
    config: PolygonStoreConfig,
}

impl PolygonStore {
    pub fn new(config: PolygonStoreConfig) -> Self {
        Self { config }
    }

    /// Store reading (and caching) files under `cache_dir`
    pub fn with_cache_dir<P: AsRef<Path>>(cache_dir: P) -> Self {
        Self::new(PolygonStoreConfig {
            cache_dir: cache_dir.as_ref().to_path_buf(),
            ..PolygonStoreConfig::default()
        })
    }

    pub fn config(&self) -> &PolygonStoreConfig {
        &self.config
    }

    /// Train/test/validation polygons of the global PV mapping dataset
    pub fn load_training_polygons(&self) -> SolarResult<TrainingPolygons> {
        log::info!("Loading training polygons from {}", self.config.cache_dir.display());

        let polygons = TrainingPolygons {
            train: read_feature_collection(self.fetch(TRAIN_FILE)?)?,
            test: read_feature_collection(self.fetch(TEST_FILE)?)?,
            validation: read_feature_collection(self.fetch(VALIDATION_FILE)?)?,
        };

        log::info!(
            "Loaded {} train, {} test and {} validation polygons",
            polygons.train.len(),
            polygons.test.len(),
            polygons.validation.len()
        );
        Ok(polygons)
    }

    /// Candidate sites from `source` that were operating during `window`.
    ///
    /// `source` is a local path or a file name resolved through the cache.
    /// Features with unparseable dates are skipped.
    pub fn load_candidate_polygons<P: AsRef<Path>>(
        &self,
        source: P,
        window: &TimeWindow,
    ) -> SolarResult<Vec<PolygonFeature>> {
        let source = source.as_ref();
        let path = if source.exists() {
            source.to_path_buf()
        } else {
            let name = source.file_name().and_then(|n| n.to_str()).ok_or_else(|| {
                SolarError::InvalidFormat(format!("invalid polygon source {}", source.display()))
            })?;
            self.fetch(name)?
        };

        let features = read_feature_collection(&path)?;
        let total = features.len();
        let candidates: Vec<PolygonFeature> = features
            .into_iter()
            .filter(|feature| match is_valid_candidate(feature, window) {
                Ok(valid) => valid,
                Err(e) => {
                    log::warn!("Skipping candidate {:?}: {}", feature.id, e);
                    false
                }
            })
            .collect();

        log::info!(
            "Kept {} of {} candidate polygons valid in {}",
            candidates.len(),
            total,
            window.to_stac_range()
        );
        Ok(candidates)
    }

    /// Local path of `file_name`, downloading it into the cache if missing
    pub fn fetch(&self, file_name: &str) -> SolarResult<PathBuf> {
        let output_path = self.config.cache_dir.join(file_name);
        if output_path.exists() {
            log::debug!("Polygon file {} already cached", output_path.display());
            return Ok(output_path);
        }

        std::fs::create_dir_all(&self.config.cache_dir)?;
        let url = format!("{}/{}", self.config.base_url.trim_end_matches('/'), file_name);

        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(self.config.timeout_secs))
            .user_agent("solar-mapper/0.1.0")
            .build()
            .map_err(|e| SolarError::Download(format!("Failed to create HTTP client: {}", e)))?;

        let attempts = self.config.max_retries.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            log::info!("Downloading {} (attempt {} of {})", url, attempt, attempts);
            match Self::download_once(&client, &url, &output_path) {
                Ok(()) => return Ok(output_path),
                Err(e) => {
                    log::warn!("Download attempt {} failed: {}", attempt, e);
                    last_error = Some(e);
                    if attempt < attempts {
                        std::thread::sleep(std::time::Duration::from_secs(2));
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            SolarError::Download(format!("Download of {} failed after all retries", url))
        }))
    }

    fn download_once(
        client: &reqwest::blocking::Client,
        url: &str,
        output_path: &Path,
    ) -> SolarResult<()> {
        let response = client
            .get(url)
            .send()
            .map_err(|e| SolarError::Download(format!("HTTP request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(SolarError::Download(format!(
                "HTTP {} {}: {}",
                response.status().as_u16(),
                response.status().canonical_reason().unwrap_or(""),
                url
            )));
        }

        let expected = response.content_length();
        let content = response
            .bytes()
            .map_err(|e| SolarError::Download(format!("Failed to read response body: {}", e)))?;
        check_download_size(url, expected, content.len())?;
        log::debug!("Downloaded {} bytes", content.len());

        // partial downloads never land at the cached path
        let partial = output_path.with_extension("part");
        std::fs::write(&partial, &content)?;
        std::fs::rename(&partial, output_path)?;
        Ok(())
    }
}

/// Smallest body that can hold a GeoJSON FeatureCollection
const MIN_GEOJSON_BYTES: usize = 32;

// Reject empty, truncated or implausibly small downloads
fn check_download_size(url: &str, expected: Option<u64>, actual: usize) -> SolarResult<()> {
    if let Some(expected) = expected {
        if expected != actual as u64 {
            return Err(SolarError::Download(format!(
                "Truncated download from {}: expected {} bytes, got {}",
                url, expected, actual
            )));
        }
    }
    if actual < MIN_GEOJSON_BYTES {
        return Err(SolarError::Download(format!(
            "Response from {} is only {} bytes",
            url, actual
        )));
    }
    Ok(())
}

/// Whether a candidate site was installed before the window ends and not
/// retired before it starts (compared by year)
pub fn is_valid_candidate(feature: &PolygonFeature, window: &TimeWindow) -> SolarResult<bool> {
    if let Some(installed) = feature.install_year()? {
        if installed >= window.end.year() {
            return Ok(false);
        }
    }
    match feature.retirement_year()? {
        Some(retired) => Ok(retired > window.start.year()),
        None => Ok(true),
    }
}

/// Read a GeoJSON FeatureCollection from disk
pub fn read_feature_collection<P: AsRef<Path>>(path: P) -> SolarResult<Vec<PolygonFeature>> {
    log::debug!("Reading polygons from {}", path.as_ref().display());
    let file = std::fs::File::open(path.as_ref())?;
    parse_feature_collection(std::io::BufReader::new(file))
}

/// Parse a GeoJSON FeatureCollection of Polygon / MultiPolygon features.
///
/// Bare `NaN`/`Infinity` tokens, which some exports contain, are read as null.
/// Features without a polygonal geometry are skipped. A lone Feature is read
/// as a collection of one.
pub fn parse_feature_collection<R: Read>(mut reader: R) -> SolarResult<Vec<PolygonFeature>> {
    let mut text = String::new();
    reader.read_to_string(&mut text)?;

    let raw_features = match null_non_finite(&text).parse::<GeoJson>()? {
        GeoJson::FeatureCollection(collection) => collection.features,
        GeoJson::Feature(feature) => vec![feature],
        GeoJson::Geometry(_) => {
            return Err(SolarError::InvalidFormat(
                "expected a FeatureCollection, found a bare geometry".to_string(),
            ))
        }
    };

    let mut features = Vec::with_capacity(raw_features.len());
    for (index, raw) in raw_features.into_iter().enumerate() {
        match convert_feature(raw)? {
            Some(feature) => features.push(feature),
            None => log::warn!("Skipping feature {} without polygon geometry", index),
        }
    }

    Ok(features)
}

/// Parse a single GeoJSON Feature with Polygon / MultiPolygon geometry
pub fn parse_feature(text: &str) -> SolarResult<PolygonFeature> {
    let raw = match null_non_finite(text).parse::<GeoJson>()? {
        GeoJson::Feature(feature) => feature,
        _ => return Err(SolarError::InvalidFormat("expected a GeoJSON Feature".to_string())),
    };
    convert_feature(raw)?
        .ok_or_else(|| SolarError::InvalidGeometry("feature has no polygon geometry".to_string()))
}

fn convert_feature(raw: Feature) -> SolarResult<Option<PolygonFeature>> {
    let id = raw.id.map(|id| match id {
        Id::String(s) => s,
        Id::Number(n) => n.to_string(),
    });
    let Some(geometry) = raw.geometry else {
        return Ok(None);
    };
    let rings = match geometry.value {
        geojson::Value::Polygon(polygon) => convert_rings(polygon)?,
        geojson::Value::MultiPolygon(parts) => parts
            .into_iter()
            .map(convert_rings)
            .collect::<SolarResult<Vec<_>>>()?
            .into_iter()
            .flatten()
            .collect(),
        _ => return Ok(None),
    };
    PolygonFeature::new(id, rings, raw.properties.unwrap_or_default()).map(Some)
}

fn convert_rings(rings: PolygonType) -> SolarResult<Vec<Ring>> {
    rings
        .into_iter()
        .map(|ring| {
            ring.into_iter()
                .map(|position| match position.as_slice() {
                    [lon, lat, ..] => Ok::<LonLat, SolarError>([*lon, *lat]),
                    _ => Err(SolarError::InvalidGeometry(format!(
                        "position {:?} needs at least two coordinates",
                        position
                    ))),
                })
                .collect::<SolarResult<Ring>>()
        })
        .collect()
}

// Replace bare NaN / Infinity / -Infinity tokens outside strings with null
fn null_non_finite(text: &str) -> String {
    const TOKENS: [&str; 3] = ["-Infinity", "Infinity", "NaN"];

    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut rest = text;

    while let Some(c) = rest.chars().next() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
        } else if c == '"' {
            in_string = true;
        } else if let Some(token) = TOKENS.iter().find(|t| rest.starts_with(*t)) {
            out.push_str("null");
            rest = &rest[token.len()..];
            continue;
        }
        out.push(c);
        rest = &rest[c.len_utf8()..];
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    const COLLECTION: &str = r#"{
        "type": "FeatureCollection",
        "features": [
            {"type": "Feature", "id": 1,
             "properties": {"Date": "2016-04-01", "Retired year": NaN},
             "geometry": {"type": "Polygon", "coordinates": [[[-79.743, 43.438], [-79.705, 43.438], [-79.705, 43.453], [-79.743, 43.453], [-79.743, 43.438]]]}},
            {"type": "Feature", "id": "b",
             "properties": {"Start year": 2019, "name": "NaN farm"},
             "geometry": {"type": "MultiPolygon", "coordinates": [[[[0, 0], [1, 0], [1, 1], [0, 0]]], [[[2, 2], [3, 2], [3, 3], [2, 2]]]]}},
            {"type": "Feature", "properties": {}, "geometry": {"type": "Point", "coordinates": [0, 0]}},
            {"type": "Feature", "properties": {"Start year": 2012, "Retired year": 2015},
             "geometry": {"type": "Polygon", "coordinates": [[[5, 5, 10], [6, 5, 10], [6, 6, 10], [5, 5, 10]]]}}
        ]
    }"#;

    fn window(start: i32, end: i32) -> TimeWindow {
        TimeWindow::new(
            Utc.with_ymd_and_hms(start, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(end, 12, 31, 0, 0, 0).unwrap(),
        )
    }

    #[test]
    fn test_parse_feature_collection() {
        let features = parse_feature_collection(COLLECTION.as_bytes()).unwrap();
        assert_eq!(features.len(), 3);
        assert_eq!(features[0].id.as_deref(), Some("1"));
        assert_eq!(features[0].exterior().len(), 5);
        assert_eq!(features[1].rings().len(), 2);
        assert_eq!(features[1].properties["name"], serde_json::json!("NaN farm"));
        assert_eq!(features[2].exterior()[1], [6.0, 5.0]);
        assert_eq!(features[0].retirement_year().unwrap(), None);
    }

    #[test]
    fn test_candidate_validity_window() {
        let features = parse_feature_collection(COLLECTION.as_bytes()).unwrap();
        let w = window(2016, 2018);

        // installed 2016, never retired
        assert!(is_valid_candidate(&features[0], &w).unwrap());
        // installed after the window
        assert!(!is_valid_candidate(&features[1], &w).unwrap());
        // retired before the window
        assert!(!is_valid_candidate(&features[2], &w).unwrap());
        assert!(is_valid_candidate(&features[2], &window(2014, 2016)).unwrap());
    }

    #[test]
    fn test_non_finite_tokens_outside_strings() {
        assert_eq!(
            null_non_finite(r#"{"a": NaN, "b": "NaN", "c": -Infinity, "d": "x\"NaN"}"#),
            r#"{"a": null, "b": "NaN", "c": null, "d": "x\"NaN"}"#
        );
    }

    #[test]
    fn test_load_candidates_from_local_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("predicted_set.geojson");
        std::fs::write(&path, COLLECTION).unwrap();

        let store = PolygonStore::with_cache_dir(dir.path());
        let candidates = store.load_candidate_polygons(&path, &window(2016, 2018)).unwrap();
        assert_eq!(candidates.len(), 1);

        // bare file names resolve through the cache directory
        let by_name = store
            .load_candidate_polygons("predicted_set.geojson", &window(2020, 2021))
            .unwrap();
        assert_eq!(by_name.len(), 2);
    }

    #[test]
    fn test_training_polygons_from_cache() {
        let dir = tempfile::TempDir::new().unwrap();
        for name in [TRAIN_FILE, TEST_FILE, VALIDATION_FILE] {
            std::fs::write(dir.path().join(name), COLLECTION).unwrap();
        }

        let polygons = PolygonStore::with_cache_dir(dir.path()).load_training_polygons().unwrap();
        assert_eq!(polygons.train.len(), 3);
        assert_eq!(polygons.test.len(), 3);
        assert_eq!(polygons.validation.len(), 3);
    }

    #[test]
    fn test_download_size_checks() {
        let url = "https://example.org/trn_polygons.geojson";
        assert!(check_download_size(url, Some(4096), 4096).is_ok());
        assert!(check_download_size(url, None, 4096).is_ok());
        assert!(matches!(
            check_download_size(url, Some(4096), 1000),
            Err(SolarError::Download(_))
        ));
        assert!(matches!(check_download_size(url, None, 0), Err(SolarError::Download(_))));
        assert!(matches!(check_download_size(url, Some(2), 2), Err(SolarError::Download(_))));
    }

    #[test]
    fn test_zero_retries_still_attempts_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = PolygonStore::new(PolygonStoreConfig {
            // nothing listens on the discard port
            base_url: "http://127.0.0.1:9".to_string(),
            cache_dir: dir.path().to_path_buf(),
            timeout_secs: 5,
            max_retries: 0,
        });
        assert!(matches!(store.fetch(TRAIN_FILE), Err(SolarError::Download(_))));
        assert!(!dir.path().join(TRAIN_FILE).exists());
    }

    #[test]
    fn test_bare_geometry_is_not_a_collection() {
        let geometry = r#"{"type": "Polygon", "coordinates": [[[0, 0], [1, 0], [1, 1], [0, 0]]]}"#;
        assert!(matches!(
            parse_feature_collection(geometry.as_bytes()),
            Err(SolarError::InvalidFormat(_))
        ));
        assert!(matches!(parse_feature(geometry), Err(SolarError::InvalidFormat(_))));
        assert!(matches!(parse_feature("{ not json"), Err(SolarError::GeoJson(_))));
    }

    #[test]
    fn test_parse_single_feature() {
        let feature = parse_feature(
            r#"{"type": "Feature", "properties": {"Date": "2017-01-01"},
                "geometry": {"type": "Polygon", "coordinates": [[[0, 0], [1, 0], [1, 1], [0, 1]]]}}"#,
        )
        .unwrap();
        assert_eq!(feature.exterior().len(), 5);
        assert_eq!(feature.install_year().unwrap(), Some(2017));

        let point = r#"{"type": "Feature", "properties": {}, "geometry": {"type": "Point", "coordinates": [0, 0]}}"#;
        assert!(matches!(parse_feature(point), Err(SolarError::InvalidGeometry(_))));
    }
}
