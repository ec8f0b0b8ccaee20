use crate::core::projection::{projected_bounds, transformer_for};
use crate::types::{
    BoundingBox, GeoGrid, GeoTransform, ImageryStack, PolygonFeature, SolarError, SolarResult,
    TimeWindow,
};
use chrono::{DateTime, Utc};
use ndarray::{s, Array3, ArrayView3, Axis};
use serde::{Deserialize, Serialize};

/// Sentinel-2 level-2A surface reflectance collection
pub const DEFAULT_COLLECTION: &str = "sentinel-2-l2a";

/// Imagery search parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryParams {
    /// Catalog collection to search
    pub collection: String,
    /// Maximum number of scenes in the returned stack
    pub max_scenes: usize,
    /// Prefer the least cloudy scenes when more than `max_scenes` match
    pub sort_by_cloud_cover: bool,
    /// Scenes at or above this cloud cover percentage are skipped
    pub max_cloud_cover: Option<f64>,
    /// Extra pixels kept around the site when clipping scenes
    pub buffer_pixels: usize,
}

impl Default for QueryParams {
    fn default() -> Self {
        Self {
            collection: DEFAULT_COLLECTION.to_string(),
            max_scenes: 8,
            sort_by_cloud_cover: true,
            max_cloud_cover: Some(10.0),
            buffer_pixels: 16,
        }
    }
}

/// Source of imagery stacks for a site and time window.
///
/// Implementations may return an empty stack when nothing matches; that is
/// not an error at this layer.
pub trait ImageryQuery {
    fn query(
        &self,
        feature: &PolygonFeature,
        window: &TimeWindow,
        params: &QueryParams,
    ) -> SolarResult<ImageryStack>;
}

/// Single catalog scene with its pixels
#[derive(Debug, Clone)]
pub struct Scene {
    pub id: String,
    pub collection: String,
    pub datetime: DateTime<Utc>,
    /// Cloud cover percentage (`eo:cloud_cover`)
    pub cloud_cover: f64,
    pub grid: GeoGrid,
    pub bands: Vec<String>,
    /// Pixel values with dims (y, x, band)
    pub data: Array3<f32>,
}

impl Scene {
    pub fn new(
        id: impl Into<String>,
        datetime: DateTime<Utc>,
        cloud_cover: f64,
        grid: GeoGrid,
        bands: Vec<String>,
        data: Array3<f32>,
    ) -> SolarResult<Self> {
        let (height, width, band_count) = data.dim();
        if (height, width) != grid.shape() {
            return Err(SolarError::InvalidFormat(format!(
                "scene data is {}x{} but its grid is {}x{}",
                height, width, grid.height, grid.width
            )));
        }
        if band_count != bands.len() {
            return Err(SolarError::InvalidFormat(format!(
                "scene has {} bands but {} band names",
                band_count,
                bands.len()
            )));
        }
        Ok(Self {
            id: id.into(),
            collection: DEFAULT_COLLECTION.to_string(),
            datetime,
            cloud_cover,
            grid,
            bands,
            data,
        })
    }

    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    /// Whether the feature's bounds overlap this scene; `None` without a CRS
    fn overlaps(&self, feature: &PolygonFeature) -> SolarResult<Option<bool>> {
        let Some(crs) = self.grid.crs else {
            return Ok(None);
        };
        let transform = transformer_for(crs)?;
        let site = projected_bounds(feature, transform.as_ref())?;
        Ok(Some(site.intersects(&self.grid.bounds())))
    }
}

/// Fixture-backed catalog holding scenes in memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    scenes: Vec<Scene>,
}

impl InMemoryCatalog {
    pub fn new(scenes: Vec<Scene>) -> Self {
        Self { scenes }
    }

    pub fn add_scene(&mut self, scene: Scene) {
        self.scenes.push(scene);
    }

    pub fn len(&self) -> usize {
        self.scenes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenes.is_empty()
    }

    /// Scenes matching the search, best candidates first
    pub fn search(
        &self,
        feature: &PolygonFeature,
        window: &TimeWindow,
        params: &QueryParams,
    ) -> SolarResult<Vec<&Scene>> {
        let mut matches = Vec::new();
        for scene in &self.scenes {
            if scene.collection != params.collection || !window.contains(scene.datetime) {
                continue;
            }
            if let Some(limit) = params.max_cloud_cover {
                if scene.cloud_cover >= limit {
                    continue;
                }
            }
            match scene.overlaps(feature)? {
                Some(false) => continue,
                Some(true) => {}
                None => log::debug!("Scene {} has no CRS, skipping footprint check", scene.id),
            }
            matches.push(scene);
        }

        if params.sort_by_cloud_cover {
            matches.sort_by(|a, b| {
                a.cloud_cover
                    .total_cmp(&b.cloud_cover)
                    .then(a.datetime.cmp(&b.datetime))
            });
        } else {
            matches.sort_by_key(|scene| scene.datetime);
        }

        log::debug!(
            "Catalog search in {} returned {} item(s)",
            window.to_stac_range(),
            matches.len()
        );
        Ok(matches)
    }

    // Pixel window of the site on `grid`, padded and clipped to the grid
    fn clip_window(
        feature: &PolygonFeature,
        grid: &GeoGrid,
        buffer: usize,
    ) -> SolarResult<(usize, usize, usize, usize)> {
        let full = (0, 0, grid.width, grid.height);
        let Some(crs) = grid.crs else {
            return Ok(full);
        };
        let transform = transformer_for(crs)?;
        let site: BoundingBox = projected_bounds(feature, transform.as_ref())?;
        let Some((col, row, width, height)) = grid.transform.window_from_bounds(&site, grid.shape())
        else {
            return Ok(full);
        };

        let col_start = col.saturating_sub(buffer);
        let row_start = row.saturating_sub(buffer);
        let col_end = (col + width + buffer).min(grid.width);
        let row_end = (row + height + buffer).min(grid.height);
        Ok((col_start, row_start, col_end - col_start, row_end - row_start))
    }
}

impl ImageryQuery for InMemoryCatalog {
    fn query(
        &self,
        feature: &PolygonFeature,
        window: &TimeWindow,
        params: &QueryParams,
    ) -> SolarResult<ImageryStack> {
        let candidates = self.search(feature, window, params)?;
        let Some(reference) = candidates.first() else {
            let grid = GeoGrid::new(GeoTransform::north_up(0.0, 0.0, 1.0, 1.0), None, 0, 0);
            return Ok(ImageryStack::empty(&grid, Vec::new()));
        };

        log::info!(
            "Choosing {} from {} with {}% cloud cover",
            reference.id,
            reference.datetime.date_naive(),
            reference.cloud_cover
        );

        let mut selected: Vec<&Scene> = candidates
            .iter()
            .copied()
            .filter(|scene| scene.grid == reference.grid && scene.bands == reference.bands)
            .take(params.max_scenes)
            .collect();
        selected.sort_by_key(|scene| scene.datetime);
        if selected.is_empty() {
            return Ok(ImageryStack::empty(&reference.grid, reference.bands.clone()));
        }

        let (col, row, width, height) =
            Self::clip_window(feature, &reference.grid, params.buffer_pixels)?;
        let views: Vec<ArrayView3<f32>> = selected
            .iter()
            .map(|scene| scene.data.slice(s![row..row + height, col..col + width, ..]))
            .collect();
        let data = ndarray::stack(Axis(0), &views)
            .map_err(|e| SolarError::InvalidFormat(format!("Failed to stack scenes: {}", e)))?;

        Ok(ImageryStack {
            data,
            times: selected.iter().map(|scene| scene.datetime).collect(),
            scene_ids: selected.iter().map(|scene| scene.id.clone()).collect(),
            cloud_cover: selected.iter().map(|scene| scene.cloud_cover).collect(),
            bands: reference.bands.clone(),
            geo_transform: reference.grid.transform.offset(col, row),
            crs: reference.grid.crs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Crs;
    use chrono::{Duration, TimeZone};

    fn grid() -> GeoGrid {
        GeoGrid::new(
            GeoTransform::north_up(0.0, 1.0, 0.01, 0.01),
            Some(Crs::Geographic),
            100,
            100,
        )
    }

    fn scene(id: &str, day: u32, cloud_cover: f64) -> Scene {
        let when = Utc.with_ymd_and_hms(2020, 6, day, 10, 0, 0).unwrap();
        let data = Array3::from_elem((100, 100, 1), day as f32);
        Scene::new(id, when, cloud_cover, grid(), vec!["visual".to_string()], data).unwrap()
    }

    fn site() -> PolygonFeature {
        PolygonFeature::from_ring(vec![[0.405, 0.405], [0.595, 0.405], [0.595, 0.595], [0.405, 0.595]])
            .unwrap()
    }

    fn june() -> TimeWindow {
        let start = Utc.with_ymd_and_hms(2020, 6, 1, 0, 0, 0).unwrap();
        TimeWindow::new(start, start + Duration::days(30))
    }

    #[test]
    fn test_least_cloudy_selection_is_time_ordered() {
        let catalog = InMemoryCatalog::new(vec![
            scene("a", 20, 1.0),
            scene("b", 5, 9.0),
            scene("c", 10, 0.5),
            scene("d", 15, 12.0),
        ]);
        let params = QueryParams { max_scenes: 2, buffer_pixels: 0, ..QueryParams::default() };

        let stack = catalog.query(&site(), &june(), &params).unwrap();
        assert_eq!(stack.scene_ids, vec!["c".to_string(), "a".to_string()]);
        assert!(stack.is_time_ordered());
        assert_eq!(stack.data[[0, 0, 0, 0]], 10.0);
    }

    #[test]
    fn test_cloudy_and_out_of_window_scenes_are_skipped() {
        let mut catalog = InMemoryCatalog::default();
        catalog.add_scene(scene("cloudy", 10, 55.0));
        let later = scene("july", 1, 0.0);
        catalog.add_scene(Scene { datetime: later.datetime + Duration::days(40), ..later });

        let stack = catalog.query(&site(), &june(), &QueryParams::default()).unwrap();
        assert!(stack.is_empty());
    }

    #[test]
    fn test_scenes_are_clipped_to_site() {
        let catalog = InMemoryCatalog::new(vec![scene("a", 3, 0.0)]);
        let params = QueryParams { buffer_pixels: 5, ..QueryParams::default() };

        let stack = catalog.query(&site(), &june(), &params).unwrap();
        // site covers columns/rows 40..60, plus 5 pixels each side
        assert_eq!(stack.spatial_shape(), (30, 30));
        let (x, y) = stack.geo_transform.apply(0.0, 0.0);
        assert!((x - 0.35).abs() < 1e-9);
        assert!((y - 0.65).abs() < 1e-9);
    }

    #[test]
    fn test_every_polygon_part_survives_clipping() {
        let square = |x: f64, y: f64| vec![[x, y], [x + 0.09, y], [x + 0.09, y + 0.09], [x, y + 0.09]];
        let site = PolygonFeature::new(
            Some("two-parts".to_string()),
            vec![square(0.105, 0.805), square(0.705, 0.105)],
            serde_json::Map::new(),
        )
        .unwrap();
        let catalog = InMemoryCatalog::new(vec![scene("a", 3, 0.0)]);
        let params = QueryParams { buffer_pixels: 0, ..QueryParams::default() };

        let stack = catalog.query(&site, &june(), &params).unwrap();
        // columns 10..80, rows 10..90
        assert_eq!(stack.spatial_shape(), (80, 70));

        let mask = crate::core::mask::make_segmentation_map(&site, &stack).unwrap();
        assert_eq!(mask.iter().filter(|&&v| v == 1).count(), 2 * 81);
        assert_eq!(mask[[4, 4]], 1);
        assert_eq!(mask[[75, 65]], 1);
    }

    #[test]
    fn test_scene_shape_is_validated() {
        let data = Array3::zeros((10, 10, 2));
        let when = Utc.with_ymd_and_hms(2020, 6, 1, 0, 0, 0).unwrap();
        assert!(Scene::new("bad", when, 0.0, grid(), vec!["red".to_string()], data).is_err());
    }
}
