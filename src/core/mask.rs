use crate::core::geodesy::vincenty_inverse;
use crate::core::projection::{transformer_for, CoordinateTransform};
use crate::types::{
    GeoGrid, ImageryStack, PolygonFeature, SegmentationMask, SolarError, SolarResult,
};
use ndarray::Array2;

/// Pixel index (col, row) of a snapped vertex
pub type PixelVertex = (usize, usize);

/// Burns site polygons into binary masks aligned to an imagery grid
pub struct MaskRasterizer {
    grid: GeoGrid,
    transform: Box<dyn CoordinateTransform>,
}

impl MaskRasterizer {
    /// Create a rasterizer for a grid; fails when the grid has no CRS
    pub fn new(grid: GeoGrid) -> SolarResult<Self> {
        let crs = grid.crs.ok_or_else(|| {
            SolarError::MissingSpatialReference(
                "imagery grid carries no coordinate reference system".to_string(),
            )
        })?;
        if grid.transform.invert(0.0, 0.0).is_none() {
            return Err(SolarError::InvalidFormat(format!(
                "degenerate geotransform {:?}", grid.transform
            )));
        }
        let transform = transformer_for(crs)?;
        Ok(Self { grid, transform })
    }

    /// Rasterizer for the grid shared by every scene of a stack
    pub fn for_stack(stack: &ImageryStack) -> SolarResult<Self> {
        Self::new(stack.grid())
    }

    pub fn grid(&self) -> &GeoGrid {
        &self.grid
    }

    /// Reproject a feature into the grid CRS and snap every vertex to the
    /// nearest pixel center, independently per pixel axis
    pub fn snap_feature(&self, feature: &PolygonFeature) -> SolarResult<Vec<Vec<PixelVertex>>> {
        feature
            .rings()
            .iter()
            .map(|ring| {
                let projected = self.transform.forward_many(ring)?;
                projected
                    .into_iter()
                    .map(|(x, y)| self.snap_point(x, y))
                    .collect::<SolarResult<Vec<_>>>()
            })
            .collect()
    }

    /// Nearest pixel center to map coordinates, clamped to the grid
    pub fn snap_point(&self, x: f64, y: f64) -> SolarResult<PixelVertex> {
        let (col, row) = self.grid.transform.invert(x, y).ok_or_else(|| {
            SolarError::InvalidFormat("geotransform is not invertible".to_string())
        })?;
        if !col.is_finite() || !row.is_finite() {
            return Err(SolarError::Projection(format!(
                "vertex ({}, {}) reprojected to a non-finite pixel position", x, y
            )));
        }
        Ok((nearest_index(col, self.grid.width), nearest_index(row, self.grid.height)))
    }

    /// Map coordinates of a pixel center
    pub fn pixel_center(&self, vertex: PixelVertex) -> (f64, f64) {
        self.grid.transform.apply(vertex.0 as f64 + 0.5, vertex.1 as f64 + 0.5)
    }

    /// Binary mask of the feature on this grid
    pub fn rasterize(&self, feature: &PolygonFeature) -> SolarResult<SegmentationMask> {
        self.check_subpixel(feature);
        let rings = self.snap_feature(feature)?;
        let mask = burn_rings(&rings, self.grid.shape());
        log::debug!(
            "Rasterized feature {:?}: {} of {} pixels set",
            feature.id,
            mask.iter().filter(|&&v| v == 1).count(),
            mask.len()
        );
        Ok(mask)
    }

    // Vertex snapping collapses polygons narrower than a couple of pixels;
    // logs a warning and returns true for such features
    fn check_subpixel(&self, feature: &PolygonFeature) -> bool {
        let bounds = feature.bounds();
        let width = vincenty_inverse([bounds.min_x, bounds.min_y], [bounds.max_x, bounds.min_y]);
        let height = vincenty_inverse([bounds.min_x, bounds.min_y], [bounds.min_x, bounds.max_y]);
        let (Some(width), Some(height)) = (width, height) else {
            return false;
        };

        let (res_x, res_y) = self.grid.resolution();
        let (res_x, res_y) = if self.transform.is_geographic() {
            // degrees to meters near the feature
            let lat = bounds.min_y.to_radians();
            (res_x * 111_320.0 * lat.cos(), res_y * 110_574.0)
        } else {
            (res_x, res_y)
        };

        let subpixel = width.distance_m < 2.0 * res_x || height.distance_m < 2.0 * res_y;
        if subpixel {
            log::warn!(
                "Feature {:?} spans {:.1}m x {:.1}m on a {:.1}m x {:.1}m grid; \
                 nearest-pixel snapping will distort its mask",
                feature.id,
                width.distance_m,
                height.distance_m,
                res_x,
                res_y
            );
        }
        subpixel
    }
}

/// Index of the pixel whose center is nearest to a fractional pixel position
fn nearest_index(position: f64, len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    let index = position.floor();
    if index <= 0.0 {
        0
    } else {
        (index as usize).min(len - 1)
    }
}

/// Fill pixels whose centers lie inside the snapped rings (even-odd rule).
///
/// Scanline at each row center; an edge contributes when the center lies in
/// its half-open y-span, and a column is filled when its center lies in a
/// half-open `[x_in, x_out)` crossing pair.
pub fn burn_rings(rings: &[Vec<PixelVertex>], shape: (usize, usize)) -> SegmentationMask {
    let (height, width) = shape;
    let mut mask = Array2::zeros(shape);
    if height == 0 || width == 0 {
        return mask;
    }

    let edges: Vec<((f64, f64), (f64, f64))> = rings
        .iter()
        .flat_map(|ring| {
            ring.windows(2).map(|pair| {
                (
                    (pair[0].0 as f64 + 0.5, pair[0].1 as f64 + 0.5),
                    (pair[1].0 as f64 + 0.5, pair[1].1 as f64 + 0.5),
                )
            })
        })
        .filter(|((_, y0), (_, y1))| y0 != y1)
        .collect();

    let mut crossings = Vec::new();
    for row in 0..height {
        let y = row as f64 + 0.5;
        crossings.clear();
        for &((x0, y0), (x1, y1)) in &edges {
            let (lo, hi) = if y0 < y1 { (y0, y1) } else { (y1, y0) };
            if y >= lo && y < hi {
                crossings.push(x0 + (y - y0) * (x1 - x0) / (y1 - y0));
            }
        }
        crossings.sort_by(|a, b| a.total_cmp(b));

        for pair in crossings.chunks_exact(2) {
            let start = (pair[0] - 0.5).ceil().max(0.0) as usize;
            let end = ((pair[1] - 0.5).ceil().max(0.0) as usize).min(width);
            for col in start..end {
                mask[[row, col]] = 1;
            }
        }
    }

    mask
}

/// Segmentation map of a site on the grid of an imagery stack.
///
/// The result has the (y, x) shape of one time slice of the stack.
pub fn make_segmentation_map(
    feature: &PolygonFeature,
    stack: &ImageryStack,
) -> SolarResult<SegmentationMask> {
    MaskRasterizer::for_stack(stack)?.rasterize(feature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Crs, GeoTransform};

    fn geographic_grid(height: usize, width: usize) -> GeoGrid {
        // 0.1 degree pixels with origin at (0, height / 10)
        GeoGrid::new(
            GeoTransform::north_up(0.0, height as f64 / 10.0, 0.1, 0.1),
            Some(Crs::Geographic),
            height,
            width,
        )
    }

    #[test]
    fn test_rectangle_on_pixel_centers() {
        let rings = vec![vec![(2, 3), (6, 3), (6, 5), (2, 5), (2, 3)]];
        let mask = burn_rings(&rings, (10, 10));
        assert_eq!(mask.sum(), 4 * 2);
        assert_eq!(mask[[3, 2]], 1);
        assert_eq!(mask[[4, 5]], 1);
        assert_eq!(mask[[5, 2]], 0);
        assert_eq!(mask[[3, 6]], 0);
    }

    #[test]
    fn test_hole_is_left_empty() {
        let rings = vec![
            vec![(0, 0), (8, 0), (8, 8), (0, 8), (0, 0)],
            vec![(2, 2), (4, 2), (4, 4), (2, 4), (2, 2)],
        ];
        let mask = burn_rings(&rings, (10, 10));
        assert_eq!(mask.sum(), 64 - 4);
        assert_eq!(mask[[2, 2]], 0);
        assert_eq!(mask[[1, 1]], 1);
    }

    #[test]
    fn test_snap_is_nearest_and_clamped() {
        let rasterizer = MaskRasterizer::new(geographic_grid(10, 10)).unwrap();
        // (0.26, 0.74) lies inside pixel (2, 2)
        assert_eq!(rasterizer.snap_point(0.26, 0.74).unwrap(), (2, 2));
        assert_eq!(rasterizer.snap_point(-5.0, 50.0).unwrap(), (0, 0));
        assert_eq!(rasterizer.snap_point(5.0, -5.0).unwrap(), (9, 9));
    }

    #[test]
    fn test_snapping_pixel_centers_is_stable() {
        let rasterizer = MaskRasterizer::new(geographic_grid(10, 10)).unwrap();
        for vertex in [(0, 0), (3, 7), (9, 9)] {
            let (x, y) = rasterizer.pixel_center(vertex);
            assert_eq!(rasterizer.snap_point(x, y).unwrap(), vertex);
        }
    }

    #[test]
    fn test_feature_on_geographic_grid() {
        let rasterizer = MaskRasterizer::new(geographic_grid(10, 10)).unwrap();
        let feature = PolygonFeature::from_ring(vec![
            [0.21, 0.21],
            [0.61, 0.21],
            [0.61, 0.81],
            [0.21, 0.81],
            [0.21, 0.21],
        ])
        .unwrap();

        let mask = rasterizer.rasterize(&feature).unwrap();
        assert_eq!(mask.dim(), (10, 10));
        // cols 2..6 and rows 1..7 (y grows downwards in pixel space)
        assert_eq!(mask.sum(), 4 * 6);
        assert!(mask.iter().all(|&v| v <= 1));
    }

    #[test]
    fn test_missing_crs_is_an_error() {
        let grid = GeoGrid::new(GeoTransform::north_up(0.0, 1.0, 0.1, 0.1), None, 10, 10);
        match MaskRasterizer::new(grid) {
            Err(SolarError::MissingSpatialReference(_)) => {}
            other => panic!("expected missing spatial reference, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_degenerate_polygon_is_empty() {
        let rasterizer = MaskRasterizer::new(geographic_grid(10, 10)).unwrap();
        let sliver = PolygonFeature::from_ring(vec![
            [0.51, 0.51],
            [0.52, 0.51],
            [0.52, 0.52],
            [0.51, 0.51],
        ])
        .unwrap();
        let mask = rasterizer.rasterize(&sliver).unwrap();
        assert_eq!(mask.sum(), 0);
    }

    #[test]
    fn test_subpixel_check_uses_angular_units() {
        // roughly 110 m x 110 m site
        let site = PolygonFeature::from_ring(vec![
            [-79.700, 43.400],
            [-79.6986, 43.400],
            [-79.6986, 43.401],
            [-79.700, 43.401],
        ])
        .unwrap();

        // NAD83 grid with 0.01 degree (~800 m) pixels
        let coarse = GeoGrid::new(
            GeoTransform::north_up(-79.8, 43.5, 0.01, 0.01),
            Some(Crs::Epsg(4269)),
            20,
            20,
        );
        assert!(MaskRasterizer::new(coarse).unwrap().check_subpixel(&site));

        let fine = GeoGrid::new(
            GeoTransform::north_up(-79.8, 43.5, 0.0001, 0.0001),
            Some(Crs::Epsg(4269)),
            2000,
            2000,
        );
        assert!(!MaskRasterizer::new(fine).unwrap().check_subpixel(&site));
    }
}
