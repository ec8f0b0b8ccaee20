//! Coordinate transforms between WGS84 lon/lat and imagery grids.
//!
//! Geographic grids are passed through unchanged; every projected CRS,
//! including the UTM zones Sentinel-2 tiles use, goes through GDAL/PROJ.

use crate::core::geodesy::utm_zone;
use crate::types::{BoundingBox, Crs, PolygonFeature, SolarError, SolarResult};
use gdal::spatial_ref::{CoordTransform, SpatialRef};

/// Forward/inverse mapping between geographic lon/lat and a target CRS
pub trait CoordinateTransform {
    /// Target CRS of `forward`
    fn target(&self) -> Crs;

    /// Whether target coordinates are angular (degrees) rather than linear
    fn is_geographic(&self) -> bool;

    /// lon/lat degrees -> target (x, y)
    fn forward(&self, lon: f64, lat: f64) -> SolarResult<(f64, f64)>;

    /// target (x, y) -> lon/lat degrees
    fn inverse(&self, x: f64, y: f64) -> SolarResult<(f64, f64)>;

    fn forward_many(&self, points: &[[f64; 2]]) -> SolarResult<Vec<(f64, f64)>> {
        points.iter().map(|p| self.forward(p[0], p[1])).collect()
    }
}

/// Transform for the CRS of an imagery grid
pub fn transformer_for(crs: Crs) -> SolarResult<Box<dyn CoordinateTransform>> {
    match crs {
        Crs::Geographic => Ok(Box::new(GeographicIdentity)),
        Crs::Utm { zone, .. } if !(1..=60).contains(&zone) => {
            Err(SolarError::Projection(format!("invalid UTM zone {}", zone)))
        }
        other => Ok(Box::new(GdalTransform::new(other.epsg())?)),
    }
}

/// UTM CRS whose zone contains the centroid of the feature's bounds
pub fn local_utm_crs(feature: &PolygonFeature) -> Crs {
    let bounds = feature.bounds();
    let lon = (bounds.min_x + bounds.max_x) / 2.0;
    let lat = (bounds.min_y + bounds.max_y) / 2.0;
    Crs::Utm { zone: utm_zone(lat, lon), north: lat >= 0.0 }
}

/// Bounds of every reprojected vertex of the feature, holes and extra
/// polygon parts included
pub fn projected_bounds(
    feature: &PolygonFeature,
    transform: &dyn CoordinateTransform,
) -> SolarResult<BoundingBox> {
    let vertices: Vec<[f64; 2]> = feature.rings().iter().flatten().copied().collect();
    let points = transform.forward_many(&vertices)?;
    BoundingBox::from_points(points)
        .ok_or_else(|| SolarError::InvalidGeometry("feature has no vertices".to_string()))
}

/// EPSG:4326 to itself
#[derive(Debug, Clone, Copy, Default)]
pub struct GeographicIdentity;

impl CoordinateTransform for GeographicIdentity {
    fn target(&self) -> Crs {
        Crs::Geographic
    }

    fn is_geographic(&self) -> bool {
        true
    }

    fn forward(&self, lon: f64, lat: f64) -> SolarResult<(f64, f64)> {
        Ok((lon, lat))
    }

    fn inverse(&self, x: f64, y: f64) -> SolarResult<(f64, f64)> {
        Ok((x, y))
    }
}

/// GDAL/PROJ backed transform for an EPSG code
pub struct GdalTransform {
    code: u32,
    geographic_target: bool,
    to_target: CoordTransform,
    to_geographic: CoordTransform,
}

impl GdalTransform {
    pub fn new(code: u32) -> SolarResult<Self> {
        log::debug!("Creating GDAL coordinate transform EPSG:4326 -> EPSG:{}", code);

        let mut geographic = SpatialRef::from_epsg(4326)?;
        let mut target = SpatialRef::from_epsg(code)?;
        // lon/lat order regardless of the EPSG axis definition
        geographic.set_axis_mapping_strategy(
            gdal_sys::OSRAxisMappingStrategy::OAMS_TRADITIONAL_GIS_ORDER,
        );
        target.set_axis_mapping_strategy(
            gdal_sys::OSRAxisMappingStrategy::OAMS_TRADITIONAL_GIS_ORDER,
        );

        Ok(Self {
            code,
            geographic_target: target.is_geographic(),
            to_target: CoordTransform::new(&geographic, &target)?,
            to_geographic: CoordTransform::new(&target, &geographic)?,
        })
    }

    fn run(transform: &CoordTransform, x: f64, y: f64) -> SolarResult<(f64, f64)> {
        let mut xs = [x];
        let mut ys = [y];
        let mut zs = [0.0];
        transform.transform_coords(&mut xs, &mut ys, &mut zs)?;
        if !xs[0].is_finite() || !ys[0].is_finite() {
            return Err(SolarError::Projection(format!(
                "({}, {}) has no finite image", x, y
            )));
        }
        Ok((xs[0], ys[0]))
    }
}

impl CoordinateTransform for GdalTransform {
    fn target(&self) -> Crs {
        Crs::from_epsg(self.code)
    }

    fn is_geographic(&self) -> bool {
        self.geographic_target
    }

    fn forward(&self, lon: f64, lat: f64) -> SolarResult<(f64, f64)> {
        Self::run(&self.to_target, lon, lat)
    }

    fn inverse(&self, x: f64, y: f64) -> SolarResult<(f64, f64)> {
        Self::run(&self.to_geographic, x, y)
    }

    fn forward_many(&self, points: &[[f64; 2]]) -> SolarResult<Vec<(f64, f64)>> {
        let mut xs: Vec<f64> = points.iter().map(|p| p[0]).collect();
        let mut ys: Vec<f64> = points.iter().map(|p| p[1]).collect();
        let mut zs = vec![0.0; points.len()];
        self.to_target.transform_coords(&mut xs, &mut ys, &mut zs)?;
        Ok(xs.into_iter().zip(ys).collect())
    }
}
