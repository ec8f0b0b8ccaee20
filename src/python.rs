//! Python bindings

use crate::core::mask::MaskRasterizer;
use crate::core::time_sampler::{SamplerParams, TimeSampler};
use crate::io::polygons::parse_feature;
use crate::types::{Crs, GeoGrid, GeoTransform, SolarError};
use chrono::{DateTime, Utc};
use numpy::ToPyArray;
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn to_py_err(error: SolarError) -> PyErr {
    match error {
        SolarError::MalformedDate(_)
        | SolarError::InvalidGeometry(_)
        | SolarError::InvalidWindow(_)
        | SolarError::InvalidFormat(_)
        | SolarError::Json(_)
        | SolarError::GeoJson(_) => PyValueError::new_err(format!("{}", error)),
        other => PyRuntimeError::new_err(format!("{}", other)),
    }
}

fn parse_time(text: &str) -> PyResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| PyValueError::new_err(format!("Invalid time '{}': {}", text, e)))
}

/// Draw a time window for a GeoJSON feature; returns (start, end) as RFC 3339
#[pyfunction]
#[pyo3(signature = (feature_json, start_time, end_time, search_delta_days, seed=None))]
fn sample_time_window(
    feature_json: &str,
    start_time: &str,
    end_time: &str,
    search_delta_days: i64,
    seed: Option<u64>,
) -> PyResult<(String, String)> {
    let feature = parse_feature(feature_json).map_err(to_py_err)?;
    let sampler = TimeSampler::new(SamplerParams {
        start_time: parse_time(start_time)?,
        end_time: parse_time(end_time)?,
        search_delta_days,
        ..SamplerParams::default()
    });

    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let window = sampler.sample_window(&feature, &mut rng).map_err(to_py_err)?;
    Ok((window.start.to_rfc3339(), window.end.to_rfc3339()))
}

/// Rasterize a GeoJSON feature onto a grid given by a GDAL geotransform
#[pyfunction]
fn make_segmentation_map(
    py: Python,
    feature_json: &str,
    geo_transform: [f64; 6],
    epsg: u32,
    height: usize,
    width: usize,
) -> PyResult<PyObject> {
    let feature = parse_feature(feature_json).map_err(to_py_err)?;
    let grid = GeoGrid::new(
        GeoTransform::from_gdal(geo_transform),
        Some(Crs::from_epsg(epsg)),
        height,
        width,
    );
    let rasterizer = MaskRasterizer::new(grid).map_err(to_py_err)?;
    let mask = rasterizer.rasterize(&feature).map_err(to_py_err)?;

    let result = PyDict::new(py);
    result.set_item("segmentation_map", mask.to_pyarray(py))?;
    result.set_item("geo_transform", rasterizer.grid().transform.to_gdal().to_vec())?;
    result.set_item("pixels", mask.iter().filter(|&&v| v == 1).count())?;
    result.set_item("crs", format!("{}", Crs::from_epsg(epsg)))?;
    Ok(result.into())
}

/// Python module definition
#[pymodule]
fn _core(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(sample_time_window, m)?)?;
    m.add_function(wrap_pyfunction!(make_segmentation_map, m)?)?;
    Ok(())
}
