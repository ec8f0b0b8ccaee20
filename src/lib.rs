//! solar-mapper: training examples for satellite solar panel segmentation
//!
//! Samples imagery time windows for known or candidate photovoltaic sites and
//! rasterizes each site's footprint into a segmentation mask aligned with the
//! imagery grid.

pub mod types;
pub mod io;
pub mod core;

#[cfg(feature = "python")]
mod python;

// Re-export main types and functions for easier access
pub use crate::types::{
    BoundingBox, Crs, GeoGrid, GeoTransform, ImageryStack, PolygonFeature, SegmentationMask,
    SolarError, SolarResult, TimeWindow, TrainingExample, SEGMENTATION_MAP_LAYER,
};

pub use crate::io::{ImageryQuery, InMemoryCatalog, PolygonStore, QueryParams, Scene};
pub use crate::core::{
    get_example_with_segmentation_map, make_segmentation_map, randomly_sample_from_valid_times,
    ExampleParams, MaskRasterizer, SamplerParams, TimeSampler,
};
