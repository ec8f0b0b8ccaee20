//! Core example assembly: time sampling, reprojection and mask rasterization

pub mod geodesy;
pub mod projection;
pub mod time_sampler;
pub mod mask;
pub mod example;

// Re-export main types
pub use geodesy::{utm_zone, vincenty_inverse, GeodesicInverse};
pub use projection::{
    local_utm_crs, projected_bounds, transformer_for, CoordinateTransform, GdalTransform,
    GeographicIdentity,
};
pub use time_sampler::{randomly_sample_from_valid_times, SamplerParams, TimeSampler};
pub use mask::{burn_rings, make_segmentation_map, MaskRasterizer, PixelVertex};
pub use example::{get_example_with_segmentation_map, ExampleParams};
