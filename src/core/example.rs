use crate::core::mask::MaskRasterizer;
use crate::core::time_sampler::{SamplerParams, TimeSampler};
use crate::io::imagery::{ImageryQuery, QueryParams};
use crate::types::{
    PolygonFeature, SolarResult, TrainingExample, SEGMENTATION_MAP_LAYER,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Run configuration for example assembly
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExampleParams {
    pub sampler: SamplerParams,
    pub query: QueryParams,
}

impl ExampleParams {
    /// Load parameters from a JSON file; missing fields take their defaults
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> SolarResult<Self> {
        log::info!("Reading example parameters from {}", path.as_ref().display());
        let text = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Sample imagery for a site and attach its segmentation map.
///
/// `SolarError::NoData` means the drawn window had no usable scenes; draw
/// again (possibly with another site) to retry.
pub fn get_example_with_segmentation_map<Q, R>(
    feature: &PolygonFeature,
    query: &Q,
    params: &ExampleParams,
    rng: &mut R,
) -> SolarResult<TrainingExample>
where
    Q: ImageryQuery + ?Sized,
    R: Rng + ?Sized,
{
    let sampler = TimeSampler::new(params.sampler.clone());
    let (window, stack) = sampler.sample(feature, query, &params.query, rng)?;

    let mask = MaskRasterizer::for_stack(&stack)?.rasterize(feature)?;
    log::info!(
        "Built example for feature {:?}: {} scene(s), {} site pixel(s)",
        feature.id,
        stack.len(),
        mask.iter().filter(|&&v| v == 1).count()
    );

    let mut layers = BTreeMap::new();
    layers.insert(SEGMENTATION_MAP_LAYER.to_string(), mask);
    Ok(TrainingExample { window, stack, layers })
}
