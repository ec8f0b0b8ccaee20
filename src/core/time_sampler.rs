use crate::io::imagery::{ImageryQuery, QueryParams};
use crate::types::{ImageryStack, PolygonFeature, SolarError, SolarResult, TimeWindow};
use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Time sampling parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerParams {
    /// Earliest time a window may start
    pub start_time: DateTime<Utc>,
    /// Latest time a window may start (shifted past the install date when needed)
    pub end_time: DateTime<Utc>,
    /// Length of each sampled window in days
    pub search_delta_days: i64,
    /// Maximum number of scenes requested per window
    pub num_samples: usize,
}

impl Default for SamplerParams {
    fn default() -> Self {
        Self {
            start_time: utc_midnight(2015, 1, 1),
            end_time: utc_midnight(2018, 12, 31),
            search_delta_days: 90,
            num_samples: 8,
        }
    }
}

fn utc_midnight(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl SamplerParams {
    /// Window length; must be positive and representable
    pub fn search_delta(&self) -> SolarResult<Duration> {
        match Duration::try_days(self.search_delta_days) {
            Some(delta) if delta > Duration::zero() => Ok(delta),
            _ => Err(SolarError::InvalidWindow(format!(
                "search delta must be a positive number of days, got {}",
                self.search_delta_days
            ))),
        }
    }
}

fn shifted(time: DateTime<Utc>, delta: Duration) -> SolarResult<DateTime<Utc>> {
    time.checked_add_signed(delta).ok_or_else(|| {
        SolarError::InvalidWindow(format!("{} shifted by {} is out of range", time, delta))
    })
}

/// Picks random imagery windows for PV sites
#[derive(Debug, Clone, Default)]
pub struct TimeSampler {
    params: SamplerParams,
}

impl TimeSampler {
    pub fn new(params: SamplerParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &SamplerParams {
        &self.params
    }

    /// Range `[max(start, install), max(end, install + delta)]` a window must lie in
    pub fn valid_range(&self, feature: &PolygonFeature) -> SolarResult<TimeWindow> {
        let delta = self.params.search_delta()?;
        if self.params.end_time < self.params.start_time {
            return Err(SolarError::InvalidWindow(format!(
                "end time {} precedes start time {}",
                self.params.end_time, self.params.start_time
            )));
        }

        let install = feature.install_date()?.unwrap_or(self.params.start_time);
        let start = self.params.start_time.max(install);
        let end = self.params.end_time.max(shifted(install, delta)?);
        Ok(TimeWindow::new(start, end))
    }

    /// Uniformly drawn window of length `search_delta` inside the valid range.
    ///
    /// When the valid range is shorter than `search_delta` the earliest window
    /// is returned.
    pub fn sample_window<R: Rng + ?Sized>(
        &self,
        feature: &PolygonFeature,
        rng: &mut R,
    ) -> SolarResult<TimeWindow> {
        let range = self.valid_range(feature)?;
        let delta = self.params.search_delta()?;
        let slack = (range.duration() - delta).num_seconds();

        let offset = if slack > 0 { rng.gen_range(0..=slack) } else { 0 };
        let start = shifted(range.start, Duration::seconds(offset))?;
        let window = TimeWindow::new(start, shifted(start, delta)?);
        log::debug!(
            "Sampled window {} (offset {}s of {}s) for feature {:?}",
            window.to_stac_range(),
            offset,
            slack.max(0),
            feature.id
        );
        Ok(window)
    }

    /// Sample a window and fetch up to `num_samples` scenes for it.
    ///
    /// An empty result is reported as `SolarError::NoData`, which callers
    /// retry by drawing another example.
    pub fn sample<Q, R>(
        &self,
        feature: &PolygonFeature,
        query: &Q,
        query_params: &QueryParams,
        rng: &mut R,
    ) -> SolarResult<(TimeWindow, ImageryStack)>
    where
        Q: ImageryQuery + ?Sized,
        R: Rng + ?Sized,
    {
        let window = self.sample_window(feature, rng)?;
        let params = QueryParams {
            max_scenes: self.params.num_samples,
            ..query_params.clone()
        };

        let stack = query.query(feature, &window, &params)?;
        if stack.is_empty() {
            return Err(SolarError::NoData(format!(
                "no scenes for feature {:?} in {}",
                feature.id,
                window.to_stac_range()
            )));
        }

        log::info!(
            "Found {} scene(s) for feature {:?} in {}",
            stack.len(),
            feature.id,
            window.to_stac_range()
        );
        Ok((window, stack))
    }
}

/// Draw a random window for `feature` and query imagery for it
pub fn randomly_sample_from_valid_times<Q, R>(
    feature: &PolygonFeature,
    query: &Q,
    params: &SamplerParams,
    query_params: &QueryParams,
    rng: &mut R,
) -> SolarResult<(TimeWindow, ImageryStack)>
where
    Q: ImageryQuery + ?Sized,
    R: Rng + ?Sized,
{
    TimeSampler::new(params.clone()).sample(feature, query, query_params, rng)
}
