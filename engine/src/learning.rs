//! Heating-time learning: every idle→heating→target-reached episode becomes a
//! sample, and samples predict how long the next warm-up will take.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, FixedOffset};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    config::LearningConfig,
    error::EngineError,
    types::{AreaId, HeatDecision},
};

/// Ranks back at which a sample's recency weight has halved.
const RECENCY_HALF_LIFE: f32 = 10.0;
/// Outdoor difference, °C, at which a sample's similarity weight has halved.
const OUTDOOR_SIMILARITY_SCALE: f32 = 5.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeatingEvent {
    pub area_id: AreaId,
    pub started_at: DateTime<FixedOffset>,
    pub start_temperature: f32,
    pub target_temperature: f32,
    pub ended_at: Option<DateTime<FixedOffset>>,
    pub outdoor_temperature: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeatingSample {
    pub area_id: AreaId,
    pub started_at: DateTime<FixedOffset>,
    pub start_temperature: f32,
    pub end_temperature: f32,
    pub outdoor_temperature: Option<f32>,
    pub duration_minutes: f32,
}

impl HeatingSample {
    fn from_event(event: &HeatingEvent, end_temperature: f32) -> Option<Self> {
        let ended_at = event.ended_at?;
        if ended_at < event.started_at {
            return None;
        }
        let duration_minutes = (ended_at - event.started_at).num_seconds() as f32 / 60.0;
        if duration_minutes <= 0.0 || end_temperature <= event.start_temperature {
            return None;
        }
        Some(Self {
            area_id: event.area_id.clone(),
            started_at: event.started_at,
            start_temperature: event.start_temperature,
            end_temperature,
            outdoor_temperature: event.outdoor_temperature,
            duration_minutes,
        })
    }

    pub fn rate_per_minute(&self) -> f32 {
        (self.end_temperature - self.start_temperature) / self.duration_minutes
    }
}

#[derive(Debug, Clone, Default)]
pub struct SampleStore {
    capacity: usize,
    samples: HashMap<AreaId, VecDeque<HeatingSample>>,
}

impl SampleStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            samples: HashMap::new(),
        }
    }

    pub fn push(&mut self, sample: HeatingSample) {
        let samples = self.samples.entry(sample.area_id.clone()).or_default();
        samples.push_back(sample);
        while samples.len() > self.capacity {
            samples.pop_front();
        }
    }

    pub fn for_area(&self, area_id: &str) -> impl Iterator<Item = &HeatingSample> {
        self.samples.get(area_id).into_iter().flatten()
    }

    pub fn count(&self, area_id: &str) -> usize {
        self.samples.get(area_id).map_or(0, VecDeque::len)
    }

    pub fn areas(&self) -> impl Iterator<Item = &AreaId> {
        self.samples.keys()
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        for samples in self.samples.values_mut() {
            while samples.len() > self.capacity {
                samples.pop_front();
            }
        }
    }

    pub fn remove_area(&mut self, area_id: &str) {
        self.samples.remove(area_id);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LearningOutcome {
    Opened,
    Recorded(HeatingSample),
    Discarded,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Prediction {
    pub minutes: f32,
    pub rate_per_hour: f32,
    pub samples: usize,
    /// Too few samples; the static rate was used.
    pub fallback: bool,
}

impl Prediction {
    pub fn duration(&self) -> Duration {
        Duration::seconds((self.minutes * 60.0).round() as i64)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LearningStats {
    pub area_id: AreaId,
    pub samples: usize,
    pub average_rate_per_hour: Option<f32>,
    pub in_progress: bool,
}

#[derive(Debug, Clone)]
pub struct Predictor {
    config: LearningConfig,
    open: HashMap<AreaId, HeatingEvent>,
    store: SampleStore,
}

impl Predictor {
    pub fn new(config: &LearningConfig) -> Self {
        Self {
            config: config.clone(),
            open: HashMap::new(),
            store: SampleStore::new(config.max_samples_per_area),
        }
    }

    pub fn reconfigure(&mut self, config: &LearningConfig) {
        self.config = config.clone();
        self.store.set_capacity(config.max_samples_per_area);
    }

    pub fn open_event(&self, area_id: &str) -> Option<&HeatingEvent> {
        self.open.get(area_id)
    }

    pub fn sample_count(&self, area_id: &str) -> usize {
        self.store.count(area_id)
    }

    /// Feeds one decision transition of an area into the event store.
    #[allow(clippy::too_many_arguments)]
    pub fn observe(
        &mut self,
        area_id: &str,
        previous: HeatDecision,
        next: HeatDecision,
        current: Option<f32>,
        target: f32,
        outdoor: Option<f32>,
        now: DateTime<FixedOffset>,
    ) -> Option<LearningOutcome> {
        match (previous, next) {
            (HeatDecision::Idle, HeatDecision::Heating) => {
                let current = current?;
                self.open.insert(
                    area_id.to_string(),
                    HeatingEvent {
                        area_id: area_id.to_string(),
                        started_at: now,
                        start_temperature: current,
                        target_temperature: target,
                        ended_at: None,
                        outdoor_temperature: outdoor,
                    },
                );
                Some(LearningOutcome::Opened)
            }
            (HeatDecision::Heating, HeatDecision::Idle) => {
                let mut event = self.open.remove(area_id)?;
                event.ended_at = Some(now);

                let reached = current.filter(|current| *current >= event.target_temperature);
                let sample = reached.and_then(|end| HeatingSample::from_event(&event, end));
                match sample {
                    Some(sample) => {
                        debug!(
                            area = area_id,
                            minutes = sample.duration_minutes,
                            rate = sample.rate_per_minute() * 60.0,
                            "heating sample recorded"
                        );
                        self.store.push(sample.clone());
                        Some(LearningOutcome::Recorded(sample))
                    }
                    None => Some(LearningOutcome::Discarded),
                }
            }
            _ => None,
        }
    }

    /// Drops an in-progress event without recording it.
    pub fn discard(&mut self, area_id: &str) -> bool {
        self.open.remove(area_id).is_some()
    }

    pub fn forget_area(&mut self, area_id: &str) {
        self.open.remove(area_id);
        self.store.remove_area(area_id);
    }

    pub fn predict(
        &self,
        area_id: &str,
        current: f32,
        target: f32,
        outdoor: Option<f32>,
    ) -> Prediction {
        let samples: Vec<&HeatingSample> = self
            .store
            .for_area(area_id)
            .filter(|sample| sample.rate_per_minute() > 0.0)
            .collect();

        let learned = if samples.len() >= self.config.min_samples.max(1) {
            weighted_rate(&samples, outdoor)
        } else {
            let err = EngineError::InsufficientLearningData {
                area: area_id.to_string(),
                samples: samples.len(),
                required: self.config.min_samples,
            };
            debug!(%err, "using fallback heating rate");
            None
        };

        let (rate_per_minute, fallback) = match learned {
            Some(rate) => (rate, false),
            None => (self.config.fallback_rate_per_hour.max(0.01) / 60.0, true),
        };

        let delta = target - current;
        let minutes = if delta <= 0.0 {
            0.0
        } else {
            (delta / rate_per_minute).min(self.config.max_prediction_minutes as f32)
        };

        Prediction {
            minutes,
            rate_per_hour: rate_per_minute * 60.0,
            samples: samples.len(),
            fallback,
        }
    }

    /// Latest moment heating may start and still reach `target` a safety
    /// margin before `deadline`.
    pub fn preheat_start(
        &self,
        area_id: &str,
        deadline: DateTime<FixedOffset>,
        current: f32,
        target: f32,
        outdoor: Option<f32>,
    ) -> DateTime<FixedOffset> {
        let prediction = self.predict(area_id, current, target, outdoor);
        deadline - prediction.duration() - Duration::minutes(self.config.safety_margin_minutes)
    }

    pub fn stats(&self) -> Vec<LearningStats> {
        let mut areas: Vec<&AreaId> = self.store.areas().chain(self.open.keys()).collect();
        areas.sort();
        areas.dedup();

        areas
            .into_iter()
            .map(|area_id| {
                let samples: Vec<&HeatingSample> = self.store.for_area(area_id).collect();
                let average_rate_per_hour = (!samples.is_empty()).then(|| {
                    samples.iter().map(|sample| sample.rate_per_minute()).sum::<f32>() * 60.0
                        / samples.len() as f32
                });
                LearningStats {
                    area_id: area_id.clone(),
                    samples: samples.len(),
                    average_rate_per_hour,
                    in_progress: self.open.contains_key(area_id),
                }
            })
            .collect()
    }

    pub fn export(&self) -> Vec<HeatingSample> {
        let mut samples: Vec<HeatingSample> = self
            .store
            .samples
            .values()
            .flatten()
            .cloned()
            .collect();
        samples.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        samples
    }

    /// Replaces the sample store. Samples are replayed oldest first so the
    /// per-area cap keeps the newest.
    pub fn import(&mut self, mut samples: Vec<HeatingSample>) -> usize {
        samples.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        self.store = SampleStore::new(self.config.max_samples_per_area);
        let mut imported = 0;
        for sample in samples {
            if sample.duration_minutes > 0.0 && sample.rate_per_minute().is_finite() {
                self.store.push(sample);
                imported += 1;
            }
        }
        imported
    }
}

/// Recency- and outdoor-similarity-weighted mean rate, corrected along the
/// least-squares fit of rate against outdoor temperature.
fn weighted_rate(samples: &[&HeatingSample], outdoor: Option<f32>) -> Option<f32> {
    let newest_first = samples.iter().rev().enumerate();

    let mut weight_sum = 0.0;
    let mut rate_sum = 0.0;
    let mut outdoor_sum = 0.0;
    let mut outdoor_weight = 0.0;
    for (rank, sample) in newest_first {
        let recency = 0.5f32.powf(rank as f32 / RECENCY_HALF_LIFE);
        let similarity = match (outdoor, sample.outdoor_temperature) {
            (Some(now), Some(then)) => 1.0 / (1.0 + (now - then).abs() / OUTDOOR_SIMILARITY_SCALE),
            _ => 1.0,
        };
        let weight = recency * similarity;
        weight_sum += weight;
        rate_sum += weight * sample.rate_per_minute();
        if let Some(then) = sample.outdoor_temperature {
            outdoor_sum += weight * then;
            outdoor_weight += weight;
        }
    }
    if weight_sum <= 0.0 {
        return None;
    }
    let mean_rate = rate_sum / weight_sum;

    let corrected = match (outdoor, outdoor_slope(samples)) {
        (Some(now), Some(slope)) if outdoor_weight > 0.0 => {
            let mean_outdoor = outdoor_sum / outdoor_weight;
            mean_rate + slope * (now - mean_outdoor)
        }
        _ => mean_rate,
    };

    // The correction may not turn a warm-up into a cool-down.
    Some(corrected.max(mean_rate * 0.1))
}

fn outdoor_slope(samples: &[&HeatingSample]) -> Option<f32> {
    let points: Vec<(f32, f32)> = samples
        .iter()
        .filter_map(|sample| {
            sample
                .outdoor_temperature
                .map(|outdoor| (outdoor, sample.rate_per_minute()))
        })
        .collect();
    if points.len() < 2 {
        return None;
    }

    let n = points.len() as f32;
    let mean_x = points.iter().map(|(x, _)| x).sum::<f32>() / n;
    let mean_y = points.iter().map(|(_, y)| y).sum::<f32>() / n;
    let sxx: f32 = points.iter().map(|(x, _)| (x - mean_x).powi(2)).sum();
    if sxx < 1e-6 {
        return None;
    }
    let sxy: f32 = points
        .iter()
        .map(|(x, y)| (x - mean_x) * (y - mean_y))
        .sum();
    Some(sxy / sxx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::at;
    use pretty_assertions::assert_eq;

    fn predictor() -> Predictor {
        Predictor::new(&LearningConfig::default())
    }

    fn heat(
        predictor: &mut Predictor,
        start: DateTime<FixedOffset>,
        minutes: i64,
        from: f32,
        to: f32,
        outdoor: Option<f32>,
    ) -> Option<LearningOutcome> {
        predictor.observe("living", HeatDecision::Idle, HeatDecision::Heating, Some(from), to, outdoor, start);
        predictor.observe(
            "living",
            HeatDecision::Heating,
            HeatDecision::Idle,
            Some(to),
            to,
            outdoor,
            start + Duration::minutes(minutes),
        )
    }

    #[test]
    fn completed_episode_becomes_one_sample() {
        let mut predictor = predictor();
        let start = at(5, 6, 0);
        let outcome = heat(&mut predictor, start, 40, 18.0, 21.0, Some(5.0));

        let sample = match outcome {
            Some(LearningOutcome::Recorded(sample)) => sample,
            other => panic!("expected a sample, got {other:?}"),
        };
        assert_eq!(sample.duration_minutes, 40.0);
        assert_eq!(sample.start_temperature, 18.0);
        assert_eq!(predictor.sample_count("living"), 1);
        assert!(predictor.open_event("living").is_none());
    }

    #[test]
    fn stopping_short_of_target_discards() {
        let mut predictor = predictor();
        let start = at(5, 6, 0);
        predictor.observe("living", HeatDecision::Idle, HeatDecision::Heating, Some(18.0), 21.0, None, start);
        let outcome = predictor.observe(
            "living",
            HeatDecision::Heating,
            HeatDecision::Idle,
            Some(19.5),
            21.0,
            None,
            start + Duration::minutes(20),
        );
        assert_eq!(outcome, Some(LearningOutcome::Discarded));
        assert_eq!(predictor.sample_count("living"), 0);
    }

    #[test]
    fn backwards_clock_discards() {
        let mut predictor = predictor();
        let start = at(5, 6, 0);
        let outcome = heat(&mut predictor, start, -5, 18.0, 21.0, None);
        assert_eq!(outcome, Some(LearningOutcome::Discarded));
        assert_eq!(predictor.sample_count("living"), 0);
    }

    #[test]
    fn explicit_discard_leaves_store_untouched() {
        let mut predictor = predictor();
        heat(&mut predictor, at(5, 6, 0), 40, 18.0, 21.0, None);
        predictor.observe("living", HeatDecision::Idle, HeatDecision::Heating, Some(18.0), 21.0, None, at(6, 6, 0));

        assert!(predictor.discard("living"));
        assert_eq!(predictor.sample_count("living"), 1);
        // The later Heating→Idle has no open event to close.
        let outcome = predictor.observe(
            "living",
            HeatDecision::Heating,
            HeatDecision::Idle,
            Some(21.0),
            21.0,
            None,
            at(6, 7, 0),
        );
        assert_eq!(outcome, None);
        assert_eq!(predictor.sample_count("living"), 1);
    }

    #[test]
    fn falls_back_below_min_samples() {
        let mut predictor = predictor();
        heat(&mut predictor, at(5, 6, 0), 30, 18.0, 21.0, None);

        let prediction = predictor.predict("living", 19.0, 21.0, None);
        assert!(prediction.fallback);
        assert_eq!(prediction.samples, 1);
        assert!((prediction.minutes - 120.0).abs() < 0.01);
    }

    #[test]
    fn learned_rate_predicts_duration() {
        let mut predictor = predictor();
        for day in 5..9 {
            heat(&mut predictor, at(day, 6, 0), 60, 18.0, 21.0, None);
        }

        let prediction = predictor.predict("living", 19.0, 21.0, None);
        assert!(!prediction.fallback);
        assert!((prediction.rate_per_hour - 3.0).abs() < 1e-3);
        assert!((prediction.minutes - 40.0).abs() < 0.1);
    }

    #[test]
    fn colder_weather_predicts_longer_warmup() {
        let mut predictor = predictor();
        // 3 °C/h at 10 °C outside, 1.5 °C/h at 0 °C.
        heat(&mut predictor, at(5, 6, 0), 60, 18.0, 21.0, Some(10.0));
        heat(&mut predictor, at(6, 6, 0), 120, 18.0, 21.0, Some(0.0));
        heat(&mut predictor, at(7, 6, 0), 60, 18.0, 21.0, Some(10.0));
        heat(&mut predictor, at(8, 6, 0), 120, 18.0, 21.0, Some(0.0));

        let mild = predictor.predict("living", 18.0, 21.0, Some(10.0));
        let cold = predictor.predict("living", 18.0, 21.0, Some(-5.0));
        assert!(cold.minutes > mild.minutes);
    }

    #[test]
    fn target_already_reached_needs_no_time() {
        let predictor = predictor();
        assert_eq!(predictor.predict("living", 21.5, 21.0, None).minutes, 0.0);
    }

    #[test]
    fn preheat_starts_before_deadline_with_margin() {
        let predictor = predictor();
        // Fallback 1 °C/h for 2 °C, plus 10 min margin.
        let start = predictor.preheat_start("living", at(5, 7, 0), 19.0, 21.0, None);
        assert_eq!(start, at(5, 4, 50));
    }

    #[test]
    fn samples_are_capped_per_area() {
        let mut predictor = Predictor::new(&LearningConfig {
            max_samples_per_area: 2,
            ..LearningConfig::default()
        });
        for day in 5..9 {
            heat(&mut predictor, at(day, 6, 0), 60, 18.0, 21.0, None);
        }
        assert_eq!(predictor.sample_count("living"), 2);
        let exported = predictor.export();
        assert_eq!(exported[0].started_at, at(7, 6, 0));
    }

    #[test]
    fn import_restores_exported_samples() {
        let mut predictor = predictor();
        for day in 5..8 {
            heat(&mut predictor, at(day, 6, 0), 60, 18.0, 21.0, None);
        }
        let mut restored = Predictor::new(&LearningConfig::default());
        assert_eq!(restored.import(predictor.export()), 3);
        assert_eq!(restored.sample_count("living"), 3);
        assert_eq!(restored.stats()[0].samples, 3);
    }
}
