//! Enumerated pipeline options, validated once at construction.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ── Model identifiers ────────────────────────────────────────────────────────

/// Architecture family; decides chunk size, input resolution and output
/// conventions in the model registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelFamily {
    MeChunk,
    MeFlow,
    PhysMamba,
    RhythmMamba,
    PhysFormer,
    Tscan,
    PhysNet,
    EfficientPhys,
}

/// Supported signal-extraction models. The suffix names the training set.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub enum ModelId {
    #[default]
    MeChunkRlap,
    MeFlowRlap,
    MeChunkPure,
    MeFlowPure,
    PhysMambaPure,
    PhysMambaRlap,
    RhythmMambaRlap,
    RhythmMambaPure,
    PhysFormerPure,
    PhysFormerRlap,
    TscanRlap,
    TscanPure,
    PhysNetRlap,
    PhysNetPure,
    EfficientPhysPure,
    EfficientPhysRlap,
}

impl ModelId {
    pub const ALL: [ModelId; 16] = [
        ModelId::MeChunkRlap,
        ModelId::MeFlowRlap,
        ModelId::MeChunkPure,
        ModelId::MeFlowPure,
        ModelId::PhysMambaPure,
        ModelId::PhysMambaRlap,
        ModelId::RhythmMambaRlap,
        ModelId::RhythmMambaPure,
        ModelId::PhysFormerPure,
        ModelId::PhysFormerRlap,
        ModelId::TscanRlap,
        ModelId::TscanPure,
        ModelId::PhysNetRlap,
        ModelId::PhysNetPure,
        ModelId::EfficientPhysPure,
        ModelId::EfficientPhysRlap,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ModelId::MeChunkRlap => "ME-chunk.rlap",
            ModelId::MeFlowRlap => "ME-flow.rlap",
            ModelId::MeChunkPure => "ME-chunk.pure",
            ModelId::MeFlowPure => "ME-flow.pure",
            ModelId::PhysMambaPure => "PhysMamba.pure",
            ModelId::PhysMambaRlap => "PhysMamba.rlap",
            ModelId::RhythmMambaRlap => "RhythmMamba.rlap",
            ModelId::RhythmMambaPure => "RhythmMamba.pure",
            ModelId::PhysFormerPure => "PhysFormer.pure",
            ModelId::PhysFormerRlap => "PhysFormer.rlap",
            ModelId::TscanRlap => "TSCAN.rlap",
            ModelId::TscanPure => "TSCAN.pure",
            ModelId::PhysNetRlap => "PhysNet.rlap",
            ModelId::PhysNetPure => "PhysNet.pure",
            ModelId::EfficientPhysPure => "EfficientPhys.pure",
            ModelId::EfficientPhysRlap => "EfficientPhys.rlap",
        }
    }

    pub fn family(self) -> ModelFamily {
        match self {
            ModelId::MeChunkRlap | ModelId::MeChunkPure => ModelFamily::MeChunk,
            ModelId::MeFlowRlap | ModelId::MeFlowPure => ModelFamily::MeFlow,
            ModelId::PhysMambaPure | ModelId::PhysMambaRlap => ModelFamily::PhysMamba,
            ModelId::RhythmMambaRlap | ModelId::RhythmMambaPure => ModelFamily::RhythmMamba,
            ModelId::PhysFormerPure | ModelId::PhysFormerRlap => ModelFamily::PhysFormer,
            ModelId::TscanRlap | ModelId::TscanPure => ModelFamily::Tscan,
            ModelId::PhysNetRlap | ModelId::PhysNetPure => ModelFamily::PhysNet,
            ModelId::EfficientPhysPure | ModelId::EfficientPhysRlap => ModelFamily::EfficientPhys,
        }
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ModelId::ALL
            .into_iter()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| Error::UnknownModel(s.to_string()))
    }
}

impl TryFrom<String> for ModelId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ModelId> for String {
    fn from(id: ModelId) -> Self {
        id.as_str().to_string()
    }
}

// ── Option groups ────────────────────────────────────────────────────────────

/// Pass band shared by the Butterworth filter, the detrend smoothness and
/// the signal-quality lag search.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BandConfig {
    pub low_hz: f64,
    pub high_hz: f64,
    pub order: usize,
}

impl Default for BandConfig {
    fn default() -> Self {
        Self {
            low_hz: 0.5,
            high_hz: 3.0,
            order: 3,
        }
    }
}

/// Heart-rate search band in beats per minute.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HrBand {
    pub min_bpm: f64,
    pub max_bpm: f64,
}

impl Default for HrBand {
    fn default() -> Self {
        Self {
            min_bpm: 30.0,
            max_bpm: 180.0,
        }
    }
}

/// Scalar Kalman parameters applied independently to each box coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KalmanConfig {
    pub process_noise: f64,
    pub measurement_noise: f64,
    pub initial_error: f64,
    /// Frame spacing (seconds) at which `process_noise` applies unscaled.
    pub reference_interval: f64,
}

impl Default for KalmanConfig {
    fn default() -> Self {
        Self {
            process_noise: 0.01,
            measurement_noise: 0.5,
            initial_error: 1.0,
            reference_interval: 1.0 / 30.0,
        }
    }
}

/// Vertical expansion of the raw detector box, as fractions of its height:
/// the crop starts `top` above the detected top edge and extends `bottom`
/// below it, so forehead and cheeks are both covered.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoxMargin {
    pub top: f64,
    pub bottom: f64,
}

impl Default for BoxMargin {
    fn default() -> Self {
        Self {
            top: 0.2,
            bottom: 0.9,
        }
    }
}

// ── PipelineConfig ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub model: ModelId,
    /// Run the face detector on every n-th fed frame.
    pub detect_every: u32,
    /// Overrides the model's nominal frame rate for pacing and DSP.
    pub sample_rate: Option<f64>,
    pub filter: BandConfig,
    pub hr_band: HrBand,
    pub kalman: KalmanConfig,
    pub box_margin: BoxMargin,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model: ModelId::default(),
            detect_every: 1,
            sample_rate: None,
            filter: BandConfig::default(),
            hr_band: HrBand::default(),
            kalman: KalmanConfig::default(),
            box_margin: BoxMargin::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        fn invalid(msg: impl Into<String>) -> Result<()> {
            Err(Error::InvalidConfig(msg.into()))
        }

        if self.detect_every == 0 {
            return invalid("detect_every must be at least 1");
        }
        if let Some(sr) = self.sample_rate {
            if !(sr.is_finite() && sr > 0.0) {
                return invalid(format!("sample_rate must be positive, got {sr}"));
            }
        }

        let f = &self.filter;
        if !(f.low_hz > 0.0 && f.low_hz < f.high_hz) {
            return invalid(format!(
                "filter band must satisfy 0 < low < high, got [{}, {}]",
                f.low_hz, f.high_hz
            ));
        }
        if !(1..=8).contains(&f.order) {
            return invalid(format!("filter order must be in 1..=8, got {}", f.order));
        }

        let hr = &self.hr_band;
        if !(hr.min_bpm > 0.0 && hr.min_bpm < hr.max_bpm) {
            return invalid(format!(
                "hr band must satisfy 0 < min < max, got [{}, {}]",
                hr.min_bpm, hr.max_bpm
            ));
        }

        let k = &self.kalman;
        if k.process_noise < 0.0 || k.measurement_noise < 0.0 {
            return invalid("kalman noise terms must be non-negative");
        }
        if !(k.initial_error > 0.0 && k.reference_interval > 0.0) {
            return invalid("kalman initial_error and reference_interval must be positive");
        }

        let m = &self.box_margin;
        if m.top < 0.0 || m.bottom <= 0.0 {
            return invalid("box margins must be non-negative with a positive bottom extent");
        }

        Ok(())
    }

    /// Effective sample rate: explicit override or the model's nominal rate.
    pub fn sample_rate_or(&self, nominal: f64) -> f64 {
        self.sample_rate.unwrap_or(nominal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_ids_round_trip_through_their_names() {
        for id in ModelId::ALL {
            assert_eq!(id.as_str().parse::<ModelId>().unwrap(), id);
        }
    }

    #[test]
    fn unknown_model_is_rejected() {
        let err = "PhysNet.ubfc".parse::<ModelId>().unwrap_err();
        assert!(matches!(err, Error::UnknownModel(ref s) if s == "PhysNet.ubfc"));
    }

    #[test]
    fn defaults_validate() {
        PipelineConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_detection_cadence_is_invalid() {
        let cfg = PipelineConfig {
            detect_every: 0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn inverted_bands_are_invalid() {
        let mut cfg = PipelineConfig::default();
        cfg.filter.low_hz = 3.0;
        cfg.filter.high_hz = 0.5;
        assert!(cfg.validate().is_err());

        let mut cfg = PipelineConfig::default();
        cfg.hr_band.min_bpm = 200.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn deserialises_partial_config_with_model_string() {
        let cfg: PipelineConfig =
            serde_json::from_str(r#"{"model": "PhysFormer.pure", "hr_band": {"max_bpm": 150}}"#)
                .unwrap();
        assert_eq!(cfg.model, ModelId::PhysFormerPure);
        assert_eq!(cfg.hr_band.max_bpm, 150.0);
        assert_eq!(cfg.hr_band.min_bpm, 30.0);
        assert_eq!(cfg.detect_every, 1);
    }
}
