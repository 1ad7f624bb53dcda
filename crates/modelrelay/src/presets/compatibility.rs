//! GPU compatibility checks for local model presets.
//!
//! Answers two questions: does this quantization of the model fit the
//! currently allocatable VRAM, and if not, which variant would.

use serde::Serialize;

use crate::gpu::VramMonitor;
use crate::presets::LocalModelPreset;

/// Coefficients for VRAM estimation, GB per billion parameters.
const VRAM_COEFFICIENTS: &[(&str, f64)] = &[
    ("q4_k_m", 0.5),
    ("q5_k_m", 0.6),
    ("q8_0", 0.9),
    ("fp16", 2.0),
];

/// Quantizations from most to least compact.
const QUANTIZATION_ORDER: &[&str] = &["q4_k_m", "q5_k_m", "q8_0", "fp16"];

/// Headroom multiplier on estimated requirements.
const SAFETY_MARGIN: f64 = 1.15;

/// Outcome of a compatibility check.
#[derive(Debug, Clone, Serialize)]
pub struct CompatibilityResult {
    /// Whether the requested variant fits the allocatable VRAM.
    pub compatible: bool,
    /// VRAM the variant needs, in MB.
    pub required_vram_mb: u64,
    /// VRAM currently allocatable, in MB.
    pub available_vram_mb: u64,
    /// Densest variant that does fit, when the requested one does not.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommended_quantization: Option<String>,
    /// Human-readable caveat when incompatible.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// VRAM estimator + quantization recommender over a preset.
pub struct CompatibilityChecker<'a> {
    monitor: &'a VramMonitor,
}

impl<'a> CompatibilityChecker<'a> {
    /// Build a checker over the given monitor.
    pub fn new(monitor: &'a VramMonitor) -> Self {
        Self { monitor }
    }

    /// Estimate VRAM for `size_b` billion parameters at a quantization.
    pub fn estimate_vram_mb(size_b: f64, quantization: &str) -> u64 {
        let coefficient = VRAM_COEFFICIENTS
            .iter()
            .find(|(name, _)| *name == quantization)
            .map_or(1.0, |(_, c)| *c);
        let estimated_gb = size_b * coefficient;
        (estimated_gb * 1024.0 * SAFETY_MARGIN) as u64
    }

    /// Extract the quantization token from a GGUF filename.
    ///
    /// Unlisted variants map onto the nearest listed one; the default is
    /// `q4_k_m`.
    pub fn extract_quantization(filename: &str) -> &'static str {
        let lower = filename.to_lowercase();
        // Order matters: q5_k_s must be tried before the bare q5 fallbacks.
        const PATTERNS: &[(&str, &str)] = &[
            ("q4_k_m", "q4_k_m"),
            ("q5_k_m", "q5_k_m"),
            ("q8_0", "q8_0"),
            ("q6_k", "q8_0"),
            ("q5_k_s", "q5_k_m"),
            ("q4_k_s", "q4_k_m"),
            ("q3_k_m", "q4_k_m"),
            ("q2_k", "q4_k_m"),
            ("fp16", "fp16"),
            ("f16", "fp16"),
        ];
        for (pattern, quantization) in PATTERNS {
            if lower.contains(pattern) {
                return quantization;
            }
        }
        "q4_k_m"
    }

    /// Required VRAM for a preset at a quantization: the preset's measured
    /// table wins over estimation.
    pub fn required_vram_mb(preset: &LocalModelPreset, quantization: &str) -> u64 {
        preset
            .vram_requirements
            .get(quantization)
            .copied()
            .unwrap_or_else(|| Self::estimate_vram_mb(preset.size_b, quantization))
    }

    /// Check whether the preset fits the GPU; recommend a variant otherwise.
    pub async fn check(
        &self,
        preset: &LocalModelPreset,
        quantization: Option<&str>,
    ) -> CompatibilityResult {
        let quantization = quantization
            .map(str::to_lowercase)
            .unwrap_or_else(|| Self::extract_quantization(&preset.filename).to_string());
        let required_mb = Self::required_vram_mb(preset, &quantization);

        let available_mb = match self.monitor.available_vram_mb().await {
            Ok(mb) => mb,
            Err(err) => {
                return CompatibilityResult {
                    compatible: false,
                    required_vram_mb: required_mb,
                    available_vram_mb: 0,
                    recommended_quantization: None,
                    warning: Some(format!("GPU unavailable: {err}")),
                };
            }
        };

        let compatible = required_mb <= available_mb;
        if compatible {
            return CompatibilityResult {
                compatible,
                required_vram_mb: required_mb,
                available_vram_mb: available_mb,
                recommended_quantization: None,
                warning: None,
            };
        }

        let recommended = Self::recommend_quantization(preset, available_mb);
        let mut warning = format!(
            "model requires {required_mb} MB VRAM, {available_mb} MB available"
        );
        match &recommended {
            Some(quantization) => {
                warning.push_str(&format!("; consider {quantization}"));
            }
            None => warning.push_str("; does not fit even at q4_k_m"),
        }
        tracing::warn!(
            model = %preset.name,
            required_mb,
            available_mb,
            recommended = ?recommended,
            "model incompatible with GPU"
        );
        CompatibilityResult {
            compatible,
            required_vram_mb: required_mb,
            available_vram_mb: available_mb,
            recommended_quantization: recommended,
            warning: Some(warning),
        }
    }

    /// Densest quantization that fits, in the order q4_k_m → fp16.
    pub fn recommend_quantization(
        preset: &LocalModelPreset,
        available_mb: u64,
    ) -> Option<String> {
        QUANTIZATION_ORDER
            .iter()
            .find(|quantization| Self::required_vram_mb(preset, quantization) <= available_mb)
            .map(|q| (*q).to_string())
    }

    /// All quantizations that fit, most compact first.
    pub fn compatible_quantizations(
        preset: &LocalModelPreset,
        available_mb: u64,
    ) -> Vec<String> {
        QUANTIZATION_ORDER
            .iter()
            .filter(|quantization| Self::required_vram_mb(preset, quantization) <= available_mb)
            .map(|q| (*q).to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::presets::LocalProviderConfig;

    fn preset(vram: &[(&str, u64)]) -> LocalModelPreset {
        LocalModelPreset {
            name: "test-7b".to_string(),
            huggingface_repo: "org/test".to_string(),
            filename: "test-7b-q4_k_m.gguf".to_string(),
            size_b: 7.0,
            vram_requirements: vram
                .iter()
                .map(|(k, v)| ((*k).to_string(), *v))
                .collect::<BTreeMap<_, _>>(),
            provider_config: LocalProviderConfig::default(),
            autoload: false,
        }
    }

    #[test]
    fn quantization_extraction_covers_fallbacks() {
        assert_eq!(
            CompatibilityChecker::extract_quantization("model-Q4_K_M.gguf"),
            "q4_k_m"
        );
        assert_eq!(
            CompatibilityChecker::extract_quantization("model-q6_k.gguf"),
            "q8_0"
        );
        assert_eq!(
            CompatibilityChecker::extract_quantization("model-q2_k.gguf"),
            "q4_k_m"
        );
        assert_eq!(
            CompatibilityChecker::extract_quantization("model-f16.gguf"),
            "fp16"
        );
        assert_eq!(
            CompatibilityChecker::extract_quantization("model.gguf"),
            "q4_k_m"
        );
    }

    #[test]
    fn estimation_applies_margin() {
        // 7B at q4_k_m: 7 * 0.5 GB * 1.15 = 4.025 GB -> 4121 MB
        assert_eq!(CompatibilityChecker::estimate_vram_mb(7.0, "q4_k_m"), 4121);
        // fp16 is the densest
        assert!(
            CompatibilityChecker::estimate_vram_mb(7.0, "fp16")
                > CompatibilityChecker::estimate_vram_mb(7.0, "q8_0")
        );
    }

    #[test]
    fn measured_table_wins_over_estimate() {
        let preset = preset(&[("q4_k_m", 5500)]);
        assert_eq!(
            CompatibilityChecker::required_vram_mb(&preset, "q4_k_m"),
            5500
        );
        // q8_0 unlisted -> estimated
        assert_eq!(
            CompatibilityChecker::required_vram_mb(&preset, "q8_0"),
            CompatibilityChecker::estimate_vram_mb(7.0, "q8_0")
        );
    }

    #[test]
    fn recommendation_walks_compact_to_dense() {
        let preset = preset(&[
            ("q4_k_m", 5500),
            ("q5_k_m", 6500),
            ("q8_0", 9000),
            ("fp16", 14000),
        ]);
        assert_eq!(
            CompatibilityChecker::recommend_quantization(&preset, 7000),
            Some("q4_k_m".to_string())
        );
        assert_eq!(CompatibilityChecker::recommend_quantization(&preset, 100), None);
        assert_eq!(
            CompatibilityChecker::compatible_quantizations(&preset, 9500),
            vec!["q4_k_m", "q5_k_m", "q8_0"]
        );
    }
}
