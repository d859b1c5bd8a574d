//! Config validation (§6.2). Each server manager declares its exact accepted
//! key set; unknown keys are rejected with both the offending keys and the
//! valid set named, matching §6.2's wording precisely.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Tri-state override: unset defers to the DSM's computed default, set-true /
/// set-false force the flag regardless (§4.3.3 "User overrides always win").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TriState {
    #[default]
    Unset,
    True,
    False,
}

impl TriState {
    pub fn resolve(self, default: bool) -> bool {
        match self {
            TriState::Unset => default,
            TriState::True => true,
            TriState::False => false,
        }
    }
}

pub const DIFFUSION_CONFIG_KEYS: &[&str] = &[
    "modelId",
    "port",
    "threads",
    "gpuLayers",
    "forceValidation",
    "clipOnCpu",
    "vaeOnCpu",
    "batchSize",
    "offloadToCpu",
    "diffusionFlashAttention",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffusionConfig {
    pub model_id: String,
    pub port: Option<u16>,
    pub threads: Option<u32>,
    /// Accepted for symmetry with the LLM config but never passed to the child
    /// (§6.2 note) — sd.cpp has no `--n-gpu-layers` flag (§4.3.3).
    pub gpu_layers: Option<u32>,
    #[serde(default)]
    pub force_validation: bool,
    #[serde(default)]
    pub clip_on_cpu: TriState,
    #[serde(default)]
    pub vae_on_cpu: TriState,
    pub batch_size: Option<u32>,
    #[serde(default)]
    pub offload_to_cpu: TriState,
    #[serde(default)]
    pub diffusion_flash_attention: TriState,
}

/// Validates a raw JSON config object against the declared key set (§6.2),
/// then deserializes into `DiffusionConfig`. Unknown keys are rejected before
/// deserialization so the error can list exactly which keys were unrecognized.
pub fn validate_diffusion_config(raw: &serde_json::Value) -> Result<DiffusionConfig> {
    let obj = raw.as_object().ok_or_else(|| CoreError::FileSystemError {
        message: "config must be a JSON object".into(),
    })?;

    let valid: BTreeSet<&str> = DIFFUSION_CONFIG_KEYS.iter().copied().collect();
    let unknown: Vec<&str> = obj
        .keys()
        .map(|k| k.as_str())
        .filter(|k| !valid.contains(k))
        .collect();

    if !unknown.is_empty() {
        return Err(CoreError::FileSystemError {
            message: format!(
                "unknown config keys {:?}; valid keys are {:?}",
                unknown, DIFFUSION_CONFIG_KEYS
            ),
        });
    }

    if !obj.contains_key("modelId") {
        return Err(CoreError::FileSystemError {
            message: "config missing required key 'modelId'".into(),
        });
    }

    serde_json::from_value(rename_to_snake_case(raw.clone())).map_err(|e| {
        CoreError::FileSystemError {
            message: format!("config deserialization failed: {e}"),
        }
    })
}

fn rename_to_snake_case(mut value: serde_json::Value) -> serde_json::Value {
    if let Some(obj) = value.as_object_mut() {
        let renamed: serde_json::Map<String, serde_json::Value> = obj
            .iter()
            .map(|(k, v)| (camel_to_snake(k), v.clone()))
            .collect();
        *obj = renamed;
    }
    value
}

fn camel_to_snake(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 4);
    for c in s.chars() {
        if c.is_uppercase() {
            out.push('_');
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_keys_listing_both_sets() {
        let raw = serde_json::json!({"modelId": "sd", "bogusKey": true});
        let err = validate_diffusion_config(&raw).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("bogusKey") || format!("{err:?}").contains("bogusKey"));
    }

    #[test]
    fn accepts_known_keys() {
        let raw = serde_json::json!({
            "modelId": "flux2-klein",
            "port": 7801,
            "clipOnCpu": "true",
        });
        let cfg = validate_diffusion_config(&raw).unwrap();
        assert_eq!(cfg.model_id, "flux2-klein");
        assert_eq!(cfg.clip_on_cpu, TriState::True);
    }

    #[test]
    fn requires_model_id() {
        let raw = serde_json::json!({"port": 1});
        assert!(validate_diffusion_config(&raw).is_err());
    }

    #[test]
    fn tri_state_resolves_with_override_precedence() {
        assert!(TriState::Unset.resolve(true));
        assert!(!TriState::Unset.resolve(false));
        assert!(TriState::True.resolve(false));
        assert!(!TriState::False.resolve(true));
    }
}
