//! Generation parameters and client submission validation.
//!
//! Clients submit a [`SubmitRequest`] with an aspect `size` string. It is
//! resolved against a fixed table and checked before anything is queued,
//! producing the [`GenerationParams`] that travel with the job.

use serde::{Deserialize, Serialize};

/// Side lengths a client may combine into a `size`.
pub const ASPECT_SIDES: [u32; 3] = [512, 768, 1024];
pub const DEFAULT_SIZE: &str = "512x512";
pub const MIN_STEPS: u32 = 1;
pub const MAX_STEPS: u32 = 30;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParamsError {
    #[error("Invalid size '{0}': must be one of the mapped aspect ratios")]
    InvalidSize(String),
    #[error("Invalid steps {0}: must be between 1 and 30")]
    StepsOutOfRange(u32),
    #[error("Invalid cfg_scale {0}: must be a positive finite number")]
    InvalidCfgScale(f64),
    #[error("Invalid dimensions {width}x{height}: must be one of the mapped aspect ratios")]
    InvalidDimensions { width: u32, height: u32 },
    #[error("Invalid sampler_name: must not be empty")]
    EmptySampler,
}

/// Resolve a `"<width>x<height>"` aspect string through the size table.
pub fn resolve_size(size: &str) -> Option<(u32, u32)> {
    let (w, h) = size.trim().split_once('x')?;
    let (w, h) = (w.parse().ok()?, h.parse().ok()?);
    (ASPECT_SIDES.contains(&w) && ASPECT_SIDES.contains(&h)).then_some((w, h))
}

/// Parameters for one txt2img job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    /// Pushed to the worker as `sd_model_checkpoint` before generating.
    pub checkpoint: Option<String>,
    pub prompt: String,
    pub negative_prompt: String,
    pub steps: u32,
    pub cfg_scale: f64,
    pub sampler_name: String,
    pub width: u32,
    pub height: u32,
    /// -1 lets the worker pick.
    pub seed: i64,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            checkpoint: None,
            prompt: String::new(),
            negative_prompt: String::new(),
            steps: 25,
            cfg_scale: 7.0,
            sampler_name: "Euler a".to_string(),
            width: 512,
            height: 512,
            seed: -1,
        }
    }
}

impl GenerationParams {
    pub fn validate(&self) -> Result<(), ParamsError> {
        if !(MIN_STEPS..=MAX_STEPS).contains(&self.steps) {
            return Err(ParamsError::StepsOutOfRange(self.steps));
        }
        if !self.cfg_scale.is_finite() || self.cfg_scale <= 0.0 {
            return Err(ParamsError::InvalidCfgScale(self.cfg_scale));
        }
        if !ASPECT_SIDES.contains(&self.width) || !ASPECT_SIDES.contains(&self.height) {
            return Err(ParamsError::InvalidDimensions {
                width: self.width,
                height: self.height,
            });
        }
        if self.sampler_name.trim().is_empty() {
            return Err(ParamsError::EmptySampler);
        }
        Ok(())
    }

    /// Request body for the worker's txt2img endpoint (checkpoint excluded).
    pub fn txt2img_body(&self) -> serde_json::Value {
        serde_json::json!({
            "prompt": self.prompt,
            "negative_prompt": self.negative_prompt,
            "steps": self.steps,
            "cfg_scale": self.cfg_scale,
            "sampler_name": self.sampler_name,
            "width": self.width,
            "height": self.height,
            "seed": self.seed,
        })
    }
}

/// Who asked for the job. Only logged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientIdentity {
    pub user_id: Option<i64>,
    pub player_name: Option<String>,
}

/// Client-facing submission body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmitRequest {
    #[serde(alias = "roblox_user")]
    pub client: Option<ClientIdentity>,
    pub checkpoint: Option<String>,
    pub prompt: String,
    #[serde(alias = "negative")]
    pub negative_prompt: String,
    pub steps: u32,
    pub cfg_scale: f64,
    pub sampler_name: String,
    pub size: String,
    pub seed: i64,
}

impl Default for SubmitRequest {
    fn default() -> Self {
        let defaults = GenerationParams::default();
        Self {
            client: None,
            checkpoint: defaults.checkpoint,
            prompt: defaults.prompt,
            negative_prompt: defaults.negative_prompt,
            steps: defaults.steps,
            cfg_scale: defaults.cfg_scale,
            sampler_name: defaults.sampler_name,
            size: DEFAULT_SIZE.to_string(),
            seed: defaults.seed,
        }
    }
}

impl SubmitRequest {
    /// Resolve the aspect size and validate the result.
    pub fn into_params(self) -> Result<GenerationParams, ParamsError> {
        let (width, height) =
            resolve_size(&self.size).ok_or_else(|| ParamsError::InvalidSize(self.size.clone()))?;

        if let Some(ref client) = self.client {
            tracing::info!(
                user_id = ?client.user_id,
                player_name = client.player_name.as_deref().unwrap_or(""),
                size = %self.size,
                steps = self.steps,
                "Client submission"
            );
        }

        let params = GenerationParams {
            checkpoint: self.checkpoint,
            prompt: self.prompt,
            negative_prompt: self.negative_prompt,
            steps: self.steps,
            cfg_scale: self.cfg_scale,
            sampler_name: self.sampler_name,
            width,
            height,
            seed: self.seed,
        };
        params.validate()?;
        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_table_covers_all_combinations() {
        for w in ASPECT_SIDES {
            for h in ASPECT_SIDES {
                assert_eq!(resolve_size(&format!("{w}x{h}")), Some((w, h)));
            }
        }
    }

    #[test]
    fn size_table_rejects_unmapped() {
        for size in ["", "512", "512x", "x512", "256x256", "512x640", "512X512", "axb"] {
            assert_eq!(resolve_size(size), None, "accepted {size:?}");
        }
    }

    #[test]
    fn defaults_are_valid() {
        assert!(GenerationParams::default().validate().is_ok());
        let params = SubmitRequest::default().into_params().unwrap();
        assert_eq!(params, GenerationParams::default());
    }

    #[test]
    fn steps_bounds() {
        for steps in [0, 31, 100] {
            let req = SubmitRequest {
                steps,
                ..Default::default()
            };
            assert_eq!(req.into_params(), Err(ParamsError::StepsOutOfRange(steps)));
        }
        for steps in [MIN_STEPS, MAX_STEPS] {
            let req = SubmitRequest {
                steps,
                ..Default::default()
            };
            assert!(req.into_params().is_ok());
        }
    }

    #[test]
    fn invalid_size_is_rejected() {
        let req = SubmitRequest {
            size: "640x480".to_string(),
            ..Default::default()
        };
        assert_eq!(
            req.into_params(),
            Err(ParamsError::InvalidSize("640x480".to_string()))
        );
    }

    #[test]
    fn cfg_scale_must_be_positive() {
        for cfg_scale in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let params = GenerationParams {
                cfg_scale,
                ..Default::default()
            };
            assert!(matches!(
                params.validate(),
                Err(ParamsError::InvalidCfgScale(_))
            ));
        }
    }

    #[test]
    fn direct_params_need_mapped_dimensions() {
        let params = GenerationParams {
            width: 640,
            ..Default::default()
        };
        assert_eq!(
            params.validate(),
            Err(ParamsError::InvalidDimensions {
                width: 640,
                height: 512
            })
        );
    }

    #[test]
    fn submit_request_accepts_legacy_field_names() {
        let req: SubmitRequest = serde_json::from_value(serde_json::json!({
            "roblox_user": {"user_id": 42, "player_name": "builder"},
            "prompt": "a castle",
            "negative": "blurry",
            "size": "768x1024",
            "steps": 20
        }))
        .unwrap();

        assert_eq!(
            req.client,
            Some(ClientIdentity {
                user_id: Some(42),
                player_name: Some("builder".to_string())
            })
        );
        let params = req.into_params().unwrap();
        assert_eq!(params.negative_prompt, "blurry");
        assert_eq!((params.width, params.height), (768, 1024));
        assert_eq!(params.steps, 20);
        assert_eq!(params.sampler_name, "Euler a");
    }

    #[test]
    fn txt2img_body_excludes_checkpoint() {
        let params = GenerationParams {
            checkpoint: Some("v1-5.safetensors".to_string()),
            prompt: "pug".to_string(),
            cfg_scale: 7.5,
            ..Default::default()
        };
        insta::assert_json_snapshot!(params.txt2img_body(), @r#"
        {
          "cfg_scale": 7.5,
          "height": 512,
          "negative_prompt": "",
          "prompt": "pug",
          "sampler_name": "Euler a",
          "seed": -1,
          "steps": 25,
          "width": 512
        }
        "#);
    }
}
