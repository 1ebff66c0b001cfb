use serde_json::Value;
use tollgate_common::AllowlistConfig;
use tracing::info;

use crate::error::PipelineError;

/// Stateless endpoint/model decisions plus default-model substitution.
///
/// Holds no mutable state: `AllowlistConfig` is loaded once at startup and
/// treated as immutable for the process lifetime, matching the source's
/// "load config, never touch it again" allowlist shape.
pub struct AllowlistPolicy {
    config: AllowlistConfig,
}

impl AllowlistPolicy {
    pub fn new(config: AllowlistConfig) -> Self {
        Self { config }
    }

    /// `true` if `path` (query string stripped, `/v1/` prefix implied) is allowed.
    pub fn endpoint_allowed(&self, path: &str) -> bool {
        if !self.config.enabled {
            return true;
        }
        let stripped = path.split('?').next().unwrap_or(path);
        let normalized = if stripped.starts_with("/v1/") {
            stripped.to_string()
        } else {
            format!("/v1/{}", stripped.trim_start_matches('/'))
        };
        self.config.endpoints.contains(&normalized)
    }

    /// `true` if `model` is allowed; an empty model is always allowed since
    /// it will be defaulted by `normalize`.
    pub fn model_allowed(&self, model: &str) -> bool {
        if !self.config.enabled || model.is_empty() {
            return true;
        }
        self.config.models.contains(model)
    }

    /// Fills in `default_model` when absent, rejects disallowed models.
    /// Does not mutate `body` in place; returns the (possibly adjusted) value.
    pub fn normalize(&self, mut body: Value, endpoint: &str) -> Result<Value, PipelineError> {
        let model = body
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        if model.is_empty() {
            info!(
                target: "tollgate::allowlist",
                endpoint,
                default_model = %self.config.default_model,
                "defaulting model for request with no model field"
            );
            if let Some(obj) = body.as_object_mut() {
                obj.insert(
                    "model".to_string(),
                    Value::String(self.config.default_model.clone()),
                );
            }
            return Ok(body);
        }

        if !self.model_allowed(&model) {
            return Err(PipelineError::ModelNotAllowed(model));
        }

        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn config() -> AllowlistConfig {
        AllowlistConfig {
            enabled: true,
            endpoints: HashSet::from(["/v1/chat/completions".to_string()]),
            models: HashSet::from(["gpt-4o-mini".to_string()]),
            default_model: "gpt-4o-mini".to_string(),
        }
    }

    #[test]
    fn endpoint_allowed_prepends_v1_prefix() {
        let policy = AllowlistPolicy::new(config());
        assert!(policy.endpoint_allowed("chat/completions"));
        assert!(policy.endpoint_allowed("/v1/chat/completions?foo=bar"));
        assert!(!policy.endpoint_allowed("/v1/models"));
    }

    #[test]
    fn disabled_allowlist_allows_everything() {
        let mut cfg = config();
        cfg.enabled = false;
        let policy = AllowlistPolicy::new(cfg);
        assert!(policy.endpoint_allowed("/v1/anything"));
        assert!(policy.model_allowed("whatever"));
    }

    #[test]
    fn normalize_fills_default_model() {
        let policy = AllowlistPolicy::new(config());
        let body = serde_json::json!({"messages": []});
        let normalized = policy.normalize(body, "/v1/chat/completions").unwrap();
        assert_eq!(normalized["model"], "gpt-4o-mini");
    }

    #[test]
    fn normalize_rejects_disallowed_model() {
        let policy = AllowlistPolicy::new(config());
        let body = serde_json::json!({"model": "gpt-4", "messages": []});
        let err = policy.normalize(body, "/v1/chat/completions").unwrap_err();
        assert!(matches!(err, PipelineError::ModelNotAllowed(model) if model == "gpt-4"));
    }
}
