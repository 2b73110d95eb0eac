use super::registry::{ModelRegistry, ModelSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub model: ModelSpec,
    pub requested: Option<String>,
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ModelSelector {
    pub registry: ModelRegistry,
}

impl ModelSelector {
    pub fn new(registry: Option<ModelRegistry>) -> Self {
        Self {
            registry: registry.unwrap_or_else(|| ModelRegistry::new(None)),
        }
    }

    pub fn select(
        &self,
        requested: Option<&str>,
        capability: &str,
    ) -> Result<ModelSelection, String> {
        let (fallback_reason, requested_text) = if let Some(requested_value) = requested {
            if let Some(model) = self.registry.ensure(requested_value, capability) {
                return Ok(ModelSelection {
                    model,
                    requested: Some(requested_value.to_string()),
                    fallback_reason: None,
                });
            }
            (
                Some(format!(
                    "Requested model '{requested_value}' unavailable for capability '{capability}'."
                )),
                Some(requested_value.to_string()),
            )
        } else {
            (None, None)
        };

        let candidates = self.registry.by_capability(capability);
        let Some(model) = candidates.first().cloned() else {
            return Err(format!(
                "No models available for capability '{capability}'."
            ));
        };
        Ok(ModelSelection {
            model,
            requested: requested_text,
            fallback_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use super::super::registry::{ModelRegistry, ModelSpec};
    use super::ModelSelector;

    fn model(name: &str, provider: &str, capability: &str) -> ModelSpec {
        ModelSpec {
            name: name.to_string(),
            provider: provider.to_string(),
            capabilities: vec![capability.to_string()],
            context_window: None,
        }
    }

    #[test]
    fn requested_model_wins_when_it_has_the_capability() {
        let selection = ModelSelector::new(None)
            .select(Some("dryrun-image-1"), "image")
            .unwrap();
        assert_eq!(selection.model.name, "dryrun-image-1");
        assert!(selection.fallback_reason.is_none());
    }

    #[test]
    fn falls_back_when_requested_model_unavailable() {
        let mut models = IndexMap::new();
        models.insert(
            "fallback-image".to_string(),
            model("fallback-image", "dryrun", "image"),
        );
        let selection = ModelSelector::new(Some(ModelRegistry::new(Some(models))))
            .select(Some("missing"), "image")
            .unwrap();
        assert_eq!(selection.model.name, "fallback-image");
        assert_eq!(selection.requested.as_deref(), Some("missing"));
        assert_eq!(
            selection.fallback_reason.as_deref(),
            Some("Requested model 'missing' unavailable for capability 'image'.")
        );
    }

    #[test]
    fn no_request_uses_first_capable_model_silently() {
        let selection = ModelSelector::new(None).select(None, "text").unwrap();
        assert_eq!(selection.model.name, "mistralai/Mixtral-8x7B-Instruct-v0.1");
        assert!(selection.fallback_reason.is_none());
        assert!(selection.requested.is_none());
    }

    #[test]
    fn errors_when_no_model_covers_the_capability() {
        let mut models = IndexMap::new();
        models.insert(
            "text-only".to_string(),
            model("text-only", "together", "text"),
        );
        let err = ModelSelector::new(Some(ModelRegistry::new(Some(models))))
            .select(Some("whatever"), "image")
            .err()
            .unwrap_or_default();
        assert_eq!(err, "No models available for capability 'image'.");
    }
}
