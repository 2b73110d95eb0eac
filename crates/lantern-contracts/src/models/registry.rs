use indexmap::IndexMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub provider: String,
    pub capabilities: Vec<String>,
    pub context_window: Option<u64>,
}

impl ModelSpec {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|item| item == capability)
    }
}

/// Insertion-ordered registry of the models each external provider serves.
/// The first entry with a capability is the default for that capability.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn by_capability(&self, capability: &str) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.supports(capability))
            .cloned()
            .collect()
    }

    pub fn ensure(&self, name: &str, capability: &str) -> Option<ModelSpec> {
        let model = self.get(name)?;
        if model.supports(capability) {
            return Some(model.clone());
        }
        None
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    let mut insert = |name: &str,
                      provider: &str,
                      capabilities: &[&str],
                      context_window: Option<u64>| {
        map.insert(
            name.to_string(),
            ModelSpec {
                name: name.to_string(),
                provider: provider.to_string(),
                capabilities: capabilities
                    .iter()
                    .map(|item| (*item).to_string())
                    .collect(),
                context_window,
            },
        );
    };

    insert(
        "mistralai/Mixtral-8x7B-Instruct-v0.1",
        "together",
        &["text"],
        Some(32768),
    );
    insert(
        "black-forest-labs/FLUX.1-schnell",
        "huggingface",
        &["image"],
        None,
    );
    insert(
        "meta-llama/Llama-3.2-11B-Vision-Instruct",
        "huggingface",
        &["vision"],
        Some(128000),
    );
    insert("facebook/detr-resnet-50", "huggingface", &["detection"], None);
    insert(
        "google/vit-base-patch16-224",
        "huggingface",
        &["classification"],
        None,
    );
    insert("microsoft/unixcoder-base", "huggingface", &["code"], None);
    insert("dryrun-image-1", "dryrun", &["image"], None);

    map
}
