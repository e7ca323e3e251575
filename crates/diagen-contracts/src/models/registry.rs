use indexmap::IndexMap;
use serde::Serialize;

/// A Bedrock model id paired with the label shown in the model picker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub label: String,
}

impl ModelDescriptor {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelCatalog {
    models: IndexMap<String, ModelDescriptor>,
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ModelCatalog {
    pub fn new(models: Option<IndexMap<String, ModelDescriptor>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, id: &str) -> Option<&ModelDescriptor> {
        self.models.get(id)
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelDescriptor> {
        self.models.values()
    }

    pub fn first(&self) -> Option<&ModelDescriptor> {
        self.models.values().next()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

/// The fixed, ordered set of Claude models offered on Bedrock.
pub fn list_available_models() -> Vec<ModelDescriptor> {
    default_models().into_values().collect()
}

fn default_models() -> IndexMap<String, ModelDescriptor> {
    let mut map = IndexMap::new();
    let mut insert = |id: &str, label: &str| {
        map.insert(id.to_string(), ModelDescriptor::new(id, label));
    };

    insert(
        "anthropic.claude-3-haiku-20240307-v1:0",
        "Claude 3 Haiku 1.0",
    );
    insert("anthropic.claude-v2", "Claude 2.0");
    insert("anthropic.claude-v2:1", "Claude 2.1");
    insert(
        "anthropic.claude-3-sonnet-20240229-v1:0",
        "Claude 3 Sonnet 1.0",
    );
    insert(
        "anthropic.claude-3-5-sonnet-20240620-v1:0",
        "Claude 3.5 Sonnet 1.0",
    );
    insert("anthropic.claude-instant-v1", "Claude Instant 1.x");

    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_lists_six_claude_models_in_fixed_order() {
        let ids: Vec<String> = list_available_models()
            .into_iter()
            .map(|model| model.id)
            .collect();
        assert_eq!(
            ids,
            vec![
                "anthropic.claude-3-haiku-20240307-v1:0",
                "anthropic.claude-v2",
                "anthropic.claude-v2:1",
                "anthropic.claude-3-sonnet-20240229-v1:0",
                "anthropic.claude-3-5-sonnet-20240620-v1:0",
                "anthropic.claude-instant-v1",
            ]
        );
    }

    #[test]
    fn catalog_is_stable_across_calls() {
        assert_eq!(list_available_models(), list_available_models());
        let catalog = ModelCatalog::default();
        assert_eq!(catalog.len(), 6);
        assert_eq!(
            catalog.list().cloned().collect::<Vec<_>>(),
            list_available_models()
        );
    }

    #[test]
    fn labels_match_ids() {
        let catalog = ModelCatalog::default();
        assert_eq!(
            catalog.get("anthropic.claude-v2:1").map(|m| m.label.as_str()),
            Some("Claude 2.1")
        );
        assert_eq!(
            catalog.first().map(|m| m.label.as_str()),
            Some("Claude 3 Haiku 1.0")
        );
        assert!(catalog.get("gpt-5.2").is_none());
    }
}
