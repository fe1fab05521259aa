use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::{
    error::{FormError, Result},
    event::Choice,
    fields::Fields,
};

/// Selectable option supplied by a catalog; referenced by id, never mutated by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogOption {
    pub id: String,
    pub label: String,
    /// Extra data carried with the option, e.g. a contest's `start_date`
    #[serde(default, skip_serializing_if = "Fields::is_empty")]
    pub attributes: Fields,
}

impl CatalogOption {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            attributes: Fields::new(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.attributes.set(key, value);
        self
    }

    pub fn to_choice(&self) -> Choice {
        Choice {
            id: self.id.clone(),
            label: self.label.clone(),
        }
    }
}

/// Source of option lists (contests, activity types, teacher names)
#[async_trait]
pub trait CatalogProvider: Send + Sync {
    async fn list_options(&self, catalog: &str) -> Result<Vec<CatalogOption>>;

    /// `None` when the catalog has no option with this id
    async fn get(&self, catalog: &str, id: &str) -> Result<Option<CatalogOption>> {
        Ok(self
            .list_options(catalog)
            .await?
            .into_iter()
            .find(|option| option.id == id))
    }
}

/// In-memory catalog, seeded in code or from YAML
pub struct InMemoryCatalog {
    catalogs: Arc<DashMap<String, Vec<CatalogOption>>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self {
            catalogs: Arc::new(DashMap::new()),
        }
    }

    /// Parses a YAML document mapping catalog names to option lists:
    ///
    /// ```yaml
    /// contests:
    ///   - id: olympiad-x
    ///     label: OlympiadX
    ///     attributes:
    ///       start_date: "01.03.2026"
    /// ```
    pub fn from_yaml(source: &str) -> Result<Self> {
        let parsed: BTreeMap<String, Vec<CatalogOption>> = serde_yaml::from_str(source)
            .map_err(|e| FormError::Storage(format!("invalid catalog seed: {e}")))?;
        let catalog = Self::new();
        for (name, options) in parsed {
            catalog.insert(name, options);
        }
        Ok(catalog)
    }

    pub fn insert(&self, catalog: impl Into<String>, options: Vec<CatalogOption>) {
        self.catalogs.insert(catalog.into(), options);
    }

    pub fn push(&self, catalog: &str, option: CatalogOption) {
        self.catalogs
            .entry(catalog.to_string())
            .or_default()
            .push(option);
    }

    pub fn catalog_names(&self) -> Vec<String> {
        self.catalogs.iter().map(|e| e.key().clone()).collect()
    }
}

impl Default for InMemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CatalogProvider for InMemoryCatalog {
    async fn list_options(&self, catalog: &str) -> Result<Vec<CatalogOption>> {
        Ok(self
            .catalogs
            .get(catalog)
            .map(|entry| entry.clone())
            .unwrap_or_default())
    }
}
