//! Catalog files.
//!
//! A catalog is a JSON document listing creative ads and, optionally, the
//! sites whose visitors must not see a creative set:
//!
//! ```json
//! {
//!   "creative_ads": [ { "creative_instance_id": "...", "segment": "travel", ... } ],
//!   "anti_targeting": { "<creative set id>": ["https://competitor.example"] }
//! }
//! ```

use std::collections::{HashMap, HashSet};
use std::path::Path;

use adsched_events::{CreativeAd, EventError};
use adsched_id::CreativeSetId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read catalog {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse catalog: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Invalid(#[from] EventError),

    #[error("duplicate creative instance {0}")]
    Duplicate(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub creative_ads: Vec<CreativeAd>,

    #[serde(default)]
    pub anti_targeting: HashMap<CreativeSetId, Vec<String>>,
}

impl Catalog {
    /// Parse and validate a catalog document.
    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let catalog: Catalog = serde_json::from_str(json)?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let catalog = Self::from_json(&json)?;
        info!(
            path = %path.display(),
            creative_ads = catalog.creative_ads.len(),
            anti_targeted_sets = catalog.anti_targeting.len(),
            "Loaded catalog"
        );
        Ok(catalog)
    }

    fn validate(&self) -> Result<(), CatalogError> {
        let mut seen = HashSet::new();
        for ad in &self.creative_ads {
            ad.validate()?;
            if !seen.insert(ad.creative_instance_id) {
                return Err(CatalogError::Duplicate(ad.creative_instance_id.to_string()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adsched_testing::creative_ad;
    use std::io::Write;

    #[test]
    fn test_parses_serialized_catalog() {
        let ad = creative_ad("travel");
        let catalog = Catalog {
            creative_ads: vec![ad.clone()],
            anti_targeting: HashMap::from([(ad.creative_set_id, vec!["https://a.example".to_string()])]),
        };
        let json = serde_json::to_string(&catalog).unwrap();

        assert_eq!(Catalog::from_json(&json).unwrap(), catalog);
    }

    #[test]
    fn test_missing_sections_default_to_empty() {
        let catalog = Catalog::from_json("{}").unwrap();
        assert!(catalog.creative_ads.is_empty());
        assert!(catalog.anti_targeting.is_empty());
    }

    #[test]
    fn test_rejects_invalid_ad() {
        let mut ad = creative_ad("travel");
        ad.ptr = 1.5;
        let json = serde_json::to_string(&Catalog {
            creative_ads: vec![ad],
            ..Catalog::default()
        })
        .unwrap();

        assert!(matches!(Catalog::from_json(&json), Err(CatalogError::Invalid(_))));
    }

    #[test]
    fn test_rejects_duplicate_instances() {
        let ad = creative_ad("travel");
        let json = serde_json::to_string(&Catalog {
            creative_ads: vec![ad.clone(), ad],
            ..Catalog::default()
        })
        .unwrap();

        assert!(matches!(Catalog::from_json(&json), Err(CatalogError::Duplicate(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let json = serde_json::to_string(&Catalog {
            creative_ads: vec![creative_ad("travel")],
            ..Catalog::default()
        })
        .unwrap();
        file.write_all(json.as_bytes()).unwrap();

        assert_eq!(Catalog::load(file.path()).unwrap().creative_ads.len(), 1);
        assert!(matches!(
            Catalog::load("/nonexistent/catalog.json"),
            Err(CatalogError::Io { .. })
        ));
    }
}
