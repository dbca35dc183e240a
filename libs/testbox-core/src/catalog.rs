// Image catalog for testbox
// Maps the image tags a run names to Docker references, family and limits.
use crate::backend::InstanceConfig;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageConfig {
    /// Tag used in run configs
    pub name: String,
    /// Docker image reference
    pub reference: String,
    /// Base-image family; selects the bootstrap procedure
    pub family: String,
    #[serde(default)]
    pub memory_limit_mb: Option<u32>,
    #[serde(default)]
    pub cpu_limit: Option<f32>,
    /// Installed with pip3 after the package tooling
    #[serde(default)]
    pub pip_packages: Vec<String>,
}

impl ImageConfig {
    /// Config for a tag with no catalog entry: the tag is the reference and
    /// the family is its repository name.
    pub fn inferred(tag: &str) -> Self {
        Self {
            name: tag.to_string(),
            reference: tag.to_string(),
            family: infer_family(tag),
            memory_limit_mb: None,
            cpu_limit: None,
            pip_packages: Vec::new(),
        }
    }

    pub fn instance_config(&self, instance_name: &str) -> InstanceConfig {
        InstanceConfig {
            name: instance_name.to_string(),
            image: self.reference.clone(),
            memory_limit_mb: self.memory_limit_mb,
            cpu_limit: self.cpu_limit,
        }
    }
}

/// `registry.example.com/library/ubuntu:22.04` -> `ubuntu`
fn infer_family(reference: &str) -> String {
    let last = reference.rsplit('/').next().unwrap_or(reference);
    let repo = last.split([':', '@']).next().unwrap_or(last);
    repo.to_ascii_lowercase()
}

#[derive(Debug, Serialize, Deserialize)]
struct ImagesJson {
    images: Vec<ImageConfig>,
}

/// Image catalog
#[derive(Debug, Clone, Default)]
pub struct ImageCatalog {
    configs: HashMap<String, ImageConfig>,
}

impl ImageCatalog {
    /// Load image configurations from images.json
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Image catalog not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        let images_json: ImagesJson = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        let mut configs = HashMap::new();
        for image in images_json.images {
            if configs.contains_key(&image.name) {
                bail!("Image '{}' is listed twice in {}", image.name, config_path.display());
            }
            configs.insert(image.name.clone(), image);
        }

        Ok(Self { configs })
    }

    /// Load with default path (config/images.json)
    pub fn load_default() -> Result<Self> {
        Self::load(Path::new("config/images.json"))
    }

    pub fn from_configs(images: impl IntoIterator<Item = ImageConfig>) -> Self {
        Self {
            configs: images
                .into_iter()
                .map(|image| (image.name.clone(), image))
                .collect(),
        }
    }

    /// Configuration for a tag, falling back to an inferred one
    pub fn get_config(&self, tag: &str) -> ImageConfig {
        self.configs
            .get(tag)
            .cloned()
            .unwrap_or_else(|| ImageConfig::inferred(tag))
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.configs.contains_key(tag)
    }

    /// List all catalogued tags, sorted
    pub fn list_images(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.keys().cloned().collect();
        names.sort();
        names
    }
}
