//! Read-only figure records supplied by the surrounding application.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FigureSummary {
    pub title: String,
    #[serde(default)]
    pub reign: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FigureProfile {
    pub summary: FigureSummary,
    /// Biography as HTML.
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, rename = "imageUrl")]
    pub image_url: Option<String>,
}

impl FigureProfile {
    /// Title without the parenthesised dates, e.g. "Ashoka the Great".
    pub fn display_name(&self) -> &str {
        let title = &self.summary.title;
        title.split('(').next().unwrap_or(title).trim()
    }
}

/// Supplies figure records by identifier.
pub trait ContentProvider: Send + Sync {
    fn figure(&self, figure_id: &str) -> Option<FigureProfile>;

    fn figure_ids(&self) -> Vec<String>;
}

/// In-memory content loaded from a JSON map keyed by figure id.
#[derive(Debug, Default, Clone)]
pub struct StaticContent {
    figures: HashMap<String, FigureProfile>,
}

impl StaticContent {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let figures: HashMap<String, FigureProfile> =
            serde_json::from_str(json).context("Failed to parse figure content")?;
        Ok(Self { figures })
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read content file {}", path.display()))?;
        Self::from_json_str(&raw)
    }

    pub fn len(&self) -> usize {
        self.figures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.figures.is_empty()
    }
}

impl ContentProvider for StaticContent {
    fn figure(&self, figure_id: &str) -> Option<FigureProfile> {
        self.figures.get(figure_id).cloned()
    }

    fn figure_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.figures.keys().cloned().collect();
        ids.sort();
        ids
    }
}
