use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// One selectable context size for a model, as read from `LLM_profiles.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextProfile {
    pub size: usize,
    pub size_label: String,
    /// The integer the backend is told to use for `num_ctx`. Never scaled by
    /// the CCE once chosen (see VramMonitor auto-sizing).
    pub ollama_context_size: usize,
    pub vram_estimate_gb: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelProfile {
    pub id: String,
    pub display_name: String,
    pub tool_support: bool,
    pub max_context_window: usize,
    pub context_profiles: Vec<ContextProfile>,
    pub default_context: usize,
}

impl ModelProfile {
    /// Context profiles ordered by ascending `vram_estimate_gb`, as required
    /// by the auto-sizing algorithm.
    pub fn profiles_by_vram(&self) -> Vec<&ContextProfile> {
        let mut profiles: Vec<&ContextProfile> = self.context_profiles.iter().collect();
        profiles.sort_by(|a, b| a.vram_estimate_gb.partial_cmp(&b.vram_estimate_gb).unwrap());
        profiles
    }

    pub fn profile_for_default(&self) -> Option<&ContextProfile> {
        self.context_profiles
            .iter()
            .find(|p| p.ollama_context_size == self.default_context)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProfileFile {
    version: u32,
    models: Vec<ModelProfile>,
}

/// Read-only access to `<home>/.ollm/LLM_profiles.json`. Loaded once at
/// session start and never written back by the CCE.
pub struct ProfileStore {
    path: PathBuf,
}

impl ProfileStore {
    pub fn new(home: impl AsRef<Path>) -> Self {
        Self {
            path: home.as_ref().join(".ollm").join("LLM_profiles.json"),
        }
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn load(&self) -> Result<Vec<ModelProfile>> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading profile file {}", self.path.display()))?;
        let parsed: ProfileFile = serde_json::from_str(&raw)
            .with_context(|| format!("parsing profile file {}", self.path.display()))?;
        Ok(parsed.models)
    }

    pub async fn find(&self, model_id: &str) -> Result<Option<ModelProfile>> {
        let models = self.load().await?;
        Ok(models.into_iter().find(|m| m.id == model_id))
    }
}

/// Fallback used when the requested model id is absent from the profile
/// file: tool support disabled, smallest reasonable context size, a single
/// profile so auto-sizing has something to pick from.
pub fn unknown_model_profile(model_id: &str) -> ModelProfile {
    const FALLBACK_CONTEXT: usize = 4096;
    ModelProfile {
        id: model_id.to_string(),
        display_name: format!("{model_id} (unknown profile)"),
        tool_support: false,
        max_context_window: FALLBACK_CONTEXT,
        context_profiles: vec![ContextProfile {
            size: FALLBACK_CONTEXT,
            size_label: "small".to_string(),
            ollama_context_size: FALLBACK_CONTEXT,
            vram_estimate_gb: 2.0,
        }],
        default_context: FALLBACK_CONTEXT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_json() -> &'static str {
        r#"{
            "version": 1,
            "models": [
                {
                    "id": "llama3:8b",
                    "display_name": "Llama 3 8B",
                    "tool_support": true,
                    "max_context_window": 8192,
                    "default_context": 6963,
                    "context_profiles": [
                        {"size": 4096, "size_label": "small", "ollama_context_size": 4096, "vram_estimate_gb": 4.5},
                        {"size": 6963, "size_label": "medium", "ollama_context_size": 6963, "vram_estimate_gb": 7.0},
                        {"size": 8192, "size_label": "large", "ollama_context_size": 8192, "vram_estimate_gb": 9.5}
                    ]
                }
            ]
        }"#
    }

    #[tokio::test]
    async fn finds_known_model() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("LLM_profiles.json");
        tokio::fs::write(&path, sample_json()).await.unwrap();

        let store = ProfileStore::with_path(&path);
        let profile = store.find("llama3:8b").await.unwrap().unwrap();
        assert_eq!(profile.default_context, 6963);
        assert_eq!(profile.context_profiles.len(), 3);
    }

    #[tokio::test]
    async fn missing_model_returns_none() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("LLM_profiles.json");
        tokio::fs::write(&path, sample_json()).await.unwrap();

        let store = ProfileStore::with_path(&path);
        assert!(store.find("does-not-exist").await.unwrap().is_none());
    }

    #[test]
    fn unknown_profile_disables_tools() {
        let profile = unknown_model_profile("mystery-model");
        assert!(!profile.tool_support);
        assert_eq!(profile.context_profiles.len(), 1);
    }

    #[test]
    fn profiles_by_vram_is_ascending() {
        let profile = ModelProfile {
            id: "m".into(),
            display_name: "m".into(),
            tool_support: true,
            max_context_window: 8192,
            default_context: 4096,
            context_profiles: vec![
                ContextProfile { size: 8192, size_label: "l".into(), ollama_context_size: 8192, vram_estimate_gb: 9.0 },
                ContextProfile { size: 2048, size_label: "s".into(), ollama_context_size: 2048, vram_estimate_gb: 2.0 },
            ],
        };
        let ordered = profile.profiles_by_vram();
        assert_eq!(ordered[0].size, 2048);
        assert_eq!(ordered[1].size, 8192);
    }
}
