use anyhow::{Context, Result};
use std::path::PathBuf;
use vulnscan_core::analysis::DEFAULT_PROMPT_BUDGET;
use vulnscan_core::AnalysisMode;

/// 服务配置，全部来自环境变量（可由 .env 提供）
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_address: String,
    pub database_url: String,
    pub worker_concurrency: usize,
    pub analysis_mode: AnalysisMode,
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub openai_base_url: String,
    pub analysis_prompt_budget: usize,
    pub tools_config: Option<PathBuf>,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let worker_concurrency = match var("WORKER_CONCURRENCY") {
            Some(v) => v
                .parse::<usize>()
                .with_context(|| format!("WORKER_CONCURRENCY must be a positive integer, got '{}'", v))?,
            None => 2,
        };
        let analysis_mode = match var("ANALYSIS_MODE") {
            Some(v) => v.parse::<AnalysisMode>()?,
            None => AnalysisMode::Inline,
        };
        let analysis_prompt_budget = match var("ANALYSIS_PROMPT_BUDGET") {
            Some(v) => v
                .parse::<usize>()
                .with_context(|| format!("ANALYSIS_PROMPT_BUDGET must be a byte count, got '{}'", v))?,
            None => DEFAULT_PROMPT_BUDGET,
        };

        Ok(Self {
            bind_address: var("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:8000".to_string()),
            database_url: var("DATABASE_URL").unwrap_or_else(|| "sqlite://vulnscan.db".to_string()),
            worker_concurrency: worker_concurrency.max(1),
            analysis_mode,
            openai_api_key: var("OPENAI_API_KEY"),
            openai_model: var("OPENAI_MODEL").unwrap_or_else(|| "gpt-3.5-turbo".to_string()),
            openai_base_url: var("OPENAI_BASE_URL").unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            analysis_prompt_budget,
            tools_config: var("TOOLS_CONFIG").map(PathBuf::from),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(pairs: &[(&str, &str)]) -> Result<Settings> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let s = settings(&[]).unwrap();
        assert_eq!(s.bind_address, "0.0.0.0:8000");
        assert_eq!(s.database_url, "sqlite://vulnscan.db");
        assert_eq!(s.worker_concurrency, 2);
        assert_eq!(s.analysis_mode, AnalysisMode::Inline);
        assert!(s.openai_api_key.is_none());
        assert_eq!(s.analysis_prompt_budget, 1000);
        assert!(s.tools_config.is_none());
    }

    #[test]
    fn values_are_read_and_validated() {
        let s = settings(&[
            ("ANALYSIS_MODE", "deferred"),
            ("WORKER_CONCURRENCY", "4"),
            ("OPENAI_API_KEY", "  "),
            ("TOOLS_CONFIG", "/etc/vulnscan/tools.yaml"),
        ])
        .unwrap();
        assert_eq!(s.analysis_mode, AnalysisMode::Deferred);
        assert_eq!(s.worker_concurrency, 4);
        assert!(s.openai_api_key.is_none());
        assert_eq!(s.tools_config, Some(PathBuf::from("/etc/vulnscan/tools.yaml")));

        assert!(settings(&[("WORKER_CONCURRENCY", "many")]).is_err());
        assert!(settings(&[("ANALYSIS_MODE", "sometimes")]).is_err());
    }
}
