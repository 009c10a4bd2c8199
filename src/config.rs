use crate::types::Config;
use anyhow::Result;
use std::fs;
use std::path::Path;

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Load `config.yaml` if present, otherwise start from defaults.
    pub fn load_or_default(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = Config::load_or_default("/nonexistent/config.yaml").unwrap();
        assert_eq!(config.analysis.frame_skip, 5);
        assert_eq!(config.video.max_output_width, 1920);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults_elsewhere() {
        let yaml = "analysis:\n  frame_skip: 2\nvideo:\n  input_dir: clips\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.analysis.frame_skip, 2);
        assert_eq!(config.video.input_dir, "clips");
        assert_eq!(config.analysis.lock_threshold, 5);
        assert_eq!(config.ocr.max_attempts, 10);
    }
}
