//! Build configuration
//!
//! The configuration is read from a YAML file in the repository. Stage blocks
//! (`before_stages`, `build`, `test`, `after_stages`, `deploy`) are kept in
//! the order they appear in the file.

use serde::{Deserialize, Serialize};

use crate::domain::stage::{Stage, StageTrigger};
use crate::error::ConfigError;

/// Top-level keys that declare a stage block
pub const STAGE_KEYS: [&str; 5] = ["before_stages", "build", "test", "after_stages", "deploy"];

/// Build configuration of a repository
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Container image; mutually exclusive with `machine_tag`
    pub image: Option<String>,
    /// Selects a VM or bare host instead of a container
    pub machine_tag: Option<String>,
    /// Sidecar images
    pub services: Vec<String>,
    /// Branch filters (regular expressions matched against the full name)
    pub branches: Vec<String>,
    /// Environment shared by every stage, `KEY=VALUE`
    pub env: Vec<String>,
    /// User stages in file order
    pub stages: Vec<Stage>,
}

#[derive(Deserialize)]
struct RawConfig {
    #[serde(default)]
    image: Option<String>,
    #[serde(default, alias = "machineTag")]
    machine_tag: Option<String>,
    #[serde(default)]
    services: Vec<String>,
    #[serde(default)]
    branches: Vec<String>,
    #[serde(default)]
    env: Vec<String>,
    #[serde(flatten)]
    rest: serde_yaml::Mapping,
}

#[derive(Deserialize)]
struct StageBlock {
    #[serde(default)]
    script: Vec<String>,
    #[serde(default)]
    env: Vec<String>,
    #[serde(default)]
    trigger: Option<StageTrigger>,
}

impl BuildConfig {
    /// Parses a YAML build configuration
    pub fn from_yaml(source: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_yaml::from_str(source)?;

        let mut stages = Vec::new();
        for (key, value) in raw.rest {
            let name = key
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| format!("{:?}", key));

            if !STAGE_KEYS.contains(&name.as_str()) {
                return Err(ConfigError::UnknownKey(name));
            }

            let block: StageBlock = serde_yaml::from_value(value)?;
            stages.push(Stage {
                name,
                script: block.script,
                env: block.env,
                trigger: block.trigger,
            });
        }

        Ok(Self {
            image: raw.image.filter(|i| !i.is_empty()),
            machine_tag: raw.machine_tag.filter(|m| !m.is_empty()),
            services: raw.services,
            branches: raw.branches,
            env: raw.env,
            stages,
        })
    }

    /// Checks that the configuration can be built at all
    pub fn validate(&self) -> Result<(), ConfigError> {
        match (&self.image, &self.machine_tag) {
            (None, None) => {
                return Err(ConfigError::Invalid(
                    "there is no image and no machine_tag in the build configuration, one of these is required"
                        .to_string(),
                ));
            }
            (Some(_), Some(_)) => {
                return Err(ConfigError::Invalid(
                    "image and machine_tag are mutually exclusive".to_string(),
                ));
            }
            _ => {}
        }

        if self.stages.is_empty() {
            return Err(ConfigError::Invalid(
                "there must be at least one stage listed".to_string(),
            ));
        }

        for stage in &self.stages {
            if stage.script.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "script for stage {} should not be empty",
                    stage.name
                )));
            }
            for assignment in &stage.env {
                if !assignment.contains('=') {
                    return Err(ConfigError::Invalid(format!(
                        "env entry {:?} of stage {} is not KEY=VALUE",
                        assignment, stage.name
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
image: golang:1.22
services:
  - redis:7
branches:
  - main
  - release/.*
env:
  - CGO_ENABLED=0
build:
  script:
    - go build ./...
  env:
    - GOFLAGS=-mod=vendor
before_stages:
  script:
    - go mod download
test:
  script:
    - go test ./...
deploy:
  script:
    - ./deploy.sh
  trigger:
    branches:
      - main
"#;

    #[test]
    fn test_parse_keeps_file_order() {
        let config = BuildConfig::from_yaml(SAMPLE).unwrap();
        let names: Vec<_> = config.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["build", "before_stages", "test", "deploy"]);
        assert_eq!(config.image.as_deref(), Some("golang:1.22"));
        assert_eq!(config.services, vec!["redis:7"]);
        assert_eq!(config.stages[0].env, vec!["GOFLAGS=-mod=vendor"]);
        assert!(config.stages[3].skipped_for("feature/x"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let err = BuildConfig::from_yaml("image: alpine\nbiuld:\n  script: [make]\n").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownKey(ref k) if k == "biuld"));
    }

    #[test]
    fn test_validate_requires_image_or_machine() {
        let config = BuildConfig::from_yaml("build:\n  script: [make]\n").unwrap();
        assert!(config.validate().is_err());

        let config =
            BuildConfig::from_yaml("image: alpine\nmachine_tag: mac\nbuild:\n  script: [make]\n")
                .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_script() {
        let config = BuildConfig::from_yaml("image: alpine\nbuild:\n  env: [A=1]\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("build"));
    }

    #[test]
    fn test_validate_requires_a_stage() {
        let config = BuildConfig::from_yaml("image: alpine\n").unwrap();
        assert!(config.validate().is_err());
    }
}
