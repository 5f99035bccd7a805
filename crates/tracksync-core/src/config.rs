use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::flow::{FlowProvider, Job, Step, Trigger};
use crate::vars::Evaluator;

pub const DEFAULT_CONFIG_FILE: &str = "tracksync.yaml";

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

impl ConfigWarning {
    fn error(message: String) -> Self {
        Self {
            level: WarnLevel::Error,
            message,
        }
    }

    fn warning(message: String) -> Self {
        Self {
            level: WarnLevel::Warning,
            message,
        }
    }
}

// ---------------------------------------------------------------------------
// ServerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Externally visible address webhooks are delivered to.
    pub base_url: String,
    /// Upper bound for one job run. Unset means no bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_timeout_secs: Option<u64>,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

impl ServerConfig {
    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }
}

// ---------------------------------------------------------------------------
// StorageConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageConfig {
    Redb {
        #[serde(default = "default_db_path")]
        path: PathBuf,
    },
    Memory,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("tracksync.redb")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Redb {
            path: default_db_path(),
        }
    }
}

// ---------------------------------------------------------------------------
// TrackerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    /// `host:port` the plugin serves its RPC endpoint on.
    pub address: String,
    /// Executable (plus arguments) to launch before dialing.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
}

fn default_attempts() -> u32 {
    5
}

fn default_delay_ms() -> u64 {
    500
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    pub name: String,
    pub plugin: PluginConfig,
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub trackers: Vec<TrackerConfig>,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    #[serde(default)]
    pub jobs: Vec<Job>,
}

static NAME_RE: OnceLock<Regex> = OnceLock::new();

fn name_re() -> &'static Regex {
    NAME_RE.get_or_init(|| {
        Regex::new(r"^[a-z0-9][a-z0-9_\-]*$").expect("name pattern is valid")
    })
}

impl Config {
    /// Parse a configuration without validating it.
    pub fn from_yaml(data: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(data)?)
    }

    /// Read, parse and validate the file at `path`.
    ///
    /// Any `Error`-level warning fails the load.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::InvalidConfig(format!(
                "{} does not exist",
                path.display()
            )));
        }
        let data = std::fs::read_to_string(path)?;
        let cfg = Self::from_yaml(&data)?;
        let errors: Vec<_> = cfg
            .validate()
            .into_iter()
            .filter(|w| w.level == WarnLevel::Error)
            .map(|w| w.message)
            .collect();
        if !errors.is_empty() {
            return Err(Error::InvalidConfig(errors.join("; ")));
        }
        Ok(cfg)
    }

    pub fn tracker(&self, name: &str) -> Option<&TrackerConfig> {
        self.trackers.iter().find(|t| t.name == name)
    }

    pub fn trigger(&self, name: &str) -> Option<&Trigger> {
        self.triggers.iter().find(|t| t.name == name)
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let evaluator = Evaluator::default();

        if !self.server.base_url.starts_with("http://")
            && !self.server.base_url.starts_with("https://")
        {
            warnings.push(ConfigWarning::error(format!(
                "server.base_url '{}' must be an http(s) URL",
                self.server.base_url
            )));
        }

        // 1. Tracker names: slugs, unique
        let mut trackers = HashSet::new();
        for tracker in &self.trackers {
            if !name_re().is_match(&tracker.name) {
                warnings.push(ConfigWarning::error(format!(
                    "tracker name '{}' must be lowercase alphanumeric with '-' or '_'",
                    tracker.name
                )));
            }
            if !trackers.insert(tracker.name.as_str()) {
                warnings.push(ConfigWarning::error(format!(
                    "tracker '{}' is defined more than once",
                    tracker.name
                )));
            }
            if tracker.plugin.attempts == 0 {
                warnings.push(ConfigWarning::error(format!(
                    "tracker '{}' has plugin.attempts=0",
                    tracker.name
                )));
            }
        }

        // 2. Triggers reference configured trackers
        let mut triggers = HashSet::new();
        for trigger in &self.triggers {
            if !triggers.insert(trigger.name.as_str()) {
                warnings.push(ConfigWarning::error(format!(
                    "trigger '{}' is defined more than once",
                    trigger.name
                )));
            }
            if !trackers.contains(trigger.tracker.as_str()) {
                warnings.push(ConfigWarning::error(format!(
                    "trigger '{}' references unknown tracker '{}'",
                    trigger.name, trigger.tracker
                )));
            }
            for (key, value) in trigger.vars.iter() {
                if let Err(e) = evaluator.check_template(value) {
                    warnings.push(ConfigWarning::error(format!(
                        "trigger '{}' var '{key}': {e}",
                        trigger.name
                    )));
                }
            }
        }

        // 3. Jobs reference configured triggers and trackers
        let mut referenced = HashSet::new();
        for job in &self.jobs {
            if !triggers.contains(job.trigger_name.as_str()) {
                warnings.push(ConfigWarning::error(format!(
                    "job '{}' references unknown trigger '{}'",
                    job.name, job.trigger_name
                )));
            }
            referenced.insert(job.trigger_name.as_str());
            if job.actions.is_empty() {
                warnings.push(ConfigWarning::warning(format!(
                    "job '{}' has no actions",
                    job.name
                )));
            }
            self.validate_sequence(&job.name, &job.actions, &trackers, &evaluator, &mut warnings);
        }

        // 4. Triggers no job listens to still register webhooks
        for trigger in &self.triggers {
            if !referenced.contains(trigger.name.as_str()) {
                warnings.push(ConfigWarning::warning(format!(
                    "trigger '{}' is not used by any job",
                    trigger.name
                )));
            }
        }

        warnings
    }

    fn validate_sequence(
        &self,
        job: &str,
        seq: &[Step],
        trackers: &HashSet<&str>,
        evaluator: &Evaluator,
        warnings: &mut Vec<ConfigWarning>,
    ) {
        for step in seq {
            match step {
                Step::If(branch) => {
                    if let Err(e) = evaluator.check_condition(&branch.condition) {
                        warnings.push(ConfigWarning::error(format!(
                            "job '{job}' if '{}': {e}",
                            branch.condition
                        )));
                    }
                    self.validate_sequence(job, &branch.actions, trackers, evaluator, warnings);
                }
                Step::Action(action) => {
                    if !trackers.contains(action.name.tracker.as_str()) {
                        warnings.push(ConfigWarning::error(format!(
                            "job '{job}' action '{}' references unknown tracker '{}'",
                            action.name, action.name.tracker
                        )));
                    }
                    for (key, value) in action.vars.iter() {
                        if let Err(e) = evaluator.check_template(value) {
                            warnings.push(ConfigWarning::error(format!(
                                "job '{job}' action '{}' var '{key}': {e}",
                                action.name
                            )));
                        }
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// FlowProvider
// ---------------------------------------------------------------------------

#[async_trait]
impl FlowProvider for Config {
    async fn list_subscribed_jobs(&self, trigger: &str) -> Result<Vec<Job>> {
        let jobs: Vec<Job> = self
            .jobs
            .iter()
            .filter(|j| j.trigger_name == trigger)
            .cloned()
            .collect();
        if jobs.is_empty() {
            return Err(Error::not_found("jobs for trigger", trigger));
        }
        Ok(jobs)
    }

    async fn list_trackers(&self) -> Result<Vec<String>> {
        Ok(self.trackers.iter().map(|t| t.name.clone()).collect())
    }

    async fn list_triggers(&self) -> Result<Vec<Trigger>> {
        Ok(self.triggers.clone())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const VALID: &str = r#"
server:
  listen: "127.0.0.1:9000"
  base_url: "https://hooks.example.com"
  run_timeout_secs: 30
storage:
  type: memory
trackers:
  - name: github
    plugin:
      address: "127.0.0.1:7001"
  - name: jira
    plugin:
      address: "127.0.0.1:7002"
      attempts: 3
      delay_ms: 100
triggers:
  - name: new-issue
    tracker: github
    vars:
      events: issues
jobs:
  - name: mirror
    trigger: new-issue
    actions:
      - name: jira/create
        vars:
          title: "{{ .Update.Title }}"
      - if: 'eq .Update.Fields.label "bug"'
        actions:
          - name: jira/label
            vars:
              label: bug
"#;

    fn messages(cfg: &Config) -> Vec<String> {
        cfg.validate().into_iter().map(|w| w.message).collect()
    }

    #[test]
    fn valid_config_parses_with_defaults() {
        let cfg = Config::from_yaml(VALID).unwrap();
        assert_eq!(cfg.storage, StorageConfig::Memory);
        assert_eq!(cfg.server.run_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(cfg.tracker("github").unwrap().plugin.attempts, 5);
        assert_eq!(cfg.tracker("jira").unwrap().plugin.delay_ms, 100);
        assert!(cfg.validate().is_empty(), "{:?}", messages(&cfg));
    }

    #[test]
    fn storage_defaults_to_redb() {
        let cfg = Config::from_yaml("server:\n  base_url: http://localhost:8080\n").unwrap();
        assert!(matches!(cfg.storage, StorageConfig::Redb { .. }));
        assert_eq!(cfg.server.listen.port(), 8080);
    }

    #[test]
    fn unknown_references_are_errors() {
        let mut cfg = Config::from_yaml(VALID).unwrap();
        cfg.triggers[0].tracker = "gitlab".into();
        cfg.jobs[0].trigger_name = "closed".into();
        let msgs = messages(&cfg);
        assert!(msgs.iter().any(|m| m.contains("unknown tracker 'gitlab'")));
        assert!(msgs.iter().any(|m| m.contains("unknown trigger 'closed'")));
    }

    #[test]
    fn nested_action_tracker_is_checked() {
        let yaml = VALID.replace("name: jira/label", "name: linear/label");
        let cfg = Config::from_yaml(&yaml).unwrap();
        assert!(messages(&cfg)
            .iter()
            .any(|m| m.contains("unknown tracker 'linear'")));
    }

    #[test]
    fn bad_templates_are_errors() {
        let yaml = VALID.replace("{{ .Update.Title }}", "{{ shout .Update.Title }}");
        let cfg = Config::from_yaml(&yaml).unwrap();
        assert!(messages(&cfg).iter().any(|m| m.contains("var 'title'")));

        let yaml = VALID.replace(r#"eq .Update.Fields.label "bug""#, "(eq");
        let cfg = Config::from_yaml(&yaml).unwrap();
        assert!(messages(&cfg).iter().any(|m| m.contains("if '(eq'")));
    }

    #[test]
    fn nested_if_condition_is_checked() {
        let yaml = VALID.replace(
            "          - name: jira/label\n",
            "          - if: 'shout .Update.Title'\n            actions:\n              - name: jira/label\n",
        )
        .replace("            vars:\n              label: bug\n", "");
        let cfg = Config::from_yaml(&yaml).unwrap();
        assert!(
            messages(&cfg).iter().any(|m| m.contains("if 'shout .Update.Title'")),
            "{:?}",
            messages(&cfg)
        );
    }

    #[test]
    fn malformed_action_name_fails_parse() {
        let yaml = VALID.replace("name: jira/create", "name: jira-create");
        assert!(Config::from_yaml(&yaml).is_err());
    }

    #[test]
    fn duplicate_and_invalid_tracker_names() {
        let mut cfg = Config::from_yaml(VALID).unwrap();
        cfg.trackers[1].name = "github".into();
        cfg.trackers.push(TrackerConfig {
            name: "Bad Name".into(),
            plugin: cfg.trackers[0].plugin.clone(),
        });
        let msgs = messages(&cfg);
        assert!(msgs.iter().any(|m| m.contains("defined more than once")));
        assert!(msgs.iter().any(|m| m.contains("'Bad Name'")));
    }

    #[test]
    fn unused_trigger_is_only_a_warning() {
        let mut cfg = Config::from_yaml(VALID).unwrap();
        cfg.jobs.clear();
        let warnings = cfg.validate();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].level, WarnLevel::Warning);
    }

    #[test]
    fn load_fails_on_validation_errors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&path, VALID.replace("tracker: github", "tracker: nope")).unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)), "{err:?}");

        std::fs::write(&path, VALID).unwrap();
        assert!(Config::load(&path).is_ok());
    }

    #[tokio::test]
    async fn flow_provider_lists_jobs_by_trigger() {
        let cfg = Config::from_yaml(VALID).unwrap();
        let jobs = cfg.list_subscribed_jobs("new-issue").await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].name, "mirror");
        assert!(cfg
            .list_subscribed_jobs("nobody")
            .await
            .unwrap_err()
            .is_not_found());
        assert_eq!(cfg.list_trackers().await.unwrap(), vec!["github", "jira"]);
        assert_eq!(cfg.list_triggers().await.unwrap().len(), 1);
    }
}
