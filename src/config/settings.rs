//! Application settings and test definitions

use crate::core::dispatcher::DispatchPolicy;
use crate::core::source::DEFAULT_BAUD_RATE;
use crate::core::testcase::{
    builtin_suite, MarkerTest, TestBudget, TestCase, TestDefinitionError,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// No platform config directory
    #[error("Could not determine config directory")]
    NoConfigDir,

    /// File could not be read
    #[error("Failed to read {path}: {source}")]
    Io {
        /// Offending file
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// File is not valid TOML for this schema
    #[error("Failed to parse {path}: {source}")]
    Parse {
        /// Offending file
        path: PathBuf,
        /// Underlying error
        source: toml::de::Error,
    },

    /// Config could not be serialized
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A test definition is invalid
    #[error(transparent)]
    InvalidTest(#[from] TestDefinitionError),
}

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Device console port
    pub serial: SerialSettings,
    /// Build/flash step
    pub build: BuildConfig,
    /// Run-level policy
    pub dispatch: DispatchConfig,
    /// JSON-lines session log
    pub session_log: SessionLogConfig,
    /// Test definitions in registration order; empty means built-in suite
    pub tests: Vec<TestDefinition>,
}

impl AppConfig {
    /// Load config from the default location, falling back to defaults
    pub fn load() -> Result<Self, ConfigError> {
        let path = super::default_config_path().ok_or(ConfigError::NoConfigDir)?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a file
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), tests = config.tests.len(), "Loaded config");
        Ok(config)
    }

    /// Save config to a file
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Build the test suite in registration order
    pub fn suite(&self) -> Result<Vec<MarkerTest>, ConfigError> {
        if self.tests.is_empty() {
            return Ok(builtin_suite());
        }
        self.tests
            .iter()
            .map(|def| def.to_test().map_err(ConfigError::from))
            .collect()
    }

    /// Dispatcher policy
    pub fn policy(&self) -> DispatchPolicy {
        self.dispatch.policy()
    }
}

/// Serial port settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Port name (e.g., /dev/ttyUSB0, COM3)
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

/// Build/flash settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Run the build before dispatching
    pub enabled: bool,
    /// Script passed to `bash -c`
    pub script: String,
    /// Directory the script runs in
    pub working_dir: Option<PathBuf>,
    /// Kill the build after this many seconds
    pub timeout_secs: Option<u64>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            script: ". build Test && up".to_string(),
            working_dir: None,
            timeout_secs: None,
        }
    }
}

/// Run-level policy settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Halt when no test triggers for this many seconds
    pub idle_timeout_secs: Option<u64>,
    /// Finish once these tests have all completed
    pub stop_after: Vec<String>,
}

impl DispatchConfig {
    /// Convert to a dispatcher policy
    pub fn policy(&self) -> DispatchPolicy {
        let mut policy = DispatchPolicy::indefinite().stop_after(self.stop_after.iter().cloned());
        if let Some(secs) = self.idle_timeout_secs {
            policy = policy.idle_timeout(Duration::from_secs(secs));
        }
        policy
    }
}

/// Session log settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionLogConfig {
    /// Write a session log
    pub enabled: bool,
    /// Directory for session logs
    pub directory: Option<PathBuf>,
}

impl Default for SessionLogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: super::log_dir(),
        }
    }
}

/// A marker test described as data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestDefinition {
    /// Test name
    pub name: String,
    /// Substring that activates the test
    pub trigger: String,
    /// Required markers; the last one completes the test
    pub markers: Vec<String>,
    /// Substrings that fail the test
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fail_markers: Vec<String>,
    /// Fail after this many lines without completing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_lines: Option<u64>,
    /// Fail after this many seconds without completing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl TestDefinition {
    /// Validate and build the test
    pub fn to_test(&self) -> Result<MarkerTest, TestDefinitionError> {
        if self.max_lines == Some(0) {
            return Err(TestDefinitionError::ZeroBudget(self.name.clone(), "max_lines"));
        }
        if self.timeout_secs == Some(0) {
            return Err(TestDefinitionError::ZeroBudget(self.name.clone(), "timeout_secs"));
        }

        let mut budget = TestBudget::unlimited();
        if let Some(lines) = self.max_lines {
            budget = budget.max_lines(lines);
        }
        if let Some(secs) = self.timeout_secs {
            budget = budget.timeout(Duration::from_secs(secs));
        }

        Ok(
            MarkerTest::new(&self.name, &self.trigger, self.markers.iter().cloned())?
                .with_fail_markers(self.fail_markers.iter().cloned())?
                .with_budget(budget),
        )
    }
}

impl From<&MarkerTest> for TestDefinition {
    fn from(test: &MarkerTest) -> Self {
        let budget = test.budget();
        Self {
            name: test.name().to_string(),
            trigger: test.trigger().to_string(),
            markers: test.markers().to_vec(),
            fail_markers: test.fail_markers().to_vec(),
            max_lines: budget.max_lines,
            // Whole seconds, rounded up so a short budget never reads as zero.
            timeout_secs: budget
                .timeout
                .map(|t| t.as_secs().saturating_add(u64::from(t.subsec_nanos() > 0))),
        }
    }
}

/// A standalone suite file containing only test definitions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteFile {
    /// Tests in registration order
    #[serde(default)]
    pub tests: Vec<TestDefinition>,
}

/// Discover `*.toml` suite files in `dir` and concatenate their tests.
///
/// Files are visited in file-name order so registration order is stable.
pub fn load_suite_dir(dir: &Path) -> Result<Vec<TestDefinition>, ConfigError> {
    let io_err = |source| ConfigError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(io_err)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "toml"))
        .collect();
    files.sort();

    let mut tests = Vec::new();
    for path in files {
        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let suite: SuiteFile = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        tracing::debug!(path = %path.display(), tests = suite.tests.len(), "Loaded suite file");
        tests.extend(suite.tests);
    }
    Ok(tests)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dispatcher::{Dispatcher, DispatcherPhase};
    use crate::core::events::RecordingSink;
    use crate::core::queue;

    const SAMPLE: &str = r#"
[serial]
port = "/dev/ttyACM1"

[build]
enabled = false

[dispatch]
idle_timeout_secs = 120
stop_after = ["Boot"]

[[tests]]
name = "Boot"
trigger = "Bootloader"
markers = ["Bootloader", "App started"]
fail_markers = ["HardFault"]
timeout_secs = 30
"#;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: AppConfig = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.serial.port, "/dev/ttyACM1");
        assert_eq!(config.serial.baud_rate, 115_200);
        assert!(!config.build.enabled);
        assert_eq!(config.build.script, ". build Test && up");

        let policy = config.policy();
        assert_eq!(policy.idle_timeout, Some(Duration::from_secs(120)));
        assert_eq!(policy.stop_after, vec!["Boot".to_string()]);

        let suite = config.suite().unwrap();
        assert_eq!(suite.len(), 1);
        assert_eq!(suite[0].name(), "Boot");
        assert_eq!(suite[0].fail_markers(), ["HardFault".to_string()]);
        assert_eq!(suite[0].budget().timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_definition_round_trips_through_marker_test() {
        let config: AppConfig = toml::from_str(SAMPLE).unwrap();
        let test = config.tests[0].to_test().unwrap();
        assert_eq!(TestDefinition::from(&test), config.tests[0]);
    }

    #[test]
    fn test_empty_tests_means_builtin_suite() {
        let suite = AppConfig::default().suite().unwrap();
        let names: Vec<&str> = suite.iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["BootupTest", "CheckinTest"]);
    }

    #[test]
    fn test_invalid_definition_is_rejected() {
        let config: AppConfig = toml::from_str(
            r#"
[[tests]]
name = "Broken"
trigger = "x"
markers = []
"#,
        )
        .unwrap();
        assert!(matches!(
            config.suite(),
            Err(ConfigError::InvalidTest(TestDefinitionError::NoMarkers(_)))
        ));
    }

    #[test]
    fn test_zero_budgets_are_rejected() {
        let config: AppConfig = toml::from_str(
            r#"
[[tests]]
name = "Boot"
trigger = "Bootloader"
markers = ["ready"]
max_lines = 0
"#,
        )
        .unwrap();
        assert_eq!(
            config.tests[0].to_test().unwrap_err(),
            TestDefinitionError::ZeroBudget("Boot".into(), "max_lines")
        );

        let mut def = config.tests[0].clone();
        def.max_lines = None;
        def.timeout_secs = Some(0);
        assert!(matches!(
            def.to_test(),
            Err(TestDefinitionError::ZeroBudget(_, "timeout_secs"))
        ));
    }

    #[test]
    fn test_sub_second_timeout_rounds_up() {
        let test = MarkerTest::bootup()
            .with_budget(TestBudget::unlimited().timeout(Duration::from_millis(500)));
        assert_eq!(TestDefinition::from(&test).timeout_secs, Some(1));

        let test = MarkerTest::bootup()
            .with_budget(TestBudget::unlimited().timeout(Duration::from_secs(30)));
        assert_eq!(TestDefinition::from(&test).timeout_secs, Some(30));
    }

    #[test]
    fn test_huge_limits_load_and_run() {
        let config: AppConfig = toml::from_str(
            r#"
[dispatch]
idle_timeout_secs = 9223372036854775807

[[tests]]
name = "Boot"
trigger = "Bootloader"
markers = ["ready"]
timeout_secs = 9223372036854775807
"#,
        )
        .unwrap();

        let mut dispatcher = Dispatcher::with_policy(RecordingSink::new(), config.policy());
        for test in config.suite().unwrap() {
            dispatcher.register(test).unwrap();
        }
        let (tx, rx) = queue::channel();
        tx.push("Bootloader 1.0");
        tx.push("still booting");
        drop(tx);

        let report = dispatcher.run(&rx);
        assert_eq!(report.phase, DispatcherPhase::HaltedOnStreamEnd);
        assert_eq!(report.interrupted.as_deref(), Some("Boot"));
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let config: AppConfig = toml::from_str(SAMPLE).unwrap();
        config.save_to(&path).unwrap();
        assert_eq!(AppConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_parse_error_names_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[serial\nport = 1").unwrap();
        let err = AppConfig::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("bad.toml"));
    }

    #[test]
    fn test_suite_dir_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("20_checkin.toml"),
            "[[tests]]\nname = \"Checkin\"\ntrigger = \"WAN\"\nmarkers = [\"POST OK\"]\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("10_boot.toml"),
            "[[tests]]\nname = \"Boot\"\ntrigger = \"Boot\"\nmarkers = [\"ready\"]\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let tests = load_suite_dir(dir.path()).unwrap();
        let names: Vec<&str> = tests.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["Boot", "Checkin"]);
    }
}
