//! Run configuration: a TOML file plus command-line overrides.
//!
//! Everything is validated here, before any traffic is generated, so a bad
//! configuration surfaces as a [`ConfigError`] and never as a half-run test.
//!
//! ```toml
//! [target]
//! base_url = "https://staging.example.com"
//! path = "/test/init"
//! timeout = "120s"
//!
//! [signing]
//! secret_key = "..."
//!
//! [payload]
//! amount = 1000
//! lang = "en"
//! data = "accounts.csv"
//!
//! [checks]
//! expected_status = 200
//! max_latency = "120ms"
//!
//! [scenario]
//! name = "init"
//! start_rate = 1
//! time_unit = "1s"
//! ramp = "linear"
//! stages = [{ duration = "10s", target = 10 }]
//!
//! [thresholds]
//! http_req_duration = ["p(99) <= 120"]
//! http_req_failed = ["rate < 0.01"]
//!
//! [summary]
//! trend_stats = ["avg", "p(95)", "p(99)"]
//! ```
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use reqwest::Url;
use serde::Deserialize;

use crate::{
    aggregate::{MetricKind, RunMetrics},
    error::ConfigError,
    executor::{RampPolicy, ScheduleSpec, Stage, default_max_workers},
    report::default_trend_stats,
    threshold::{Statistic, ThresholdSpec},
    worker::Checks,
};

/// Values given on the command line or through the environment; they win over
/// the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub secret_key: Option<String>,
    pub base_url: Option<String>,
}

/// Fully validated configuration of a run.
#[derive(Clone, PartialEq)]
pub struct RunConfig {
    pub endpoint: Url,
    pub timeout: Duration,
    pub secret_key: String,
    pub amount: u64,
    pub lang: String,
    /// Resolved against the config file's directory.
    pub data_path: PathBuf,
    pub checks: Checks,
    pub scenario_name: String,
    pub schedule: ScheduleSpec,
    pub grace_period: Duration,
    pub thresholds: Vec<ThresholdSpec>,
    pub trend_stats: Vec<Statistic>,
}

impl std::fmt::Debug for RunConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunConfig")
            .field("endpoint", &self.endpoint.as_str())
            .field("timeout", &self.timeout)
            .field("secret_key", &"<redacted>")
            .field("amount", &self.amount)
            .field("lang", &self.lang)
            .field("data_path", &self.data_path)
            .field("checks", &self.checks)
            .field("scenario_name", &self.scenario_name)
            .field("schedule", &self.schedule)
            .field("grace_period", &self.grace_period)
            .field("thresholds", &self.thresholds)
            .field("trend_stats", &self.trend_stats)
            .finish()
    }
}

impl RunConfig {
    pub fn load(path: &Path, overrides: &Overrides) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        let config = Self::from_toml_str(&contents, path, overrides)?;
        tracing::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parse `contents` as if read from `path`.
    pub fn from_toml_str(
        contents: &str,
        path: &Path,
        overrides: &Overrides,
    ) -> Result<Self, ConfigError> {
        let file: FileConfig = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new(""));
        file.resolve(base_dir, overrides)
    }
}

/// Parse a duration literal such as `500ms`, `30s`, `1.5m` or `2h`.
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let s = raw.trim();
    let invalid = || ConfigError::InvalidDuration(raw.to_owned());
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .ok_or_else(invalid)?;
    let (number, unit) = s.split_at(split);
    let value: f64 = number.parse().map_err(|_| invalid())?;
    let secs = match unit.trim() {
        "ms" => value / 1_000.0,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3_600.0,
        _ => return Err(invalid()),
    };
    Duration::try_from_secs_f64(secs).map_err(|_| invalid())
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    target: TargetSection,
    #[serde(default)]
    signing: SigningSection,
    payload: PayloadSection,
    #[serde(default)]
    checks: ChecksSection,
    scenario: ScenarioSection,
    #[serde(default)]
    thresholds: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    summary: SummarySection,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TargetSection {
    base_url: String,
    #[serde(default = "default_path")]
    path: String,
    #[serde(default = "default_timeout")]
    timeout: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SigningSection {
    secret_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PayloadSection {
    #[serde(default = "default_amount")]
    amount: u64,
    #[serde(default = "default_lang")]
    lang: String,
    data: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ChecksSection {
    #[serde(default = "default_expected_status")]
    expected_status: u16,
    #[serde(default = "default_max_latency")]
    max_latency: String,
}

impl Default for ChecksSection {
    fn default() -> Self {
        Self {
            expected_status: default_expected_status(),
            max_latency: default_max_latency(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScenarioSection {
    #[serde(default = "default_scenario_name")]
    name: String,
    #[serde(default)]
    start_rate: f64,
    #[serde(default = "default_time_unit")]
    time_unit: String,
    max_workers: Option<usize>,
    #[serde(default)]
    ramp: RampPolicy,
    #[serde(default = "default_grace_period")]
    grace_period: String,
    stages: Vec<StageSection>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StageSection {
    duration: String,
    target: f64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SummarySection {
    trend_stats: Option<Vec<String>>,
}

fn default_path() -> String {
    "/test/init".into()
}

fn default_timeout() -> String {
    "120s".into()
}

fn default_amount() -> u64 {
    1000
}

fn default_lang() -> String {
    "en".into()
}

fn default_expected_status() -> u16 {
    200
}

fn default_max_latency() -> String {
    "120ms".into()
}

fn default_scenario_name() -> String {
    "default".into()
}

fn default_time_unit() -> String {
    "1s".into()
}

fn default_grace_period() -> String {
    "30s".into()
}

impl FileConfig {
    fn resolve(self, base_dir: &Path, overrides: &Overrides) -> Result<RunConfig, ConfigError> {
        let base_url = overrides
            .base_url
            .clone()
            .unwrap_or(self.target.base_url);
        let endpoint = endpoint(&base_url, &self.target.path)?;

        let secret_key = overrides
            .secret_key
            .clone()
            .or(self.signing.secret_key)
            .filter(|k| !k.is_empty())
            .ok_or(ConfigError::MissingSecretKey)?;

        if self.payload.lang.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "payload.lang",
                reason: "must not be empty".into(),
            });
        }

        let stages = self
            .scenario
            .stages
            .iter()
            .map(|s| Ok(Stage::new(parse_duration(&s.duration)?, s.target)))
            .collect::<Result<Vec<_>, ConfigError>>()?;
        let schedule = ScheduleSpec {
            start_rate: self.scenario.start_rate,
            time_unit: parse_duration(&self.scenario.time_unit)?,
            max_workers: self.scenario.max_workers.unwrap_or_else(default_max_workers),
            stages,
            ramp: self.scenario.ramp,
        };
        schedule.validate()?;

        let thresholds = self
            .thresholds
            .iter()
            .map(|(metric, expressions)| {
                let kind = RunMetrics::kind_of(metric)
                    .ok_or_else(|| ConfigError::UnknownMetric(metric.clone()))?;
                ThresholdSpec::parse(metric.as_str(), kind, expressions)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let trend_stats = match self.summary.trend_stats {
            None => default_trend_stats(),
            Some(raw) => raw
                .iter()
                .map(|s| parse_trend_stat(s))
                .collect::<Result<Vec<_>, _>>()?,
        };

        Ok(RunConfig {
            endpoint,
            timeout: parse_duration(&self.target.timeout)?,
            secret_key,
            amount: self.payload.amount,
            lang: self.payload.lang,
            data_path: base_dir.join(self.payload.data),
            checks: Checks {
                expected_status: self.checks.expected_status,
                max_latency: parse_duration(&self.checks.max_latency)?,
            },
            scenario_name: self.scenario.name,
            schedule,
            grace_period: parse_duration(&self.scenario.grace_period)?,
            thresholds,
            trend_stats,
        })
    }
}

fn endpoint(base_url: &str, path: &str) -> Result<Url, ConfigError> {
    let raw = format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    let url = Url::parse(&raw).map_err(|e| ConfigError::InvalidUrl {
        url: raw.clone(),
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidUrl {
            url: raw,
            reason: format!("unsupported scheme `{}`", url.scheme()),
        });
    }
    Ok(url)
}

fn parse_trend_stat(raw: &str) -> Result<Statistic, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidValue {
        field: "summary.trend_stats",
        reason,
    };
    let stat: Statistic = raw.parse().map_err(invalid)?;
    if !stat.applies_to(MetricKind::Trend) {
        return Err(invalid(format!("`{stat}` is not a trend statistic")));
    }
    Ok(stat)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [target]
        base_url = "http://localhost:8080/"

        [signing]
        secret_key = "s3cret"

        [payload]
        data = "accounts.csv"

        [scenario]
        start_rate = 1
        stages = [{ duration = "10s", target = 10 }]
    "#;

    fn load(contents: &str) -> Result<RunConfig, ConfigError> {
        RunConfig::from_toml_str(contents, Path::new("/etc/barrage/run.toml"), &Overrides::default())
    }

    mod duration {
        use super::*;

        #[test]
        fn units() {
            assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
            assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
            assert_eq!(parse_duration("1.5m").unwrap(), Duration::from_secs(90));
            assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7_200));
            assert_eq!(parse_duration(" 10 s ").unwrap(), Duration::from_secs(10));
        }

        #[test]
        fn rejects_garbage() {
            for raw in ["", "10", "s", "10d", "-5s", "1.2.3s", "ten seconds"] {
                assert!(
                    matches!(parse_duration(raw), Err(ConfigError::InvalidDuration(_))),
                    "{raw:?}"
                );
            }
        }
    }

    #[test]
    fn minimal_file_gets_defaults() {
        let config = load(MINIMAL).unwrap();
        assert_eq!(config.endpoint.as_str(), "http://localhost:8080/test/init");
        assert_eq!(config.timeout, Duration::from_secs(120));
        assert_eq!(config.amount, 1000);
        assert_eq!(config.lang, "en");
        assert_eq!(config.data_path, PathBuf::from("/etc/barrage/accounts.csv"));
        assert_eq!(config.checks, Checks::default());
        assert_eq!(config.scenario_name, "default");
        assert_eq!(config.grace_period, Duration::from_secs(30));
        assert_eq!(config.schedule.ramp, RampPolicy::Linear);
        assert_eq!(config.schedule.time_unit, Duration::from_secs(1));
        assert_eq!(config.schedule.stages, vec![Stage::new(Duration::from_secs(10), 10.)]);
        assert_eq!(config.trend_stats, default_trend_stats());
        assert!(config.thresholds.is_empty());
    }

    #[test]
    fn overrides_win() {
        let overrides = Overrides {
            secret_key: Some("from-env".into()),
            base_url: Some("https://override.example".into()),
        };
        let config =
            RunConfig::from_toml_str(MINIMAL, Path::new("run.toml"), &overrides).unwrap();
        assert_eq!(config.secret_key, "from-env");
        assert_eq!(config.endpoint.as_str(), "https://override.example/test/init");
        assert_eq!(config.data_path, PathBuf::from("accounts.csv"));
    }

    #[test]
    fn missing_secret_key() {
        let contents = MINIMAL.replace(r#"secret_key = "s3cret""#, "");
        assert!(matches!(load(&contents), Err(ConfigError::MissingSecretKey)));
        let contents = MINIMAL.replace(r#"secret_key = "s3cret""#, r#"secret_key = """#);
        assert!(matches!(load(&contents), Err(ConfigError::MissingSecretKey)));
    }

    #[test]
    fn thresholds_are_parsed_at_load() {
        let contents = format!(
            "{MINIMAL}\n[thresholds]\nhttp_req_duration = [\"p(99) <= 120\"]\nerrors = [\"rate < 0.01\"]\n"
        );
        let config = load(&contents).unwrap();
        assert_eq!(config.thresholds.len(), 2);
        // BTreeMap order
        assert_eq!(config.thresholds[0].metric, "errors");
        assert_eq!(config.thresholds[1].expressions[0].to_string(), "p(99) <= 120");
    }

    #[test]
    fn unknown_threshold_metric() {
        let contents = format!("{MINIMAL}\n[thresholds]\nlatency = [\"p(99) < 1\"]\n");
        assert!(matches!(load(&contents), Err(ConfigError::UnknownMetric(m)) if m == "latency"));
    }

    #[test]
    fn mismatched_threshold_statistic() {
        let contents = format!("{MINIMAL}\n[thresholds]\nerrors = [\"p(99) < 1\"]\n");
        assert!(matches!(load(&contents), Err(ConfigError::InvalidThreshold { .. })));
    }

    #[test]
    fn invalid_schedule() {
        let contents = MINIMAL.replace(r#"duration = "10s""#, r#"duration = "0s""#);
        assert!(matches!(load(&contents), Err(ConfigError::InvalidSchedule(_))));
    }

    #[test]
    fn invalid_url() {
        let contents = MINIMAL.replace("http://localhost:8080/", "ftp://localhost");
        assert!(matches!(load(&contents), Err(ConfigError::InvalidUrl { .. })));
    }

    #[test]
    fn step_ramp_and_trend_stats() {
        let contents = MINIMAL.replace(
            "start_rate = 1",
            "start_rate = 1\nramp = \"step\"\nmax_workers = 7",
        ) + "\n[summary]\ntrend_stats = [\"avg\", \"p(95)\"]\n";
        let config = load(&contents).unwrap();
        assert_eq!(config.schedule.ramp, RampPolicy::Step);
        assert_eq!(config.schedule.max_workers, 7);
        assert_eq!(config.trend_stats, vec![Statistic::Avg, Statistic::Percentile(95.)]);

        let bad = MINIMAL.to_owned() + "\n[summary]\ntrend_stats = [\"rate\"]\n";
        assert!(matches!(load(&bad), Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let contents = MINIMAL.replace("[payload]", "[payload]\ncolour = \"blue\"");
        assert!(matches!(load(&contents), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn debug_redacts_secret() {
        let config = load(MINIMAL).unwrap();
        assert!(!format!("{config:?}").contains("s3cret"));
    }
}
