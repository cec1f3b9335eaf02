// Runtime configuration
//
// A Configuration value threaded explicitly through the driver instead of
// process-wide globals. Every knob has a documented CADENCE_* environment
// name; Default covers tests and embedded use.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{CoreError, Result};

/// Environment-driven configuration for the execution core.
#[derive(Debug, Clone)]
pub struct Config {
    /// Default IANA timezone for schedules without one (`CADENCE_TIMEZONE`)
    pub timezone: String,
    /// End-to-end workflow timeout (`CADENCE_WORKFLOW_TIMEOUT_SECS`)
    pub workflow_timeout: Duration,
    /// Worker pool size of the job scheduler (`CADENCE_MAX_JOB_PARALLEL`)
    pub max_job_parallel: usize,
    /// Directories searched for workflow documents (`CADENCE_CONF_PATH`, `:`-separated)
    pub conf_paths: Vec<PathBuf>,
    /// Trace sink target (`CADENCE_TRACE_URL`), `console` or `file://<dir>`
    pub trace_url: String,
    /// Whether trace events are written at all (`CADENCE_TRACE_ENABLED`)
    pub trace_enabled: bool,
    /// Audit sink target (`CADENCE_AUDIT_URL`), `file://<dir>`
    pub audit_url: String,
    /// Whether the per-release audit record is written (`CADENCE_AUDIT_ENABLED`)
    pub audit_enabled: bool,
    /// Pause between stage retry attempts (`CADENCE_RETRY_DELAY_SECS`)
    pub retry_delay: Duration,
    /// SIGTERM-to-SIGKILL grace for subprocesses (`CADENCE_GRACE_PERIOD_SECS`)
    pub grace_period: Duration,
    /// Per-release timeout on the release scheduler (`CADENCE_RELEASE_TIMEOUT_SECS`)
    pub release_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
            workflow_timeout: Duration::from_secs(3600),
            max_job_parallel: 2,
            conf_paths: vec![PathBuf::from("./conf")],
            trace_url: "console".to_string(),
            trace_enabled: true,
            audit_url: "file://./audits".to_string(),
            audit_enabled: false,
            retry_delay: Duration::from_secs(5),
            grace_period: Duration::from_secs(5),
            release_timeout: Duration::from_secs(600),
        }
    }
}

fn env_secs(name: &str, default: Duration) -> Result<Duration> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| CoreError::config(format!("{name}={raw:?} is not a number of seconds"))),
        Err(_) => Ok(default),
    }
}

fn env_bool(name: &str, default: bool) -> Result<bool> {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(CoreError::config(format!("{name}={other:?} is not a boolean"))),
        },
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Read the configuration from the environment, falling back to the
    /// defaults above for anything unset.
    pub fn from_env() -> Result<Self> {
        let dft = Self::default();
        let conf_paths = match std::env::var("CADENCE_CONF_PATH") {
            Ok(raw) => raw.split(':').filter(|p| !p.is_empty()).map(PathBuf::from).collect(),
            Err(_) => dft.conf_paths.clone(),
        };
        let max_job_parallel = match std::env::var("CADENCE_MAX_JOB_PARALLEL") {
            Ok(raw) => raw.trim().parse::<usize>().map_err(|_| {
                CoreError::config(format!("CADENCE_MAX_JOB_PARALLEL={raw:?} is not a count"))
            })?,
            Err(_) => dft.max_job_parallel,
        };
        let cfg = Self {
            timezone: std::env::var("CADENCE_TIMEZONE").unwrap_or(dft.timezone),
            workflow_timeout: env_secs("CADENCE_WORKFLOW_TIMEOUT_SECS", dft.workflow_timeout)?,
            max_job_parallel,
            conf_paths,
            trace_url: std::env::var("CADENCE_TRACE_URL").unwrap_or(dft.trace_url),
            trace_enabled: env_bool("CADENCE_TRACE_ENABLED", dft.trace_enabled)?,
            audit_url: std::env::var("CADENCE_AUDIT_URL").unwrap_or(dft.audit_url),
            audit_enabled: env_bool("CADENCE_AUDIT_ENABLED", dft.audit_enabled)?,
            retry_delay: env_secs("CADENCE_RETRY_DELAY_SECS", dft.retry_delay)?,
            grace_period: env_secs("CADENCE_GRACE_PERIOD_SECS", dft.grace_period)?,
            release_timeout: env_secs("CADENCE_RELEASE_TIMEOUT_SECS", dft.release_timeout)?,
        };
        if cfg.max_job_parallel == 0 {
            return Err(CoreError::config("CADENCE_MAX_JOB_PARALLEL must be at least 1"));
        }
        cfg.timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|_| CoreError::config(format!("unknown timezone {:?}", cfg.timezone)))?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::default();
        assert_eq!(cfg.workflow_timeout, Duration::from_secs(3600));
        assert_eq!(cfg.max_job_parallel, 2);
        assert_eq!(cfg.retry_delay, Duration::from_secs(5));
        assert_eq!(cfg.grace_period, Duration::from_secs(5));
        assert_eq!(cfg.release_timeout, Duration::from_secs(600));
        assert_eq!(cfg.timezone, "UTC");
    }

    #[test]
    fn bool_parsing() {
        assert!(env_bool("CADENCE_TEST_UNSET_FLAG", true).unwrap());
        std::env::set_var("CADENCE_TEST_FLAG_A", "off");
        assert!(!env_bool("CADENCE_TEST_FLAG_A", true).unwrap());
        std::env::set_var("CADENCE_TEST_FLAG_B", "maybe");
        assert!(env_bool("CADENCE_TEST_FLAG_B", true).is_err());
    }
}
