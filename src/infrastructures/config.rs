use crate::application::use_cases::purge_old_runs::{NowPolicy, PurgeOldRunsUseCaseInput};
use crate::domain::external_apis::github::Repository;
use chrono::TimeDelta;
use std::fmt;
use std::num::NonZeroU32;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_API_URL: &str = "https://api.github.com";

const REPOSITORY_NAME: &str = "REPOSITORY_NAME";
const GITHUB_TOKEN: &str = "GITHUB_TOKEN";
const HOUR_COUNT: &str = "HOUR_COUNT";
const GITHUB_API_URL: &str = "GITHUB_API_URL";
const MAX_SWEEPS: &str = "MAX_SWEEPS";
const REQUEST_TIMEOUT_SECS: &str = "REQUEST_TIMEOUT_SECS";
const PER_PAGE: &str = "PER_PAGE";
const REFRESH_NOW_PER_SWEEP: &str = "REFRESH_NOW_PER_SWEEP";
const DRY_RUN: &str = "DRY_RUN";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),

    #[error("{0} is empty")]
    Empty(&'static str),

    #[error("{name} must be an integer, got {value:?}")]
    NotAnInteger { name: &'static str, value: String },

    #[error("{name} is out of range ({expected}), got {value}")]
    OutOfRange {
        name: &'static str,
        expected: &'static str,
        value: i64,
    },

    #[error("{name} must be a boolean, got {value:?}")]
    NotABoolean { name: &'static str, value: String },

    #[error("REPOSITORY_NAME must look like owner/name, got {0:?}")]
    InvalidRepository(String),
}

/// Everything the purge needs, resolved once at startup.
#[derive(Clone)]
pub struct PurgeConfig {
    pub repository: Repository,
    pub github_token: String,
    pub max_age: TimeDelta,
    pub api_base_url: String,
    pub max_sweeps: Option<NonZeroU32>,
    pub request_timeout: Option<Duration>,
    pub per_page: Option<u8>,
    pub now_policy: NowPolicy,
    pub dry_run: bool,
}

impl fmt::Debug for PurgeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PurgeConfig")
            .field("repository", &self.repository)
            .field("github_token", &"<redacted>")
            .field("max_age", &self.max_age)
            .field("api_base_url", &self.api_base_url)
            .field("max_sweeps", &self.max_sweeps)
            .field("request_timeout", &self.request_timeout)
            .field("per_page", &self.per_page)
            .field("now_policy", &self.now_policy)
            .field("dry_run", &self.dry_run)
            .finish()
    }
}

impl PurgeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &'static str| -> Result<String, ConfigError> {
            let value = lookup(name).ok_or(ConfigError::Missing(name))?;
            let value = value.trim().to_string();
            if value.is_empty() {
                return Err(ConfigError::Empty(name));
            }
            Ok(value)
        };
        let optional = |name: &'static str| -> Option<String> {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let repository = parse_repository(&required(REPOSITORY_NAME)?)?;
        let github_token = required(GITHUB_TOKEN)?;

        let hours = parse_integer(HOUR_COUNT, &required(HOUR_COUNT)?)?;
        if hours < 0 {
            return Err(ConfigError::OutOfRange {
                name: HOUR_COUNT,
                expected: "zero or more hours",
                value: hours,
            });
        }
        let max_age = TimeDelta::try_hours(hours).ok_or(ConfigError::OutOfRange {
            name: HOUR_COUNT,
            expected: "a representable duration",
            value: hours,
        })?;

        let api_base_url = optional(GITHUB_API_URL).unwrap_or_else(|| DEFAULT_API_URL.to_string());

        let max_sweeps = optional(MAX_SWEEPS)
            .map(|value| {
                let sweeps = parse_integer(MAX_SWEEPS, &value)?;
                u32::try_from(sweeps)
                    .ok()
                    .and_then(NonZeroU32::new)
                    .ok_or(ConfigError::OutOfRange {
                        name: MAX_SWEEPS,
                        expected: "a positive number of sweeps",
                        value: sweeps,
                    })
            })
            .transpose()?;

        let request_timeout = optional(REQUEST_TIMEOUT_SECS)
            .map(|value| {
                let secs = parse_integer(REQUEST_TIMEOUT_SECS, &value)?;
                u64::try_from(secs)
                    .ok()
                    .filter(|secs| *secs > 0)
                    .map(Duration::from_secs)
                    .ok_or(ConfigError::OutOfRange {
                        name: REQUEST_TIMEOUT_SECS,
                        expected: "a positive number of seconds",
                        value: secs,
                    })
            })
            .transpose()?;

        let per_page = optional(PER_PAGE)
            .map(|value| {
                let per_page = parse_integer(PER_PAGE, &value)?;
                u8::try_from(per_page)
                    .ok()
                    .filter(|per_page| (1..=100).contains(per_page))
                    .ok_or(ConfigError::OutOfRange {
                        name: PER_PAGE,
                        expected: "1 to 100",
                        value: per_page,
                    })
            })
            .transpose()?;

        let now_policy = if parse_flag(REFRESH_NOW_PER_SWEEP, optional(REFRESH_NOW_PER_SWEEP))? {
            NowPolicy::PerSweep
        } else {
            NowPolicy::CaptureOnce
        };
        let dry_run = parse_flag(DRY_RUN, optional(DRY_RUN))?;

        Ok(Self {
            repository,
            github_token,
            max_age,
            api_base_url,
            max_sweeps,
            request_timeout,
            per_page,
            now_policy,
            dry_run,
        })
    }

    pub fn use_case_input(&self) -> PurgeOldRunsUseCaseInput {
        PurgeOldRunsUseCaseInput {
            repository: self.repository.clone(),
            max_age: self.max_age,
            max_sweeps: self.max_sweeps,
            now_policy: self.now_policy,
            dry_run: self.dry_run,
        }
    }
}

fn parse_repository(value: &str) -> Result<Repository, ConfigError> {
    match value.split_once('/') {
        Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok(Repository {
                owner: owner.to_string(),
                name: name.to_string(),
            })
        }
        _ => Err(ConfigError::InvalidRepository(value.to_string())),
    }
}

fn parse_integer(name: &'static str, value: &str) -> Result<i64, ConfigError> {
    value.parse().map_err(|_| ConfigError::NotAnInteger {
        name,
        value: value.to_string(),
    })
}

fn parse_flag(name: &'static str, value: Option<String>) -> Result<bool, ConfigError> {
    let Some(value) = value else {
        return Ok(false);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::NotABoolean { name, value }),
    }
}
