use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// What to do with a frame the codec could not decode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedFramePolicy {
    /// Reply with an `AR` ack and keep reading
    Acknowledge,
    /// Discard silently and keep reading
    Drop,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub mllp_address: String,
    pub pager_address: String,
    pub history_path: PathBuf,
    pub db_path: PathBuf,
    pub model_path: PathBuf,
    pub model_no_demographics_path: PathBuf,
    pub pager_max_attempts: u32,
    pub pager_retry_delay: Duration,
    pub reconnect_max_retries: u32,
    pub reconnect_initial_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub malformed_frame_policy: MalformedFramePolicy,
    pub connect_timeout: Duration,
    pub ack_write_timeout: Duration,
    pub pager_request_timeout: Duration,
}

#[derive(Debug)]
pub enum ConfigError {
    MissingVariable(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingVariable(var) => write!(f, "Missing value for: {}", var),
            ConfigError::InvalidValue(msg) => write!(f, "Invalid configuration value: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl RuntimeConfig {
    /// Environment first, then `--history` / `--persistent_path` overrides
    pub fn from_env() -> Result<Self, ConfigError> {
        let args: Vec<String> = env::args().skip(1).collect();
        Self::from_vars(|key| env::var(key).ok(), &args)
    }

    pub fn from_vars<F>(lookup: F, args: &[String]) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mllp_address = lookup("MLLP_ADDRESS").unwrap_or_else(|| "localhost:8440".to_string());
        validate_address("MLLP_ADDRESS", &mllp_address)?;

        let pager_address =
            lookup("PAGER_ADDRESS").unwrap_or_else(|| "localhost:8441".to_string());
        validate_address("PAGER_ADDRESS", &pager_address)?;

        let overrides = parse_path_args(args)?;

        let history_path = overrides.history.unwrap_or_else(|| {
            lookup("AKI_HISTORY_PATH")
                .unwrap_or_else(|| "data/history.csv".to_string())
                .into()
        });
        let db_path = overrides.persistent_path.unwrap_or_else(|| {
            lookup("AKI_DB_PATH")
                .unwrap_or_else(|| "state/patient_data.db".to_string())
                .into()
        });

        let model_path: PathBuf = lookup("AKI_MODEL_PATH")
            .unwrap_or_else(|| "model/model.json".to_string())
            .into();
        let model_no_demographics_path: PathBuf = lookup("AKI_MODEL_NO_DEMOGRAPHICS_PATH")
            .unwrap_or_else(|| "model/model_nodemographics.json".to_string())
            .into();

        let pager_max_attempts = parse_number(&lookup, "PAGER_MAX_ATTEMPTS", 30u32)?;
        if pager_max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "PAGER_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        let pager_retry_delay_ms = parse_number(&lookup, "PAGER_RETRY_DELAY_MS", 2000u64)?;
        let reconnect_max_retries = parse_number(&lookup, "RECONNECT_MAX_RETRIES", 30u32)?;

        let policy_str = lookup("MALFORMED_FRAME_POLICY").unwrap_or_else(|| "ack".to_string());
        let malformed_frame_policy = match policy_str.to_lowercase().as_str() {
            "ack" | "acknowledge" => MalformedFramePolicy::Acknowledge,
            "drop" => MalformedFramePolicy::Drop,
            other => {
                return Err(ConfigError::InvalidValue(format!(
                    "MALFORMED_FRAME_POLICY must be 'ack' or 'drop', got '{}'",
                    other
                )))
            }
        };

        Ok(Self {
            mllp_address,
            pager_address,
            history_path,
            db_path,
            model_path,
            model_no_demographics_path,
            pager_max_attempts,
            pager_retry_delay: Duration::from_millis(pager_retry_delay_ms),
            reconnect_max_retries,
            reconnect_initial_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(10),
            malformed_frame_policy,
            connect_timeout: Duration::from_secs(5),
            ack_write_timeout: Duration::from_secs(5),
            pager_request_timeout: Duration::from_secs(2),
        })
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct PathOverrides {
    pub history: Option<PathBuf>,
    pub persistent_path: Option<PathBuf>,
}

/// Accepts `--flag value` and `--flag=value`; unknown arguments are ignored
pub fn parse_path_args(args: &[String]) -> Result<PathOverrides, ConfigError> {
    let mut overrides = PathOverrides::default();
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) => (flag, Some(value.to_string())),
            None => (arg.as_str(), None),
        };
        let slot = match flag {
            "--history" => &mut overrides.history,
            "--persistent_path" => &mut overrides.persistent_path,
            _ => continue,
        };
        let value = match inline {
            Some(v) => v,
            None => iter
                .next()
                .cloned()
                .ok_or_else(|| ConfigError::MissingVariable(flag.to_string()))?,
        };
        *slot = Some(PathBuf::from(value));
    }

    Ok(overrides)
}

fn parse_number<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue(format!("{} is not a number: '{}'", key, raw))),
    }
}

/// `host:port` with a non-empty host and a numeric port
fn validate_address(key: &str, value: &str) -> Result<(), ConfigError> {
    let valid = match value.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    };
    if !valid {
        return Err(ConfigError::InvalidValue(format!(
            "{} must be host:port, got '{}'",
            key, value
        )));
    }
    Ok(())
}
