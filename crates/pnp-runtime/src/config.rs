use crate::{EngineError, RuntimeMode};

pub const RUNTIME_MODE_ENV: &str = "PNP_RUNTIME_MODE";
pub const REMOTE_WORKERS_ENV: &str = "PNP_REMOTE_WORKERS";
pub const VERIFY_DIGESTS_ENV: &str = "PNP_VERIFY_DIGESTS";
pub const DEFAULT_WORKERS: usize = 2;

/// Knobs for the evaluation runtime.
///
/// Hardened mode always verifies payload digests on the worker side;
/// strict mode verifies only when asked to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub mode: RuntimeMode,
    pub workers: usize,
    pub verify_digests: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mode: RuntimeMode::Strict,
            workers: DEFAULT_WORKERS,
            verify_digests: false,
        }
    }
}

impl RuntimeConfig {
    #[must_use]
    pub fn with_mode(mut self, mode: RuntimeMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Effective digest policy after the mode is taken into account.
    #[must_use]
    pub fn verifies_digests(&self) -> bool {
        self.verify_digests || self.mode == RuntimeMode::Hardened
    }

    pub fn from_env() -> Result<Self, EngineError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup; unset keys keep defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, EngineError> {
        let mut config = Self::default();
        if let Some(raw) = lookup(RUNTIME_MODE_ENV) {
            config.mode = RuntimeMode::from_token(&raw).ok_or_else(|| {
                EngineError::Config(format!("{RUNTIME_MODE_ENV}={raw} is not strict|hardened"))
            })?;
        }
        if let Some(raw) = lookup(REMOTE_WORKERS_ENV) {
            let workers = raw.trim().parse::<usize>().map_err(|err| {
                EngineError::Config(format!("{REMOTE_WORKERS_ENV}={raw}: {err}"))
            })?;
            if workers == 0 {
                return Err(EngineError::Config(format!(
                    "{REMOTE_WORKERS_ENV} must be at least 1"
                )));
            }
            config.workers = workers;
        }
        if let Some(raw) = lookup(VERIFY_DIGESTS_ENV) {
            config.verify_digests = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" | "" => false,
                _ => {
                    return Err(EngineError::Config(format!(
                        "{VERIFY_DIGESTS_ENV}={raw} is not a boolean"
                    )));
                }
            };
        }
        Ok(config)
    }
}
