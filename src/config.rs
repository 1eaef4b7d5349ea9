use anyhow::{anyhow, Result};

pub const DEFAULT_CACHE_CAPACITY: usize = 32;
pub const DEFAULT_LOG_FILTER: &str = "info";

pub const CAPACITY_ENV: &str = "PAGELOCK_CAPACITY";
pub const LOG_ENV: &str = "PAGELOCK_LOG";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub cache_capacity: usize,
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl Config {
    /// Defaults, overridden by the environment, overridden by `args`
    /// (program name already stripped).
    pub fn load<I>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        Self::load_with(args, |key| std::env::var(key).ok())
    }

    fn load_with<I, F>(args: I, env: F) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(capacity) = env(CAPACITY_ENV) {
            config.cache_capacity = parse_capacity(&capacity)?;
        }
        if let Some(filter) = env(LOG_ENV) {
            config.log_filter = filter;
        }

        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--capacity" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--capacity needs a value"))?;
                    config.cache_capacity = parse_capacity(&value)?;
                }
                "--log" => {
                    config.log_filter = args.next().ok_or_else(|| anyhow!("--log needs a value"))?;
                }
                _ => return Err(anyhow!("unknown argument: {}", arg)),
            }
        }
        Ok(config)
    }
}

fn parse_capacity(value: &str) -> Result<usize> {
    let capacity = value
        .parse::<usize>()
        .map_err(|_| anyhow!("invalid capacity: {}", value))?;
    if capacity == 0 {
        return Err(anyhow!("capacity must be at least 1"));
    }
    Ok(capacity)
}
