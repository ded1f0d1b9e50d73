use anyhow::{Context, Result};
use clap::Parser;
use std::{env, path::PathBuf, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub database_url: String,
    pub page_size: usize,
    pub max_concurrent_jobs: usize,
    pub step_timeout: Duration,
    pub drive_base_url: String,
    pub token_url: String,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Google Sheets access verification API")]
pub struct Args {
    /// Host to bind to (overrides SHEETS_VERIFY_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides SHEETS_VERIFY_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory holding the credential and job artifacts (overrides SHEETS_VERIFY_DATA_DIR)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Database URL (overrides SHEETS_VERIFY_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Files requested per Drive listing (overrides SHEETS_VERIFY_PAGE_SIZE)
    #[arg(long)]
    pub page_size: Option<usize>,

    /// Verification jobs allowed to run at once (overrides SHEETS_VERIFY_MAX_CONCURRENT_JOBS)
    #[arg(long)]
    pub max_concurrent_jobs: Option<usize>,

    /// Deadline in seconds for each Drive call (overrides SHEETS_VERIFY_STEP_TIMEOUT_SECS)
    #[arg(long)]
    pub step_timeout_secs: Option<u64>,

    /// Drive v3 API root (overrides SHEETS_VERIFY_DRIVE_BASE_URL)
    #[arg(long)]
    pub drive_base_url: Option<String>,

    /// OAuth token endpoint for keys without `token_uri` (overrides SHEETS_VERIFY_TOKEN_URL)
    #[arg(long)]
    pub token_url: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::merge(args, |key| env::var(key))?;
        Ok((cfg, migrate))
    }

    /// Merge CLI overrides over `lookup` (the environment) over defaults.
    fn merge(
        args: Args,
        lookup: impl Fn(&str) -> Result<String, env::VarError>,
    ) -> Result<Self> {
        let string_var = |key: &str, default: &str| -> Result<String> {
            match lookup(key) {
                Ok(value) => Ok(value),
                Err(env::VarError::NotPresent) => Ok(default.to_string()),
                Err(err) => Err(err).with_context(|| format!("reading {}", key)),
            }
        };

        let host = match args.host {
            Some(host) => host,
            None => string_var("SHEETS_VERIFY_HOST", "0.0.0.0")?,
        };
        let port = match args.port {
            Some(port) => port,
            None => parsed_var(&lookup, "SHEETS_VERIFY_PORT", 5000)?,
        };
        let data_dir = match args.data_dir {
            Some(dir) => dir,
            None => PathBuf::from(string_var("SHEETS_VERIFY_DATA_DIR", "./data")?),
        };
        let database_url = match args.database_url {
            Some(url) => url,
            None => string_var("SHEETS_VERIFY_DATABASE_URL", "sqlite://./data/jobs.db")?,
        };
        let page_size = match args.page_size {
            Some(size) => size,
            None => parsed_var(&lookup, "SHEETS_VERIFY_PAGE_SIZE", 100)?,
        };
        let max_concurrent_jobs = match args.max_concurrent_jobs {
            Some(n) => n,
            None => parsed_var(&lookup, "SHEETS_VERIFY_MAX_CONCURRENT_JOBS", 4)?,
        };
        let step_timeout_secs = match args.step_timeout_secs {
            Some(secs) => secs,
            None => parsed_var(&lookup, "SHEETS_VERIFY_STEP_TIMEOUT_SECS", 120)?,
        };
        let drive_base_url = match args.drive_base_url {
            Some(url) => url,
            None => string_var(
                "SHEETS_VERIFY_DRIVE_BASE_URL",
                "https://www.googleapis.com/drive/v3",
            )?,
        };
        let token_url = match args.token_url {
            Some(url) => url,
            None => string_var(
                "SHEETS_VERIFY_TOKEN_URL",
                "https://oauth2.googleapis.com/token",
            )?,
        };

        Ok(Self {
            host,
            port,
            data_dir,
            database_url,
            page_size: page_size.clamp(1, 1000),
            max_concurrent_jobs: max_concurrent_jobs.max(1),
            step_timeout: Duration::from_secs(step_timeout_secs.max(1)),
            drive_base_url,
            token_url,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn credential_path(&self) -> PathBuf {
        self.data_dir.join("service_account.json")
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.data_dir.join("jobs")
    }
}

fn parsed_var<T>(
    lookup: &impl Fn(&str) -> Result<String, env::VarError>,
    key: &str,
    default: T,
) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Result<String, env::VarError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned().ok_or(env::VarError::NotPresent)
    }

    fn no_args() -> Args {
        Args::parse_from(["sheets-verify"])
    }

    #[test]
    fn defaults_apply_without_env_or_args() {
        let cfg = AppConfig::merge(no_args(), lookup(&[])).unwrap();
        assert_eq!(cfg.addr(), "0.0.0.0:5000");
        assert_eq!(cfg.page_size, 100);
        assert_eq!(cfg.max_concurrent_jobs, 4);
        assert_eq!(cfg.step_timeout, Duration::from_secs(120));
        assert_eq!(cfg.credential_path(), PathBuf::from("./data/service_account.json"));
    }

    #[test]
    fn args_override_env() {
        let args = Args::parse_from(["sheets-verify", "--port", "8080", "--page-size", "5000"]);
        let cfg = AppConfig::merge(
            args,
            lookup(&[("SHEETS_VERIFY_PORT", "9000"), ("SHEETS_VERIFY_HOST", "127.0.0.1")]),
        )
        .unwrap();
        assert_eq!(cfg.addr(), "127.0.0.1:8080");
        assert_eq!(cfg.page_size, 1000);
    }

    #[test]
    fn malformed_numbers_are_reported() {
        let err = AppConfig::merge(no_args(), lookup(&[("SHEETS_VERIFY_PORT", "http")]))
            .unwrap_err();
        assert!(err.to_string().contains("SHEETS_VERIFY_PORT"));
    }
}
