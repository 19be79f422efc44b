use std::env;
use std::path::{Path, PathBuf};

use clap::Parser;

use crate::jobs::layout::DataDirs;

/// External tool locations and command templates.
///
/// Templates may use `{py}`, `{dataset}`, `{out}` and `{gs}` placeholders;
/// when unset, the built-in gaussian-splatting / mini-splatting2 command
/// lines are used.
#[derive(Clone, Debug)]
pub struct ToolConfig {
    pub gaussian_dir: PathBuf,
    pub trainer_dir: PathBuf,
    pub python_exe: String,
    pub convert_cmd: Option<String>,
    pub train_cmd: Option<String>,
}

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    pub host: String,
    pub port: u16,

    /// Per-job data roots: uploads/, outputs/, logs/ under DATA_DIR.
    pub dirs: DataDirs,
    pub tools: ToolConfig,

    /// Maximum payload size for uploads (in bytes)
    pub max_payload_size: usize,

    /// Cap on pipelines running at the same time. Contention on the GPU
    /// below this cap is the caller's responsibility.
    pub max_concurrent_jobs: usize,

    /// Number of queue-consuming workers
    pub num_workers: u32,

    /// Directory for the server's own rotating log files
    pub server_log_dir: PathBuf,
}

/// Command-line overrides for the environment configuration.
#[derive(Parser, Debug)]
#[command(name = "recon-processor", about = "3D reconstruction job processor")]
pub struct Cli {
    #[arg(long)]
    pub host: Option<String>,
    #[arg(long)]
    pub port: Option<u16>,
    #[arg(long)]
    pub workers: Option<u32>,
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
}

fn env_path(key: &str, default: &str) -> PathBuf {
    env::var(key)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Everything has a default; the interesting knobs are:
    /// - DATA_DIR: root for uploads/outputs/logs (default ./data)
    /// - GAUSSIAN_SPLATTING_DIR, TRAINER_DIR, PYTHON_EXE: external tools
    /// - CONVERT_CMD, TRAIN_CMD: command templates overriding the built-ins
    /// - MAX_PAYLOAD_SIZE, MAX_CONCURRENT_JOBS, NUM_WORKERS
    pub fn from_env() -> Result<Self, String> {
        // Load .env file if it exists
        dotenv::dotenv().ok();

        let data_dir = env_path("DATA_DIR", "data");
        let port: u16 = env::var("PORT")
            .ok()
            .map(|s| s.parse().map_err(|_| format!("invalid PORT: {s}")))
            .transpose()?
            .unwrap_or(8080);

        Ok(Config {
            host: env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port,
            dirs: Self::dirs_under(&data_dir),
            tools: ToolConfig {
                gaussian_dir: env_path("GAUSSIAN_SPLATTING_DIR", "gaussian-splatting"),
                trainer_dir: env_path("TRAINER_DIR", "mini-splatting2"),
                python_exe: env::var("PYTHON_EXE").unwrap_or_else(|_| "python".to_string()),
                convert_cmd: env::var("CONVERT_CMD").ok(),
                train_cmd: env::var("TRAIN_CMD").ok(),
            },
            // Image sets run into the hundreds of megabytes
            max_payload_size: env_parse("MAX_PAYLOAD_SIZE", 512 * 1024 * 1024),
            max_concurrent_jobs: env_parse("MAX_CONCURRENT_JOBS", 1),
            num_workers: env_parse("NUM_WORKERS", 2),
            server_log_dir: env_path("SERVER_LOG_DIR", "server-logs"),
        })
    }

    fn dirs_under(data_dir: &Path) -> DataDirs {
        DataDirs {
            upload_dir: data_dir.join("uploads"),
            output_dir: data_dir.join("outputs"),
            log_dir: data_dir.join("logs"),
        }
    }

    pub fn apply_cli(mut self, cli: Cli) -> Self {
        if let Some(host) = cli.host {
            self.host = host;
        }
        if let Some(port) = cli.port {
            self.port = port;
        }
        if let Some(workers) = cli.workers {
            self.num_workers = workers;
        }
        if let Some(data_dir) = cli.data_dir {
            self.dirs = Self::dirs_under(&data_dir);
        }
        self
    }

    /// Create the data directories. Called once at startup.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dirs.upload_dir)?;
        std::fs::create_dir_all(&self.dirs.output_dir)?;
        std::fs::create_dir_all(&self.dirs.log_dir)?;
        std::fs::create_dir_all(&self.server_log_dir)?;
        Ok(())
    }
}
