use crate::error::{ApiError, ErrorCode, RelayResult};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE_NAME: &str = "ptyrelay.toml";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub exec: ExecConfig,
    pub pty: PtyConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    pub ws_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            ws_path: "/ws".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub idle_timeout_ms: u64,
    pub sweep_interval_ms: u64,
    pub max_buffer_chunks: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 24 * 60 * 60 * 1000,
            sweep_interval_ms: 60 * 60 * 1000,
            max_buffer_chunks: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecConfig {
    pub command_timeout_ms: u64,
    pub shell: String,
    pub initial_cwd: String,
    pub interactive_programs: Vec<String>,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: 30_000,
            shell: "/bin/sh".to_string(),
            initial_cwd: String::new(),
            interactive_programs: default_interactive_programs(),
        }
    }
}

fn default_interactive_programs() -> Vec<String> {
    [
        "droid", "vim", "vi", "nvim", "nano", "emacs", "less", "more", "man", "top", "htop",
        "btop",
    ]
    .iter()
    .map(|name| name.to_string())
    .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PtyConfig {
    pub cols: u16,
    pub rows: u16,
    pub term: String,
    pub extra_path: String,
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            cols: 80,
            rows: 24,
            term: "xterm-256color".to_string(),
            extra_path: "~/.local/bin".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

#[derive(Debug, Parser)]
#[command(author, version = crate::version::VERSION, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    Serve(ServeArgs),
    Config(ServeArgs),
}

#[derive(Debug, Parser, Clone, Default)]
pub struct ServeArgs {
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub listen: Option<String>,
    #[arg(long)]
    pub ws_path: Option<String>,
    #[arg(long)]
    pub command_timeout_ms: Option<u64>,
    #[arg(long)]
    pub cwd: Option<String>,
    #[arg(long)]
    pub log_level: Option<String>,
    #[arg(long)]
    pub log_format: Option<String>,
}

impl Config {
    pub fn load(args: &ServeArgs) -> RelayResult<Self> {
        let mut config = if let Some(path) = &args.config {
            Self::from_file(path)?
        } else if Path::new(CONFIG_FILE_NAME).exists() {
            Self::from_file(Path::new(CONFIG_FILE_NAME))?
        } else {
            Self::default()
        };

        config.apply_env();
        config.apply_cli(args);
        Ok(config)
    }

    pub fn from_file(path: &Path) -> RelayResult<Self> {
        let content = fs::read_to_string(path).map_err(|err| {
            ApiError::new(ErrorCode::IoError, "Failed to read config file")
                .with_details(err.to_string())
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> RelayResult<Self> {
        let parsed: Self = toml::from_str(content).map_err(|err| {
            ApiError::new(ErrorCode::InvalidArgument, "Failed to parse config file")
                .with_details(err.to_string())
        })?;
        Ok(parsed)
    }

    fn apply_env(&mut self) {
        if let Ok(value) = env::var("PTYRELAY_LISTEN") {
            self.server.listen = value;
        }
        if let Ok(value) = env::var("PTYRELAY_WS_PATH") {
            self.server.ws_path = value;
        }
        if let Ok(value) = env::var("PTYRELAY_LOG_LEVEL") {
            self.logging.level = value;
        }
        if let Ok(value) = env::var("PTYRELAY_LOG_FORMAT") {
            self.logging.format = value;
        }
        if let Ok(value) = env::var("PTYRELAY_COMMAND_TIMEOUT_MS")
            && let Ok(ms) = value.trim().parse::<u64>()
        {
            self.exec.command_timeout_ms = ms;
        }
    }

    fn apply_cli(&mut self, args: &ServeArgs) {
        if let Some(listen) = &args.listen {
            self.server.listen = listen.clone();
        }
        if let Some(path) = &args.ws_path {
            self.server.ws_path = path.clone();
        }
        if let Some(ms) = args.command_timeout_ms {
            self.exec.command_timeout_ms = ms;
        }
        if let Some(cwd) = &args.cwd {
            self.exec.initial_cwd = cwd.clone();
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }
        if let Some(format) = &args.log_format {
            self.logging.format = format.clone();
        }
    }
}
