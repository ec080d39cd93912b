use crate::config::ExecConfig;
use crate::error::{ApiError, ErrorCode, RelayResult};
use std::collections::HashSet;
use std::env;
use std::io::ErrorKind;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::time::timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Direct,
    Interactive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub cwd: String,
}

pub struct ProcessBridge {
    cwd: RwLock<PathBuf>,
    interactive: HashSet<String>,
    shell: String,
    timeout: Duration,
}

impl ProcessBridge {
    pub fn new(config: &ExecConfig) -> RelayResult<Self> {
        let cwd = if config.initial_cwd.trim().is_empty() {
            env::current_dir()?
        } else {
            let path = PathBuf::from(config.initial_cwd.trim());
            if !path.is_dir() {
                return Err(ApiError::new(
                    ErrorCode::InvalidArgument,
                    "Initial working directory is not a directory",
                )
                .with_details(path.display().to_string())
                .into());
            }
            path
        };
        Ok(Self {
            cwd: RwLock::new(cwd),
            interactive: config.interactive_programs.iter().cloned().collect(),
            shell: config.shell.clone(),
            timeout: Duration::from_millis(config.command_timeout_ms),
        })
    }

    pub fn current_dir(&self) -> PathBuf {
        self.cwd.read().expect("cwd lock poisoned").clone()
    }

    pub fn current_dir_display(&self) -> String {
        self.current_dir().display().to_string()
    }

    pub fn classify(&self, command_line: &str) -> CommandKind {
        let Some((program, _)) = split_command(command_line) else {
            return CommandKind::Direct;
        };
        let name = Path::new(&program)
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or(program);
        if self.interactive.contains(&name) {
            CommandKind::Interactive
        } else {
            CommandKind::Direct
        }
    }

    // The shared cwd is written only after the target validates.
    pub fn change_directory(&self, args: &[String]) -> RelayResult<PathBuf> {
        let base = self.current_dir();
        let target = resolve_target(&base, args.first().map(String::as_str))?;
        let metadata = std::fs::metadata(&target).map_err(|err| match err.kind() {
            ErrorKind::NotFound => ApiError::new(
                ErrorCode::DirectoryNotFound,
                format!("cd: no such file or directory: {}", target.display()),
            ),
            _ => ApiError::new(
                ErrorCode::IoError,
                format!("cd: cannot access {}", target.display()),
            )
            .with_details(err.to_string()),
        })?;
        if !metadata.is_dir() {
            return Err(ApiError::new(
                ErrorCode::NotADirectory,
                format!("cd: not a directory: {}", target.display()),
            )
            .into());
        }
        let resolved = std::fs::canonicalize(&target).map_err(|err| {
            ApiError::new(
                ErrorCode::IoError,
                format!("cd: cannot resolve {}", target.display()),
            )
            .with_details(err.to_string())
        })?;

        *self.cwd.write().expect("cwd lock poisoned") = resolved.clone();
        tracing::info!(cwd = %resolved.display(), "Changed working directory");
        Ok(resolved)
    }

    pub async fn execute(&self, command_line: &str) -> RelayResult<CommandOutput> {
        let line = command_line.trim();
        let Some((program, args)) = split_command(line) else {
            return Err(ApiError::new(ErrorCode::EmptyCommand, "Empty command").into());
        };

        if program == "cd" {
            let cwd = self.change_directory(&args)?;
            return Ok(CommandOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: Some(0),
                signal: None,
                cwd: cwd.display().to_string(),
            });
        }

        let cwd = self.current_dir();
        let mut cmd = if self.shell.is_empty() {
            let mut cmd = Command::new(&program);
            cmd.args(&args);
            cmd
        } else {
            let mut cmd = Command::new(&self.shell);
            cmd.arg("-c").arg(line);
            cmd
        };
        cmd.current_dir(&cwd)
            .env("FORCE_COLOR", "1")
            .env("TERM", "xterm-256color")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        tracing::info!(command = %line, cwd = %cwd.display(), "Executing command");
        let started = Instant::now();
        let child = cmd.spawn().map_err(|err| {
            tracing::error!(command = %line, error = %err, "Failed to spawn command");
            ApiError::new(ErrorCode::SpawnFailed, format!("Failed to start {program}"))
                .with_details(err.to_string())
        })?;
        let pgid = child.id();

        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                // The shell leads its own group; take every descendant down with it.
                if let Some(pgid) = pgid {
                    // SAFETY: killpg(2) has no memory-safety requirements.
                    unsafe {
                        libc::killpg(pgid as libc::pid_t, libc::SIGKILL);
                    }
                }
                tracing::warn!(
                    command = %line,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Command timed out"
                );
                return Err(ApiError::new(
                    ErrorCode::Timeout,
                    format!(
                        "Command timed out after {} ms",
                        self.timeout.as_millis()
                    ),
                )
                .into());
            }
        };

        let exit_code = output.status.code();
        let signal = output.status.signal();
        tracing::info!(
            command = %line,
            exit_code = ?exit_code,
            signal = ?signal,
            duration_ms = started.elapsed().as_millis() as u64,
            "Command finished"
        );
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code,
            signal,
            cwd: self.current_dir_display(),
        })
    }

    pub async fn complete_files(&self, prefix: &str) -> RelayResult<Vec<String>> {
        let cwd = self.current_dir();
        let needle = prefix.to_lowercase();
        let mut entries = tokio::fs::read_dir(&cwd).await.map_err(|err| {
            ApiError::new(ErrorCode::FilesystemError, "Failed to list directory")
                .with_details(err.to_string())
        })?;

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|err| {
            ApiError::new(ErrorCode::FilesystemError, "Failed to read directory entry")
                .with_details(err.to_string())
        })? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.to_lowercase().starts_with(&needle) {
                continue;
            }
            let is_dir = tokio::fs::metadata(entry.path())
                .await
                .map(|meta| meta.is_dir())
                .unwrap_or(false);
            if is_dir {
                files.push(format!("{name}/"));
            } else {
                files.push(name);
            }
        }
        files.sort();
        Ok(files)
    }
}

pub fn split_command(command_line: &str) -> Option<(String, Vec<String>)> {
    let mut parts = command_line.split_whitespace().map(str::to_string);
    let program = parts.next()?;
    Some((program, parts.collect()))
}

fn resolve_target(base: &Path, arg: Option<&str>) -> RelayResult<PathBuf> {
    match arg {
        None | Some("~") => home_dir(),
        Some(path) if path.starts_with("~/") => Ok(home_dir()?.join(&path[2..])),
        Some(path) => {
            let path = Path::new(path);
            if path.is_absolute() {
                Ok(path.to_path_buf())
            } else {
                Ok(base.join(path))
            }
        }
    }
}

fn home_dir() -> RelayResult<PathBuf> {
    dirs::home_dir().ok_or_else(|| {
        ApiError::new(ErrorCode::DirectoryNotFound, "cd: home directory is unknown").into()
    })
}
