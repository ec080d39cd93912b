use crate::config::PtyConfig;
use crate::error::{ApiError, ErrorCode, RelayResult};
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    Output(String),
    Exit {
        exit_code: u32,
        signal: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtyState {
    Idle,
    Running,
    Exited,
}

#[derive(Debug, Clone)]
pub struct PtyStartOptions {
    pub cols: u16,
    pub rows: u16,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
}

impl PtyStartOptions {
    pub fn from_config(config: &PtyConfig, cwd: &Path) -> Self {
        let mut env = HashMap::new();
        env.insert("TERM".to_string(), config.term.clone());
        env.insert("COLORTERM".to_string(), "truecolor".to_string());
        let path = std::env::var("PATH").unwrap_or_default();
        let extra = expand_home(&config.extra_path);
        let path = match (extra.is_empty(), path.is_empty()) {
            (true, _) => path,
            (false, true) => extra,
            (false, false) => format!("{extra}:{path}"),
        };
        env.insert("PATH".to_string(), path);
        Self {
            cols: config.cols,
            rows: config.rows,
            cwd: cwd.to_path_buf(),
            env,
        }
    }
}

enum Slot {
    Idle,
    Running(RunningPty),
    Exited,
}

struct RunningPty {
    generation: u64,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    master: Box<dyn MasterPty + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    pid: Option<u32>,
}

pub struct PtySession {
    id: String,
    slot: Arc<Mutex<Slot>>,
    generation: AtomicU64,
}

impl PtySession {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            slot: Arc::new(Mutex::new(Slot::Idle)),
            generation: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> PtyState {
        match &*self.lock_slot() {
            Slot::Idle => PtyState::Idle,
            Slot::Running(_) => PtyState::Running,
            Slot::Exited => PtyState::Exited,
        }
    }

    pub fn start(
        &self,
        program: &str,
        args: &[String],
        options: PtyStartOptions,
    ) -> RelayResult<mpsc::UnboundedReceiver<PtyEvent>> {
        let mut slot = self.lock_slot();
        if matches!(&*slot, Slot::Running(_)) {
            return Err(
                ApiError::new(ErrorCode::PtyAlreadyStarted, "PTY session already started").into(),
            );
        }

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: options.rows,
                cols: options.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| start_failed("Failed to allocate PTY", err))?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(args);
        cmd.cwd(&options.cwd);
        for (key, value) in &options.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|err| start_failed(&format!("Failed to spawn {program}"), err))?;
        // The reader only sees EOF once every slave handle is closed.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|err| start_failed("Failed to clone PTY reader", err))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|err| start_failed("Failed to take PTY writer", err))?;
        let killer = child.clone_killer();
        let pid = child.process_id();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let (tx, rx) = mpsc::unbounded_channel();
        let slot_handle = self.slot.clone();
        let session_id = self.id.clone();
        let spawn_result = thread::Builder::new()
            .name(format!("pty-{}", self.id))
            .spawn(move || {
                pump_output(&session_id, reader, &tx);
                let event = match child.wait() {
                    Ok(status) => PtyEvent::Exit {
                        exit_code: status.exit_code(),
                        signal: exit_signal(&status),
                    },
                    Err(err) => {
                        tracing::warn!(pty_id = %session_id, error = %err, "PTY wait failed");
                        PtyEvent::Exit {
                            exit_code: 1,
                            signal: None,
                        }
                    }
                };
                {
                    let mut slot = slot_handle.lock().expect("pty slot mutex poisoned");
                    if matches!(&*slot, Slot::Running(running) if running.generation == generation)
                    {
                        *slot = Slot::Exited;
                    }
                }
                if let PtyEvent::Exit { exit_code, .. } = &event {
                    tracing::info!(pty_id = %session_id, exit_code, "PTY session exited");
                }
                let _ = tx.send(event);
            });
        if let Err(err) = spawn_result {
            let mut killer = killer;
            let _ = killer.kill();
            return Err(start_failed("Failed to spawn PTY reader thread", err));
        }

        *slot = Slot::Running(RunningPty {
            generation,
            writer: Arc::new(Mutex::new(writer)),
            master: pair.master,
            killer,
            pid,
        });
        tracing::info!(
            pty_id = %self.id,
            program,
            args = %args.join(" "),
            cols = options.cols,
            rows = options.rows,
            "PTY session started"
        );
        Ok(rx)
    }

    pub async fn write(&self, data: &[u8]) -> RelayResult<()> {
        let writer = match &*self.lock_slot() {
            Slot::Running(running) => running.writer.clone(),
            _ => return Ok(()),
        };
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || -> RelayResult<()> {
            let mut writer = writer.lock().expect("pty writer mutex poisoned");
            writer
                .write_all(&data)
                .and_then(|_| writer.flush())
                .map_err(|err| {
                    ApiError::new(ErrorCode::IoError, "Failed to write to PTY")
                        .with_details(err.to_string())
                        .into()
                })
        })
        .await
        .map_err(|err| {
            ApiError::new(ErrorCode::IoError, "Failed to join PTY write")
                .with_details(err.to_string())
        })?
    }

    pub fn resize(&self, cols: u16, rows: u16) -> RelayResult<()> {
        let slot = self.lock_slot();
        let Slot::Running(running) = &*slot else {
            return Ok(());
        };
        running
            .master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| {
                ApiError::new(ErrorCode::IoError, "Failed to resize PTY")
                    .with_details(err.to_string())
            })?;
        tracing::debug!(pty_id = %self.id, cols, rows, "PTY resized");
        Ok(())
    }

    pub fn kill(&self, signal: Option<&str>) {
        let mut slot = self.lock_slot();
        if !matches!(&*slot, Slot::Running(_)) {
            return;
        }
        let Slot::Running(mut running) = std::mem::replace(&mut *slot, Slot::Exited) else {
            return;
        };
        drop(slot);

        let delivered = match (signal.and_then(parse_signal), running.pid) {
            (Some(signum), Some(pid)) => {
                // SAFETY: kill(2) has no memory-safety requirements.
                unsafe { libc::kill(pid as libc::pid_t, signum) == 0 }
            }
            _ => false,
        };
        if !delivered && let Err(err) = running.killer.kill() {
            tracing::debug!(pty_id = %self.id, error = %err, "PTY child already gone");
        }
        tracing::info!(pty_id = %self.id, signal = ?signal, "PTY session killed");
    }

    fn lock_slot(&self) -> std::sync::MutexGuard<'_, Slot> {
        self.slot.lock().expect("pty slot mutex poisoned")
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        self.kill(None);
    }
}

fn pump_output(
    session_id: &str,
    mut reader: Box<dyn Read + Send>,
    tx: &mpsc::UnboundedSender<PtyEvent>,
) {
    let mut buffer = [0u8; 4096];
    let mut decoder = Utf8Decoder::default();
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                let text = decoder.decode(&buffer[..n]);
                if !text.is_empty() {
                    let _ = tx.send(PtyEvent::Output(text));
                }
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                // Linux reports EIO once the child side closes.
                tracing::debug!(pty_id = %session_id, error = %err, "PTY read ended");
                break;
            }
        }
    }
    let tail = decoder.finish();
    if !tail.is_empty() {
        let _ = tx.send(PtyEvent::Output(tail));
    }
}

fn start_failed(message: &str, err: impl std::fmt::Display) -> crate::error::RelayError {
    tracing::error!(error = %err, "{message}");
    ApiError::new(ErrorCode::PtyStartFailed, message)
        .with_details(err.to_string())
        .into()
}

// portable-pty only exposes the terminating signal through Display ("Terminated by <name>").
fn exit_signal(status: &portable_pty::ExitStatus) -> Option<String> {
    if status.success() {
        return None;
    }
    status
        .to_string()
        .strip_prefix("Terminated by ")
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}

fn parse_signal(name: &str) -> Option<libc::c_int> {
    let upper = name.trim().to_ascii_uppercase();
    let bare = upper.strip_prefix("SIG").unwrap_or(&upper);
    match bare {
        "HUP" => Some(libc::SIGHUP),
        "INT" => Some(libc::SIGINT),
        "QUIT" => Some(libc::SIGQUIT),
        "KILL" => Some(libc::SIGKILL),
        "TERM" => Some(libc::SIGTERM),
        _ => None,
    }
}

fn expand_home(path: &str) -> String {
    match (path.strip_prefix('~'), dirs::home_dir()) {
        (Some(rest), Some(home)) => format!("{}{}", home.display(), rest),
        _ => path.to_string(),
    }
}

#[derive(Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match err.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{Duration, timeout};

    fn options() -> PtyStartOptions {
        let cwd = std::env::current_dir().expect("cwd");
        PtyStartOptions::from_config(&PtyConfig::default(), &cwd)
    }

    async fn collect_until_exit(
        rx: &mut mpsc::UnboundedReceiver<PtyEvent>,
    ) -> (String, u32, Vec<PtyEvent>) {
        let mut output = String::new();
        let mut events = Vec::new();
        loop {
            let event = timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("pty event timeout")
                .expect("channel closed before exit");
            events.push(event.clone());
            match event {
                PtyEvent::Output(text) => output.push_str(&text),
                PtyEvent::Exit { exit_code, .. } => return (output, exit_code, events),
            }
        }
    }

    #[test]
    fn kill_before_start_is_noop() {
        let session = PtySession::new("pty-test");
        session.kill(None);
        session.kill(Some("SIGTERM"));
        assert_eq!(session.state(), PtyState::Idle);
    }

    #[tokio::test]
    async fn write_and_resize_before_start_are_ignored() {
        let session = PtySession::new("pty-test");
        session.write(b"ignored").await.expect("write");
        session.resize(100, 40).expect("resize");
        assert_eq!(session.state(), PtyState::Idle);
    }

    #[tokio::test]
    async fn echo_output_then_single_exit() {
        let session = PtySession::new("pty-echo");
        let mut rx = session
            .start("echo", &["hello".to_string()], options())
            .expect("start");
        let (output, exit_code, events) = collect_until_exit(&mut rx).await;
        assert!(output.contains("hello"), "output was {output:?}");
        assert_eq!(exit_code, 0);
        assert!(matches!(events.last(), Some(PtyEvent::Exit { .. })));
        assert_eq!(session.state(), PtyState::Exited);
        // The sender is dropped after the exit event.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn start_twice_fails_while_running() {
        let session = PtySession::new("pty-sleep");
        let mut rx = session
            .start("sleep", &["5".to_string()], options())
            .expect("start");
        let err = session
            .start("sleep", &["5".to_string()], options())
            .expect_err("second start");
        assert_eq!(err.code(), ErrorCode::PtyAlreadyStarted);

        session.kill(None);
        assert_eq!(session.state(), PtyState::Exited);
        let (_, _, events) = collect_until_exit(&mut rx).await;
        let exits = events
            .iter()
            .filter(|event| matches!(event, PtyEvent::Exit { .. }))
            .count();
        assert_eq!(exits, 1);
        session.kill(None);
    }

    #[tokio::test]
    async fn input_is_echoed_back() {
        let session = PtySession::new("pty-cat");
        let mut rx = session.start("cat", &[], options()).expect("start");
        session.write(b"ping\n").await.expect("write");
        session.resize(100, 30).expect("resize");

        let mut seen = String::new();
        while !seen.contains("ping") {
            match timeout(Duration::from_secs(10), rx.recv()).await {
                Ok(Some(PtyEvent::Output(text))) => seen.push_str(&text),
                other => panic!("unexpected event: {other:?}"),
            }
        }
        session.kill(Some("SIGTERM"));
        let (_, _, _) = collect_until_exit(&mut rx).await;
    }

    #[test]
    fn missing_program_leaves_session_idle() {
        let session = PtySession::new("pty-missing");
        let err = session
            .start("definitely-not-a-real-program-xyz", &[], options())
            .expect_err("start should fail");
        assert_eq!(err.code(), ErrorCode::PtyStartFailed);
        assert_eq!(session.state(), PtyState::Idle);
    }

    #[test]
    fn start_options_carry_terminal_env() {
        let config = PtyConfig {
            extra_path: "/opt/extra/bin".to_string(),
            ..PtyConfig::default()
        };
        let options = PtyStartOptions::from_config(&config, Path::new("/tmp"));
        assert_eq!(options.env.get("TERM").map(String::as_str), Some("xterm-256color"));
        assert_eq!(
            options.env.get("COLORTERM").map(String::as_str),
            Some("truecolor")
        );
        assert!(options.env["PATH"].starts_with("/opt/extra/bin"));
        assert_eq!((options.cols, options.rows), (80, 24));
    }

    #[tokio::test]
    async fn sigterm_kill_reports_exit_signal() {
        let session = PtySession::new("pty-term");
        let mut rx = session
            .start("sleep", &["30".to_string()], options())
            .expect("start");
        session.kill(Some("SIGTERM"));
        let (_, _, events) = collect_until_exit(&mut rx).await;
        match events.last() {
            Some(PtyEvent::Exit { signal, .. }) => {
                assert!(signal.is_some(), "expected a signal, got {events:?}")
            }
            other => panic!("expected exit event, got {other:?}"),
        }
    }

    #[test]
    fn exit_signal_is_absent_for_normal_exits() {
        assert_eq!(exit_signal(&portable_pty::ExitStatus::with_exit_code(0)), None);
        assert_eq!(exit_signal(&portable_pty::ExitStatus::with_exit_code(2)), None);
    }

    #[test]
    fn parse_signal_accepts_prefixed_names() {
        assert_eq!(parse_signal("SIGTERM"), Some(libc::SIGTERM));
        assert_eq!(parse_signal("int"), Some(libc::SIGINT));
        assert_eq!(parse_signal("SIGWHATEVER"), None);
    }

    #[test]
    fn decoder_joins_split_multibyte_chars() {
        let mut decoder = Utf8Decoder::default();
        let bytes = "é!".as_bytes();
        assert_eq!(decoder.decode(&bytes[..1]), "");
        assert_eq!(decoder.decode(&bytes[1..]), "é!");
        assert_eq!(decoder.decode(&[0xff, b'a']), "\u{fffd}a");
        assert_eq!(decoder.decode(&[0xc3]), "");
        assert_eq!(decoder.finish(), "\u{fffd}");
    }
}
