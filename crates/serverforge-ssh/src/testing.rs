//! In-memory SSH fakes for tests
//!
//! A [`FakeHost`] plays the remote machine: it can refuse connections,
//! require a specific key, replay scripted output and record every command
//! and upload. [`FakeConnector`] hands out [`FakeShell`] sessions against it.

use crate::connector::{SshConnector, SshTarget};
use crate::error::{Result, SshError};
use crate::keygen::public_key_for;
use crate::session::RemoteShell;
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Async callback run while scripted output is streaming
pub type StreamHook = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

#[derive(Default)]
struct HostState {
    refuse_remaining: u32,
    authorized_key: Option<String>,
    stream_lines: Vec<String>,
    stream_exit: i32,
    stream_hook: Option<(usize, StreamHook)>,
    failing_commands: Vec<(String, i32)>,
    command_outputs: Vec<(String, String)>,
    connects: Vec<(Instant, String)>,
    commands: Vec<(String, String)>,
    uploads: Vec<(String, String)>,
    open_sessions: usize,
    disconnects: usize,
}

/// A scripted remote machine
#[derive(Clone, Default)]
pub struct FakeHost {
    state: Arc<Mutex<HostState>>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Refuse the next `count` connection attempts
    pub fn refuse_connections(&self, count: u32) {
        self.state().refuse_remaining = count;
    }

    /// Only accept sessions whose private key matches this public key
    pub fn authorize_key(&self, public_key: impl Into<String>) {
        self.state().authorized_key = Some(public_key.into());
    }

    /// Output replayed by `exec_streaming`
    pub fn script_output<I, S>(&self, lines: I, exit_code: i32)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.state();
        state.stream_lines = lines.into_iter().map(Into::into).collect();
        state.stream_exit = exit_code;
    }

    /// Run `hook` right after streamed line `index` was delivered
    pub fn on_stream_line(&self, index: usize, hook: StreamHook) {
        self.state().stream_hook = Some((index, hook));
    }

    /// Any command containing `pattern` exits with `exit_code`
    pub fn fail_command(&self, pattern: impl Into<String>, exit_code: i32) {
        self.state().failing_commands.push((pattern.into(), exit_code));
    }

    /// Any command containing `pattern` prints `stdout`
    pub fn command_output(&self, pattern: impl Into<String>, stdout: impl Into<String>) {
        self.state()
            .command_outputs
            .push((pattern.into(), stdout.into()));
    }

    pub fn connect_times(&self) -> Vec<Instant> {
        self.state().connects.iter().map(|(t, _)| *t).collect()
    }

    pub fn connect_usernames(&self) -> Vec<String> {
        self.state().connects.iter().map(|(_, u)| u.clone()).collect()
    }

    /// `(username, command)` pairs in execution order
    pub fn commands(&self) -> Vec<(String, String)> {
        self.state().commands.clone()
    }

    /// `(path, content)` pairs in upload order
    pub fn uploads(&self) -> Vec<(String, String)> {
        self.state().uploads.clone()
    }

    pub fn open_sessions(&self) -> usize {
        self.state().open_sessions
    }

    /// Explicit `disconnect()` calls
    pub fn disconnects(&self) -> usize {
        self.state().disconnects
    }

    fn command_exit(&self, command: &str) -> i32 {
        self.state()
            .failing_commands
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, code)| *code)
            .unwrap_or(0)
    }

    fn command_stdout(&self, command: &str) -> Option<String> {
        self.state()
            .command_outputs
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, stdout)| stdout.clone())
    }
}

/// Connector handing out sessions on a [`FakeHost`]
#[derive(Clone)]
pub struct FakeConnector {
    host: FakeHost,
}

impl FakeConnector {
    pub fn new(host: FakeHost) -> Self {
        Self { host }
    }
}

#[async_trait]
impl SshConnector for FakeConnector {
    async fn connect(&self, target: &SshTarget, username: &str) -> Result<Box<dyn RemoteShell>> {
        let mut state = self.host.state();
        state.connects.push((Instant::now(), username.to_string()));

        if state.refuse_remaining > 0 {
            state.refuse_remaining -= 1;
            return Err(SshError::Connection {
                host: target.host.clone(),
                port: target.port,
                message: "Connection refused".to_string(),
            });
        }

        if let Some(authorized) = &state.authorized_key {
            let offered = public_key_for(&target.private_key).ok();
            if offered.as_deref() != Some(authorized.as_str()) {
                return Err(SshError::Authentication {
                    host: target.host.clone(),
                    username: username.to_string(),
                    message: "key not authorized".to_string(),
                });
            }
        }

        state.open_sessions += 1;
        Ok(Box::new(FakeShell {
            host: self.host.clone(),
            address: target.host.clone(),
            username: username.to_string(),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Session on a [`FakeHost`]
pub struct FakeShell {
    host: FakeHost,
    address: String,
    username: String,
    closed: AtomicBool,
}

impl FakeShell {
    fn record(&self, command: &str) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SshError::Closed);
        }
        self.host
            .state()
            .commands
            .push((self.username.clone(), command.to_string()));
        Ok(())
    }

    fn release(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let mut state = self.host.state();
        state.open_sessions = state.open_sessions.saturating_sub(1);
        true
    }
}

#[async_trait]
impl RemoteShell for FakeShell {
    fn username(&self) -> &str {
        &self.username
    }

    fn host(&self) -> &str {
        &self.address
    }

    async fn exec(&self, command: &str, _timeout: Duration) -> Result<String> {
        self.record(command)?;
        let exit_code = self.host.command_exit(command);
        if exit_code != 0 {
            return Err(SshError::Command {
                command: command.to_string(),
                exit_code,
                stdout: String::new(),
                stderr: "command failed".to_string(),
            });
        }
        if let Some(stdout) = self.host.command_stdout(command) {
            return Ok(stdout);
        }
        if command.starts_with("echo ") {
            let echoed = command.trim_start_matches("echo ").trim_matches('"');
            return Ok(format!("{}\n", echoed));
        }
        Ok(String::new())
    }

    async fn exec_streaming(
        &self,
        command: &str,
        _timeout: Duration,
        on_line: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<i32> {
        self.record(command)?;
        let (lines, exit_code, hook) = {
            let state = self.host.state();
            (
                state.stream_lines.clone(),
                state.stream_exit,
                state.stream_hook.clone(),
            )
        };

        for (index, line) in lines.iter().enumerate() {
            on_line(line.as_str());
            if let Some((at, hook)) = &hook {
                if *at == index {
                    hook().await;
                }
            }
        }
        Ok(exit_code)
    }

    async fn upload(&self, content: &[u8], remote_path: &str) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SshError::Closed);
        }
        self.host.state().uploads.push((
            remote_path.to_string(),
            String::from_utf8_lossy(content).into_owned(),
        ));
        Ok(())
    }

    async fn disconnect(&self) {
        if self.release() {
            self.host.state().disconnects += 1;
        }
    }
}

impl Drop for FakeShell {
    fn drop(&mut self) {
        self.release();
    }
}
