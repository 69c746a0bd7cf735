//! Authenticated remote shell sessions
//!
//! [`RemoteShell`] is the seam the control plane programs against;
//! [`SshSession`] is the libssh2-backed implementation. libssh2 is blocking,
//! so every call runs on the blocking pool via `spawn_blocking`.

use crate::error::{Result, SshError};
use async_trait::async_trait;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::connector::SshTarget;

/// Timeout for short probe-style commands
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// libssh2 `LIBSSH2_ERROR_TIMEOUT`
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;

/// Sleep between polls while a command has produced no new output
const READ_POLL: Duration = Duration::from_millis(10);

/// One authenticated remote-shell session
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// The identity this session is authenticated as
    fn username(&self) -> &str;

    fn host(&self) -> &str;

    /// Run a command and return its stdout.
    ///
    /// A non-zero exit status is an [`SshError::Command`].
    async fn exec(&self, command: &str, timeout: Duration) -> Result<String>;

    /// Run a command, calling `on_line` once per output line in order.
    ///
    /// Stdout and stderr are merged. The exit status is returned rather than
    /// raised, so callers must check it.
    async fn exec_streaming(
        &self,
        command: &str,
        timeout: Duration,
        on_line: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<i32>;

    /// Write `content` to `remote_path` over the file-transfer channel
    async fn upload(&self, content: &[u8], remote_path: &str) -> Result<()>;

    /// Close the session. Safe to call more than once.
    async fn disconnect(&self);

    /// Run a command with privilege escalation
    async fn sudo(&self, command: &str, timeout: Duration) -> Result<String> {
        if self.username() == "root" {
            self.exec(command, timeout).await
        } else {
            self.exec(&format!("sudo {}", command), timeout).await
        }
    }

    async fn file_exists(&self, path: &str) -> bool {
        self.exec(&format!("test -f {}", shell_quote(path)), PROBE_TIMEOUT)
            .await
            .is_ok()
    }

    async fn directory_exists(&self, path: &str) -> bool {
        self.exec(&format!("test -d {}", shell_quote(path)), PROBE_TIMEOUT)
            .await
            .is_ok()
    }
}

/// Single-quote a value for POSIX shells
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

struct SessionInner {
    session: ssh2::Session,
    sftp: Mutex<Option<ssh2::Sftp>>,
    /// Held while a channel is in use; exec flips the session to non-blocking
    busy: Mutex<()>,
    closed: AtomicBool,
}

impl SessionInner {
    fn exclusive(&self) -> MutexGuard<'_, ()> {
        match self.busy.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SshError::Closed);
        }
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut sftp) = self.sftp.lock() {
            sftp.take();
        }
        if let Err(e) = self
            .session
            .disconnect(None, "serverforge session closed", None)
        {
            debug!(error = %e, "SSH disconnect reported an error");
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.close();
    }
}

/// libssh2-backed [`RemoteShell`]
///
/// The session closes when [`RemoteShell::disconnect`] is called or when the
/// last handle is dropped, whichever comes first.
pub struct SshSession {
    inner: Arc<SessionInner>,
    host: String,
    username: String,
}

impl SshSession {
    /// Open and authenticate a session with the target's private key
    pub async fn connect(
        target: &SshTarget,
        username: &str,
        connect_timeout: Duration,
        keepalive_secs: u32,
    ) -> Result<Self> {
        let host = target.host.clone();
        let target = target.clone();
        let user = username.to_string();
        let session = tokio::task::spawn_blocking(move || {
            open_blocking(&target, &user, connect_timeout, keepalive_secs)
        })
        .await??;

        debug!(host = %host, username, "SSH session opened");
        Ok(Self {
            inner: Arc::new(SessionInner {
                session,
                sftp: Mutex::new(None),
                busy: Mutex::new(()),
                closed: AtomicBool::new(false),
            }),
            host,
            username: username.to_string(),
        })
    }
}

#[async_trait]
impl RemoteShell for SshSession {
    fn username(&self) -> &str {
        &self.username
    }

    fn host(&self) -> &str {
        &self.host
    }

    async fn exec(&self, command: &str, timeout: Duration) -> Result<String> {
        let inner = self.inner.clone();
        let cmd = command.to_string();
        let task = tokio::task::spawn_blocking(move || exec_blocking(&inner, &cmd, timeout));

        let (exit_code, stdout, stderr) = tokio::time::timeout(timeout, task)
            .await
            .map_err(|_| SshError::Timeout(timeout))???;

        if exit_code != 0 {
            return Err(SshError::Command {
                command: command.to_string(),
                exit_code,
                stdout,
                stderr,
            });
        }
        Ok(stdout)
    }

    async fn exec_streaming(
        &self,
        command: &str,
        timeout: Duration,
        on_line: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<i32> {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let inner = self.inner.clone();
        let cmd = command.to_string();
        let task =
            tokio::task::spawn_blocking(move || stream_blocking(&inner, &cmd, timeout, tx));

        let drive = async {
            while let Some(line) = rx.recv().await {
                on_line(&line);
            }
            task.await?
        };

        tokio::time::timeout(timeout, drive)
            .await
            .map_err(|_| SshError::Timeout(timeout))?
    }

    async fn upload(&self, content: &[u8], remote_path: &str) -> Result<()> {
        let inner = self.inner.clone();
        let data = content.to_vec();
        let path = remote_path.to_string();
        tokio::task::spawn_blocking(move || upload_blocking(&inner, &data, &path)).await?
    }

    async fn disconnect(&self) {
        let inner = self.inner.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || inner.close()).await {
            warn!(host = %self.host, error = %e, "SSH disconnect task failed");
        }
    }
}

fn open_blocking(
    target: &SshTarget,
    username: &str,
    connect_timeout: Duration,
    keepalive_secs: u32,
) -> Result<ssh2::Session> {
    let connection_error = |message: String| SshError::Connection {
        host: target.host.clone(),
        port: target.port,
        message,
    };

    let addr = (target.host.as_str(), target.port)
        .to_socket_addrs()
        .map_err(|e| connection_error(e.to_string()))?
        .next()
        .ok_or_else(|| connection_error("address did not resolve".to_string()))?;

    let tcp = TcpStream::connect_timeout(&addr, connect_timeout)
        .map_err(|e| connection_error(e.to_string()))?;

    let mut session = ssh2::Session::new().map_err(|e| connection_error(e.to_string()))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(millis(connect_timeout));
    session
        .handshake()
        .map_err(|e| connection_error(e.to_string()))?;
    session.set_keepalive(true, keepalive_secs);

    session
        .userauth_pubkey_memory(
            username,
            target.public_key.as_deref(),
            &target.private_key,
            None,
        )
        .map_err(|e| SshError::Authentication {
            host: target.host.clone(),
            username: username.to_string(),
            message: e.to_string(),
        })?;

    if !session.authenticated() {
        return Err(SshError::Authentication {
            host: target.host.clone(),
            username: username.to_string(),
            message: "server rejected the key".to_string(),
        });
    }

    Ok(session)
}

fn exec_blocking(
    inner: &SessionInner,
    command: &str,
    timeout: Duration,
) -> Result<(i32, String, String)> {
    inner.ensure_open()?;
    let _busy = inner.exclusive();
    inner.session.set_timeout(millis(timeout));

    let mut channel = inner.session.channel_session().map_err(|e| map_ssh(e, timeout))?;
    channel.exec(command).map_err(|e| map_ssh(e, timeout))?;

    let (stdout, stderr) = {
        let _nonblocking = NonBlocking::enable(&inner.session);
        drain_interleaved(&mut channel, timeout)?
    };

    channel.wait_close().map_err(|e| map_ssh(e, timeout))?;
    let exit_code = channel.exit_status().map_err(|e| map_ssh(e, timeout))?;
    Ok((exit_code, stdout, stderr))
}

/// Non-blocking mode for the lifetime of the guard
struct NonBlocking<'a> {
    session: &'a ssh2::Session,
}

impl<'a> NonBlocking<'a> {
    fn enable(session: &'a ssh2::Session) -> Self {
        session.set_blocking(false);
        Self { session }
    }
}

impl Drop for NonBlocking<'_> {
    fn drop(&mut self) {
        self.session.set_blocking(true);
    }
}

/// Read stdout and stderr in turn until EOF.
///
/// Draining one stream to the end first would stall a command that fills the
/// channel window on the other.
fn drain_interleaved(channel: &mut ssh2::Channel, timeout: Duration) -> Result<(String, String)> {
    let deadline = Instant::now() + timeout;
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut buf = [0u8; 16 * 1024];

    loop {
        let read = read_available(channel, &mut buf, &mut stdout, timeout)?
            + read_available(&mut channel.stderr(), &mut buf, &mut stderr, timeout)?;
        if read > 0 {
            continue;
        }
        if channel.eof() {
            break;
        }
        if Instant::now() >= deadline {
            return Err(SshError::Timeout(timeout));
        }
        std::thread::sleep(READ_POLL);
    }

    Ok((
        String::from_utf8_lossy(&stdout).into_owned(),
        String::from_utf8_lossy(&stderr).into_owned(),
    ))
}

fn read_available(
    reader: &mut impl Read,
    buf: &mut [u8],
    sink: &mut Vec<u8>,
    timeout: Duration,
) -> Result<usize> {
    match reader.read(buf) {
        Ok(n) => {
            sink.extend_from_slice(&buf[..n]);
            Ok(n)
        }
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
        Err(e) => Err(map_io(e, timeout)),
    }
}

fn stream_blocking(
    inner: &SessionInner,
    command: &str,
    timeout: Duration,
    tx: mpsc::UnboundedSender<String>,
) -> Result<i32> {
    inner.ensure_open()?;
    let _busy = inner.exclusive();
    inner.session.set_timeout(millis(timeout));

    let mut channel = inner.session.channel_session().map_err(|e| map_ssh(e, timeout))?;
    channel
        .handle_extended_data(ssh2::ExtendedData::Merge)
        .map_err(|e| map_ssh(e, timeout))?;
    channel.exec(command).map_err(|e| map_ssh(e, timeout))?;

    {
        let mut reader = BufReader::new(&mut channel);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let read = reader
                .read_until(b'\n', &mut buf)
                .map_err(|e| map_io(e, timeout))?;
            if read == 0 {
                break;
            }
            let text = String::from_utf8_lossy(&buf);
            let line = text.trim_end_matches(['\n', '\r']);
            if tx.send(line.to_string()).is_err() {
                // receiver gone: the caller timed out or was dropped
                break;
            }
        }
    }

    channel.wait_close().map_err(|e| map_ssh(e, timeout))?;
    channel.exit_status().map_err(|e| map_ssh(e, timeout))
}

fn upload_blocking(inner: &SessionInner, content: &[u8], remote_path: &str) -> Result<()> {
    inner.ensure_open()?;
    let _busy = inner.exclusive();
    let upload_error = |message: String| SshError::Upload {
        path: remote_path.to_string(),
        message,
    };

    let mut guard = inner
        .sftp
        .lock()
        .map_err(|_| upload_error("file-transfer channel lock poisoned".to_string()))?;
    if guard.is_none() {
        *guard = Some(
            inner
                .session
                .sftp()
                .map_err(|e| upload_error(e.to_string()))?,
        );
    }
    let Some(sftp) = guard.as_ref() else {
        return Err(upload_error("file-transfer channel unavailable".to_string()));
    };

    let mut file = sftp
        .open_mode(
            Path::new(remote_path),
            ssh2::OpenFlags::WRITE | ssh2::OpenFlags::CREATE | ssh2::OpenFlags::TRUNCATE,
            0o600,
            ssh2::OpenType::File,
        )
        .map_err(|e| upload_error(e.to_string()))?;
    file.write_all(content)
        .map_err(|e| upload_error(e.to_string()))?;
    Ok(())
}

fn millis(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}

fn map_ssh(err: ssh2::Error, timeout: Duration) -> SshError {
    if err.code() == ssh2::ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) {
        SshError::Timeout(timeout)
    } else {
        SshError::from(err)
    }
}

fn map_io(err: std::io::Error, timeout: Duration) -> SshError {
    match err.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
            SshError::Timeout(timeout)
        }
        _ => SshError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::SshConnector;
    use crate::testing::{FakeConnector, FakeHost};

    const TIMEOUT: Duration = Duration::from_secs(30);

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/tmp/provision.sh"), "'/tmp/provision.sh'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_millis_saturates() {
        assert_eq!(millis(Duration::from_secs(30)), 30_000);
        assert_eq!(millis(Duration::from_secs(u64::MAX)), u32::MAX);
    }

    async fn fake_shell(host: &FakeHost, username: &str) -> Box<dyn RemoteShell> {
        FakeConnector::new(host.clone())
            .connect(&SshTarget::new("203.0.113.10", "KEY"), username)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_file_exists() {
        let host = FakeHost::new();
        host.fail_command("test -f '/home/artisan/missing.env'", 1);
        let shell = fake_shell(&host, "artisan").await;

        assert!(shell.file_exists("/home/artisan/.env").await);
        assert!(!shell.file_exists("/home/artisan/missing.env").await);
        assert_eq!(
            host.commands()[0],
            ("artisan".to_string(), "test -f '/home/artisan/.env'".to_string())
        );
    }

    #[tokio::test]
    async fn test_directory_exists() {
        let host = FakeHost::new();
        host.fail_command("test -d '/var/www/gone'", 1);
        let shell = fake_shell(&host, "artisan").await;

        assert!(shell.directory_exists("/var/www/site").await);
        assert!(!shell.directory_exists("/var/www/gone").await);
        assert!(host.commands().iter().all(|(_, c)| c.starts_with("test -d ")));
    }

    #[tokio::test]
    async fn test_existence_checks_on_closed_session_report_missing() {
        let host = FakeHost::new();
        let shell = fake_shell(&host, "artisan").await;
        shell.disconnect().await;

        assert!(!shell.file_exists("/etc/hosts").await);
        assert!(!shell.directory_exists("/etc").await);
    }

    #[tokio::test]
    async fn test_sudo_prefix_depends_on_user() {
        let host = FakeHost::new();
        fake_shell(&host, "root").await.sudo("systemctl reload nginx", TIMEOUT).await.unwrap();
        fake_shell(&host, "artisan").await.sudo("systemctl reload nginx", TIMEOUT).await.unwrap();

        let commands: Vec<String> = host.commands().into_iter().map(|(_, c)| c).collect();
        assert_eq!(commands, vec!["systemctl reload nginx", "sudo systemctl reload nginx"]);
    }

    #[tokio::test]
    async fn test_streamed_lines_reach_borrowing_callback() {
        let host = FakeHost::new();
        host.script_output(["###STEP:1###", "done"], 0);
        let shell = fake_shell(&host, "root").await;

        let mut lines = Vec::new();
        let mut on_line = |line: &str| lines.push(line.to_string());
        let exit_code = shell
            .exec_streaming("bash '/root/provision.sh'", TIMEOUT, &mut on_line)
            .await
            .unwrap();

        assert_eq!(exit_code, 0);
        assert_eq!(lines, vec!["###STEP:1###", "done"]);
    }

    struct WouldBlock;

    impl Read for WouldBlock {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::ErrorKind::WouldBlock.into())
        }
    }

    #[test]
    fn test_read_available_does_not_wait_on_idle_stream() {
        let mut buf = [0u8; 8];
        let mut sink = Vec::new();

        let read = read_available(&mut WouldBlock, &mut buf, &mut sink, TIMEOUT).unwrap();
        assert_eq!(read, 0);
        assert!(sink.is_empty());

        let mut stderr = std::io::Cursor::new(b"warning: disk almost full".to_vec());
        while read_available(&mut stderr, &mut buf, &mut sink, TIMEOUT).unwrap() > 0 {}
        assert_eq!(sink, b"warning: disk almost full");
    }
}
