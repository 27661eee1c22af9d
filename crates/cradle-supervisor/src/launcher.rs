//! Spawns the node and owns its OS process.
//!
//! stdout and stderr share one OS pipe, so lines arrive in the order the node
//! wrote them. A waiter task owns the `Child`; everything else talks to it
//! through channels.

use std::{collections::BTreeMap, path::PathBuf, process::Stdio, time::Duration};

use anyhow::Context;
#[cfg(unix)]
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::{
    process::Command,
    sync::{mpsc, oneshot, watch},
};
use tracing::debug;

use crate::args::{CommandLine, EXTRA_JVM_OPTS_ENV};

/// What to run, where, and with which extra environment.
#[derive(Debug, Clone)]
pub struct Launch {
    pub command: CommandLine,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
}

impl Launch {
    /// Variables set on the child on top of the inherited environment.
    pub fn child_env(&self) -> BTreeMap<String, String> {
        let mut env = self.env.clone();
        if let Some(extra) = &self.command.extra_jvm_opts {
            env.insert(EXTRA_JVM_OPTS_ENV.to_string(), extra.clone());
        }
        env
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Running,
    Exited(Option<i32>),
}

/// How a stop request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Already gone before anything was sent.
    AlreadyExited(Option<i32>),
    /// Exited within the grace period after SIGTERM.
    Graceful(Option<i32>),
    /// Needed SIGKILL.
    Killed(Option<i32>),
    /// Still not reaped when the stop timeout ran out.
    Unresponsive,
}

pub struct RunningProcess {
    pid: Option<u32>,
    pgid: Option<i32>,
    output: Option<mpsc::UnboundedReceiver<String>>,
    exit_rx: watch::Receiver<Exit>,
    kill_tx: Option<oneshot::Sender<()>>,
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // Child goes down with us even if we die without running stop().
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

pub fn spawn(launch: &Launch) -> anyhow::Result<RunningProcess> {
    let (output, stdout) = std::io::pipe().context("create output pipe")?;
    let stderr = stdout.try_clone().context("share output pipe")?;

    let mut cmd = Command::new(&launch.command.program);
    cmd.args(&launch.command.args)
        .current_dir(&launch.cwd)
        .envs(launch.child_env())
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .kill_on_drop(true);

    #[cfg(unix)]
    {
        unsafe {
            cmd.pre_exec(|| {
                set_parent_death_signal()?;
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    let mut child = cmd.spawn().with_context(|| {
        format!(
            "spawn {} (cwd {})",
            launch.command.program.display(),
            launch.cwd.display()
        )
    })?;
    // Our copies of the write end must go, or the reader never sees EOF.
    drop(cmd);
    let pid = child.id();
    // setsid makes the child its own group leader.
    let pgid = if cfg!(unix) { pid.map(|p| p as i32) } else { None };

    let (line_tx, line_rx) = mpsc::unbounded_channel();
    read_output(output, line_tx)?;

    let (exit_tx, exit_rx) = watch::channel(Exit::Running);
    let (kill_tx, kill_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let status = tokio::select! {
            res = child.wait() => res,
            // Fires on an explicit kill and when the handle is dropped.
            _ = kill_rx => {
                let _ = child.start_kill();
                child.wait().await
            }
        };
        let code = status.ok().and_then(|s| s.code());
        debug!(?pid, ?code, "node process exited");
        let _ = exit_tx.send(Exit::Exited(code));
    });

    Ok(RunningProcess {
        pid,
        pgid,
        output: Some(line_rx),
        exit_rx,
        kill_tx: Some(kill_tx),
    })
}

#[cfg(unix)]
fn read_output(pipe: std::io::PipeReader, tx: mpsc::UnboundedSender<String>) -> anyhow::Result<()> {
    let pipe = tokio::net::unix::pipe::Receiver::from_owned_fd(std::os::fd::OwnedFd::from(pipe))
        .context("register output pipe")?;
    tokio::spawn(pump_lines(pipe, tx));
    Ok(())
}

#[cfg(not(unix))]
fn read_output(pipe: std::io::PipeReader, tx: mpsc::UnboundedSender<String>) -> anyhow::Result<()> {
    use std::io::BufRead;

    tokio::task::spawn_blocking(move || {
        let mut reader = std::io::BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    if tx.send(decode_line(&buf)).is_err() {
                        break;
                    }
                }
            }
        }
    });
    Ok(())
}

/// Forward every line of `stream` until EOF. Invalid UTF-8 is replaced, not fatal.
#[cfg(unix)]
async fn pump_lines<R>(stream: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                if tx.send(decode_line(&buf)).is_err() {
                    break;
                }
            }
        }
    }
}

fn decode_line(buf: &[u8]) -> String {
    String::from_utf8_lossy(buf)
        .trim_end_matches(['\n', '\r'])
        .to_string()
}

impl RunningProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Merged output lines in write order; closes once every writer is gone. Taken once.
    pub fn take_output(&mut self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.output.take()
    }

    pub fn exit(&self) -> Exit {
        *self.exit_rx.borrow()
    }

    pub fn exit_watch(&self) -> watch::Receiver<Exit> {
        self.exit_rx.clone()
    }

    /// Wait up to `limit` for the process to be reaped.
    pub async fn wait_exit(&self, limit: Duration) -> Option<Option<i32>> {
        wait_exited(self.exit_rx.clone(), limit).await
    }

    /// SIGTERM the process group, SIGKILL it after `grace`, give up after `timeout`.
    ///
    /// A zero `grace` skips SIGTERM and kills straight away.
    pub async fn terminate(&mut self, grace: Duration, timeout: Duration) -> Termination {
        if let Exit::Exited(code) = self.exit() {
            self.sweep_group();
            return Termination::AlreadyExited(code);
        }

        if !grace.is_zero() {
            self.signal_group(Signal::Term);
            if let Some(code) = self.wait_exit(grace).await {
                self.sweep_group();
                return Termination::Graceful(code);
            }
        }

        self.signal_group(Signal::Kill);
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
        match self.wait_exit(timeout.saturating_sub(grace)).await {
            Some(code) => Termination::Killed(code),
            None => Termination::Unresponsive,
        }
    }

    /// Group members may outlive the leader; make sure none are left.
    fn sweep_group(&self) {
        self.signal_group(Signal::Kill);
    }

    #[cfg(unix)]
    fn signal_group(&self, signal: Signal) {
        if let Some(pgid) = self.pgid {
            let sig = match signal {
                Signal::Term => libc::SIGTERM,
                Signal::Kill => libc::SIGKILL,
            };
            unsafe {
                libc::kill(-pgid, sig);
            }
        }
    }

    #[cfg(not(unix))]
    fn signal_group(&self, signal: Signal) {
        // No process groups; the waiter kills the direct child.
        let _ = signal;
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

impl Drop for RunningProcess {
    fn drop(&mut self) {
        if self.exit() == Exit::Running {
            self.signal_group(Signal::Kill);
        }
    }
}

pub(crate) async fn wait_exited(mut rx: watch::Receiver<Exit>, limit: Duration) -> Option<Option<i32>> {
    let res = tokio::time::timeout(limit, rx.wait_for(|e| matches!(e, Exit::Exited(_)))).await;
    match res {
        Ok(Ok(exit)) => match *exit {
            Exit::Exited(code) => Some(code),
            Exit::Running => None,
        },
        // Waiter gone without a result; treat as exited with unknown code.
        Ok(Err(_)) => Some(None),
        Err(_) => None,
    }
}
