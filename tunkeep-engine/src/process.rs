//! External-process tunneling engine
//!
//! Runs the packet engine as a child process. The tunnel interface is opened
//! through the host before the child starts, and its descriptor is passed on
//! the command line (`{tun_fd}`). Everything the child prints is forwarded to
//! the diagnostic log.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keep_tun::{InterfaceRequest, TunnelFd};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::engine::{EngineHost, EngineInstance, TunnelEngine};
use crate::error::{Error, Result};

/// How long the child must survive before start counts as successful
pub const DEFAULT_STARTUP_GRACE: Duration = Duration::from_millis(500);

/// How to launch the engine process
#[derive(Debug, Clone)]
pub struct ProcessSettings {
    pub command: String,
    /// Arguments with `{config}`, `{tun_fd}` and `{tun_name}` placeholders
    pub args: Vec<String>,
    /// Where the engine configuration document is written
    pub config_path: PathBuf,
    /// Interface requested from the host before launch
    pub request: InterfaceRequest,
    pub tun_name: String,
    pub startup_grace: Duration,
    pub stop_timeout: Duration,
}

impl ProcessSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        let engine = config.engine_config()?;
        Ok(Self {
            command: engine.command.clone(),
            args: engine.args.clone(),
            config_path: engine.config_path.clone(),
            request: config.tunnel.to_request()?,
            tun_name: config.interface.session_name.clone(),
            startup_grace: DEFAULT_STARTUP_GRACE,
            stop_timeout: Duration::from_millis(engine.stop_timeout_ms),
        })
    }
}

/// Substitute placeholders in the argument list
pub fn expand_args(args: &[String], config: &Path, fd: TunnelFd, tun_name: &str) -> Vec<String> {
    let config = config.to_string_lossy();
    args.iter()
        .map(|arg| {
            arg.replace("{config}", &config)
                .replace("{tun_fd}", &fd.to_string())
                .replace("{tun_name}", tun_name)
        })
        .collect()
}

/// [`TunnelEngine`] backed by an external command
pub struct ProcessEngine {
    settings: Arc<ProcessSettings>,
}

impl ProcessEngine {
    pub fn new(settings: ProcessSettings) -> Self {
        Self {
            settings: Arc::new(settings),
        }
    }
}

#[async_trait]
impl TunnelEngine for ProcessEngine {
    async fn configure(
        &self,
        config: &[u8],
        host: Arc<dyn EngineHost>,
    ) -> Result<Box<dyn EngineInstance>> {
        if config.is_empty() {
            return Err(Error::ConfigInvalid("engine configuration is empty".into()));
        }

        let path = &self.settings.config_path;
        tokio::fs::write(path, config).await.map_err(|e| {
            Error::ConfigInvalid(format!("failed to write {}: {}", path.display(), e))
        })?;
        log::debug!("Wrote engine config to {}", path.display());

        Ok(Box::new(ProcessInstance {
            settings: self.settings.clone(),
            host,
            running: None,
        }))
    }
}

struct Running {
    stop_tx: oneshot::Sender<()>,
    supervisor: JoinHandle<()>,
}

struct ProcessInstance {
    settings: Arc<ProcessSettings>,
    host: Arc<dyn EngineHost>,
    running: Option<Running>,
}

impl ProcessInstance {
    fn spawn_child(&self, fd: TunnelFd) -> Result<Child> {
        let s = &self.settings;
        let args = expand_args(&s.args, &s.config_path, fd, &s.tun_name);
        log::info!("Starting engine: {} {}", s.command, args.join(" "));

        let mut cmd = Command::new(&s.command);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        if fd >= 0 {
            // SAFETY: only async-signal-safe fcntl is called in the child
            unsafe {
                cmd.pre_exec(move || {
                    if libc::fcntl(fd, libc::F_SETFD, 0) == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        cmd.spawn()
            .map_err(|e| Error::EngineStartFailed(format!("failed to run {}: {}", s.command, e)))
    }
}

#[async_trait]
impl EngineInstance for ProcessInstance {
    async fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Err(Error::AlreadyRunning);
        }

        let fd = self.host.open_tun(self.settings.request.clone()).await?;
        let mut child = self.spawn_child(fd)?;

        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, self.host.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, self.host.clone());
        }

        if let Ok(status) = tokio::time::timeout(self.settings.startup_grace, child.wait()).await {
            let detail = match status {
                Ok(status) => status.to_string(),
                Err(e) => e.to_string(),
            };
            return Err(Error::EngineStartFailed(format!(
                "engine exited during startup ({})",
                detail
            )));
        }

        log::info!("Engine process running (pid {:?})", child.id());

        let (stop_tx, stop_rx) = oneshot::channel();
        let supervisor = tokio::spawn(supervise(
            child,
            stop_rx,
            self.host.clone(),
            self.settings.stop_timeout,
        ));
        self.running = Some(Running {
            stop_tx,
            supervisor,
        });
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };

        // The supervisor may already be gone if the child exited on its own
        let _ = running.stop_tx.send(());
        running
            .supervisor
            .await
            .map_err(|e| Error::Engine(format!("engine supervisor failed: {}", e)))
    }
}

fn forward_lines<R>(reader: R, host: Arc<dyn EngineHost>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => host.write_log(&line),
                Ok(None) => break,
                Err(e) => {
                    log::debug!("Engine output closed: {}", e);
                    break;
                }
            }
        }
    });
}

async fn supervise(
    mut child: Child,
    mut stop_rx: oneshot::Receiver<()>,
    host: Arc<dyn EngineHost>,
    stop_timeout: Duration,
) {
    tokio::select! {
        status = child.wait() => {
            match status {
                Ok(status) => host.write_log(&format!("engine exited: {}", status)),
                Err(e) => host.write_log(&format!("failed to wait for engine: {}", e)),
            }
            host.post_service_close();
        }
        _ = &mut stop_rx => {
            terminate(&mut child, stop_timeout).await;
        }
    }
}

/// SIGTERM, then SIGKILL once `timeout` has passed
async fn terminate(child: &mut Child, timeout: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: pid is our unreaped child
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if let Ok(status) = tokio::time::timeout(timeout, child.wait()).await {
            log::info!("Engine stopped: {:?}", status);
            return;
        }
        log::warn!("Engine ignored SIGTERM for {}ms, killing it", timeout.as_millis());
    }

    match child.kill().await {
        Ok(()) => log::info!("Engine killed"),
        Err(e) => log::warn!("Failed to kill engine: {}", e),
    }
}
