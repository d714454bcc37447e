/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Supervisor lifecycle: sandbox construction, fork, and the event loop that
//! serves the external RPC socket until the grain goes away.
//!
//! Everything runs on one thread. The event loop is a current-thread tokio
//! runtime; connection tasks are `spawn_local`ed and all shared state lives
//! in `Rc<RefCell<..>>`. The only concurrency the signal handlers see is a
//! pair of word-sized atomics (see [`crate::watchdog`]).

use std::cell::RefCell;
use std::io::Write;
use std::os::unix::io::OwnedFd;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use nix::sys::wait::waitpid;
use nix::sys::wait::WaitStatus;
use nix::unistd::chroot;
use nix::unistd::Pid;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::signal::unix::signal;
use tokio::signal::unix::Signal;
use tokio::signal::unix::SignalKind;
use tokio::sync::oneshot;
use tokio::task::LocalSet;

use crate::child;
use crate::config::Config;
use crate::disk_usage::DiskUsageWatcher;
use crate::rpc;
use crate::rpc::AppMessage;
use crate::rpc::SupervisorMessage;
use crate::rpc::SupervisorRequest;
use crate::rpc::SupervisorResponse;
use crate::rpc::UiView;
use crate::sandbox;
use crate::setup;
use crate::watchdog;
use crate::watchdog::sandstorm_log;

/// Run one grain supervisor to completion. Exits the process directly on the
/// paths that must bypass normal unwinding (shutdown RPC, child exit).
pub fn run(config: Config) -> Result<()> {
    config.validate()?;
    setup::reset_signal_mask()?;

    // Must be probed before entering any namespace; it needs the host /proc.
    let is_iptables_available =
        setup::check_if_ip_tables_loaded().context("while probing for ip_tables")?;

    setup::enable_no_new_privs()?;
    setup::close_inherited_fds()?;
    setup::check_paths(&config)?;

    // If another supervisor already serves this grain, defer to it. The
    // launcher is waiting for a line on stdout either way.
    if existing_supervisor_took_over(&config.var_path) {
        let mut stdout = std::io::stdout();
        stdout
            .write_all(rpc::ALREADY_RUNNING_MESSAGE.as_bytes())
            .and_then(|()| stdout.flush())
            .context("while reporting the existing supervisor")?;
        return Ok(());
    }

    sandstorm_log!("Starting up grain.");

    sandbox::fs::unshare_outer()?;
    let mount_proc = sandbox::fs::setup_filesystem(&config)?;
    setup::setup_stdio(&config)?;

    watchdog::install()?;

    let (child_pid, api_fd) = child::spawn(&config, mount_proc, is_iptables_available)?;
    tracing::info!(pid = child_pid.as_raw(), "sandbox child started");

    let result = run_supervisor(&config, api_fd);
    // Whatever took the event loop down, the child must not outlive us.
    watchdog::kill_child();
    result
}

/// Try to connect to a supervisor already listening in `var_path` and ping
/// it. Success means this invocation has nothing to do. Any failure just
/// means the socket is stale and setup should proceed.
pub fn existing_supervisor_took_over(var_path: &Path) -> bool {
    let Ok(mut stream) = std::os::unix::net::UnixStream::connect(var_path.join(rpc::SOCKET_NAME))
    else {
        return false;
    };
    if rpc::blocking::write_frame(&mut stream, &SupervisorRequest::KeepAlive).is_err() {
        return false;
    }
    matches!(
        rpc::blocking::read_frame::<_, SupervisorResponse>(&mut stream),
        Ok(SupervisorResponse::Ok)
    )
}

/// State shared between connection handlers.
struct SharedState {
    disk_watcher: DiskUsageWatcher,
    main_view: RefCell<MainViewCell>,
}

#[derive(Default)]
struct MainViewCell {
    view: Option<UiView>,
    waiters: Vec<oneshot::Sender<UiView>>,
}

impl SharedState {
    /// The app's bootstrap view, once it has arrived over the socket pair.
    async fn main_view(&self) -> Result<UiView> {
        let receiver = {
            let mut cell = self.main_view.borrow_mut();
            if let Some(view) = &cell.view {
                return Ok(view.clone());
            }
            let (tx, rx) = oneshot::channel();
            cell.waiters.push(tx);
            rx
        };
        receiver
            .await
            .context("app disconnected before providing its main view")
    }

    fn publish_main_view(&self, view: UiView) {
        let mut cell = self.main_view.borrow_mut();
        for waiter in cell.waiters.drain(..) {
            let _ = waiter.send(view.clone());
        }
        cell.view = Some(view);
    }
}

/// The supervisor side of the event loop, entered after fork.
fn run_supervisor(config: &Config, api_fd: OwnedFd) -> Result<()> {
    // Our root directory is currently controlled by the app; if libc decided
    // to read some configuration file, the grain could feed it arbitrary
    // content. Confine ourselves to the supervisor directory.
    chroot(".").context("while confining the supervisor to its directory")?;

    sandbox::drop_credentials()?;
    sandbox::seccomp::install(sandbox::seccomp::Options {
        devmode: config.devmode,
        dump: config.seccomp_dump,
    })?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("while starting the event loop")?;
    let local = LocalSet::new();
    local.block_on(&runtime, supervise(api_fd))
}

/// What ended the event loop.
enum Exit {
    /// The child was reaped; carries its exit code and the line to log.
    Child(i32, String),
    AppDisconnected,
}

async fn supervise(api_fd: OwnedFd) -> Result<()> {
    let mut sigchld =
        signal(SignalKind::child()).context("while registering for child-death signals")?;

    let disk_watcher = DiskUsageWatcher::new();
    let state = Rc::new(SharedState {
        disk_watcher: disk_watcher.clone(),
        main_view: RefCell::new(MainViewCell::default()),
    });

    let app_stream = {
        let std_stream = std::os::unix::net::UnixStream::from(api_fd);
        std_stream
            .set_nonblocking(true)
            .context("while preparing the app socket")?;
        UnixStream::from_std(std_stream).context("while adopting the app socket")?
    };

    // Clear a stale socket node, if any, then listen and tell the launcher.
    let _ = std::fs::remove_file(rpc::SOCKET_NAME);
    let listener =
        UnixListener::bind(rpc::SOCKET_NAME).context("while binding the RPC socket")?;
    {
        let mut stdout = std::io::stdout();
        stdout
            .write_all(rpc::READY_MESSAGE.as_bytes())
            .and_then(|()| stdout.flush())
            .context("while announcing readiness")?;
    }

    let accept_task = accept_loop(listener, state.clone());
    let watcher_task = disk_watcher.run();
    let app_task = serve_app_channel(app_stream, state.clone());
    let child_exit = wait_for_child_exit(&mut sigchld);

    tokio::pin!(accept_task);
    tokio::pin!(watcher_task);
    tokio::pin!(app_task);
    tokio::pin!(child_exit);

    let exit = tokio::select! {
        res = &mut accept_task => {
            res.context("the accept loop failed")?;
            bail!("the accept loop ended unexpectedly");
        }
        res = &mut watcher_task => {
            res.context("the disk usage watcher failed")?;
            bail!("the disk usage watcher ended unexpectedly");
        }
        res = &mut app_task => {
            if let Err(e) = res {
                tracing::error!("app RPC channel failed: {e:#}");
            }
            Exit::AppDisconnected
        }
        (status, message) = &mut child_exit => Exit::Child(status, message),
    };

    match exit {
        Exit::Child(status, message) => {
            watchdog::log_line(&message);
            std::process::exit(status);
        }
        Exit::AppDisconnected => {
            // The app probably exited and the signal just hasn't landed yet.
            // Give it a moment so the exit status can be reported.
            tokio::select! {
                (status, message) = &mut child_exit => {
                    watchdog::log_line(&message);
                    std::process::exit(status);
                }
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
            sandstorm_log!("App disconnected API socket but didn't actually exit; killing it.");
            watchdog::kill_child_and_exit(1);
        }
    }
}

/// Human description of a signal, e.g. "Segmentation fault".
fn signal_description(sig: libc::c_int) -> String {
    let text = unsafe { libc::strsignal(sig) };
    if text.is_null() {
        return format!("signal {}", sig);
    }
    unsafe { std::ffi::CStr::from_ptr(text) }
        .to_string_lossy()
        .into_owned()
}

/// Wait for SIGCHLD, reap the child, and describe how it went.
async fn wait_for_child_exit(sigchld: &mut Signal) -> (i32, String) {
    loop {
        sigchld.recv().await;
        let pid = watchdog::child_pid();
        if pid == 0 {
            continue;
        }
        match waitpid(Pid::from_raw(pid), None) {
            Ok(WaitStatus::Exited(_, code)) => {
                watchdog::clear_child_pid();
                return (code, format!("App exited with status code: {}", code));
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                watchdog::clear_child_pid();
                return (
                    1,
                    format!(
                        "App exited due to signal {} ({}).",
                        sig as i32,
                        signal_description(sig as i32)
                    ),
                );
            }
            // Stopped/continued and the like; not an exit.
            Ok(_) => continue,
            Err(e) => {
                tracing::error!("waitpid failed: {}", e);
                continue;
            }
        }
    }
}

async fn accept_loop(listener: UnixListener, state: Rc<SharedState>) -> Result<()> {
    loop {
        let (stream, _addr) = listener
            .accept()
            .await
            .context("while accepting an RPC connection")?;
        let state = state.clone();
        // Connection state is owned by its task until disconnect; failures
        // are logged and never take the supervisor down.
        tokio::task::spawn_local(async move {
            if let Err(e) = serve_connection(stream, state).await {
                tracing::error!("connection failed: {e:#}");
            }
        });
    }
}

async fn serve_connection(stream: UnixStream, state: Rc<SharedState>) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    while let Some(request) = rpc::read_frame::<_, SupervisorRequest>(&mut reader).await? {
        let response = match request {
            SupervisorRequest::GetMainView => match state.main_view().await {
                Ok(view) => SupervisorResponse::MainView { view },
                Err(e) => SupervisorResponse::Error {
                    message: format!("{e:#}"),
                },
            },
            SupervisorRequest::KeepAlive => {
                watchdog::note_keep_alive();
                SupervisorResponse::Ok
            }
            SupervisorRequest::Shutdown => watchdog::kill_child_and_exit(0),
            SupervisorRequest::GetGrainSize => SupervisorResponse::Size {
                bytes: state.disk_watcher.size(),
            },
            SupervisorRequest::GetGrainSizeWhenDifferent { old_size } => {
                SupervisorResponse::Size {
                    bytes: state.disk_watcher.size_when_changed(old_size).await,
                }
            }
        };
        rpc::write_frame(&mut writer, &response).await?;
    }
    Ok(())
}

/// Drive the socket-pair channel to the app: fetch the bootstrap view once,
/// then answer `SandstormApi` calls (all unimplemented for now) until the
/// app disconnects.
async fn serve_app_channel(stream: UnixStream, state: Rc<SharedState>) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();

    rpc::write_frame(&mut writer, &SupervisorMessage::GetMainView)
        .await
        .context("while requesting the app's main view")?;

    loop {
        match rpc::read_frame::<_, AppMessage>(&mut reader)
            .await
            .context("while reading from the app")?
        {
            None => return Ok(()),
            Some(AppMessage::MainView { view }) => state.publish_main_view(view),
            Some(AppMessage::ApiCall { id, method, .. }) => {
                rpc::write_frame(
                    &mut writer,
                    &SupervisorMessage::ApiResult {
                        id,
                        error: format!("SandstormApi.{} is unimplemented", method),
                    },
                )
                .await
                .context("while answering the app")?;
            }
        }
    }
}
