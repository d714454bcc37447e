/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Watches a directory tree, counts up the total disk usage, and fires
//! events when it changes. Uses inotify. Which turns out to be harder than
//! it should be.
//!
//! An inotify event says nothing about how long ago it happened; any number
//! of further events may have occurred since, including deletion and
//! recreation of the node as a different kind of thing. So the event mask is
//! only usable as a hint that *something* happened to a name, and the
//! authoritative state is re-read with lstat every time. Watches for
//! newly appeared subdirectories are queued rather than installed
//! immediately: the current event batch may still reference the current
//! watch descriptor table, which an install could reshuffle.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::CString;
use std::ffi::OsStr;
use std::ffi::OsString;
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::AsRawFd;
use std::os::unix::io::FromRawFd;
use std::os::unix::io::OwnedFd;
use std::path::Path;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use anyhow::bail;
use anyhow::ensure;
use anyhow::Context;
use anyhow::Result;
use nix::errno::Errno;
use nix::sys::stat::lstat;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::oneshot;

/// Debounce window between a change and notifying listeners, so heavy disk
/// I/O doesn't stream a torrent of updates for what is only a display value.
const DEBOUNCE: Duration = Duration::from_millis(100);

/// Files are accounted in 4 KiB blocks.
const BLOCK_SIZE: u64 = 4096;

const WATCH_FLAGS: u32 = libc::IN_CREATE
    | libc::IN_DELETE
    | libc::IN_MODIFY
    | libc::IN_MOVED_FROM
    | libc::IN_MOVED_TO
    | libc::IN_DONT_FOLLOW
    | libc::IN_ONLYDIR
    | libc::IN_EXCL_UNLINK;

#[derive(Default)]
struct WatchInfo {
    /// Empty path means the watch root itself.
    path: PathBuf,
    child_sizes: HashMap<OsString, u64>,
}

struct State {
    total_size: u64,
    /// Value of total_size the last time listeners were fired.
    last_notified_size: u64,
    listeners: Vec<oneshot::Sender<()>>,
    watches: HashMap<libc::c_int, WatchInfo>,
    /// Directories that should be watched once the current event batch is
    /// fully processed. Treated as a stack, giving DFS traversal.
    pending_watches: Vec<PathBuf>,
}

/// Running estimate of the total disk usage under a directory.
///
/// Clones share state; [`DiskUsageWatcher::run`] must be driven on the same
/// single-threaded executor that calls the query methods.
#[derive(Clone)]
pub struct DiskUsageWatcher {
    root: PathBuf,
    state: Rc<RefCell<State>>,
}

struct DiskUsage {
    path: PathBuf,
    bytes: u64,
    is_dir: bool,
}

/// Disk usage of one directory entry: not exactly the file size, but an
/// estimate including storage overhead. A file that no longer exists reports
/// zero.
fn disk_usage(path: &Path, name: &OsStr) -> Result<DiskUsage> {
    loop {
        match lstat(path) {
            Ok(stats) => {
                let is_dir = stats.st_mode & libc::S_IFMT == libc::S_IFDIR;
                let mut bytes = (stats.st_size as u64 + BLOCK_SIZE - 1) & !(BLOCK_SIZE - 1);
                if stats.st_nlink != 0 {
                    // Divide by the link count so hardlinked files aren't
                    // overcounted, then approximate the directory entry
                    // overhead: a stat record plus the name rounded up to a
                    // word.
                    bytes /= stats.st_nlink as u64;
                    bytes += mem::size_of::<libc::stat>() as u64
                        + ((name.len() as u64 + 8) & !7);
                } else {
                    // The link count really can be zero, e.g. for the
                    // short-lived files `git init` creates and deletes.
                    bytes = 0;
                }
                return Ok(DiskUsage {
                    path: path.to_path_buf(),
                    bytes,
                    is_dir,
                });
            }
            Err(Errno::EINTR) => continue,
            // The file no longer exists, or a parent directory was replaced.
            Err(Errno::ENOENT) | Err(Errno::ENOTDIR) => {
                return Ok(DiskUsage {
                    path: path.to_path_buf(),
                    bytes: 0,
                    is_dir: false,
                });
            }
            Err(e) => {
                return Err(e).with_context(|| format!("while statting {}", path.display()));
            }
        }
    }
}

fn join_child(parent: &Path, name: &OsStr) -> PathBuf {
    if parent.as_os_str().is_empty() {
        PathBuf::from(name)
    } else {
        parent.join(name)
    }
}

#[repr(align(8))]
struct EventBuffer([u8; 4096]);

enum ReadOutcome {
    /// The event queue overflowed; all state is suspect and the watch must
    /// restart from scratch.
    Restart,
}

impl DiskUsageWatcher {
    /// Watch the current directory.
    pub fn new() -> Self {
        Self::watching(PathBuf::new())
    }

    /// Watch the tree under `root`.
    pub fn watching(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            state: Rc::new(RefCell::new(State {
                total_size: 0,
                last_notified_size: u64::MAX,
                listeners: Vec::new(),
                watches: HashMap::new(),
                pending_watches: Vec::new(),
            })),
        }
    }

    pub fn size(&self) -> u64 {
        self.state.borrow().total_size
    }

    /// Resolves to the current size once it differs from `old_size`, but no
    /// sooner than the debounce window after the change.
    pub async fn size_when_changed(&self, old_size: u64) -> u64 {
        let trigger = {
            let mut state = self.state.borrow_mut();
            if state.total_size == old_size {
                let (tx, rx) = oneshot::channel();
                state.listeners.push(tx);
                Some(rx)
            } else {
                None
            }
        };
        if let Some(rx) = trigger {
            // A dropped sender means the watcher restarted; the size is
            // re-checked below either way.
            let _ = rx.await;
        }
        tokio::time::sleep(DEBOUNCE).await;
        self.size()
    }

    /// Drive the watcher. Never returns except on error; restarts itself
    /// from scratch when the kernel reports an event queue overflow.
    pub async fn run(self) -> Result<()> {
        loop {
            let fd = self.init()?;
            let ReadOutcome::Restart = self.read_loop(&fd).await?;
            tracing::warn!("inotify event queue overflow; restarting watch from scratch");
        }
    }

    /// Allocate a fresh notification descriptor and reset all accounting.
    /// Also the recovery path after a queue overflow. Listeners survive a
    /// restart; they fire when the re-counted size settles on a new value.
    fn init(&self) -> Result<AsyncFd<OwnedFd>> {
        let fd = Errno::result(unsafe {
            libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC)
        })
        .context("while creating the inotify descriptor")?;
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        {
            let mut state = self.state.borrow_mut();
            state.total_size = 0;
            state.watches.clear();
            state.pending_watches.clear();
            state.pending_watches.push(self.root.clone());
        }

        AsyncFd::with_interest(fd, Interest::READABLE)
            .context("while registering the inotify descriptor")
    }

    /// Start watching `path`. Idempotent: watching the same path twice is
    /// safe, and a directory that vanished since the event that announced it
    /// is silently skipped.
    fn add_watch(&self, fd: &AsyncFd<OwnedFd>, path: PathBuf) -> Result<()> {
        let target: PathBuf = if path.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            path.clone()
        };
        let c_target =
            CString::new(target.as_os_str().as_bytes()).context("NUL byte in watch path")?;

        let wd = loop {
            match Errno::result(unsafe {
                libc::inotify_add_watch(fd.get_ref().as_raw_fd(), c_target.as_ptr(), WATCH_FLAGS)
            }) {
                Ok(wd) => break wd,
                Err(Errno::EINTR) => continue,
                // No longer a directory at this path; perhaps it was
                // deleted. No matter.
                Err(Errno::ENOENT) | Err(Errno::ENOTDIR) => return Ok(()),
                // ENOSPC means the watch limit is exhausted. No polling
                // fallback yet, so it is fatal like everything else.
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("while watching {}", target.display()));
                }
            }
        };

        {
            // The kernel deduplicates: a pre-existing descriptor comes back
            // when the directory is already watched, which happens in
            // various races. The new path wins, and any existing child
            // accounting is discarded as stale.
            let state = &mut *self.state.borrow_mut();
            let mut info = state.watches.remove(&wd).unwrap_or_default();
            for (_, size) in info.child_sizes.drain() {
                state.total_size -= size;
            }
            info.path = path;
            state.watches.insert(wd, info);
        }

        // Repopulate by listing the directory.
        if let Ok(entries) = std::fs::read_dir(&target) {
            for entry in entries {
                let entry =
                    entry.with_context(|| format!("while listing {}", target.display()))?;
                self.child_event(wd, &entry.file_name())?;
            }
        }
        Ok(())
    }

    fn add_pending_watches(&self, fd: &AsyncFd<OwnedFd>) -> Result<()> {
        loop {
            let next = self.state.borrow_mut().pending_watches.pop();
            match next {
                Some(path) => self.add_watch(fd, path)?,
                None => return Ok(()),
            }
        }
    }

    /// Update the child table for `name` under the watch `wd`.
    fn child_event(&self, wd: libc::c_int, name: &OsStr) -> Result<()> {
        let usage = {
            let state = self.state.borrow();
            let Some(info) = state.watches.get(&wd) else {
                bail!("inotify reported an unknown watch descriptor");
            };
            let path = join_child(&info.path, name);
            drop(state);
            disk_usage(&path, name)?
        };

        let state = &mut *self.state.borrow_mut();
        let Some(info) = state.watches.get_mut(&wd) else {
            bail!("inotify reported an unknown watch descriptor");
        };
        state.total_size += usage.bytes;
        if usage.bytes == 0 {
            // No longer a child by this name on disk.
            if let Some(old) = info.child_sizes.remove(name) {
                state.total_size -= old;
            }
        } else if let Some(old) = info.child_sizes.insert(name.to_os_string(), usage.bytes) {
            state.total_size -= old;
        }

        // A directory event here means created or moved in (modify events
        // are not generated for subdirectories, and a deleted or moved-out
        // node would have statted as absent). Either way the directory needs
        // a (re-)watch, but not until this event batch is done.
        if usage.is_dir {
            state.pending_watches.push(usage.path);
        }
        Ok(())
    }

    fn fire_listeners_if_changed(&self) {
        let mut state = self.state.borrow_mut();
        if state.total_size != state.last_notified_size {
            state.last_notified_size = state.total_size;
            for listener in state.listeners.drain(..) {
                let _ = listener.send(());
            }
        }
    }

    fn remove_watch(&self, wd: libc::c_int) {
        let state = &mut *self.state.borrow_mut();
        // There shouldn't be any children left, but if there are, un-count
        // them.
        if let Some(info) = state.watches.remove(&wd) {
            for (_, size) in info.child_sizes {
                state.total_size -= size;
            }
        }
    }

    async fn read_loop(&self, fd: &AsyncFd<OwnedFd>) -> Result<ReadOutcome> {
        loop {
            self.add_pending_watches(fd)?;
            self.fire_listeners_if_changed();

            let mut guard = fd.readable().await.context("while awaiting inotify")?;
            'drain: loop {
                let mut buffer = EventBuffer([0; 4096]);
                let n = unsafe {
                    libc::read(
                        fd.get_ref().as_raw_fd(),
                        buffer.0.as_mut_ptr().cast(),
                        buffer.0.len(),
                    )
                };
                let n = match Errno::result(n) {
                    Ok(0) => bail!("inotify EOF?"),
                    Ok(n) => n as usize,
                    Err(Errno::EINTR) => continue 'drain,
                    Err(Errno::EAGAIN) => {
                        guard.clear_ready();
                        break 'drain;
                    }
                    Err(e) => return Err(e).context("while reading inotify events"),
                };

                let mut pos = 0;
                while pos < n {
                    const HEADER_SIZE: usize = mem::size_of::<libc::inotify_event>();
                    ensure!(pos + HEADER_SIZE <= n, "inotify returned a partial event?");
                    let event: libc::inotify_event = unsafe {
                        (buffer.0.as_ptr().add(pos) as *const libc::inotify_event).read_unaligned()
                    };
                    let event_size = HEADER_SIZE + event.len as usize;
                    ensure!(pos + event_size <= n, "inotify returned a partial event?");

                    if event.mask & libc::IN_Q_OVERFLOW != 0 {
                        return Ok(ReadOutcome::Restart);
                    }

                    if event.mask & (libc::IN_CREATE | libc::IN_DELETE | libc::IN_MODIFY | libc::IN_MOVE) != 0 {
                        let name_bytes = &buffer.0[pos + HEADER_SIZE..pos + event_size];
                        let name_end = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_bytes.len());
                        let name = OsStr::from_bytes(&name_bytes[..name_end]);
                        if !name.is_empty() {
                            self.child_event(event.wd, name)?;
                        }
                    }

                    if event.mask & libc::IN_IGNORED != 0 {
                        // The watch is gone, probably because the directory
                        // was deleted.
                        self.remove_watch(event.wd);
                    }

                    pos += event_size;
                }
            }
        }
    }
}

impl Default for DiskUsageWatcher {
    fn default() -> Self {
        Self::new()
    }
}
