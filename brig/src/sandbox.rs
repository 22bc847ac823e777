//! Sandbox builder and launch.

use std::fs::File;
use std::io::{self, IsTerminal};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::Duration;

use brig_proto::{Config, Limit, Mount, Run, Stream};
use nix::fcntl::OFlag;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::{Pid, pipe2};
use tracing::{debug, info, warn};

use crate::console::{self, Channel, Console};
use crate::error::{Error, Result};
use crate::forward::{Forward, Side, relay_args};
use crate::locate::{Binary, locate};
use crate::share::Share;
use crate::supervise::{self, Escalation};
use crate::{image, pre_exec};

/// Host directories offered read-only by [`SandboxBuilder::base`].
pub const BASE_DIRS: [&str; 7] = ["/bin", "/sbin", "/lib", "/lib32", "/lib64", "/usr", "/etc"];

/// Guest directory the relay binary's host directory is mounted at.
pub const RELAY_MOUNT: &str = "/.brig";

/// Default guest memory.
pub const DEFAULT_MEMORY: &str = "256M";

/// Builder for a [`Sandbox`].
///
/// Defaults: 256M of memory, host stdin attached, the command runs as a
/// random unprivileged identity with no host directories shared.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
///
/// let status = brig::Sandbox::builder("make", ["-j4"])
///     .base(true)
///     .cwd("/src")
///     .timeout(Duration::from_secs(600))
///     .build()?
///     .run()?;
/// # Ok::<(), brig::Error>(())
/// ```
#[derive(Debug)]
#[must_use = "a SandboxBuilder does nothing until .build() is called"]
pub struct SandboxBuilder {
    /// Command followed by its arguments.
    command: Vec<String>,
    /// Shared host directories.
    shares: Vec<Share>,
    /// Offer [`BASE_DIRS`] read-only.
    base: bool,
    /// Guest working directory.
    cwd: Option<String>,
    /// Extra environment for the command.
    env: Vec<(String, String)>,
    /// Detach host stdin.
    no_stdin: bool,
    /// Keep root inside the guest.
    root: bool,
    /// Explicit uid; 0 means random.
    uid: u32,
    /// Explicit gid; 0 means random.
    gid: u32,
    /// Bytes of host randomness to seed the guest with.
    entropy: usize,
    /// Port forwards.
    forwards: Vec<Forward>,
    /// X11 forward, if requested.
    x11: Option<Forward>,
    /// Timeout before escalation starts.
    timeout: Option<Duration>,
    /// Grace between escalation stages.
    grace: Duration,
    /// Guest memory, passed through as `mem=`.
    memory: String,
    /// Resource limits for the command.
    limits: Vec<Limit>,
    /// Route the command's output through a relay child.
    pipe_output: bool,
    /// Kernel override.
    kernel: Option<PathBuf>,
    /// Initrd override.
    initrd: Option<PathBuf>,
    /// Relay override.
    relay: Option<PathBuf>,
    /// Guest log filter.
    guest_log: Option<String>,
    /// Show kernel boot messages.
    kernel_messages: bool,
}

/// Facts about the host a plan depends on, gathered once at build time.
#[derive(Debug, Clone, Default)]
pub(crate) struct HostFacts {
    /// Host stdin is a terminal.
    pub stdin_tty: bool,
    /// Base directories that exist on this host.
    pub base_dirs: Vec<String>,
    /// Located relay binary, when relaying.
    pub relay: Option<PathBuf>,
    /// Entropy blob for the guest.
    pub entropy: Option<Vec<u8>>,
}

impl SandboxBuilder {
    /// Adds a host directory share.
    pub fn share(mut self, share: Share) -> Self {
        self.shares.push(share);
        self
    }

    /// Offers the host's system directories read-only.
    pub const fn base(mut self, enable: bool) -> Self {
        self.base = enable;
        self
    }

    /// Sets the guest working directory.
    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Adds an environment variable for the command.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Detaches host stdin from the command.
    pub const fn no_stdin(mut self, detach: bool) -> Self {
        self.no_stdin = detach;
        self
    }

    /// Runs the command as root inside the guest.
    pub const fn root(mut self, root: bool) -> Self {
        self.root = root;
        self
    }

    /// Sets the command's uid (0 picks a random one).
    pub const fn uid(mut self, uid: u32) -> Self {
        self.uid = uid;
        self
    }

    /// Sets the command's gid (0 picks a random one).
    pub const fn gid(mut self, gid: u32) -> Self {
        self.gid = gid;
        self
    }

    /// Seeds the guest random pool with `bytes` of host randomness.
    pub const fn entropy(mut self, bytes: usize) -> Self {
        self.entropy = bytes;
        self
    }

    /// Adds a port forward.
    pub fn forward(mut self, forward: Forward) -> Self {
        self.forwards.push(forward);
        self
    }

    /// Forwards X11 and points the command at the guest display.
    pub fn x11(mut self, forward: Forward) -> Self {
        self.x11 = Some(forward);
        self
    }

    /// Starts escalation after `timeout`.
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Overrides the grace window between escalation stages.
    pub const fn grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Sets guest memory (`<n>[K|M|G]`).
    pub fn memory(mut self, memory: impl Into<String>) -> Self {
        self.memory = memory.into();
        self
    }

    /// Adds a resource limit for the command.
    pub fn limit(mut self, limit: Limit) -> Self {
        self.limits.push(limit);
        self
    }

    /// Routes the command's output through a relay child.
    pub const fn pipe_output(mut self, enable: bool) -> Self {
        self.pipe_output = enable;
        self
    }

    /// Uses `path` as the guest kernel.
    pub fn kernel(mut self, path: impl Into<PathBuf>) -> Self {
        self.kernel = Some(path.into());
        self
    }

    /// Uses `path` as the initrd.
    pub fn initrd(mut self, path: impl Into<PathBuf>) -> Self {
        self.initrd = Some(path.into());
        self
    }

    /// Uses `path` as the relay binary.
    pub fn relay(mut self, path: impl Into<PathBuf>) -> Self {
        self.relay = Some(path.into());
        self
    }

    /// Sets the guest supervisor's log filter.
    pub fn guest_log(mut self, filter: impl Into<String>) -> Self {
        self.guest_log = Some(filter.into());
        self
    }

    /// Shows kernel boot messages instead of passing `quiet`.
    pub const fn kernel_messages(mut self, show: bool) -> Self {
        self.kernel_messages = show;
        self
    }

    /// Whether the relay daemon is needed.
    fn relaying(&self) -> bool {
        !self.forwards.is_empty() || self.x11.is_some()
    }

    /// Every forward, X11 last.
    fn all_forwards(&self) -> Vec<Forward> {
        self.forwards.iter().chain(&self.x11).cloned().collect()
    }

    /// Resolves binaries, probes the host and assembles the configuration.
    pub fn build(self) -> Result<Sandbox> {
        if self.command.is_empty() {
            return Err(Error::NoCommand);
        }
        if !valid_memory(&self.memory) {
            return Err(Error::InvalidMemory(self.memory));
        }

        let kernel = locate(Binary::Kernel, self.kernel.as_deref())?;
        let initrd = locate(Binary::Initrd, self.initrd.as_deref())?;
        let relay = if self.relaying() {
            Some(locate(Binary::Relay, self.relay.as_deref())?)
        } else {
            None
        };

        let facts = HostFacts {
            stdin_tty: io::stdin().is_terminal(),
            base_dirs: if self.base {
                BASE_DIRS
                    .iter()
                    .filter(|d| Path::new(d).is_dir())
                    .map(|d| (*d).to_owned())
                    .collect()
            } else {
                Vec::new()
            },
            relay,
            entropy: draw_entropy(self.entropy)?,
        };
        let config = self.plan(&facts);
        debug!(?config, "planned");

        Ok(Sandbox {
            config,
            kernel,
            initrd,
            relay: facts.relay.map(|path| (path, self.all_forwards())),
            memory: self.memory,
            escalation: self.timeout.map(|timeout| Escalation {
                timeout,
                grace: self.grace,
            }),
            no_stdin: self.no_stdin,
            guest_log: self.guest_log,
            kernel_messages: self.kernel_messages,
        })
    }

    /// Assembles the guest configuration. Deterministic given `facts`.
    pub(crate) fn plan(&self, facts: &HostFacts) -> Config {
        let mut mounts = vec![
            Mount::virtual_fs("tmpfs", "/tmp", Some("mode=1777")),
            Mount::virtual_fs("proc", "/proc", None),
            Mount::virtual_fs("sysfs", "/sys", None),
        ];
        mounts.extend(facts.base_dirs.iter().map(|d| Mount::hostfs(d.as_str(), d.as_str(), true)));
        mounts.extend(self.shares.iter().map(Share::to_mount));

        let mut runs = vec![
            Run::new("ip", ["addr", "add", "127.0.0.1/8", "dev", "lo"]),
            Run::new("ip", ["link", "set", "lo", "up"]),
        ];
        let mut tty_raw = Vec::new();

        if let Some(relay) = &facts.relay {
            let dir = relay.parent().map_or_else(|| "/".into(), Path::to_string_lossy);
            let name = relay
                .file_name()
                .map_or_else(|| Binary::Relay.file_name().into(), |n| n.to_string_lossy());
            mounts.push(Mount::hostfs(dir, RELAY_MOUNT, true));
            runs.push(
                Run::new(
                    format!("{RELAY_MOUNT}/{name}"),
                    relay_args(Side::Guest, &self.all_forwards()),
                )
                .daemon()
                .stdio(Stream::Tty(2), Stream::Tty(2), Stream::Console),
            );
            tty_raw.push("/tty2".to_owned());
        }
        if !facts.stdin_tty {
            tty_raw.push("/tty1".to_owned());
        }

        let (cmd, args) = self
            .command
            .split_first()
            .map_or((String::new(), &[][..]), |(c, a)| (c.clone(), a));
        let mut run = Run::new(cmd, args.iter().cloned())
            .stdio(Stream::Tty(1), Stream::Tty(1), Stream::Output);
        run.relay_output = self.pipe_output;
        if let Some(cwd) = &self.cwd {
            run = run.cwd(cwd.as_str());
        }
        if self.x11.is_some() {
            run = run.env("DISPLAY", ":0");
        }
        for (key, value) in &self.env {
            run = run.env(key.as_str(), value.as_str());
        }
        for limit in &self.limits {
            run = run.limit(*limit);
        }
        if !self.root {
            run = run.unprivileged(self.uid, self.gid);
        }
        runs.push(run);

        Config {
            tty_raw,
            mounts,
            runs,
            entropy: facts.entropy.clone(),
        }
    }
}

/// `<digits>[K|M|G]`, case-insensitive.
fn valid_memory(memory: &str) -> bool {
    let digits = memory.trim_end_matches(['k', 'K', 'm', 'M', 'g', 'G']);
    memory.len() - digits.len() <= 1
        && !digits.is_empty()
        && digits.bytes().all(|b| b.is_ascii_digit())
}

/// `bytes` of OS randomness, or `None` for zero.
fn draw_entropy(bytes: usize) -> Result<Option<Vec<u8>>> {
    use rand::TryRngCore;

    if bytes == 0 {
        return Ok(None);
    }
    let mut buf = vec![0u8; bytes];
    rand::rngs::OsRng
        .try_fill_bytes(&mut buf)
        .map_err(io::Error::other)?;
    Ok(Some(buf))
}

/// A configured sandbox, ready to launch.
#[derive(Debug)]
pub struct Sandbox {
    /// The guest configuration.
    config: Config,
    /// Guest kernel.
    kernel: PathBuf,
    /// Initrd with the guest supervisor.
    initrd: PathBuf,
    /// Relay binary and the forwards it serves.
    relay: Option<(PathBuf, Vec<Forward>)>,
    /// Guest memory.
    memory: String,
    /// Timeout escalation, if a timeout was requested.
    escalation: Option<Escalation>,
    /// Host stdin detached.
    no_stdin: bool,
    /// Guest log filter.
    guest_log: Option<String>,
    /// Show kernel boot messages.
    kernel_messages: bool,
}

impl Sandbox {
    /// Starts building a sandbox for `cmd args...`.
    pub fn builder<I, S>(cmd: impl Into<String>, args: I) -> SandboxBuilder
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut command = vec![cmd.into()];
        command.extend(args.into_iter().map(Into::into));
        SandboxBuilder {
            command,
            shares: Vec::new(),
            base: false,
            cwd: None,
            env: Vec::new(),
            no_stdin: false,
            root: false,
            uid: 0,
            gid: 0,
            entropy: 0,
            forwards: Vec::new(),
            x11: None,
            timeout: None,
            grace: supervise::DEFAULT_GRACE,
            memory: DEFAULT_MEMORY.to_owned(),
            limits: Vec::new(),
            pipe_output: false,
            kernel: None,
            initrd: None,
            relay: None,
            guest_log: None,
            kernel_messages: false,
        }
    }

    /// The configuration the guest will receive.
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Boots the guest, waits for it and returns the kernel's exit status.
    pub fn run(self) -> Result<ExitStatus> {
        let image = image::write(&self.config)?;
        let stdout = io::stdout().as_fd().try_clone_to_owned()?;
        let control = match self.escalation {
            Some(_) => {
                let (read, write) = pipe2(OFlag::O_CLOEXEC).map_err(io::Error::from)?;
                Some((read, File::from(write)))
            }
            None => None,
        };
        let relay = match &self.relay {
            Some((path, forwards)) => Some(HostRelay::spawn(path, forwards)?),
            None => None,
        };

        let consoles = [
            Console {
                input: control
                    .as_ref()
                    .map_or(Channel::Null, |(read, _)| Channel::Fd(read.as_raw_fd())),
                output: Channel::Fd(stdout.as_raw_fd()),
            },
            Console {
                input: if self.no_stdin {
                    Channel::Null
                } else {
                    Channel::Fd(0)
                },
                output: Channel::Fd(1),
            },
            relay.as_ref().map_or(Console::NULL, HostRelay::console),
        ];

        let mut cmd = Command::new(&self.kernel);
        cmd.arg(format!("ubda={}", image.path().display()))
            .arg(format!("initrd={}", self.initrd.display()))
            .arg(format!("mem={}", self.memory))
            .args(console::args(&consoles));
        if let Some(filter) = &self.guest_log {
            cmd.arg(format!("BRIG_LOG={filter}"));
        }
        if !self.kernel_messages {
            cmd.arg("quiet");
        }
        if self.no_stdin {
            cmd.stdin(Stdio::null());
        }
        let inherit: Vec<RawFd> = consoles
            .iter()
            .flat_map(Console::fds)
            .filter(|&fd| fd > 2)
            .collect();
        pre_exec::apply(&mut cmd, inherit);

        debug!(?cmd, "launching guest");
        let mut child = cmd.spawn()?;
        info!(pid = child.id(), "guest started");

        let terminal = (!self.no_stdin).then(|| Foreground::hand_to(&child)).flatten();
        let (control_read, control_write) = control.unzip();
        let status = supervise::supervise(&mut child, control_write, self.escalation);
        drop(terminal);

        // Only now that the guest is gone may its descriptors close.
        drop(control_read);
        drop(stdout);
        if let Some(relay) = relay {
            relay.stop();
        }
        drop(image);

        let status = status?;
        info!(%status, "guest exited");
        Ok(status)
    }
}

/// The host half of the relay pair, attached to the guest's second console.
#[derive(Debug)]
struct HostRelay {
    /// The relay process.
    child: Child,
    /// Read by the kernel: what the relay writes.
    guest_in: OwnedFd,
    /// Written by the kernel: what the relay reads.
    guest_out: OwnedFd,
}

impl HostRelay {
    /// Starts `<relay> host <forwards>...` wired to a pair of pipes.
    fn spawn(path: &Path, forwards: &[Forward]) -> Result<Self> {
        let (guest_in, relay_out) = pipe2(OFlag::O_CLOEXEC).map_err(io::Error::from)?;
        let (relay_in, guest_out) = pipe2(OFlag::O_CLOEXEC).map_err(io::Error::from)?;
        let child = Command::new(path)
            .args(relay_args(Side::Host, forwards))
            .stdin(relay_in)
            .stdout(relay_out)
            .spawn()?;
        info!(pid = child.id(), "host relay started");
        Ok(Self {
            child,
            guest_in,
            guest_out,
        })
    }

    /// The kernel side of the relay pipes.
    fn console(&self) -> Console {
        Console {
            input: Channel::Fd(self.guest_in.as_raw_fd()),
            output: Channel::Fd(self.guest_out.as_raw_fd()),
        }
    }

    /// Asks the relay to terminate and reaps it.
    fn stop(mut self) {
        if let Ok(pid) = i32::try_from(self.child.id())
            && let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM)
        {
            warn!("relay: {e}");
        }
        if let Err(e) = self.child.wait() {
            warn!("relay: {e}");
        }
    }
}

/// Terminal foreground handed to the guest's process group.
///
/// The kernel reads the controlling terminal from its own process group;
/// without the handoff every read would stop it with `SIGTTIN`.
#[derive(Debug)]
struct Foreground {
    /// Group to give the terminal back to.
    previous: Pid,
}

impl Foreground {
    /// Makes `child`'s group the foreground group if we currently own the terminal.
    fn hand_to(child: &Child) -> Option<Self> {
        use nix::unistd::{getpgrp, tcgetpgrp, tcsetpgrp};

        let stdin = io::stdin();
        if !stdin.is_terminal() {
            return None;
        }
        let previous = tcgetpgrp(stdin.as_fd()).ok()?;
        if previous != getpgrp() {
            return None;
        }
        let group = Pid::from_raw(i32::try_from(child.id()).ok()?);
        if let Err(e) = tcsetpgrp(stdin.as_fd(), group) {
            debug!("tcsetpgrp: {e}");
            return None;
        }
        // The kernel may already have stopped on a read before the handoff.
        let _ = killpg(group, Signal::SIGCONT);
        Some(Self { previous })
    }
}

impl Drop for Foreground {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        use nix::sys::signal::{SigHandler, signal};

        // A background group changing the foreground gets SIGTTOU.
        // SAFETY: installing SIG_IGN and restoring the previous disposition
        // does not run any handler code.
        let Ok(old) = (unsafe { signal(Signal::SIGTTOU, SigHandler::SigIgn) }) else {
            return;
        };
        if let Err(e) = nix::unistd::tcsetpgrp(io::stdin().as_fd(), self.previous) {
            debug!("tcsetpgrp: {e}");
        }
        let _ = unsafe { signal(Signal::SIGTTOU, old) };
    }
}
