//! PID 1 boot sequence: bare devices, configuration, then the run engine.

use std::env;
use std::fs::{self, File};
use std::sync::OnceLock;
use std::time::Instant;

use brig_proto::{CONFINEMENT_ROOT, Config, image};
use tracing::{debug, info, trace, warn};

use crate::devices::{self, IMAGE};
use crate::error::{GuestError, StepExt};
use crate::mounts;
use crate::run;
use crate::sys;

/// Boot timestamp, set once at startup.
pub static BOOT_T0: OnceLock<Instant> = OnceLock::new();

/// Milliseconds elapsed since startup.
#[allow(clippy::cast_possible_truncation)]
pub fn uptime_ms() -> u64 {
    BOOT_T0.get().map_or(0, |t| t.elapsed().as_millis() as u64)
}

/// Default search path for guest commands.
pub const DEFAULT_PATH: &str = "/usr/local/bin:/bin:/usr/bin";

/// The whole environment inherited by every run.
pub const BASE_ENV: [(&str, &str); 3] = [
    ("PATH", DEFAULT_PATH),
    ("TERM", "linux"),
    ("HOME", "/tmp"),
];

/// Boots the guest. Returning `Ok` means every run finished or timed out.
pub fn run() -> Result<(), GuestError> {
    BOOT_T0.set(Instant::now()).ok();

    devices::attach_console()?;
    if let Err(e) = mounts::disable_echo(std::io::stdin()) {
        warn!("console echo left on: {e}");
    }
    info!("T+{}ms: console attached", uptime_ms());

    devices::create_nodes()?;
    reset_env();
    fs::create_dir(CONFINEMENT_ROOT).bootstrap("mkdir /host")?;
    sys::install_sigchld_wakeup().bootstrap("sigaction SIGCHLD")?;

    let cfg = load_config()?;
    info!("T+{}ms: configuration loaded", uptime_ms());

    execute(&cfg)
}

/// Replaces whatever the kernel passed with [`BASE_ENV`].
#[allow(unsafe_code)]
fn reset_env() {
    let inherited: Vec<_> = env::vars_os().map(|(k, _)| k).collect();
    // SAFETY (for both loops): the supervisor is single-threaded.
    for key in inherited {
        unsafe { env::remove_var(key) };
    }
    for (key, value) in BASE_ENV {
        unsafe { env::set_var(key, value) };
    }
}

/// Reads and decodes the configuration image from the block device.
fn load_config() -> Result<Config, GuestError> {
    let mut dev = File::open(IMAGE).bootstrap("open /ubda")?;
    let (cfg, len) = image::read_from(&mut dev)?;
    dump_config(len, &cfg);
    Ok(cfg)
}

/// Logs what was decoded, in increasing detail by level.
fn dump_config(len: u32, cfg: &Config) {
    debug!(
        bytes = len,
        mounts = cfg.mounts.len(),
        runs = cfg.runs.len(),
        tty_raw = cfg.tty_raw.len(),
        entropy = cfg.entropy.as_ref().map_or(0, Vec::len),
        "configuration"
    );
    for m in &cfg.mounts {
        trace!(?m, "mount entry");
    }
    for r in &cfg.runs {
        trace!(?r, "run entry");
    }
}

/// Applies the configuration: entropy, raw terminals, mounts, runs.
fn execute(cfg: &Config) -> Result<(), GuestError> {
    if let Some(seed) = cfg.entropy.as_deref().filter(|s| !s.is_empty()) {
        mounts::add_entropy(seed)?;
    }
    for dev in &cfg.tty_raw {
        mounts::make_raw(dev)?;
    }
    for entry in cfg.ordered_mounts() {
        mounts::mount(entry)?;
    }
    info!("T+{}ms: filesystems mounted", uptime_ms());

    let done = run::run_sequence(&cfg.runs, run::execute)?;
    info!("T+{}ms: {done}/{} runs executed", uptime_ms(), cfg.runs.len());
    Ok(())
}
