//! brig guest supervisor, run as PID 1 inside the sandbox kernel.
//!
//! Builds a minimal device tree, reads the configuration image from the
//! first block device, mounts the sandbox filesystems beneath the
//! confinement root and executes the configured runs in order. The guest
//! is powered off on every exit path.
#![allow(clippy::print_stderr)]

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("brig-init only runs as init inside a Linux sandbox kernel");
    std::process::exit(1);
}

#[cfg(target_os = "linux")]
mod boot;
#[cfg(target_os = "linux")]
mod devices;
#[cfg(target_os = "linux")]
mod error;
#[cfg(target_os = "linux")]
mod fail;
#[cfg(target_os = "linux")]
mod mounts;
#[cfg(target_os = "linux")]
mod run;
#[cfg(target_os = "linux")]
mod sys;

/// Environment variable (passed on the kernel command line) selecting the log filter.
#[cfg(target_os = "linux")]
const LOG_ENV: &str = "BRIG_LOG";

#[cfg(target_os = "linux")]
fn main() {
    init_logging();
    match boot::run() {
        Ok(()) => fail::power_off(),
        Err(e) => fail::fatal(fail::Role::Supervisor, &e),
    }
}

/// Installs a plain stderr subscriber. Must run before the environment is reset.
#[cfg(target_os = "linux")]
fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(false)
        .without_time()
        .try_init();
}
