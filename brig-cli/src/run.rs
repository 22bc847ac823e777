//! `brig run`: boot a guest and run one command in it.
//!
//! Usage: `brig run [OPTIONS] COMMAND [ARG...]`

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use brig::{Forward, Limit, Sandbox, Share};

/// Parses a read-only share.
fn share_ro(spec: &str) -> brig::Result<Share> {
    Share::parse(spec, false)
}

/// Parses a read-write share.
fn share_rw(spec: &str) -> brig::Result<Share> {
    Share::parse(spec, true)
}

/// Parses `KEY=VALUE`.
fn env_pair(spec: &str) -> Result<(String, String), String> {
    match spec.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_owned(), value.to_owned())),
        _ => Err(format!("expected KEY=VALUE, got {spec:?}")),
    }
}

/// Arguments for `brig run`.
#[derive(clap::Args)]
#[command(trailing_var_arg = true)]
pub struct RunArgs {
    /// Share a host directory read-only (format: HOST[:GUEST]).
    #[arg(short = 'r', long = "ro", value_name = "HOST[:GUEST]", value_parser = share_ro)]
    read_only: Vec<Share>,

    /// Share a host directory read-write (format: HOST[:GUEST]).
    #[arg(short = 'w', long = "rw", value_name = "HOST[:GUEST]", value_parser = share_rw)]
    read_write: Vec<Share>,

    /// Share the host's system directories (/bin, /lib, /usr, /etc, ...) read-only.
    #[arg(short = 'B', long)]
    base: bool,

    /// Working directory inside the guest.
    #[arg(short = 'C', long)]
    cwd: Option<String>,

    /// Set an environment variable for the command.
    #[arg(short = 'e', long = "env", value_name = "KEY=VALUE", value_parser = env_pair)]
    env: Vec<(String, String)>,

    /// Do not connect host stdin to the command.
    #[arg(short = 'n', long)]
    no_stdin: bool,

    /// Run the command as root instead of an unprivileged user.
    #[arg(long)]
    root: bool,

    /// User id for the command (default: random).
    #[arg(long, default_value_t = 0)]
    uid: u32,

    /// Group id for the command (default: random).
    #[arg(long, default_value_t = 0)]
    gid: u32,

    /// Seed the guest random pool with this many bytes of host randomness.
    #[arg(long, value_name = "BYTES", default_value_t = 0)]
    entropy: usize,

    /// Forward a host port into the guest (format: HOST_PORT:GUEST_PORT).
    #[arg(short = 'L', long = "local", value_name = "H:G", value_parser = Forward::parse_local)]
    local: Vec<Forward>,

    /// Forward a guest port out to the host side (format: GUEST_PORT:ADDR:PORT).
    #[arg(short = 'R', long = "remote", value_name = "G:A:P", value_parser = Forward::parse_remote)]
    remote: Vec<Forward>,

    /// Forward the X11 display named by $DISPLAY.
    #[arg(short = 'X', long)]
    x11: bool,

    /// Seconds before the command is asked to stop (0 = never).
    #[arg(short = 'T', long, value_name = "SECONDS", default_value_t = 0)]
    timeout: u64,

    /// Guest memory.
    #[arg(short = 'm', long, default_value = brig::DEFAULT_MEMORY)]
    memory: String,

    /// Resource limit for the command (format: RES=SOFT[:HARD]).
    #[arg(short = 'l', long = "limit", value_name = "RES=SOFT[:HARD]", value_parser = brig::parse_limit)]
    limits: Vec<Limit>,

    /// Pass the command's output through a relay process instead of the terminal directly.
    #[arg(long)]
    pipe_output: bool,

    /// Guest kernel.
    #[arg(long, env = "BRIG_KERNEL")]
    kernel: Option<PathBuf>,

    /// Initrd containing the guest supervisor.
    #[arg(long, env = "BRIG_INITRD")]
    initrd: Option<PathBuf>,

    /// Relay binary used for forwarding.
    #[arg(long, env = "BRIG_RELAY")]
    relay: Option<PathBuf>,

    /// More output from host and guest; repeat for more.
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Command and arguments to run inside the guest.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

impl RunArgs {
    /// Builds the sandbox described by the flags.
    fn sandbox(self) -> Result<brig::SandboxBuilder> {
        let mut command = self.command.into_iter();
        let cmd = command.next().context("no command given")?;

        let mut b = Sandbox::builder(cmd, command)
            .base(self.base)
            .no_stdin(self.no_stdin)
            .root(self.root)
            .uid(self.uid)
            .gid(self.gid)
            .entropy(self.entropy)
            .memory(self.memory)
            .pipe_output(self.pipe_output);

        for share in self.read_only.into_iter().chain(self.read_write) {
            b = b.share(share);
        }
        if let Some(cwd) = self.cwd {
            b = b.cwd(cwd);
        }
        for (key, value) in self.env {
            b = b.env(key, value);
        }
        for forward in self.local.into_iter().chain(self.remote) {
            b = b.forward(forward);
        }
        if self.x11 {
            let display = std::env::var("DISPLAY").context("--x11 needs $DISPLAY")?;
            b = b.x11(Forward::x11(&display)?);
        }
        if self.timeout > 0 {
            b = b.timeout(Duration::from_secs(self.timeout));
        }
        for limit in self.limits {
            b = b.limit(limit);
        }
        if let Some(path) = self.kernel {
            b = b.kernel(path);
        }
        if let Some(path) = self.initrd {
            b = b.initrd(path);
        }
        if let Some(path) = self.relay {
            b = b.relay(path);
        }
        if let Some(level) = crate::level_for(self.verbose) {
            b = b.guest_log(level).kernel_messages(self.verbose > 1);
        }
        Ok(b)
    }

    /// Runs the guest and returns the exit code to propagate.
    pub fn run(self) -> Result<i32> {
        let sandbox = self.sandbox()?.build()?;
        let status = sandbox.run().context("failed to run guest")?;
        Ok(brig::exit_code(status))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use clap::Parser;
    use rstest::rstest;

    use super::*;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        run: RunArgs,
    }

    fn parse(args: &[&str]) -> Result<RunArgs, clap::Error> {
        Harness::try_parse_from(std::iter::once("brig").chain(args.iter().copied()))
            .map(|h| h.run)
    }

    #[test]
    fn trailing_command_keeps_its_flags() {
        let args = parse(&["-T", "5", "-e", "A=1", "ls", "-la", "--color"]).unwrap();
        assert_eq!(args.timeout, 5);
        assert_eq!(args.env, [("A".to_owned(), "1".to_owned())]);
        assert_eq!(args.command, ["ls", "-la", "--color"]);
    }

    #[test]
    fn defaults() {
        let args = parse(&["true"]).unwrap();
        assert_eq!(args.memory, "256M");
        assert_eq!((args.uid, args.gid, args.entropy, args.timeout), (0, 0, 0, 0));
        assert!(!args.root && !args.base && !args.no_stdin && !args.x11);
        assert_eq!(args.verbose, 0);
    }

    #[test]
    fn forwards_and_limits_are_parsed_up_front() {
        let args = parse(&["-L", "8080:80", "-R", "9000:db:5432", "-l", "nofile=64", "true"]).unwrap();
        assert_eq!(args.local.len(), 1);
        assert_eq!(args.remote.len(), 1);
        assert_eq!(args.limits[0].soft, 64);
    }

    #[rstest]
    #[case(&["-L", "8080", "true"])]
    #[case(&["-R", "1:2", "true"])]
    #[case(&["-l", "bogus=1", "true"])]
    #[case(&["-e", "=1", "true"])]
    #[case(&["-r", "/definitely/not/here", "true"])]
    #[case(&[])]
    fn malformed_input_is_a_usage_error(#[case] args: &[&str]) {
        assert!(parse(args).is_err());
    }

    #[test]
    fn shares_resolve_on_parse() {
        let dir = tempfile::tempdir().unwrap();
        let spec = format!("{}:/data", dir.path().display());
        let args = parse(&["-w", &spec, "-vv", "true"]).unwrap();
        assert_eq!(args.read_write[0].guest, "/data");
        assert!(args.read_write[0].writable);
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn builder_receives_the_command() {
        let args = parse(&["--root", "sh", "-c", "exit 3"]).unwrap();
        assert!(args.sandbox().is_ok());
    }
}
