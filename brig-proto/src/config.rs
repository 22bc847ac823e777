//! Declarative sandbox description handed from host to guest.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Directory inside the guest that becomes `/` for every spawned command.
pub const CONFINEMENT_ROOT: &str = "/host";

/// Number of numbered terminal devices (`/tty1` ..= `/tty15`) the guest creates.
pub const TTY_COUNT: u8 = 15;

/// Root record: everything the guest supervisor does, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Terminal devices switched to non-canonical mode before anything runs.
    pub tty_raw: Vec<String>,
    /// Filesystems exposed beneath the confinement root.
    pub mounts: Vec<Mount>,
    /// Processes to execute, strictly in order.
    pub runs: Vec<Run>,
    /// Host-supplied bytes credited to the guest's random pool.
    pub entropy: Option<Vec<u8>>,
}

impl Config {
    /// Returns the mounts in the order they must be applied.
    ///
    /// Shorter targets first, then lexical, so a parent mount never shadows
    /// a deeper one established later.
    pub fn ordered_mounts(&self) -> Vec<&Mount> {
        let mut mounts: Vec<&Mount> = self.mounts.iter().collect();
        mounts.sort_by(|a, b| mount_order(a, b));
        mounts
    }
}

/// Total order used for mount application.
pub fn mount_order(a: &Mount, b: &Mount) -> std::cmp::Ordering {
    a.target
        .len()
        .cmp(&b.target.len())
        .then_with(|| a.target.cmp(&b.target))
}

/// Joins `path` onto [`CONFINEMENT_ROOT`], resolving `.` and `..` lexically.
///
/// `..` at the top stays at the root, as it would after `chroot`.
pub fn confined_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            name => parts.push(name),
        }
    }
    format!("{CONFINEMENT_ROOT}/{}", parts.join("/"))
}

/// One filesystem exposure beneath the confinement root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Guest path relative to the confinement root; created on demand.
    pub target: String,
    /// Source identifier passed to `mount(2)`.
    pub source: String,
    /// Filesystem type (`hostfs`, `tmpfs`, `proc`, ...).
    pub fstype: String,
    /// Type-specific data; for `hostfs` the real host path.
    pub data: Option<String>,
    /// Mount read-only.
    pub read_only: bool,
    /// Ignore set-uid/set-gid bits.
    pub nosuid: bool,
}

impl Mount {
    /// A passthrough mount of a host directory.
    pub fn hostfs(host: impl Into<String>, target: impl Into<String>, read_only: bool) -> Self {
        Self {
            target: target.into(),
            source: "none".to_owned(),
            fstype: "hostfs".to_owned(),
            data: Some(host.into()),
            read_only,
            nosuid: true,
        }
    }

    /// A pseudo or memory-backed filesystem with no host counterpart.
    pub fn virtual_fs(fstype: &str, target: impl Into<String>, data: Option<&str>) -> Self {
        Self {
            target: target.into(),
            source: fstype.to_owned(),
            fstype: fstype.to_owned(),
            data: data.map(str::to_owned),
            read_only: false,
            nosuid: true,
        }
    }
}

/// Where a child's standard stream is connected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stream {
    /// The discard device.
    #[default]
    Discard,
    /// The guest console.
    Console,
    /// Numbered guest terminal (`1..=TTY_COUNT`).
    Tty(u8),
    /// A regular file beneath the confinement root.
    File(String),
    /// Same descriptor as the output stream. Only meaningful for `error`.
    Output,
}

impl Stream {
    /// Path of the stream's target in the guest's own root, if it has one.
    ///
    /// `Output` has no path of its own.
    pub fn guest_path(&self) -> Option<String> {
        match self {
            Self::Discard => Some("/null".to_owned()),
            Self::Console => Some("/console".to_owned()),
            Self::Tty(n) => Some(format!("/tty{n}")),
            Self::File(path) => Some(confined_path(path)),
            Self::Output => None,
        }
    }
}

/// An environment assignment applied to a child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    /// Variable name.
    pub key: String,
    /// Variable value.
    pub value: String,
}

/// One process to execute inside the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    /// Fire-and-forget: the supervisor does not wait for it.
    pub daemon: bool,
    /// Executable name or path.
    pub cmd: String,
    /// Arguments, excluding argv\[0\].
    pub args: Vec<String>,
    /// Working directory beneath the confinement root.
    pub cwd: Option<String>,
    /// Standard input.
    pub input: Stream,
    /// Standard output.
    pub output: Stream,
    /// Standard error.
    pub error: Stream,
    /// Route output and error through a relay process so the child writes to a pipe.
    pub relay_output: bool,
    /// Environment overrides, later entries win on duplicate keys.
    pub env: Vec<EnvVar>,
    /// Drop root before exec.
    pub drop_privileges: bool,
    /// Explicit user id; `0` with `drop_privileges` means "derive one".
    pub uid: u32,
    /// Explicit group id; `0` with `drop_privileges` means "derive one".
    pub gid: u32,
    /// Resource ceilings applied just before exec.
    pub limits: Vec<Limit>,
}

impl Run {
    /// A foreground command with discarded stdio, running as root.
    pub fn new<I, S>(cmd: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            daemon: false,
            cmd: cmd.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
            input: Stream::Discard,
            output: Stream::Discard,
            error: Stream::Output,
            relay_output: false,
            env: Vec::new(),
            drop_privileges: false,
            uid: 0,
            gid: 0,
            limits: Vec::new(),
        }
    }

    /// Marks the run as a daemon.
    #[must_use]
    pub const fn daemon(mut self) -> Self {
        self.daemon = true;
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Sets all three standard streams.
    #[must_use]
    pub fn stdio(mut self, input: Stream, output: Stream, error: Stream) -> Self {
        self.input = input;
        self.output = output;
        self.error = error;
        self
    }

    /// Appends an environment assignment.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push(EnvVar {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    /// Requests a privilege drop to `uid`/`gid` (`0` derives a sandbox id).
    #[must_use]
    pub const fn unprivileged(mut self, uid: u32, gid: u32) -> Self {
        self.drop_privileges = true;
        self.uid = uid;
        self.gid = gid;
        self
    }

    /// Appends a resource limit.
    #[must_use]
    pub fn limit(mut self, limit: Limit) -> Self {
        self.limits.push(limit);
        self
    }

    /// Overlays this run's environment assignments on `base`.
    pub fn effective_env<K, V>(&self, base: impl IntoIterator<Item = (K, V)>) -> BTreeMap<String, String>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut env: BTreeMap<String, String> =
            base.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        for var in &self.env {
            env.insert(var.key.clone(), var.value.clone());
        }
        env
    }
}

/// A resource ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limit {
    /// Which resource.
    pub resource: Resource,
    /// Soft limit; negative means unbounded.
    pub soft: i64,
    /// Hard limit; negative means unbounded.
    pub hard: i64,
}

/// Resource kinds a [`Limit`] may constrain.
///
/// The set is closed: a payload naming anything else fails to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Resource {
    /// Address space size.
    As,
    /// Core dump size.
    Core,
    /// CPU time in seconds.
    Cpu,
    /// Data segment size.
    Data,
    /// Largest file that may be created.
    Fsize,
    /// Locked memory.
    Memlock,
    /// Open file descriptors.
    Nofile,
    /// Processes for the real user id.
    Nproc,
    /// Stack size.
    Stack,
}

impl Resource {
    /// Every resource kind, in declaration order.
    pub const ALL: [Self; 9] = [
        Self::As,
        Self::Core,
        Self::Cpu,
        Self::Data,
        Self::Fsize,
        Self::Memlock,
        Self::Nofile,
        Self::Nproc,
        Self::Stack,
    ];

    /// Lowercase name as accepted on the command line.
    pub const fn name(self) -> &'static str {
        match self {
            Self::As => "as",
            Self::Core => "core",
            Self::Cpu => "cpu",
            Self::Data => "data",
            Self::Fsize => "fsize",
            Self::Memlock => "memlock",
            Self::Nofile => "nofile",
            Self::Nproc => "nproc",
            Self::Stack => "stack",
        }
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Resource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        let name = lower.strip_prefix("rlimit_").unwrap_or(&lower);
        Self::ALL
            .into_iter()
            .find(|r| r.name() == name)
            .ok_or_else(|| format!("unknown resource: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(target: &str) -> Mount {
        Mount::virtual_fs("tmpfs", target, None)
    }

    #[test]
    fn mounts_apply_shallow_first() {
        let cfg = Config {
            mounts: vec![at("/a"), at("/a/b"), at("/")],
            ..Config::default()
        };
        let order: Vec<&str> = cfg
            .ordered_mounts()
            .iter()
            .map(|m| m.target.as_str())
            .collect();
        assert_eq!(order, ["/", "/a", "/a/b"]);
    }

    #[test]
    fn equal_length_targets_sort_lexically() {
        let cfg = Config {
            mounts: vec![at("/usr"), at("/bin"), at("/etc")],
            ..Config::default()
        };
        let order: Vec<&str> = cfg
            .ordered_mounts()
            .iter()
            .map(|m| m.target.as_str())
            .collect();
        assert_eq!(order, ["/bin", "/etc", "/usr"]);
    }

    #[test]
    fn later_env_entry_wins() {
        let run = Run::new("true", Vec::<String>::new())
            .env("X", "1")
            .env("X", "2");
        let env = run.effective_env([("PATH", "/bin")]);
        assert_eq!(env.get("X").map(String::as_str), Some("2"));
        assert_eq!(env.get("PATH").map(String::as_str), Some("/bin"));
    }

    #[test]
    fn env_overrides_base() {
        let run = Run::new("true", Vec::<String>::new()).env("HOME", "/work");
        let env = run.effective_env([("HOME", "/tmp")]);
        assert_eq!(env["HOME"], "/work");
    }

    #[test]
    fn stream_paths() {
        assert_eq!(Stream::Discard.guest_path().as_deref(), Some("/null"));
        assert_eq!(Stream::Tty(2).guest_path().as_deref(), Some("/tty2"));
        assert_eq!(
            Stream::File("/out/log".into()).guest_path().as_deref(),
            Some("/host/out/log")
        );
        assert_eq!(Stream::Output.guest_path(), None);
    }

    #[test]
    fn file_paths_cannot_climb_out_of_the_root() {
        for path in ["../ubda", "/../console", "a/../../tty1", "./../../null"] {
            let resolved = Stream::File(path.into()).guest_path().unwrap_or_default();
            assert!(resolved.starts_with("/host/"), "{path} -> {resolved}");
        }
        assert_eq!(confined_path("../ubda"), "/host/ubda");
        assert_eq!(confined_path("/src/./a/../b"), "/host/src/b");
        assert_eq!(confined_path("/"), "/host/");
    }

    #[test]
    fn resource_names_roundtrip() {
        for r in Resource::ALL {
            assert_eq!(r.name().parse::<Resource>(), Ok(r));
        }
        assert_eq!("RLIMIT_NOFILE".parse::<Resource>(), Ok(Resource::Nofile));
        assert!("rss".parse::<Resource>().is_err());
    }
}
