//! `brig inspect`: decode a configuration image.

use std::fmt::Write as _;
use std::path::PathBuf;

use anyhow::{Context, Result};
use brig_proto::{Config, Run, Stream};

/// Arguments for `brig inspect`.
#[derive(clap::Args)]
pub struct InspectArgs {
    /// Image file, as written for the guest's first block device.
    image: PathBuf,

    /// Print JSON instead of a summary.
    #[arg(long)]
    json: bool,
}

impl InspectArgs {
    pub fn run(self) -> Result<()> {
        let bytes = std::fs::read(&self.image)
            .with_context(|| format!("failed to read {}", self.image.display()))?;
        let cfg = brig_proto::image::decode(&bytes)
            .with_context(|| format!("failed to decode {}", self.image.display()))?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&cfg)?);
        } else {
            print!("{}", render(&cfg));
        }
        Ok(())
    }
}

/// Short form of a stream.
fn stream(s: &Stream) -> String {
    match s {
        Stream::Output => "output".to_owned(),
        other => other.guest_path().unwrap_or_default(),
    }
}

/// One line per run.
fn run_line(run: &Run) -> String {
    let mut line = String::new();
    let _ = write!(line, "{}", run.cmd);
    for arg in &run.args {
        let _ = write!(line, " {arg}");
    }
    let _ = write!(
        line,
        "  [in {} out {} err {}]",
        stream(&run.input),
        stream(&run.output),
        stream(&run.error)
    );
    if run.daemon {
        line.push_str(" daemon");
    }
    if run.relay_output {
        line.push_str(" relayed");
    }
    if run.drop_privileges {
        let _ = write!(line, " uid={} gid={}", run.uid, run.gid);
    }
    if let Some(cwd) = &run.cwd {
        let _ = write!(line, " cwd={cwd}");
    }
    for var in &run.env {
        let _ = write!(line, " {}={}", var.key, var.value);
    }
    for limit in &run.limits {
        let _ = write!(line, " {}={}:{}", limit.resource, limit.soft, limit.hard);
    }
    line
}

/// Human-readable dump.
fn render(cfg: &Config) -> String {
    let mut out = String::new();
    if let Some(entropy) = &cfg.entropy {
        let _ = writeln!(out, "entropy: {} bytes", entropy.len());
    }
    if !cfg.tty_raw.is_empty() {
        let _ = writeln!(out, "raw ttys: {}", cfg.tty_raw.join(" "));
    }
    let _ = writeln!(out, "mounts:");
    for m in cfg.ordered_mounts() {
        let _ = writeln!(
            out,
            "  {} {} {}{}{}",
            m.fstype,
            m.data.as_deref().unwrap_or(&m.source),
            m.target,
            if m.read_only { " ro" } else { "" },
            if m.nosuid { " nosuid" } else { "" },
        );
    }
    let _ = writeln!(out, "runs:");
    for (i, run) in cfg.runs.iter().enumerate() {
        let _ = writeln!(out, "  {}. {}", i + 1, run_line(run));
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use brig_proto::{Limit, Mount, Resource};

    use super::*;

    #[test]
    fn summary_lists_mounts_in_apply_order() {
        let cfg = Config {
            mounts: vec![
                Mount::hostfs("/home/me", "/home/me", true),
                Mount::virtual_fs("tmpfs", "/tmp", Some("mode=1777")),
            ],
            runs: vec![
                Run::new("id", ["-u"])
                    .stdio(Stream::Tty(1), Stream::Tty(1), Stream::Output)
                    .unprivileged(1000, 1000)
                    .limit(Limit {
                        resource: Resource::Nofile,
                        soft: 64,
                        hard: -1,
                    }),
            ],
            entropy: Some(vec![0; 8]),
            ..Config::default()
        };
        let text = render(&cfg);
        let tmp = text.find("tmpfs mode=1777 /tmp").unwrap();
        let home = text.find("hostfs /home/me /home/me ro nosuid").unwrap();
        assert!(tmp < home);
        assert!(text.contains("entropy: 8 bytes"));
        assert!(text.contains(
            "1. id -u  [in /tty1 out /tty1 err output] uid=1000 gid=1000 nofile=64:-1"
        ));
    }

    #[test]
    fn reads_image_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.img");
        let cfg = Config {
            runs: vec![Run::new("true", Vec::<String>::new())],
            ..Config::default()
        };
        std::fs::write(&path, brig_proto::image::encode(&cfg).unwrap()).unwrap();

        let args = InspectArgs {
            image: path,
            json: true,
        };
        assert!(args.run().is_ok());

        let garbage = dir.path().join("bad.img");
        std::fs::write(&garbage, [0u8; 512]).unwrap();
        let args = InspectArgs {
            image: garbage,
            json: false,
        };
        let err = args.run().unwrap_err();
        assert!(format!("{err:#}").contains("unexpected header"));
    }
}
