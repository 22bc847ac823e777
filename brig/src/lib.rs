//! Run commands inside a throwaway user-mode Linux guest.
//!
//! `brig` boots a user-mode kernel whose first process is the `brig-init`
//! supervisor. The supervisor reads a [`Config`] from its first block
//! device, mounts the requested host directories beneath a private root and
//! runs the command there, usually as an unprivileged random identity. The
//! guest is discarded when the command ends.
//!
//! # Quick start
//!
//! ```no_run
//! use brig::{Sandbox, Share};
//!
//! let status = Sandbox::builder("cargo", ["test"])
//!     .base(true)
//!     .share(Share::parse("/home/me/project:/src", true)?)
//!     .cwd("/src")
//!     .build()?
//!     .run()?;
//! std::process::exit(brig::exit_code(status));
//! # Ok::<(), brig::Error>(())
//! ```

mod console;
mod error;
mod forward;
mod image;
mod limit;
mod locate;
mod pre_exec;
mod sandbox;
mod share;
mod supervise;

pub use brig_proto::{Config, Limit, Resource};
pub use console::{Channel, Console};
pub use error::{Error, Result};
pub use forward::{Endpoint, Forward, Side, relay_args};
pub use limit::parse_limit;
pub use locate::{Binary, locate};
pub use sandbox::{BASE_DIRS, DEFAULT_MEMORY, RELAY_MOUNT, Sandbox, SandboxBuilder};
pub use share::Share;
pub use supervise::{DEFAULT_GRACE, Escalation, exit_code, supervise, wait_timeout};
