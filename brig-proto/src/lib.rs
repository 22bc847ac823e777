//! Boot protocol shared by the brig host and the guest supervisor.
//!
//! The host describes a sandbox as a [`Config`], serializes it with
//! [`image::encode`] into a sector-padded block image, and attaches that
//! image to the guest as its first block device. The guest reads it back
//! with [`image::read_from`]. While a foreground command runs, the host can
//! escalate a timeout by writing [`ControlToken`]s to the guest console.

mod config;
mod control;
pub mod image;

pub use config::{
    CONFINEMENT_ROOT, Config, EnvVar, Limit, Mount, Resource, Run, Stream, TTY_COUNT, confined_path,
    mount_order,
};
pub use control::ControlToken;
pub use image::{DecodeError, EncodeError};
