//! On-disk configuration image handed to the guest as its first block device.

use std::io::Write;

use brig_proto::Config;
use tempfile::NamedTempFile;

use crate::error::Result;

/// Encodes `cfg` into a temporary file. The file is removed on drop, so it
/// must outlive the guest.
pub fn write(cfg: &Config) -> Result<NamedTempFile> {
    let bytes = brig_proto::image::encode(cfg)?;
    let mut file = tempfile::Builder::new()
        .prefix("brig-")
        .suffix(".img")
        .tempfile()?;
    file.write_all(&bytes)?;
    file.as_file().sync_all()?;
    tracing::debug!(path = %file.path().display(), bytes = bytes.len(), "image written");
    Ok(file)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use brig_proto::Run;

    use super::*;

    #[test]
    fn image_file_decodes() {
        let cfg = Config {
            runs: vec![Run::new("true", Vec::<String>::new())],
            ..Config::default()
        };
        let file = write(&cfg).unwrap();
        let bytes = std::fs::read(file.path()).unwrap();
        assert_eq!(bytes.len() % brig_proto::image::BLOCK_SIZE, 0);
        assert_eq!(brig_proto::image::decode(&bytes).unwrap(), cfg);

        let path = file.path().to_path_buf();
        drop(file);
        assert!(!path.exists());
    }
}
