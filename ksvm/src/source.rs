use anyhow::{Result, bail};
use sha2::{Digest, Sha256, Sha512};
use std::{fs::File, path::Path};
use tracing::{debug, info};

use crate::progress::ProgressBar;

/// Verify a file against a checksum of the form `algorithm:hex`. The special
/// value `none` skips verification.
pub fn verify_checksum(path: &Path, checksum: &str) -> Result<()> {
    if checksum.eq_ignore_ascii_case("none") {
        return Ok(());
    }

    let Some((algorithm, expected)) = checksum.split_once(':') else {
        bail!("Invalid checksum: {checksum}");
    };

    let mut file = File::open(path)?;
    let len = file.metadata()?.len();

    let hash = match algorithm.to_ascii_lowercase().as_str() {
        "sha256" => {
            info!(path = ?path, "Computing SHA256 checksum");
            let mut hasher = Sha256::new();
            ProgressBar::Hash.copy(&mut file, &mut hasher, len)?;
            hex::encode(hasher.finalize())
        }
        "sha512" => {
            info!(path = ?path, "Computing SHA512 checksum");
            let mut hasher = Sha512::new();
            ProgressBar::Hash.copy(&mut file, &mut hasher, len)?;
            hex::encode(hasher.finalize())
        }
        _ => bail!("Unsupported hash: {algorithm}"),
    };

    debug!(computed = %hash, expected = %expected, "Checksum");
    if !hash.eq_ignore_ascii_case(expected.trim()) {
        bail!("Checksum mismatch for {}", path.display());
    }
    Ok(())
}
