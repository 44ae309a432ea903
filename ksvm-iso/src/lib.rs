//! Rebuilds a distribution's installation ISO so that it boots straight into an
//! unattended kickstart install.
//!
//! The source image is extracted into a scoped working directory, the first
//! kernel command line of each bootloader configuration is extended with the
//! kickstart parameters, the kickstart file itself is embedded at the image
//! root as a fallback and the tree is mastered into a new hybrid image.
//!
//! All external programs are reached through [`IsoTools`] so the decision logic
//! in [`ImageBuilder`] can be exercised without xorriso being installed.

use std::path::{Path, PathBuf};

pub mod bootcfg;
pub mod builder;
pub mod error;
pub mod tools;

pub use builder::{BuildOptions, BuildRequest, ImageBuilder};
pub use error::BuildError;
pub use tools::{HostTools, IsoTools, MasterRequest, Tool};

/// Build a kickstart image with the tools found on the host and default options.
pub fn build(
    source_image: impl AsRef<Path>,
    kickstart_file: impl AsRef<Path>,
    output_image: impl AsRef<Path>,
    kickstart_url: &str,
) -> Result<PathBuf, BuildError> {
    let tools = HostTools::detect();
    ImageBuilder::new(&tools, BuildOptions::default()).build(&BuildRequest {
        source_image: source_image.as_ref().to_path_buf(),
        kickstart_file: kickstart_file.as_ref().to_path_buf(),
        output_image: output_image.as_ref().to_path_buf(),
        kickstart_url: kickstart_url.to_string(),
    })
}
