use anyhow::Result;
use ksvm_iso::{BuildOptions, BuildRequest, HostTools, ImageBuilder};
use std::{path::PathBuf, process::ExitCode};
use tracing::{debug, error};

use super::IsoCommands;
use crate::{config::Config, source::verify_checksum};

pub fn run(cmd: IsoCommands, config: &Config) -> ExitCode {
    match cmd {
        IsoCommands::Build {} => match build(config) {
            Ok(output) => {
                println!("Image: {}", output.display());
                println!("Kickstart URL: {}", config.kickstart_url());
                ExitCode::SUCCESS
            }
            Err(err) => {
                error!(error = ?err, "Failed to build image");
                ExitCode::FAILURE
            }
        },
    }
}

/// Build the kickstart image described by the configuration.
pub fn build(config: &Config) -> Result<PathBuf> {
    if let Some(checksum) = &config.iso.checksum {
        if config.iso.source.is_file() {
            verify_checksum(&config.iso.source, checksum)?;
        }
    }

    let tools = HostTools::detect().with_mount_fallback(config.iso.allow_mount);
    let options = BuildOptions {
        work_root: config.iso.work_dir.clone(),
        ..BuildOptions::default()
    };
    let request = BuildRequest {
        source_image: config.iso.source.clone(),
        kickstart_file: config.kickstart_path(),
        output_image: config.iso.output.clone(),
        kickstart_url: config.kickstart_url(),
    };
    debug!(request = ?request, "Building image");

    Ok(ImageBuilder::new(&tools, options).build(&request)?)
}
