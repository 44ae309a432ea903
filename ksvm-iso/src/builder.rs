use anyhow::anyhow;
use std::{
    fs,
    io::Read,
    path::{Path, PathBuf},
    time::SystemTime,
};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::{
    bootcfg,
    error::BuildError,
    tools::{BiosBoot, IsoTools, MasterRequest, Tool},
};

/// Volume id used when the source image's own id cannot be read.
pub const DEFAULT_VOLUME_ID: &str = "KSVM";

/// Inputs for a single build.
#[derive(Clone, Debug)]
pub struct BuildRequest {
    /// The installation image to start from (never modified)
    pub source_image: PathBuf,

    /// The kickstart file to reference and embed
    pub kickstart_file: PathBuf,

    /// Where the new image is written
    pub output_image: PathBuf,

    /// The URL the installer fetches the kickstart file from
    pub kickstart_url: String,
}

/// Layout conventions of the source distribution's images.
#[derive(Clone, Debug)]
pub struct BuildOptions {
    /// Directory to create the working directory in (system temp by default)
    pub work_root: Option<PathBuf>,

    pub default_volume_id: String,

    /// Legacy BIOS boot image, relative to the image root
    pub bios_boot_image: String,

    /// El Torito boot catalog, relative to the image root
    pub bios_boot_catalog: String,

    /// EFI boot image, relative to the image root
    pub efi_boot_image: String,

    /// Hybrid MBR template shipped inside the image, relative to the image root
    pub mbr_template: String,

    /// Hybrid MBR template installed on the host (syslinux)
    pub host_mbr_template: Option<PathBuf>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            work_root: None,
            default_volume_id: DEFAULT_VOLUME_ID.to_string(),
            bios_boot_image: String::from("isolinux/isolinux.bin"),
            bios_boot_catalog: String::from("isolinux/boot.cat"),
            efi_boot_image: String::from("images/efiboot.img"),
            mbr_template: String::from("isolinux/isohdpfx.bin"),
            host_mbr_template: Some(PathBuf::from("/usr/share/syslinux/isohdpfx.bin")),
        }
    }
}

/// Produces kickstart-wired installation images.
pub struct ImageBuilder<'a, T: IsoTools + ?Sized> {
    tools: &'a T,
    options: BuildOptions,
}

impl<'a, T: IsoTools + ?Sized> ImageBuilder<'a, T> {
    pub fn new(tools: &'a T, options: BuildOptions) -> Self {
        Self { tools, options }
    }

    /// Build a new image according to the request and return its path.
    ///
    /// The working directory is removed before this returns, whether the build
    /// succeeded or not.
    pub fn build(&self, request: &BuildRequest) -> Result<PathBuf, BuildError> {
        let start_time = SystemTime::now();
        self.check_preconditions(request)?;

        let work = match &self.options.work_root {
            Some(root) => tempfile::Builder::new().prefix("ksvm-").tempdir_in(root)?,
            None => tempfile::Builder::new().prefix("ksvm-").tempdir()?,
        };
        let root = work.path();
        debug!(work = ?root, "Created working directory");

        self.tools
            .extract(&request.source_image, root)
            .map_err(|source| BuildError::ExtractionFailed {
                image: request.source_image.clone(),
                source,
            })?;
        make_writable(root)?;

        let kickstart_name = request
            .kickstart_file
            .file_name()
            .ok_or_else(|| BuildError::MissingInput {
                what: "kickstart file",
                path: request.kickstart_file.clone(),
            })?;
        fs::copy(&request.kickstart_file, root.join(kickstart_name))?;
        debug!(name = ?kickstart_name, "Embedded kickstart file");

        self.patch_boot_configs(root, request)?;

        let volume_id = self.volume_id(&request.source_image);
        self.master(root, &request.output_image, volume_id)?;

        if self.tools.available(Tool::ChecksumImplant) {
            if let Err(error) = self.tools.implant_checksum(&request.output_image) {
                warn!(error = ?error, "Failed to implant checksum, media check will not work");
            }
        } else {
            info!("{} not found, skipping checksum", Tool::ChecksumImplant);
        }

        info!(
            output = ?request.output_image,
            url = %request.kickstart_url,
            duration = ?start_time.elapsed().unwrap_or_default(),
            "Image built",
        );
        Ok(request.output_image.clone())
    }

    fn check_preconditions(&self, request: &BuildRequest) -> Result<(), BuildError> {
        for (what, path) in [
            ("source image", &request.source_image),
            ("kickstart file", &request.kickstart_file),
        ] {
            // Reading a byte catches files that open but cannot be read
            let readable = path.is_file()
                && fs::File::open(path)
                    .and_then(|mut file| file.read(&mut [0u8; 1]))
                    .is_ok();
            if !readable {
                return Err(BuildError::MissingInput {
                    what,
                    path: path.clone(),
                });
            }
        }

        for tool in [Tool::Mastering, Tool::Metadata] {
            if !self.tools.available(tool) {
                return Err(BuildError::MissingDependency { tool });
            }
        }

        if let (Ok(source), Ok(output)) = (
            request.source_image.canonicalize(),
            request.output_image.canonicalize(),
        ) {
            if source == output {
                return Err(BuildError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "output image would overwrite the source image",
                )));
            }
        }
        Ok(())
    }

    fn patch_boot_configs(&self, root: &Path, request: &BuildRequest) -> Result<(), BuildError> {
        let configs = bootcfg::find_configs(root);
        if configs.is_empty() {
            return Err(BuildError::NoBootConfigFound {
                image: request.source_image.clone(),
            });
        }

        let mut patched_entries = 0;
        for config in &configs {
            fs::copy(&config.path, config.backup_path())?;

            let original = fs::read_to_string(&config.path)?;
            let patched = bootcfg::patch(config.kind, &original, &request.kickstart_url);
            fs::write(&config.path, &patched.text)?;

            match &patched.kernel_line {
                Some(line) => {
                    patched_entries += 1;
                    info!(kind = %config.kind, line = %line, "Patched boot entry");
                }
                None => warn!(kind = %config.kind, path = ?config.path, "No kernel line to patch"),
            }
            if !patched.timeout_rewritten {
                debug!(kind = %config.kind, "No timeout directive, leaving menu timeout alone");
            }
        }

        // A menu without any kernel line cannot start the installer
        if patched_entries == 0 {
            return Err(BuildError::NoBootConfigFound {
                image: request.source_image.clone(),
            });
        }
        Ok(())
    }

    fn volume_id(&self, source: &Path) -> String {
        match self.tools.volume_id(source) {
            Ok(Some(id)) if !id.trim().is_empty() => {
                debug!(volume_id = %id, "Using source volume id");
                id.trim().to_string()
            }
            Ok(_) => {
                warn!(default = %self.options.default_volume_id, "Source image has no volume id");
                self.options.default_volume_id.clone()
            }
            Err(error) => {
                warn!(error = ?error, default = %self.options.default_volume_id, "Failed to read volume id");
                self.options.default_volume_id.clone()
            }
        }
    }

    fn hybrid_mbr_template(&self, root: &Path) -> Option<PathBuf> {
        if !self.tools.supports_hybrid_mbr() {
            debug!("Mastering tool has no hybrid MBR support");
            return None;
        }

        let bundled = root.join(&self.options.mbr_template);
        if bundled.is_file() {
            return Some(bundled);
        }
        match &self.options.host_mbr_template {
            Some(path) if path.is_file() => Some(path.clone()),
            _ => {
                info!("No hybrid MBR template found, image will not boot from USB media");
                None
            }
        }
    }

    fn master(&self, root: &Path, output: &Path, volume_id: String) -> Result<(), BuildError> {
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        if output.exists() {
            warn!(output = ?output, "Replacing existing image");
            fs::remove_file(output)?;
        }

        let bios_boot = if root.join(&self.options.bios_boot_image).is_file() {
            Some(BiosBoot {
                image: self.options.bios_boot_image.clone(),
                catalog: self.options.bios_boot_catalog.clone(),
            })
        } else {
            warn!(path = %self.options.bios_boot_image, "No BIOS boot image, legacy boot disabled");
            None
        };
        let efi_boot = if root.join(&self.options.efi_boot_image).is_file() {
            Some(self.options.efi_boot_image.clone())
        } else {
            warn!(path = %self.options.efi_boot_image, "No EFI boot image, UEFI boot disabled");
            None
        };

        let plain = MasterRequest {
            root: root.to_path_buf(),
            output: output.to_path_buf(),
            volume_id,
            bios_boot,
            efi_boot,
            hybrid_mbr: None,
        };

        if let Some(mbr) = self.hybrid_mbr_template(root) {
            let hybrid = MasterRequest {
                hybrid_mbr: Some(mbr),
                ..plain.clone()
            };
            match self.tools.master(&hybrid) {
                Ok(()) if is_valid_image(output) => return Ok(()),
                Ok(()) => warn!("Hybrid mastering produced no image, retrying without hybrid MBR"),
                Err(error) => {
                    warn!(error = ?error, "Hybrid mastering failed, retrying without hybrid MBR")
                }
            }
            remove_partial(output);
        }

        let result = match self.tools.master(&plain) {
            Ok(()) if is_valid_image(output) => return Ok(()),
            Ok(()) => Err(anyhow!("mastering finished but {} is missing or empty", output.display())),
            Err(error) => Err(error),
        };
        remove_partial(output);
        result.map_err(|source| BuildError::MasteringFailed {
            output: output.to_path_buf(),
            source,
        })
    }
}

/// An image counts as produced only if it exists and is non-empty.
fn is_valid_image(path: &Path) -> bool {
    fs::metadata(path).is_ok_and(|m| m.is_file() && m.len() > 0)
}

fn remove_partial(path: &Path) {
    if path.exists() {
        if let Err(error) = fs::remove_file(path) {
            warn!(error = ?error, path = ?path, "Failed to remove partial image");
        }
    }
}

/// Add the owner write bit to everything under `root`; extracted ISO content
/// is read-only.
fn make_writable(root: &Path) -> Result<(), BuildError> {
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(std::io::Error::from)?;
        if entry.file_type().is_symlink() {
            continue;
        }

        let mut permissions = entry.metadata().map_err(std::io::Error::from)?.permissions();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let extra = if entry.file_type().is_dir() { 0o700 } else { 0o200 };
            permissions.set_mode(permissions.mode() | extra);
        }
        #[cfg(not(unix))]
        permissions.set_readonly(false);

        fs::set_permissions(entry.path(), permissions)?;
    }
    Ok(())
}
