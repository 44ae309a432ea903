//! External programs used to take apart and master ISO images.

use anyhow::{Context, Result, bail};
use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};
use strum::Display;
use tracing::{debug, info, trace, warn};
use walkdir::WalkDir;

/// Roles an external program can fill during a build.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
pub enum Tool {
    /// Extracts and masters ISO9660 images
    #[strum(to_string = "xorriso")]
    Mastering,
    /// Reads the primary volume descriptor
    #[strum(to_string = "isoinfo")]
    Metadata,
    /// Embeds an MD5 checksum for the installer's media check
    #[strum(to_string = "implantisomd5")]
    ChecksumImplant,
}

impl Tool {
    /// The package that usually provides the tool.
    pub fn package(&self) -> &'static str {
        match self {
            Tool::Mastering => "xorriso",
            Tool::Metadata => "genisoimage",
            Tool::ChecksumImplant => "isomd5sum",
        }
    }
}

/// El Torito entry for legacy BIOS boot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BiosBoot {
    /// Boot image path relative to the image root
    pub image: String,

    /// Boot catalog path relative to the image root
    pub catalog: String,
}

/// Everything needed to master an image from a directory tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MasterRequest {
    pub root: PathBuf,
    pub output: PathBuf,
    pub volume_id: String,
    pub bios_boot: Option<BiosBoot>,

    /// EFI boot image path relative to the image root
    pub efi_boot: Option<String>,

    /// MBR template for a hybrid image that also boots from USB media
    pub hybrid_mbr: Option<PathBuf>,
}

impl MasterRequest {
    /// Arguments in `mkisofs` syntax, understood by `xorriso -as mkisofs` and
    /// `genisoimage` alike.
    pub fn mkisofs_args(&self) -> Vec<String> {
        let mut args = vec![
            String::from("-o"),
            self.output.display().to_string(),
            String::from("-V"),
            self.volume_id.clone(),
            String::from("-R"),
            String::from("-J"),
            String::from("-joliet-long"),
        ];

        if let Some(bios) = &self.bios_boot {
            args.extend([
                String::from("-b"),
                bios.image.clone(),
                String::from("-c"),
                bios.catalog.clone(),
                String::from("-no-emul-boot"),
                String::from("-boot-load-size"),
                String::from("4"),
                String::from("-boot-info-table"),
            ]);
        }

        if let Some(efi) = &self.efi_boot {
            if self.bios_boot.is_some() {
                args.push(String::from("-eltorito-alt-boot"));
            }
            args.extend([
                String::from("-e"),
                efi.clone(),
                String::from("-no-emul-boot"),
            ]);
        }

        if let Some(mbr) = &self.hybrid_mbr {
            args.push(String::from("-isohybrid-mbr"));
            args.push(mbr.display().to_string());
            if self.efi_boot.is_some() {
                args.push(String::from("-isohybrid-gpt-basdat"));
            }
        }

        args.push(self.root.display().to_string());
        trace!(args = ?args, "mkisofs arguments");
        args
    }
}

/// The operations a build needs from the outside world.
pub trait IsoTools {
    /// Whether the program for the given role can be run.
    fn available(&self, tool: Tool) -> bool;

    /// Whether the mastering tool can embed a hybrid MBR.
    fn supports_hybrid_mbr(&self) -> bool;

    /// Copy the complete contents of `image` into the existing directory `dest`.
    fn extract(&self, image: &Path, dest: &Path) -> Result<()>;

    /// Read the volume id of `image`.
    fn volume_id(&self, image: &Path) -> Result<Option<String>>;

    /// Master a new image.
    fn master(&self, request: &MasterRequest) -> Result<()>;

    /// Embed an MD5 checksum into `image`.
    fn implant_checksum(&self, image: &Path) -> Result<()>;
}

#[derive(Clone, Debug)]
enum Mastering {
    Xorriso(PathBuf),
    /// genisoimage or mkisofs, which can master but not extract
    Mkisofs(PathBuf),
}

/// [`IsoTools`] backed by the programs installed on this machine.
#[derive(Clone, Debug)]
pub struct HostTools {
    mastering: Option<Mastering>,
    isoinfo: Option<PathBuf>,
    implantisomd5: Option<PathBuf>,

    /// Fall back to loop-mounting the image (requires root or sudo) when the
    /// mastering tool cannot extract images itself
    pub allow_mount: bool,
}

impl HostTools {
    /// Look up every tool in `PATH`.
    pub fn detect() -> Self {
        let mastering = if let Ok(path) = which::which("xorriso") {
            Some(Mastering::Xorriso(path))
        } else {
            which::which("genisoimage")
                .or_else(|_| which::which("mkisofs"))
                .ok()
                .map(Mastering::Mkisofs)
        };

        let tools = Self {
            mastering,
            isoinfo: which::which("isoinfo").ok(),
            implantisomd5: which::which("implantisomd5").ok(),
            allow_mount: false,
        };
        debug!(tools = ?tools, "Detected host tools");
        tools
    }

    /// Allow the privileged loop-mount extraction fallback.
    pub fn with_mount_fallback(mut self, allow: bool) -> Self {
        self.allow_mount = allow;
        self
    }

    fn mount_and_copy(&self, image: &Path, dest: &Path) -> Result<()> {
        let mountpoint = tempfile::Builder::new().prefix("ksvm-mnt-").tempdir()?;

        info!(image = ?image, mountpoint = ?mountpoint.path(), "Loop mounting image");
        run(privileged("mount")?
            .args(["-o", "loop,ro"])
            .arg(image)
            .arg(mountpoint.path()))?;
        let _mount = MountGuard(mountpoint.path().to_path_buf());

        for entry in WalkDir::new(mountpoint.path()).min_depth(1) {
            let entry = entry?;
            let target = dest.join(entry.path().strip_prefix(mountpoint.path())?);

            if entry.file_type().is_dir() {
                fs::create_dir_all(&target)?;
            } else if entry.file_type().is_symlink() {
                #[cfg(unix)]
                std::os::unix::fs::symlink(fs::read_link(entry.path())?, &target)?;
            } else {
                fs::copy(entry.path(), &target)
                    .with_context(|| format!("copying {}", entry.path().display()))?;
            }
        }
        Ok(())
    }
}

impl IsoTools for HostTools {
    fn available(&self, tool: Tool) -> bool {
        match tool {
            Tool::Mastering => self.mastering.is_some(),
            Tool::Metadata => self.isoinfo.is_some(),
            Tool::ChecksumImplant => self.implantisomd5.is_some(),
        }
    }

    fn supports_hybrid_mbr(&self) -> bool {
        matches!(self.mastering, Some(Mastering::Xorriso(_)))
    }

    fn extract(&self, image: &Path, dest: &Path) -> Result<()> {
        match &self.mastering {
            Some(Mastering::Xorriso(xorriso)) => {
                info!(image = ?image, "Extracting image");
                let extracted = run(Command::new(xorriso)
                    .args(["-osirrox", "on", "-indev"])
                    .arg(image)
                    .args(["-extract", "/"])
                    .arg(dest));

                match extracted {
                    Ok(_) => Ok(()),
                    Err(error) if self.allow_mount => {
                        warn!(error = ?error, "Direct extraction failed, trying a loop mount");
                        self.mount_and_copy(image, dest)
                    }
                    Err(error) => Err(error),
                }
            }
            Some(Mastering::Mkisofs(_)) if self.allow_mount => self.mount_and_copy(image, dest),
            Some(Mastering::Mkisofs(path)) => bail!(
                "{} cannot extract images; install xorriso or allow the loop mount fallback",
                path.display()
            ),
            None => bail!("No mastering tool available"),
        }
    }

    fn volume_id(&self, image: &Path) -> Result<Option<String>> {
        let isoinfo = self.isoinfo.as_ref().context("isoinfo not available")?;
        let stdout = run(Command::new(isoinfo).arg("-d").arg("-i").arg(image))?;
        Ok(parse_volume_id(&stdout))
    }

    fn master(&self, request: &MasterRequest) -> Result<()> {
        let mut command = match &self.mastering {
            Some(Mastering::Xorriso(xorriso)) => {
                let mut command = Command::new(xorriso);
                command.args(["-as", "mkisofs"]);
                command
            }
            Some(Mastering::Mkisofs(path)) => {
                if request.hybrid_mbr.is_some() {
                    bail!("{} cannot embed a hybrid MBR", path.display());
                }
                Command::new(path)
            }
            None => bail!("No mastering tool available"),
        };

        info!(output = ?request.output, volume_id = %request.volume_id, hybrid = request.hybrid_mbr.is_some(), "Mastering image");
        run(command.args(request.mkisofs_args()))?;
        Ok(())
    }

    fn implant_checksum(&self, image: &Path) -> Result<()> {
        let implantisomd5 = self
            .implantisomd5
            .as_ref()
            .context("implantisomd5 not available")?;
        run(Command::new(implantisomd5).arg(image))?;
        Ok(())
    }
}

/// Pull the volume id out of `isoinfo -d` output.
pub fn parse_volume_id(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.strip_prefix("Volume id:"))
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
}

/// Unmounts a loop mount when dropped.
struct MountGuard(PathBuf);

impl Drop for MountGuard {
    fn drop(&mut self) {
        debug!(mountpoint = ?self.0, "Unmounting image");
        match privileged("umount") {
            Ok(mut command) => {
                if let Err(error) = run(command.arg(&self.0)) {
                    warn!(error = ?error, mountpoint = ?self.0, "Failed to unmount image");
                }
            }
            Err(error) => warn!(error = ?error, "Failed to unmount image"),
        }
    }
}

/// A command that needs root, run through sudo when available.
fn privileged(program: &str) -> Result<Command> {
    let program = which::which(program).with_context(|| format!("{program} not found"))?;
    Ok(match which::which("sudo") {
        Ok(sudo) => {
            let mut command = Command::new(sudo);
            command.arg(program);
            command
        }
        Err(_) => Command::new(program),
    })
}

/// Run a command to completion and return its stdout.
fn run(command: &mut Command) -> Result<String> {
    debug!(command = ?command, "Running");
    let output = command
        .output()
        .with_context(|| format!("failed to spawn {:?}", command.get_program()))?;

    if !output.status.success() {
        bail!(
            "{:?} exited with {}: {}",
            command.get_program(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> MasterRequest {
        MasterRequest {
            root: PathBuf::from("/tmp/tree"),
            output: PathBuf::from("/tmp/out.iso"),
            volume_id: String::from("Rocky-9-4-x86_64-dvd"),
            bios_boot: Some(BiosBoot {
                image: String::from("isolinux/isolinux.bin"),
                catalog: String::from("isolinux/boot.cat"),
            }),
            efi_boot: Some(String::from("images/efiboot.img")),
            hybrid_mbr: None,
        }
    }

    #[test]
    fn test_mkisofs_args_plain() {
        assert_eq!(
            request().mkisofs_args(),
            vec![
                "-o",
                "/tmp/out.iso",
                "-V",
                "Rocky-9-4-x86_64-dvd",
                "-R",
                "-J",
                "-joliet-long",
                "-b",
                "isolinux/isolinux.bin",
                "-c",
                "isolinux/boot.cat",
                "-no-emul-boot",
                "-boot-load-size",
                "4",
                "-boot-info-table",
                "-eltorito-alt-boot",
                "-e",
                "images/efiboot.img",
                "-no-emul-boot",
                "/tmp/tree",
            ]
        );
    }

    #[test]
    fn test_mkisofs_args_hybrid() {
        let args = MasterRequest {
            hybrid_mbr: Some(PathBuf::from("/usr/share/syslinux/isohdpfx.bin")),
            ..request()
        }
        .mkisofs_args();

        let mbr = args.iter().position(|a| a == "-isohybrid-mbr").unwrap();
        assert_eq!(args[mbr + 1], "/usr/share/syslinux/isohdpfx.bin");
        assert!(args.contains(&String::from("-isohybrid-gpt-basdat")));
        assert_eq!(args.last().unwrap(), "/tmp/tree");
    }

    #[test]
    fn test_mkisofs_args_efi_only() {
        let args = MasterRequest {
            bios_boot: None,
            ..request()
        }
        .mkisofs_args();

        assert!(!args.contains(&String::from("-eltorito-alt-boot")));
        assert!(!args.contains(&String::from("-b")));
        assert!(args.contains(&String::from("-e")));
    }

    #[test]
    fn test_parse_volume_id() {
        let output = "\
CD-ROM is in ISO 9660 format
System id: LINUX
Volume id: Rocky-9-4-x86_64-dvd
Volume set id:
";
        assert_eq!(
            parse_volume_id(output),
            Some(String::from("Rocky-9-4-x86_64-dvd"))
        );
        assert_eq!(parse_volume_id("Volume id:   \n"), None);
        assert_eq!(parse_volume_id("garbage"), None);
    }
}
