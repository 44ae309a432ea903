//! Locating and rewriting bootloader menus inside an extracted image.

use regex::Regex;
use std::{
    path::{Path, PathBuf},
    sync::LazyLock,
};
use strum::{Display, EnumIter, IntoEnumIterator};
use tracing::{debug, trace};
use walkdir::WalkDir;

/// Menu timeout written into GRUB configs, in seconds.
pub const GRUB_TIMEOUT_SECS: u32 = 5;

/// Menu timeout written into isolinux configs, in tenths of a second.
pub const LEGACY_TIMEOUT_TENTHS: u32 = 50;

/// Serial console the installer is redirected to.
pub const SERIAL_CONSOLE: &str = "console=ttyS0,115200n8";

static GRUB_KERNEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*(linux|linux16|linuxefi|kernel)[ \t]+[^\r\n]*").unwrap());

static GRUB_TIMEOUT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^([ \t]*set[ \t]+timeout[ \t]*=[ \t]*)[^\s]+").unwrap());

static LEGACY_APPEND: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?mi)^[ \t]*append[ \t]+[^\r\n]*").unwrap());

static LEGACY_TIMEOUT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?mi)^([ \t]*timeout[ \t]+)\d+").unwrap());

/// Styles of bootloader configuration we know how to patch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumIter)]
pub enum BootConfigKind {
    /// GRUB 2 menu, used for UEFI boot.
    #[strum(to_string = "grub")]
    Grub,
    /// isolinux/syslinux menu, used for legacy BIOS boot.
    #[strum(to_string = "isolinux")]
    Legacy,
}

impl BootConfigKind {
    /// File names that identify this kind of config, in order of preference.
    pub fn file_names(&self) -> &'static [&'static str] {
        match self {
            BootConfigKind::Grub => &["grub.cfg"],
            BootConfigKind::Legacy => &["isolinux.cfg", "syslinux.cfg"],
        }
    }

    fn kernel_line(&self) -> &'static Regex {
        match self {
            BootConfigKind::Grub => &*GRUB_KERNEL,
            BootConfigKind::Legacy => &*LEGACY_APPEND,
        }
    }

    fn timeout_line(&self) -> (&'static Regex, u32) {
        match self {
            BootConfigKind::Grub => (&*GRUB_TIMEOUT, GRUB_TIMEOUT_SECS),
            BootConfigKind::Legacy => (&*LEGACY_TIMEOUT, LEGACY_TIMEOUT_TENTHS),
        }
    }
}

/// A bootloader config found in an extracted tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootConfig {
    pub kind: BootConfigKind,
    pub path: PathBuf,
}

impl BootConfig {
    /// Where the untouched copy of this config is kept.
    pub fn backup_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".orig");
        PathBuf::from(name)
    }
}

/// The kernel parameters appended to the first boot entry.
pub fn kernel_params(kickstart_url: &str) -> String {
    format!("inst.ks={kickstart_url} inst.text {SERIAL_CONSOLE}")
}

/// Result of patching one config file.
#[derive(Debug, PartialEq, Eq)]
pub struct Patched {
    pub text: String,

    /// The line that now carries the kickstart parameters, if one was found
    pub kernel_line: Option<String>,

    /// Whether a timeout directive was rewritten
    pub timeout_rewritten: bool,
}

/// Append the kickstart parameters to the first kernel line and shorten the
/// menu timeout. Every other line is returned unchanged.
pub fn patch(kind: BootConfigKind, text: &str, kickstart_url: &str) -> Patched {
    let params = kernel_params(kickstart_url);

    let (mut text, kernel_line) = match kind.kernel_line().find(text) {
        Some(m) => {
            let line = format!("{} {}", m.as_str().trim_end(), params);
            trace!(kind = %kind, line = %line, "Patched kernel line");
            (
                format!("{}{}{}", &text[..m.start()], line, &text[m.end()..]),
                Some(line),
            )
        }
        None => (text.to_string(), None),
    };

    let (timeout, value) = kind.timeout_line();
    let timeout_rewritten = timeout.is_match(&text);
    if timeout_rewritten {
        text = timeout
            .replace_all(&text, |caps: &regex::Captures| format!("{}{}", &caps[1], value))
            .into_owned();
    }

    Patched {
        text,
        kernel_line,
        timeout_rewritten,
    }
}

/// Find the first config of each kind under `root`.
///
/// The tree is walked in file name order so the choice is stable between runs.
/// Backup copies (`*.orig`) never match.
pub fn find_configs(root: &Path) -> Vec<BootConfig> {
    let files: Vec<PathBuf> = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect();

    BootConfigKind::iter()
        .filter_map(|kind| {
            kind.file_names().iter().find_map(|name| {
                files
                    .iter()
                    .find(|path| path.file_name().is_some_and(|f| f == *name))
                    .map(|path| {
                        debug!(kind = %kind, path = ?path, "Found bootloader config");
                        BootConfig {
                            kind,
                            path: path.clone(),
                        }
                    })
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "http://10.0.2.2:8080/ks.cfg";

    const GRUB: &str = "\
set default=\"1\"
set timeout=60

menuentry 'Install Rocky Linux 9' --class fedora {
\tlinuxefi /images/pxeboot/vmlinuz inst.stage2=hd:LABEL=Rocky-9 quiet
\tinitrdefi /images/pxeboot/initrd.img
}
menuentry 'Test this media & install Rocky Linux 9' --class fedora {
\tlinuxefi /images/pxeboot/vmlinuz inst.stage2=hd:LABEL=Rocky-9 rd.live.check quiet
\tinitrdefi /images/pxeboot/initrd.img
}
";

    const ISOLINUX: &str = "\
default vesamenu.c32
timeout 600

label linux
  menu label ^Install Rocky Linux 9
  kernel vmlinuz
  append initrd=initrd.img inst.stage2=hd:LABEL=Rocky-9 quiet

label check
  menu label Test this ^media & install Rocky Linux 9
  kernel vmlinuz
  append initrd=initrd.img inst.stage2=hd:LABEL=Rocky-9 rd.live.check quiet
";

    #[test]
    fn test_kernel_params() {
        assert_eq!(
            kernel_params(URL),
            "inst.ks=http://10.0.2.2:8080/ks.cfg inst.text console=ttyS0,115200n8"
        );
    }

    #[test]
    fn test_patch_single_grub_entry() {
        let patched = patch(BootConfigKind::Grub, "menuentry 'x' {\nlinux /images/vmlinuz\n}\n", URL);

        assert_eq!(
            patched.kernel_line.as_deref(),
            Some("linux /images/vmlinuz inst.ks=http://10.0.2.2:8080/ks.cfg inst.text console=ttyS0,115200n8")
        );
        assert!(!patched.timeout_rewritten);
    }

    #[test]
    fn test_patch_linux16_entry() {
        let text = "menuentry 'Install CentOS 7' {\n\tlinux16 /images/pxeboot/vmlinuz quiet\n\tinitrd16 /images/pxeboot/initrd.img\n}\n";
        let patched = patch(BootConfigKind::Grub, text, URL);

        assert_eq!(
            patched.kernel_line.as_deref(),
            Some(format!("\tlinux16 /images/pxeboot/vmlinuz quiet {}", kernel_params(URL)).as_str())
        );
        assert!(patched.text.contains("\tinitrd16 /images/pxeboot/initrd.img\n"));
    }

    #[test]
    fn test_patch_grub_only_first_entry() {
        let patched = patch(BootConfigKind::Grub, GRUB, URL);
        let before: Vec<&str> = GRUB.lines().collect();
        let after: Vec<&str> = patched.text.lines().collect();

        assert_eq!(before.len(), after.len());
        for (i, (b, a)) in before.iter().zip(after.iter()).enumerate() {
            match i {
                1 => assert_eq!(*a, "set timeout=5"),
                4 => assert_eq!(*a, format!("{} {}", b, kernel_params(URL))),
                _ => assert_eq!(a, b, "line {i} should be untouched"),
            }
        }
        assert!(patched.timeout_rewritten);
        assert_eq!(patched.text.matches("inst.ks=").count(), 1);
    }

    #[test]
    fn test_patch_isolinux_only_first_append() {
        let patched = patch(BootConfigKind::Legacy, ISOLINUX, URL);

        assert!(patched.text.contains("timeout 50\n"));
        assert!(patched.text.contains(
            "  append initrd=initrd.img inst.stage2=hd:LABEL=Rocky-9 quiet inst.ks=http://10.0.2.2:8080/ks.cfg inst.text console=ttyS0,115200n8\n"
        ));
        assert!(patched.text.contains(
            "  append initrd=initrd.img inst.stage2=hd:LABEL=Rocky-9 rd.live.check quiet\n"
        ));
        assert_eq!(patched.text.matches("inst.ks=").count(), 1);
    }

    #[test]
    fn test_patch_preserves_crlf() {
        let patched = patch(BootConfigKind::Grub, "set timeout=10\r\nlinux /vmlinuz  \r\n", URL);

        assert_eq!(
            patched.text,
            format!("set timeout=5\r\nlinux /vmlinuz {}\r\n", kernel_params(URL))
        );
    }

    #[test]
    fn test_patch_without_kernel_line() {
        let patched = patch(BootConfigKind::Grub, "set timeout=10\n", URL);

        assert_eq!(patched.kernel_line, None);
        assert_eq!(patched.text, "set timeout=5\n");
    }

    #[test]
    fn test_patch_is_stable() {
        assert_eq!(
            patch(BootConfigKind::Legacy, ISOLINUX, URL),
            patch(BootConfigKind::Legacy, ISOLINUX, URL)
        );
    }

    #[test]
    fn test_find_configs() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        std::fs::create_dir_all(tmp.path().join("EFI/BOOT"))?;
        std::fs::create_dir_all(tmp.path().join("boot/grub2"))?;
        std::fs::create_dir_all(tmp.path().join("isolinux"))?;
        std::fs::write(tmp.path().join("EFI/BOOT/grub.cfg.orig"), "")?;
        std::fs::write(tmp.path().join("EFI/BOOT/grub.cfg"), GRUB)?;
        std::fs::write(tmp.path().join("boot/grub2/grub.cfg"), GRUB)?;
        std::fs::write(tmp.path().join("isolinux/isolinux.cfg"), ISOLINUX)?;

        let configs = find_configs(tmp.path());
        assert_eq!(
            configs,
            vec![
                BootConfig {
                    kind: BootConfigKind::Grub,
                    path: tmp.path().join("EFI/BOOT/grub.cfg"),
                },
                BootConfig {
                    kind: BootConfigKind::Legacy,
                    path: tmp.path().join("isolinux/isolinux.cfg"),
                },
            ]
        );
        assert_eq!(
            configs[0].backup_path(),
            tmp.path().join("EFI/BOOT/grub.cfg.orig")
        );
        Ok(())
    }

    #[test]
    fn test_find_configs_empty() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        std::fs::write(tmp.path().join("README"), "")?;

        assert!(find_configs(tmp.path()).is_empty());
        Ok(())
    }
}
