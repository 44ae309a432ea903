use anyhow::{Context, Result, bail};
use byte_unit::Byte;
use serde::{Deserialize, Serialize};
use std::{
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
};
use tracing::debug;
use validator::Validate;

/// Name of the configuration file looked up in the working directory.
pub const CONFIG_FILE: &str = "ksvm.toml";

/// Everything a ksvm invocation needs to know, resolved once at startup.
#[derive(Clone, Serialize, Deserialize, Validate, Debug, Default, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    #[validate(nested)]
    pub vm: VmConfig,

    #[validate(nested)]
    pub iso: IsoConfig,

    #[validate(nested)]
    pub kickstart: KickstartConfig,

    #[validate(nested)]
    pub http: HttpConfig,

    #[validate(nested)]
    pub console: ConsoleConfig,
}

#[derive(Clone, Serialize, Deserialize, Validate, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct VmConfig {
    #[validate(length(min = 1))]
    pub name: String,

    /// VirtualBox guest OS type
    #[validate(length(min = 1))]
    pub os_type: String,

    /// Memory in MiB
    #[validate(range(min = 512))]
    pub memory: u32,

    #[validate(range(min = 1, max = 64))]
    pub cpus: u32,

    /// Size of the install disk, e.g. "20G"
    #[validate(nested)]
    pub disk_size: DiskSize,

    /// Where the disk image is created (next to the VM by default)
    pub disk_path: Option<PathBuf>,

    /// Run without a display window
    pub headless: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            name: String::from("ksvm"),
            os_type: String::from("RedHat_64"),
            memory: 4096,
            cpus: 2,
            disk_size: DiskSize::default(),
            disk_path: None,
            headless: true,
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Validate, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct IsoConfig {
    /// The distribution's installation image
    pub source: PathBuf,

    /// Where the kickstart image is written
    pub output: PathBuf,

    /// Expected checksum of the source image ("sha256:<hex>")
    pub checksum: Option<String>,

    /// Directory for the temporary extraction tree
    pub work_dir: Option<PathBuf>,

    /// Allow loop-mounting the source image with sudo when xorriso cannot
    /// extract it
    pub allow_mount: bool,
}

impl Default for IsoConfig {
    fn default() -> Self {
        Self {
            source: PathBuf::from("iso/install.iso"),
            output: PathBuf::from("iso/install-ks.iso"),
            checksum: None,
            work_dir: None,
            allow_mount: false,
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Validate, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct KickstartConfig {
    /// Directory the kickstart file lives in and the HTTP server serves
    pub dir: PathBuf,

    #[validate(length(min = 1))]
    pub file: String,

    /// Address of the host as seen from the guest (VirtualBox NAT gateway)
    pub host: IpAddr,

    /// Use this URL instead of the one derived from host and port
    #[validate(url)]
    pub url: Option<String>,
}

impl Default for KickstartConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("kickstart"),
            file: String::from("ks.cfg"),
            host: IpAddr::from([10, 0, 2, 2]),
            url: None,
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Validate, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct HttpConfig {
    pub bind: IpAddr,

    #[validate(range(min = 1))]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::from([0, 0, 0, 0]),
            port: 8080,
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Validate, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ConsoleConfig {
    /// File the VM's first serial port is written to
    pub log: PathBuf,

    /// Print serial output while `vm start` waits
    pub follow: bool,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            log: PathBuf::from("serial.log"),
            follow: true,
        }
    }
}

/// Absolute size of the VM's disk.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct DiskSize(pub String);

impl Default for DiskSize {
    fn default() -> Self {
        Self("20G".to_string())
    }
}

impl DiskSize {
    /// The size in MiB, as VBoxManage expects it.
    pub fn as_mib(&self) -> Result<u64> {
        let byte: Byte = self
            .0
            .parse()
            .with_context(|| format!("invalid disk size: {}", self.0))?;
        Ok(byte.as_u64().div_ceil(1024 * 1024))
    }
}

impl Validate for DiskSize {
    fn validate(&self) -> std::result::Result<(), validator::ValidationErrors> {
        match self.0.parse::<Byte>() {
            Ok(byte) if byte.as_u64() >= 1024 * 1024 => Ok(()),
            Ok(_) => {
                let mut errors = validator::ValidationErrors::new();
                errors.add(
                    "disk_size",
                    validator::ValidationError::new("Disk size must be at least 1 MiB"),
                );
                Err(errors)
            }
            Err(_) => {
                let mut errors = validator::ValidationErrors::new();
                errors.add(
                    "disk_size",
                    validator::ValidationError::new(
                        "Invalid size format. Expected format: number followed by unit (e.g., '20G', '512M')",
                    ),
                );
                Err(errors)
            }
        }
    }
}

/// Values given on the command line (or through `KSVM_*` variables) that take
/// precedence over the configuration file.
#[derive(Clone, Debug, Default, clap::Args)]
pub struct Overrides {
    /// Name of the virtual machine
    #[clap(long, env = "KSVM_VM_NAME", global = true)]
    pub vm_name: Option<String>,

    /// Source installation image
    #[clap(long, env = "KSVM_SOURCE_ISO", global = true)]
    pub source: Option<PathBuf>,

    /// Output path of the kickstart image
    #[clap(long, env = "KSVM_OUTPUT_ISO", global = true)]
    pub output: Option<PathBuf>,

    /// Kickstart file, relative to the kickstart directory
    #[clap(long, env = "KSVM_KICKSTART", global = true)]
    pub kickstart: Option<String>,

    /// Kickstart URL written into the boot entry
    #[clap(long, env = "KSVM_KICKSTART_URL", global = true)]
    pub url: Option<String>,

    /// Port of the kickstart HTTP server
    #[clap(long, env = "KSVM_HTTP_PORT", global = true)]
    pub port: Option<u16>,

    /// Serial console log file
    #[clap(long, env = "KSVM_SERIAL_LOG", global = true)]
    pub serial_log: Option<PathBuf>,
}

impl Config {
    /// Load the given file, or `ksvm.toml` in the working directory when it
    /// exists, or fall back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => Some(path.to_path_buf()),
            None => Some(PathBuf::from(CONFIG_FILE)).filter(|p| p.exists()),
        };

        match path {
            Some(path) => {
                debug!(path = ?path, "Loading config");
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                Self::parse(&content).with_context(|| format!("invalid config {}", path.display()))
            }
            None => {
                debug!("No config file, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply command line overrides and validate the result.
    pub fn with_overrides(mut self, overrides: &Overrides) -> Result<Self> {
        if let Some(name) = &overrides.vm_name {
            self.vm.name = name.clone();
        }
        if let Some(source) = &overrides.source {
            self.iso.source = source.clone();
        }
        if let Some(output) = &overrides.output {
            self.iso.output = output.clone();
        }
        if let Some(kickstart) = &overrides.kickstart {
            self.kickstart.file = kickstart.clone();
        }
        if let Some(url) = &overrides.url {
            self.kickstart.url = Some(url.clone());
        }
        if let Some(port) = overrides.port {
            self.http.port = port;
        }
        if let Some(serial_log) = &overrides.serial_log {
            self.console.log = serial_log.clone();
        }

        if let Err(errors) = self.validate() {
            bail!("invalid configuration: {errors}");
        }
        Ok(self)
    }

    /// The kickstart file on disk, resolved against the kickstart directory.
    pub fn kickstart_path(&self) -> PathBuf {
        let file = Path::new(&self.kickstart.file);
        if file.is_absolute() {
            file.to_path_buf()
        } else {
            self.kickstart.dir.join(file)
        }
    }

    /// Name under which the kickstart file is embedded and served.
    pub fn kickstart_name(&self) -> String {
        Path::new(&self.kickstart.file)
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| self.kickstart.file.clone())
    }

    /// The URL the installer fetches the kickstart file from.
    pub fn kickstart_url(&self) -> String {
        match &self.kickstart.url {
            Some(url) => url.clone(),
            None => format!(
                "http://{}/{}",
                SocketAddr::new(self.kickstart.host, self.http.port),
                self.kickstart_name()
            ),
        }
    }

    /// Directory served over HTTP; the one containing the kickstart file.
    pub fn serve_dir(&self) -> PathBuf {
        self.kickstart_path()
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.kickstart.dir.clone())
    }

    /// The VM disk image.
    pub fn disk_path(&self) -> PathBuf {
        self.vm
            .disk_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("{}.vdi", self.vm.name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() -> Result<()> {
        let config = Config::default().with_overrides(&Overrides::default())?;

        assert_eq!(config.kickstart_url(), "http://10.0.2.2:8080/ks.cfg");
        assert_eq!(config.kickstart_path(), PathBuf::from("kickstart/ks.cfg"));
        assert_eq!(config.serve_dir(), PathBuf::from("kickstart"));
        assert_eq!(config.disk_path(), PathBuf::from("ksvm.vdi"));
        Ok(())
    }

    #[test]
    fn test_parse_partial_file() -> Result<()> {
        let config = Config::parse(
            r#"
            [vm]
            name = "rocky9"
            memory = 8192
            disk_size = "40G"

            [kickstart]
            file = "rocky9.ks"

            [http]
            port = 8000
            "#,
        )?;

        assert_eq!(config.vm.name, "rocky9");
        assert_eq!(config.vm.memory, 8192);
        assert_eq!(config.vm.cpus, 2);
        assert!(config.vm.disk_size.as_mib()? >= 38_000);
        assert_eq!(config.kickstart_url(), "http://10.0.2.2:8000/rocky9.ks");
        assert_eq!(config.iso, IsoConfig::default());
        Ok(())
    }

    #[test]
    fn test_parse_rejects_unknown_keys() {
        assert!(Config::parse("[vm]\nram = 1\n").is_err());
    }

    #[test]
    fn test_overrides_win() -> Result<()> {
        let config = Config::default().with_overrides(&Overrides {
            vm_name: Some(String::from("alma")),
            kickstart: Some(String::from("/srv/ks/alma.cfg")),
            port: Some(9000),
            ..Overrides::default()
        })?;

        assert_eq!(config.vm.name, "alma");
        assert_eq!(config.kickstart_path(), PathBuf::from("/srv/ks/alma.cfg"));
        assert_eq!(config.serve_dir(), PathBuf::from("/srv/ks"));
        assert_eq!(config.kickstart_url(), "http://10.0.2.2:9000/alma.cfg");
        Ok(())
    }

    #[test]
    fn test_url_override() -> Result<()> {
        let config = Config::default().with_overrides(&Overrides {
            url: Some(String::from("http://192.168.1.10/ks.cfg")),
            ..Overrides::default()
        })?;

        assert_eq!(config.kickstart_url(), "http://192.168.1.10/ks.cfg");
        Ok(())
    }

    #[test]
    fn test_ipv6_host_url() -> Result<()> {
        let config = Config::parse("[kickstart]\nhost = \"fd00::2\"\n")?;
        assert_eq!(config.kickstart_url(), "http://[fd00::2]:8080/ks.cfg");
        Ok(())
    }

    #[test]
    fn test_invalid_values() {
        let mut config = Config::default();
        config.vm.memory = 128;
        assert!(config.with_overrides(&Overrides::default()).is_err());

        let mut config = Config::default();
        config.vm.disk_size = DiskSize(String::from("lots"));
        assert!(config.with_overrides(&Overrides::default()).is_err());

        let config = Config::default();
        assert!(
            config
                .with_overrides(&Overrides {
                    url: Some(String::from("not a url")),
                    ..Overrides::default()
                })
                .is_err()
        );
    }

    #[test]
    fn test_disk_size() -> Result<()> {
        assert_eq!(DiskSize(String::from("20GiB")).as_mib()?, 20 * 1024);
        assert_eq!(DiskSize(String::from("512MiB")).as_mib()?, 512);
        assert!(DiskSize(String::from("0")).validate().is_err());
        assert!(DiskSize::default().validate().is_ok());
        Ok(())
    }
}
