use anyhow::{Result, bail};
use std::path::PathBuf;
use strum::{Display, EnumString};
use tracing::{debug, info};

use crate::config::Config;

pub mod virtualbox;

pub use virtualbox::VirtualBox;

/// Power state of a virtual machine as reported by the hypervisor.
#[derive(Clone, Debug, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum VmState {
    Running,
    Paused,
    #[strum(serialize = "poweroff")]
    PoweredOff,
    Aborted,
    Saved,
    Starting,
    Stopping,
    #[strum(default)]
    Other(String),
}

impl VmState {
    /// Whether the machine is up or on its way up.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            VmState::Running | VmState::Paused | VmState::Starting | VmState::Stopping
        )
    }
}

/// Hardware and media for a new machine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmSpec {
    pub name: String,
    pub os_type: String,
    pub memory_mib: u32,
    pub cpus: u32,
    pub disk: PathBuf,
    pub disk_mib: u64,
    pub install_iso: PathBuf,

    /// File the first serial port is connected to
    pub serial_log: PathBuf,
}

impl VmSpec {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            name: config.vm.name.clone(),
            os_type: config.vm.os_type.clone(),
            memory_mib: config.vm.memory,
            cpus: config.vm.cpus,
            disk: absolute(config.disk_path())?,
            disk_mib: config.vm.disk_size.as_mib()?,
            install_iso: absolute(config.iso.output.clone())?,
            serial_log: absolute(config.console.log.clone())?,
        })
    }
}

/// The hypervisor's management interface.
pub trait Hypervisor {
    /// Whether a machine with this name is registered.
    fn exists(&self, name: &str) -> Result<bool>;

    fn state(&self, name: &str) -> Result<VmState>;

    /// Register and configure a new machine with its disk and install media.
    fn create(&self, spec: &VmSpec) -> Result<()>;

    fn start(&self, name: &str, headless: bool) -> Result<()>;

    /// Cut the power immediately.
    fn poweroff(&self, name: &str) -> Result<()>;

    /// Press the virtual power button.
    fn acpi_shutdown(&self, name: &str) -> Result<()>;

    /// Unregister the machine and delete its media.
    fn unregister(&self, name: &str) -> Result<()>;
}

/// Create a new machine. Fails if one with the same name already exists.
pub fn create(hypervisor: &impl Hypervisor, spec: &VmSpec) -> Result<()> {
    if hypervisor.exists(&spec.name)? {
        bail!("A VM named '{}' already exists", spec.name);
    }
    if !spec.install_iso.is_file() {
        bail!("Install image not found: {}", spec.install_iso.display());
    }

    info!(name = %spec.name, memory = spec.memory_mib, cpus = spec.cpus, disk = spec.disk_mib, "Creating VM");
    hypervisor.create(spec)
}

/// Start a machine. Returns `false` if it was already running.
pub fn start(hypervisor: &impl Hypervisor, name: &str, headless: bool) -> Result<bool> {
    ensure_exists(hypervisor, name)?;

    let state = hypervisor.state(name)?;
    if state.is_active() {
        info!(name, state = %state, "VM is already running");
        return Ok(false);
    }

    info!(name, headless, "Starting VM");
    hypervisor.start(name, headless)?;
    Ok(true)
}

/// Stop a machine. Returns `false` if it was not running.
pub fn stop(hypervisor: &impl Hypervisor, name: &str, force: bool) -> Result<bool> {
    ensure_exists(hypervisor, name)?;

    let state = hypervisor.state(name)?;
    if !state.is_active() {
        info!(name, state = %state, "VM is not running");
        return Ok(false);
    }

    if force {
        info!(name, "Powering off VM");
        hypervisor.poweroff(name)?;
    } else {
        info!(name, "Sending ACPI shutdown to VM");
        hypervisor.acpi_shutdown(name)?;
    }
    Ok(true)
}

/// Current state of a machine, or `None` if it does not exist.
pub fn status(hypervisor: &impl Hypervisor, name: &str) -> Result<Option<VmState>> {
    if !hypervisor.exists(name)? {
        return Ok(None);
    }
    Ok(Some(hypervisor.state(name)?))
}

/// Power off (if needed) and delete a machine.
pub fn destroy(hypervisor: &impl Hypervisor, name: &str) -> Result<()> {
    ensure_exists(hypervisor, name)?;

    if hypervisor.state(name)?.is_active() {
        hypervisor.poweroff(name)?;
    }
    info!(name, "Deleting VM");
    hypervisor.unregister(name)
}

fn ensure_exists(hypervisor: &impl Hypervisor, name: &str) -> Result<()> {
    if !hypervisor.exists(name)? {
        bail!("No VM named '{name}', run `ksvm vm create` first");
    }
    debug!(name, "VM exists");
    Ok(())
}

/// VBoxManage resolves relative paths against its own settings directory.
fn absolute(path: PathBuf) -> Result<PathBuf> {
    Ok(if path.is_absolute() {
        path
    } else {
        std::env::current_dir()?.join(path)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::RefCell, collections::HashMap};

    /// Records calls and keeps machine states in memory.
    #[derive(Default)]
    struct FakeHypervisor {
        machines: RefCell<HashMap<String, VmState>>,
        calls: RefCell<Vec<String>>,
    }

    impl FakeHypervisor {
        fn with(name: &str, state: VmState) -> Self {
            let fake = Self::default();
            fake.machines.borrow_mut().insert(name.to_string(), state);
            fake
        }

        fn calls(&self) -> Vec<String> {
            self.calls.borrow().clone()
        }
    }

    impl Hypervisor for FakeHypervisor {
        fn exists(&self, name: &str) -> Result<bool> {
            Ok(self.machines.borrow().contains_key(name))
        }

        fn state(&self, name: &str) -> Result<VmState> {
            Ok(self.machines.borrow()[name].clone())
        }

        fn create(&self, spec: &VmSpec) -> Result<()> {
            self.calls.borrow_mut().push(format!("create {}", spec.name));
            self.machines
                .borrow_mut()
                .insert(spec.name.clone(), VmState::PoweredOff);
            Ok(())
        }

        fn start(&self, name: &str, headless: bool) -> Result<()> {
            self.calls.borrow_mut().push(format!("start {name} {headless}"));
            self.machines
                .borrow_mut()
                .insert(name.to_string(), VmState::Running);
            Ok(())
        }

        fn poweroff(&self, name: &str) -> Result<()> {
            self.calls.borrow_mut().push(format!("poweroff {name}"));
            self.machines
                .borrow_mut()
                .insert(name.to_string(), VmState::PoweredOff);
            Ok(())
        }

        fn acpi_shutdown(&self, name: &str) -> Result<()> {
            self.calls.borrow_mut().push(format!("acpi {name}"));
            Ok(())
        }

        fn unregister(&self, name: &str) -> Result<()> {
            self.calls.borrow_mut().push(format!("unregister {name}"));
            self.machines.borrow_mut().remove(name);
            Ok(())
        }
    }

    fn spec(iso: PathBuf) -> VmSpec {
        VmSpec {
            name: String::from("rocky9"),
            os_type: String::from("RedHat_64"),
            memory_mib: 4096,
            cpus: 2,
            disk: PathBuf::from("/tmp/rocky9.vdi"),
            disk_mib: 20480,
            install_iso: iso,
            serial_log: PathBuf::from("/tmp/serial.log"),
        }
    }

    #[test]
    fn test_state_parsing() {
        assert_eq!("running".parse::<VmState>().unwrap(), VmState::Running);
        assert_eq!("poweroff".parse::<VmState>().unwrap(), VmState::PoweredOff);
        assert_eq!(
            "gurumeditation".parse::<VmState>().unwrap(),
            VmState::Other(String::from("gurumeditation"))
        );
        assert!(VmState::Paused.is_active());
        assert!(!VmState::Aborted.is_active());
    }

    #[test]
    fn test_create() -> Result<()> {
        let iso = tempfile::NamedTempFile::new()?;
        let fake = FakeHypervisor::default();

        create(&fake, &spec(iso.path().to_path_buf()))?;
        assert_eq!(fake.calls(), vec!["create rocky9"]);

        // A second create must not touch the existing machine
        assert!(create(&fake, &spec(iso.path().to_path_buf())).is_err());
        assert_eq!(fake.calls().len(), 1);
        Ok(())
    }

    #[test]
    fn test_create_requires_image() {
        let fake = FakeHypervisor::default();

        assert!(create(&fake, &spec(PathBuf::from("/nonexistent/ks.iso"))).is_err());
        assert!(fake.calls().is_empty());
    }

    #[test]
    fn test_start() -> Result<()> {
        let fake = FakeHypervisor::with("rocky9", VmState::PoweredOff);

        assert!(start(&fake, "rocky9", true)?);
        assert!(!start(&fake, "rocky9", true)?);
        assert_eq!(fake.calls(), vec!["start rocky9 true"]);
        Ok(())
    }

    #[test]
    fn test_start_missing() {
        let fake = FakeHypervisor::default();
        assert!(start(&fake, "rocky9", true).is_err());
    }

    #[test]
    fn test_stop() -> Result<()> {
        let fake = FakeHypervisor::with("rocky9", VmState::Running);

        assert!(stop(&fake, "rocky9", false)?);
        assert!(stop(&fake, "rocky9", true)?);
        assert!(!stop(&fake, "rocky9", true)?);
        assert_eq!(fake.calls(), vec!["acpi rocky9", "poweroff rocky9"]);
        Ok(())
    }

    #[test]
    fn test_status() -> Result<()> {
        let fake = FakeHypervisor::with("rocky9", VmState::Saved);

        assert_eq!(status(&fake, "rocky9")?, Some(VmState::Saved));
        assert_eq!(status(&fake, "alma9")?, None);
        Ok(())
    }

    #[test]
    fn test_destroy_running() -> Result<()> {
        let fake = FakeHypervisor::with("rocky9", VmState::Running);

        destroy(&fake, "rocky9")?;
        assert_eq!(fake.calls(), vec!["poweroff rocky9", "unregister rocky9"]);
        assert_eq!(status(&fake, "rocky9")?, None);
        Ok(())
    }
}
