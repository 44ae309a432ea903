use anyhow::{Context, Result, bail};
use std::{path::PathBuf, process::Command};
use tracing::{debug, warn};

use super::{Hypervisor, VmSpec, VmState};

/// Name of the storage controller ksvm attaches media to.
const STORAGE_CONTROLLER: &str = "SATA";

/// Drives VirtualBox through `VBoxManage`.
pub struct VirtualBox {
    vboxmanage: PathBuf,
}

impl VirtualBox {
    /// Locate `VBoxManage` on the PATH.
    pub fn detect() -> Result<Self> {
        let vboxmanage = which::which("VBoxManage")
            .or_else(|_| which::which("vboxmanage"))
            .context("VBoxManage not found, is VirtualBox installed?")?;
        debug!(path = ?vboxmanage, "Found VBoxManage");
        Ok(Self { vboxmanage })
    }

    fn run<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut command = Command::new(&self.vboxmanage);
        command.args(args);
        debug!(command = ?command, "Running");

        let output = command.output().context("failed to spawn VBoxManage")?;
        if !output.status.success() {
            bail!(
                "VBoxManage exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// The `VBoxManage` invocations that register and configure a machine, in order.
pub fn create_commands(spec: &VmSpec) -> Vec<Vec<String>> {
    let name = spec.name.clone();
    let disk = spec.disk.to_string_lossy().to_string();

    vec![
        vec![
            "createvm".into(),
            "--name".into(),
            name.clone(),
            "--ostype".into(),
            spec.os_type.clone(),
            "--register".into(),
        ],
        vec![
            "modifyvm".into(),
            name.clone(),
            "--memory".into(),
            spec.memory_mib.to_string(),
            "--cpus".into(),
            spec.cpus.to_string(),
            "--ioapic".into(),
            "on".into(),
            "--nic1".into(),
            "nat".into(),
            "--uart1".into(),
            "0x3F8".into(),
            "4".into(),
            "--uartmode1".into(),
            "file".into(),
            spec.serial_log.to_string_lossy().to_string(),
            "--boot1".into(),
            "dvd".into(),
            "--boot2".into(),
            "disk".into(),
            "--boot3".into(),
            "none".into(),
            "--boot4".into(),
            "none".into(),
        ],
        vec![
            "createmedium".into(),
            "disk".into(),
            "--filename".into(),
            disk.clone(),
            "--size".into(),
            spec.disk_mib.to_string(),
            "--format".into(),
            "VDI".into(),
        ],
        vec![
            "storagectl".into(),
            name.clone(),
            "--name".into(),
            STORAGE_CONTROLLER.into(),
            "--add".into(),
            "sata".into(),
            "--controller".into(),
            "IntelAhci".into(),
            "--portcount".into(),
            "2".into(),
        ],
        vec![
            "storageattach".into(),
            name.clone(),
            "--storagectl".into(),
            STORAGE_CONTROLLER.into(),
            "--port".into(),
            "0".into(),
            "--device".into(),
            "0".into(),
            "--type".into(),
            "hdd".into(),
            "--medium".into(),
            disk,
        ],
        vec![
            "storageattach".into(),
            name,
            "--storagectl".into(),
            STORAGE_CONTROLLER.into(),
            "--port".into(),
            "1".into(),
            "--device".into(),
            "0".into(),
            "--type".into(),
            "dvddrive".into(),
            "--medium".into(),
            spec.install_iso.to_string_lossy().to_string(),
        ],
    ]
}

/// Parse the machine names out of `VBoxManage list vms`.
pub fn parse_vm_names(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim().strip_prefix('"')?;
            let end = line.rfind("\" {")?;
            Some(line[..end].to_string())
        })
        .collect()
}

/// Parse `VMState` out of `VBoxManage showvminfo --machinereadable`.
pub fn parse_state(output: &str) -> Option<VmState> {
    output.lines().find_map(|line| {
        let value = line.trim().strip_prefix("VMState=")?;
        value.trim_matches('"').parse().ok()
    })
}

impl Hypervisor for VirtualBox {
    fn exists(&self, name: &str) -> Result<bool> {
        let output = self.run(["list", "vms"])?;
        Ok(parse_vm_names(&output).iter().any(|vm| vm == name))
    }

    fn state(&self, name: &str) -> Result<VmState> {
        let output = self.run(["showvminfo", name, "--machinereadable"])?;
        match parse_state(&output) {
            Some(state) => Ok(state),
            None => bail!("VBoxManage reported no state for '{name}'"),
        }
    }

    fn create(&self, spec: &VmSpec) -> Result<()> {
        let mut commands = create_commands(spec).into_iter();

        // Nothing to roll back until the machine is registered
        if let Some(register) = commands.next() {
            self.run(register)?;
        }

        for args in commands {
            if let Err(error) = self.run(&args) {
                warn!(name = %spec.name, "Configuration failed, removing partially created VM");
                if let Err(cleanup) = self.unregister(&spec.name) {
                    warn!(error = ?cleanup, "Failed to remove partially created VM");
                }
                return Err(error);
            }
        }
        Ok(())
    }

    fn start(&self, name: &str, headless: bool) -> Result<()> {
        let frontend = if headless { "headless" } else { "gui" };
        self.run(["startvm", name, "--type", frontend])?;
        Ok(())
    }

    fn poweroff(&self, name: &str) -> Result<()> {
        self.run(["controlvm", name, "poweroff"])?;
        Ok(())
    }

    fn acpi_shutdown(&self, name: &str) -> Result<()> {
        self.run(["controlvm", name, "acpipowerbutton"])?;
        Ok(())
    }

    fn unregister(&self, name: &str) -> Result<()> {
        self.run(["unregistervm", name, "--delete"])?;
        Ok(())
    }
}
