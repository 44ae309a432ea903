pub mod iso;
pub mod vm;

#[derive(clap::Subcommand, Debug, Clone)]
pub enum Commands {
    /// Build kickstart installation images
    Iso {
        #[clap(subcommand)]
        command: IsoCommands,
    },

    /// Manage the installation VM
    Vm {
        #[clap(subcommand)]
        command: VmCommands,
    },
}

#[derive(clap::Subcommand, Debug, Clone)]
pub enum IsoCommands {
    /// Build an installation image that boots straight into the kickstart
    Build {},
}

#[derive(clap::Subcommand, Debug, Clone)]
pub enum VmCommands {
    /// Create the VM with the kickstart image attached
    Create {
        /// Rebuild the kickstart image even if it already exists
        #[clap(long, num_args = 0)]
        rebuild: bool,
    },

    /// Serve the kickstart file and boot the VM
    Start {
        /// Do not print the serial console while waiting
        #[clap(long, num_args = 0)]
        no_follow: bool,
    },

    /// Shut the VM down
    Stop {
        /// Cut the power instead of requesting an ACPI shutdown
        #[clap(long, num_args = 0)]
        force: bool,
    },

    /// Show the VM's power state
    Status {},

    /// Power off and delete the VM along with its disk
    Destroy {},
}
