use anyhow::Result;
use std::{process::ExitCode, time::Duration};
use tokio::runtime::Runtime;
use tracing::{error, info};

use super::VmCommands;
use crate::{
    config::Config,
    console::ConsoleFollower,
    http::KickstartServer,
    port,
    vm::{self, Hypervisor, VirtualBox, VmSpec},
};

/// How often the VM state is checked while `vm start` waits.
const STATE_POLL: Duration = Duration::from_secs(2);

pub fn run(cmd: VmCommands, config: &Config) -> ExitCode {
    let result = VirtualBox::detect().and_then(|hypervisor| match cmd {
        VmCommands::Create { rebuild } => create(&hypervisor, config, rebuild),
        VmCommands::Start { no_follow } => start(&hypervisor, config, !no_follow),
        VmCommands::Stop { force } => vm::stop(&hypervisor, &config.vm.name, force).map(|_| ()),
        VmCommands::Status {} => {
            match vm::status(&hypervisor, &config.vm.name)? {
                Some(state) => println!("{}: {state}", config.vm.name),
                None => println!("{}: not created", config.vm.name),
            }
            println!("Serial log: {}", config.console.log.display());
            println!("Kickstart URL: {}", config.kickstart_url());
            Ok(())
        }
        VmCommands::Destroy {} => vm::destroy(&hypervisor, &config.vm.name),
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = ?err, "VM command failed");
            ExitCode::FAILURE
        }
    }
}

fn create(hypervisor: &impl Hypervisor, config: &Config, rebuild: bool) -> Result<()> {
    if rebuild || !config.iso.output.is_file() {
        let output = super::iso::build(config)?;
        info!(output = ?output, "Built kickstart image");
    }

    vm::create(hypervisor, &VmSpec::from_config(config)?)
}

fn start(hypervisor: &impl Hypervisor, config: &Config, follow: bool) -> Result<()> {
    port::evict(config.http.bind, config.http.port)?;
    let server = KickstartServer::serve(&config.serve_dir(), config.http.bind, config.http.port)?;
    info!(url = %config.kickstart_url(), "Kickstart available");

    vm::start(hypervisor, &config.vm.name, config.vm.headless)?;

    let follower = (follow && config.console.follow).then(|| ConsoleFollower::follow(&config.console.log));
    let result = Runtime::new()?.block_on(wait_for_shutdown(hypervisor, &config.vm.name));

    drop(follower);
    drop(server);
    result
}

/// Wait until the VM is no longer running or the user interrupts.
async fn wait_for_shutdown(hypervisor: &impl Hypervisor, name: &str) -> Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result?;
                info!(name, "Interrupted, the VM keeps running");
                return Ok(());
            }
            _ = tokio::time::sleep(STATE_POLL) => {
                let state = hypervisor.state(name)?;
                if !state.is_active() {
                    info!(name, state = %state, "VM is no longer running");
                    return Ok(());
                }
            }
        }
    }
}
