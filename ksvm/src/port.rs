use anyhow::{Context, Result, bail};
use std::{
    net::{IpAddr, TcpListener},
    process::Command,
    time::Duration,
};
use tracing::{debug, info, warn};

/// How long to wait for evicted processes to release the port.
const EVICTION_GRACE: Duration = Duration::from_secs(1);

/// Check whether something is already listening on the given port.
pub fn in_use(address: IpAddr, port: u16) -> bool {
    TcpListener::bind((address, port)).is_err()
}

/// Parse the PIDs printed by `lsof -t`.
pub fn parse_pids(output: &str) -> Vec<u32> {
    output
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect()
}

fn listeners(port: u16) -> Result<Vec<u32>> {
    let lsof = which::which("lsof").context("lsof not found")?;
    let output = Command::new(lsof)
        .arg("-t")
        .arg(format!("-iTCP:{port}"))
        .arg("-sTCP:LISTEN")
        .output()?;

    // lsof exits non-zero when nothing matches
    Ok(parse_pids(&String::from_utf8_lossy(&output.stdout)))
}

/// Terminate whatever is listening on `port` so the kickstart server can bind it.
///
/// Best effort: failures to find or signal processes are logged, and the call
/// only fails if the port is still bound afterwards.
pub fn evict(address: IpAddr, port: u16) -> Result<()> {
    if !in_use(address, port) {
        debug!(port, "Port is free");
        return Ok(());
    }

    match listeners(port) {
        Ok(pids) if pids.is_empty() => warn!(port, "Port is busy but no listening process found"),
        Ok(pids) => {
            for pid in pids {
                info!(port, pid, "Stopping process holding the HTTP port");
                match Command::new("kill").arg(pid.to_string()).status() {
                    Ok(status) if status.success() => {}
                    Ok(status) => warn!(pid, status = %status, "kill failed"),
                    Err(error) => warn!(pid, error = ?error, "Failed to run kill"),
                }
            }
            std::thread::sleep(EVICTION_GRACE);
        }
        Err(error) => warn!(port, error = ?error, "Failed to list processes on port"),
    }

    if in_use(address, port) {
        bail!("Port {port} is still in use");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[test]
    fn test_in_use() -> Result<()> {
        let listener = TcpListener::bind((LOCALHOST, 0))?;
        let port = listener.local_addr()?.port();

        assert!(in_use(LOCALHOST, port));
        drop(listener);
        assert!(!in_use(LOCALHOST, port));
        Ok(())
    }

    #[test]
    fn test_evict_free_port() -> Result<()> {
        let port = TcpListener::bind((LOCALHOST, 0))?.local_addr()?.port();
        evict(LOCALHOST, port)
    }

    #[test]
    fn test_parse_pids() {
        assert_eq!(parse_pids("1234\n5678\n"), vec![1234, 5678]);
        assert_eq!(parse_pids(" 42 \n\nnot-a-pid\n"), vec![42]);
        assert!(parse_pids("").is_empty());
    }
}
