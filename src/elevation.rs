//! Privilege elevation for firewall operations
//!
//! fwpath runs as an unprivileged user and only elevates the commands that
//! need `CAP_NET_ADMIN`:
//!
//! - **iptables**: listing counters, existence checks, inserts and deletes
//! - **ip**: `ip link set <if> up`
//! - **sysctl**: `sysctl -w net.ipv4.ip_forward=1`
//!
//! Interface introspection (`ip addr`, `ip route`, `ss`) runs unelevated.
//!
//! # Elevation Strategy
//!
//! - **Preferred**: `run0` when available (systemd v256+, no SUID)
//! - **Terminal fallback**: `sudo`
//! - **Non-interactive fallback**: `pkexec`
//!
//! # Environment Variables
//!
//! - `FWPATH_ELEVATION_METHOD`: Force a specific elevation method (`sudo`, `run0`, or `pkexec`).
//!   Useful with sudoers NOPASSWD rules in scripts.
//!   Example: `FWPATH_ELEVATION_METHOD=sudo fwpath fix tun0 br-1234567890ab`
//!
//! - `FWPATH_TEST_NO_ELEVATION`: Bypass elevation entirely (for testing only).
//!
//! # Security
//!
//! - Only specific binaries can be elevated (iptables, ip, sysctl)
//! - Interface and chain names are validated before they reach a command line
//! - Arguments are passed as argv, never through a shell

use std::io;
use tokio::process::Command;

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// pkexec binary not found in PATH
    #[error("pkexec not found - please install PolicyKit")]
    PkexecNotFound,

    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `FWPATH_ELEVATION_METHOD`
    #[error("Invalid FWPATH_ELEVATION_METHOD '{0}'. Valid options: sudo, run0, pkexec")]
    InvalidMethod(String),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Checks if a binary exists in PATH
pub(crate) fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

fn wrapped(elevator: &str, program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(elevator);
    cmd.arg(program).args(args);
    cmd
}

/// Wrapper binary that elevation would go through, `None` when the program
/// runs directly (root, or the test override).
///
/// `sudo` and `run0` may prompt on the controlling terminal, so callers must
/// keep wrapped children in the foreground process group.
pub fn elevation_wrapper() -> Result<Option<String>, ElevationError> {
    use std::os::fd::AsFd;

    // 1. Strict Test Mode Override (Highest Priority)
    if std::env::var("FWPATH_TEST_NO_ELEVATION").is_ok() {
        return Ok(None);
    }

    // 2. Direct Root Execution (No prompt needed)
    if nix::unistd::getuid().is_root() {
        return Ok(None);
    }

    // 3. Explicit elevation method override
    if let Ok(method) = std::env::var("FWPATH_ELEVATION_METHOD") {
        let method = method.to_lowercase();
        if !method.is_empty() {
            return match method.as_str() {
                "sudo" | "run0" | "pkexec" => {
                    if !binary_exists(&method) {
                        return Err(ElevationError::MethodNotAvailable(method));
                    }
                    Ok(Some(method))
                }
                _ => Err(ElevationError::InvalidMethod(method)),
            };
        }
    }

    // 4. Automatic detection - prefer run0, fallback to sudo/pkexec
    if binary_exists("run0") {
        return Ok(Some("run0".to_string()));
    }

    let is_atty = nix::unistd::isatty(std::io::stdin().as_fd()).unwrap_or(false);

    if is_atty {
        Ok(Some("sudo".to_string()))
    } else {
        if !binary_exists("pkexec") {
            return Err(ElevationError::PkexecNotFound);
        }
        Ok(Some("pkexec".to_string()))
    }
}

/// Builds an elevated command for a specific program.
///
/// Not exposed publicly; callers go through the per-tool constructors so only
/// approved binaries can be elevated.
fn build_elevated_command(program: &str, args: &[&str]) -> Result<Command, ElevationError> {
    match elevation_wrapper()? {
        Some(wrapper) => Ok(wrapped(&wrapper, program, args)),
        None => {
            let mut cmd = Command::new(program);
            cmd.args(args);
            Ok(cmd)
        }
    }
}

/// Creates an elevated `iptables` command.
///
/// `program` is the configured iptables binary (`iptables`, `iptables-legacy`,
/// or an absolute path).
///
/// # Example
///
/// ```no_run
/// use fwpath::elevation::create_elevated_iptables_command;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let mut cmd = create_elevated_iptables_command("iptables", &["-t", "filter", "-L", "-n", "-v", "--line-numbers"])?;
/// let output = cmd.output().await?;
/// # Ok(())
/// # }
/// ```
pub fn create_elevated_iptables_command(
    program: &str,
    args: &[&str],
) -> Result<Command, ElevationError> {
    build_elevated_command(program, args)
}

/// Creates an elevated `ip` command (used for `ip link set <if> up`)
pub fn create_elevated_ip_command(program: &str, args: &[&str]) -> Result<Command, ElevationError> {
    build_elevated_command(program, args)
}

/// Creates an elevated `sysctl` command (used for `sysctl -w`)
pub fn create_elevated_sysctl_command(
    program: &str,
    args: &[&str],
) -> Result<Command, ElevationError> {
    build_elevated_command(program, args)
}
