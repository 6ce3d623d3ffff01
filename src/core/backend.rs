//! Firewall backend
//!
//! [`FirewallBackend`] is the only seam between fwpath and the operating
//! system. [`IptablesBackend`] shells out to `iptables`, `ip`, `sysctl` and
//! `ss`; [`crate::core::simulated::SimulatedBackend`] keeps the same contract
//! in memory for tests.
//!
//! Failures are always typed errors. An empty `Ok` listing means the tool ran
//! and printed nothing, never that it failed.
//!
//! # Timeouts
//!
//! Read-only invocations run in their own process group and are killed as a
//! group (SIGKILL) when `command_timeout_secs` expires or the request is
//! dropped. Queries elevated through `sudo`, `run0` or `pkexec` stay in the
//! foreground group so a password prompt can read the terminal; only the
//! wrapper is killed for those. Mutating invocations
//! are never killed: the caller gets [`Error::Timeout`] and the child keeps
//! running in a detached task, because an iptables killed halfway through a
//! commit can leave the ruleset in an unknown state.

use crate::config::AppConfig;
use crate::core::error::{Error, Result};
use crate::core::netinfo::{
    Connection, InterfaceCounters, RouteEntry, parse_connections, parse_ip_addr,
    parse_routes, parse_sysfs_counter, peer_from_routes,
};
use crate::core::rule::{RuleSpec, Table};
use crate::elevation;
use ipnetwork::IpNetwork;
use std::future::Future;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Capabilities fwpath needs from the live system.
///
/// Implementations must surface tool failures as errors and must not hold
/// in-process locks across an awaited external call.
pub trait FirewallBackend: Send + Sync {
    /// `iptables -t <table> -L -n -v --line-numbers`
    fn list_table(&self, table: Table) -> impl Future<Output = Result<String>> + Send;

    /// `iptables -t <table> -L <chain> -n -v` (no line numbers)
    fn list_chain_verbose(
        &self,
        table: Table,
        chain: &str,
    ) -> impl Future<Output = Result<String>> + Send;

    fn chain_exists(&self, table: Table, chain: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Atomic check without mutation (`iptables -C`)
    fn rule_exists(&self, spec: &RuleSpec) -> impl Future<Output = Result<bool>> + Send;

    /// Inserts at a 1-based position (`iptables -I`)
    fn insert_rule(&self, spec: &RuleSpec, position: u32)
    -> impl Future<Output = Result<()>> + Send;

    /// Deletes by line number (`iptables -D`)
    fn delete_rule(
        &self,
        table: Table,
        chain: &str,
        line_number: u32,
    ) -> impl Future<Output = Result<()>> + Send;

    fn interface_exists(&self, name: &str) -> impl Future<Output = Result<bool>> + Send;

    fn interface_addresses(&self, name: &str)
    -> impl Future<Output = Result<Vec<IpNetwork>>> + Send;

    /// Point-to-point peer of a tunnel, if it has one
    fn tunnel_peer_address(&self, name: &str)
    -> impl Future<Output = Result<Option<IpAddr>>> + Send;

    /// Administrative state (`UP` flag)
    fn interface_is_up(&self, name: &str) -> impl Future<Output = Result<bool>> + Send;

    fn set_interface_up(&self, name: &str) -> impl Future<Output = Result<()>> + Send;

    fn ip_forward_enabled(&self) -> impl Future<Output = Result<bool>> + Send;

    fn enable_ip_forward(&self) -> impl Future<Output = Result<()>> + Send;

    fn interface_counters(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<InterfaceCounters>> + Send;

    fn list_routes(&self) -> impl Future<Output = Result<Vec<RouteEntry>>> + Send;

    fn list_connections(&self) -> impl Future<Output = Result<Vec<Connection>>> + Send;
}

/// How an invocation is treated on timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Invocation {
    /// Safe to kill
    Query,
    /// Left to finish
    Mutation,
}

/// Kills a query's process group when dropped while armed.
///
/// Covers both the timeout path and an abandoned request future.
struct ProcessGroupGuard {
    pgid: Option<nix::unistd::Pid>,
}

impl ProcessGroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pgid: pid
                .and_then(|p| i32::try_from(p).ok())
                .map(nix::unistd::Pid::from_raw),
        }
    }

    /// The group finished on its own
    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            debug!("Killing process group {}", pgid);
            let _ = nix::sys::signal::killpg(pgid, nix::sys::signal::Signal::SIGKILL);
        }
    }
}

#[derive(Debug)]
struct ToolOutput {
    success: bool,
    exit_code: Option<i32>,
    stdout: String,
    stderr: String,
}

fn is_unknown_chain(stderr: &str) -> bool {
    stderr.to_lowercase().contains("no chain/target/match by that name")
}

/// `-C` reports "absent" with exit 1 and one of these messages
fn is_absent_rule(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.trim().is_empty()
        || lower.contains("bad rule")
        || lower.contains("does a matching rule exist")
}

/// Backend driving the real tools.
#[derive(Debug, Clone)]
pub struct IptablesBackend {
    iptables: String,
    ip: String,
    sysctl: String,
    ss: String,
    timeout: Duration,
    sys_class_net: PathBuf,
}

impl IptablesBackend {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            iptables: config.iptables_path.clone(),
            ip: config.ip_path.clone(),
            sysctl: config.sysctl_path.clone(),
            ss: config.ss_path.clone(),
            timeout: config.command_timeout(),
            sys_class_net: PathBuf::from(crate::utils::SYS_CLASS_NET),
        }
    }

    async fn run(
        &self,
        program: &str,
        args: &[String],
        elevated: bool,
        kind: Invocation,
    ) -> Result<ToolOutput> {
        let argv: Vec<&str> = args.iter().map(String::as_str).collect();
        debug!("Running {} {}", program, argv.join(" "));

        let wrapper = if elevated {
            elevation::elevation_wrapper()?
        } else {
            None
        };
        let own_group = kind == Invocation::Query && wrapper.is_none();

        let mut cmd = if elevated {
            if program == self.iptables {
                elevation::create_elevated_iptables_command(program, &argv)?
            } else if program == self.ip {
                elevation::create_elevated_ip_command(program, &argv)?
            } else if program == self.sysctl {
                elevation::create_elevated_sysctl_command(program, &argv)?
            } else {
                return Err(Error::Internal(format!("{program} is not allowed to elevate")));
            }
        } else {
            let mut cmd = tokio::process::Command::new(program);
            cmd.args(&argv);
            cmd
        };

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if kind == Invocation::Query {
            cmd.kill_on_drop(true);
        }
        if own_group {
            cmd.process_group(0);
        }

        let child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                warn!("Failed to spawn {}: {}", program, e);
                Error::ToolUnavailable {
                    program: program.to_string(),
                }
            }
            _ => Error::Io(e),
        })?;

        let timeout_err = || Error::Timeout {
            program: program.to_string(),
            seconds: self.timeout.as_secs(),
        };

        let output = match kind {
            Invocation::Query => {
                let mut group = ProcessGroupGuard::new(child.id().filter(|_| own_group));
                match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
                    Ok(result) => {
                        group.disarm();
                        result?
                    }
                    Err(_) => {
                        warn!("{} timed out after {:?}, killing it", program, self.timeout);
                        return Err(timeout_err());
                    }
                }
            }
            Invocation::Mutation => {
                let mut handle = tokio::spawn(child.wait_with_output());
                match tokio::time::timeout(self.timeout, &mut handle).await {
                    Ok(joined) => joined
                        .map_err(|e| Error::Internal(format!("Failed to wait for {program}: {e}")))??,
                    Err(_) => {
                        warn!(
                            "{} did not finish within {:?}; leaving it to complete",
                            program, self.timeout
                        );
                        return Err(timeout_err());
                    }
                }
            }
        };

        Ok(ToolOutput {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn failed(program: &str, args: &[String], output: ToolOutput) -> Error {
        Error::ToolExecutionFailed {
            program: program.to_string(),
            args: args.to_vec(),
            stderr: output.stderr,
            exit_code: output.exit_code,
        }
    }

    async fn iptables_query(&self, args: Vec<String>) -> Result<ToolOutput> {
        self.run(&self.iptables, &args, true, Invocation::Query).await
    }

    /// Runs a mutating iptables command; non-zero exit is an error
    async fn iptables_mutate(&self, args: Vec<String>, table: Table, chain: &str) -> Result<()> {
        let output = self
            .run(&self.iptables, &args, true, Invocation::Mutation)
            .await?;
        if output.success {
            info!("Applied: iptables {}", args.join(" "));
            Ok(())
        } else if is_unknown_chain(&output.stderr) {
            Err(Error::ChainNotFound {
                table: table.to_string(),
                chain: chain.to_string(),
            })
        } else {
            Err(Self::failed(&self.iptables, &args, output))
        }
    }

    async fn ip_addr(&self, name: &str) -> Result<crate::core::netinfo::InterfaceAddresses> {
        let args = vec![
            "addr".to_string(),
            "show".to_string(),
            "dev".to_string(),
            name.to_string(),
        ];
        let output = self.run(&self.ip, &args, false, Invocation::Query).await?;
        if !output.success {
            if output.stderr.contains("does not exist") {
                return Err(Error::InterfaceNotFound(name.to_string()));
            }
            return Err(Self::failed(&self.ip, &args, output));
        }
        Ok(parse_ip_addr(&output.stdout))
    }

    async fn read_counter(&self, name: &str, counter: &str) -> Result<u64> {
        let path = self
            .sys_class_net
            .join(name)
            .join("statistics")
            .join(counter);
        let text = tokio::fs::read_to_string(&path).await.map_err(|e| {
            debug!("Cannot read {}: {}", path.display(), e);
            e
        })?;
        Ok(parse_sysfs_counter(&text))
    }
}

fn table_args(table: Table, rest: &[&str]) -> Vec<String> {
    let mut args = vec!["-t".to_string(), table.as_str().to_string()];
    args.extend(rest.iter().map(|s| (*s).to_string()));
    args
}

impl FirewallBackend for IptablesBackend {
    async fn list_table(&self, table: Table) -> Result<String> {
        let args = table_args(table, &["-L", "-n", "-v", "--line-numbers"]);
        let output = self.iptables_query(args.clone()).await?;
        if output.success {
            Ok(output.stdout)
        } else {
            Err(Self::failed(&self.iptables, &args, output))
        }
    }

    async fn list_chain_verbose(&self, table: Table, chain: &str) -> Result<String> {
        let args = table_args(table, &["-L", chain, "-n", "-v"]);
        let output = self.iptables_query(args.clone()).await?;
        if output.success {
            Ok(output.stdout)
        } else if is_unknown_chain(&output.stderr) {
            Err(Error::ChainNotFound {
                table: table.to_string(),
                chain: chain.to_string(),
            })
        } else {
            Err(Self::failed(&self.iptables, &args, output))
        }
    }

    async fn chain_exists(&self, table: Table, chain: &str) -> Result<bool> {
        match self.list_chain_verbose(table, chain).await {
            Ok(_) => Ok(true),
            Err(Error::ChainNotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn rule_exists(&self, spec: &RuleSpec) -> Result<bool> {
        let args = spec.check_args();
        let output = self.iptables_query(args.clone()).await?;
        if output.success {
            return Ok(true);
        }
        if is_unknown_chain(&output.stderr) {
            return Err(Error::ChainNotFound {
                table: spec.table.to_string(),
                chain: spec.chain.clone(),
            });
        }
        if output.exit_code == Some(1) && is_absent_rule(&output.stderr) {
            return Ok(false);
        }
        Err(Self::failed(&self.iptables, &args, output))
    }

    async fn insert_rule(&self, spec: &RuleSpec, position: u32) -> Result<()> {
        self.iptables_mutate(spec.insert_args(position), spec.table, &spec.chain)
            .await
    }

    async fn delete_rule(&self, table: Table, chain: &str, line_number: u32) -> Result<()> {
        let line = line_number.to_string();
        let args = table_args(table, &["-D", chain, &line]);
        self.iptables_mutate(args, table, chain).await
    }

    async fn interface_exists(&self, name: &str) -> Result<bool> {
        let args = vec![
            "link".to_string(),
            "show".to_string(),
            "dev".to_string(),
            name.to_string(),
        ];
        let output = self.run(&self.ip, &args, false, Invocation::Query).await?;
        if output.success {
            Ok(true)
        } else if output.stderr.contains("does not exist") {
            Ok(false)
        } else {
            Err(Self::failed(&self.ip, &args, output))
        }
    }

    async fn interface_addresses(&self, name: &str) -> Result<Vec<IpNetwork>> {
        Ok(self.ip_addr(name).await?.addresses)
    }

    async fn tunnel_peer_address(&self, name: &str) -> Result<Option<IpAddr>> {
        if let Some(peer) = self.ip_addr(name).await?.peer {
            return Ok(Some(peer));
        }

        let args = vec![
            "route".to_string(),
            "show".to_string(),
            "dev".to_string(),
            name.to_string(),
        ];
        let output = self.run(&self.ip, &args, false, Invocation::Query).await?;
        if !output.success {
            return Err(Self::failed(&self.ip, &args, output));
        }
        Ok(peer_from_routes(&output.stdout))
    }

    async fn interface_is_up(&self, name: &str) -> Result<bool> {
        Ok(self.ip_addr(name).await?.up)
    }

    async fn set_interface_up(&self, name: &str) -> Result<()> {
        let args = vec![
            "link".to_string(),
            "set".to_string(),
            "dev".to_string(),
            name.to_string(),
            "up".to_string(),
        ];
        let output = self.run(&self.ip, &args, true, Invocation::Mutation).await?;
        if output.success {
            info!("Brought up interface {}", name);
            Ok(())
        } else {
            Err(Self::failed(&self.ip, &args, output))
        }
    }

    async fn ip_forward_enabled(&self) -> Result<bool> {
        let args = vec!["-n".to_string(), "net.ipv4.ip_forward".to_string()];
        let output = self.run(&self.sysctl, &args, false, Invocation::Query).await?;
        if output.success {
            Ok(output.stdout.trim() == "1")
        } else {
            Err(Self::failed(&self.sysctl, &args, output))
        }
    }

    async fn enable_ip_forward(&self) -> Result<()> {
        let args = vec!["-w".to_string(), "net.ipv4.ip_forward=1".to_string()];
        let output = self
            .run(&self.sysctl, &args, true, Invocation::Mutation)
            .await?;
        if output.success {
            info!("Enabled net.ipv4.ip_forward");
            Ok(())
        } else {
            Err(Self::failed(&self.sysctl, &args, output))
        }
    }

    async fn interface_counters(&self, name: &str) -> Result<InterfaceCounters> {
        Ok(InterfaceCounters {
            rx_packets: self.read_counter(name, "rx_packets").await?,
            tx_packets: self.read_counter(name, "tx_packets").await?,
            rx_bytes: self.read_counter(name, "rx_bytes").await?,
            tx_bytes: self.read_counter(name, "tx_bytes").await?,
        })
    }

    async fn list_routes(&self) -> Result<Vec<RouteEntry>> {
        let args = vec!["route".to_string(), "show".to_string()];
        let output = self.run(&self.ip, &args, false, Invocation::Query).await?;
        if output.success {
            Ok(parse_routes(&output.stdout))
        } else {
            Err(Self::failed(&self.ip, &args, output))
        }
    }

    async fn list_connections(&self) -> Result<Vec<Connection>> {
        let args = vec!["-tuln".to_string()];
        let output = self.run(&self.ss, &args, false, Invocation::Query).await?;
        if output.success {
            Ok(parse_connections(&output.stdout))
        } else {
            Err(Self::failed(&self.ss, &args, output))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::ENV_VAR_MUTEX;

    fn backend_with(iptables: &str, timeout_secs: u64) -> IptablesBackend {
        let config = AppConfig {
            iptables_path: iptables.to_string(),
            ip_path: "fwpath_missing_ip_xyz".to_string(),
            command_timeout_secs: timeout_secs,
            ..AppConfig::default()
        };
        IptablesBackend::new(&config)
    }

    #[test]
    fn test_absent_rule_messages() {
        assert!(is_absent_rule(
            "iptables: Bad rule (does a matching rule exist in that chain?).\n"
        ));
        assert!(is_absent_rule(""));
        assert!(!is_absent_rule("iptables: Permission denied (you must be root)."));
        assert!(is_unknown_chain("iptables: No chain/target/match by that name.\n"));
    }

    #[tokio::test]
    #[allow(clippy::await_holding_lock)]
    async fn test_missing_binary_is_tool_unavailable() {
        let _guard = ENV_VAR_MUTEX.lock().unwrap();
        unsafe {
            std::env::set_var("FWPATH_TEST_NO_ELEVATION", "1");
        }
        let backend = backend_with("fwpath_missing_iptables_xyz", 5);
        let err = backend.list_table(Table::Filter).await.unwrap_err();
        assert!(matches!(err, Error::ToolUnavailable { ref program } if program == "fwpath_missing_iptables_xyz"));

        let err = backend.interface_exists("tun0").await.unwrap_err();
        assert!(matches!(err, Error::ToolUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_query_timeout_kills_child() {
        // `sleep` stands in for a hung tool; unelevated query path
        let backend = backend_with("iptables", 1);
        let args = vec!["5".to_string()];
        let started = std::time::Instant::now();
        let err = backend
            .run("sleep", &args, false, Invocation::Query)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { seconds: 1, .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_dropped_guard_kills_process_group() {
        use std::os::unix::process::ExitStatusExt;

        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap();
        drop(ProcessGroupGuard::new(child.id()));

        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.signal(), Some(9));
    }

    #[tokio::test]
    async fn test_disarmed_guard_leaves_group_alone() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("0.2")
            .process_group(0)
            .spawn()
            .unwrap();
        let mut guard = ProcessGroupGuard::new(child.id());
        guard.disarm();
        drop(guard);

        assert!(child.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn test_interface_counters_from_sysfs() {
        let dir = tempfile::tempdir().unwrap();
        let stats = dir.path().join("tun0").join("statistics");
        std::fs::create_dir_all(&stats).unwrap();
        for (name, value) in [
            ("rx_packets", "10\n"),
            ("tx_packets", "20\n"),
            ("rx_bytes", "1000\n"),
            ("tx_bytes", "2000\n"),
        ] {
            std::fs::write(stats.join(name), value).unwrap();
        }

        let mut backend = backend_with("iptables", 5);
        backend.sys_class_net = dir.path().to_path_buf();

        let counters = backend.interface_counters("tun0").await.unwrap();
        assert_eq!(
            counters,
            InterfaceCounters {
                rx_packets: 10,
                tx_packets: 20,
                rx_bytes: 1000,
                tx_bytes: 2000,
            }
        );

        let err = backend.interface_counters("tun9").await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_reported() {
        let backend = backend_with("iptables", 5);
        let args = vec!["-c".to_string(), "echo boom >&2; exit 3".to_string()];
        let output = backend
            .run("sh", &args, false, Invocation::Query)
            .await
            .unwrap();
        assert!(!output.success);
        assert_eq!(output.exit_code, Some(3));
        let err = IptablesBackend::failed("sh", &args, output);
        assert_eq!(err.to_string(), "sh failed: boom");
    }
}
