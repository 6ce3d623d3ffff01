//! Idempotent connectivity repair
//!
//! [`RemediationEngine::fix`] runs a fixed sequence of steps for a
//! tunnel/bridge pair:
//!
//! 1. FORWARD ACCEPT tunnel → bridge, inserted at position 1
//! 2. FORWARD ACCEPT bridge → tunnel with `RELATED,ESTABLISHED`, position 2
//! 3. RETURN bypass at the top of the isolation chain, if that chain exists
//! 4. Both interfaces administratively up, IPv4 forwarding on
//! 5. Removal of FORWARD DROP/REJECT rules naming both interfaces
//!
//! Cleanup runs last so it can never remove what steps 1-3 inserted. Every
//! insert is preceded by an existence check, so a second run applies
//! nothing. A failing step is logged and the remaining steps still run.

use crate::config::AppConfig;
use crate::core::backend::FirewallBackend;
use crate::core::error::{Error, Result};
use crate::core::matcher::InterfacePair;
use crate::core::rule::{RuleSpec, Table};
use crate::core::snapshot::read_table;
use crate::validators::{require_chain_name, require_interface};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
pub enum RemediationStep {
    #[strum(serialize = "forward rule")]
    ForwardRule,
    #[strum(serialize = "return-path rule")]
    ReturnPathRule,
    #[strum(serialize = "isolation bypass")]
    IsolationBypass,
    #[strum(serialize = "interface state")]
    InterfaceState,
    #[strum(serialize = "ip forwarding")]
    IpForwarding,
    #[strum(serialize = "blocking rule cleanup")]
    BlockingRuleCleanup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StepStatus {
    Applied,
    AlreadySatisfied,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step: RemediationStep,
    pub status: StepStatus,
    pub detail: String,
}

/// Outcome of one fix invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationResult {
    pub pair: InterfacePair,
    /// At least one step changed something
    pub success: bool,
    pub fixed_issues: Vec<String>,
    /// Mutating commands in the order they were applied
    pub applied_commands: Vec<String>,
    pub steps: Vec<StepOutcome>,
    pub completed_at: DateTime<Utc>,
}

impl RemediationResult {
    pub fn failed_steps(&self) -> impl Iterator<Item = &StepOutcome> {
        self.steps.iter().filter(|s| s.status == StepStatus::Failed)
    }
}

#[derive(Default)]
struct Progress {
    fixed_issues: Vec<String>,
    applied_commands: Vec<String>,
    steps: Vec<StepOutcome>,
}

impl Progress {
    fn record(&mut self, step: RemediationStep, status: StepStatus, detail: impl Into<String>) {
        let detail = detail.into();
        match status {
            StepStatus::Failed => error!("Remediation step '{}' failed: {}", step, detail),
            _ => debug!("Remediation step '{}': {} ({})", step, status, detail),
        }
        self.steps.push(StepOutcome {
            step,
            status,
            detail,
        });
    }

    fn applied(&mut self, command: String, issue: String) {
        info!("Applied: {}", command);
        self.applied_commands.push(command);
        self.fixed_issues.push(issue);
    }
}

pub struct RemediationEngine<'a, B> {
    backend: &'a B,
    config: &'a AppConfig,
}

impl<'a, B: FirewallBackend> RemediationEngine<'a, B> {
    pub fn new(backend: &'a B, config: &'a AppConfig) -> Self {
        Self { backend, config }
    }

    /// Repairs forwarding between `tunnel` and `bridge`.
    ///
    /// # Errors
    ///
    /// Only validation and interface existence are fatal; step failures are
    /// reported in [`RemediationResult::steps`].
    pub async fn fix(&self, tunnel: &str, bridge: &str) -> Result<RemediationResult> {
        require_interface("tunnel", tunnel)?;
        require_interface("bridge", bridge)?;
        require_chain_name("isolation_chain", &self.config.isolation_chain)?;

        for name in [tunnel, bridge] {
            if !self.backend.interface_exists(name).await? {
                return Err(Error::InterfaceNotFound(name.to_string()));
            }
        }

        info!("Remediating connectivity {} <-> {}", tunnel, bridge);
        let mut progress = Progress::default();

        self.ensure_rule(
            &mut progress,
            RemediationStep::ForwardRule,
            &RuleSpec::forward_accept(tunnel, bridge),
            Some(1),
            format!("Added forward rule {tunnel} -> {bridge}"),
        )
        .await;

        self.ensure_rule(
            &mut progress,
            RemediationStep::ReturnPathRule,
            &RuleSpec::forward_return_path(bridge, tunnel),
            None,
            format!("Added return-path rule {bridge} -> {tunnel}"),
        )
        .await;

        self.ensure_isolation_bypass(&mut progress, tunnel, bridge).await;
        self.ensure_interfaces_up(&mut progress, [tunnel, bridge]).await;
        self.ensure_ip_forward(&mut progress).await;
        self.remove_blocking_rules(&mut progress, tunnel, bridge).await;

        let result = RemediationResult {
            pair: InterfacePair::new(tunnel, bridge),
            success: !progress.applied_commands.is_empty(),
            fixed_issues: progress.fixed_issues,
            applied_commands: progress.applied_commands,
            steps: progress.steps,
            completed_at: Utc::now(),
        };
        info!(
            "Remediation {} <-> {} finished: {} command(s) applied",
            tunnel,
            bridge,
            result.applied_commands.len()
        );
        Ok(result)
    }

    /// Inserts `spec` unless `iptables -C` already finds it. Without an
    /// explicit position the rule goes second, or last if the chain is shorter.
    async fn ensure_rule(
        &self,
        progress: &mut Progress,
        step: RemediationStep,
        spec: &RuleSpec,
        position: Option<u32>,
        issue: String,
    ) {
        match self.backend.rule_exists(spec).await {
            Ok(true) => {
                progress.record(step, StepStatus::AlreadySatisfied, format!("{spec} already present"));
                return;
            }
            Ok(false) => {}
            Err(e) => {
                progress.record(step, StepStatus::Failed, e.to_string());
                return;
            }
        }

        let position = match position {
            Some(pos) => pos,
            None => match self.chain_len(spec.table, &spec.chain).await {
                Ok(len) => (len as u32 + 1).min(2),
                Err(e) => {
                    progress.record(step, StepStatus::Failed, e.to_string());
                    return;
                }
            },
        };

        match self.backend.insert_rule(spec, position).await {
            Ok(()) => {
                let command = spec.insert_command(position);
                progress.record(step, StepStatus::Applied, command.clone());
                progress.applied(command, issue);
            }
            Err(e) => progress.record(step, StepStatus::Failed, e.to_string()),
        }
    }

    async fn chain_len(&self, table: Table, chain: &str) -> Result<usize> {
        Ok(read_table(self.backend, table).await?.chain_rules(chain).len())
    }

    async fn ensure_isolation_bypass(&self, progress: &mut Progress, tunnel: &str, bridge: &str) {
        let step = RemediationStep::IsolationBypass;
        let chain = self.config.isolation_chain.as_str();
        match self.backend.chain_exists(Table::Filter, chain).await {
            Ok(true) => {
                self.ensure_rule(
                    progress,
                    step,
                    &RuleSpec::isolation_bypass(chain, tunnel, bridge),
                    Some(1),
                    format!("Added {chain} bypass {tunnel} -> {bridge}"),
                )
                .await;
            }
            Ok(false) => progress.record(step, StepStatus::Skipped, format!("{chain} does not exist")),
            Err(e) => progress.record(step, StepStatus::Failed, e.to_string()),
        }
    }

    async fn ensure_interfaces_up(&self, progress: &mut Progress, names: [&str; 2]) {
        let step = RemediationStep::InterfaceState;
        let mut failures = Vec::new();
        let mut raised = Vec::new();

        for name in names {
            let result = match self.backend.interface_is_up(name).await {
                Ok(true) => Ok(false),
                Ok(false) => self.backend.set_interface_up(name).await.map(|()| true),
                Err(e) => Err(e),
            };
            match result {
                Ok(true) => {
                    progress.applied(format!("ip link set {name} up"), format!("Brought {name} up"));
                    raised.push(name);
                }
                Ok(false) => {}
                Err(e) => failures.push(format!("{name}: {e}")),
            }
        }

        if !failures.is_empty() {
            progress.record(step, StepStatus::Failed, failures.join("; "));
        } else if raised.is_empty() {
            progress.record(step, StepStatus::AlreadySatisfied, "both interfaces are up");
        } else {
            progress.record(step, StepStatus::Applied, format!("brought up {}", raised.join(", ")));
        }
    }

    async fn ensure_ip_forward(&self, progress: &mut Progress) {
        let step = RemediationStep::IpForwarding;
        match self.backend.ip_forward_enabled().await {
            Ok(true) => progress.record(step, StepStatus::AlreadySatisfied, "net.ipv4.ip_forward=1"),
            Ok(false) => match self.backend.enable_ip_forward().await {
                Ok(()) => {
                    let command = "sysctl -w net.ipv4.ip_forward=1".to_string();
                    progress.record(step, StepStatus::Applied, command.clone());
                    progress.applied(command, "Enabled IPv4 forwarding".to_string());
                }
                Err(e) => progress.record(step, StepStatus::Failed, e.to_string()),
            },
            Err(e) => progress.record(step, StepStatus::Failed, e.to_string()),
        }
    }

    /// Deletes from the highest line number down so earlier deletions do not
    /// renumber later targets.
    async fn remove_blocking_rules(&self, progress: &mut Progress, tunnel: &str, bridge: &str) {
        let step = RemediationStep::BlockingRuleCleanup;
        let listing = match read_table(self.backend, Table::Filter).await {
            Ok(listing) => listing,
            Err(e) => {
                progress.record(step, StepStatus::Failed, e.to_string());
                return;
            }
        };

        let mut lines: Vec<u32> = listing
            .chain_rules("FORWARD")
            .iter()
            .filter(|r| r.targets_any(&["DROP", "REJECT"]) && r.mentions(tunnel) && r.mentions(bridge))
            .map(|r| r.line_number)
            .collect();
        if lines.is_empty() {
            progress.record(step, StepStatus::AlreadySatisfied, "no blocking FORWARD rules");
            return;
        }
        lines.sort_unstable_by(|a, b| b.cmp(a));

        let mut failures = Vec::new();
        let mut removed = 0;
        for line in lines {
            match self.backend.delete_rule(Table::Filter, "FORWARD", line).await {
                Ok(()) => {
                    removed += 1;
                    progress.applied(
                        format!("iptables -D FORWARD {line}"),
                        format!("Removed blocking FORWARD rule at line {line}"),
                    );
                }
                Err(e) => failures.push(format!("line {line}: {e}")),
            }
        }

        if failures.is_empty() {
            progress.record(step, StepStatus::Applied, format!("removed {removed} rule(s)"));
        } else {
            progress.record(step, StepStatus::Failed, failures.join("; "));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::simulated::{SimRule, SimulatedBackend};
    use pretty_assertions::assert_eq;

    const TUN: &str = "tun0";
    const BR: &str = "br-1234567890ab";

    fn base() -> SimulatedBackend {
        SimulatedBackend::new()
            .with_interface(TUN, &[], Some("10.8.0.1"), true)
            .with_interface(BR, &["172.20.0.1/16"], None, true)
    }

    async fn fix(backend: &SimulatedBackend) -> RemediationResult {
        let config = AppConfig::default();
        RemediationEngine::new(backend, &config)
            .fix(TUN, BR)
            .await
            .unwrap()
    }

    fn statuses(result: &RemediationResult) -> Vec<(RemediationStep, StepStatus)> {
        result.steps.iter().map(|s| (s.step, s.status)).collect()
    }

    #[tokio::test]
    async fn test_fix_empty_chain() {
        let backend = base();
        let result = fix(&backend).await;

        assert!(result.success);
        assert_eq!(
            result.applied_commands,
            [
                "iptables -I FORWARD 1 -i tun0 -o br-1234567890ab -j ACCEPT",
                "iptables -I FORWARD 2 -i br-1234567890ab -o tun0 -m conntrack --ctstate RELATED,ESTABLISHED -j ACCEPT",
            ]
        );
        assert_eq!(
            statuses(&result),
            [
                (RemediationStep::ForwardRule, StepStatus::Applied),
                (RemediationStep::ReturnPathRule, StepStatus::Applied),
                (RemediationStep::IsolationBypass, StepStatus::Skipped),
                (RemediationStep::InterfaceState, StepStatus::AlreadySatisfied),
                (RemediationStep::IpForwarding, StepStatus::AlreadySatisfied),
                (RemediationStep::BlockingRuleCleanup, StepStatus::AlreadySatisfied),
            ]
        );
        assert_eq!(backend.rule_count(Table::Filter, "FORWARD"), 2);
    }

    #[tokio::test]
    async fn test_second_run_applies_nothing() {
        let backend = base().with_chain(Table::Filter, "DOCKER-ISOLATION-STAGE-2");
        let first = fix(&backend).await;
        assert_eq!(first.applied_commands.len(), 3);
        let after_first = backend.list_table(Table::Filter).await.unwrap();

        let second = fix(&backend).await;
        assert!(!second.success);
        assert!(second.applied_commands.is_empty());
        assert!(second.failed_steps().next().is_none());
        assert_eq!(backend.list_table(Table::Filter).await.unwrap(), after_first);
    }

    #[tokio::test]
    async fn test_return_rule_goes_second_in_busy_chain() {
        let backend = base()
            .with_rule(Table::Filter, "FORWARD", SimRule::new("DOCKER-USER"))
            .with_rule(Table::Filter, "FORWARD", SimRule::new("ACCEPT").input("eth0"));
        let result = fix(&backend).await;
        assert_eq!(
            result.applied_commands[1],
            "iptables -I FORWARD 2 -i br-1234567890ab -o tun0 -m conntrack --ctstate RELATED,ESTABLISHED -j ACCEPT"
        );
        assert_eq!(backend.rule_count(Table::Filter, "FORWARD"), 4);
    }

    #[tokio::test]
    async fn test_isolation_bypass_inserted_at_top() {
        let backend = base().with_rule(
            Table::Filter,
            "DOCKER-ISOLATION-STAGE-2",
            SimRule::new("DROP").output(BR),
        );
        let result = fix(&backend).await;
        assert!(result.applied_commands.contains(
            &"iptables -I DOCKER-ISOLATION-STAGE-2 1 -i tun0 -o br-1234567890ab -j RETURN".to_string()
        ));
        assert_eq!(backend.rule_count(Table::Filter, "DOCKER-ISOLATION-STAGE-2"), 2);
    }

    #[tokio::test]
    async fn test_interfaces_and_forwarding() {
        let backend = SimulatedBackend::new()
            .with_interface(TUN, &[], None, false)
            .with_interface(BR, &[], None, true)
            .with_ip_forward(false);
        let result = fix(&backend).await;

        assert!(result.applied_commands.contains(&"ip link set tun0 up".to_string()));
        assert!(
            result
                .applied_commands
                .contains(&"sysctl -w net.ipv4.ip_forward=1".to_string())
        );
        assert!(backend.is_up(TUN));
        assert!(backend.ip_forward());
    }

    #[tokio::test]
    async fn test_cleanup_deletes_descending() {
        let backend = base()
            .with_rule(Table::Filter, "FORWARD", SimRule::new("DROP").input(TUN).output(BR))
            .with_rule(Table::Filter, "FORWARD", SimRule::new("ACCEPT").input("eth0"))
            .with_rule(Table::Filter, "FORWARD", SimRule::new("REJECT").input(BR).output(TUN))
            .with_rule(Table::Filter, "FORWARD", SimRule::new("DROP").input(TUN));
        let result = fix(&backend).await;

        // Rules 1 and 2 were inserted above the original four
        let deletes: Vec<_> = result
            .applied_commands
            .iter()
            .filter(|c| c.contains(" -D "))
            .cloned()
            .collect();
        assert_eq!(deletes, ["iptables -D FORWARD 5", "iptables -D FORWARD 3"]);

        let listing = backend.list_table(Table::Filter).await.unwrap();
        let targets: Vec<_> = crate::core::parser::parse_listing(
            Table::Filter,
            &listing,
            crate::core::parser::ListingFormat::LineNumbered,
        )
        .chain_rules("FORWARD")
        .iter()
        .map(|r| r.target.clone())
        .collect();
        assert_eq!(targets, ["ACCEPT", "ACCEPT", "ACCEPT", "DROP"]);
    }

    #[tokio::test]
    async fn test_failed_step_does_not_abort() {
        let backend = base()
            .with_chain(Table::Filter, "DOCKER-ISOLATION-STAGE-2")
            .with_read_only_chain(Table::Filter, "DOCKER-ISOLATION-STAGE-2");
        let result = fix(&backend).await;

        assert!(result.success);
        assert_eq!(result.applied_commands.len(), 2);
        let failed: Vec<_> = result.failed_steps().map(|s| s.step).collect();
        assert_eq!(failed, [RemediationStep::IsolationBypass]);
        assert_eq!(
            result.steps.last().map(|s| s.step),
            Some(RemediationStep::BlockingRuleCleanup)
        );
    }

    #[tokio::test]
    async fn test_missing_interface_is_fatal() {
        let backend = SimulatedBackend::new().with_interface(TUN, &[], None, true);
        let config = AppConfig::default();
        let result = RemediationEngine::new(&backend, &config).fix(TUN, BR).await;
        assert!(matches!(result, Err(Error::InterfaceNotFound(_))));
        assert!(backend.mutations().is_empty());
    }
}
