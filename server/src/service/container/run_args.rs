//! Run argument extraction and typed accessors
//!
//! Raw `runArgs` tokens from devcontainer.json are reduced to the flags the
//! deployment accepts, then converted into engine host and container settings.

use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;
use std::time::Duration;

use bollard::models::{
    HealthConfig, HostConfig, HostConfigCgroupnsModeEnum, HostConfigIsolationEnum,
    ResourcesUlimits, RestartPolicy, RestartPolicyNameEnum,
};
use regex::Regex;

use crate::domain::devcontainer::Mount;
use crate::domain::run_arg::{RunArg, RunArgDefinition, RunArgValue};
use crate::error::{Error, Result};
use crate::service::logger::{log_and_wrap, GitspaceLogger};

static RAM_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+(?:\.\d+)*) ?([kKmMgGtTpP])?[iI]?[bB]?$").expect("valid RAM pattern")
});

static DURATION_PART: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+(?:\.\d*)?|\.\d+)(ns|us|µs|ms|s|m|h)").expect("valid duration pattern")
});

/// How the base image is fetched before container creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullPolicy {
    Always,
    Missing,
    Never,
}

impl PullPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            PullPolicy::Always => "always",
            PullPolicy::Missing => "missing",
            PullPolicy::Never => "never",
        }
    }
}

/// Run argument definitions for deployments without custom policy
pub fn default_definitions() -> HashMap<RunArg, RunArgDefinition> {
    const MULTIPLE: &[RunArg] = &[
        RunArg::AddHost,
        RunArg::Annotation,
        RunArg::CapAdd,
        RunArg::CapDrop,
        RunArg::Dns,
        RunArg::DnsOption,
        RunArg::DnsSearch,
        RunArg::Env,
        RunArg::Label,
        RunArg::Link,
        RunArg::Mount,
        RunArg::SecurityOpt,
        RunArg::StorageOpt,
        RunArg::Sysctl,
        RunArg::Ulimit,
    ];

    RunArg::ALL
        .iter()
        .map(|&arg| {
            let mut definition = RunArgDefinition::new(arg);
            if MULTIPLE.contains(&arg) {
                definition = definition.multiple();
            }
            definition = match arg {
                RunArg::Network | RunArg::Pid | RunArg::Ipc => definition.block(&["host"]),
                RunArg::Pull => definition.allow(&["always", "missing", "never"]),
                // Removing the container on exit would lose the gitspace
                RunArg::Rm | RunArg::KernelMemory => definition.unsupported(),
                _ => definition,
            };
            (arg, definition)
        })
        .collect()
}

/// A flag token; `-1` style negative numbers are values
fn is_arg(token: &str) -> bool {
    let mut chars = token.chars();
    match (chars.next(), chars.next()) {
        (Some('-'), Some(c)) => !c.is_ascii_digit(),
        _ => false,
    }
}

/// Parsed run arguments keyed by flag
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunArgs {
    values: BTreeMap<RunArg, RunArgValue>,
}

impl RunArgs {
    /// Reduce raw tokens to the accepted flags and their values.
    ///
    /// Unknown and unsupported flags are skipped. A flag whose values were
    /// all rejected by its allow or block list is skipped as well.
    pub fn extract(
        definitions: &HashMap<RunArg, RunArgDefinition>,
        tokens: &[String],
    ) -> Result<Self> {
        let mut values: BTreeMap<RunArg, RunArgValue> = BTreeMap::new();
        let mut i = 0;

        while i < tokens.len() {
            let token = &tokens[i];
            i += 1;
            if !is_arg(token) {
                continue;
            }

            let stripped = token.trim_start_matches('-');
            let (flag, mut collected) = match stripped.split_once('=') {
                Some((flag, value)) => (flag, vec![value.to_string()]),
                None => {
                    let mut collected = Vec::new();
                    while i < tokens.len() && !is_arg(&tokens[i]) {
                        collected.push(tokens[i].clone());
                        i += 1;
                    }
                    (stripped, collected)
                }
            };

            let Some(arg) = RunArg::from_flag(flag) else {
                continue;
            };
            let Some(definition) = definitions.get(&arg).filter(|d| d.supported) else {
                continue;
            };

            let had_values = !collected.is_empty();
            collected = definition.filter_values(collected);
            if had_values && collected.is_empty() {
                // Every value was rejected, so the flag is dropped entirely
                continue;
            }

            match values.get_mut(&arg) {
                Some(existing) if definition.allow_multiple_occurrences => {
                    existing.values.extend(collected);
                }
                _ => {
                    values.insert(
                        arg,
                        RunArgValue {
                            name: arg,
                            values: collected,
                        },
                    );
                }
            }
        }

        Ok(Self { values })
    }

    /// Extract and report the outcome to the gitspace log
    pub fn extract_with_logging(
        definitions: &HashMap<RunArg, RunArgDefinition>,
        tokens: &[String],
        logger: &dyn GitspaceLogger,
    ) -> Result<Self> {
        let args = Self::extract(definitions, tokens)
            .map_err(|e| log_and_wrap(logger, "Error while extracting runArgs", e))?;

        if args.is_empty() {
            logger.info("No runArgs found");
        } else {
            let listed: String = args
                .values
                .iter()
                .map(|(arg, value)| format!("{}: {}\n", arg, value))
                .collect();
            logger.info(&format!("Using the following runArgs\n{}", listed));
        }
        Ok(args)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn contains(&self, arg: RunArg) -> bool {
        self.values.contains_key(&arg)
    }

    pub fn get(&self, arg: RunArg) -> Option<&RunArgValue> {
        self.values.get(&arg)
    }

    /// First value of `arg`, empty when absent
    pub fn string(&self, arg: RunArg) -> String {
        self.values
            .get(&arg)
            .and_then(|v| v.values.first())
            .cloned()
            .unwrap_or_default()
    }

    pub fn optional_string(&self, arg: RunArg) -> Option<String> {
        Some(self.string(arg)).filter(|s| !s.is_empty())
    }

    pub fn strings(&self, arg: RunArg) -> Vec<String> {
        self.values
            .get(&arg)
            .map(|v| v.values.clone())
            .unwrap_or_default()
    }

    fn invalid(arg: RunArg, value: &str, reason: impl Into<String>) -> Error {
        Error::InvalidRunArg {
            arg: arg.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    pub fn int64(&self, arg: RunArg) -> Result<Option<i64>> {
        self.optional_string(arg)
            .map(|value| {
                value
                    .parse::<i64>()
                    .map_err(|e| Self::invalid(arg, &value, e.to_string()))
            })
            .transpose()
    }

    pub fn uint16(&self, arg: RunArg) -> Result<Option<u16>> {
        self.optional_string(arg)
            .map(|value| {
                value
                    .parse::<u16>()
                    .map_err(|e| Self::invalid(arg, &value, e.to_string()))
            })
            .transpose()
    }

    pub fn uint64(&self, arg: RunArg) -> Result<Option<u64>> {
        self.optional_string(arg)
            .map(|value| {
                value
                    .parse::<u64>()
                    .map_err(|e| Self::invalid(arg, &value, e.to_string()))
            })
            .transpose()
    }

    /// Duration in nanoseconds as the engine API expects it
    pub fn duration_nanos(&self, arg: RunArg) -> Result<Option<i64>> {
        self.duration(arg)?
            .map(|d| {
                i64::try_from(d.as_nanos()).map_err(|_| {
                    Self::invalid(arg, &self.string(arg), "duration out of range")
                })
            })
            .transpose()
    }

    /// Unsigned value that must still fit the engine's signed field
    pub fn uint64_as_int64(&self, arg: RunArg) -> Result<Option<i64>> {
        self.uint64(arg)?
            .map(|v| {
                i64::try_from(v)
                    .map_err(|_| Self::invalid(arg, &self.string(arg), "value out of range"))
            })
            .transpose()
    }

    pub fn duration(&self, arg: RunArg) -> Result<Option<Duration>> {
        self.optional_string(arg)
            .map(|value| parse_duration(&value).map_err(|reason| Self::invalid(arg, &value, reason)))
            .transpose()
    }

    pub fn memory_bytes(&self, arg: RunArg) -> Result<Option<i64>> {
        self.optional_string(arg)
            .map(|value| ram_in_bytes(&value).map_err(|reason| Self::invalid(arg, &value, reason)))
            .transpose()
    }

    /// Presence flag; `Some(true)` when given, `None` otherwise
    pub fn bool_flag(&self, arg: RunArg) -> Option<bool> {
        self.contains(arg).then_some(true)
    }

    /// `--cpus` as nano CPUs
    pub fn nano_cpus(&self) -> Result<Option<i64>> {
        self.optional_string(RunArg::Cpus)
            .map(|value| {
                parse_nano_cpus(&value).map_err(|reason| Self::invalid(RunArg::Cpus, &value, reason))
            })
            .transpose()
    }

    /// `--memory-swap`, where `-1` means unlimited
    pub fn memory_swap(&self) -> Result<Option<i64>> {
        match self.optional_string(RunArg::MemorySwap).as_deref() {
            Some("-1") => Ok(Some(-1)),
            _ => self.memory_bytes(RunArg::MemorySwap),
        }
    }

    pub fn ulimits(&self) -> Result<Option<Vec<ResourcesUlimits>>> {
        if !self.contains(RunArg::Ulimit) {
            return Ok(None);
        }
        self.strings(RunArg::Ulimit)
            .iter()
            .map(|raw| parse_ulimit(raw).map_err(|reason| Self::invalid(RunArg::Ulimit, raw, reason)))
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }

    pub fn pull_policy(&self) -> PullPolicy {
        match self.string(RunArg::Pull).as_str() {
            "always" => PullPolicy::Always,
            "never" => PullPolicy::Never,
            _ => PullPolicy::Missing,
        }
    }

    pub fn user(&self) -> Option<String> {
        self.optional_string(RunArg::User)
    }

    pub fn platform(&self) -> Option<String> {
        self.optional_string(RunArg::Platform)
    }

    pub fn entrypoint(&self) -> Vec<String> {
        self.strings(RunArg::Entrypoint)
    }

    pub fn env(&self) -> Vec<String> {
        self.strings(RunArg::Env)
    }

    /// `key=value` pairs; a missing `=` yields an empty value
    fn key_values(&self, arg: RunArg) -> HashMap<String, String> {
        self.strings(arg)
            .iter()
            .map(|raw| match raw.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (raw.clone(), String::new()),
            })
            .collect()
    }

    pub fn labels(&self) -> HashMap<String, String> {
        self.key_values(RunArg::Label)
    }

    /// Annotations without a value are dropped
    pub fn annotations(&self) -> HashMap<String, String> {
        self.strings(RunArg::Annotation)
            .iter()
            .filter_map(|raw| match raw.split_once('=') {
                Some((k, v)) => Some((k.to_string(), v.to_string())),
                None => {
                    tracing::warn!("invalid annotation: {}", raw);
                    None
                }
            })
            .collect()
    }

    pub fn mounts(&self) -> Result<Vec<Mount>> {
        self.strings(RunArg::Mount)
            .iter()
            .map(|raw| Mount::parse(raw))
            .collect()
    }

    pub fn restart_policy(&self) -> Result<Option<RestartPolicy>> {
        let Some(value) = self.optional_string(RunArg::Restart) else {
            return Ok(None);
        };
        let (mode, count) = match value.split_once(':') {
            Some((mode, count)) => (mode, Some(count)),
            None => (value.as_str(), None),
        };

        let name = match mode {
            "no" => RestartPolicyNameEnum::NO,
            "always" => RestartPolicyNameEnum::ALWAYS,
            "unless-stopped" => RestartPolicyNameEnum::UNLESS_STOPPED,
            "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
            other => {
                return Err(Self::invalid(
                    RunArg::Restart,
                    &value,
                    format!("unknown restart policy {}", other),
                ))
            }
        };
        let maximum_retry_count = match count {
            Some(count) if name == RestartPolicyNameEnum::ON_FAILURE => Some(
                count
                    .parse::<i64>()
                    .map_err(|e| Self::invalid(RunArg::Restart, &value, e.to_string()))?,
            ),
            _ => None,
        };

        Ok(Some(RestartPolicy {
            name: Some(name),
            maximum_retry_count,
        }))
    }

    pub fn health_check(&self) -> Result<Option<HealthConfig>> {
        let health = HealthConfig {
            test: if self.contains(RunArg::NoHealthcheck) {
                Some(vec!["NONE".to_string()])
            } else {
                self.get(RunArg::HealthCmd).map(|v| v.values.clone())
            },
            interval: self.duration_nanos(RunArg::HealthInterval)?,
            timeout: self.duration_nanos(RunArg::HealthTimeout)?,
            retries: self.int64(RunArg::HealthRetries)?,
            start_period: self.duration_nanos(RunArg::HealthStartPeriod)?,
            start_interval: self.duration_nanos(RunArg::HealthStartInterval)?,
        };

        if health == HealthConfig::default() {
            Ok(None)
        } else {
            Ok(Some(health))
        }
    }

    pub fn stop_timeout(&self) -> Result<Option<i64>> {
        self.int64(RunArg::StopTimeout)
    }

    /// Fill the resource, namespace and runtime settings of `host`.
    ///
    /// Malformed numeric values fail; settings owned by other sources
    /// (mounts, capabilities, init, privileged) are left untouched.
    pub fn apply_to_host_config(&self, host: &mut HostConfig) -> Result<()> {
        host.blkio_weight = self.uint16(RunArg::BlkioWeight)?;
        host.cpu_shares = self.int64(RunArg::CpuShares)?;
        host.memory = self.memory_bytes(RunArg::Memory)?;
        host.nano_cpus = self.nano_cpus()?;
        host.cgroup_parent = self.optional_string(RunArg::CgroupParent);
        host.cpu_period = self.int64(RunArg::CpuPeriod)?;
        host.cpu_quota = self.int64(RunArg::CpuQuota)?;
        host.cpu_realtime_period = self.int64(RunArg::CpuRtPeriod)?;
        host.cpu_realtime_runtime = self.int64(RunArg::CpuRtRuntime)?;
        host.cpuset_cpus = self.optional_string(RunArg::CpusetCpus);
        host.cpuset_mems = self.optional_string(RunArg::CpusetMems);
        host.cpu_count = self.int64(RunArg::CpuCount)?;
        host.cpu_percent = self.int64(RunArg::CpuPercent)?;
        host.memory_reservation = self.memory_bytes(RunArg::MemoryReservation)?;
        host.memory_swappiness = self.int64(RunArg::MemorySwappiness)?;
        host.memory_swap = self.memory_swap()?;
        host.oom_kill_disable = self.bool_flag(RunArg::OomKillDisable);
        host.pids_limit = self.int64(RunArg::PidsLimit)?;
        host.io_maximum_iops = self.uint64_as_int64(RunArg::IoMaxiops)?;
        host.io_maximum_bandwidth = self.memory_bytes(RunArg::IoMaxbandwidth)?;
        host.ulimits = self.ulimits()?;

        host.annotations = Some(self.annotations()).filter(|a| !a.is_empty());
        host.network_mode = self.optional_string(RunArg::Network);
        host.restart_policy = self.restart_policy()?;
        host.auto_remove = self.bool_flag(RunArg::Rm);
        host.cap_drop = Some(self.strings(RunArg::CapDrop)).filter(|c| !c.is_empty());
        host.cgroupns_mode = match self.string(RunArg::Cgroupns).as_str() {
            "host" => Some(HostConfigCgroupnsModeEnum::HOST),
            "private" => Some(HostConfigCgroupnsModeEnum::PRIVATE),
            _ => None,
        };
        host.dns = Some(self.strings(RunArg::Dns)).filter(|d| !d.is_empty());
        host.dns_options = Some(self.strings(RunArg::DnsOption)).filter(|d| !d.is_empty());
        host.dns_search = Some(self.strings(RunArg::DnsSearch)).filter(|d| !d.is_empty());
        host.ipc_mode = self.optional_string(RunArg::Ipc);
        host.isolation = match self.string(RunArg::Isolation).as_str() {
            "default" => Some(HostConfigIsolationEnum::DEFAULT),
            "process" => Some(HostConfigIsolationEnum::PROCESS),
            "hyperv" => Some(HostConfigIsolationEnum::HYPERV),
            _ => None,
        };
        host.links = Some(self.strings(RunArg::Link)).filter(|l| !l.is_empty());
        host.oom_score_adj = self.int64(RunArg::OomScoreAdj)?;
        host.pid_mode = self.optional_string(RunArg::Pid);
        host.runtime = self.optional_string(RunArg::Runtime);
        host.storage_opt = Some(self.key_values(RunArg::StorageOpt)).filter(|s| !s.is_empty());
        host.shm_size = self.memory_bytes(RunArg::ShmSize)?;
        host.sysctls = Some(self.key_values(RunArg::Sysctl)).filter(|s| !s.is_empty());

        let mut extra_hosts = self.strings(RunArg::AddHost);
        if cfg!(target_os = "linux") {
            extra_hosts.push("host.docker.internal:host-gateway".to_string());
        }
        host.extra_hosts = Some(extra_hosts).filter(|h| !h.is_empty());

        Ok(())
    }
}

/// Parse a human readable size with binary multipliers, e.g. `512m` or `2GiB`
pub fn ram_in_bytes(value: &str) -> std::result::Result<i64, String> {
    let captures = RAM_PATTERN
        .captures(value)
        .ok_or_else(|| format!("invalid size: '{}'", value))?;

    let number: f64 = captures[1]
        .parse()
        .map_err(|_| format!("invalid size: '{}'", value))?;
    let multiplier: f64 = match captures.get(2).map(|m| m.as_str().to_ascii_lowercase()) {
        None => 1.0,
        Some(unit) => match unit.as_str() {
            "k" => 1024.0,
            "m" => 1024.0 * 1024.0,
            "g" => 1024.0 * 1024.0 * 1024.0,
            "t" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
            "p" => 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0,
            _ => return Err(format!("invalid size: '{}'", value)),
        },
    };

    let bytes = number * multiplier;
    if !bytes.is_finite() || bytes >= i64::MAX as f64 {
        return Err(format!("size out of range: '{}'", value));
    }
    Ok(bytes as i64)
}

/// Parse a duration such as `30s`, `1m30s` or `1.5h`
pub fn parse_duration(value: &str) -> std::result::Result<Duration, String> {
    if value == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = 0f64;
    let mut consumed = 0;
    for captures in DURATION_PART.captures_iter(value) {
        let whole = captures.get(0).map(|m| m.range()).unwrap_or_default();
        if whole.start != consumed {
            return Err(format!("invalid duration \"{}\"", value));
        }
        consumed = whole.end;

        let amount: f64 = captures[1]
            .parse()
            .map_err(|_| format!("invalid duration \"{}\"", value))?;
        let unit_secs = match &captures[2] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return Err(format!("unknown unit in duration \"{}\"", value)),
        };
        total += amount * unit_secs;
    }

    if consumed == 0 || consumed != value.len() {
        return Err(format!("invalid duration \"{}\"", value));
    }
    Duration::try_from_secs_f64(total).map_err(|_| format!("duration out of range \"{}\"", value))
}

/// Parse a decimal CPU count into nano CPUs
pub fn parse_nano_cpus(value: &str) -> std::result::Result<i64, String> {
    let (whole, fraction) = value.split_once('.').unwrap_or((value, ""));
    if fraction.len() > 9 {
        return Err("value is too precise".to_string());
    }
    let parse_digits = |s: &str| -> std::result::Result<i64, String> {
        if s.is_empty() {
            Ok(0)
        } else if s.chars().all(|c| c.is_ascii_digit()) {
            s.parse::<i64>()
                .map_err(|_| format!("failed to parse {} as a rational number", value))
        } else {
            Err(format!("failed to parse {} as a rational number", value))
        }
    };

    let whole = parse_digits(whole)?;
    let fraction = parse_digits(&format!("{:0<9}", fraction))?;
    whole
        .checked_mul(1_000_000_000)
        .and_then(|n| n.checked_add(fraction))
        .ok_or_else(|| format!("failed to parse {} as a rational number", value))
}

/// Parse `name=soft[:hard]`
pub fn parse_ulimit(value: &str) -> std::result::Result<ResourcesUlimits, String> {
    let (name, limits) = value
        .split_once('=')
        .ok_or_else(|| format!("invalid ulimit argument: {}", value))?;
    let (soft, hard) = match limits.split_once(':') {
        Some((soft, hard)) => (soft, hard),
        None => (limits, limits),
    };
    let soft: i64 = soft
        .parse()
        .map_err(|_| format!("invalid ulimit soft value: {}", soft))?;
    let hard: i64 = hard
        .parse()
        .map_err(|_| format!("invalid ulimit hard value: {}", hard))?;
    if soft > hard && hard != -1 {
        return Err(format!(
            "ulimit soft limit must be less than hard limit: {} > {}",
            soft, hard
        ));
    }

    Ok(ResourcesUlimits {
        name: Some(name.to_string()),
        soft: Some(soft),
        hard: Some(hard),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_multiple_occurrences_append() {
        let args = RunArgs::extract(
            &default_definitions(),
            &tokens(&["--label", "a=1", "--label", "b=2"]),
        )
        .unwrap();

        let label = args.get(RunArg::Label).unwrap();
        assert_eq!(label.values, vec!["a=1", "b=2"]);
        assert_eq!(args.labels().get("b").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_single_occurrence_overwrites() {
        let args = RunArgs::extract(
            &default_definitions(),
            &tokens(&["--memory", "1g", "-m=2g"]),
        )
        .unwrap();
        assert_eq!(args.string(RunArg::Memory), "2g");
    }

    #[test]
    fn test_unknown_and_unsupported_are_skipped() {
        let args = RunArgs::extract(
            &default_definitions(),
            &tokens(&["--gpus", "all", "--rm", "--init"]),
        )
        .unwrap();
        assert!(!args.contains(RunArg::Rm));
        assert_eq!(args.bool_flag(RunArg::Init), Some(true));
        assert_eq!(args.bool_flag(RunArg::Privileged), None);
    }

    #[test]
    fn test_fully_blocked_arg_is_dropped() {
        let args = RunArgs::extract(
            &default_definitions(),
            &tokens(&["--network", "host", "--pull", "sometimes"]),
        )
        .unwrap();
        assert!(!args.contains(RunArg::Network));
        assert!(!args.contains(RunArg::Pull));
        assert_eq!(args.pull_policy(), PullPolicy::Missing);

        let args = RunArgs::extract(&default_definitions(), &tokens(&["--pull=never"])).unwrap();
        assert_eq!(args.pull_policy(), PullPolicy::Never);
    }

    #[test]
    fn test_allow_and_block_lists_hold() {
        let mut definitions = default_definitions();
        definitions.insert(
            RunArg::CapAdd,
            RunArgDefinition::new(RunArg::CapAdd)
                .multiple()
                .block(&["SYS_ADMIN"]),
        );
        let raw = tokens(&["--cap-add", "SYS_ADMIN", "NET_ADMIN", "--pull", "always"]);

        let first = RunArgs::extract(&definitions, &raw).unwrap();
        let second = RunArgs::extract(&definitions, &raw).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.strings(RunArg::CapAdd), vec!["NET_ADMIN"]);
        assert_eq!(first.pull_policy(), PullPolicy::Always);
    }

    #[test]
    fn test_negative_number_is_a_value() {
        let args = RunArgs::extract(
            &default_definitions(),
            &tokens(&["--memory-swap", "-1", "--oom-score-adj", "-500"]),
        )
        .unwrap();
        assert_eq!(args.memory_swap().unwrap(), Some(-1));
        assert_eq!(args.int64(RunArg::OomScoreAdj).unwrap(), Some(-500));
    }

    #[test]
    fn test_malformed_values_fail() {
        let args = RunArgs::extract(
            &default_definitions(),
            &tokens(&["--cpu-shares", "lots", "--health-interval", "soon"]),
        )
        .unwrap();
        assert!(matches!(
            args.int64(RunArg::CpuShares),
            Err(Error::InvalidRunArg { .. })
        ));
        assert!(args.health_check().is_err());
        assert!(args.apply_to_host_config(&mut HostConfig::default()).is_err());
    }

    #[test]
    fn test_host_config_resources() {
        let args = RunArgs::extract(
            &default_definitions(),
            &tokens(&[
                "--memory=512m",
                "--cpus",
                "1.5",
                "--ulimit",
                "nofile=1024:2048",
                "--restart",
                "on-failure:3",
                "--sysctl",
                "net.core.somaxconn=1024",
            ]),
        )
        .unwrap();

        let mut host = HostConfig::default();
        args.apply_to_host_config(&mut host).unwrap();
        assert_eq!(host.memory, Some(512 * 1024 * 1024));
        assert_eq!(host.nano_cpus, Some(1_500_000_000));
        let ulimits = host.ulimits.unwrap();
        assert_eq!(ulimits[0].name.as_deref(), Some("nofile"));
        assert_eq!(ulimits[0].hard, Some(2048));
        let restart = host.restart_policy.unwrap();
        assert_eq!(restart.name, Some(RestartPolicyNameEnum::ON_FAILURE));
        assert_eq!(restart.maximum_retry_count, Some(3));
        assert_eq!(
            host.sysctls.unwrap().get("net.core.somaxconn").map(String::as_str),
            Some("1024")
        );
    }

    #[test]
    fn test_health_check() {
        let args = RunArgs::extract(
            &default_definitions(),
            &tokens(&[
                "--health-cmd",
                "curl -f http://localhost",
                "--health-interval",
                "1m30s",
                "--health-retries",
                "3",
            ]),
        )
        .unwrap();
        let health = args.health_check().unwrap().unwrap();
        assert_eq!(health.test, Some(vec!["curl -f http://localhost".to_string()]));
        assert_eq!(health.interval, Some(90_000_000_000));
        assert_eq!(health.retries, Some(3));

        let none = RunArgs::extract(&default_definitions(), &tokens(&["--no-healthcheck"])).unwrap();
        assert_eq!(
            none.health_check().unwrap().unwrap().test,
            Some(vec!["NONE".to_string()])
        );
        assert!(RunArgs::default().health_check().unwrap().is_none());
    }

    #[test]
    fn test_out_of_range_values_fail() {
        let args = RunArgs::extract(
            &default_definitions(),
            &tokens(&[
                "--health-interval",
                "9999999999h",
                "--io-maxiops",
                "18446744073709551615",
            ]),
        )
        .unwrap();
        assert!(matches!(
            args.duration_nanos(RunArg::HealthInterval),
            Err(Error::InvalidRunArg { .. })
        ));
        assert!(args.health_check().is_err());
        assert!(matches!(
            args.uint64_as_int64(RunArg::IoMaxiops),
            Err(Error::InvalidRunArg { .. })
        ));
        assert!(args.apply_to_host_config(&mut HostConfig::default()).is_err());

        assert!(ram_in_bytes("99999999999P").is_err());
        assert!(parse_duration("99999999999999999999h").is_err());
    }

    #[test]
    fn test_value_parsers() {
        assert_eq!(ram_in_bytes("1024").unwrap(), 1024);
        assert_eq!(ram_in_bytes("2GiB").unwrap(), 2 * 1024 * 1024 * 1024);
        assert!(ram_in_bytes("two gigs").is_err());

        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("5s later").is_err());

        assert_eq!(parse_nano_cpus("2").unwrap(), 2_000_000_000);
        assert_eq!(parse_nano_cpus("0.25").unwrap(), 250_000_000);
        assert!(parse_nano_cpus("0.0000000001").is_err());
        assert!(parse_nano_cpus("one").is_err());

        assert!(parse_ulimit("nofile=2048:1024").is_err());
        assert_eq!(parse_ulimit("nproc=64").unwrap().soft, Some(64));
    }
}
