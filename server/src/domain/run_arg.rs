//! Docker run argument model

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

macro_rules! run_args {
    ($($variant:ident => $name:literal $(, $short:literal)?;)+) => {
        /// A `docker run` flag understood by the container orchestrator
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum RunArg {
            $(
                #[serde(rename = $name)]
                $variant,
            )+
        }

        impl RunArg {
            pub const ALL: &'static [RunArg] = &[$(RunArg::$variant,)+];

            /// Long flag name without leading dashes
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(RunArg::$variant => $name,)+
                }
            }

            /// Single letter alias, if the flag has one
            pub fn short_hand(&self) -> Option<&'static str> {
                match self {
                    $($(RunArg::$variant => Some($short),)?)+
                    #[allow(unreachable_patterns)]
                    _ => None,
                }
            }

            /// Resolve a flag token stripped of its dashes
            pub fn from_flag(flag: &str) -> Option<Self> {
                match flag {
                    $($name => Some(RunArg::$variant),)+
                    $($($short => Some(RunArg::$variant),)?)+
                    _ => None,
                }
            }
        }
    };
}

run_args! {
    AddHost => "add-host";
    Annotation => "annotation";
    BlkioWeight => "blkio-weight";
    CapAdd => "cap-add";
    CapDrop => "cap-drop";
    CgroupParent => "cgroup-parent";
    Cgroupns => "cgroupns";
    CpuCount => "cpu-count";
    CpuPercent => "cpu-percent";
    CpuPeriod => "cpu-period";
    CpuQuota => "cpu-quota";
    CpuRtPeriod => "cpu-rt-period";
    CpuRtRuntime => "cpu-rt-runtime";
    CpuShares => "cpu-shares", "c";
    Cpus => "cpus";
    CpusetCpus => "cpuset-cpus";
    CpusetMems => "cpuset-mems";
    Dns => "dns";
    DnsOption => "dns-option";
    DnsSearch => "dns-search";
    Domainname => "domainname";
    Entrypoint => "entrypoint";
    Env => "env", "e";
    HealthCmd => "health-cmd";
    HealthInterval => "health-interval";
    HealthRetries => "health-retries";
    HealthStartInterval => "health-start-interval";
    HealthStartPeriod => "health-start-period";
    HealthTimeout => "health-timeout";
    Hostname => "hostname", "h";
    Init => "init";
    IoMaxbandwidth => "io-maxbandwidth";
    IoMaxiops => "io-maxiops";
    Ipc => "ipc";
    Isolation => "isolation";
    KernelMemory => "kernel-memory";
    Label => "label", "l";
    Link => "link";
    MacAddress => "mac-address";
    Memory => "memory", "m";
    MemoryReservation => "memory-reservation";
    MemorySwap => "memory-swap";
    MemorySwappiness => "memory-swappiness";
    Mount => "mount";
    Network => "network";
    NoHealthcheck => "no-healthcheck";
    OomKillDisable => "oom-kill-disable";
    OomScoreAdj => "oom-score-adj";
    Pid => "pid";
    PidsLimit => "pids-limit";
    Platform => "platform";
    Privileged => "privileged";
    Pull => "pull";
    Restart => "restart";
    Rm => "rm";
    Runtime => "runtime";
    SecurityOpt => "security-opt";
    ShmSize => "shm-size";
    StopSignal => "stop-signal";
    StopTimeout => "stop-timeout";
    StorageOpt => "storage-opt";
    Sysctl => "sysctl";
    Ulimit => "ulimit";
    User => "user", "u";
}

impl std::fmt::Display for RunArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a run argument is accepted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunArgDefinition {
    pub name: RunArg,
    pub supported: bool,
    /// Only these values are kept when non-empty
    #[serde(default)]
    pub allowed_values: HashSet<String>,
    /// These values are dropped when non-empty
    #[serde(default)]
    pub blocked_values: HashSet<String>,
    #[serde(default)]
    pub allow_multiple_occurrences: bool,
}

impl RunArgDefinition {
    pub fn new(name: RunArg) -> Self {
        Self {
            name,
            supported: true,
            allowed_values: HashSet::new(),
            blocked_values: HashSet::new(),
            allow_multiple_occurrences: false,
        }
    }

    pub fn multiple(mut self) -> Self {
        self.allow_multiple_occurrences = true;
        self
    }

    pub fn allow(mut self, values: &[&str]) -> Self {
        self.allowed_values = values.iter().map(|v| v.to_string()).collect();
        self
    }

    pub fn block(mut self, values: &[&str]) -> Self {
        self.blocked_values = values.iter().map(|v| v.to_string()).collect();
        self
    }

    pub fn unsupported(mut self) -> Self {
        self.supported = false;
        self
    }

    /// Keep only the values the definition accepts
    pub fn filter_values(&self, values: Vec<String>) -> Vec<String> {
        if !self.allowed_values.is_empty() {
            values
                .into_iter()
                .filter(|v| self.allowed_values.contains(v))
                .collect()
        } else if !self.blocked_values.is_empty() {
            values
                .into_iter()
                .filter(|v| !self.blocked_values.contains(v))
                .collect()
        } else {
            values
        }
    }
}

/// A resolved run argument
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunArgValue {
    pub name: RunArg,
    pub values: Vec<String>,
}

impl std::fmt::Display for RunArgValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.values.join(" "))
    }
}
