use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::Result;
use crate::model::MacAddr;

/// Agent-wide settings, built once at startup and shared by every configurator.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    #[serde(deserialize_with = "dnsmasq_config")]
    pub dnsmasq: DaemonConfig,
    #[serde(deserialize_with = "goproxy_config")]
    pub goproxy: DaemonConfig,
    pub dhcpcd: DhcpcdConfig,
    pub bond: BondDefaults,
    /// Directory where `ip netns` keeps named namespaces.
    pub netns_run_dir: PathBuf,
    /// Directory holding per-namespace `resolv.conf` (`<dir>/<ns>/resolv.conf`).
    pub netns_etc_dir: PathBuf,
    pub host_port: HostPortConfig,
    pub event_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dnsmasq: DaemonConfig::dnsmasq(),
            goproxy: DaemonConfig::goproxy(),
            dhcpcd: DhcpcdConfig::default(),
            bond: BondDefaults::default(),
            netns_run_dir: PathBuf::from("/var/run/netns"),
            netns_etc_dir: PathBuf::from("/etc/netns"),
            host_port: HostPortConfig::default(),
            event_buffer: 64,
        }
    }
}

impl Config {
    /// Load from a JSON file; missing fields keep their defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            None => Ok(Self::default()),
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                Ok(serde_json::from_str(&raw)?)
            }
        }
    }
}

/// A dnsmasq-style daemon: one binary, config files in one directory,
/// PID/log files in another.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub binary: PathBuf,
    pub conf_dir: PathBuf,
    pub run_dir: PathBuf,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
    pub kill_timeout: Duration,
}

impl DaemonConfig {
    pub fn dnsmasq() -> Self {
        Self {
            binary: PathBuf::from("/usr/local/sbin/dnsmasq"),
            conf_dir: PathBuf::from("/etc/dnsmasq"),
            run_dir: PathBuf::from("/run/dnsmasq"),
            start_timeout: Duration::from_secs(3),
            stop_timeout: Duration::from_secs(30),
            kill_timeout: Duration::from_secs(10),
        }
    }

    pub fn goproxy() -> Self {
        Self {
            binary: PathBuf::from("/bin/goproxy"),
            conf_dir: PathBuf::from("/etc/goproxy"),
            run_dir: PathBuf::from("/run/goproxy"),
            start_timeout: Duration::from_secs(3),
            stop_timeout: Duration::from_secs(10),
            kill_timeout: Duration::from_secs(10),
        }
    }

    pub fn conf_file(&self, name: &str) -> PathBuf {
        self.conf_dir.join(format!("{name}.conf"))
    }

    pub fn pid_file(&self, name: &str) -> PathBuf {
        self.run_dir.join(format!("{name}.pid"))
    }

    pub fn log_file(&self, name: &str) -> PathBuf {
        self.run_dir.join(format!("{name}.log"))
    }

    pub fn lease_file(&self, name: &str) -> PathBuf {
        self.run_dir.join(format!("{name}.leases"))
    }
}

/// Fields given for a daemon in the settings file.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct DaemonOverrides {
    binary: Option<PathBuf>,
    conf_dir: Option<PathBuf>,
    run_dir: Option<PathBuf>,
    start_timeout: Option<u64>,
    stop_timeout: Option<u64>,
    kill_timeout: Option<u64>,
}

impl DaemonOverrides {
    fn apply(self, base: DaemonConfig) -> DaemonConfig {
        DaemonConfig {
            binary: self.binary.unwrap_or(base.binary),
            conf_dir: self.conf_dir.unwrap_or(base.conf_dir),
            run_dir: self.run_dir.unwrap_or(base.run_dir),
            start_timeout: self.start_timeout.map_or(base.start_timeout, Duration::from_secs),
            stop_timeout: self.stop_timeout.map_or(base.stop_timeout, Duration::from_secs),
            kill_timeout: self.kill_timeout.map_or(base.kill_timeout, Duration::from_secs),
        }
    }
}

fn dnsmasq_config<'de, D>(de: D) -> std::result::Result<DaemonConfig, D::Error>
where
    D: Deserializer<'de>,
{
    DaemonOverrides::deserialize(de).map(|o| o.apply(DaemonConfig::dnsmasq()))
}

fn goproxy_config<'de, D>(de: D) -> std::result::Result<DaemonConfig, D::Error>
where
    D: Deserializer<'de>,
{
    DaemonOverrides::deserialize(de).map(|o| o.apply(DaemonConfig::goproxy()))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DhcpcdConfig {
    pub binary: PathBuf,
    pub run_dir: PathBuf,
    #[serde(with = "secs")]
    pub start_timeout: Duration,
    #[serde(with = "secs")]
    pub release_timeout: Duration,
    #[serde(with = "secs")]
    pub exit_timeout: Duration,
}

impl Default for DhcpcdConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("/sbin/dhcpcd"),
            run_dir: PathBuf::from("/run"),
            start_timeout: Duration::from_secs(3),
            release_timeout: Duration::from_secs(30),
            exit_timeout: Duration::from_secs(10),
        }
    }
}

impl DhcpcdConfig {
    pub fn pid_file(&self, ifname: &str) -> PathBuf {
        self.run_dir.join(format!("dhcpcd-{ifname}.pid"))
    }
}

/// Monitoring values applied when a bond in the model leaves them unset.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BondDefaults {
    pub miimon_interval: u32,
    pub arp_interval: u32,
}

impl Default for BondDefaults {
    fn default() -> Self {
        Self {
            miimon_interval: 100,
            arp_interval: 1000,
        }
    }
}

/// How the agent recognises its own uplink towards the host.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HostPortConfig {
    pub mac_prefix: Vec<u8>,
    pub logical_label: String,
    pub dhcp_log_file: PathBuf,
}

impl Default for HostPortConfig {
    fn default() -> Self {
        Self {
            mac_prefix: MacAddr::HOST_PORT_PREFIX.to_vec(),
            logical_label: "host-port".to_string(),
            dhcp_log_file: PathBuf::from("/run/dhcpcd.log"),
        }
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        u64::deserialize(de).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.json");
        std::fs::write(
            &path,
            r#"{"dhcpcd": {"releaseTimeout": 5}, "netnsRunDir": "/tmp/netns"}"#,
        )
        .unwrap();

        let cfg = Config::load(Some(&path)).unwrap();
        assert_eq!(cfg.dhcpcd.release_timeout, Duration::from_secs(5));
        assert_eq!(cfg.dhcpcd.start_timeout, Duration::from_secs(3));
        assert_eq!(cfg.netns_run_dir, PathBuf::from("/tmp/netns"));
        assert_eq!(cfg.dnsmasq.binary, PathBuf::from("/usr/local/sbin/dnsmasq"));
    }

    #[test]
    fn partial_daemon_block_keeps_its_own_defaults() {
        let cfg: Config = serde_json::from_str(
            r#"{"dnsmasq": {"binary": "/x"}, "goproxy": {"stopTimeout": 2}}"#,
        )
        .unwrap();
        assert_eq!(cfg.dnsmasq.binary, PathBuf::from("/x"));
        assert_eq!(cfg.dnsmasq.conf_dir, PathBuf::from("/etc/dnsmasq"));
        assert_eq!(cfg.dnsmasq.stop_timeout, Duration::from_secs(30));
        assert_eq!(cfg.goproxy.binary, PathBuf::from("/bin/goproxy"));
        assert_eq!(cfg.goproxy.stop_timeout, Duration::from_secs(2));
        assert_eq!(cfg.goproxy.kill_timeout, Duration::from_secs(10));
    }

    #[test]
    fn daemon_paths() {
        let cfg = Config::default();
        assert_eq!(
            cfg.dnsmasq.pid_file("dhcpsrv-lan"),
            PathBuf::from("/run/dnsmasq/dhcpsrv-lan.pid")
        );
        assert_eq!(
            cfg.dnsmasq.conf_file("dnssrv-dns1"),
            PathBuf::from("/etc/dnsmasq/dnssrv-dns1.conf")
        );
        assert_eq!(
            cfg.dhcpcd.pid_file("eth0"),
            PathBuf::from("/run/dhcpcd-eth0.pid")
        );
    }
}
