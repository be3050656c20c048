//! Local load sampling.
//!
//! The scheduler asks a [`LoadSampler`] for this instance's address and its
//! CPU and memory usage before every tick and on every periodic report.

use std::net::IpAddr;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use crate::core::LoadSample;

/// Source of [`LoadSample`]s for this instance.
#[async_trait]
pub trait LoadSampler: Send + Sync + 'static {
    /// Take a sample now. An empty `ip` means the address is unknown.
    async fn sample(&self) -> LoadSample;
}

/// Returns a settable sample, stamped with the current time.
#[derive(Debug)]
pub struct FixedSampler {
    current: Mutex<LoadSample>,
}

impl FixedSampler {
    /// Sampler reporting `ip` at the given load.
    pub fn new(ip: impl Into<String>, cpu_percent: f64, mem_percent: f64) -> Self {
        Self {
            current: Mutex::new(LoadSample::new(ip, cpu_percent, mem_percent)),
        }
    }

    /// Change the reported load.
    pub fn set_load(&self, cpu_percent: f64, mem_percent: f64) {
        let mut current = self.current.lock();
        current.cpu_percent = cpu_percent;
        current.mem_percent = mem_percent;
    }
}

#[async_trait]
impl LoadSampler for FixedSampler {
    async fn sample(&self) -> LoadSample {
        self.current.lock().clone().at(Utc::now())
    }
}

/// Pick the address to report: an explicit override, else the first IPv4
/// address on `interface`, else any non-loopback IPv4 address.
pub fn select_ip<'a, I>(override_ip: Option<&str>, interface: &str, addrs: I) -> String
where
    I: IntoIterator<Item = (&'a str, IpAddr)>,
{
    if let Some(ip) = override_ip.map(str::trim).filter(|ip| !ip.is_empty()) {
        return ip.to_owned();
    }
    let candidates: Vec<(&str, IpAddr)> = addrs
        .into_iter()
        .filter(|(_, addr)| addr.is_ipv4() && !addr.is_loopback())
        .collect();
    candidates
        .iter()
        .find(|(name, _)| *name == interface)
        .or_else(|| candidates.first())
        .map(|(_, addr)| addr.to_string())
        .unwrap_or_default()
}

#[cfg(feature = "system-sampler")]
pub use system::SysinfoSampler;

#[cfg(feature = "system-sampler")]
mod system {
    use std::net::IpAddr;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use sysinfo::{Networks, System};
    use tracing::debug;

    use super::{select_ip, LoadSampler};
    use crate::core::LoadSample;

    /// Measures global CPU and memory usage through `sysinfo`.
    pub struct SysinfoSampler {
        system: Mutex<System>,
        interface: String,
        override_ip: Option<String>,
    }

    impl SysinfoSampler {
        /// Sampler reading the address of `interface`, unless `override_ip` is set.
        pub fn new(interface: impl Into<String>, override_ip: Option<String>) -> Self {
            Self {
                system: Mutex::new(System::new()),
                interface: interface.into(),
                override_ip,
            }
        }

        fn local_ip(&self) -> String {
            let networks = Networks::new_with_refreshed_list();
            let addrs: Vec<(&str, IpAddr)> = networks
                .list()
                .iter()
                .flat_map(|(name, data)| {
                    data.ip_networks()
                        .iter()
                        .map(move |net| (name.as_str(), net.addr))
                })
                .collect();
            select_ip(self.override_ip.as_deref(), &self.interface, addrs)
        }
    }

    impl std::fmt::Debug for SysinfoSampler {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("SysinfoSampler")
                .field("interface", &self.interface)
                .field("override_ip", &self.override_ip)
                .finish_non_exhaustive()
        }
    }

    #[async_trait]
    impl LoadSampler for SysinfoSampler {
        #[allow(clippy::cast_precision_loss)]
        async fn sample(&self) -> LoadSample {
            // CPU usage is a delta between two refreshes
            self.system.lock().refresh_cpu_usage();
            tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;

            let (cpu, mem) = {
                let mut system = self.system.lock();
                system.refresh_cpu_usage();
                system.refresh_memory();
                let total = system.total_memory();
                let mem = if total == 0 {
                    0.0
                } else {
                    system.used_memory() as f64 / total as f64 * 100.0
                };
                (f64::from(system.global_cpu_usage()), mem)
            };
            let ip = self.local_ip();
            debug!("sampled load cpu {:.1}% mem {:.1}% on {}", cpu, mem, ip);
            LoadSample::new(ip, cpu, mem)
        }
    }
}
