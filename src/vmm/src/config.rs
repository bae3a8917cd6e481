// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Reads the monitor's three named environment variables plus the
//! kernel path, modeled on the builder shape a command-line-driven
//! config would use even though this monitor takes its settings from
//! the environment instead.

use std::path::PathBuf;

use crate::hostfacts;

const DEFAULT_MEM: u64 = 0x2000_0000;
const DEFAULT_CPUS: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HERMIT_MEM: {0}")]
    MemSize(#[from] hostfacts::Error),
    #[error("HERMIT_CPUS must be a positive integer, got {0:?}")]
    BadCpuCount(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone)]
pub struct Config {
    pub kernel_path: PathBuf,
    pub mem_size: u64,
    pub num_cpus: u32,
    pub netif: Option<String>,
    pub verbose: bool,
}

impl Config {
    /// Builds a `Config` from `kernel_path` and the process environment.
    pub fn from_env(kernel_path: PathBuf) -> Result<Self> {
        ConfigBuilder::new(kernel_path)
            .mem_size(std::env::var("HERMIT_MEM").ok())?
            .num_cpus(std::env::var("HERMIT_CPUS").ok())?
            .netif(std::env::var("HERMIT_NETIF").ok())
            .verbose(std::env::var("HERMIT_VERBOSE").ok())
            .build()
    }
}

struct ConfigBuilder {
    kernel_path: PathBuf,
    mem_size: u64,
    num_cpus: u32,
    netif: Option<String>,
    verbose: bool,
}

impl ConfigBuilder {
    fn new(kernel_path: PathBuf) -> Self {
        ConfigBuilder {
            kernel_path,
            mem_size: DEFAULT_MEM,
            num_cpus: DEFAULT_CPUS,
            netif: None,
            verbose: false,
        }
    }

    fn mem_size(mut self, raw: Option<String>) -> Result<Self> {
        if let Some(raw) = raw {
            self.mem_size = hostfacts::parse_mem_size(&raw)?;
        }
        Ok(self)
    }

    fn num_cpus(mut self, raw: Option<String>) -> Result<Self> {
        if let Some(raw) = raw {
            let n: u32 = raw
                .trim()
                .parse()
                .map_err(|_| Error::BadCpuCount(raw.clone()))?;
            if n == 0 {
                return Err(Error::BadCpuCount(raw));
            }
            self.num_cpus = n;
        }
        Ok(self)
    }

    fn netif(mut self, raw: Option<String>) -> Self {
        self.netif = raw;
        self
    }

    fn verbose(mut self, raw: Option<String>) -> Self {
        self.verbose = matches!(raw, Some(v) if v != "0");
        self
    }

    fn build(self) -> Result<Config> {
        Ok(Config {
            kernel_path: self.kernel_path,
            mem_size: self.mem_size,
            num_cpus: self.num_cpus,
            netif: self.netif,
            verbose: self.verbose,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_env_absent() {
        let cfg = ConfigBuilder::new(PathBuf::from("/tmp/kernel"))
            .mem_size(None)
            .unwrap()
            .num_cpus(None)
            .unwrap()
            .netif(None)
            .verbose(None)
            .build()
            .unwrap();
        assert_eq!(cfg.mem_size, DEFAULT_MEM);
        assert_eq!(cfg.num_cpus, DEFAULT_CPUS);
        assert!(cfg.netif.is_none());
        assert!(!cfg.verbose);
    }

    #[test]
    fn mem_size_suffix_is_parsed() {
        let cfg = ConfigBuilder::new(PathBuf::from("/tmp/kernel"))
            .mem_size(Some("2M".to_string()))
            .unwrap()
            .num_cpus(None)
            .unwrap()
            .netif(None)
            .verbose(None)
            .build()
            .unwrap();
        assert_eq!(cfg.mem_size, 2 * 1024 * 1024);
    }

    #[test]
    fn zero_cpus_is_rejected() {
        let result = ConfigBuilder::new(PathBuf::from("/tmp/kernel")).num_cpus(Some("0".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn verbose_is_false_for_explicit_zero() {
        let cfg = ConfigBuilder::new(PathBuf::from("/tmp/kernel"))
            .mem_size(None)
            .unwrap()
            .num_cpus(None)
            .unwrap()
            .netif(None)
            .verbose(Some("0".to_string()))
            .build()
            .unwrap();
        assert!(!cfg.verbose);
    }
}
