// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Resolved configuration for hugepage-backed DMA memory.

use crate::HostMemError;
use std::path::PathBuf;
use std::str::FromStr;

/// Selects the backend kind.
pub const BACKEND_ENV: &str = "HOSTMEM_BACKEND";
/// Overrides the hugetlbfs mount used by [`HugepageBackend::Hugetlbfs`].
pub const HUGETLB_PATH_ENV: &str = "HOSTMEM_HUGETLB_PATH";

const DEFAULT_HUGETLB_PATH: &str = "/mnt/huge";

const SIZE_2MB: usize = 2 << 20;
const SIZE_1GB: usize = 1 << 30;

/// Where hugepage regions come from.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum HugepageBackend {
    /// An anonymous `memfd_create(MFD_HUGETLB)` file. Shareable through
    /// `/proc/<pid>/fd/<fd>`.
    #[default]
    Memfd,
    /// A file on a mounted hugetlbfs.
    Hugetlbfs,
}

impl FromStr for HugepageBackend {
    type Err = HostMemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memfd" => Ok(Self::Memfd),
            "hugetlbfs" => Ok(Self::Hugetlbfs),
            _ => Err(HostMemError::InvalidArgument(
                "backend must be `memfd` or `hugetlbfs`",
            )),
        }
    }
}

/// Resolved host memory configuration.
///
/// There is no process-wide instance; build one with [`Self::from_env`] or
/// [`Self::new`] and pass it to the allocators by reference.
#[derive(Debug, Clone)]
pub struct HostMemConfig {
    pub hugepage_size: usize,
    pub page_size: usize,
    pub backend: HugepageBackend,
    pub hugetlb_path: PathBuf,
}

impl HostMemConfig {
    /// A memfd-backed configuration with the given page sizes.
    pub fn new(hugepage_size: usize, page_size: usize) -> Self {
        Self {
            hugepage_size,
            page_size,
            backend: HugepageBackend::Memfd,
            hugetlb_path: DEFAULT_HUGETLB_PATH.into(),
        }
    }

    /// Resolves the configuration from the running system and the process
    /// environment.
    pub fn from_env() -> Result<Self, HostMemError> {
        let meminfo = fs_err::read_to_string("/proc/meminfo").map_err(|source| {
            HostMemError::Os {
                op: "read meminfo",
                source,
            }
        })?;
        let hugepage_size = parse_hugepage_size(&meminfo)?;
        Self::from_vars(hugepage_size, system_page_size()?, |name| {
            std::env::var(name).ok()
        })
    }

    fn from_vars(
        hugepage_size: usize,
        page_size: usize,
        var: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, HostMemError> {
        let mut config = Self::new(hugepage_size, page_size);
        if let Some(backend) = var(BACKEND_ENV) {
            config.backend = backend.parse()?;
        }
        if let Some(path) = var(HUGETLB_PATH_ENV) {
            config.hugetlb_path = path.into();
        }
        config.validate()?;
        tracing::debug!(?config, "resolved host memory configuration");
        Ok(config)
    }

    /// Checks the sizes are usable for the heap.
    pub fn validate(&self) -> Result<(), HostMemError> {
        if !self.page_size.is_power_of_two() || !self.hugepage_size.is_power_of_two() {
            return Err(HostMemError::InvalidArgument(
                "page sizes must be powers of two",
            ));
        }
        if self.hugepage_size < self.page_size {
            return Err(HostMemError::InvalidArgument(
                "hugepage size is smaller than the page size",
            ));
        }
        Ok(())
    }

    /// The `memfd_create` flags selecting this configuration's hugepage size.
    pub fn memfd_flags(&self) -> Result<libc::c_uint, HostMemError> {
        let size_flag = match self.hugepage_size {
            SIZE_2MB => libc::MFD_HUGE_2MB,
            SIZE_1GB => libc::MFD_HUGE_1GB,
            size => return Err(HostMemError::UnsupportedHugepageSize(size)),
        };
        Ok(libc::MFD_HUGETLB | size_flag)
    }
}

/// Parses the `Hugepagesize:` line of `/proc/meminfo`, which is in kB.
fn parse_hugepage_size(meminfo: &str) -> Result<usize, HostMemError> {
    meminfo
        .lines()
        .find_map(|line| line.strip_prefix("Hugepagesize:"))
        .and_then(|rest| rest.trim().trim_end_matches("kB").trim().parse::<usize>().ok())
        .map(|kb| kb * 1024)
        .ok_or(HostMemError::InvalidArgument(
            "no Hugepagesize in /proc/meminfo",
        ))
}

fn system_page_size() -> Result<usize, HostMemError> {
    // SAFETY: sysconf has no memory safety requirements.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        return Err(HostMemError::last_os_error("query page size"));
    }
    Ok(size as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use test_with_tracing::test;

    const MEMINFO: &str = "\
MemTotal:       32594220 kB
HugePages_Total:      64
HugePages_Free:       64
Hugepagesize:       2048 kB
Hugetlb:          131072 kB
";

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn hugepage_size_from_meminfo() {
        assert_eq!(parse_hugepage_size(MEMINFO).unwrap(), 2 << 20);
        assert!(parse_hugepage_size("MemTotal: 1 kB\n").is_err());
    }

    #[test]
    fn defaults() {
        let config = HostMemConfig::from_vars(2 << 20, 4096, vars(&[])).unwrap();
        assert_eq!(config.backend, HugepageBackend::Memfd);
        assert_eq!(config.hugetlb_path, PathBuf::from("/mnt/huge"));
        assert_eq!(
            config.memfd_flags().unwrap(),
            libc::MFD_HUGETLB | libc::MFD_HUGE_2MB
        );
    }

    #[test]
    fn environment_overrides() {
        let config = HostMemConfig::from_vars(
            1 << 30,
            4096,
            vars(&[
                (BACKEND_ENV, "hugetlbfs"),
                (HUGETLB_PATH_ENV, "/dev/hugepages"),
            ]),
        )
        .unwrap();
        assert_eq!(config.backend, HugepageBackend::Hugetlbfs);
        assert_eq!(config.hugetlb_path, PathBuf::from("/dev/hugepages"));
        assert_eq!(
            config.memfd_flags().unwrap(),
            libc::MFD_HUGETLB | libc::MFD_HUGE_1GB
        );
    }

    #[test]
    fn rejects_unknown_backend() {
        let err = HostMemConfig::from_vars(2 << 20, 4096, vars(&[(BACKEND_ENV, "shm")]))
            .unwrap_err();
        assert!(matches!(err, HostMemError::InvalidArgument(_)));
    }

    #[test]
    fn rejects_unsupported_memfd_size() {
        let config = HostMemConfig::new(16 << 20, 4096);
        assert!(matches!(
            config.memfd_flags(),
            Err(HostMemError::UnsupportedHugepageSize(_))
        ));
    }
}
