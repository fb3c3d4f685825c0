//! Logical CPU lists and the load/measurement CPU partition.
//!
//! A [`CpuList`] is always kept sorted and free of duplicates. Its textual
//! form is the kernel's ranged notation (`0-3,6,8-9`), both when parsed from
//! configuration and when written back into a report.

use std::fmt;
use std::fs;
use std::io;
use std::str::FromStr;
use serde::{Serialize, Deserialize};

use crate::core::error::{Result, RtevalError};

const ONLINE_CPUS_PATH: &str = "/sys/devices/system/cpu/online";

/// CPU indices in a list must stay below this; the largest kernel NR_CPUS.
pub const MAX_CPUS: usize = 8192;

/// Ordered set of logical CPU indices. Empty means "no restriction".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CpuList(Vec<usize>);

impl CpuList {
    pub fn new<I: IntoIterator<Item = usize>>(cpus: I) -> Self {
        let mut cpus: Vec<usize> = cpus.into_iter().collect();
        cpus.sort_unstable();
        cpus.dedup();
        Self(cpus)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, cpu: usize) -> bool {
        self.0.binary_search(&cpu).is_ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().copied()
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }

    /// Members of `self` that are not in `other`, ascending.
    pub fn difference(&self, other: &CpuList) -> CpuList {
        CpuList(self.iter().filter(|cpu| !other.contains(*cpu)).collect())
    }

    pub fn intersection(&self, other: &CpuList) -> CpuList {
        CpuList(self.iter().filter(|cpu| other.contains(*cpu)).collect())
    }

    pub fn union(&self, other: &CpuList) -> CpuList {
        CpuList::new(self.iter().chain(other.iter()))
    }

    /// Parse the ranged notation, e.g. `0-3,5`. Whitespace around items is
    /// ignored and an empty string yields an empty list.
    pub fn parse(text: &str) -> Result<Self> {
        let mut cpus = Vec::new();
        for item in text.split(',').map(str::trim).filter(|item| !item.is_empty()) {
            match item.split_once('-') {
                Some((start, end)) => {
                    let start = parse_index(start, text)?;
                    let end = parse_index(end, text)?;
                    if start > end {
                        return Err(RtevalError::Config(format!(
                            "Invalid CPU range '{}' in '{}'", item, text
                        )));
                    }
                    cpus.extend(start..=end);
                }
                None => cpus.push(parse_index(item, text)?),
            }
        }
        Ok(Self::new(cpus))
    }
}

fn parse_index(value: &str, whole: &str) -> Result<usize> {
    let index = value.trim().parse::<usize>().map_err(|_| {
        RtevalError::Config(format!("Invalid CPU index '{}' in '{}'", value.trim(), whole))
    })?;
    if index >= MAX_CPUS {
        return Err(RtevalError::Config(format!(
            "CPU index {} in '{}' exceeds the supported maximum of {}", index, whole, MAX_CPUS - 1
        )));
    }
    Ok(index)
}

impl FromStr for CpuList {
    type Err = RtevalError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl FromIterator<usize> for CpuList {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        Self::new(iter)
    }
}

impl fmt::Display for CpuList {
    /// Writes the most compact ranged form: contiguous runs collapse to `a-b`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        let mut iter = self.0.iter().copied().peekable();
        while let Some(start) = iter.next() {
            let mut end = start;
            while iter.peek() == Some(&(end + 1)) {
                end += 1;
                iter.next();
            }
            if start == end {
                parts.push(start.to_string());
            } else {
                parts.push(format!("{}-{}", start, end));
            }
        }
        write!(f, "{}", parts.join(","))
    }
}

/// CPU assignment for the two workload families.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuPartition {
    pub loads: CpuList,
    pub measurement: CpuList,
}

/// Derive the load/measurement CPU assignment.
///
/// When exactly one side is configured the other becomes its complement over
/// `online`. Both or neither configured are returned as given; overlap between
/// two explicit lists is left to the operator.
pub fn partition(online: &CpuList, loads: &CpuList, measurement: &CpuList) -> CpuPartition {
    match (loads.is_empty(), measurement.is_empty()) {
        (false, false) | (true, true) => CpuPartition {
            loads: loads.clone(),
            measurement: measurement.clone(),
        },
        (false, true) => CpuPartition {
            loads: loads.clone(),
            measurement: online.difference(loads),
        },
        (true, false) => CpuPartition {
            loads: online.difference(measurement),
            measurement: measurement.clone(),
        },
    }
}

/// Online CPUs of this host, falling back to `0..num_cpus` when sysfs is
/// unavailable.
pub fn online_cpus() -> CpuList {
    fs::read_to_string(ONLINE_CPUS_PATH)
        .ok()
        .and_then(|text| CpuList::parse(text.trim()).ok())
        .filter(|cpus| !cpus.is_empty())
        .unwrap_or_else(|| CpuList::new(0..num_cpus::get()))
}

/// Restrict the calling thread to `cpus`. An empty list is a no-op.
///
/// Children forked from the thread afterwards inherit the mask.
#[cfg(target_os = "linux")]
pub fn pin_current_thread(cpus: &CpuList) -> io::Result<()> {
    if cpus.is_empty() {
        return Ok(());
    }
    let capacity = std::mem::size_of::<libc::cpu_set_t>() * 8;
    if let Some(cpu) = cpus.iter().find(|cpu| *cpu >= capacity) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("CPU index {} exceeds affinity mask capacity ({})", cpu, capacity),
        ));
    }

    // SAFETY: cpu_set_t is valid when zeroed and every index was bounds
    // checked against the mask capacity above.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        for cpu in cpus.iter() {
            libc::CPU_SET(cpu, &mut set);
        }
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(cpus: &CpuList) -> io::Result<()> {
    if cpus.is_empty() {
        return Ok(());
    }
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "CPU affinity is not supported on this platform",
    ))
}
