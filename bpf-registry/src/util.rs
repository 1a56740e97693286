//! Utility functions.
use std::{fs, io, str::FromStr};

pub(crate) const POSSIBLE_CPUS: &str = "/sys/devices/system/cpu/possible";

/// Get the number of possible cpus.
///
/// This is the number of values per-CPU maps hold for each key. See
/// `/sys/devices/system/cpu/possible`.
pub fn nr_cpus() -> Result<usize, io::Error> {
    Ok(possible_cpus()?.len())
}

/// Get the list of possible cpus.
///
/// See `/sys/devices/system/cpu/possible`.
pub(crate) fn possible_cpus() -> Result<Vec<u32>, io::Error> {
    read_cpu_ranges(POSSIBLE_CPUS)
}

/// Returns the CPU the calling thread is running on.
pub fn current_cpu() -> Result<u32, io::Error> {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: libc wrapper
        let cpu = unsafe { libc::sched_getcpu() };
        if cpu < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(cpu as u32)
    }
    #[cfg(not(target_os = "linux"))]
    {
        Ok(0)
    }
}

fn read_cpu_ranges(path: &str) -> Result<Vec<u32>, io::Error> {
    let data = fs::read_to_string(path)?;
    parse_cpu_ranges(data.trim()).map_err(|()| {
        io::Error::new(io::ErrorKind::InvalidData, format!("unexpected {path} format"))
    })
}

fn parse_cpu_ranges(data: &str) -> Result<Vec<u32>, ()> {
    let mut cpus = Vec::new();
    for range in data.split(',') {
        cpus.extend({
            match range
                .splitn(2, '-')
                .map(u32::from_str)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| ())?
                .as_slice()
            {
                &[] | &[_, _, _, ..] => return Err(()),
                &[start] => start..=start,
                &[start, end] => start..=end,
            }
        })
    }

    Ok(cpus)
}
