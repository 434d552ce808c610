// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Worker-core runtime.
//!
//! Initialisation parses the configured core list, partitions the worker
//! lcores by NUMA socket (read best-effort from sysfs) and reserves the
//! first lcore as the main core. Each worker stage later gets exactly one
//! lcore: a dedicated OS thread pinned to that CPU running the stage's
//! busy-poll loop.
//!
//! The module also provides the monotonic tick clock used for frame
//! timestamps, timeout sweeps and rate counters.

use crate::logging::{Facility, Logger};
use std::sync::OnceLock;
use std::thread::JoinHandle;
use std::time::Instant;
use thiserror::Error;

/// Sentinel for "any socket" placement requests.
pub const SOCKET_ID_ANY: u32 = u32::MAX;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("invalid core list entry '{0}'")]
    InvalidCoreList(String),

    #[error("core list is empty")]
    EmptyCoreList,

    #[error("no worker lcores available (need at least one beyond the main lcore)")]
    NoWorkerCores,
}

/// Options passed through from the `runtime` configuration table.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RuntimeOptions {
    /// Core list, e.g. `"0-3,8"`. Defaults to every online CPU.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corelist: Option<String>,

    /// Device allow-list entries. A single string or an array; arrays
    /// produce repeated flags.
    #[serde(
        default,
        deserialize_with = "one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub allow: Vec<String>,

    /// Minimum log severity name ("info", "debug", ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loglevel: Option<String>,

    #[serde(
        default,
        rename = "proc-type",
        skip_serializing_if = "Option::is_none"
    )]
    pub proc_type: Option<String>,

    #[serde(
        default,
        rename = "file-prefix",
        skip_serializing_if = "Option::is_none"
    )]
    pub file_prefix: Option<String>,
}

impl RuntimeOptions {
    /// Render as the equivalent command-line argument list, arrays becoming
    /// repeated flags. Used for startup logging.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(corelist) = &self.corelist {
            args.push("-l".to_string());
            args.push(corelist.clone());
        }
        for device in &self.allow {
            args.push("--allow".to_string());
            args.push(device.clone());
        }
        if let Some(level) = &self.loglevel {
            args.push("--log-level".to_string());
            args.push(level.clone());
        }
        if let Some(proc_type) = &self.proc_type {
            args.push("--proc-type".to_string());
            args.push(proc_type.clone());
        }
        if let Some(prefix) = &self.file_prefix {
            args.push("--file-prefix".to_string());
            args.push(prefix.clone());
        }
        args
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(value) => vec![value],
        OneOrMany::Many(values) => values,
    })
}

/// Parse a core list of the form `"0-3,8,10-11"`.
pub fn parse_core_list(list: &str) -> Result<Vec<u32>, RuntimeError> {
    let mut cores = Vec::new();
    for part in list.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((start, end)) = part.split_once('-') {
            let start: u32 = start
                .trim()
                .parse()
                .map_err(|_| RuntimeError::InvalidCoreList(part.to_string()))?;
            let end: u32 = end
                .trim()
                .parse()
                .map_err(|_| RuntimeError::InvalidCoreList(part.to_string()))?;
            if end < start {
                return Err(RuntimeError::InvalidCoreList(part.to_string()));
            }
            cores.extend(start..=end);
        } else {
            let core: u32 = part
                .parse()
                .map_err(|_| RuntimeError::InvalidCoreList(part.to_string()))?;
            cores.push(core);
        }
    }
    cores.sort_unstable();
    cores.dedup();
    if cores.is_empty() {
        return Err(RuntimeError::EmptyCoreList);
    }
    Ok(cores)
}

/// NUMA socket of a CPU, best-effort from sysfs. Unknown topology maps to
/// socket 0.
pub fn socket_of_cpu(cpu: u32) -> u32 {
    let path = format!(
        "/sys/devices/system/cpu/cpu{}/topology/physical_package_id",
        cpu
    );
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .map(|id| if id < 0 { 0 } else { id as u32 })
        .unwrap_or(0)
}

/// The initialised runtime: the main lcore plus worker lcores partitioned
/// by NUMA socket.
pub struct Runtime {
    main_lcore: u32,
    workers_by_socket: Vec<Vec<u32>>,
    logger: Logger,
}

impl Runtime {
    pub fn init(opts: &RuntimeOptions, logger: Logger) -> Result<Self, RuntimeError> {
        let lcores = match &opts.corelist {
            Some(list) => parse_core_list(list)?,
            None => {
                let n = std::thread::available_parallelism()
                    .map(|p| p.get() as u32)
                    .unwrap_or(1);
                (0..n).collect()
            }
        };

        logger.info(
            Facility::Runtime,
            &format!("initialising runtime with args: {:?}", opts.to_args()),
        );

        let main_lcore = lcores[0];
        let workers = &lcores[1..];
        if workers.is_empty() {
            return Err(RuntimeError::NoWorkerCores);
        }

        let num_sockets = workers.iter().map(|&c| socket_of_cpu(c)).max().unwrap_or(0) + 1;
        let mut workers_by_socket = vec![Vec::new(); num_sockets as usize];
        for &cpu in workers {
            workers_by_socket[socket_of_cpu(cpu) as usize].push(cpu);
        }

        for (socket, cores) in workers_by_socket.iter().enumerate() {
            logger.info(
                Facility::Runtime,
                &format!("socket {}: {} worker lcores {:?}", socket, cores.len(), cores),
            );
        }

        Ok(Self {
            main_lcore,
            workers_by_socket,
            logger,
        })
    }

    pub fn main_lcore(&self) -> u32 {
        self.main_lcore
    }

    pub fn socket_count(&self) -> usize {
        self.workers_by_socket.len()
    }

    pub fn workers_on_socket(&self, socket_id: u32) -> &[u32] {
        self.workers_by_socket
            .get(socket_id as usize)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Launch `body` on a dedicated thread pinned to `lcore_id`.
    ///
    /// Pinning is best-effort: in unprivileged or cpuset-restricted
    /// environments the affinity call can fail, and the worker then runs
    /// unpinned with a warning.
    pub fn launch<F>(&self, lcore_id: u32, name: &str, body: F) -> std::io::Result<LcoreHandle>
    where
        F: FnOnce(u32) + Send + 'static,
    {
        let logger = self.logger.clone();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                if let Err(err) = pin_to_cpu(lcore_id) {
                    logger.warning(
                        Facility::Runtime,
                        &format!("could not pin thread to lcore {}: {}", lcore_id, err),
                    );
                }
                body(lcore_id);
            })?;

        Ok(LcoreHandle {
            lcore_id,
            handle: Some(handle),
        })
    }
}

/// Handle to a launched worker lcore thread.
pub struct LcoreHandle {
    lcore_id: u32,
    handle: Option<JoinHandle<()>>,
}

impl LcoreHandle {
    pub fn lcore_id(&self) -> u32 {
        self.lcore_id
    }

    /// Wait for the lcore to become idle (its run loop to return).
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn pin_to_cpu(cpu: u32) -> nix::Result<()> {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let mut cpuset = CpuSet::new();
    cpuset.set(cpu as usize)?;
    sched_setaffinity(Pid::from_raw(0), &cpuset)
}

// Tick clock: monotonic nanoseconds since first use.

static CLOCK_EPOCH: OnceLock<Instant> = OnceLock::new();

/// Current tick count. Ticks are nanoseconds on a monotonic clock.
#[inline]
pub fn ticks() -> u64 {
    let epoch = CLOCK_EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as u64
}

/// Ticks per second.
#[inline]
pub const fn ticks_per_sec() -> u64 {
    1_000_000_000
}

/// Convert a millisecond interval to ticks.
#[inline]
pub const fn ms_to_ticks(ms: u64) -> u64 {
    ms * 1_000_000
}
