// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Pipeline configuration types and parsing.
//!
//! JSON5 configuration format supporting comments and trailing commas. The
//! `worker_cores` table describes the stage graph: each entry names its
//! worker class (`core_name`), how many instances to run (`num_cores`) and
//! which stage it consumes from (`connect`); the root stage omits
//! `connect`. The graph itself is deduced by walking the `connect`
//! back-edges at bootstrap.

use crate::decoder::{BitDepth, GridGeometry};
use crate::runtime::RuntimeOptions;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::Path;
use thiserror::Error;

/// Default shared buffer region size: 8 GiB.
pub const DEFAULT_SHARED_BUFFER_SIZE: usize = 8 * 1024 * 1024 * 1024;

fn default_shared_buffer_size() -> usize {
    DEFAULT_SHARED_BUFFER_SIZE
}

fn default_rx_burst_size() -> usize {
    64
}

fn default_fwd_ring_size() -> usize {
    2048
}

fn default_release_ring_size() -> usize {
    4096
}

fn default_retries() -> u32 {
    16
}

fn default_frame_timeout_ms() -> u64 {
    1000
}

fn default_compress_level() -> u32 {
    1
}

fn default_compress_codec() -> String {
    "lz4".to_string()
}

fn default_compress_threads() -> usize {
    1
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    /// Total size in bytes of the per-socket shared buffer region.
    #[serde(default = "default_shared_buffer_size")]
    pub shared_buffer_size: usize,

    /// Number of secondary processes sharing the fan-out (multi-process
    /// deployments).
    #[serde(default)]
    pub num_secondary_processes: usize,

    /// Rank of this process in a multi-process deployment; offsets the
    /// per-stage instance indices.
    #[serde(default)]
    pub process_rank: usize,

    /// Cross-check flag: must agree with the presence of a
    /// `frame_compressor` stage in `worker_cores`.
    #[serde(default)]
    pub enable_compression: bool,

    /// Passthrough options for the kernel-bypass runtime.
    #[serde(default)]
    pub runtime: RuntimeOptions,

    /// Detector geometry for the bundled grid decoder (binary deployments;
    /// embedders construct their own decoder).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry: Option<GridGeometry>,

    /// Stage graph: map of stage name to worker core configuration.
    #[serde(default)]
    pub worker_cores: HashMap<String, WorkerCoreConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            shared_buffer_size: DEFAULT_SHARED_BUFFER_SIZE,
            num_secondary_processes: 0,
            process_rank: 0,
            enable_compression: false,
            runtime: RuntimeOptions::default(),
            geometry: None,
            worker_cores: HashMap::new(),
        }
    }
}

/// Per-stage worker configuration. Stage-specific fields have defaults and
/// are only meaningful to their stage class.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerCoreConfig {
    /// Worker class name, the factory key ("packet_rx", "packet_processor",
    /// "frame_builder", "frame_compressor", "frame_wrapper").
    pub core_name: String,

    /// Name of the upstream stage this one consumes from. The root stage
    /// omits it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect: Option<String>,

    /// Number of instances of this stage.
    pub num_cores: usize,

    /// When set on an upstream stage, downstream fan-out is multiplied
    /// across secondary processes.
    #[serde(default)]
    pub secondary_fanout: bool,

    // --- packet_rx ---
    /// IP address the RX core answers ARP/ICMP for. Required for packet_rx.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_ip: Option<Ipv4Addr>,

    /// UDP destination ports carrying detector data.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rx_ports: Vec<u16>,

    #[serde(default)]
    pub rx_queue_id: u16,

    #[serde(default)]
    pub tx_queue_id: u16,

    #[serde(default = "default_rx_burst_size")]
    pub rx_burst_size: usize,

    #[serde(default = "default_fwd_ring_size")]
    pub fwd_ring_size: usize,

    #[serde(default = "default_release_ring_size")]
    pub release_ring_size: usize,

    #[serde(default = "default_retries")]
    pub max_packet_tx_retries: u32,

    #[serde(default = "default_retries")]
    pub max_packet_queue_retries: u32,

    // --- packet_processor ---
    /// Milliseconds before an in-progress super-frame is evicted as
    /// incomplete.
    #[serde(default = "default_frame_timeout_ms")]
    pub frame_timeout: u64,

    // --- frame_compressor / frame_wrapper ---
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset_name: Option<String>,

    /// Compression level; 0 disables compression (payload copied through).
    #[serde(default = "default_compress_level", alias = "clevel")]
    pub compress_level: u32,

    /// Shuffle filter: 0 none, 1 type-width byte shuffle.
    #[serde(default, alias = "doshuffle")]
    pub compress_shuffle: u32,

    /// Block codec name; only "lz4" is supported.
    #[serde(default = "default_compress_codec", alias = "compcode")]
    pub compress_codec: String,

    /// Codec block size hint; 0 lets the codec choose.
    #[serde(default, alias = "blocksize")]
    pub compress_block_size: usize,

    /// Codec-internal thread count; the stage itself is single-core.
    #[serde(default = "default_compress_threads", alias = "num_threads")]
    pub compress_threads: usize,
}

impl Default for WorkerCoreConfig {
    fn default() -> Self {
        Self {
            core_name: String::new(),
            connect: None,
            num_cores: 1,
            secondary_fanout: false,
            device_ip: None,
            rx_ports: Vec::new(),
            rx_queue_id: 0,
            tx_queue_id: 0,
            rx_burst_size: default_rx_burst_size(),
            fwd_ring_size: default_fwd_ring_size(),
            release_ring_size: default_release_ring_size(),
            max_packet_tx_retries: default_retries(),
            max_packet_queue_retries: default_retries(),
            frame_timeout: default_frame_timeout_ms(),
            dataset_name: None,
            compress_level: default_compress_level(),
            compress_shuffle: 0,
            compress_codec: default_compress_codec(),
            compress_block_size: 0,
            compress_threads: default_compress_threads(),
        }
    }
}

/// Runtime configuration update applied to a running pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigUpdate {
    /// Re-anchor the frame numbering: the next observed packet resets each
    /// processor's rebase latch.
    #[serde(default)]
    pub proc_enable: bool,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {message}")]
    Io { path: String, message: String },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("stage '{stage}' connects to unknown stage '{upstream}'")]
    UnknownUpstream { stage: String, upstream: String },

    #[error("stage '{stage}' has unknown worker class '{core_name}'")]
    UnknownCoreClass { stage: String, core_name: String },

    #[error("stage '{0}' must run at least one core")]
    ZeroCores(String),

    #[error("no root stage: every stage declares 'connect'")]
    NoRootStage,

    #[error("multiple root stages: {0:?}")]
    MultipleRootStages(Vec<String>),

    #[error("stage graph contains a cycle through '{0}'")]
    CyclicGraph(String),

    #[error("packet_rx stage '{0}' requires 'device_ip'")]
    MissingDeviceIp(String),

    #[error("packet_rx stage '{0}' defines no rx_ports")]
    NoRxPorts(String),

    #[error("stage '{stage}' uses unsupported compression codec '{codec}'")]
    UnsupportedCodec { stage: String, codec: String },

    #[error("enable_compression is {flag} but the graph {has} a frame_compressor stage")]
    CompressionMismatch { flag: bool, has: &'static str },

    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),
}

/// Worker class names accepted in `core_name`.
pub const KNOWN_CORE_CLASSES: [&str; 5] = [
    "packet_rx",
    "packet_processor",
    "frame_builder",
    "frame_compressor",
    "frame_wrapper",
];

impl PipelineConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::parse(&content)
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        json5::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Serialize with pretty formatting (JSON is valid JSON5).
    pub fn to_json5(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        std::fs::write(path, self.to_json5()).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Name of the single root stage (the one without `connect`).
    pub fn root_stage(&self) -> Result<&str, ConfigError> {
        let mut roots: Vec<&str> = self
            .worker_cores
            .iter()
            .filter(|(_, cfg)| cfg.connect.is_none())
            .map(|(name, _)| name.as_str())
            .collect();
        roots.sort_unstable();
        match roots.len() {
            0 => Err(ConfigError::NoRootStage),
            1 => Ok(roots[0]),
            _ => Err(ConfigError::MultipleRootStages(
                roots.iter().map(|s| s.to_string()).collect(),
            )),
        }
    }

    /// Validate the stage graph and per-stage requirements.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_cores.is_empty() {
            return Err(ConfigError::NoRootStage);
        }

        for (stage, cfg) in &self.worker_cores {
            if cfg.num_cores == 0 {
                return Err(ConfigError::ZeroCores(stage.clone()));
            }
            if !KNOWN_CORE_CLASSES.contains(&cfg.core_name.as_str()) {
                return Err(ConfigError::UnknownCoreClass {
                    stage: stage.clone(),
                    core_name: cfg.core_name.clone(),
                });
            }
            if let Some(upstream) = &cfg.connect {
                if !self.worker_cores.contains_key(upstream) {
                    return Err(ConfigError::UnknownUpstream {
                        stage: stage.clone(),
                        upstream: upstream.clone(),
                    });
                }
            }
            if cfg.core_name == "packet_rx" {
                if cfg.device_ip.is_none() {
                    return Err(ConfigError::MissingDeviceIp(stage.clone()));
                }
                if cfg.rx_ports.is_empty() {
                    return Err(ConfigError::NoRxPorts(stage.clone()));
                }
            }
            if cfg.core_name == "frame_compressor" && cfg.compress_codec != "lz4" {
                return Err(ConfigError::UnsupportedCodec {
                    stage: stage.clone(),
                    codec: cfg.compress_codec.clone(),
                });
            }
        }

        self.root_stage()?;

        // Walking connect back-edges from any stage must terminate at the
        // root without revisiting a stage.
        for start in self.worker_cores.keys() {
            let mut visited = HashSet::new();
            let mut cursor = start;
            while let Some(upstream) = &self.worker_cores[cursor].connect {
                if !visited.insert(cursor.clone()) {
                    return Err(ConfigError::CyclicGraph(cursor.clone()));
                }
                cursor = upstream;
            }
        }

        let has_compressor = self
            .worker_cores
            .values()
            .any(|cfg| cfg.core_name == "frame_compressor");
        if self.enable_compression != has_compressor {
            return Err(ConfigError::CompressionMismatch {
                flag: self.enable_compression,
                has: if has_compressor { "contains" } else { "lacks" },
            });
        }

        if let Some(geometry) = &self.geometry {
            geometry.validate().map_err(ConfigError::InvalidGeometry)?;
        }

        Ok(())
    }

    /// Stages that consume from `stage`.
    pub fn downstream_of(&self, stage: &str) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .worker_cores
            .iter()
            .filter(|(_, cfg)| cfg.connect.as_deref() == Some(stage))
            .map(|(name, _)| name.as_str())
            .collect();
        names.sort_unstable();
        names
    }

    /// Derived downstream consumer count for `stage`: the sum of downstream
    /// `num_cores`, multiplied across secondary processes when this stage
    /// fans out to them.
    pub fn num_downstream_cores(&self, stage: &str) -> usize {
        let Some(cfg) = self.worker_cores.get(stage) else {
            return 0;
        };
        let mut total = 0;
        for downstream in self.downstream_of(stage) {
            let mut count = self.worker_cores[downstream].num_cores;
            if cfg.secondary_fanout {
                count += count * self.num_secondary_processes;
            }
            total += count;
        }
        total
    }
}

/// A convenience default geometry for the bundled grid decoder: 512x512,
/// 16-bit, 8 packets per frame.
pub fn default_geometry() -> GridGeometry {
    GridGeometry {
        x_resolution: 512,
        y_resolution: 512,
        bit_depth: BitDepth::Depth16,
        frames_per_super_frame: 100,
        packets_per_sub_frame: 8,
        payload_size: 65536,
    }
}
