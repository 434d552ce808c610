// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Core manager: pipeline bootstrap and lifecycle.
//!
//! Construction merges the configuration, initialises the worker-core
//! runtime, derives the stage graph from the `connect` back-edges, creates
//! a shared buffer per NUMA socket with a device, and instantiates every
//! configured worker through the class registry. `start()` connects all
//! cores to their upstream rings, assigns each to a free lcore on its
//! requested socket and launches the run loops; any failure aborts the
//! whole start. `stop()` clears the run flags, waits for every lcore to go
//! idle, releases the lcore assignments and stops the devices.

use crate::config::{ConfigUpdate, PipelineConfig};
use crate::decoder::ProtocolDecoder;
use crate::frame::FrameCallback;
use crate::logging::{Facility, Logger};
use crate::nic::NetDevice;
use crate::runtime::{LcoreHandle, Runtime, SOCKET_ID_ANY};
use crate::shared_buffer::SharedBuffer;
use crate::status::{StatusReport, StatusSource};
use crate::worker::{core_registry, CoreControl, CoreRefs, RingHub, StageSpec, WorkerCore};
use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct RegisteredCore {
    core: Box<dyn WorkerCore>,
    label: String,
}

struct RunningCore {
    handle: Option<LcoreHandle>,
    lcore_id: u32,
    run_flag: Arc<AtomicBool>,
    stats: Arc<dyn StatusSource>,
    control: Arc<dyn CoreControl>,
    label: String,
}

pub struct CoreManager {
    plugin_name: String,
    config: PipelineConfig,
    runtime: Runtime,
    devices: Vec<Arc<dyn NetDevice>>,
    rings: Arc<RingHub>,
    registered_cores: Vec<RegisteredCore>,
    running_cores: Vec<RunningCore>,
    used_lcores: Vec<u32>,
    // Declared after the cores and rings so the huge-page regions are the
    // last thing released on drop; every slot handle points into them.
    shared_buffers: HashMap<u32, Arc<SharedBuffer>>,
    logger: Logger,
}

impl CoreManager {
    pub fn new(
        plugin_name: &str,
        config: PipelineConfig,
        devices: Vec<Arc<dyn NetDevice>>,
        decoder: Arc<dyn ProtocolDecoder>,
        frame_callback: FrameCallback,
        logger: Logger,
    ) -> Result<Self> {
        logger.info(Facility::Manager, "initialising core manager");

        config.validate().context("invalid pipeline configuration")?;

        if let Some(level_name) = &config.runtime.loglevel {
            if let Some(level) = crate::logging::Severity::parse(level_name) {
                logger.set_min_severity(level);
            }
        }

        let runtime =
            Runtime::init(&config.runtime, logger.clone()).context("runtime init failed")?;

        if devices.is_empty() {
            return Err(anyhow!("no ethernet devices supplied"));
        }

        // Resolve the stage graph: each stage learns its upstream's worker
        // class name (for ring discovery) and its derived downstream count.
        let mut stage_specs: HashMap<String, Arc<StageSpec>> = HashMap::new();
        for (stage_name, stage_config) in &config.worker_cores {
            let upstream_core_name = stage_config
                .connect
                .as_ref()
                .map(|upstream| config.worker_cores[upstream].core_name.clone());
            stage_specs.insert(
                stage_name.clone(),
                Arc::new(StageSpec {
                    stage_name: stage_name.clone(),
                    config: stage_config.clone(),
                    upstream_core_name,
                    num_downstream_cores: config.num_downstream_cores(stage_name),
                }),
            );
        }

        // One shared buffer per socket hosting a device; sized so each slot
        // holds one super-frame.
        let buffer_size = decoder.super_frame_buffer_size();
        let mut shared_buffers: HashMap<u32, Arc<SharedBuffer>> = HashMap::new();
        for device in &devices {
            let socket_id = device.socket_id();
            if !shared_buffers.contains_key(&socket_id) {
                let shared = Arc::new(
                    SharedBuffer::new(config.shared_buffer_size, buffer_size, socket_id, &logger)
                        .context("shared buffer reservation failed")?,
                );
                logger.info(
                    Facility::Manager,
                    &format!(
                        "created shared buffer for socket {}: {} slots of {} bytes",
                        socket_id,
                        shared.num_buffers(),
                        shared.buffer_size()
                    ),
                );
                shared_buffers.insert(socket_id, shared);
            }
        }

        metrics::gauge!("framepipe_shared_buffer_size_bytes")
            .set(config.shared_buffer_size as f64);

        // Instantiate the configured workers for every device, offsetting
        // instance indices by rank in multi-process deployments.
        let registry = core_registry();
        let rings = RingHub::new();
        let mut registered_cores = Vec::new();

        let mut stage_names: Vec<&String> = config.worker_cores.keys().collect();
        stage_names.sort();

        for device in &devices {
            let socket_id = device.socket_id();
            let shared = Arc::clone(&shared_buffers[&socket_id]);

            for stage_name in &stage_names {
                let stage_config = &config.worker_cores[*stage_name];
                let ctor = registry.get(stage_config.core_name.as_str()).ok_or_else(|| {
                    anyhow!(
                        "unknown worker class '{}' for stage '{}'",
                        stage_config.core_name,
                        stage_name
                    )
                })?;

                let process_offset = stage_config.num_cores * config.process_rank;
                for instance in 0..stage_config.num_cores {
                    let proc_idx = instance + process_offset;
                    logger.info(
                        Facility::Manager,
                        &format!(
                            "launching worker core {} from class {} (instance {})",
                            stage_name, stage_config.core_name, proc_idx
                        ),
                    );
                    let refs = CoreRefs {
                        stage: Arc::clone(&stage_specs[*stage_name]),
                        decoder: Arc::clone(&decoder),
                        shared_buf: Arc::clone(&shared),
                        rings: Arc::clone(&rings),
                        device: Arc::clone(device),
                        packet_pool: Arc::clone(device.packet_pool()),
                        frame_callback: Arc::clone(&frame_callback),
                        logger: logger.clone(),
                    };
                    let core = ctor(proc_idx, socket_id, refs).with_context(|| {
                        format!("constructing stage '{}' instance {}", stage_name, proc_idx)
                    })?;
                    registered_cores.push(RegisteredCore {
                        label: format!("{}_{}", stage_name, proc_idx),
                        core,
                    });
                }
            }
        }

        Ok(Self {
            plugin_name: plugin_name.to_string(),
            config,
            runtime,
            devices,
            shared_buffers,
            rings,
            registered_cores,
            running_cores: Vec::new(),
            used_lcores: Vec::new(),
            logger,
        })
    }

    /// The shared ring namespace (tests and embedders).
    pub fn rings(&self) -> Arc<RingHub> {
        Arc::clone(&self.rings)
    }

    pub fn shared_buffer(&self, socket_id: u32) -> Option<Arc<SharedBuffer>> {
        self.shared_buffers.get(&socket_id).cloned()
    }

    fn find_free_lcore(&self, requested_socket: u32) -> Option<u32> {
        let sockets: Vec<u32> = if requested_socket == SOCKET_ID_ANY {
            (0..self.runtime.socket_count() as u32).collect()
        } else {
            vec![requested_socket]
        };
        for socket in sockets {
            for &lcore in self.runtime.workers_on_socket(socket) {
                if !self.used_lcores.contains(&lcore) {
                    return Some(lcore);
                }
            }
        }
        None
    }

    /// Connect and launch every registered core. Any failure stops the
    /// cores already launched and fails the start.
    pub fn start(&mut self) -> Result<()> {
        if self.config.process_rank == 0 {
            for device in &self.devices {
                device
                    .start()
                    .with_context(|| format!("starting device on port {}", device.port_id()))?;
            }
        }

        for registered in &mut self.registered_cores {
            registered
                .core
                .connect()
                .with_context(|| format!("connecting core {}", registered.label))?;
        }

        let mut failure: Option<anyhow::Error> = None;
        let registered = std::mem::take(&mut self.registered_cores);

        for entry in registered {
            let RegisteredCore { core, label } = entry;
            let Some(lcore_id) = self.find_free_lcore(core.socket_id()) else {
                failure = Some(anyhow!(
                    "no free lcore on socket {} for core {}",
                    core.socket_id(),
                    label
                ));
                break;
            };

            let run_flag = core.run_flag();
            let stats = core.stats();
            let control = core.control();

            self.logger.debug(
                Facility::Manager,
                &format!("launching worker core {} on lcore {}", label, lcore_id),
            );

            let mut core = core;
            match self
                .runtime
                .launch(lcore_id, &label, move |id| core.run(id))
            {
                Ok(handle) => {
                    self.used_lcores.push(lcore_id);
                    self.running_cores.push(RunningCore {
                        handle: Some(handle),
                        lcore_id,
                        run_flag,
                        stats,
                        control,
                        label,
                    });
                }
                Err(err) => {
                    failure = Some(anyhow!("failed to launch core {}: {}", label, err));
                    break;
                }
            }
        }

        if let Some(err) = failure {
            self.logger.critical(
                Facility::Manager,
                &format!("aborting start: {}", err),
            );
            self.stop();
            return Err(err);
        }
        Ok(())
    }

    /// Stop every running core, wait for its lcore to go idle and release
    /// the assignment, then stop the devices.
    pub fn stop(&mut self) {
        if self.running_cores.is_empty() {
            self.logger
                .warning(Facility::Manager, "no running worker cores to stop");
        }

        for running in &self.running_cores {
            running.run_flag.store(false, Ordering::Relaxed);
        }

        for mut running in self.running_cores.drain(..) {
            self.logger.debug(
                Facility::Manager,
                &format!("stopping worker {} on lcore {}", running.label, running.lcore_id),
            );
            if let Some(handle) = running.handle.take() {
                handle.join();
            }
            self.used_lcores.retain(|&lcore| lcore != running.lcore_id);
        }

        for device in &self.devices {
            device.stop();
        }
    }

    /// Apply a runtime configuration update to every core.
    pub fn apply_update(&self, update: &ConfigUpdate) {
        for registered in &self.registered_cores {
            registered.core.control().apply_update(update);
        }
        for running in &self.running_cores {
            running.control.apply_update(update);
        }
    }

    /// Aggregate the status surface across the manager and all running
    /// cores.
    pub fn status(&self) -> StatusReport {
        let mut report = StatusReport::new();
        report.set_param(
            format!("{}/core_manager/shared_buffer_size", self.plugin_name),
            self.config.shared_buffer_size,
        );
        for running in &self.running_cores {
            running.stats.status(&mut report, &self.plugin_name);
        }
        report
    }
}

impl Drop for CoreManager {
    fn drop(&mut self) {
        if !self.running_cores.is_empty() {
            self.stop();
        }
    }
}
