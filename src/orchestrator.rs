//! Device orchestrator: owns the device and wires the pipeline around it.
//!
//! `run` opens the device, starts the workers, lets the instrument send its
//! setup commands and then watches the notice queue. The first fault that
//! shows up there is returned to the caller; tearing the pipeline down is
//! left to [`DeviceOrchestrator::disconnect`], which the daemon calls from
//! its `before_stop` hook.

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::backlog::{BacklogFeeder, BacklogSettings};
use crate::broker::{Broker, MqttBroker};
use crate::config::{AgentConfig, SerialConfig};
use crate::daemon::{Service, Supervisor};
use crate::device::{Device, DeviceOpener, DeviceReader, DeviceWriter};
use crate::dispatcher::{Dispatcher, DispatcherSettings};
use crate::error::{AgentError, AgentResult, DeviceFault, Notice};
use crate::instrument::{CommandSink, Instrument};
use crate::limbo::Limbo;
use crate::network::{AlwaysReachable, Reachability, TcpProbe};
use crate::persistence::PersistenceWorker;
use crate::queue::{Queues, Take};
use crate::store::{ItemStore, SqliteStore};
use crate::worker::{self, Worker, WorkerContext, WorkerHandle};

/// Timing and framing of one device pipeline.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Sleep between idle ticks of every worker.
    pub tick_interval: Duration,
    /// Longest a worker blocks on an empty queue.
    pub queue_timeout: Duration,
    /// Capacity of the dispatch queue.
    pub dispatch_capacity: usize,
    /// Reader pushes items to the dispatcher as well as to the store.
    pub direct_send: bool,
    /// Wait for each worker on disconnect.
    pub join_timeout: Duration,
    /// Record separator on the device link.
    pub delimiter: String,
    /// Appended to each device command.
    pub terminator: String,
    /// Largest partial record before a processing fault.
    pub max_buffer_bytes: usize,
    /// Backlog feeder tuning.
    pub backlog: BacklogSettings,
    /// Publishing and reconnect settings.
    pub dispatcher: DispatcherSettings,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(200),
            queue_timeout: Duration::from_millis(200),
            dispatch_capacity: 1000,
            direct_send: true,
            join_timeout: Duration::from_secs(5),
            delimiter: "\n".to_string(),
            terminator: "\r".to_string(),
            max_buffer_bytes: 64 * 1024,
            backlog: BacklogSettings::default(),
            dispatcher: DispatcherSettings::default(),
        }
    }
}

impl From<&AgentConfig> for OrchestratorSettings {
    fn from(config: &AgentConfig) -> Self {
        Self {
            tick_interval: config.pipeline.tick_interval,
            queue_timeout: config.pipeline.queue_timeout,
            dispatch_capacity: config.pipeline.dispatch_capacity,
            direct_send: config.pipeline.direct_send,
            join_timeout: config.pipeline.join_timeout,
            delimiter: config.serial.delimiter.clone(),
            terminator: config.serial.terminator.clone(),
            max_buffer_bytes: config.serial.max_buffer_bytes,
            backlog: BacklogSettings {
                low_water_mark: config.backlog.low_water_mark,
                batch_size: config.backlog.batch_size,
                max_attempts: config.backlog.max_attempts,
                retry_window: config.backlog.retry_window,
            },
            dispatcher: config.dispatcher_settings(),
        }
    }
}

/// External collaborators of one pipeline.
pub struct Collaborators {
    /// Opens the device on start.
    pub opener: Box<dyn DeviceOpener>,
    /// Parses records and configures the device.
    pub instrument: Arc<dyn Instrument>,
    /// Durable outbox.
    pub store: Arc<dyn ItemStore>,
    /// Broker connection, owned by the dispatcher.
    pub broker: Box<dyn Broker>,
    /// Checked before each connect.
    pub reachability: Box<dyn Reachability>,
}

/// Opens one device and runs its five workers until a fault or a stop.
pub struct DeviceOrchestrator {
    name: String,
    opener: Box<dyn DeviceOpener>,
    instrument: Arc<dyn Instrument>,
    store: Arc<dyn ItemStore>,
    broker: Option<Box<dyn Broker>>,
    reachability: Option<Box<dyn Reachability>>,
    settings: OrchestratorSettings,
    queues: Queues,
    limbo: Arc<Limbo>,
    device: Option<Device>,
    workers: Vec<WorkerHandle>,
}

impl DeviceOrchestrator {
    /// An idle pipeline; nothing runs until it is started.
    pub fn new(name: impl Into<String>, parts: Collaborators, settings: OrchestratorSettings) -> Self {
        Self {
            name: name.into(),
            opener: parts.opener,
            instrument: parts.instrument,
            store: parts.store,
            broker: Some(parts.broker),
            reachability: Some(parts.reachability),
            queues: Queues::new(settings.dispatch_capacity),
            settings,
            limbo: Arc::new(Limbo::new()),
            device: None,
            workers: Vec::new(),
        }
    }

    /// Builds the production pipeline: serial device, SQLite store, MQTT broker.
    pub fn from_config(config: &AgentConfig) -> AgentResult<Self> {
        let instrument = crate::instrument::by_name(&config.agent.instrument).ok_or_else(|| {
            AgentError::Configuration(format!("Unknown instrument '{}'", config.agent.instrument))
        })?;
        let store = SqliteStore::open(&config.database.path, config.database.busy_timeout)?;
        let reachability: Box<dyn Reachability> = if config.network.probe {
            Box::new(TcpProbe::new(
                config.network.probe_host.clone(),
                config.network.probe_port,
                config.network.probe_timeout,
            ))
        } else {
            Box::new(AlwaysReachable)
        };
        let parts = Collaborators {
            opener: serial_opener(&config.serial)?,
            instrument: Arc::from(instrument),
            store: Arc::new(store),
            broker: Box::new(MqttBroker::from_config(&config.mqtt)),
            reachability,
        };
        Ok(Self::new(config.agent.device_name.clone(), parts, config.into()))
    }

    /// Device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The pipeline's queues.
    pub fn queues(&self) -> &Queues {
        &self.queues
    }

    /// The pending-ack map shared by dispatcher and backlog.
    pub fn limbo(&self) -> Arc<Limbo> {
        Arc::clone(&self.limbo)
    }

    /// `true` while the device is open.
    pub fn is_open(&self) -> bool {
        self.device.as_ref().map_or(false, Device::is_open)
    }

    /// Names of the workers started so far, in start order.
    pub fn worker_names(&self) -> Vec<&'static str> {
        self.workers.iter().map(WorkerHandle::name).collect()
    }

    /// Opens the device and starts the pipeline without waiting on notices.
    pub fn start(&mut self) -> AgentResult<()> {
        self.connect()?;
        self.start_workers()?;
        self.configure();
        Ok(())
    }

    /// Starts the pipeline and blocks until a fault, the device closing or
    /// the supervisor stopping.
    pub fn run(&mut self, supervisor: &dyn Supervisor) -> AgentResult<()> {
        if let Err(e) = self.start() {
            error!(device = %self.name, error = %e, "Device pipeline failed to start");
            return Err(e);
        }
        self.listen(supervisor)
    }

    /// Sends a raw command to the device through the write queue.
    pub fn write(&self, command: &str) -> bool {
        CommandSink::new(self.queues.write.clone()).send(command)
    }

    fn connect(&mut self) -> AgentResult<()> {
        info!(device = %self.name, location = %self.opener.describe(), "Connecting to device");
        let port = self.opener.open().map_err(|source| {
            AgentError::from(Notice::new(
                "orchestrator",
                DeviceFault::NotDetected {
                    device: self.name.clone(),
                    source,
                },
            ))
        })?;
        self.device = Some(Device::new(self.name.clone(), port));
        info!(device = %self.name, "Connected to device");
        Ok(())
    }

    fn start_workers(&mut self) -> AgentResult<()> {
        let broker = self
            .broker
            .take()
            .ok_or_else(|| AgentError::Configuration("pipeline already started".to_string()))?;
        let reachability = self
            .reachability
            .take()
            .ok_or_else(|| AgentError::Configuration("pipeline already started".to_string()))?;
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| AgentError::Configuration("device is not connected".to_string()))?;
        let gate = device.open_flag();
        let s = &self.settings;

        let writer = DeviceWriter::new(
            device.link()?,
            self.queues.write.clone(),
            &s.terminator,
            s.queue_timeout,
        );
        let mut reader = DeviceReader::new(device.link()?, Arc::clone(&self.instrument), &s.delimiter)
            .with_persist(self.queues.persist.clone())
            .with_max_buffer(s.max_buffer_bytes);
        if s.direct_send {
            reader = reader.with_direct_send(self.queues.dispatch.clone());
        }
        let mut persistence =
            PersistenceWorker::new(Arc::clone(&self.store), self.queues.persist.clone(), s.queue_timeout);
        if !s.direct_send {
            persistence = persistence.forward_to(self.queues.dispatch.clone());
        }
        let dispatcher = Dispatcher::new(
            broker,
            reachability,
            self.queues.dispatch.clone(),
            self.queues.persist.clone(),
            Arc::clone(&self.limbo),
            s.dispatcher.clone(),
        );
        let backlog = BacklogFeeder::new(
            Arc::clone(&self.store),
            self.queues.dispatch.clone(),
            Arc::clone(&self.limbo),
            s.backlog.clone(),
        );

        let interval = s.tick_interval;
        let handles = vec![
            self.spawn(writer, Some(&gate), interval)?,
            self.spawn(reader, Some(&gate), interval)?,
            self.spawn(persistence, None, interval)?,
            self.spawn(dispatcher, None, interval)?,
            self.spawn(backlog, None, interval)?,
        ];
        self.workers.extend(handles);
        info!(device = %self.name, workers = ?self.worker_names(), "Pipeline started");
        Ok(())
    }

    fn spawn<W: Worker>(
        &self,
        worker: W,
        gate: Option<&Arc<std::sync::atomic::AtomicBool>>,
        interval: Duration,
    ) -> AgentResult<WorkerHandle> {
        let mut ctx = WorkerContext::new(worker.name(), self.queues.notice.clone());
        if let Some(gate) = gate {
            ctx = ctx.with_gate(Arc::clone(gate));
        }
        Ok(worker::spawn(worker, ctx, interval)?)
    }

    fn configure(&self) {
        self.instrument
            .configure(&CommandSink::new(self.queues.write.clone()));
    }

    fn listen(&mut self, supervisor: &dyn Supervisor) -> AgentResult<()> {
        let poll = self.settings.queue_timeout;
        while self.is_open() && supervisor.is_active() {
            match self.queues.notice.take_timeout(poll) {
                Take::Item(notice) => {
                    error!(device = %self.name, notice = %notice, "Fatal device fault");
                    return Err(notice.into());
                }
                Take::Empty => {}
                Take::Closed => break,
            }
        }
        Ok(())
    }

    /// Stops every worker, waits for them and closes the device.
    ///
    /// Safe to call more than once.
    pub fn disconnect(&mut self) {
        if self.workers.is_empty() && self.device.is_none() {
            return;
        }
        info!(device = %self.name, "Disconnecting from device");
        for handle in &self.workers {
            handle.stop();
        }
        let timeout = self.settings.join_timeout;
        for handle in &mut self.workers {
            if !handle.join_timeout(timeout) {
                warn!(worker = handle.name(), "Leaving worker behind");
            }
        }
        self.workers.clear();
        if let Some(mut device) = self.device.take() {
            device.close();
        }
        info!(device = %self.name, "Disconnected from device");
    }
}

#[cfg(feature = "instrument_serial")]
fn serial_opener(config: &SerialConfig) -> AgentResult<Box<dyn DeviceOpener>> {
    Ok(Box::new(crate::device::serial::SerialOpener::from_config(config)))
}

#[cfg(not(feature = "instrument_serial"))]
fn serial_opener(_config: &SerialConfig) -> AgentResult<Box<dyn DeviceOpener>> {
    Err(AgentError::SerialFeatureDisabled)
}

impl Service for DeviceOrchestrator {
    fn run(&mut self, supervisor: &dyn Supervisor) -> AgentResult<()> {
        DeviceOrchestrator::run(self, supervisor)
    }

    fn before_stop(&mut self) {
        self.disconnect();
    }
}

impl Drop for DeviceOrchestrator {
    fn drop(&mut self) {
        self.disconnect();
    }
}
