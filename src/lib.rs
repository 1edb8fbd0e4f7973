//! # Buoy Agent Core Library
//!
//! This crate is the core library of the `buoy-agent` daemon. The agent sits on
//! an embedded host next to a serial instrument, turns every line the
//! instrument prints into a timestamped measurement item, stores it durably and
//! publishes it to an MQTT broker with at-least-once delivery. Keeping the
//! pipeline in a library lets the binary (`main.rs`) and the integration tests
//! drive the same code.
//!
//! ## Crate Structure
//!
//! - **`config`**: Layered configuration (TOML file plus `BUOY_*` environment
//!   variables) loaded with `figment`. See `config::AgentConfig`.
//! - **`validation`**: Field checks used by `AgentConfig::validate`.
//! - **`logging`**: Installs the `tracing-subscriber` registry.
//! - **`error`**: The `AgentError` enum and the `Notice`/`DeviceFault` pair that
//!   workers put on the notice queue.
//! - **`item`**: The measurement `Item`, its canonical JSON form and the
//!   `Envelope` used to report delivery outcomes.
//! - **`queue`**: Bounded and unbounded queues shared between workers.
//! - **`limbo`**: Items published but not yet acknowledged by the broker.
//! - **`worker`**: The worker trait and the thread scheduler that drives it.
//! - **`device`**: Serial/mock ports, line framing, reader and writer workers.
//! - **`instrument`**: Line parsers for the supported instruments.
//! - **`store`**: The durable outbox (`ItemStore`, SQLite backed).
//! - **`persistence`**: Worker applying new items and delivery outcomes to the store.
//! - **`backlog`**: Worker refilling the dispatch queue from unsent stored items.
//! - **`broker`**: The `Broker` seam, the `rumqttc` client and an in-memory double.
//! - **`network`**: Reachability probe run before connecting to the broker.
//! - **`dispatcher`**: Connection state machine and publisher.
//! - **`orchestrator`**: Owns the device and wires the pipeline together.
//! - **`daemon`**: Service lifecycle, PID file and signal handling.

pub mod backlog;
pub mod broker;
pub mod config;
pub mod daemon;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod instrument;
pub mod item;
pub mod limbo;
pub mod logging;
pub mod network;
pub mod orchestrator;
pub mod persistence;
pub mod queue;
pub mod store;
pub mod validation;
pub mod worker;
