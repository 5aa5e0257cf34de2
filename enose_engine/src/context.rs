//! Controller context: explicit wiring of links, store and counters.
//!
//! One context is constructed at process start and passed by reference to
//! every component that needs it; test suites instantiate their own with
//! simulated transports.

use std::sync::Arc;
use std::time::Duration;

use enose_common::config::EnoseConfig;
use enose_hal::loadcell::{LoadCell, LoadCellConfig, WeightSource};
use enose_hal::motion::{MotionLink, MotionPort};
use enose_hal::sensor::{SensorLink, SensorLinkConfig, SensorPort};
use enose_store::{Recorder, RecorderConfig, ResultStore};

use crate::consumables::ConsumableLedger;
use crate::state::PeripheralStateMachine;

/// Everything the engine needs, wired once.
pub struct ControllerContext {
    /// Instrument configuration.
    pub config: EnoseConfig,
    /// Motion-controller link.
    pub motion: Arc<MotionLink>,
    /// Peripheral state machine over the motion link.
    pub psm: Arc<PeripheralStateMachine>,
    /// Load cell, when the instrument has one.
    pub loadcell: Option<Arc<LoadCell>>,
    /// Sensor link, when the array is connected.
    pub sensor: Option<Arc<SensorLink>>,
    /// Backing store.
    pub store: Arc<dyn ResultStore>,
    /// Buffered recorder in front of the store.
    pub recorder: Arc<Recorder>,
    /// Consumable counters.
    pub ledger: Arc<ConsumableLedger>,
}

impl ControllerContext {
    /// Assemble a context from transports and a store.
    ///
    /// Link tunables (ack windows, sampling rates) come from `config`;
    /// consumable usage is restored from the store's key-value table when
    /// a snapshot is present.
    pub fn assemble(
        config: EnoseConfig,
        motion_port: Box<dyn MotionPort>,
        weight_source: Option<Box<dyn WeightSource>>,
        sensor_ports: Option<(Box<dyn SensorPort>, Box<dyn SensorPort>)>,
        store: Arc<dyn ResultStore>,
    ) -> Self {
        let motion = Arc::new(MotionLink::new(
            motion_port,
            Duration::from_millis(config.motion.ack_timeout_ms),
        ));
        let psm = Arc::new(PeripheralStateMachine::new(motion.clone()));

        let loadcell = weight_source.map(|source| {
            Arc::new(LoadCell::spawn(
                source,
                LoadCellConfig {
                    sample_period: Duration::from_millis(config.stability.sample_period_ms),
                    window: Duration::from_secs_f64(config.stability.window_s),
                    tolerance_g: config.stability.tolerance_g,
                    empty_tare_g: config.bottle.empty_tare_g,
                    ..LoadCellConfig::default()
                },
            ))
        });

        let sensor = sensor_ports.map(|(primary, secondary)| {
            Arc::new(SensorLink::spawn(
                primary,
                secondary,
                SensorLinkConfig {
                    reply_timeout: Duration::from_millis(config.sensor.reply_timeout_ms),
                },
            ))
        });

        let ledger = Arc::new(ConsumableLedger::from_specs(&config.consumables));
        if let Ok(Some(json)) = store.get_kv(CONSUMABLE_USAGE_KEY) {
            ledger.restore_usage_json(&json);
        }

        let recorder = Arc::new(Recorder::spawn(store.clone(), RecorderConfig::default()));

        Self {
            config,
            motion,
            psm,
            loadcell,
            sensor,
            store,
            recorder,
            ledger,
        }
    }

    /// Persist consumable usage to the store's key-value table.
    pub fn persist_consumables(&self) {
        if let Err(e) = self
            .store
            .put_kv(CONSUMABLE_USAGE_KEY, &self.ledger.usage_json())
        {
            tracing::warn!(error = %e, "consumable snapshot not persisted");
        }
    }
}

/// Key-value slot holding the consumable usage snapshot.
pub const CONSUMABLE_USAGE_KEY: &str = "consumable_usage";
