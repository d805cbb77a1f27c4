//! Simulated speed producer.
//!
//! Generates a smoothly varying speed for one virtual device and feeds it
//! into the ingest queue, exactly like a broker-delivered reading. The
//! speed drifts toward a target that is occasionally re-drawn around the
//! base speed, with a little noise on every tick.

use crate::ingest::{enqueue, InboundReading};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

/// Chance per tick of drawing a new target speed.
const RETARGET_PROBABILITY: f64 = 0.05;

/// Magnitude of the uniform per-tick noise.
const NOISE: f64 = 1.0;

const MIN_CHANGE_INTERVAL_SECS: f64 = 0.05;
const MAX_CHANGE_INTERVAL_SECS: f64 = 3600.0;

/// Simulation parameters. Every field has a default, so `{}` is a valid body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    pub device_id: String,
    /// Speed the simulation hovers around.
    pub base_speed: f64,
    /// Targets are drawn from `base_speed ± speed_variation`.
    pub speed_variation: f64,
    /// Seconds between readings.
    pub change_interval: f64,
    /// Fraction of the gap to the target closed on each tick.
    pub acceleration_factor: f64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            device_id: "simulated_car".to_string(),
            base_speed: 30.0,
            speed_variation: 20.0,
            change_interval: 1.0,
            acceleration_factor: 0.2,
        }
    }
}

/// Errors from controlling the simulator.
#[derive(Debug, Error)]
pub enum SimulatorError {
    #[error("simulator is already running")]
    AlreadyRunning,

    #[error("invalid simulator config: {0}")]
    InvalidConfig(&'static str),
}

impl SimulatorConfig {
    /// Checks that the parameters describe a runnable simulation.
    ///
    /// # Errors
    ///
    /// Returns `SimulatorError::InvalidConfig` naming the first bad field.
    pub fn validate(&self) -> Result<(), SimulatorError> {
        if self.device_id.trim().is_empty() {
            return Err(SimulatorError::InvalidConfig("device_id must not be empty"));
        }
        if !self.base_speed.is_finite() {
            return Err(SimulatorError::InvalidConfig("base_speed must be finite"));
        }
        if !self.speed_variation.is_finite() || self.speed_variation < 0.0 {
            return Err(SimulatorError::InvalidConfig(
                "speed_variation must be a non-negative number",
            ));
        }
        if !(MIN_CHANGE_INTERVAL_SECS..=MAX_CHANGE_INTERVAL_SECS).contains(&self.change_interval) {
            return Err(SimulatorError::InvalidConfig(
                "change_interval must be between 0.05 and 3600 seconds",
            ));
        }
        if !(0.0..=1.0).contains(&self.acceleration_factor) {
            return Err(SimulatorError::InvalidConfig(
                "acceleration_factor must be between 0 and 1",
            ));
        }
        Ok(())
    }
}

/// Speed dynamics of the simulated vehicle.
#[derive(Debug, Clone)]
pub struct SpeedModel {
    base_speed: f64,
    speed_variation: f64,
    acceleration_factor: f64,
    current: f64,
    target: f64,
}

impl SpeedModel {
    pub fn new(config: &SimulatorConfig) -> Self {
        Self {
            base_speed: config.base_speed,
            speed_variation: config.speed_variation,
            acceleration_factor: config.acceleration_factor,
            current: config.base_speed,
            target: config.base_speed,
        }
    }

    /// Advances one tick and returns the new speed, rounded to 0.1.
    ///
    /// The result is never negative.
    pub fn step<R: Rng>(&mut self, rng: &mut R) -> f64 {
        if rng.gen::<f64>() < RETARGET_PROBABILITY {
            self.target = self.base_speed
                + rng.gen_range(-self.speed_variation..=self.speed_variation);
        }

        self.current += (self.target - self.current) * self.acceleration_factor;
        self.current = (self.current + rng.gen_range(-NOISE..=NOISE)).max(0.0);

        (self.current * 10.0).round() / 10.0
    }

    pub fn target(&self) -> f64 {
        self.target
    }
}

/// Snapshot of the simulator for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SimulatorStatus {
    /// `"running"` or `"stopped"`.
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<SimulatorConfig>,
}

struct RunningSimulator {
    config: SimulatorConfig,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Starts and stops the simulated producer. At most one runs at a time.
#[derive(Clone)]
pub struct SimulatorController {
    queue: mpsc::Sender<InboundReading>,
    running: Arc<Mutex<Option<RunningSimulator>>>,
}

impl SimulatorController {
    pub fn new(queue: mpsc::Sender<InboundReading>) -> Self {
        Self {
            queue,
            running: Arc::new(Mutex::new(None)),
        }
    }

    /// Starts producing readings with `config`.
    ///
    /// # Errors
    ///
    /// Returns `SimulatorError::InvalidConfig` for bad parameters and
    /// `SimulatorError::AlreadyRunning` if a simulation is active.
    pub async fn start(&self, config: SimulatorConfig) -> Result<SimulatorConfig, SimulatorError> {
        config.validate()?;

        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return Err(SimulatorError::AlreadyRunning);
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run_simulation(config.clone(), self.queue.clone(), stop_rx));

        tracing::info!(
            device_id = %config.device_id,
            base_speed = config.base_speed,
            speed_variation = config.speed_variation,
            change_interval = config.change_interval,
            "simulator started"
        );

        *running = Some(RunningSimulator {
            config: config.clone(),
            stop_tx,
            task,
        });
        Ok(config)
    }

    /// Stops the simulation and waits for its task to finish.
    ///
    /// Returns `false` if nothing was running.
    pub async fn stop(&self) -> bool {
        let Some(sim) = self.running.lock().await.take() else {
            return false;
        };

        let _ = sim.stop_tx.send(true);
        if let Err(e) = sim.task.await {
            tracing::error!("simulator task join error: {}", e);
        }
        tracing::info!(device_id = %sim.config.device_id, "simulator stopped");
        true
    }

    pub async fn status(&self) -> SimulatorStatus {
        match self.running.lock().await.as_ref() {
            Some(sim) if !sim.task.is_finished() => SimulatorStatus {
                status: "running",
                config: Some(sim.config.clone()),
            },
            _ => SimulatorStatus {
                status: "stopped",
                config: None,
            },
        }
    }
}

async fn run_simulation(
    config: SimulatorConfig,
    queue: mpsc::Sender<InboundReading>,
    mut stop: watch::Receiver<bool>,
) {
    let mut model = SpeedModel::new(&config);
    let mut rng = StdRng::from_entropy();
    let mut ticker = tokio::time::interval(Duration::from_secs_f64(config.change_interval));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let speed = model.step(&mut rng);
                let reading = InboundReading {
                    device_id: Some(config.device_id.clone()),
                    speed: Some(speed),
                    unit: Some(speedo_readings::DEFAULT_UNIT.to_string()),
                    timestamp: Some(Utc::now()),
                };
                if !enqueue(&queue, reading, "simulator") && queue.is_closed() {
                    break;
                }
            }
            _ = stop.changed() => break,
        }
    }
}
