//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::process::Framing;

/// Admission thresholds.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Queue depth at which new requests are rejected.
    pub queue_hard_limit: usize,
    /// Queue depth above which a pressure alert is raised.
    pub queue_pressure_threshold: usize,
    /// Minimum interval between two pressure alerts.
    pub pressure_cooldown: Duration,
    /// Lifetime of the de-duplication lock.
    pub dedup_ttl: Duration,
    /// Credits consumed per admitted job.
    pub job_cost: u32,
    /// Deployment name; keys the pressure cooldown flag.
    pub deployment: String,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            queue_hard_limit: 1000,
            queue_pressure_threshold: 500,
            pressure_cooldown: Duration::from_secs(30 * 60),
            dedup_ttl: Duration::from_secs(10),
            job_cost: 1,
            deployment: "default".to_string(),
        }
    }
}

/// Fleet supervision thresholds.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Control loop period.
    pub tick_interval: Duration,
    /// Queue length one worker is expected to absorb.
    pub max_queue_length_per_worker: usize,
    /// A worker idle longer than this counts toward reclamation.
    pub idle_time_threshold: Duration,
    /// Staleness of `last_healthy_time` before a worker may be stuck.
    pub health_timeout: Duration,
    /// Staleness of `last_progress_time` before a worker may be stuck.
    pub progress_timeout: Duration,
    /// Progress below this percentage counts as no progress.
    pub min_progress_percent: f64,
    /// Deadline for a single liveness or metrics probe.
    pub probe_deadline: Duration,
    /// Grace period given to a worker on shutdown before it is killed.
    pub shutdown_timeout: Duration,
    /// Replacements allowed before a worker is retired.
    pub max_retries: u32,
    /// Base of the exponential replacement backoff.
    pub initial_backoff: Duration,
    pub max_cpu_percent: f64,
    pub max_memory_percent: f64,
    /// Fleet size bounds enforced by scaling.
    pub min_workers: usize,
    pub max_workers: usize,
    /// Non-terminal jobs older than this are classified as timed out.
    pub job_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            max_queue_length_per_worker: 10,
            idle_time_threshold: Duration::from_secs(5 * 60),
            health_timeout: Duration::from_secs(60),
            progress_timeout: Duration::from_secs(5 * 60),
            min_progress_percent: 20.0,
            probe_deadline: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(10),
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_cpu_percent: 80.0,
            max_memory_percent: 70.0,
            min_workers: 0,
            max_workers: 32,
            job_timeout: Duration::from_secs(2 * 60 * 60),
        }
    }
}

/// How new worker processes are launched.
#[derive(Debug, Clone)]
pub struct WorkerLaunchConfig {
    /// Worker executable.
    pub program: String,
    pub args: Vec<String>,
    /// Comma-separated `in1|in2>out1|out2` pairs, e.g. `step|igs>obj|fbx`.
    pub formats: String,
    pub max_parallel: u32,
    pub framing: Framing,
}

impl Default for WorkerLaunchConfig {
    fn default() -> Self {
        Self {
            program: "convert-worker".to_string(),
            args: Vec::new(),
            formats: "*>obj|fbx|glb|gltf|stl".to_string(),
            max_parallel: 2,
            framing: Framing::Text,
        }
    }
}

/// Top-level configuration for the control plane binary.
#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
    pub admission: AdmissionConfig,
    pub monitor: MonitorConfig,
    pub worker: WorkerLaunchConfig,
    /// Period of the standalone dispatch pass.
    pub dispatch_interval: Duration,
    pub db_path: PathBuf,
    pub http_port: u16,
    /// Directory for rolling log files (stdout only when unset).
    pub log_dir: Option<PathBuf>,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            admission: AdmissionConfig::default(),
            monitor: MonitorConfig::default(),
            worker: WorkerLaunchConfig::default(),
            dispatch_interval: Duration::from_secs(2),
            db_path: PathBuf::from("./data/convert-fleet.db"),
            http_port: 8080,
            log_dir: None,
        }
    }
}

impl ControlPlaneConfig {
    /// Build from `CONVERT_FLEET_*` environment variables, falling back to defaults.
    ///
    /// Unparseable numbers fall back to the default; an unknown framing name
    /// is rejected since a silent fallback would desynchronize the fleet.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        let a = &mut config.admission;
        a.queue_hard_limit = env_parse("CONVERT_FLEET_QUEUE_LIMIT", a.queue_hard_limit);
        a.queue_pressure_threshold =
            env_parse("CONVERT_FLEET_QUEUE_PRESSURE", a.queue_pressure_threshold);
        a.pressure_cooldown = env_secs("CONVERT_FLEET_PRESSURE_COOLDOWN_SECS", a.pressure_cooldown);
        a.dedup_ttl = env_secs("CONVERT_FLEET_DEDUP_TTL_SECS", a.dedup_ttl);
        a.job_cost = env_parse("CONVERT_FLEET_JOB_COST", a.job_cost);
        if let Ok(deployment) = std::env::var("CONVERT_FLEET_DEPLOYMENT") {
            a.deployment = deployment;
        }

        let m = &mut config.monitor;
        m.tick_interval = env_secs("CONVERT_FLEET_TICK_SECS", m.tick_interval);
        m.max_queue_length_per_worker =
            env_parse("CONVERT_FLEET_QUEUE_PER_WORKER", m.max_queue_length_per_worker).max(1);
        m.idle_time_threshold = env_secs("CONVERT_FLEET_IDLE_SECS", m.idle_time_threshold);
        m.health_timeout = env_secs("CONVERT_FLEET_HEALTH_TIMEOUT_SECS", m.health_timeout);
        m.progress_timeout = env_secs("CONVERT_FLEET_PROGRESS_TIMEOUT_SECS", m.progress_timeout);
        m.probe_deadline = env_secs("CONVERT_FLEET_PROBE_DEADLINE_SECS", m.probe_deadline);
        m.shutdown_timeout = env_secs("CONVERT_FLEET_SHUTDOWN_TIMEOUT_SECS", m.shutdown_timeout);
        m.max_retries = env_parse("CONVERT_FLEET_MAX_RETRIES", m.max_retries);
        m.min_workers = env_parse("CONVERT_FLEET_MIN_WORKERS", m.min_workers);
        m.max_workers = env_parse("CONVERT_FLEET_MAX_WORKERS", m.max_workers);
        m.job_timeout = env_secs("CONVERT_FLEET_JOB_TIMEOUT_SECS", m.job_timeout);
        if m.min_workers > m.max_workers {
            return Err(ConfigError::InvalidValue {
                key: "CONVERT_FLEET_MIN_WORKERS".to_string(),
                message: format!("{} exceeds max workers {}", m.min_workers, m.max_workers),
            });
        }

        let w = &mut config.worker;
        if let Ok(program) = std::env::var("CONVERT_FLEET_WORKER_PROGRAM") {
            if program.trim().is_empty() {
                return Err(ConfigError::MissingRequired {
                    key: "CONVERT_FLEET_WORKER_PROGRAM".to_string(),
                    hint: "Set it to the converter worker executable.".to_string(),
                });
            }
            w.program = program;
        }
        if let Ok(args) = std::env::var("CONVERT_FLEET_WORKER_ARGS") {
            w.args = args.split_whitespace().map(str::to_string).collect();
        }
        if let Ok(formats) = std::env::var("CONVERT_FLEET_WORKER_FORMATS") {
            w.formats = formats;
        }
        w.max_parallel = env_parse("CONVERT_FLEET_WORKER_PARALLEL", w.max_parallel).max(1);
        if let Ok(framing) = std::env::var("CONVERT_FLEET_WORKER_FRAMING") {
            w.framing = framing.parse().map_err(|message| ConfigError::InvalidValue {
                key: "CONVERT_FLEET_WORKER_FRAMING".to_string(),
                message,
            })?;
        }

        config.dispatch_interval =
            env_secs("CONVERT_FLEET_DISPATCH_SECS", config.dispatch_interval);
        if let Ok(path) = std::env::var("CONVERT_FLEET_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        config.http_port = env_parse("CONVERT_FLEET_HTTP_PORT", config.http_port);
        config.log_dir = std::env::var("CONVERT_FLEET_LOG_DIR").ok().map(PathBuf::from);

        Ok(config)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}
