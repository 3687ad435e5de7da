//! Process Configuration
//!
//! Both binaries take `--flag value` pairs on the command line. Unknown flags are
//! ignored so wrapper scripts can pass extra arguments through.

use anyhow::{Context, Result, anyhow};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_SEARCH_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_PLACEMENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timing knobs shared by the registry and the worker sessions.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterTimings {
    /// Period between two heartbeat probes to the same worker.
    pub heartbeat_interval: Duration,
    /// How long a probe may wait for ALV before the worker is declared dead.
    pub heartbeat_timeout: Duration,
    /// Upper bound on how long a client search stays pending.
    pub search_timeout: Duration,
    /// Upper bound on waiting for a joining worker's MMF after LOD.
    pub placement_timeout: Duration,
}

impl Default for ClusterTimings {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            search_timeout: DEFAULT_SEARCH_TIMEOUT,
            placement_timeout: DEFAULT_PLACEMENT_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    pub worker_addr: SocketAddr,
    pub client_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub timings: ClusterTimings,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            worker_addr: SocketAddr::from(([0, 0, 0, 0], 7000)),
            client_addr: SocketAddr::from(([0, 0, 0, 0], 7001)),
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            timings: ClusterTimings::default(),
        }
    }
}

impl CoordinatorConfig {
    pub const USAGE: &'static str = "[--workers <addr:port>] [--clients <addr:port>] [--http <addr:port>] \
         [--heartbeat-ms <ms>] [--heartbeat-timeout-ms <ms>] [--search-timeout-ms <ms>] \
         [--placement-timeout-ms <ms>]";

    /// Parses flags, skipping the program name in `args[0]`.
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut config = Self::default();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--workers" => config.worker_addr = parse_value(args, i)?,
                "--clients" => config.client_addr = parse_value(args, i)?,
                "--http" => config.http_addr = parse_value(args, i)?,
                "--heartbeat-ms" => config.timings.heartbeat_interval = parse_millis(args, i)?,
                "--heartbeat-timeout-ms" => {
                    config.timings.heartbeat_timeout = parse_millis(args, i)?
                }
                "--search-timeout-ms" => config.timings.search_timeout = parse_millis(args, i)?,
                "--placement-timeout-ms" => {
                    config.timings.placement_timeout = parse_millis(args, i)?
                }
                _ => {
                    i += 1;
                    continue;
                }
            }
            i += 2;
        }

        if config.timings.heartbeat_timeout >= config.timings.heartbeat_interval {
            return Err(anyhow!(
                "heartbeat timeout ({:?}) must be shorter than the heartbeat period ({:?})",
                config.timings.heartbeat_timeout,
                config.timings.heartbeat_interval
            ));
        }

        Ok(config)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub id: u32,
    pub coordinator_addr: SocketAddr,
    pub data_dir: PathBuf,
}

impl WorkerConfig {
    pub const USAGE: &'static str =
        "--id <n> [--coordinator <addr:port>] [--data-dir <path>]";

    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut id = None;
        let mut coordinator_addr = SocketAddr::from(([127, 0, 0, 1], 7000));
        let mut data_dir = PathBuf::from("./data");

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--id" => id = Some(parse_value(args, i)?),
                "--coordinator" => coordinator_addr = parse_value(args, i)?,
                "--data-dir" => data_dir = PathBuf::from(value_at(args, i)?),
                _ => {
                    i += 1;
                    continue;
                }
            }
            i += 2;
        }

        Ok(Self {
            id: id.ok_or_else(|| anyhow!("--id is required"))?,
            coordinator_addr,
            data_dir,
        })
    }

    /// Directory holding this worker's chunk files: `<data_dir>/node_<id>`.
    pub fn chunk_dir(&self) -> PathBuf {
        self.data_dir.join(format!("node_{}", self.id))
    }
}

fn value_at(args: &[String], flag_idx: usize) -> Result<&str> {
    args.get(flag_idx + 1)
        .map(String::as_str)
        .ok_or_else(|| anyhow!("{} expects a value", args[flag_idx]))
}

fn parse_value<T>(args: &[String], flag_idx: usize) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = value_at(args, flag_idx)?;
    raw.parse()
        .with_context(|| format!("invalid value {:?} for {}", raw, args[flag_idx]))
}

fn parse_millis(args: &[String], flag_idx: usize) -> Result<Duration> {
    let millis: u64 = parse_value(args, flag_idx)?;
    if millis == 0 {
        return Err(anyhow!("{} must be greater than zero", args[flag_idx]));
    }
    Ok(Duration::from_millis(millis))
}
