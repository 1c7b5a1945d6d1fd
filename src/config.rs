//! Server Configuration
//!
//! Command-line flags are parsed with `clap` into [`Args`] and turned into a
//! [`Config`], which is what the rest of the server reads. Tests build a
//! `Config` directly from its `Default`.

use crate::storage::expiry::ExpireConfig;
use crate::storage::store::{
    BackendKind, MdbConfig, DEFAULT_DBID, DEFAULT_MAP_SIZE, DEFAULT_MAX_READERS,
};
use clap::{ArgAction, Parser, ValueEnum};
use std::path::PathBuf;

/// The default port (same as Redis)
pub const DEFAULT_PORT: u16 = 6379;

/// The default bind address
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Host cron frequency
pub const DEFAULT_HZ: u32 = 10;

/// Persistence file name inside `dir`
pub const DEFAULT_DBFILENAME: &str = "dump.rdb";

/// Storage engine selectable on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendArg {
    /// LMDB environment under `<dir>/mdb`
    Lmdb,
    /// Process memory, nothing survives a restart
    Memory,
}

impl From<BackendArg> for BackendKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Lmdb => BackendKind::Lmdb,
            BackendArg::Memory => BackendKind::Memory,
        }
    }
}

/// flashmdb - a Redis-compatible server with an LMDB-backed key space
#[derive(Debug, Parser)]
#[command(name = "flashmdb", version, about)]
pub struct Args {
    /// Host to bind to
    #[arg(long, default_value = DEFAULT_HOST)]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Working directory for the persistence file and the MDB environment
    #[arg(long, default_value = ".")]
    pub dir: PathBuf,

    /// Persistence file name
    #[arg(long, default_value = DEFAULT_DBFILENAME)]
    pub dbfilename: String,

    /// Background task frequency (ticks per second)
    #[arg(long, default_value_t = DEFAULT_HZ, value_parser = clap::value_parser!(u32).range(1..=500))]
    pub hz: u32,

    /// Run as a replica: skip the MDB section on save, restore it on load
    #[arg(long)]
    pub replica: bool,

    /// Run the active expiration cycle
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub active_expire: bool,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    pub loglevel: String,

    /// Enable the MDB layer and its MM* commands
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub mdb: bool,

    /// LMDB map size in bytes
    #[arg(long, default_value_t = DEFAULT_MAP_SIZE)]
    pub mdb_map_size: usize,

    /// LMDB reader slots
    #[arg(long, default_value_t = DEFAULT_MAX_READERS)]
    pub mdb_max_readers: u32,

    /// Let a replica expire MDB keys on its own
    #[arg(long)]
    pub mdb_replica_expire: bool,

    /// Records visited per expiration batch
    #[arg(long, default_value_t = 1000)]
    pub mdb_expire_batch: usize,

    /// Storage engine
    #[arg(long, value_enum, default_value_t = BackendArg::Lmdb)]
    pub backend: BackendArg,
}

/// Resolved server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub dir: PathBuf,
    pub dbfilename: String,
    pub hz: u32,
    pub replica: bool,
    pub active_expire: bool,
    pub loglevel: String,
    pub mdb: MdbConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            dir: PathBuf::from("."),
            dbfilename: DEFAULT_DBFILENAME.to_string(),
            hz: DEFAULT_HZ,
            replica: false,
            active_expire: true,
            loglevel: "info".to_string(),
            mdb: MdbConfig::default(),
        }
    }
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        Self {
            host: args.host,
            port: args.port,
            dir: args.dir,
            dbfilename: args.dbfilename,
            hz: args.hz,
            replica: args.replica,
            active_expire: args.active_expire,
            loglevel: args.loglevel,
            mdb: MdbConfig {
                enabled: args.mdb,
                map_size: args.mdb_map_size,
                max_readers: args.mdb_max_readers,
                dbid: DEFAULT_DBID,
                replica_expire: args.mdb_replica_expire,
                backend: args.backend.into(),
                expire: ExpireConfig {
                    batch_size: args.mdb_expire_batch.max(1),
                    ..ExpireConfig::default()
                },
            },
        }
    }
}

impl Config {
    /// Parses the process arguments.
    pub fn from_args() -> Self {
        Args::parse().into()
    }

    /// Returns the bind address as a string
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Full path of the persistence file.
    pub fn rdb_path(&self) -> PathBuf {
        self.dir.join(&self.dbfilename)
    }
}
