//! Region-server runtime configuration.
//!
//! Defaults live here; the CLI layer (see `main.rs`) overrides fields from
//! flags/env, and the master may override dotted keys again through the
//! config map returned by `startup`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Configuration recognized by the region-server core.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for the client request surface.
    pub bind_address: SocketAddr,
    /// Number of concurrently-admitted request handlers.
    pub handler_count: usize,
    /// Status page port carried in the server identity; negative disables.
    pub info_port: i32,
    /// Heartbeat interval to the master (ms).
    pub msg_interval_ms: u64,
    /// Master-session timeout; the server aborts if it cannot report for
    /// this long (ms).
    pub master_lease_period_ms: u64,
    /// Scanner lease period (ms).
    pub scanner_lease_period_ms: u64,
    /// Compactor queue poll interval (ms).
    pub compact_check_frequency_ms: u64,
    /// Age after which an idle region memtable is flushed anyway (ms).
    pub optional_flush_interval_ms: u64,
    /// Hard cap on the sum of all region memtable sizes (bytes).
    pub global_memcache_limit: u64,
    /// Relief target once the hard cap is hit (bytes); defaults to half
    /// the cap when zero.
    pub global_memcache_low_mark: u64,
    /// Consecutive master-report failures tolerated before stopping; also
    /// the per-instruction retry budget in the worker.
    pub retries: u32,
    /// Generic background poll / wake interval (ms).
    pub wake_frequency_ms: u64,
    /// Root directory of the shared filesystem; normally supplied by the
    /// master in the startup config map under `lattice.rootdir`.
    pub root_dir: PathBuf,
    /// Per-region memtable size that triggers an on-demand flush (bytes).
    pub region_memcache_flush_size: u64,
    /// Aggregate store size past which a compaction reports a split due
    /// (bytes).
    pub region_split_size: u64,
    /// Flushes accumulated per region before a compaction is requested.
    pub compaction_threshold: u32,
    /// WAL entries per segment before a roll is requested.
    pub wal_max_entries: u64,
    /// Cell versions retained per column by compaction.
    pub max_versions: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:60020".parse().expect("static addr"),
            handler_count: 10,
            info_port: 60030,
            msg_interval_ms: 3_000,
            master_lease_period_ms: 30_000,
            scanner_lease_period_ms: 180_000,
            compact_check_frequency_ms: 20_000,
            optional_flush_interval_ms: 1_800_000,
            global_memcache_limit: 512 * 1024 * 1024,
            global_memcache_low_mark: 0,
            retries: 2,
            wake_frequency_ms: 10_000,
            root_dir: PathBuf::from("./lattice-data"),
            region_memcache_flush_size: 64 * 1024 * 1024,
            region_split_size: 256 * 1024 * 1024,
            compaction_threshold: 3,
            wal_max_entries: 30_000,
            max_versions: 3,
        }
    }
}

impl ServerConfig {
    pub fn msg_interval(&self) -> Duration {
        Duration::from_millis(self.msg_interval_ms)
    }

    pub fn master_lease_period(&self) -> Duration {
        Duration::from_millis(self.master_lease_period_ms)
    }

    pub fn scanner_lease_period(&self) -> Duration {
        Duration::from_millis(self.scanner_lease_period_ms)
    }

    pub fn compact_check_frequency(&self) -> Duration {
        Duration::from_millis(self.compact_check_frequency_ms)
    }

    pub fn optional_flush_interval(&self) -> Duration {
        Duration::from_millis(self.optional_flush_interval_ms)
    }

    pub fn wake_frequency(&self) -> Duration {
        Duration::from_millis(self.wake_frequency_ms)
    }

    /// Relief target for global memtable admission.
    pub fn memcache_low_mark(&self) -> u64 {
        if self.global_memcache_low_mark > 0 {
            self.global_memcache_low_mark
        } else {
            self.global_memcache_limit / 2
        }
    }

    /// Apply dotted-key overrides from the master's startup config map.
    ///
    /// Unknown keys are logged and ignored; unparseable values keep the
    /// current setting.
    pub fn apply_overrides<'a, I>(&mut self, overrides: I)
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        for (key, value) in overrides {
            tracing::debug!(key, value, "config from master");
            match key {
                "lattice.rootdir" => self.root_dir = PathBuf::from(value),
                "lattice.regionserver.address" => {
                    parse_into(&mut self.bind_address, key, value);
                }
                "lattice.regionserver.handler.count" => {
                    parse_into(&mut self.handler_count, key, value);
                }
                "lattice.regionserver.info.port" => {
                    parse_into(&mut self.info_port, key, value);
                }
                "lattice.regionserver.msginterval" => {
                    parse_into(&mut self.msg_interval_ms, key, value);
                }
                "lattice.master.lease.period" => {
                    parse_into(&mut self.master_lease_period_ms, key, value);
                }
                "lattice.regionserver.lease.period" => {
                    parse_into(&mut self.scanner_lease_period_ms, key, value);
                }
                "lattice.regionserver.compactcheckfrequency" => {
                    parse_into(&mut self.compact_check_frequency_ms, key, value);
                }
                "lattice.regionserver.optionalflushinterval" => {
                    parse_into(&mut self.optional_flush_interval_ms, key, value);
                }
                "lattice.regionserver.global.memcache.limit" => {
                    parse_into(&mut self.global_memcache_limit, key, value);
                }
                "lattice.regionserver.global.memcache.lowmark" => {
                    parse_into(&mut self.global_memcache_low_mark, key, value);
                }
                "lattice.client.retries.number" => {
                    parse_into(&mut self.retries, key, value);
                }
                "lattice.thread.wake.frequency" => {
                    parse_into(&mut self.wake_frequency_ms, key, value);
                }
                "lattice.region.memcache.flush.size" => {
                    parse_into(&mut self.region_memcache_flush_size, key, value);
                }
                "lattice.region.split.size" => {
                    parse_into(&mut self.region_split_size, key, value);
                }
                "lattice.region.compaction.threshold" => {
                    parse_into(&mut self.compaction_threshold, key, value);
                }
                "lattice.wal.max.entries" => {
                    parse_into(&mut self.wal_max_entries, key, value);
                }
                "lattice.region.max.versions" => {
                    parse_into(&mut self.max_versions, key, value);
                }
                other => {
                    tracing::warn!(key = other, "ignoring unknown config key from master");
                }
            }
        }
    }
}

fn parse_into<T: std::str::FromStr>(slot: &mut T, key: &str, value: &str) {
    match value.parse::<T>() {
        Ok(parsed) => *slot = parsed,
        Err(_) => tracing::warn!(key, value, "unparseable config override ignored"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_mark_defaults_to_half_the_cap() {
        let mut cfg = ServerConfig::default();
        assert_eq!(cfg.memcache_low_mark(), cfg.global_memcache_limit / 2);
        cfg.global_memcache_low_mark = 7;
        assert_eq!(cfg.memcache_low_mark(), 7);
    }

    #[test]
    fn master_overrides_apply_and_ignore_garbage() {
        let mut cfg = ServerConfig::default();
        cfg.apply_overrides(vec![
            ("lattice.rootdir", "/srv/lattice"),
            ("lattice.regionserver.msginterval", "250"),
            ("lattice.regionserver.msginterval", "not-a-number"),
            ("lattice.bogus.key", "1"),
        ]);
        assert_eq!(cfg.root_dir, PathBuf::from("/srv/lattice"));
        assert_eq!(cfg.msg_interval_ms, 250);
    }
}
