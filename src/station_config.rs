//! Per-station usage and nucleation distance configuration
//!
//! File format, one entry per line:
//!
//! ```text
//! # NET STA usage maxNucDist
//! *   *    1     180
//! GE  *    1     60
//! *   WLF  0     0
//! ```

use crate::error::{AutolocError, Result};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StationConfigEntry {
    pub usage: i32,
    pub max_nuc_dist: f64,
}

/// Station configuration with wildcard fallback
#[derive(Debug, Clone)]
pub struct StationConfig {
    entries: HashMap<(String, String), StationConfigEntry>,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self::with_default(180.0)
    }
}

impl StationConfig {
    /// Empty configuration with only the `* *` entry
    pub fn with_default(max_nuc_dist: f64) -> Self {
        let mut entries = HashMap::new();
        entries.insert(
            ("*".to_string(), "*".to_string()),
            StationConfigEntry {
                usage: 1,
                max_nuc_dist,
            },
        );
        Self { entries }
    }

    /// Read entries from a file on top of the current ones
    pub fn read<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            AutolocError::StationConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        self.parse(&text)?;
        log::info!("read station config from {} ({} entries)", path.display(), self.entries.len());
        Ok(())
    }

    pub fn parse(&mut self, text: &str) -> Result<()> {
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return Err(AutolocError::StationConfig(format!(
                    "line {}: expected 'NET STA usage maxNucDist', got '{}'",
                    lineno + 1,
                    line
                )));
            }
            let usage = fields[2].parse::<i32>().map_err(|e| {
                AutolocError::StationConfig(format!("line {}: bad usage flag: {}", lineno + 1, e))
            })?;
            let max_nuc_dist = fields[3].parse::<f64>().map_err(|e| {
                AutolocError::StationConfig(format!("line {}: bad distance: {}", lineno + 1, e))
            })?;
            self.set(fields[0], fields[1], StationConfigEntry { usage, max_nuc_dist });
        }
        Ok(())
    }

    pub fn set(&mut self, net: &str, sta: &str, entry: StationConfigEntry) {
        self.entries.insert((net.to_string(), sta.to_string()), entry);
    }

    /// Lookup order: (net, sta), (net, *), (*, sta), (*, *)
    pub fn get(&self, net: &str, sta: &str) -> StationConfigEntry {
        let candidates = [(net, sta), (net, "*"), ("*", sta), ("*", "*")];
        for (n, s) in candidates {
            if let Some(entry) = self.entries.get(&(n.to_string(), s.to_string())) {
                return *entry;
            }
        }
        StationConfigEntry {
            usage: 1,
            max_nuc_dist: 180.0,
        }
    }
}
