//! Grid definition files
//!
//! One grid point per line: `lat lon depth radius maxStationDistance minPickCount`.

use super::GridPoint;
use crate::error::{AutolocError, Result};
use std::path::Path;

/// Parse grid points, skipping blank and `#` lines.
///
/// Parsing stops at the first malformed line; points read so far are kept.
pub fn parse_grid(text: &str) -> Vec<GridPoint> {
    let mut grid = Vec::new();

    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let fields: Vec<f64> = line
            .split_whitespace()
            .take(6)
            .map_while(|f| f.parse::<f64>().ok())
            .collect();
        if fields.len() < 6 || fields[5] < 0.0 {
            log::warn!("grid line {} malformed, ignoring rest of file: '{}'", lineno + 1, line);
            break;
        }

        grid.push(
            GridPoint::new(fields[0], fields[1], fields[2]).with_limits(
                fields[3],
                fields[4],
                fields[5] as usize,
            ),
        );
    }

    grid
}

pub fn read_grid_file<P: AsRef<Path>>(path: P) -> Result<Vec<GridPoint>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .map_err(|e| AutolocError::GridFile(format!("cannot read {}: {}", path.display(), e)))?;

    let grid = parse_grid(&text);
    if grid.is_empty() {
        return Err(AutolocError::GridFile(format!(
            "no grid points in {}",
            path.display()
        )));
    }
    log::info!("read {} grid points from {}", grid.len(), path.display());
    Ok(grid)
}
