//! Budgeted terrain scan around the vessel.
//!
//! Each long-period tick samples at most `batch` cells of a square grid and
//! remembers where it stopped; a pass never crosses the wrap point, so a full
//! grid takes exactly `ceil(cells / batch)` ticks.

use crate::error::Result;
use crate::ScanConfig;

const MAX_LATITUDE: f64 = 89.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanProgress {
    InProgress { cursor: usize },
    Completed,
}

#[derive(Debug, Clone)]
pub struct SurfaceScan {
    resolution: usize,
    batch: usize,
    spacing: f64,
    cursor: usize,
    heights: Vec<Vec<f64>>,
}

impl SurfaceScan {
    pub fn new(cfg: &ScanConfig) -> Self {
        let resolution = cfg.resolution.max(1);
        Self {
            resolution,
            batch: cfg.batch.max(1),
            spacing: cfg.spacing_m,
            cursor: 0,
            heights: vec![vec![0.0; resolution]; resolution],
        }
    }

    pub fn cells(&self) -> usize {
        self.resolution * self.resolution
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Row-major by latitude offset.
    pub fn heights(&self) -> &[Vec<f64>] {
        &self.heights
    }

    pub fn reset(&mut self) {
        self.cursor = 0;
        for row in &mut self.heights {
            row.fill(0.0);
        }
    }

    /// Degrees of arc between neighbouring cells at `body_distance` metres
    /// from the body centre.
    pub fn cell_angle(&self, body_distance: f64) -> f64 {
        if body_distance <= 0.0 {
            return 0.0;
        }
        (self.spacing / body_distance).to_degrees()
    }

    /// Latitude/longitude sampled by grid cell (x, y).
    pub fn cell_coordinates(&self, x: usize, y: usize, lat: f64, lon: f64, delta: f64) -> (f64, f64) {
        let half = self.resolution as f64 / 2.0;
        let cell_lat = (lat + (y as f64 - half) * delta).clamp(-MAX_LATITUDE, MAX_LATITUDE);
        let cell_lon = lon + (x as f64 - half) * delta;
        (cell_lat, cell_lon)
    }

    /// Samples the next batch. `height_at` returns terrain height above sea
    /// level; stored heights are `reference_height` minus that.
    pub fn step<F>(
        &mut self,
        lat: f64,
        lon: f64,
        body_distance: f64,
        reference_height: f64,
        mut height_at: F,
    ) -> Result<ScanProgress>
    where
        F: FnMut(f64, f64) -> Result<f64>,
    {
        let delta = self.cell_angle(body_distance);
        let end = (self.cursor + self.batch).min(self.cells());
        while self.cursor < end {
            let x = self.cursor % self.resolution;
            let y = self.cursor / self.resolution;
            let (cell_lat, cell_lon) = self.cell_coordinates(x, y, lat, lon, delta);
            self.heights[y][x] = reference_height - height_at(cell_lat, cell_lon)?;
            self.cursor += 1;
        }
        if self.cursor >= self.cells() {
            self.cursor = 0;
            return Ok(ScanProgress::Completed);
        }
        Ok(ScanProgress::InProgress { cursor: self.cursor })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const EPSILON: f64 = 1e-9;

    fn scan(resolution: usize, batch: usize) -> SurfaceScan {
        SurfaceScan::new(&ScanConfig { resolution, batch, spacing_m: 0.5 })
    }

    fn visits_each_cell_once(resolution: usize, batch: usize) {
        let mut s = scan(resolution, batch);
        let cells = s.cells();
        let ticks = cells.div_ceil(batch);
        let mut seen: HashMap<(u64, u64), usize> = HashMap::new();
        for tick in 0..ticks {
            let progress = s
                .step(0.0, 0.0, 600_000.0, 0.0, |la, lo| {
                    *seen.entry((la.to_bits(), lo.to_bits())).or_default() += 1;
                    Ok(0.0)
                })
                .unwrap();
            if tick + 1 < ticks {
                assert!(matches!(progress, ScanProgress::InProgress { .. }));
            } else {
                assert_eq!(progress, ScanProgress::Completed);
            }
        }
        assert_eq!(seen.len(), cells);
        assert!(seen.values().all(|n| *n == 1));
        assert_eq!(s.cursor(), 0);
    }

    #[test]
    fn full_grid_in_ceil_ticks() {
        visits_each_cell_once(30, 60);
        visits_each_cell_once(10, 30);
        visits_each_cell_once(7, 5);
    }

    #[test]
    fn heights_are_relative_to_vessel() {
        let mut s = scan(2, 4);
        let progress = s.step(10.0, 20.0, 1000.0, 50.0, |la, _| Ok(la)).unwrap();
        assert_eq!(progress, ScanProgress::Completed);
        let delta = (0.5f64 / 1000.0).to_degrees();
        // row 0 samples lat - delta, row 1 samples lat
        assert!((s.heights()[0][0] - (50.0 - (10.0 - delta))).abs() < EPSILON);
        assert!((s.heights()[1][1] - 40.0).abs() < EPSILON);
    }

    #[test]
    fn latitude_is_clamped_near_poles() {
        let s = scan(30, 60);
        let (lat, _) = s.cell_coordinates(0, 29, 89.95, 0.0, 0.1);
        assert_eq!(lat, MAX_LATITUDE);
        let (lat, _) = s.cell_coordinates(0, 0, -89.95, 0.0, 0.1);
        assert_eq!(lat, -MAX_LATITUDE);
    }

    #[test]
    fn failed_sample_keeps_cursor() {
        let mut s = scan(4, 8);
        let mut calls = 0;
        let res = s.step(0.0, 0.0, 1000.0, 0.0, |_, _| {
            calls += 1;
            if calls == 3 {
                Err(crate::FcError::Source("terrain".into()))
            } else {
                Ok(0.0)
            }
        });
        assert!(res.is_err());
        assert_eq!(s.cursor(), 2);
    }
}
