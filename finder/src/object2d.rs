//! A connected set of scans within one spectral channel.

use crate::scan::Scan;

/// 2D object: a set of horizontal runs, kept sorted by row then column.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Object2D {
    scans: Vec<Scan>,
}

impl Object2D {
    pub fn new() -> Object2D {
        Object2D::default()
    }

    pub fn from_scan(scan: Scan) -> Object2D {
        Object2D { scans: vec![scan] }
    }

    /// Add a scan, coalescing it with any touching runs in the same row.
    pub fn add_scan(&mut self, scan: Scan) {
        let mut merged = scan;
        let mut kept = Vec::with_capacity(self.scans.len() + 1);
        for s in self.scans.drain(..) {
            if s.joinable(&merged) {
                merged = Scan::new(merged.y, merged.x0.min(s.x0), merged.x1.max(s.x1));
            } else {
                kept.push(s);
            }
        }
        kept.push(merged);
        kept.sort_by_key(|s| (s.y, s.x0));
        self.scans = kept;
    }

    pub fn add_pixel(&mut self, x: usize, y: usize) {
        self.add_scan(Scan::new(y, x, x));
    }

    pub fn merge(&mut self, other: &Object2D) {
        for s in &other.scans {
            self.add_scan(*s);
        }
    }

    pub fn scans(&self) -> &[Scan] {
        &self.scans
    }

    pub fn num_pix(&self) -> usize {
        self.scans.iter().map(Scan::len).sum()
    }

    pub fn contains(&self, x: usize, y: usize) -> bool {
        self.scans.iter().any(|s| s.contains(x, y))
    }

    /// Any scan of `self` within `gap` of any scan of `other`.
    pub fn is_close(&self, other: &Object2D, gap: usize) -> bool {
        self.scans
            .iter()
            .any(|a| other.scans.iter().any(|b| a.is_close(b, gap)))
    }

    pub fn bbox(&self) -> Option<(usize, usize, usize, usize)> {
        if self.scans.is_empty() {
            return None;
        }
        let xmin = self.scans.iter().map(|s| s.x0).min().unwrap_or(0);
        let xmax = self.scans.iter().map(|s| s.x1).max().unwrap_or(0);
        let ymin = self.scans.iter().map(|s| s.y).min().unwrap_or(0);
        let ymax = self.scans.iter().map(|s| s.y).max().unwrap_or(0);
        Some((xmin, xmax, ymin, ymax))
    }

    pub fn pixels(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.scans.iter().flat_map(|s| (s.x0..=s.x1).map(move |x| (x, s.y)))
    }
}
