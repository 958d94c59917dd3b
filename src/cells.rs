//! The spatial cell grid: candidates partitioned across the image, visited
//! best-first under a visitor.
//!
//! Candidates live in an arena owned by the set; cells hold rating-sorted
//! index lists.  A visitor sees, per cell, at most `max_per_cell`
//! candidates that are not bad; when a visit marks one bad, the next pass
//! steps to the next-best survivor in that cell.

use log::trace;

use crate::candidate::{CandidateStatus, KernelCandidate};
use crate::error::Error;
use crate::image::BBox;

/// Per-candidate operation applied by [`SpatialCellSet::visit_candidates`].
pub trait CandidateVisitor {
    /// Process one candidate; called once per considered candidate per
    /// pass.
    fn process_candidate(&mut self, candidate: &mut KernelCandidate) -> Result<(), Error>;

    /// Clear per-pass aggregation state.
    fn reset(&mut self) {}
}

/// A grid of spatial cells over an image region.
#[derive(Debug, Clone)]
pub struct SpatialCellSet {
    region: BBox,
    cell_width: usize,
    cell_height: usize,
    nx: usize,
    ny: usize,
    candidates: Vec<KernelCandidate>,
    cells: Vec<Vec<usize>>,
}

impl SpatialCellSet {
    /// Lay out cells of roughly `cell_width x cell_height` pixels over
    /// `region`.
    pub fn new(region: BBox, cell_width: usize, cell_height: usize) -> Result<Self, Error> {
        if cell_width < 1 || cell_height < 1 {
            return Err(Error::Domain(format!(
                "cell dimensions must be positive, got {cell_width}x{cell_height}"
            )));
        }
        if region.width < 1 || region.height < 1 {
            return Err(Error::Domain("empty cell-grid region".into()));
        }
        let nx = region.width.div_ceil(cell_width);
        let ny = region.height.div_ceil(cell_height);
        Ok(Self {
            region,
            cell_width,
            cell_height,
            nx,
            ny,
            candidates: Vec::new(),
            cells: vec![Vec::new(); nx * ny],
        })
    }

    /// The region the grid covers.
    pub fn region(&self) -> BBox {
        self.region
    }

    /// Number of cells along x and y.
    pub fn grid_shape(&self) -> (usize, usize) {
        (self.nx, self.ny)
    }

    fn cell_index(&self, x: f64, y: f64) -> Option<usize> {
        if !self.region.contains_point(x, y) {
            return None;
        }
        let cx = ((x - self.region.x0 as f64) / self.cell_width as f64) as usize;
        let cy = ((y - self.region.y0 as f64) / self.cell_height as f64) as usize;
        Some(cy.min(self.ny - 1) * self.nx + cx.min(self.nx - 1))
    }

    /// Insert a candidate, placed by its center.  Within its cell the
    /// candidate list stays sorted by descending rating.
    pub fn insert_candidate(&mut self, candidate: KernelCandidate) -> Result<(), Error> {
        let cell = self
            .cell_index(candidate.x_center(), candidate.y_center())
            .ok_or_else(|| {
                Error::Domain(format!(
                    "candidate at ({}, {}) falls outside the cell grid",
                    candidate.x_center(),
                    candidate.y_center()
                ))
            })?;
        let idx = self.candidates.len();
        self.candidates.push(candidate);
        self.cells[cell].push(idx);

        let arena = &self.candidates;
        self.cells[cell].sort_by(|&a, &b| {
            arena[b]
                .rating()
                .partial_cmp(&arena[a].rating())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(())
    }

    /// Visit up to `max_per_cell` non-bad candidates per cell in rating
    /// order; `max_per_cell <= 0` visits all.  Errors from the visitor
    /// propagate immediately.
    pub fn visit_candidates(
        &mut self,
        visitor: &mut dyn CandidateVisitor,
        max_per_cell: i32,
    ) -> Result<(), Error> {
        for cell in &self.cells {
            let mut visited = 0;
            for &idx in cell {
                if max_per_cell > 0 && visited >= max_per_cell {
                    break;
                }
                let candidate = &mut self.candidates[idx];
                if candidate.status() == CandidateStatus::Bad {
                    trace!("Skipping bad candidate {}", candidate.id());
                    continue;
                }
                visitor.process_candidate(candidate)?;
                visited += 1;
            }
        }
        Ok(())
    }

    /// All candidates, in insertion order.
    pub fn candidates(&self) -> &[KernelCandidate] {
        &self.candidates
    }

    /// All candidates, mutable.
    pub fn candidates_mut(&mut self) -> &mut [KernelCandidate] {
        &mut self.candidates
    }

    /// Count of candidates with the given status.
    pub fn count_status(&self, status: CandidateStatus) -> usize {
        self.candidates
            .iter()
            .filter(|c| c.status() == status)
            .count()
    }
}
