//! Stamp extraction: threshold detection on the template, footprint
//! filtering and growing, and rejection of footprints touching masked
//! pixels or the image edge.

use std::collections::HashMap;

use itertools::Itertools;
use log::{debug, info, trace};

use crate::config::{Config, DetThresholdType};
use crate::error::Error;
use crate::image::{BBox, MaskedImage};
use crate::stats::clipped_mean_std;

/// Mask plane marking grown footprints of considered candidates.
pub const STAMP_CANDIDATE_PLANE: &str = "diffimStampCandidate";
/// Mask plane marking footprints used in the final fit.
pub const STAMP_USED_PLANE: &str = "diffimStampUsed";

/// A detection footprint: the grown bounding box a stamp is cut from.
#[derive(Debug, Clone)]
pub struct Footprint {
    /// Grown bounding box, image coordinates.
    pub bbox: BBox,
    /// Pixel count of the raw detection.
    pub npix: usize,
    /// Peak pixel value of the raw detection.
    pub peak: f64,
}

/// Convert the configured threshold into image units.
fn threshold_unit(template: &MaskedImage, kind: DetThresholdType) -> f64 {
    match kind {
        DetThresholdType::Value => 1.0,
        DetThresholdType::Stdev => {
            let values: Vec<f64> = template.image().iter().copied().collect();
            let (_, std) = clipped_mean_std(&values, 3.0, 3);
            std
        }
        DetThresholdType::Variance => {
            let mut values: Vec<f64> = template
                .variance()
                .iter()
                .copied()
                .filter(|v| v.is_finite())
                .collect();
            values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            if values.is_empty() {
                0.0
            } else {
                values[values.len() / 2].max(0.0).sqrt()
            }
        }
    }
}

fn find(parent: &mut [usize], mut x: usize) -> usize {
    while parent[x] != x {
        parent[x] = parent[parent[x]];
        x = parent[x];
    }
    x
}

fn union(parent: &mut [usize], a: usize, b: usize) {
    let ra = find(parent, a);
    let rb = find(parent, b);
    if ra != rb {
        parent[ra.max(rb)] = ra.min(rb);
    }
}

/// Raw detections above `threshold`: connected components with their
/// bounding boxes, pixel counts and peaks.
fn detect_above(template: &MaskedImage, threshold: f64) -> Vec<Footprint> {
    let (height, width) = template.image().dim();
    let mut labels = vec![0usize; width * height];
    let mut parent = vec![0usize];
    let mut next = 1usize;

    for r in 0..height {
        for c in 0..width {
            let value = template.image()[[r, c]];
            if !value.is_finite() || value < threshold {
                continue;
            }
            let idx = r * width + c;
            let left = if c > 0 { labels[idx - 1] } else { 0 };
            let top = if r > 0 { labels[idx - width] } else { 0 };
            match (left, top) {
                (0, 0) => {
                    labels[idx] = next;
                    parent.push(next);
                    next += 1;
                }
                (l, 0) | (0, l) => labels[idx] = find(&mut parent, l),
                (l, t) => {
                    let rl = find(&mut parent, l);
                    let rt = find(&mut parent, t);
                    labels[idx] = rl.min(rt);
                    union(&mut parent, rl, rt);
                }
            }
        }
    }

    #[derive(Clone)]
    struct Component {
        min_c: usize,
        max_c: usize,
        min_r: usize,
        max_r: usize,
        npix: usize,
        peak: f64,
    }
    let mut components: HashMap<usize, Component> = HashMap::new();
    for r in 0..height {
        for c in 0..width {
            let label = labels[r * width + c];
            if label == 0 {
                continue;
            }
            let root = find(&mut parent, label);
            let value = template.image()[[r, c]];
            let entry = components.entry(root).or_insert(Component {
                min_c: c,
                max_c: c,
                min_r: r,
                max_r: r,
                npix: 0,
                peak: value,
            });
            entry.min_c = entry.min_c.min(c);
            entry.max_c = entry.max_c.max(c);
            entry.min_r = entry.min_r.min(r);
            entry.max_r = entry.max_r.max(r);
            entry.npix += 1;
            entry.peak = entry.peak.max(value);
        }
    }

    // Deterministic ordering: brightest first.
    components
        .into_values()
        .map(|comp| Footprint {
            bbox: BBox::new(
                template.x0() + comp.min_c as i32,
                template.y0() + comp.min_r as i32,
                comp.max_c - comp.min_c + 1,
                comp.max_r - comp.min_r + 1,
            ),
            npix: comp.npix,
            peak: comp.peak,
        })
        .sorted_by(|a, b| b.peak.partial_cmp(&a.peak).unwrap_or(std::cmp::Ordering::Equal))
        .collect_vec()
}

/// Detect candidate footprints on the template and return the clean ones,
/// grown for stamp extraction.
///
/// Footprints outside `[fpNpixMin, fpNpixMax]`, leaving the image after
/// growth, or overlapping any set mask bit in either input (including
/// previously accepted candidates) are dropped.  If fewer than
/// `minCleanFp` survive, the threshold is lowered by `detThresholdScaling`
/// and detection retried down to `detThresholdMin`.  The
/// `diffimStampCandidate` plane is used for bookkeeping during the search
/// and cleared before returning.
pub fn footprints_for_psf_matching(
    template: &mut MaskedImage,
    science: &mut MaskedImage,
    config: &Config,
) -> Result<Vec<Footprint>, Error> {
    let candidate_bit_t = template.add_mask_plane(STAMP_CANDIDATE_PLANE)?;
    let candidate_bit_s = science.add_mask_plane(STAMP_CANDIDATE_PLANE)?;
    template.add_mask_plane(STAMP_USED_PLANE)?;
    science.add_mask_plane(STAMP_USED_PLANE)?;

    let grow = (config.fp_grow_ksize * config.kernel_cols.max(config.kernel_rows) as f64) as usize;
    let unit = threshold_unit(template, config.det_threshold_type);
    let image_extent = template.extent();

    let mut accepted: Vec<Footprint> = Vec::new();
    let mut threshold = config.det_threshold;
    let mut last_threshold = threshold;

    loop {
        template.clear_mask_plane(candidate_bit_t);
        science.clear_mask_plane(candidate_bit_s);
        accepted.clear();

        let raw = detect_above(template, threshold * unit);
        debug!(
            "Found {} total footprints above threshold {:.3}",
            raw.len(),
            threshold
        );

        for fp in raw {
            if fp.npix < config.fp_npix_min {
                continue;
            }
            if fp.npix > config.fp_npix_max {
                trace!(
                    "Footprint has too many pixels: {} (max = {})",
                    fp.npix,
                    config.fp_npix_max
                );
                continue;
            }
            let grown = fp.bbox.grown(grow);

            // Too close to the image edge.
            if !image_extent.contains(&grown) {
                continue;
            }

            // Masked pixels anywhere in the grown region of either image.
            if template.or_of_mask_region(&grown)? != 0 {
                trace!("Footprint has masked pixels in the template");
                continue;
            }
            if science.or_of_mask_region(&grown)? != 0 {
                trace!("Footprint has masked pixels in the science image");
                continue;
            }

            template.set_mask_region(&grown, candidate_bit_t)?;
            science.set_mask_region(&grown, candidate_bit_s)?;
            accepted.push(Footprint {
                bbox: grown,
                npix: fp.npix,
                peak: fp.peak,
            });
        }

        last_threshold = threshold;
        if accepted.len() >= config.min_clean_fp {
            break;
        }
        threshold *= config.det_threshold_scaling;
        if threshold <= config.det_threshold_min {
            break;
        }
    }

    template.clear_mask_plane(candidate_bit_t);
    science.clear_mask_plane(candidate_bit_s);

    if accepted.is_empty() {
        return Err(Error::NoCandidates);
    }
    info!(
        "Found {} clean footprints above threshold {:.3}",
        accepted.len(),
        last_threshold
    );
    Ok(accepted)
}
