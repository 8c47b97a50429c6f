use super::{check_widths, EvalMode, Labels, Metric};
use crate::config::{PR_CURVE, PR_THRESHOLDS};
use crate::error::{ReidError, Result};
use image::{Rgb, RgbImage};
use ndarray::ArrayView2;
use std::path::{Path, PathBuf};

const PLOT_SIZE: u32 = 400;
const PLOT_MARGIN: u32 = 30;

/// Precision and recall of the decision "same identity if distance <= t".
#[derive(Debug, Clone)]
pub struct PreRecEvaluator {
    metric: Metric,
    mode: EvalMode,
}

pub struct PreRecCurve {
    pub precisions: Vec<f64>,
    pub recalls: Vec<f64>,
    pub thresholds: Vec<f64>,
}

impl PreRecEvaluator {
    pub fn new(metric: Metric, mode: EvalMode) -> Self {
        PreRecEvaluator { metric, mode }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn evaluate(
        &self,
        query_feats: &ArrayView2<f64>,
        query_camids: &[usize],
        query_pids: &[usize],
        gallery_feats: &ArrayView2<f64>,
        gallery_camids: &[usize],
        gallery_pids: &[usize],
    ) -> Result<PreRecCurve> {
        let query = Labels::new(query_pids, query_camids)?;
        let gallery = Labels::new(gallery_pids, gallery_camids)?;
        check_widths(query_feats, gallery_feats)?;
        let distmat = self.metric.distances(query_feats, gallery_feats)?;

        let mut pairs = vec![];
        for (q, row) in distmat.outer_iter().enumerate() {
            for (g, distance) in row.iter().enumerate() {
                let (qpid, qcam) = (query.pids[q], query.camids[q]);
                if self.mode.keeps(qpid, qcam, gallery.pids[g], gallery.camids[g]) {
                    pairs.push((*distance, gallery.pids[g] == qpid));
                }
            }
        }
        let positives = pairs.iter().filter(|(_, is_match)| *is_match).count();
        if positives == 0 {
            return Err(ReidError::Evaluation(
                "no positive pair for precision-recall".into(),
            ));
        }

        let lowest = pairs.iter().map(|p| p.0).fold(f64::INFINITY, f64::min);
        let highest = pairs.iter().map(|p| p.0).fold(f64::NEG_INFINITY, f64::max);
        let step = (highest - lowest) / (PR_THRESHOLDS - 1) as f64;
        let thresholds: Vec<f64> = (0..PR_THRESHOLDS)
            .map(|i| lowest + step * i as f64)
            .collect();

        let mut precisions = Vec::with_capacity(PR_THRESHOLDS);
        let mut recalls = Vec::with_capacity(PR_THRESHOLDS);
        for threshold in &thresholds {
            let (mut tp, mut fp) = (0usize, 0usize);
            for (distance, is_match) in &pairs {
                if distance <= threshold {
                    if *is_match {
                        tp += 1;
                    } else {
                        fp += 1;
                    }
                }
            }
            precisions.push(if tp + fp == 0 {
                1.
            } else {
                tp as f64 / (tp + fp) as f64
            });
            recalls.push(tp as f64 / positives as f64);
        }
        Ok(PreRecCurve {
            precisions,
            recalls,
            thresholds,
        })
    }

    /// Draws recall (x) against precision (y) and saves it as a PNG in `dir`.
    pub fn plot_prerecall_curve(&self, dir: &Path, curve: &PreRecCurve) -> Result<PathBuf> {
        let mut canvas = RgbImage::from_pixel(PLOT_SIZE, PLOT_SIZE, Rgb([255, 255, 255]));
        let span = (PLOT_SIZE - 2 * PLOT_MARGIN) as f64;
        let to_pixel = |recall: f64, precision: f64| {
            (
                PLOT_MARGIN as f64 + recall.clamp(0., 1.) * span,
                (PLOT_SIZE - PLOT_MARGIN) as f64 - precision.clamp(0., 1.) * span,
            )
        };

        let axis = Rgb([0, 0, 0]);
        let origin = to_pixel(0., 0.);
        draw_segment(&mut canvas, origin, to_pixel(1., 0.), axis);
        draw_segment(&mut canvas, origin, to_pixel(0., 1.), axis);

        let points: Vec<_> = curve
            .recalls
            .iter()
            .zip(&curve.precisions)
            .map(|(r, p)| to_pixel(*r, *p))
            .collect();
        for pair in points.windows(2) {
            draw_segment(&mut canvas, pair[0], pair[1], Rgb([200, 30, 30]));
        }

        let path = dir.join(PR_CURVE);
        canvas.save(&path)?;
        Ok(path)
    }
}

fn draw_segment(canvas: &mut RgbImage, from: (f64, f64), to: (f64, f64), colour: Rgb<u8>) {
    let steps = (to.0 - from.0).abs().max((to.1 - from.1).abs()).ceil().max(1.) as usize;
    for i in 0..=steps {
        let t = i as f64 / steps as f64;
        let x = (from.0 + (to.0 - from.0) * t).round();
        let y = (from.1 + (to.1 - from.1) * t).round();
        if x >= 0. && y >= 0. && (x as u32) < canvas.width() && (y as u32) < canvas.height() {
            canvas.put_pixel(x as u32, y as u32, colour);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn curve() -> PreRecCurve {
        let query = array![[1., 0.], [0., 1.]];
        let gallery = array![[1., 0.1], [0.1, 1.], [1., 1.]];
        PreRecEvaluator::new(Metric::Euclidean, EvalMode::All)
            .evaluate(&query.view(), &[0, 0], &[0, 1], &gallery.view(), &[1, 1, 1], &[0, 1, 2])
            .unwrap()
    }

    #[test]
    fn recall_grows_with_threshold() {
        let curve = curve();
        assert_eq!(curve.thresholds.len(), PR_THRESHOLDS);
        assert!(curve.recalls.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(curve.recalls.last().copied(), Some(1.));
        // Both true matches are the closest pairs.
        assert_eq!(curve.precisions[0], 1.);
    }

    #[test]
    fn plot_is_written_to_results_dir() {
        let dir = tempfile::tempdir().unwrap();
        let evaluator = PreRecEvaluator::new(Metric::Euclidean, EvalMode::All);
        let path = evaluator.plot_prerecall_curve(dir.path(), &curve()).unwrap();
        assert_eq!(path, dir.path().join(PR_CURVE));
        let image = image::open(&path).unwrap();
        assert_eq!(image.width(), PLOT_SIZE);
    }
}
