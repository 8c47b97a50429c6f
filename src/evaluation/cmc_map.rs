use super::{aggregate, check_widths, query_ap_cmc, rank, EvalMode, Labels, Metric};
use crate::device::Device;
use crate::error::Result;
use ndarray::{ArrayView2, Axis};
use rayon::prelude::*;

/// mAP and CMC from the full query x gallery distance matrix.
#[derive(Debug, Clone)]
pub struct CmcMapEvaluator {
    metric: Metric,
    mode: EvalMode,
    device: Device,
}

impl CmcMapEvaluator {
    pub fn new(metric: Metric, mode: EvalMode) -> Self {
        CmcMapEvaluator {
            metric,
            mode,
            device: Device::cpu(),
        }
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
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
    ) -> Result<(f64, Vec<f64>)> {
        let query = Labels::new(query_pids, query_camids)?;
        let gallery = Labels::new(gallery_pids, gallery_camids)?;
        let distmat = self.metric.distances(query_feats, gallery_feats)?;
        let results = self.device.run(|| {
            distmat
                .axis_iter(Axis(0))
                .into_par_iter()
                .enumerate()
                .map(|(q, row)| {
                    let ranking = rank(&row);
                    query_ap_cmc(&ranking, query.pids[q], query.camids[q], &gallery, self.mode)
                })
                .collect()
        });
        aggregate(results, gallery.len())
    }
}

/// Same result as [`CmcMapEvaluator`], computing one distance row at a time.
#[derive(Debug, Clone)]
pub struct CmcMapEvaluator1b1 {
    metric: Metric,
    mode: EvalMode,
}

impl CmcMapEvaluator1b1 {
    pub fn new(metric: Metric, mode: EvalMode) -> Self {
        CmcMapEvaluator1b1 { metric, mode }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn compute(
        &self,
        query_feats: &ArrayView2<f64>,
        query_camids: &[usize],
        query_pids: &[usize],
        gallery_feats: &ArrayView2<f64>,
        gallery_camids: &[usize],
        gallery_pids: &[usize],
    ) -> Result<(f64, Vec<f64>)> {
        let query = Labels::new(query_pids, query_camids)?;
        let gallery = Labels::new(gallery_pids, gallery_camids)?;
        check_widths(query_feats, gallery_feats)?;
        let mut results = Vec::with_capacity(query.len());
        for (q, feats) in query_feats.outer_iter().enumerate() {
            let distances = self.metric.distance_row(&feats, gallery_feats)?;
            let ranking = rank(&distances.view());
            results.push(query_ap_cmc(
                &ranking,
                query.pids[q],
                query.camids[q],
                &gallery,
                self.mode,
            ));
        }
        aggregate(results, gallery.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn batched_and_one_by_one_agree() {
        let query = array![[1., 0.], [0., 1.], [1., 1.]];
        let gallery = array![[0.9, 0.1], [0.1, 0.9], [1., 0.8], [-1., 0.2]];
        let (qp, qc) = ([0, 1, 2], [0, 0, 0]);
        let (gp, gc) = ([0, 1, 2, 1], [1, 1, 1, 1]);
        let batched = CmcMapEvaluator::new(Metric::Cosine, EvalMode::InterCamera)
            .evaluate(&query.view(), &qc, &qp, &gallery.view(), &gc, &gp)
            .unwrap();
        let single = CmcMapEvaluator1b1::new(Metric::Cosine, EvalMode::InterCamera)
            .compute(&query.view(), &qc, &qp, &gallery.view(), &gc, &gp)
            .unwrap();
        assert_abs_diff_eq!(batched.0, single.0, epsilon = 1e-12);
        assert_eq!(batched.1, single.1);
        assert_eq!(batched.1.len(), 4);
        assert!(batched.1.windows(2).all(|w| w[0] <= w[1]));
        assert!((0. ..=1.).contains(&batched.0));
    }

    #[test]
    fn perfect_retrieval_scores_one() {
        let feats = array![[1., 0.], [0., 1.]];
        let (mean_ap, cmc) = CmcMapEvaluator::new(Metric::Euclidean, EvalMode::InterCamera)
            .evaluate(&feats.view(), &[0, 0], &[0, 1], &feats.view(), &[1, 1], &[0, 1])
            .unwrap();
        assert_abs_diff_eq!(mean_ap, 1.);
        assert_eq!(cmc, [1., 1.]);
    }
}
