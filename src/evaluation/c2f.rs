use super::{aggregate, query_ap_cmc, rank, EvalMode, Labels, Metric};
use crate::config::C2F_SHORTLIST;
use crate::error::{ReidError, Result};
use ndarray::{Array2, ArrayView1};

/// Coarse-to-fine retrieval over a cascade of codes ordered from widest to
/// narrowest. The narrowest code ranks the whole gallery; each wider code
/// re-ranks the head of the previous ranking.
#[derive(Debug, Clone)]
pub struct CmcMapEvaluatorC2F {
    metric: Metric,
    mode: EvalMode,
    shortlist: Vec<usize>,
}

impl CmcMapEvaluatorC2F {
    pub fn new(metric: Metric, mode: EvalMode) -> Self {
        CmcMapEvaluatorC2F {
            metric,
            mode,
            shortlist: C2F_SHORTLIST.to_vec(),
        }
    }

    /// Candidates kept at each refinement, coarsest first. The last value
    /// repeats for deeper cascades.
    pub fn with_shortlist(mut self, shortlist: Vec<usize>) -> Self {
        self.shortlist = shortlist;
        self
    }

    fn shortlist_at(&self, step: usize) -> usize {
        self.shortlist
            .get(step)
            .or(self.shortlist.last())
            .copied()
            .unwrap_or(usize::MAX)
    }

    /// Ranking of one query: coarse order first, refined in place.
    fn cascade_ranking(&self, rows: &[ArrayView1<f64>]) -> Vec<usize> {
        let Some((coarsest, finer)) = rows.split_last() else {
            return vec![];
        };
        let mut ranking = rank(coarsest);
        for (step, row) in finer.iter().rev().enumerate() {
            let keep = self.shortlist_at(step).min(ranking.len());
            ranking[..keep].sort_by(|a, b| row[*a].total_cmp(&row[*b]));
        }
        ranking
    }

    #[allow(clippy::too_many_arguments)]
    pub fn compute(
        &self,
        query_feats: &[Array2<f64>],
        query_camids: &[usize],
        query_pids: &[usize],
        gallery_feats: &[Array2<f64>],
        gallery_camids: &[usize],
        gallery_pids: &[usize],
    ) -> Result<(f64, Vec<f64>)> {
        if query_feats.is_empty() || query_feats.len() != gallery_feats.len() {
            return Err(ReidError::Evaluation(format!(
                "{} query codes against {} gallery codes",
                query_feats.len(),
                gallery_feats.len()
            )));
        }
        let query = Labels::new(query_pids, query_camids)?;
        let gallery = Labels::new(gallery_pids, gallery_camids)?;
        let distmats = query_feats
            .iter()
            .zip(gallery_feats)
            .map(|(qf, gf)| self.metric.distances(&qf.view(), &gf.view()))
            .collect::<Result<Vec<_>>>()?;

        let results = (0..query.len())
            .map(|q| {
                let rows: Vec<_> = distmats.iter().map(|d| d.row(q)).collect();
                let ranking = self.cascade_ranking(&rows);
                query_ap_cmc(&ranking, query.pids[q], query.camids[q], &gallery, self.mode)
            })
            .collect();
        aggregate(results, gallery.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn finer_code_reranks_the_shortlist() {
        let evaluator =
            CmcMapEvaluatorC2F::new(Metric::Euclidean, EvalMode::All).with_shortlist(vec![2]);
        let fine = array![3., 1., 0., 2.];
        let coarse = array![0., 1., 2., 3.];
        let ranking = evaluator.cascade_ranking(&[fine.view(), coarse.view()]);
        // 0 and 1 survive and swap; 2 and 3 stay in coarse order.
        assert_eq!(ranking, [1, 0, 2, 3]);
    }

    #[test]
    fn coarse_mistake_is_fixed_by_fine_code() {
        let query_fine = array![[1., 0., 0., 0.]];
        let query_coarse = array![[1., 0.]];
        let gallery_fine = array![[0., 1., 0., 0.], [1., 0., 0., 0.]];
        // The coarse code puts the wrong identity first.
        let gallery_coarse = array![[1., 0.], [0.9, 0.1]];
        let (mean_ap, cmc) = CmcMapEvaluatorC2F::new(Metric::Cosine, EvalMode::InterCamera)
            .compute(
                &[query_fine, query_coarse],
                &[0],
                &[7],
                &[gallery_fine, gallery_coarse],
                &[1, 1],
                &[3, 7],
            )
            .unwrap();
        assert_abs_diff_eq!(mean_ap, 1.);
        assert_eq!(cmc, [1., 1.]);
    }

    #[test]
    fn mismatched_cascades_are_rejected() {
        let feats = vec![array![[1., 0.]]];
        let evaluator = CmcMapEvaluatorC2F::new(Metric::Hamming, EvalMode::All);
        assert!(evaluator
            .compute(&feats, &[0], &[0], &[], &[], &[])
            .is_err());
    }
}
