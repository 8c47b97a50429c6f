use crate::error::{ReidError, Result};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

pub use c2f::CmcMapEvaluatorC2F;
pub use cmc_map::{CmcMapEvaluator, CmcMapEvaluator1b1};
pub use pre_rec::{PreRecCurve, PreRecEvaluator};

mod c2f;
mod cmc_map;
mod pre_rec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Metric {
    /// `1 - cos(q, g)`.
    Cosine,
    Euclidean,
    /// Bit mismatches between sign codes.
    Hamming,
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Metric::Cosine => "cosine",
            Metric::Euclidean => "euclidean",
            Metric::Hamming => "hamming",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for Metric {
    type Err = ReidError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cosine" => Ok(Metric::Cosine),
            "euclidean" => Ok(Metric::Euclidean),
            "hamming" => Ok(Metric::Hamming),
            other => Err(ReidError::Config(format!("unknown metric {}", other))),
        }
    }
}

/// Which gallery entries take part in ranking a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvalMode {
    /// Drops gallery entries sharing both identity and camera with the query.
    InterCamera,
    /// Keeps only gallery entries from the query's camera.
    IntraCamera,
    All,
}

impl EvalMode {
    pub fn keeps(&self, query_pid: usize, query_cam: usize, pid: usize, cam: usize) -> bool {
        match self {
            EvalMode::InterCamera => !(pid == query_pid && cam == query_cam),
            EvalMode::IntraCamera => cam == query_cam,
            EvalMode::All => true,
        }
    }
}

impl Metric {
    /// Sign codes in `{-1, 1}`; zero maps to 1.
    fn binarize(feats: &ArrayView2<f64>) -> Array2<f64> {
        feats.mapv(|x| if x >= 0. { 1. } else { -1. })
    }

    /// Rows prepared so that [`Metric::distances_prepared`] only needs dot
    /// products.
    fn prepare(&self, feats: &ArrayView2<f64>) -> Array2<f64> {
        match self {
            Metric::Cosine => crate::utils::l2_normalize_rows(feats).0,
            Metric::Euclidean => feats.to_owned(),
            Metric::Hamming => Self::binarize(feats),
        }
    }

    fn distances_prepared(
        &self,
        query: &ArrayView2<f64>,
        gallery: &ArrayView2<f64>,
    ) -> Array2<f64> {
        let dots = query.dot(&gallery.t());
        match self {
            Metric::Cosine => dots.mapv(|d| 1. - d),
            Metric::Euclidean => {
                let q_sq = query.map_axis(Axis(1), |row| row.dot(&row));
                let g_sq = gallery.map_axis(Axis(1), |row| row.dot(&row));
                Array2::from_shape_fn(dots.raw_dim(), |(i, j)| {
                    (q_sq[i] + g_sq[j] - 2. * dots[[i, j]]).max(0.).sqrt()
                })
            }
            Metric::Hamming => {
                let bits = query.ncols() as f64;
                dots.mapv(|d| (bits - d) / 2.)
            }
        }
    }

    /// `(num_query, num_gallery)` distance matrix.
    pub fn distances(
        &self,
        query: &ArrayView2<f64>,
        gallery: &ArrayView2<f64>,
    ) -> Result<Array2<f64>> {
        check_widths(query, gallery)?;
        let query = self.prepare(query);
        let gallery = self.prepare(gallery);
        Ok(self.distances_prepared(&query.view(), &gallery.view()))
    }

    /// Distances from one query row to every gallery row.
    pub fn distance_row(
        &self,
        query: &ArrayView1<f64>,
        gallery: &ArrayView2<f64>,
    ) -> Result<Array1<f64>> {
        let query = query.view().insert_axis(Axis(0));
        Ok(self.distances(&query, gallery)?.row(0).to_owned())
    }
}

fn check_widths(query: &ArrayView2<f64>, gallery: &ArrayView2<f64>) -> Result<()> {
    if query.ncols() != gallery.ncols() {
        return Err(ReidError::Evaluation(format!(
            "query features have width {} but gallery features {}",
            query.ncols(),
            gallery.ncols()
        )));
    }
    Ok(())
}

/// Identity and camera labels of one side of an evaluation.
#[derive(Debug, Clone, Copy)]
pub struct Labels<'a> {
    pub pids: &'a [usize],
    pub camids: &'a [usize],
}

impl<'a> Labels<'a> {
    pub fn new(pids: &'a [usize], camids: &'a [usize]) -> Result<Self> {
        if pids.len() != camids.len() {
            return Err(ReidError::Evaluation(format!(
                "{} identities but {} camera ids",
                pids.len(),
                camids.len()
            )));
        }
        Ok(Labels { pids, camids })
    }

    pub fn len(&self) -> usize {
        self.pids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pids.is_empty()
    }
}

/// Gallery indices sorted by ascending distance. Ties keep gallery order.
pub fn rank(distances: &ArrayView1<f64>) -> Vec<usize> {
    let mut order: Vec<usize> = (0..distances.len()).collect();
    order.sort_by(|a, b| distances[*a].total_cmp(&distances[*b]));
    order
}

/// Average precision and CMC row of one query, given the full gallery
/// ranking. `None` if the query has no valid match in the gallery.
pub fn query_ap_cmc(
    ranking: &[usize],
    query_pid: usize,
    query_cam: usize,
    gallery: &Labels,
    mode: EvalMode,
) -> Option<(f64, Vec<f64>)> {
    let matches: Vec<bool> = ranking
        .iter()
        .filter(|g| mode.keeps(query_pid, query_cam, gallery.pids[**g], gallery.camids[**g]))
        .map(|g| gallery.pids[*g] == query_pid)
        .collect();
    let num_matches = matches.iter().filter(|m| **m).count();
    let first_hit = matches.iter().position(|m| *m)?;

    let mut hits = 0;
    let mut precision_sum = 0.;
    for (position, is_match) in matches.iter().enumerate() {
        if *is_match {
            hits += 1;
            precision_sum += hits as f64 / (position + 1) as f64;
        }
    }
    let cmc = (0..gallery.len())
        .map(|k| if k >= first_hit { 1. } else { 0. })
        .collect();
    Some((precision_sum / num_matches as f64, cmc))
}

/// Averages per-query results. Queries without a valid match are skipped; if
/// none remains the evaluation fails.
pub fn aggregate(
    results: Vec<Option<(f64, Vec<f64>)>>,
    gallery_len: usize,
) -> Result<(f64, Vec<f64>)> {
    let valid: Vec<_> = results.into_iter().flatten().collect();
    if valid.is_empty() {
        return Err(ReidError::Evaluation("no query has a valid match in the gallery".into()));
    }
    let count = valid.len() as f64;
    let mut cmc = vec![0.; gallery_len];
    let mut map = 0.;
    for (ap, row) in &valid {
        map += ap;
        cmc.iter_mut().zip(row).for_each(|(acc, hit)| *acc += hit);
    }
    cmc.iter_mut().for_each(|value| *value /= count);
    Ok((map / count, cmc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn hamming_counts_sign_mismatches() {
        let query = array![[0.3, -0.2, 0.9, -0.1]];
        let gallery = array![[0.1, -0.5, 0.2, -0.8], [-0.1, 0.5, 0.2, 0.8]];
        let dist = Metric::Hamming.distances(&query.view(), &gallery.view()).unwrap();
        assert_eq!(dist, array![[0., 3.]]);
    }

    #[test]
    fn cosine_and_euclidean_distances() {
        let query = array![[1., 0.]];
        let gallery = array![[2., 0.], [0., 3.]];
        let cos = Metric::Cosine.distances(&query.view(), &gallery.view()).unwrap();
        assert_abs_diff_eq!(cos, array![[0., 1.]], epsilon = 1e-12);
        let euc = Metric::Euclidean.distance_row(&query.row(0), &gallery.view()).unwrap();
        assert_abs_diff_eq!(euc, array![1., 10f64.sqrt()], epsilon = 1e-12);
    }

    #[test]
    fn ap_counts_every_hit() {
        let gallery_pids = [1, 2, 1, 3];
        let gallery_cams = [1, 1, 1, 1];
        let gallery = Labels::new(&gallery_pids, &gallery_cams).unwrap();
        let (ap, cmc) =
            query_ap_cmc(&[1, 0, 3, 2], 1, 0, &gallery, EvalMode::InterCamera).unwrap();
        assert_abs_diff_eq!(ap, (0.5 + 0.5) / 2., epsilon = 1e-12);
        assert_eq!(cmc, [0., 1., 1., 1.]);
    }

    #[test]
    fn inter_camera_drops_same_camera_matches() {
        let gallery_pids = [1, 1];
        let gallery_cams = [0, 0];
        let gallery = Labels::new(&gallery_pids, &gallery_cams).unwrap();
        assert!(query_ap_cmc(&[0, 1], 1, 0, &gallery, EvalMode::InterCamera).is_none());
        assert!(query_ap_cmc(&[0, 1], 1, 0, &gallery, EvalMode::All).is_some());
        assert!(aggregate(vec![None], 2).is_err());
    }
}
