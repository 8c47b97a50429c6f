use crate::dataset::ReidDataset;
use crate::error::{ReidError, Result};
use ndarray::{Array3, Array4};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sampler {
    Sequential,
    Shuffle,
    /// `batch_size / instances` identities with `instances` images each.
    IdentityBalanced { instances: usize },
}

pub struct Batch {
    pub images: Array4<f64>,
    pub pids: Vec<usize>,
    pub camids: Vec<usize>,
}

/// Batches a dataset. Sample order depends only on `seed` and the epoch.
#[derive(Clone)]
pub struct DataLoader {
    dataset: Arc<ReidDataset>,
    batch_size: usize,
    sampler: Sampler,
    seed: u64,
}

impl DataLoader {
    pub fn new(
        dataset: Arc<ReidDataset>,
        batch_size: usize,
        sampler: Sampler,
        seed: u64,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(ReidError::Config("batch size must be positive".into()));
        }
        if let Sampler::IdentityBalanced { instances } = sampler {
            if instances == 0 || batch_size % instances != 0 {
                return Err(ReidError::Config(format!(
                    "batch size {} is not a multiple of {} instances per identity",
                    batch_size, instances
                )));
            }
        }
        Ok(DataLoader {
            dataset,
            batch_size,
            sampler,
            seed,
        })
    }

    pub fn dataset(&self) -> &ReidDataset {
        &self.dataset
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Sample indices visited in `epoch`, in batch order.
    pub fn indices(&self, epoch: usize) -> Vec<usize> {
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
        match self.sampler {
            Sampler::Sequential => (0..self.dataset.len()).collect(),
            Sampler::Shuffle => {
                let mut indices: Vec<_> = (0..self.dataset.len()).collect();
                indices.shuffle(&mut rng);
                indices
            }
            Sampler::IdentityBalanced { instances } => {
                let mut by_pid: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
                for (idx, sample) in self.dataset.samples.iter().enumerate() {
                    by_pid.entry(sample.pid).or_default().push(idx);
                }
                let mut groups: Vec<Vec<usize>> = by_pid
                    .into_values()
                    .map(|mut group| {
                        group.shuffle(&mut rng);
                        // Too few images: repeat with replacement.
                        while group.len() < instances {
                            if let Some(idx) = group.choose(&mut rng).copied() {
                                group.push(idx);
                            }
                        }
                        group.truncate(instances);
                        group
                    })
                    .collect();
                groups.shuffle(&mut rng);
                groups.concat()
            }
        }
    }

    pub fn iter(&self, epoch: usize) -> Batches<'_> {
        Batches {
            loader: self,
            indices: self.indices(epoch),
            cursor: 0,
        }
    }

    fn load_batch(&self, indices: &[usize]) -> Result<Batch> {
        let (channels, height, width) = self.dataset.input_shape();
        let images = indices
            .par_iter()
            .map(|idx| self.dataset.load_image(*idx))
            .collect::<Result<Vec<Array3<f64>>>>()?;
        let mut batch = Array4::<f64>::zeros((indices.len(), channels, height, width));
        batch
            .outer_iter_mut()
            .zip(&images)
            .for_each(|(mut slot, image)| slot.assign(image));
        let samples = &self.dataset.samples;
        Ok(Batch {
            images: batch,
            pids: indices.iter().map(|idx| samples[*idx].pid).collect(),
            camids: indices.iter().map(|idx| samples[*idx].camid).collect(),
        })
    }
}

pub struct Batches<'a> {
    loader: &'a DataLoader,
    indices: Vec<usize>,
    cursor: usize,
}

impl<'a> Iterator for Batches<'a> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.indices.len() {
            return None;
        }
        let end = (self.cursor + self.loader.batch_size).min(self.indices.len());
        let batch = self.loader.load_batch(&self.indices[self.cursor..end]);
        self.cursor = end;
        Some(batch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoaderConfig {
    pub train_batch_size: usize,
    pub test_batch_size: usize,
    pub sampler: Sampler,
    pub seed: u64,
}

/// Train, query and gallery loaders over one set of datasets.
pub struct DataManager {
    pub train_loader: DataLoader,
    pub query_loader: DataLoader,
    pub gallery_loader: DataLoader,
    pub query_dataset: Arc<ReidDataset>,
    pub gallery_dataset: Arc<ReidDataset>,
    pub class_num: usize,
}

impl DataManager {
    /// Training identities are relabelled to `0..class_num`.
    pub fn new(
        train: ReidDataset,
        query: ReidDataset,
        gallery: ReidDataset,
        config: &LoaderConfig,
    ) -> Result<Self> {
        for (name, dataset) in [("train", &train), ("query", &query), ("gallery", &gallery)] {
            if dataset.is_empty() {
                return Err(ReidError::Config(format!("{} dataset is empty", name)));
            }
        }
        let train = Arc::new(train.relabel());
        let class_num = train.num_pids();
        let query_dataset = Arc::new(query);
        let gallery_dataset = Arc::new(gallery);
        tracing::info!(
            train = train.len(),
            query = query_dataset.len(),
            gallery = gallery_dataset.len(),
            class_num,
            "datasets ready"
        );
        Ok(DataManager {
            train_loader: DataLoader::new(
                train,
                config.train_batch_size,
                config.sampler,
                config.seed,
            )?,
            query_loader: DataLoader::new(
                query_dataset.clone(),
                config.test_batch_size,
                Sampler::Sequential,
                config.seed,
            )?,
            gallery_loader: DataLoader::new(
                gallery_dataset.clone(),
                config.test_batch_size,
                Sampler::Sequential,
                config.seed,
            )?,
            query_dataset,
            gallery_dataset,
            class_num,
        })
    }

    /// Identities, cameras and images generated in memory. The same images
    /// serve as query and gallery.
    pub fn synthetic(
        num_ids: usize,
        num_cams: usize,
        per_cam: usize,
        input_shape: (usize, usize, usize),
        config: &LoaderConfig,
    ) -> Result<Self> {
        let dataset = ReidDataset::synthetic(num_ids, num_cams, per_cam, input_shape, config.seed);
        DataManager::new(dataset.clone(), dataset.clone(), dataset, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn dataset() -> Arc<ReidDataset> {
        Arc::new(ReidDataset::synthetic(4, 2, 2, (3, 4, 4), 1))
    }

    #[test]
    fn sequential_loader_keeps_order_and_partial_batch() {
        let loader = DataLoader::new(dataset(), 6, Sampler::Sequential, 0).unwrap();
        let batches: Vec<_> = loader.iter(0).map(|b| b.unwrap()).collect();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].images.dim(), (4, 3, 4, 4));
        assert_eq!(batches[0].pids, [0, 0, 0, 0, 1, 1]);
    }

    #[test]
    fn shuffle_depends_on_seed_and_epoch_only() {
        let loader = DataLoader::new(dataset(), 4, Sampler::Shuffle, 9).unwrap();
        assert_eq!(loader.indices(3), loader.indices(3));
        let visited: BTreeSet<_> = loader.indices(3).into_iter().collect();
        assert_eq!(visited.len(), 16);
    }

    #[test]
    fn identity_balanced_batches_group_instances() {
        let sampler = Sampler::IdentityBalanced { instances: 2 };
        let loader = DataLoader::new(dataset(), 4, sampler, 5).unwrap();
        for batch in loader.iter(0) {
            let batch = batch.unwrap();
            assert_eq!(batch.pids.len(), 4);
            assert_eq!(batch.pids[0], batch.pids[1]);
            assert_eq!(batch.pids[2], batch.pids[3]);
        }
        assert!(DataLoader::new(dataset(), 5, sampler, 5).is_err());
    }

    #[test]
    fn manager_rejects_empty_split() {
        let config = LoaderConfig {
            train_batch_size: 4,
            test_batch_size: 4,
            sampler: Sampler::Shuffle,
            seed: 0,
        };
        let empty = ReidDataset::new(vec![], (3, 4, 4));
        let full = ReidDataset::synthetic(2, 2, 1, (3, 4, 4), 0);
        assert!(DataManager::new(full.clone(), empty, full, &config).is_err());
    }
}
