use crate::error::{ReidError, Result};
use image::{imageops::FilterType, DynamicImage, GenericImageView};
use ndarray::{Array3, Axis};
use nshare::IntoNdarray3;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// `(channels, height, width)` of the tensors handed to the model.
pub type InputShape = (usize, usize, usize);

#[derive(Debug, Clone)]
pub enum ImageSource {
    File(PathBuf),
    /// Already decoded `(C, H, W)` pixels.
    Pixels(Array3<f64>),
}

#[derive(Debug, Clone)]
pub struct Sample {
    pub image: ImageSource,
    pub pid: usize,
    pub camid: usize,
}

impl Sample {
    /// Path for file-backed samples, a synthetic tag otherwise.
    pub fn describe(&self) -> String {
        match &self.image {
            ImageSource::File(path) => path.display().to_string(),
            ImageSource::Pixels(_) => format!("synthetic/pid{}_cam{}", self.pid, self.camid),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ManifestRecord {
    image_path: String,
    pid: usize,
    camid: usize,
}

#[derive(Debug, Clone)]
pub struct ReidDataset {
    pub samples: Vec<Sample>,
    input_shape: InputShape,
}

impl ReidDataset {
    pub fn new(samples: Vec<Sample>, input_shape: InputShape) -> Self {
        ReidDataset {
            samples,
            input_shape,
        }
    }

    /// Reads an `image_path,pid,camid` manifest. Relative image paths are
    /// resolved against the manifest's directory.
    pub fn from_csv<P: AsRef<Path>>(manifest: P, input_shape: InputShape) -> Result<Self> {
        let manifest = manifest.as_ref();
        let root = manifest.parent().unwrap_or_else(|| Path::new("."));
        let mut reader = csv::Reader::from_path(manifest)?;
        let mut samples = vec![];
        for record in reader.deserialize() {
            let record: ManifestRecord = record?;
            let path = PathBuf::from(&record.image_path);
            let path = if path.is_absolute() {
                path
            } else {
                root.join(path)
            };
            samples.push(Sample {
                image: ImageSource::File(path),
                pid: record.pid,
                camid: record.camid,
            });
        }
        tracing::info!(
            manifest = %manifest.display(),
            samples = samples.len(),
            "loaded dataset manifest"
        );
        Ok(ReidDataset::new(samples, input_shape))
    }

    /// Identities drawn as per-identity colour templates with per-camera tint
    /// and per-image noise. Deterministic for a given seed.
    pub fn synthetic(
        num_ids: usize,
        num_cams: usize,
        per_cam: usize,
        input_shape: InputShape,
        seed: u64,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let (channels, height, width) = input_shape;
        let mut samples = Vec::with_capacity(num_ids * num_cams * per_cam);
        for pid in 0..num_ids {
            let template = Array3::from_shape_fn(input_shape, |_| rng.gen_range(0.0..1.0f64));
            for camid in 0..num_cams {
                let tint = 0.05 * camid as f64;
                for _ in 0..per_cam {
                    let pixels = Array3::from_shape_fn((channels, height, width), |idx| {
                        let noise: f64 = rng.sample(StandardNormal);
                        (template[idx] + tint + 0.05 * noise).clamp(0., 1.)
                    });
                    samples.push(Sample {
                        image: ImageSource::Pixels(pixels),
                        pid,
                        camid,
                    });
                }
            }
        }
        ReidDataset::new(samples, input_shape)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn input_shape(&self) -> InputShape {
        self.input_shape
    }

    pub fn num_pids(&self) -> usize {
        self.pid_map().len()
    }

    /// Maps identities to `0..num_pids` in ascending order of the original id.
    pub fn relabel(mut self) -> Self {
        let map = self.pid_map();
        self.samples
            .iter_mut()
            .for_each(|sample| sample.pid = map[&sample.pid]);
        self
    }

    fn pid_map(&self) -> BTreeMap<usize, usize> {
        let pids: BTreeSet<usize> = self.samples.iter().map(|sample| sample.pid).collect();
        pids.into_iter()
            .enumerate()
            .map(|(label, pid)| (pid, label))
            .collect()
    }

    pub fn load_image(&self, idx: usize) -> Result<Array3<f64>> {
        let sample = self.samples.get(idx).ok_or_else(|| {
            ReidError::Shape(format!("sample {} out of {}", idx, self.samples.len()))
        })?;
        let (channels, height, width) = self.input_shape;
        match &sample.image {
            ImageSource::File(path) => {
                let image = get_image(path, height, width)?;
                let pixels = image_to_ndimage(image);
                if pixels.len_of(Axis(0)) != channels {
                    return Err(ReidError::Shape(format!(
                        "{} decodes to {} channels, expected {}",
                        path.display(),
                        pixels.len_of(Axis(0)),
                        channels
                    )));
                }
                Ok(pixels)
            }
            ImageSource::Pixels(pixels) => {
                if pixels.dim() != self.input_shape {
                    return Err(ReidError::Shape(format!(
                        "sample {} has shape {:?}, expected {:?}",
                        idx,
                        pixels.dim(),
                        self.input_shape
                    )));
                }
                Ok(pixels.clone())
            }
        }
    }
}

/// Opens an image and resizes it to `height x width`.
pub fn get_image(path: &Path, height: usize, width: usize) -> Result<DynamicImage> {
    let mut image = image::open(path)?;
    if image.dimensions() != (width as u32, height as u32) {
        image = image.resize_exact(width as u32, height as u32, FilterType::Lanczos3);
    }
    Ok(image)
}

/// RGB pixels in `[0, 1]` as a `(3, H, W)` array.
pub fn image_to_ndimage(image: DynamicImage) -> Array3<f64> {
    image.into_rgb32f().into_ndarray3().mapv(|x| x as f64)
}
