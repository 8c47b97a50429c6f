use crate::error::{ReidError, Result};
use ndarray::{s, Array2, Array4, Axis};
use rayon::prelude::*;

/// Averages each channel over a `grid x grid` partition of the image plane and
/// flattens the cells into one descriptor per image.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct GridPoolingLayer {
    channels: usize,
    grid: usize,
}

impl GridPoolingLayer {
    pub fn new(channels: usize, grid: usize) -> Self {
        GridPoolingLayer {
            channels,
            grid: grid.max(1),
        }
    }

    pub fn output_size(&self) -> usize {
        self.channels * self.grid * self.grid
    }

    pub fn forward_propagate(&self, input: &Array4<f64>) -> Result<Array2<f64>> {
        let (batch, channels, height, width) = input.dim();
        if channels != self.channels {
            return Err(ReidError::Shape(format!(
                "expected {} image channels, got {}",
                self.channels, channels
            )));
        }
        if height < self.grid || width < self.grid {
            return Err(ReidError::Shape(format!(
                "image of {}x{} is smaller than the {}x{} pooling grid",
                height, width, self.grid, self.grid
            )));
        }

        let grid = self.grid;
        let mut output: Array2<f64> = Array2::zeros((batch, self.output_size()));
        output
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(b, mut out)| {
                for c in 0..channels {
                    for gy in 0..grid {
                        let (y0, y1) = (gy * height / grid, (gy + 1) * height / grid);
                        for gx in 0..grid {
                            let (x0, x1) = (gx * width / grid, (gx + 1) * width / grid);
                            let cell = input.slice(s![b, c, y0..y1, x0..x1]);
                            out[(c * grid + gy) * grid + gx] = cell.mean().unwrap_or(0.);
                        }
                    }
                }
            });
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pools_each_quadrant() {
        let mut input = Array4::zeros((1, 1, 4, 4));
        input.slice_mut(s![0, 0, 0..2, 2..4]).fill(1.);
        input.slice_mut(s![0, 0, 2..4, 0..2]).fill(3.);
        let pooled = GridPoolingLayer::new(1, 2).forward_propagate(&input).unwrap();
        assert_eq!(pooled.row(0).to_vec(), vec![0., 1., 3., 0.]);
    }

    #[test]
    fn rejects_wrong_channel_count() {
        let input = Array4::zeros((2, 1, 8, 8));
        assert!(GridPoolingLayer::new(3, 2).forward_propagate(&input).is_err());
    }
}
