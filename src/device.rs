use crate::error::{ReidError, Result};
use std::sync::Arc;

/// Compute context threaded through the engine. Work runs either on rayon's
/// global pool or on a dedicated pool of fixed size.
#[derive(Clone, Default)]
pub struct Device {
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl Device {
    pub fn cpu() -> Self {
        Device { pool: None }
    }

    pub fn with_threads(threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|idx| format!("light-reid-{}", idx))
            .build()
            .map_err(|e| ReidError::Config(format!("cannot build thread pool: {}", e)))?;
        Ok(Device {
            pool: Some(Arc::new(pool)),
        })
    }

    pub fn threads(&self) -> usize {
        match &self.pool {
            Some(pool) => pool.current_num_threads(),
            None => rayon::current_num_threads(),
        }
    }

    /// Runs `op` inside this device's pool so nested rayon calls use it.
    pub fn run<T, F>(&self, op: F) -> T
    where
        F: FnOnce() -> T + Send,
        T: Send,
    {
        match &self.pool {
            Some(pool) => pool.install(op),
            None => op(),
        }
    }

    /// Blocks until all work submitted to the device has finished. Every
    /// rayon call joins before returning, so an empty scope is enough to drain
    /// the pool.
    pub fn synchronize(&self) {
        match &self.pool {
            Some(pool) => pool.scope(|_| {}),
            None => rayon::scope(|_| {}),
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.pool {
            Some(_) => write!(f, "Device(threads={})", self.threads()),
            None => write!(f, "Device(cpu)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedicated_pool_runs_work() {
        let device = Device::with_threads(2).unwrap();
        assert_eq!(device.threads(), 2);
        let sum: usize = device.run(|| {
            use rayon::prelude::*;
            (0..100usize).into_par_iter().sum()
        });
        device.synchronize();
        assert_eq!(sum, 4950);
    }
}
