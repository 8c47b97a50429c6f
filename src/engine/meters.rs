use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Default)]
pub struct AverageMeter {
    sum: f64,
    count: usize,
}

impl AverageMeter {
    pub fn update(&mut self, value: f64, n: usize) {
        self.sum += value * n as f64;
        self.count += n;
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn reset(&mut self) {
        *self = AverageMeter::default();
    }
}

/// Running averages of named values, e.g. per-term losses over an epoch.
#[derive(Debug, Clone, Default)]
pub struct MultiItemAverageMeter {
    items: BTreeMap<String, AverageMeter>,
}

impl MultiItemAverageMeter {
    pub fn update(&mut self, values: &BTreeMap<String, f64>) {
        for (name, value) in values {
            self.update_one(name, *value);
        }
    }

    pub fn update_one(&mut self, name: &str, value: f64) {
        self.items.entry(name.to_string()).or_default().update(value, 1);
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.items.get(name).map(AverageMeter::avg)
    }

    pub fn get_str(&self) -> String {
        self.items
            .iter()
            .map(|(name, meter)| format!("{}: {:.6}", name, meter.avg()))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_per_item() {
        let mut meter = MultiItemAverageMeter::default();
        meter.update(&BTreeMap::from([("a".to_string(), 1.), ("b".to_string(), 4.)]));
        meter.update_one("a", 3.);
        assert_eq!(meter.get("a"), Some(2.));
        assert_eq!(meter.get_str(), "a: 2.000000; b: 4.000000");
        assert_eq!(meter.get("c"), None);
    }
}
