use std::sync::atomic::{AtomicBool, Ordering};

use crate::util::load_estimator::LoadEstimator;


/// A load estimator that reports whatever the test tells it to
#[derive(Default)]
pub struct FixedLoadEstimator {
    high_load: AtomicBool,
}
impl FixedLoadEstimator {
    pub fn new(high_load: bool) -> FixedLoadEstimator {
        FixedLoadEstimator {
            high_load: AtomicBool::new(high_load),
        }
    }

    pub fn set_high_load(&self, high_load: bool) {
        self.high_load.store(high_load, Ordering::Release);
    }
}

impl LoadEstimator for FixedLoadEstimator {
    fn load(&self) -> f64 {
        if self.high_load.load(Ordering::Acquire) { 1.0 } else { 0.0 }
    }
}
