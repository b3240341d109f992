use std::collections::VecDeque;

/// Moving average over the last few samples that snaps to a new sample when
/// it deviates too far from the current kernel.
///
/// `up` and `down` are fractions of the kernel: a sample above
/// `kernel * (1 + up)` or below `kernel * (1 - down)` clears the history and
/// becomes the new kernel. Each metric picks its own pair, e.g. bandwidth
/// jumps up only on a 4x sample (`up = 3.0`) but drops on a 20% dip.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    size: usize,
    up: f64,
    down: f64,
    samples: VecDeque<f64>,
    kernel: f64,
}

impl SlidingWindow {
    pub fn new(size: usize, up: f64, down: f64) -> Self {
        let size = size.max(1);
        Self {
            size,
            up,
            down,
            samples: VecDeque::with_capacity(size),
            kernel: 0.0,
        }
    }

    /// Window used for buffer fullness: slow downward, moderate upward.
    pub fn buffer_fullness() -> Self {
        Self::new(3, 0.5, 0.2)
    }

    /// Window used for bandwidth: only a 4x jump snaps upward.
    pub fn bandwidth() -> Self {
        Self::new(3, 3.0, 0.2)
    }

    /// Window used for per-bitrate download success.
    pub fn success() -> Self {
        Self::new(5, 0.2, 0.2)
    }

    /// Folds `sample` into the window and returns the new kernel.
    pub fn add(&mut self, sample: f64) -> f64 {
        if !self.samples.is_empty() && self.deviates(sample) {
            self.samples.clear();
        }

        if self.samples.len() == self.size {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);

        // Averaging the offsets from the oldest sample keeps a constant
        // input exact instead of accumulating rounding error in the sum.
        let anchor = self.samples[0];
        let offsets: f64 = self.samples.iter().map(|s| s - anchor).sum();
        self.kernel = anchor + offsets / self.samples.len() as f64;
        self.kernel
    }

    fn deviates(&self, sample: f64) -> bool {
        sample > self.kernel * (1.0 + self.up) || sample < self.kernel * (1.0 - self.down)
    }

    pub fn kernel(&self) -> f64 {
        self.kernel
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn reset(&mut self) {
        self.samples.clear();
        self.kernel = 0.0;
    }
}
