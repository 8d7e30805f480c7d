use std::{collections::VecDeque, time::Instant};

pub const DEFAULT_WINDOW: usize = 60;

/// Rolling average of the instantaneous presentation rate.
#[derive(Debug, Clone)]
pub struct FpsCounter {
    window: usize,
    samples: VecDeque<f64>,
    last: Option<Instant>,
}

impl Default for FpsCounter {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl FpsCounter {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            samples: VecDeque::with_capacity(window),
            last: None,
        }
    }

    pub fn update(&mut self) -> u32 {
        self.update_at(Instant::now())
    }

    /// Records one presented frame at `now` and returns the rounded mean rate.
    ///
    /// The first call only sets the baseline. A zero interval adds no sample.
    pub fn update_at(&mut self, now: Instant) -> u32 {
        if let Some(last) = self.last {
            let elapsed_ms = now.saturating_duration_since(last).as_secs_f64() * 1000.0;
            if elapsed_ms > 0.0 {
                if self.samples.len() == self.window {
                    self.samples.pop_front();
                }
                self.samples.push_back(1000.0 / elapsed_ms);
            }
        }
        self.last = Some(now);
        self.average()
    }

    pub fn average(&self) -> u32 {
        if self.samples.is_empty() {
            return 0;
        }
        let mean = self.samples.iter().sum::<f64>() / self.samples.len() as f64;
        mean.round() as u32
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn reset(&mut self) {
        self.samples.clear();
        self.last = None;
    }
}
