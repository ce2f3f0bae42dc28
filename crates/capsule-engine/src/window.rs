use std::collections::VecDeque;

use capsule_core::config::WindowConfig;

/// A change of the concurrency window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Adjustment {
    pub from: usize,
    pub to: usize,
    pub avg_ms: u64,
}

/// Adaptive limit on concurrently running steps.
///
/// Starts at `floor` and moves one step at a time within `floor..=ceiling`,
/// driven by the backlog and a rolling average of step durations.
#[derive(Debug, Clone)]
pub struct ConcurrencyWindow {
    floor: usize,
    ceiling: usize,
    current: usize,
    samples: VecDeque<u64>,
    config: WindowConfig,
}

impl ConcurrencyWindow {
    pub fn new(floor: usize, ceiling: usize, config: WindowConfig) -> Self {
        let ceiling = ceiling.max(1);
        let floor = floor.clamp(1, ceiling);
        Self {
            floor,
            ceiling,
            current: floor,
            samples: VecDeque::with_capacity(config.sample_size.max(1)),
            config,
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn bounds(&self) -> (usize, usize) {
        (self.floor, self.ceiling)
    }

    /// Rolling average of recent step durations, in milliseconds.
    pub fn average_ms(&self) -> u64 {
        if self.samples.is_empty() {
            return 0;
        }
        self.samples.iter().sum::<u64>() / self.samples.len() as u64
    }

    /// Record one finished step and the ready-queue depth after it.
    pub fn observe(&mut self, duration_ms: u64, queue_depth: usize) -> Option<Adjustment> {
        if self.samples.len() >= self.config.sample_size.max(1) {
            self.samples.pop_front();
        }
        self.samples.push_back(duration_ms);

        let avg_ms = self.average_ms();
        let from = self.current;
        if queue_depth > self.current
            && avg_ms < self.config.grow_below_ms
            && self.current < self.ceiling
        {
            self.current += 1;
        } else if queue_depth <= self.current / 2
            && avg_ms > self.config.shrink_above_ms
            && self.current > self.floor
        {
            self.current -= 1;
        }

        (self.current != from).then_some(Adjustment {
            from,
            to: self.current,
            avg_ms,
        })
    }
}
