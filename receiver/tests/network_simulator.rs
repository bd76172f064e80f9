//! Network simulator for testing resilience.
//!
//! Provides in-process simulation of packet loss, jitter, and
//! reordering for wire datagrams on their way to the receiver.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Network simulator configuration.
#[derive(Debug, Clone)]
pub struct NetworkSimulatorConfig {
    // ---
    /// Packet loss rate (0.0 to 1.0)
    pub loss_rate: f64,

    /// Extra delivery delay, uniformly drawn from `0..=2*jitter_ms`
    pub jitter_ms: u32,

    /// Packet reordering rate (0.0 to 1.0)
    pub reorder_rate: f64,

    /// Furthest back a reordered datagram may be inserted
    pub reorder_depth: usize,

    /// Random seed for deterministic testing
    pub seed: Option<u64>,
}

impl Default for NetworkSimulatorConfig {
    fn default() -> Self {
        // ---
        Self {
            loss_rate: 0.0,
            jitter_ms: 0,
            reorder_rate: 0.0,
            reorder_depth: 3,
            seed: None,
        }
    }
}

#[derive(Debug, Clone)]
struct DelayedDatagram {
    datagram: Vec<u8>,
    delivery_time: Instant,
}

/// Applies configurable loss, jitter, and reordering to datagrams
/// passing through it.
pub struct NetworkSimulator {
    // ---
    config: NetworkSimulatorConfig,
    rng: StdRng,
    queue: VecDeque<DelayedDatagram>,
    stats: NetworkSimulatorStats,
}

/// Network simulator statistics.
#[derive(Debug, Clone, Default)]
pub struct NetworkSimulatorStats {
    pub datagrams_sent: u64,
    pub datagrams_lost: u64,
    pub datagrams_delayed: u64,
    pub datagrams_reordered: u64,
}

impl NetworkSimulatorStats {
    pub fn loss_rate(&self) -> f64 {
        // ---
        if self.datagrams_sent == 0 {
            0.0
        } else {
            self.datagrams_lost as f64 / self.datagrams_sent as f64
        }
    }
}

impl NetworkSimulator {
    // ---
    pub fn new(config: NetworkSimulatorConfig) -> Self {
        // ---
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            config,
            rng,
            queue: VecDeque::new(),
            stats: NetworkSimulatorStats::default(),
        }
    }

    /// Sends a datagram through the simulator; it may be dropped,
    /// delayed, or moved ahead of datagrams already in flight.
    pub fn send(&mut self, datagram: Vec<u8>) {
        // ---
        self.stats.datagrams_sent += 1;

        if self.rng.gen_bool(self.config.loss_rate) {
            self.stats.datagrams_lost += 1;
            return;
        }

        let delay = self.calculate_delay();
        if !delay.is_zero() {
            self.stats.datagrams_delayed += 1;
        }
        let delayed = DelayedDatagram {
            datagram,
            delivery_time: Instant::now() + delay,
        };

        let depth = self.config.reorder_depth.min(self.queue.len());
        if depth > 0 && self.rng.gen_bool(self.config.reorder_rate) {
            self.stats.datagrams_reordered += 1;
            let pos = self.queue.len() - self.rng.gen_range(1..=depth);
            self.queue.insert(pos, delayed);
        } else {
            self.queue.push_back(delayed);
        }
    }

    /// Retrieves the next datagram ready for delivery.
    pub fn receive(&mut self) -> Option<Vec<u8>> {
        // ---
        let ready = self
            .queue
            .front()
            .is_some_and(|d| d.delivery_time <= Instant::now());
        if ready {
            self.queue.pop_front().map(|d| d.datagram)
        } else {
            None
        }
    }

    /// Delivers everything still in flight, ignoring delivery times.
    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        self.queue.drain(..).map(|d| d.datagram).collect()
    }

    pub fn in_flight(&self) -> usize {
        self.queue.len()
    }

    pub fn stats(&self) -> NetworkSimulatorStats {
        self.stats.clone()
    }

    fn calculate_delay(&mut self) -> Duration {
        // ---
        if self.config.jitter_ms == 0 {
            return Duration::ZERO;
        }

        let jitter = self.rng.gen_range(0..=(2 * self.config.jitter_ms));
        Duration::from_millis(u64::from(jitter))
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_no_loss_no_delay() {
        // ---
        let mut sim = NetworkSimulator::new(NetworkSimulatorConfig::default());

        sim.send(vec![0]);
        sim.send(vec![1]);

        assert_eq!(sim.receive(), Some(vec![0]));
        assert_eq!(sim.receive(), Some(vec![1]));
        assert_eq!(sim.stats().loss_rate(), 0.0);
    }

    #[test]
    fn test_total_loss() {
        // ---
        let mut sim = NetworkSimulator::new(NetworkSimulatorConfig {
            loss_rate: 1.0,
            seed: Some(42),
            ..Default::default()
        });

        for i in 0..10u8 {
            sim.send(vec![i]);
        }

        assert!(sim.receive().is_none());
        assert_eq!(sim.stats().datagrams_lost, 10);
    }

    #[test]
    fn test_reordering_is_bounded() {
        // ---
        let mut sim = NetworkSimulator::new(NetworkSimulatorConfig {
            reorder_rate: 1.0,
            reorder_depth: 2,
            seed: Some(7),
            ..Default::default()
        });

        for i in 0..50u8 {
            sim.send(vec![i]);
        }

        let order: Vec<u8> = sim.drain().into_iter().map(|d| d[0]).collect();
        assert_eq!(order.len(), 50);
        assert_ne!(order, (0..50).collect::<Vec<u8>>());
        assert!(sim.stats().datagrams_reordered > 0);
    }

    #[test]
    fn test_deterministic_with_seed() {
        // ---
        let config = NetworkSimulatorConfig {
            loss_rate: 0.5,
            seed: Some(42),
            ..Default::default()
        };

        let mut sim1 = NetworkSimulator::new(config.clone());
        let mut sim2 = NetworkSimulator::new(config);
        for i in 0..100u8 {
            sim1.send(vec![i]);
            sim2.send(vec![i]);
        }

        assert_eq!(sim1.stats().datagrams_lost, sim2.stats().datagrams_lost);
        assert_eq!(sim1.drain(), sim2.drain());
    }
}
