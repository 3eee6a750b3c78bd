// src/rl/buffer.rs
//
// Fixed-capacity experience replay buffer (ring semantics).

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::error::{Result, TuneError};
use crate::rl::env::StepInfo;

/// One interaction step. Immutable once stored.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub observation: Vec<f32>,
    pub action: Vec<f32>,
    pub reward: f64,
    /// True successor state; for terminal steps this is the terminal
    /// observation, never the auto-reset one.
    pub next_observation: Vec<f32>,
    pub done: bool,
    pub info: StepInfo,
}

/// A sampled minibatch, column-major.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub observations: Vec<Vec<f32>>,
    pub actions: Vec<Vec<f32>>,
    pub rewards: Vec<f64>,
    pub next_observations: Vec<Vec<f32>>,
    pub dones: Vec<bool>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.rewards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rewards.is_empty()
    }
}

pub struct ReplayBuffer {
    capacity: usize,
    obs_dim: usize,
    action_dim: usize,
    storage: Vec<Transition>,
    /// Next slot to write once the buffer is full.
    pos: usize,
    rng: ChaCha8Rng,
}

impl ReplayBuffer {
    pub fn new(capacity: usize, obs_dim: usize, action_dim: usize, seed: u64) -> Result<Self> {
        if capacity == 0 {
            return Err(TuneError::ZeroCapacity);
        }
        Ok(Self {
            capacity,
            obs_dim,
            action_dim,
            // Grow lazily; configured capacities can be large.
            storage: Vec::with_capacity(capacity.min(4096)),
            pos: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
        })
    }

    pub fn add(
        &mut self,
        observation: &[f32],
        next_observation: &[f32],
        action: &[f32],
        reward: f64,
        done: bool,
        info: StepInfo,
    ) -> Result<()> {
        self.check_dim("buffer observation", self.obs_dim, observation.len())?;
        self.check_dim("buffer next_observation", self.obs_dim, next_observation.len())?;
        self.check_dim("buffer action", self.action_dim, action.len())?;

        let transition = Transition {
            observation: observation.to_vec(),
            action: action.to_vec(),
            reward,
            next_observation: next_observation.to_vec(),
            done,
            info,
        };

        if self.storage.len() < self.capacity {
            self.storage.push(transition);
        } else {
            self.storage[self.pos] = transition;
        }
        self.pos = (self.pos + 1) % self.capacity;
        Ok(())
    }

    /// Uniform sample with replacement over the filled slots.
    pub fn sample(&mut self, batch_size: usize) -> Result<Batch> {
        if self.storage.is_empty() {
            return Err(TuneError::EmptyBuffer);
        }

        let mut batch = Batch::default();
        for _ in 0..batch_size {
            let t = &self.storage[self.rng.gen_range(0..self.storage.len())];
            batch.observations.push(t.observation.clone());
            batch.actions.push(t.action.clone());
            batch.rewards.push(t.reward);
            batch.next_observations.push(t.next_observation.clone());
            batch.dones.push(t.done);
        }
        Ok(batch)
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.storage.len() == self.capacity
    }

    pub fn obs_dim(&self) -> usize {
        self.obs_dim
    }

    pub fn action_dim(&self) -> usize {
        self.action_dim
    }

    /// Stored transitions, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Transition> {
        let split = if self.is_full() { self.pos } else { 0 };
        self.storage[split..].iter().chain(self.storage[..split].iter())
    }

    fn check_dim(&self, what: &'static str, expected: usize, actual: usize) -> Result<()> {
        if expected != actual {
            return Err(TuneError::DimensionMismatch {
                what,
                expected,
                actual,
            });
        }
        Ok(())
    }
}
