// src/rl/policy.rs
//
// Learner interface for the off-policy loop.
//
// Neural policy/critic networks live outside this crate; the loop only needs
// an action for an observation and a way to run N gradient updates against
// the replay buffer.
//
// - Learner: trait the rollout collector drives
// - GreedyReplayLearner: reference learner that replays the best action seen

use crate::error::{Result, TuneError};
use crate::rl::buffer::ReplayBuffer;

pub const GREEDY_LEARNER_VERSION: &str = "greedy-replay-v1";

pub trait Learner {
    fn version(&self) -> &str;

    /// Latent action for `observation`, before noise and curriculum bias.
    fn predict(&mut self, observation: &[f32]) -> Result<Vec<f32>>;

    /// Run `gradient_steps` updates, each on a fresh `batch_size` sample.
    fn train(
        &mut self,
        buffer: &mut ReplayBuffer,
        gradient_steps: usize,
        batch_size: usize,
    ) -> Result<()>;

    /// Eval mode during collection, train mode during updates.
    fn set_training_mode(&mut self, training: bool);
}

/// Proposes the highest-reward action found in any sampled batch.
///
/// Starts at the origin of the latent space; exploration comes entirely from
/// action noise and the curriculum bias.
#[derive(Debug, Clone)]
pub struct GreedyReplayLearner {
    obs_dim: usize,
    action_dim: usize,
    best: Option<(f64, Vec<f32>)>,
    training: bool,
    n_updates: u64,
}

impl GreedyReplayLearner {
    pub fn new(obs_dim: usize, action_dim: usize) -> Self {
        Self {
            obs_dim,
            action_dim,
            best: None,
            training: false,
            n_updates: 0,
        }
    }

    pub fn best_reward(&self) -> Option<f64> {
        self.best.as_ref().map(|(r, _)| *r)
    }

    pub fn n_updates(&self) -> u64 {
        self.n_updates
    }

    pub fn is_training(&self) -> bool {
        self.training
    }
}

impl Learner for GreedyReplayLearner {
    fn version(&self) -> &str {
        GREEDY_LEARNER_VERSION
    }

    fn predict(&mut self, observation: &[f32]) -> Result<Vec<f32>> {
        if observation.len() != self.obs_dim {
            return Err(TuneError::DimensionMismatch {
                what: "learner observation",
                expected: self.obs_dim,
                actual: observation.len(),
            });
        }
        Ok(match &self.best {
            Some((_, action)) => action.clone(),
            None => vec![0.0; self.action_dim],
        })
    }

    fn train(
        &mut self,
        buffer: &mut ReplayBuffer,
        gradient_steps: usize,
        batch_size: usize,
    ) -> Result<()> {
        for _ in 0..gradient_steps {
            let batch = buffer.sample(batch_size)?;
            for (reward, action) in batch.rewards.iter().zip(batch.actions) {
                let better = match &self.best {
                    Some((best, _)) => *reward > *best,
                    None => true,
                };
                if better {
                    self.best = Some((*reward, action));
                }
            }
            self.n_updates += 1;
        }
        Ok(())
    }

    fn set_training_mode(&mut self, training: bool) {
        self.training = training;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rl::env::StepInfo;

    #[test]
    fn test_predicts_origin_before_training() {
        let mut learner = GreedyReplayLearner::new(2, 3);
        assert_eq!(learner.predict(&[0.0, 0.0]).unwrap(), vec![0.0; 3]);
        assert!(learner.predict(&[0.0]).is_err());
    }

    #[test]
    fn test_train_adopts_best_sampled_action() {
        let mut buffer = ReplayBuffer::new(4, 1, 1, 0).unwrap();
        buffer.add(&[0.0], &[0.0], &[0.1], 1.0, false, StepInfo::default()).unwrap();
        buffer.add(&[0.0], &[0.0], &[0.7], 5.0, false, StepInfo::default()).unwrap();

        let mut learner = GreedyReplayLearner::new(1, 1);
        learner.train(&mut buffer, 8, 16).unwrap();

        assert_eq!(learner.n_updates(), 8);
        assert_eq!(learner.best_reward(), Some(5.0));
        assert_eq!(learner.predict(&[0.0]).unwrap(), vec![0.7]);
    }
}
