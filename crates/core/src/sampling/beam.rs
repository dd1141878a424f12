//! Beam search bookkeeping for seq2seq generation.
//!
//! The state tracks live hypotheses and finished ones (those that emitted
//! EOS). The model is driven from outside: each step the caller scores every
//! live beam, hands the per-beam top-k candidates to [`BeamSearchState::step`]
//! and rebuilds its decoder inputs from the returned transitions.

use std::cmp::Ordering;

/// Configuration for beam search decoding.
#[derive(Debug, Clone)]
pub struct BeamSearchConfig {
    /// Number of beams to maintain.
    pub beam_width: usize,
    /// Length normalization alpha (0 = no normalization).
    pub length_penalty: f32,
    /// Stop as soon as `beam_width` hypotheses have finished.
    pub early_stopping: bool,
    /// Number of hypotheses to return.
    pub num_return_beams: usize,
}

impl Default for BeamSearchConfig {
    fn default() -> Self {
        Self {
            beam_width: 4,
            length_penalty: 1.0,
            early_stopping: false,
            num_return_beams: 1,
        }
    }
}

/// A single beam hypothesis.
#[derive(Debug, Clone)]
pub struct BeamHypothesis {
    /// Generated tokens (excluding the decoder start token).
    pub token_ids: Vec<u32>,
    /// Cumulative log probability (unnormalized).
    pub score: f32,
    /// Whether this hypothesis has emitted EOS.
    pub is_finished: bool,
    /// Index of the live beam this hypothesis extended.
    pub parent_beam_idx: usize,
}

impl BeamHypothesis {
    pub fn new() -> Self {
        Self {
            token_ids: Vec::new(),
            score: 0.0,
            is_finished: false,
            parent_beam_idx: 0,
        }
    }

    /// Compute length-normalized score.
    pub fn normalized_score(&self, length_penalty: f32) -> f32 {
        if length_penalty == 0.0 || self.token_ids.is_empty() {
            self.score
        } else {
            // Wu et al. (2016) length normalization
            let len = self.token_ids.len() as f32;
            let lp = ((5.0 + len) / 6.0).powf(length_penalty);
            self.score / lp
        }
    }
}

impl Default for BeamHypothesis {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
struct BeamCandidate {
    token_id: u32,
    log_prob: f32,
    score: f32,
    beam_idx: usize,
}

fn by_score_desc(a: f32, b: f32) -> Ordering {
    b.partial_cmp(&a).unwrap_or(Ordering::Equal)
}

/// Beam search state tracker.
#[derive(Debug)]
pub struct BeamSearchState {
    pub config: BeamSearchConfig,
    /// Live hypotheses. Starts as a single empty beam.
    pub beams: Vec<BeamHypothesis>,
    /// Hypotheses that emitted EOS.
    pub completed: Vec<BeamHypothesis>,
    eos_token_id: u32,
    step: usize,
}

impl BeamSearchState {
    pub fn new(config: BeamSearchConfig, eos_token_id: u32) -> Self {
        Self {
            config,
            beams: vec![BeamHypothesis::new()],
            completed: Vec::new(),
            eos_token_id,
            step: 0,
        }
    }

    pub fn num_active_beams(&self) -> usize {
        self.beams.len()
    }

    /// Check if beam search is complete.
    pub fn is_done(&self) -> bool {
        if self.beams.is_empty() {
            return true;
        }
        if self.completed.len() < self.config.beam_width {
            return false;
        }
        if self.config.early_stopping {
            return true;
        }

        let lp = self.config.length_penalty;
        let mut finished: Vec<f32> = self
            .completed
            .iter()
            .map(|h| h.normalized_score(lp))
            .collect();
        finished.sort_by(|a, b| by_score_desc(*a, *b));
        let worst_kept = finished[self.config.beam_width - 1];

        let best_live = self
            .beams
            .iter()
            .map(|b| b.normalized_score(lp))
            .fold(f32::NEG_INFINITY, f32::max);

        best_live <= worst_kept
    }

    /// Expand the live beams.
    ///
    /// `candidates[beam_idx]` holds `(token_id, log_prob)` pairs for live beam
    /// `beam_idx`, typically from [`beam_search_top_k`] with `k = 2 * beam_width`
    /// so that enough non-EOS continuations survive.
    ///
    /// Returns, for each new live beam in order, `(parent_beam_idx, token_id)`.
    pub fn step(&mut self, candidates: &[Vec<(u32, f32)>]) -> Vec<(usize, u32)> {
        self.step += 1;

        let mut pool: Vec<BeamCandidate> = Vec::new();
        for (beam_idx, beam) in self.beams.iter().enumerate() {
            let Some(beam_candidates) = candidates.get(beam_idx) else {
                continue;
            };
            for &(token_id, log_prob) in beam_candidates {
                if log_prob == f32::NEG_INFINITY {
                    continue;
                }
                pool.push(BeamCandidate {
                    token_id,
                    log_prob,
                    score: beam.score + log_prob,
                    beam_idx,
                });
            }
        }
        pool.sort_by(|a, b| by_score_desc(a.score, b.score));

        let width = self.config.beam_width;
        let mut new_beams = Vec::with_capacity(width);
        let mut transitions = Vec::with_capacity(width);

        for (rank, candidate) in pool.into_iter().enumerate() {
            if new_beams.len() == width {
                break;
            }
            let parent = &self.beams[candidate.beam_idx];
            let mut hyp = BeamHypothesis {
                token_ids: parent.token_ids.clone(),
                score: parent.score + candidate.log_prob,
                is_finished: candidate.token_id == self.eos_token_id,
                parent_beam_idx: candidate.beam_idx,
            };
            hyp.token_ids.push(candidate.token_id);
            debug_assert!((hyp.score - candidate.score).abs() < 1e-3);

            if hyp.is_finished {
                // EOS below the top `width` ranks cannot beat a kept beam.
                if rank < width {
                    self.completed.push(hyp);
                }
            } else {
                transitions.push((candidate.beam_idx, candidate.token_id));
                new_beams.push(hyp);
            }
        }

        self.beams = new_beams;
        transitions
    }

    /// Best hypotheses (finished first-class, live ones as fallback), best first.
    pub fn get_best_hypotheses(&self) -> Vec<&BeamHypothesis> {
        let lp = self.config.length_penalty;
        let mut all: Vec<&BeamHypothesis> =
            self.completed.iter().chain(self.beams.iter()).collect();

        all.sort_by(|a, b| by_score_desc(a.normalized_score(lp), b.normalized_score(lp)));
        all.truncate(self.config.num_return_beams.max(1));
        all
    }

    pub fn current_step(&self) -> usize {
        self.step
    }
}

/// Top-k candidates from raw logits.
///
/// Returns the top-k (token_id, log_prob) pairs sorted by log_prob descending.
pub fn beam_search_top_k(logits: &[f32], k: usize) -> Vec<(u32, f32)> {
    if logits.is_empty() || k == 0 {
        return Vec::new();
    }

    let max_logit = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp_sum_ln = logits
        .iter()
        .map(|&x| (x - max_logit).exp())
        .sum::<f32>()
        .ln();

    let mut indexed: Vec<(u32, f32)> = logits
        .iter()
        .enumerate()
        .map(|(i, &x)| (i as u32, x - max_logit - exp_sum_ln))
        .collect();

    indexed.sort_unstable_by(|a, b| by_score_desc(a.1, b.1));
    indexed.truncate(k);
    indexed
}
