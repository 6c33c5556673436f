//! Sampler chain: turns the runtime's output logits into one token id.
//!
//! A [`SamplerChain`] is an ordered list of [`SamplerStage`]s. Filtering
//! stages (penalties, top-k, top-p, temperature) narrow or reshape the
//! candidate set; the final stage must be a terminal draw ([`SamplerStage::Dist`]
//! or [`SamplerStage::Greedy`]) that picks exactly one token.
//!
//! The canonical chain built by [`SamplerChain::from_params`] is
//!
//! ```text
//! penalties(64) → top-k → top-p(min_keep = 1) → temperature → dist(seed)
//! ```
//!
//! The only randomness is the draw stage's RNG. Two chains built from the
//! same [`SamplingParams`] with a fixed seed and fed the same accepted tokens
//! return the same tokens for the same logits.

use std::collections::{HashMap, VecDeque};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::backend::ModelContext;
use crate::batch::TokenId;
use crate::{Error, Result};

/// Number of recently accepted tokens the repetition penalty looks at.
pub const DEFAULT_PENALTY_WINDOW: usize = 64;

/// Parameters for the canonical sampler chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    /// Logit divisor applied before the draw. `0.0` selects the most likely
    /// surviving token. Must be `>= 0`.
    pub temperature: f32,
    /// Multiplicative penalty on tokens seen in the last `penalty_window`
    /// accepted tokens. `1.0` disables it. Must be `> 0`.
    pub repeat_penalty: f32,
    /// Keep only the `top_k` most likely tokens. `0` disables the filter.
    /// Must be `>= 0`.
    pub top_k: i32,
    /// Nucleus threshold in `(0, 1]`. `1.0` disables the filter.
    pub top_p: f32,
    /// Number of accepted tokens the repetition penalty considers.
    pub penalty_window: usize,
    /// Seed for the draw stage. `None` picks a random seed.
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            repeat_penalty: 1.1,
            top_k: 40,
            top_p: 0.9,
            penalty_window: DEFAULT_PENALTY_WINDOW,
            seed: None,
        }
    }
}

impl SamplingParams {
    /// Check that every parameter is in range. Nothing is clamped.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] naming the first bad parameter.
    pub fn validate(&self) -> Result<()> {
        if self.temperature.is_nan() || self.temperature < 0.0 {
            return Err(Error::InvalidConfig(format!(
                "temperature must be >= 0, got {}",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        if self.top_k < 0 {
            return Err(Error::InvalidConfig(format!(
                "top_k must be >= 0, got {}",
                self.top_k
            )));
        }
        if !(self.repeat_penalty.is_finite() && self.repeat_penalty > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "repeat_penalty must be a positive number, got {}",
                self.repeat_penalty
            )));
        }
        Ok(())
    }
}

/// One stage of a [`SamplerChain`].
#[derive(Debug, Clone, PartialEq)]
pub enum SamplerStage {
    /// Repetition, frequency and presence penalties over the last `last_n`
    /// accepted tokens.
    Penalties {
        last_n: usize,
        repeat: f32,
        frequency: f32,
        presence: f32,
    },
    /// Keep the `k` highest logits. `k <= 0` is a no-op.
    TopK(i32),
    /// Keep the smallest probability-sorted prefix with mass `>= p`, but
    /// never fewer than `min_keep` tokens.
    TopP { p: f32, min_keep: usize },
    /// Divide logits by the temperature; `<= 0` keeps only the best token.
    Temperature(f32),
    /// Draw from the softmax of the surviving logits.
    Dist { seed: Option<u64> },
    /// Pick the highest surviving logit.
    Greedy,
}

impl SamplerStage {
    /// Whether this stage selects the final token.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Dist { .. } | Self::Greedy)
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    id: TokenId,
    logit: f32,
    p: f32,
}

/// Builder for custom stage lists.
#[derive(Debug, Default)]
pub struct SamplerChainBuilder {
    stages: Vec<SamplerStage>,
}

impl SamplerChainBuilder {
    /// Append a stage.
    #[must_use]
    pub fn stage(mut self, stage: SamplerStage) -> Self {
        self.stages.push(stage);
        self
    }

    /// Finish the chain.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] if the chain is empty, does not end
    /// in a terminal stage, or has a terminal stage before the end.
    pub fn build(self) -> Result<SamplerChain> {
        let Some(last) = self.stages.last() else {
            return Err(Error::InvalidConfig("sampler chain is empty".into()));
        };
        if !last.is_terminal() {
            return Err(Error::InvalidConfig(
                "sampler chain must end with a dist or greedy stage".into(),
            ));
        }
        if self.stages[..self.stages.len() - 1]
            .iter()
            .any(SamplerStage::is_terminal)
        {
            return Err(Error::InvalidConfig(
                "terminal stage must be the last stage of the chain".into(),
            ));
        }

        let window = self
            .stages
            .iter()
            .filter_map(|s| match s {
                SamplerStage::Penalties { last_n, .. } => Some(*last_n),
                _ => None,
            })
            .max()
            .unwrap_or(0);

        let seed = match last {
            SamplerStage::Dist { seed } => *seed,
            _ => None,
        };

        Ok(SamplerChain {
            stages: self.stages,
            history: VecDeque::with_capacity(window),
            window,
            seed,
            rng: make_rng(seed),
        })
    }
}

fn make_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// Ordered token-selection pipeline with a rolling history of accepted tokens.
#[derive(Debug, Clone)]
pub struct SamplerChain {
    stages: Vec<SamplerStage>,
    history: VecDeque<TokenId>,
    window: usize,
    seed: Option<u64>,
    rng: StdRng,
}

impl SamplerChain {
    /// Start a custom chain.
    #[must_use]
    pub fn builder() -> SamplerChainBuilder {
        SamplerChainBuilder::default()
    }

    /// Build the canonical chain from `params`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] if `params` fails validation.
    pub fn from_params(params: &SamplingParams) -> Result<Self> {
        params.validate()?;
        tracing::info!(
            temperature = params.temperature,
            repeat_penalty = params.repeat_penalty,
            top_k = params.top_k,
            top_p = params.top_p,
            "creating sampler chain"
        );
        Self::builder()
            .stage(SamplerStage::Penalties {
                last_n: params.penalty_window,
                repeat: params.repeat_penalty,
                frequency: 0.0,
                presence: 0.0,
            })
            .stage(SamplerStage::TopK(params.top_k))
            .stage(SamplerStage::TopP {
                p: params.top_p,
                min_keep: 1,
            })
            .stage(SamplerStage::Temperature(params.temperature))
            .stage(SamplerStage::Dist { seed: params.seed })
            .build()
    }

    /// Stages in application order.
    #[must_use]
    pub fn stages(&self) -> &[SamplerStage] {
        &self.stages
    }

    /// Accepted tokens still inside the penalty window, oldest first.
    #[must_use]
    pub fn history(&self) -> &VecDeque<TokenId> {
        &self.history
    }

    /// Sample one token from the context's current output distribution.
    ///
    /// Does not record the token; call [`accept`](Self::accept) once it is
    /// committed to the sequence.
    ///
    /// # Errors
    /// Returns an error if the context has no output logits.
    pub fn sample<C: ModelContext + ?Sized>(&mut self, ctx: &C) -> Result<TokenId> {
        let logits = ctx.output_logits()?;
        self.sample_logits(logits)
    }

    /// Sample one token from raw logits indexed by token id.
    ///
    /// # Errors
    /// Returns an error if `logits` is empty.
    pub fn sample_logits(&mut self, logits: &[f32]) -> Result<TokenId> {
        if logits.is_empty() {
            return Err(Error::Other("cannot sample from an empty distribution".into()));
        }
        #[allow(clippy::cast_possible_truncation)]
        let mut cands: Vec<Candidate> = logits
            .iter()
            .enumerate()
            .map(|(i, &logit)| Candidate {
                id: i as TokenId,
                logit,
                p: 0.0,
            })
            .collect();

        for stage in &self.stages {
            match *stage {
                SamplerStage::Penalties {
                    last_n,
                    repeat,
                    frequency,
                    presence,
                } => apply_penalties(&mut cands, &self.history, last_n, repeat, frequency, presence),
                SamplerStage::TopK(k) => apply_top_k(&mut cands, k),
                SamplerStage::TopP { p, min_keep } => apply_top_p(&mut cands, p, min_keep),
                SamplerStage::Temperature(t) => apply_temperature(&mut cands, t),
                SamplerStage::Dist { .. } => return Ok(draw(&mut cands, &mut self.rng)),
                SamplerStage::Greedy => return Ok(best(&cands).id),
            }
        }
        unreachable!("builder guarantees a terminal stage")
    }

    /// Record a committed token in the penalty history.
    pub fn accept(&mut self, token: TokenId) {
        if self.window == 0 {
            return;
        }
        if self.history.len() == self.window {
            self.history.pop_front();
        }
        self.history.push_back(token);
    }

    /// Forget the history and restart the draw RNG from its seed.
    pub fn reset(&mut self) {
        self.history.clear();
        self.rng = make_rng(self.seed);
    }
}

fn apply_penalties(
    cands: &mut [Candidate],
    history: &VecDeque<TokenId>,
    last_n: usize,
    repeat: f32,
    frequency: f32,
    presence: f32,
) {
    #[allow(clippy::float_cmp)]
    let disabled = last_n == 0 || (repeat == 1.0 && frequency == 0.0 && presence == 0.0);
    if disabled || history.is_empty() {
        return;
    }

    let mut counts: HashMap<TokenId, usize> = HashMap::new();
    for &tok in history.iter().rev().take(last_n) {
        *counts.entry(tok).or_default() += 1;
    }

    for c in cands.iter_mut() {
        let Some(&count) = counts.get(&c.id) else {
            continue;
        };
        if c.logit > 0.0 {
            c.logit /= repeat;
        } else {
            c.logit *= repeat;
        }
        #[allow(clippy::cast_precision_loss)]
        let count = count as f32;
        c.logit -= count * frequency + presence;
    }
}

fn sort_desc(cands: &mut [Candidate]) {
    cands.sort_by(|a, b| b.logit.total_cmp(&a.logit));
}

fn apply_top_k(cands: &mut Vec<Candidate>, k: i32) {
    let Ok(k) = usize::try_from(k) else {
        return;
    };
    if k == 0 || k >= cands.len() {
        return;
    }
    sort_desc(cands);
    cands.truncate(k);
}

/// Sort descending and fill in normalised probabilities.
fn softmax(cands: &mut [Candidate]) {
    sort_desc(cands);
    let max = cands.first().map_or(0.0, |c| c.logit);
    let is_pos_inf = |x: f32| x.is_infinite() && x.is_sign_positive();
    if is_pos_inf(max) {
        // All mass on the infinite logits, shared evenly.
        let n = cands.iter().filter(|c| is_pos_inf(c.logit)).count();
        #[allow(clippy::cast_precision_loss)]
        let share = 1.0 / n as f32;
        for c in cands.iter_mut() {
            c.p = if is_pos_inf(c.logit) { share } else { 0.0 };
        }
        return;
    }
    if !max.is_finite() {
        #[allow(clippy::cast_precision_loss)]
        let uniform = 1.0 / cands.len() as f32;
        for c in cands.iter_mut() {
            c.p = uniform;
        }
        return;
    }
    let mut sum = 0.0f32;
    for c in cands.iter_mut() {
        c.p = (c.logit - max).exp();
        sum += c.p;
    }
    for c in cands.iter_mut() {
        c.p /= sum;
    }
}

fn apply_top_p(cands: &mut Vec<Candidate>, p: f32, min_keep: usize) {
    if p >= 1.0 || cands.is_empty() {
        return;
    }
    softmax(cands);

    let mut cumulative = 0.0f32;
    let mut keep = cands.len();
    for (i, c) in cands.iter().enumerate() {
        cumulative += c.p;
        if cumulative >= p && i + 1 >= min_keep {
            keep = i + 1;
            break;
        }
    }
    cands.truncate(keep);
}

fn apply_temperature(cands: &mut Vec<Candidate>, t: f32) {
    if t <= 0.0 {
        let top = best(cands);
        cands.clear();
        cands.push(top);
        return;
    }
    for c in cands.iter_mut() {
        c.logit /= t;
    }
}

fn best(cands: &[Candidate]) -> Candidate {
    cands
        .iter()
        .copied()
        .reduce(|a, b| if b.logit > a.logit { b } else { a })
        .expect("filters always keep at least one candidate")
}

fn draw(cands: &mut [Candidate], rng: &mut StdRng) -> TokenId {
    softmax(cands);
    let r: f32 = rng.gen();
    let mut cumulative = 0.0f32;
    for c in cands.iter() {
        cumulative += c.p;
        if r < cumulative {
            return c.id;
        }
    }
    // Rounding left the total slightly below r.
    cands[cands.len() - 1].id
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(seed: u64) -> SamplingParams {
        SamplingParams {
            seed: Some(seed),
            ..SamplingParams::default()
        }
    }

    #[test]
    fn default_params_are_valid() {
        SamplingParams::default().validate().unwrap();
    }

    #[test]
    fn rejects_negative_temperature() {
        let p = SamplingParams {
            temperature: -0.1,
            ..SamplingParams::default()
        };
        assert!(matches!(
            SamplerChain::from_params(&p),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn rejects_top_p_out_of_range() {
        for top_p in [0.0, -0.5, 1.01, f32::NAN] {
            let p = SamplingParams {
                top_p,
                ..SamplingParams::default()
            };
            assert!(p.validate().is_err(), "top_p = {top_p} accepted");
        }
        let p = SamplingParams {
            top_p: 1.0,
            ..SamplingParams::default()
        };
        p.validate().unwrap();
    }

    #[test]
    fn rejects_negative_top_k() {
        let p = SamplingParams {
            top_k: -1,
            ..SamplingParams::default()
        };
        assert!(matches!(p.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn canonical_stage_order() {
        let chain = SamplerChain::from_params(&params(1)).unwrap();
        let stages = chain.stages();
        assert_eq!(stages.len(), 5);
        assert!(matches!(
            stages[0],
            SamplerStage::Penalties { last_n: 64, .. }
        ));
        assert!(matches!(stages[1], SamplerStage::TopK(40)));
        assert!(matches!(stages[2], SamplerStage::TopP { min_keep: 1, .. }));
        assert!(matches!(stages[3], SamplerStage::Temperature(_)));
        assert!(matches!(stages[4], SamplerStage::Dist { seed: Some(1) }));
    }

    #[test]
    fn chain_without_draw_stage_is_rejected() {
        let err = SamplerChain::builder()
            .stage(SamplerStage::TopK(5))
            .stage(SamplerStage::Temperature(0.8))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));

        assert!(SamplerChain::builder().build().is_err());

        assert!(SamplerChain::builder()
            .stage(SamplerStage::Greedy)
            .stage(SamplerStage::TopK(5))
            .stage(SamplerStage::Greedy)
            .build()
            .is_err());
    }

    #[test]
    fn infinite_logits_take_all_mass() {
        let mut cands: Vec<Candidate> = [f32::INFINITY, 1.0, f32::INFINITY, 50.0]
            .iter()
            .enumerate()
            .map(|(i, &logit)| Candidate {
                id: i as TokenId,
                logit,
                p: 0.0,
            })
            .collect();
        softmax(&mut cands);

        for c in &cands {
            let expected = if c.id == 0 || c.id == 2 { 0.5 } else { 0.0 };
            assert!((c.p - expected).abs() < 1e-6, "token {} got p = {}", c.id, c.p);
        }

        let mut chain = SamplerChain::builder()
            .stage(SamplerStage::Dist { seed: Some(3) })
            .build()
            .unwrap();
        for _ in 0..32 {
            assert_eq!(chain.sample_logits(&[0.0, f32::INFINITY, 5.0]).unwrap(), 1);
        }
    }

    #[test]
    fn greedy_picks_max() {
        let mut chain = SamplerChain::builder()
            .stage(SamplerStage::Greedy)
            .build()
            .unwrap();
        assert_eq!(chain.sample_logits(&[0.1, 3.0, -1.0, 2.9]).unwrap(), 1);
    }

    #[test]
    fn zero_temperature_is_argmax() {
        let p = SamplingParams {
            temperature: 0.0,
            top_k: 0,
            top_p: 1.0,
            repeat_penalty: 1.0,
            ..params(9)
        };
        let mut chain = SamplerChain::from_params(&p).unwrap();
        for _ in 0..20 {
            assert_eq!(chain.sample_logits(&[1.0, 0.5, 4.0, 3.9]).unwrap(), 2);
        }
    }

    #[test]
    fn top_k_one_is_deterministic() {
        let p = SamplingParams {
            top_k: 1,
            ..params(3)
        };
        let mut chain = SamplerChain::from_params(&p).unwrap();
        for _ in 0..20 {
            assert_eq!(chain.sample_logits(&[0.0, 0.0, 5.0, 1.0]).unwrap(), 2);
        }
    }

    #[test]
    fn top_p_keeps_dominant_token() {
        let mut cands: Vec<Candidate> = [10.0, 0.0, 0.0, 0.0]
            .iter()
            .enumerate()
            .map(|(i, &logit)| Candidate {
                id: i as TokenId,
                logit,
                p: 0.0,
            })
            .collect();
        apply_top_p(&mut cands, 0.9, 1);
        assert_eq!(cands.len(), 1);
        assert_eq!(cands[0].id, 0);
    }

    #[test]
    fn top_p_respects_min_keep() {
        let mut cands: Vec<Candidate> = [10.0, 0.0, 0.0]
            .iter()
            .enumerate()
            .map(|(i, &logit)| Candidate {
                id: i as TokenId,
                logit,
                p: 0.0,
            })
            .collect();
        apply_top_p(&mut cands, 0.5, 2);
        assert_eq!(cands.len(), 2);
    }

    #[test]
    fn repetition_penalty_demotes_recent_token() {
        let mut chain = SamplerChain::builder()
            .stage(SamplerStage::Penalties {
                last_n: 64,
                repeat: 4.0,
                frequency: 0.0,
                presence: 0.0,
            })
            .stage(SamplerStage::Greedy)
            .build()
            .unwrap();

        let logits = [2.0, 1.0];
        assert_eq!(chain.sample_logits(&logits).unwrap(), 0);
        chain.accept(0);
        // 2.0 / 4.0 = 0.5 < 1.0
        assert_eq!(chain.sample_logits(&logits).unwrap(), 1);
    }

    #[test]
    fn negative_logits_are_pushed_down() {
        let mut cands = vec![Candidate {
            id: 0,
            logit: -1.0,
            p: 0.0,
        }];
        let history: VecDeque<TokenId> = [0].into_iter().collect();
        apply_penalties(&mut cands, &history, 64, 2.0, 0.0, 0.0);
        assert!((cands[0].logit - -2.0).abs() < 1e-6);
    }

    #[test]
    fn history_is_bounded_by_window() {
        let mut chain = SamplerChain::from_params(&params(0)).unwrap();
        for tok in 0..100 {
            chain.accept(tok);
        }
        assert_eq!(chain.history().len(), 64);
        assert_eq!(chain.history().front(), Some(&36));
        assert_eq!(chain.history().back(), Some(&99));
    }

    #[test]
    fn identical_seed_and_history_give_identical_tokens() {
        let logits: Vec<Vec<f32>> = (0..32)
            .map(|step| {
                (0..50)
                    .map(|i| ((i * 7 + step * 3) % 11) as f32 * 0.3)
                    .collect()
            })
            .collect();

        let run = || {
            let mut chain = SamplerChain::from_params(&params(1234)).unwrap();
            logits
                .iter()
                .map(|l| {
                    let tok = chain.sample_logits(l).unwrap();
                    chain.accept(tok);
                    tok
                })
                .collect::<Vec<_>>()
        };

        assert_eq!(run(), run());
    }

    #[test]
    fn reset_replays_the_same_draws() {
        let logits: Vec<f32> = (0..20).map(|i| (i % 5) as f32).collect();
        let mut chain = SamplerChain::from_params(&params(77)).unwrap();

        let first: Vec<_> = (0..10)
            .map(|_| {
                let t = chain.sample_logits(&logits).unwrap();
                chain.accept(t);
                t
            })
            .collect();
        chain.reset();
        assert!(chain.history().is_empty());
        let second: Vec<_> = (0..10)
            .map(|_| {
                let t = chain.sample_logits(&logits).unwrap();
                chain.accept(t);
                t
            })
            .collect();

        assert_eq!(first, second);
    }

    #[test]
    fn empty_logits_error() {
        let mut chain = SamplerChain::from_params(&params(0)).unwrap();
        assert!(chain.sample_logits(&[]).is_err());
    }
}
