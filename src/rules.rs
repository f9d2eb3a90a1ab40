use crate::config::Config;
use crate::model::{Allele, SimRng};
use crate::population::Population;
use anyhow::{Context, Result};
use rand::prelude::*;
use rand_distr::Bernoulli;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Kind of interaction rule an agent follows.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Neutral,
    NeutralAllLoci,
    Conformist,
    AntiConformist,
}

impl RuleKind {
    /// Construct the rule of this kind with its parameters taken from `cfg`.
    pub fn construct(self, cfg: &Config) -> Result<Box<dyn InteractionRule>> {
        let rule: Box<dyn InteractionRule> = match self {
            RuleKind::Neutral => Box::new(NeutralCopying),
            RuleKind::NeutralAllLoci => Box::new(NeutralAllLociCopying),
            RuleKind::Conformist => Box::new(FrequencyBiasedCopying::new(
                Bias::Conformist,
                cfg.model.conformism_strength,
            )?),
            RuleKind::AntiConformist => Box::new(FrequencyBiasedCopying::new(
                Bias::AntiConformist,
                cfg.model.anticonformism_strength,
            )?),
        };
        Ok(rule)
    }
}

/// Construct every rule of the configured mixture.
pub fn build_rules(cfg: &Config) -> Result<BTreeMap<RuleKind, Box<dyn InteractionRule>>> {
    cfg.model
        .rules
        .iter()
        .map(|entry| {
            let rule = entry
                .rule
                .construct(cfg)
                .with_context(|| format!("failed to construct {:?} rule", entry.rule))?;
            Ok((entry.rule, rule))
        })
        .collect()
}

/// Transition applied to one focal agent at one tick.
pub trait InteractionRule {
    fn step(
        &self,
        pop: &mut Population,
        focal: usize,
        tick: u64,
        rng: &mut SimRng,
    ) -> Result<()>;
}

/// Copy the allele of a random neighbor at a uniformly random locus.
pub struct NeutralCopying;

impl InteractionRule for NeutralCopying {
    fn step(
        &self,
        pop: &mut Population,
        focal: usize,
        tick: u64,
        rng: &mut SimRng,
    ) -> Result<()> {
        neutral_copy(pop, focal, tick, rng)
    }
}

fn neutral_copy(pop: &mut Population, focal: usize, tick: u64, rng: &mut SimRng) -> Result<()> {
    let nbr = pop.get_random_neighbor_for_agent(focal, rng)?;
    let locus = rng.random_range(0..pop.num_loci());
    let allele = pop.agent(nbr)?.trait_at(locus);
    pop.set_trait(focal, locus, allele)?;
    pop.update_interactions(locus, tick);
    log::trace!("agent {focal} copied allele {allele} at locus {locus} from {nbr}");
    Ok(())
}

/// Copy the whole trait vector of a random neighbor.
pub struct NeutralAllLociCopying;

impl InteractionRule for NeutralAllLociCopying {
    fn step(
        &self,
        pop: &mut Population,
        focal: usize,
        tick: u64,
        rng: &mut SimRng,
    ) -> Result<()> {
        let nbr = pop.get_random_neighbor_for_agent(focal, rng)?;
        pop.copy_traits(focal, nbr)?;
        for locus in 0..pop.num_loci() {
            pop.update_interactions(locus, tick);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bias {
    Conformist,
    AntiConformist,
}

/// Adopt the most (or least) frequent neighbor allele with probability
/// `strength`, or fall back to neutral copying.
pub struct FrequencyBiasedCopying {
    bias: Bias,
    strength_dist: Bernoulli,
}

impl FrequencyBiasedCopying {
    fn new(bias: Bias, strength: f64) -> Result<Self> {
        let strength_dist = Bernoulli::new(strength)
            .with_context(|| format!("invalid copying strength {strength}"))?;
        Ok(Self {
            bias,
            strength_dist,
        })
    }

    fn select(&self, tally: &mut [(Allele, usize)]) -> Option<Allele> {
        // Stable sort: ties keep neighbor enumeration order.
        match self.bias {
            Bias::Conformist => tally.sort_by(|a, b| b.1.cmp(&a.1)),
            Bias::AntiConformist => tally.sort_by(|a, b| a.1.cmp(&b.1)),
        }
        tally.first().map(|&(allele, _)| allele)
    }
}

impl InteractionRule for FrequencyBiasedCopying {
    fn step(
        &self,
        pop: &mut Population,
        focal: usize,
        tick: u64,
        rng: &mut SimRng,
    ) -> Result<()> {
        if !self.strength_dist.sample(rng) {
            return neutral_copy(pop, focal, tick, rng);
        }

        let locus = rng.random_range(0..pop.num_loci());
        let mut tally = tally_neighbors(pop, focal, locus)?;
        let allele = self
            .select(&mut tally)
            .with_context(|| format!("agent {focal} has no neighbors"))?;

        pop.set_trait(focal, locus, allele)?;
        pop.update_interactions(locus, tick);
        log::trace!(
            "agent {focal} adopted allele {allele} at locus {locus} ({:?})",
            self.bias
        );
        Ok(())
    }
}

/// Allele counts at `locus` among the neighbors of `focal`, in order of first appearance.
fn tally_neighbors(pop: &Population, focal: usize, locus: usize) -> Result<Vec<(Allele, usize)>> {
    let mut tally: Vec<(Allele, usize)> = Vec::new();
    for &nbr in pop.get_all_neighbors_for_agent(focal)? {
        let allele = pop.agent(nbr)?.trait_at(locus);
        match tally.iter_mut().find(|(seen, _)| *seen == allele) {
            Some((_, count)) => *count += 1,
            None => tally.push((allele, 1)),
        }
    }
    Ok(tally)
}

/// Infinite-alleles mutation: a random locus receives a never-seen allele.
pub struct InfiniteAllelesMutation;

impl InteractionRule for InfiniteAllelesMutation {
    fn step(
        &self,
        pop: &mut Population,
        focal: usize,
        tick: u64,
        rng: &mut SimRng,
    ) -> Result<()> {
        let locus = rng.random_range(0..pop.num_loci());
        let allele = pop.next_allele();
        pop.set_trait(focal, locus, allele)?;
        pop.update_innovations(locus, tick);
        log::trace!("agent {focal} innovated allele {allele} at locus {locus}");
        Ok(())
    }
}
