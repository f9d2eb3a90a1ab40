use crate::rules::RuleKind;
use rand_chacha::ChaCha12Rng;
use serde::{Deserialize, Serialize};

/// Trait value held at one locus (infinite-alleles model).
pub type Allele = u64;

/// Random number generator threaded through every draw of a run.
pub type SimRng = ChaCha12Rng;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    id: usize,

    traits: Vec<Allele>,

    rule: RuleKind,
}

impl Agent {
    pub fn new(id: usize, traits: Vec<Allele>, rule: RuleKind) -> Self {
        Self { id, traits, rule }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn traits(&self) -> &[Allele] {
        &self.traits
    }

    pub fn trait_at(&self, locus: usize) -> Allele {
        self.traits[locus]
    }

    pub fn rule(&self) -> RuleKind {
        self.rule
    }

    pub(crate) fn traits_mut(&mut self) -> &mut [Allele] {
        &mut self.traits
    }
}
