use crate::config::Config;
use crate::counts::TraitCounts;
use crate::model::{Agent, Allele};
use anyhow::{Context, Result, bail};
use rand::prelude::*;
use rand_distr::{Uniform, weighted::WeightedIndex};
use serde::{Deserialize, Serialize};

/// Diagnostic tally of rule applications.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventCounter {
    pub total: u64,
    pub by_locus: Vec<u64>,
    pub last_tick: Option<u64>,
}

impl EventCounter {
    fn new(num_loci: usize) -> Self {
        Self {
            total: 0,
            by_locus: vec![0; num_loci],
            last_tick: None,
        }
    }

    fn record(&mut self, locus: usize, tick: u64) {
        self.total += 1;
        self.by_locus[locus] += 1;
        self.last_tick = Some(tick);
    }
}

/// Fixed set of agents on a static neighbor graph.
///
/// Owns the agents' trait vectors, the adjacency lists and the counter used
/// to hand out never-seen alleles.
pub struct Population {
    agents: Vec<Agent>,
    adjacency: Vec<Vec<usize>>,
    num_loci: usize,
    next_allele: Allele,
    interactions: EventCounter,
    innovations: EventCounter,
}

impl Population {
    /// Create the agents of a population laid out on `adjacency`.
    ///
    /// Every locus of every agent is drawn uniformly from `0..max_init_traits`
    /// and every agent is assigned a rule drawn from the configured mixture.
    ///
    /// # Errors
    /// Returns an error if the graph is empty, does not match the configured
    /// size, or has an agent without neighbors.
    pub fn initialize_population<R: Rng + ?Sized>(
        cfg: &Config,
        adjacency: Vec<Vec<usize>>,
        rng: &mut R,
    ) -> Result<Self> {
        let n_agt = adjacency.len();
        if n_agt == 0 {
            bail!("population graph has no nodes");
        }
        if n_agt != cfg.population.size {
            bail!(
                "population graph has {n_agt} nodes, but the population size is {}",
                cfg.population.size
            );
        }
        if let Some(id) = adjacency.iter().position(|nbrs| nbrs.is_empty()) {
            bail!("agent {id} has no neighbors");
        }

        let num_loci = cfg.population.num_loci;
        let trait_dist = Uniform::new(0, cfg.population.max_init_traits)?;
        let rules = &cfg.model.rules;
        let rule_dist = WeightedIndex::new(rules.iter().map(|entry| entry.weight))?;

        let agents = (0..n_agt)
            .map(|id| {
                let traits = (0..num_loci).map(|_| trait_dist.sample(rng)).collect();
                let rule = rules[rule_dist.sample(rng)].rule;
                Agent::new(id, traits, rule)
            })
            .collect();

        Ok(Self {
            agents,
            adjacency,
            num_loci,
            next_allele: cfg.population.max_init_traits,
            interactions: EventCounter::new(num_loci),
            innovations: EventCounter::new(num_loci),
        })
    }

    pub fn size(&self) -> usize {
        self.agents.len()
    }

    pub fn num_loci(&self) -> usize {
        self.num_loci
    }

    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    pub fn agent(&self, id: usize) -> Result<&Agent> {
        self.agents
            .get(id)
            .with_context(|| format!("agent {id} does not exist"))
    }

    pub fn get_random_agent<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        rng.random_range(0..self.agents.len())
    }

    pub fn get_random_neighbor_for_agent<R: Rng + ?Sized>(
        &self,
        id: usize,
        rng: &mut R,
    ) -> Result<usize> {
        self.get_all_neighbors_for_agent(id)?
            .choose(rng)
            .copied()
            .with_context(|| format!("agent {id} has no neighbors"))
    }

    /// Neighbors of agent `id`, in ascending id order.
    pub fn get_all_neighbors_for_agent(&self, id: usize) -> Result<&[usize]> {
        self.adjacency
            .get(id)
            .map(Vec::as_slice)
            .with_context(|| format!("agent {id} does not exist"))
    }

    pub fn set_trait(&mut self, id: usize, locus: usize, allele: Allele) -> Result<()> {
        let num_loci = self.num_loci;
        let traits = self
            .agents
            .get_mut(id)
            .with_context(|| format!("agent {id} does not exist"))?
            .traits_mut();
        if locus >= num_loci {
            bail!("locus {locus} is out of range for {num_loci} loci");
        }
        traits[locus] = allele;
        Ok(())
    }

    /// Overwrite the whole trait vector of `id` with the one of `source`.
    pub fn copy_traits(&mut self, id: usize, source: usize) -> Result<()> {
        let traits = self.agent(source)?.traits().to_vec();
        self.agents
            .get_mut(id)
            .with_context(|| format!("agent {id} does not exist"))?
            .traits_mut()
            .copy_from_slice(&traits);
        Ok(())
    }

    /// Hand out an allele that has never existed in this population.
    pub fn next_allele(&mut self) -> Allele {
        let allele = self.next_allele;
        self.next_allele += 1;
        allele
    }

    pub fn update_interactions(&mut self, locus: usize, tick: u64) {
        self.interactions.record(locus, tick);
    }

    pub fn update_innovations(&mut self, locus: usize, tick: u64) {
        self.innovations.record(locus, tick);
    }

    pub fn interactions(&self) -> &EventCounter {
        &self.interactions
    }

    pub fn innovations(&self) -> &EventCounter {
        &self.innovations
    }

    /// Census of the alleles and configurations of every agent.
    pub fn trait_counts(&self) -> TraitCounts {
        let mut counts = TraitCounts::new(self.num_loci);
        for agent in &self.agents {
            counts.observe(agent.traits());
        }
        counts
    }

    /// Counts over the agents listed in `ids`.
    pub fn trait_counts_for<I>(&self, ids: I) -> Result<TraitCounts>
    where
        I: IntoIterator<Item = usize>,
    {
        let mut counts = TraitCounts::new(self.num_loci);
        for id in ids {
            counts.observe(self.agent(id)?.traits());
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RuleWeight, Topology};
    use crate::rules::RuleKind;
    use crate::topology;
    use rand_chacha::ChaCha12Rng;

    fn lattice_population(size: usize, num_loci: usize, max_init_traits: u64) -> Population {
        let mut cfg = Config::for_tests(size, num_loci, max_init_traits);
        cfg.population.topology = Topology::SquareLattice { periodic: false };
        let mut rng = ChaCha12Rng::seed_from_u64(1);
        let graph = topology::build_graph(&cfg.population.topology, size, &mut rng).unwrap();
        Population::initialize_population(&cfg, topology::adjacency(&graph), &mut rng).unwrap()
    }

    #[test]
    fn initializes_agents_within_trait_range() {
        let pop = lattice_population(25, 4, 10);
        assert_eq!(pop.size(), 25);
        for agent in pop.agents() {
            assert_eq!(agent.traits().len(), 4);
            assert!(agent.traits().iter().all(|&allele| allele < 10));
            assert_eq!(agent.rule(), RuleKind::Neutral);
        }
    }

    #[test]
    fn initial_richness_is_bounded() {
        let pop = lattice_population(100, 3, 10);
        for richness in pop.trait_counts().richness() {
            assert!(richness <= 10);
        }
        let pop = lattice_population(4, 3, 10);
        for richness in pop.trait_counts().richness() {
            assert!(richness <= 4);
        }
    }

    #[test]
    fn rejects_empty_and_isolated_graphs() {
        let cfg = Config::for_tests(2, 1, 5);
        let mut rng = ChaCha12Rng::seed_from_u64(1);
        assert!(Population::initialize_population(&cfg, vec![], &mut rng).is_err());
        assert!(Population::initialize_population(&cfg, vec![vec![1], vec![]], &mut rng).is_err());
        assert!(Population::initialize_population(&cfg, vec![vec![1], vec![0]], &mut rng).is_ok());
    }

    #[test]
    fn assigns_rules_by_weight() {
        let mut cfg = Config::for_tests(50, 1, 5);
        cfg.model.rules = vec![
            RuleWeight {
                rule: RuleKind::Neutral,
                weight: 0.0,
            },
            RuleWeight {
                rule: RuleKind::Conformist,
                weight: 1.0,
            },
        ];
        let mut rng = ChaCha12Rng::seed_from_u64(1);
        let graph = topology::build_graph(&cfg.population.topology, 50, &mut rng).unwrap();
        let pop =
            Population::initialize_population(&cfg, topology::adjacency(&graph), &mut rng).unwrap();
        assert!(pop.agents().iter().all(|agt| agt.rule() == RuleKind::Conformist));
    }

    #[test]
    fn random_neighbor_is_adjacent() {
        let pop = lattice_population(9, 1, 5);
        let mut rng = ChaCha12Rng::seed_from_u64(9);
        for _ in 0..100 {
            let id = pop.get_random_agent(&mut rng);
            let nbr = pop.get_random_neighbor_for_agent(id, &mut rng).unwrap();
            assert!(pop.get_all_neighbors_for_agent(id).unwrap().contains(&nbr));
        }
        assert!(pop.get_all_neighbors_for_agent(9).is_err());
    }

    #[test]
    fn hands_out_fresh_alleles_and_counts_events() {
        let mut pop = lattice_population(4, 2, 5);
        assert_eq!(pop.next_allele(), 5);
        assert_eq!(pop.next_allele(), 6);

        pop.update_interactions(1, 10);
        pop.update_interactions(1, 11);
        pop.update_innovations(0, 12);
        assert_eq!(pop.interactions().total, 2);
        assert_eq!(pop.interactions().by_locus, vec![0, 2]);
        assert_eq!(pop.interactions().last_tick, Some(11));
        assert_eq!(pop.innovations().by_locus, vec![1, 0]);

        assert!(pop.set_trait(0, 2, 1).is_err());
        pop.set_trait(0, 1, 99).unwrap();
        pop.copy_traits(3, 0).unwrap();
        assert_eq!(pop.agent(3).unwrap().traits(), pop.agent(0).unwrap().traits());
    }
}
