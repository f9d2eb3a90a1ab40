use crate::config::Topology;
use anyhow::{Result, bail};
use petgraph::graph::{NodeIndex, UnGraph};
use rand::Rng;

/// Build the neighbor graph of a population of `n` agents.
///
/// Node weights are agent ids, which coincide with node indices.
pub fn build_graph<R: Rng + ?Sized>(
    topology: &Topology,
    n: usize,
    rng: &mut R,
) -> Result<UnGraph<usize, ()>> {
    let graph = match *topology {
        Topology::SquareLattice { periodic } => square_lattice(n, periodic)?,
        Topology::SmallWorld {
            neighbors,
            rewire_prob,
        } => small_world(n, neighbors, rewire_prob, rng)?,
        Topology::Complete => complete(n),
    };
    log::debug!(
        "built {topology:?} graph with {} nodes and {} edges",
        graph.node_count(),
        graph.edge_count()
    );
    Ok(graph)
}

/// Adjacency lists of `graph`, with neighbors sorted by id.
pub fn adjacency(graph: &UnGraph<usize, ()>) -> Vec<Vec<usize>> {
    graph
        .node_indices()
        .map(|node| {
            let mut neighbors: Vec<_> = graph.neighbors(node).map(|nbr| graph[nbr]).collect();
            neighbors.sort_unstable();
            neighbors
        })
        .collect()
}

fn square_lattice(n: usize, periodic: bool) -> Result<UnGraph<usize, ()>> {
    let side = n.isqrt();
    if side * side != n {
        bail!("lattice size {n} is not a perfect square");
    }

    let mut graph = UnGraph::with_capacity(n, 2 * n);
    let nodes: Vec<NodeIndex> = (0..n).map(|i| graph.add_node(i)).collect();
    let node = |row: usize, col: usize| nodes[row * side + col];

    for row in 0..side {
        for col in 0..side {
            if col + 1 < side {
                graph.update_edge(node(row, col), node(row, col + 1), ());
            } else if periodic && side > 2 {
                graph.update_edge(node(row, col), node(row, 0), ());
            }
            if row + 1 < side {
                graph.update_edge(node(row, col), node(row + 1, col), ());
            } else if periodic && side > 2 {
                graph.update_edge(node(row, col), node(0, col), ());
            }
        }
    }

    Ok(graph)
}

fn small_world<R: Rng + ?Sized>(
    n: usize,
    k: usize,
    p: f64,
    rng: &mut R,
) -> Result<UnGraph<usize, ()>> {
    if k < 2 || k % 2 != 0 || k >= n {
        bail!("ring degree must be even and in 2..{n}, but is {k}");
    }

    let mut graph = UnGraph::with_capacity(n, n * k / 2);
    let nodes: Vec<NodeIndex> = (0..n).map(|i| graph.add_node(i)).collect();

    let mut ring = Vec::with_capacity(n * k / 2);
    for i in 0..n {
        for j in 1..=k / 2 {
            let nbr = (i + j) % n;
            graph.update_edge(nodes[i], nodes[nbr], ());
            ring.push((i, nbr));
        }
    }

    // Rewire the far endpoint only, so every agent keeps its k/2 own edges.
    for (source, target) in ring {
        if rng.random::<f64>() >= p {
            continue;
        }
        let Some(edge) = graph.find_edge(nodes[source], nodes[target]) else {
            continue;
        };
        for _ in 0..n {
            let new_target = rng.random_range(0..n);
            if new_target != source && graph.find_edge(nodes[source], nodes[new_target]).is_none()
            {
                graph.remove_edge(edge);
                graph.add_edge(nodes[source], nodes[new_target], ());
                break;
            }
        }
    }

    Ok(graph)
}

fn complete(n: usize) -> UnGraph<usize, ()> {
    let mut graph = UnGraph::with_capacity(n, n * n.saturating_sub(1) / 2);
    let nodes: Vec<NodeIndex> = (0..n).map(|i| graph.add_node(i)).collect();
    for i in 0..n {
        for j in i + 1..n {
            graph.add_edge(nodes[i], nodes[j], ());
        }
    }
    graph
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha12Rng;

    fn degrees(adj: &[Vec<usize>]) -> Vec<usize> {
        adj.iter().map(|nbrs| nbrs.len()).collect()
    }

    #[test]
    fn open_lattice_has_boundary() {
        let graph = square_lattice(9, false).unwrap();
        let adj = adjacency(&graph);
        assert_eq!(degrees(&adj), vec![2, 3, 2, 3, 4, 3, 2, 3, 2]);
        assert_eq!(adj[4], vec![1, 3, 5, 7]);
        assert_eq!(adj[0], vec![1, 3]);
    }

    #[test]
    fn periodic_lattice_wraps() {
        let graph = square_lattice(16, true).unwrap();
        let adj = adjacency(&graph);
        assert!(degrees(&adj).iter().all(|&deg| deg == 4));
        assert_eq!(adj[0], vec![1, 3, 4, 12]);
    }

    #[test]
    fn lattice_rejects_non_square() {
        assert!(square_lattice(10, false).is_err());
    }

    #[test]
    fn small_world_keeps_edges_and_degree() {
        let mut rng = ChaCha12Rng::seed_from_u64(3);
        let graph = small_world(50, 4, 0.3, &mut rng).unwrap();
        assert_eq!(graph.node_count(), 50);
        assert_eq!(graph.edge_count(), 100);

        let adj = adjacency(&graph);
        for (id, nbrs) in adj.iter().enumerate() {
            assert!(nbrs.len() >= 2);
            assert!(!nbrs.contains(&id));
            let mut dedup = nbrs.clone();
            dedup.dedup();
            assert_eq!(&dedup, nbrs);
        }
    }

    #[test]
    fn unrewired_small_world_is_ring() {
        let mut rng = ChaCha12Rng::seed_from_u64(3);
        let graph = small_world(10, 2, 0.0, &mut rng).unwrap();
        let adj = adjacency(&graph);
        assert_eq!(adj[0], vec![1, 9]);
        assert_eq!(adj[5], vec![4, 6]);
    }

    #[test]
    fn complete_graph_connects_all() {
        let adj = adjacency(&complete(5));
        assert!(degrees(&adj).iter().all(|&deg| deg == 4));
        assert_eq!(adj[2], vec![0, 1, 3, 4]);
    }
}
