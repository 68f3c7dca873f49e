use crate::core::models::ids::{EntityId, ScoreStateId};
use crate::core::scoring::registry::RestraintRegistry;
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DependencyError {
    #[error("Score states form a dependency cycle involving '{0}'")]
    Cycle(String),
}

/// Orders score states so that every state runs after all states producing its inputs.
///
/// Ties are broken by registration order, so the result is deterministic.
///
/// # Errors
///
/// Returns [`DependencyError::Cycle`] if the producer/consumer relation is cyclic.
pub fn score_state_order(registry: &RestraintRegistry) -> Result<Vec<ScoreStateId>, DependencyError> {
    let states: Vec<_> = registry.score_states().collect();
    let n = states.len();

    let mut producers: HashMap<EntityId, Vec<usize>> = HashMap::new();
    for (i, (_, state)) in states.iter().enumerate() {
        for output in state.outputs() {
            producers.entry(output).or_default().push(i);
        }
    }

    let mut consumers: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut in_degree = vec![0usize; n];
    for (j, (_, state)) in states.iter().enumerate() {
        let mut upstream: Vec<usize> = state
            .inputs()
            .iter()
            .filter_map(|e| producers.get(e))
            .flatten()
            .copied()
            .collect();
        upstream.sort_unstable();
        upstream.dedup();
        for i in upstream {
            consumers[i].push(j);
            in_degree[j] += 1;
        }
    }

    let mut ready: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(i) = ready.pop_front() {
        order.push(states[i].0);
        for &j in &consumers[i] {
            in_degree[j] -= 1;
            if in_degree[j] == 0 {
                ready.push_back(j);
            }
        }
    }

    if order.len() < n {
        let stuck = (0..n)
            .find(|&i| in_degree[i] > 0)
            .map(|i| states[i].1.name().to_string())
            .unwrap_or_default();
        return Err(DependencyError::Cycle(stuck));
    }
    Ok(order)
}

/// Everything that has to be refreshed after a set of entities changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Affected {
    /// Term indices, ascending (registration order).
    pub terms: Vec<usize>,
    /// Score-state positions, ascending (topological order).
    pub states: Vec<usize>,
    /// Close-pair container indices, ascending.
    pub containers: Vec<usize>,
    /// The moved entities followed by every score-state output they reach.
    pub entities: Vec<EntityId>,
}

/// Static read/write dependencies between entities and scoring contributions.
///
/// Nodes are entities, score states, restraint terms and close-pair containers. Edges run
/// from an entity to every state and term that reads it and to every container it belongs
/// to, and from a state to each entity it writes. The graph depends only on declared
/// inputs and outputs, so it stays valid across attribute changes and is rebuilt only
/// when the model's structure changes.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    term_readers: HashMap<EntityId, Vec<usize>>,
    state_readers: HashMap<EntityId, Vec<usize>>,
    state_outputs: Vec<Vec<EntityId>>,
    container_members: HashMap<EntityId, Vec<usize>>,
    always_dirty: Vec<usize>,
    num_terms: usize,
}

impl DependencyGraph {
    /// Builds the graph.
    ///
    /// # Arguments
    ///
    /// * `term_inputs` - Declared inputs of each term; an empty list marks the term as
    ///   always dirty.
    /// * `states` - `(inputs, outputs)` of each score state, in topological order.
    /// * `containers` - Members of each close-pair container.
    pub fn build(
        term_inputs: &[Vec<EntityId>],
        states: &[(Vec<EntityId>, Vec<EntityId>)],
        containers: &[Vec<EntityId>],
    ) -> Self {
        let mut graph = DependencyGraph {
            num_terms: term_inputs.len(),
            ..Default::default()
        };

        for (term, inputs) in term_inputs.iter().enumerate() {
            if inputs.is_empty() {
                graph.always_dirty.push(term);
            }
            for &entity in inputs {
                push_unique(graph.term_readers.entry(entity).or_default(), term);
            }
        }

        for (position, (inputs, outputs)) in states.iter().enumerate() {
            for &entity in inputs {
                push_unique(graph.state_readers.entry(entity).or_default(), position);
            }
            graph.state_outputs.push(outputs.clone());
        }

        for (container, members) in containers.iter().enumerate() {
            for &entity in members {
                push_unique(graph.container_members.entry(entity).or_default(), container);
            }
        }

        graph
    }

    pub fn num_terms(&self) -> usize {
        self.num_terms
    }

    pub fn always_dirty(&self) -> &[usize] {
        &self.always_dirty
    }

    /// Computes everything reachable from `moved`.
    ///
    /// Entities unknown to the graph only pull in the always-dirty terms.
    pub fn affected(&self, moved: &[EntityId]) -> Affected {
        let mut terms: HashSet<usize> = self.always_dirty.iter().copied().collect();
        let mut states: HashSet<usize> = HashSet::new();
        let mut containers: HashSet<usize> = HashSet::new();
        let mut seen: HashSet<EntityId> = HashSet::new();
        let mut entities = Vec::new();

        let mut stack: Vec<EntityId> = moved.iter().rev().copied().collect();
        while let Some(entity) = stack.pop() {
            if !seen.insert(entity) {
                continue;
            }
            entities.push(entity);

            if let Some(readers) = self.term_readers.get(&entity) {
                terms.extend(readers.iter().copied());
            }
            if let Some(members) = self.container_members.get(&entity) {
                containers.extend(members.iter().copied());
            }
            if let Some(readers) = self.state_readers.get(&entity) {
                for &state in readers {
                    if states.insert(state) {
                        stack.extend(self.state_outputs[state].iter().rev().copied());
                    }
                }
            }
        }

        Affected {
            terms: sorted(terms),
            states: sorted(states),
            containers: sorted(containers),
            entities,
        }
    }
}

fn push_unique(list: &mut Vec<usize>, value: usize) {
    if list.last() != Some(&value) {
        list.push(value);
    }
}

fn sorted(set: HashSet<usize>) -> Vec<usize> {
    let mut values: Vec<usize> = set.into_iter().collect();
    values.sort_unstable();
    values
}
