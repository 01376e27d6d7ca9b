use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::debug;

use crate::ir::spec::OpId;
use crate::passes::reduce_transposes::discovery::Analysis;

/// Seeds that must be rewritten together, with indices into the [`Analysis`] records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Component {
    pub seeds: BTreeSet<OpId>,
    pub absorbed: Vec<usize>,
    pub cancellations: Vec<usize>,
    pub materializations: Vec<usize>,
}

impl Component {
    pub(crate) fn removed(&self) -> usize {
        self.seeds.len() + self.cancellations.len()
    }

    pub(crate) fn inserted(&self) -> usize {
        self.materializations.len()
    }

    pub(crate) fn is_profitable(&self) -> bool {
        self.removed() > self.inserted()
    }
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
        }
    }

    fn find(&mut self, mut node: usize) -> usize {
        while self.parent[node] != node {
            self.parent[node] = self.parent[self.parent[node]];
            node = self.parent[node];
        }
        node
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[ra.max(rb)] = ra.min(rb);
        }
    }

    fn union_all(&mut self, nodes: impl IntoIterator<Item = usize>) {
        let mut nodes = nodes.into_iter();
        if let Some(first) = nodes.next() {
            for node in nodes {
                self.union(first, node);
            }
        }
    }
}

/// Groups seeds into components: seeds meeting in one absorbed op, one
/// cancellation, or one materializing consumer are rewritten together.
pub(crate) fn components(analysis: &Analysis) -> Vec<Component> {
    let index: HashMap<OpId, usize> = analysis
        .seeds
        .iter()
        .enumerate()
        .map(|(idx, seed)| (*seed, idx))
        .collect();
    let mut uf = UnionFind::new(analysis.seeds.len());
    let lookup = |seeds: &BTreeSet<OpId>| -> Vec<usize> {
        seeds.iter().filter_map(|seed| index.get(seed).copied()).collect()
    };

    for record in &analysis.absorbed {
        uf.union_all(lookup(&record.seeds));
    }
    for record in &analysis.cancellations {
        uf.union_all(lookup(&record.seeds));
    }
    let mut by_consumer: HashMap<OpId, Vec<usize>> = HashMap::new();
    for record in &analysis.materializations {
        let members = lookup(&record.seeds);
        if let Some(op) = record.consumer_op() {
            by_consumer.entry(op).or_default().extend(members.iter().copied());
        }
        uf.union_all(members);
    }
    for members in by_consumer.into_values() {
        uf.union_all(members);
    }

    let mut grouped: BTreeMap<usize, Component> = BTreeMap::new();
    let root_of = |seeds: &BTreeSet<OpId>, uf: &mut UnionFind| {
        seeds
            .iter()
            .find_map(|seed| index.get(seed).copied())
            .map(|idx| uf.find(idx))
    };
    for (idx, record) in analysis.absorbed.iter().enumerate() {
        if let Some(root) = root_of(&record.seeds, &mut uf) {
            grouped.entry(root).or_default().absorbed.push(idx);
        }
    }
    for (idx, record) in analysis.cancellations.iter().enumerate() {
        if let Some(root) = root_of(&record.seeds, &mut uf) {
            grouped.entry(root).or_default().cancellations.push(idx);
        }
    }
    for (idx, record) in analysis.materializations.iter().enumerate() {
        if let Some(root) = root_of(&record.seeds, &mut uf) {
            grouped.entry(root).or_default().materializations.push(idx);
        }
    }
    for (idx, seed) in analysis.seeds.iter().enumerate() {
        let root = uf.find(idx);
        if let Some(component) = grouped.get_mut(&root) {
            component.seeds.insert(*seed);
        }
    }
    grouped.into_values().collect()
}

/// Components whose rewrite removes more transposes than it inserts.
pub(crate) fn accepted_components(analysis: &Analysis) -> Vec<Component> {
    components(analysis)
        .into_iter()
        .filter(|component| {
            let accepted = component.is_profitable();
            debug!(
                seeds = ?component.seeds,
                removed = component.removed(),
                inserted = component.inserted(),
                accepted,
                "transpose candidate"
            );
            accepted
        })
        .collect()
}
