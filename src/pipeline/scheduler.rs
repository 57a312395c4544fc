// Topological scheduler - turns the dependency graph into an operation plan
// Deletes run first (child-before-parent), then inserts/updates
// (parent-before-child); ties break on submission order so plans are
// deterministic and testable.

use crate::changeset::{ChangeKind, EntityDescriptor};
use crate::error::{PipelineResult, SaveError};
use crate::pipeline::graph::DependencyGraph;
use crate::store::StoreAction;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use tracing::debug;

/// One scheduled store write.
#[derive(Debug, Clone, Copy)]
pub struct PlanStep {
    pub index: usize,
    pub action: StoreAction,
}

/// The immutable ordered plan for one request.
#[derive(Debug, Default)]
pub struct OperationPlan {
    pub steps: Vec<PlanStep>,
    /// Unchanged descriptors carried for graph completeness; no store action.
    pub passthrough: Vec<usize>,
    // predecessor -> successors, from the ordering constraints actually used
    dependents: HashMap<usize, Vec<usize>>,
}

impl OperationPlan {
    /// Everything that transitively depends on `index` persisting. Used to
    /// cascade a veto to entities whose own write would be orphaned.
    pub fn transitive_dependents(&self, index: usize) -> Vec<usize> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([index]);
        let mut out = Vec::new();
        while let Some(current) = queue.pop_front() {
            for &next in self.dependents.get(&current).into_iter().flatten() {
                if seen.insert(next) {
                    out.push(next);
                    queue.push_back(next);
                }
            }
        }
        out
    }
}

/// Compute the operation plan. Fails with `CyclicDependency` when a true
/// cycle exists among Added rows (inserts) or Deleted rows (deletes).
pub fn schedule(
    descriptors: &[EntityDescriptor],
    graph: &DependencyGraph,
) -> PipelineResult<OperationPlan> {
    let deletes: Vec<usize> = indices_of(descriptors, |d| d.change_kind == ChangeKind::Deleted);
    let upserts: Vec<usize> = indices_of(descriptors, |d| {
        d.change_kind != ChangeKind::Deleted && d.is_write()
    });
    let passthrough: Vec<usize> = indices_of(descriptors, |d| !d.is_write());

    let delete_constraints = graph.delete_constraints();
    let insert_constraints = graph.insert_constraints(descriptors);

    let mut steps = Vec::with_capacity(deletes.len() + upserts.len());
    for index in stable_topo(&deletes, &delete_constraints, descriptors)? {
        steps.push(PlanStep {
            index,
            action: StoreAction::Delete,
        });
    }
    for index in stable_topo(&upserts, &insert_constraints, descriptors)? {
        let action = match descriptors[index].change_kind {
            ChangeKind::Added => StoreAction::Insert,
            _ => StoreAction::Update,
        };
        steps.push(PlanStep { index, action });
    }

    let mut dependents: HashMap<usize, Vec<usize>> = HashMap::new();
    for (pred, succ) in delete_constraints.iter().chain(insert_constraints.iter()) {
        dependents.entry(*pred).or_default().push(*succ);
    }

    debug!(
        steps = steps.len(),
        passthrough = passthrough.len(),
        "operation plan scheduled"
    );
    Ok(OperationPlan {
        steps,
        passthrough,
        dependents,
    })
}

fn indices_of(
    descriptors: &[EntityDescriptor],
    predicate: impl Fn(&EntityDescriptor) -> bool,
) -> Vec<usize> {
    descriptors
        .iter()
        .enumerate()
        .filter(|(_, d)| predicate(d))
        .map(|(i, _)| i)
        .collect()
}

// Kahn's algorithm with a min-heap on submission order: among ready nodes the
// earliest-submitted always schedules next.
fn stable_topo(
    nodes: &[usize],
    constraints: &[(usize, usize)],
    descriptors: &[EntityDescriptor],
) -> PipelineResult<Vec<usize>> {
    let node_set: HashSet<usize> = nodes.iter().copied().collect();
    let mut in_degree: HashMap<usize, usize> = nodes.iter().map(|&n| (n, 0)).collect();
    let mut successors: HashMap<usize, Vec<usize>> = HashMap::new();
    for &(pred, succ) in constraints {
        if !node_set.contains(&pred) || !node_set.contains(&succ) {
            continue;
        }
        *in_degree.get_mut(&succ).expect("successor is a plan node") += 1;
        successors.entry(pred).or_default().push(succ);
    }

    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .filter(|(_, &degree)| degree == 0)
        .map(|(&node, _)| Reverse(node))
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(Reverse(node)) = ready.pop() {
        order.push(node);
        for &succ in successors.get(&node).into_iter().flatten() {
            let degree = in_degree.get_mut(&succ).expect("successor is a plan node");
            *degree -= 1;
            if *degree == 0 {
                ready.push(Reverse(succ));
            }
        }
    }

    if order.len() != nodes.len() {
        let mut stuck: Vec<String> = in_degree
            .iter()
            .filter(|(_, &degree)| degree > 0)
            .map(|(&node, _)| descriptors[node].label())
            .collect();
        stuck.sort();
        return Err(SaveError::CyclicDependency(stuck));
    }
    Ok(order)
}
