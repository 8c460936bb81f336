//! A dependency graph with stable node ids.
//!
//! Nodes live in a slab; removing a node bumps the generation of its slot so ids of removed nodes
//! never alias a later node, and ids of other nodes stay valid.

/// Identifies a node of a [`DependencyGraph`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

struct Slot<T> {
    generation: u32,
    node: Option<Node<T>>,
}

struct Node<T> {
    data: T,
    /// The nodes this one depends on.
    out: Vec<NodeId>,
    /// The nodes depending on this one.
    inc: Vec<NodeId>,
}

pub struct DependencyGraph<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> DependencyGraph<T> {
    pub fn new() -> Self {
        DependencyGraph {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn add_node(&mut self, data: T) -> NodeId {
        let node = Some(Node {
            data,
            out: Vec::new(),
            inc: Vec::new(),
        });

        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.node = node;
            return NodeId {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            node,
        });

        NodeId {
            index,
            generation: 0,
        }
    }

    fn node(&self, id: NodeId) -> Option<&Node<T>> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }

        slot.node.as_ref()
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut Node<T>> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }

        slot.node.as_mut()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.node(id).is_some()
    }

    pub fn get(&self, id: NodeId) -> Option<&T> {
        self.node(id).map(|node| &node.data)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut T> {
        self.node_mut(id).map(|node| &mut node.data)
    }

    /// Record that `src` depends on `tgt`.
    ///
    /// Returns `false` if either node does not exist. Duplicate edges are ignored.
    pub fn add_edge(&mut self, src: NodeId, tgt: NodeId) -> bool {
        if !self.contains(src) || !self.contains(tgt) {
            return false;
        }

        if let Some(node) = self.node_mut(src) {
            if node.out.contains(&tgt) {
                return true;
            }
            node.out.push(tgt);
        }

        if let Some(node) = self.node_mut(tgt) {
            node.inc.push(src);
        }

        true
    }

    /// Remove a node and all its edges, returning its data.
    pub fn remove_node(&mut self, id: NodeId) -> Option<T> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }

        let node = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.len -= 1;

        for tgt in &node.out {
            if let Some(other) = self.node_mut(*tgt) {
                other.inc.retain(|&src| src != id);
            }
        }

        for src in &node.inc {
            if let Some(other) = self.node_mut(*src) {
                other.out.retain(|&tgt| tgt != id);
            }
        }

        Some(node.data)
    }

    /// The nodes `id` depends on.
    pub fn dependencies(&self, id: NodeId) -> &[NodeId] {
        self.node(id).map_or(&[], |node| &node.out)
    }

    /// The nodes depending on `id`.
    pub fn dependents(&self, id: NodeId) -> &[NodeId] {
        self.node(id).map_or(&[], |node| &node.inc)
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.node.as_ref().map(|_| NodeId {
                index: index as u32,
                generation: slot.generation,
            })
        })
    }

    /// All strongly connected components that contain a cycle.
    ///
    /// This is Tarjan's algorithm with an explicit stack so that long dependency chains do not
    /// exhaust the thread's stack.
    pub fn cycles(&self) -> Vec<Vec<NodeId>> {
        let count = self.slots.len();
        let mut index: Vec<Option<u32>> = vec![None; count];
        let mut low = vec![0u32; count];
        let mut on_stack = vec![false; count];
        let mut stack: Vec<usize> = Vec::new();
        let mut counter = 0u32;
        let mut cycles = Vec::new();

        let id_of = |idx: usize| NodeId {
            index: idx as u32,
            generation: self.slots[idx].generation,
        };

        for root in 0..count {
            if self.slots[root].node.is_none() || index[root].is_some() {
                continue;
            }

            let mut calls: Vec<(usize, usize)> = vec![(root, 0)];
            index[root] = Some(counter);
            low[root] = counter;
            counter += 1;
            stack.push(root);
            on_stack[root] = true;

            while let Some(&(node, pos)) = calls.last() {
                let out = self.dependencies(id_of(node));

                if let Some(next) = out.get(pos) {
                    let top = calls.len() - 1;
                    calls[top].1 += 1;
                    let next = next.index as usize;

                    match index[next] {
                        None => {
                            index[next] = Some(counter);
                            low[next] = counter;
                            counter += 1;
                            stack.push(next);
                            on_stack[next] = true;
                            calls.push((next, 0));
                        }
                        Some(next_index) if on_stack[next] => {
                            low[node] = low[node].min(next_index);
                        }
                        Some(_) => {}
                    }

                    continue;
                }

                calls.pop();
                if let Some(&(parent, _)) = calls.last() {
                    low[parent] = low[parent].min(low[node]);
                }

                if Some(low[node]) != index[node] {
                    continue;
                }

                let mut component = Vec::new();
                while let Some(member) = stack.pop() {
                    on_stack[member] = false;
                    component.push(id_of(member));
                    if member == node {
                        break;
                    }
                }

                let looped = component.len() > 1 || self.dependencies(id_of(node)).contains(&id_of(node));
                if looped {
                    cycles.push(component);
                }
            }
        }

        cycles
    }
}

impl<T> Default for DependencyGraph<T> {
    fn default() -> Self {
        DependencyGraph::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removal_keeps_other_ids() {
        let mut graph = DependencyGraph::new();
        let a = graph.add_node('a');
        let b = graph.add_node('b');
        let c = graph.add_node('c');
        assert!(graph.add_edge(c, b));
        assert!(graph.add_edge(b, a));

        assert_eq!(graph.remove_node(b), Some('b'));
        assert!(!graph.contains(b));
        assert_eq!(graph.get(a), Some(&'a'));
        assert_eq!(graph.get(c), Some(&'c'));
        assert!(graph.dependencies(c).is_empty());
        assert!(graph.dependents(a).is_empty());

        let d = graph.add_node('d');
        assert_ne!(d, b);
        assert_eq!(graph.get(b), None);
        assert!(!graph.add_edge(b, a));
        assert_eq!(graph.len(), 3);
    }

    #[test]
    fn finds_only_cyclic_components() {
        let mut graph = DependencyGraph::new();
        let a = graph.add_node(());
        let b = graph.add_node(());
        let c = graph.add_node(());
        let d = graph.add_node(());
        let e = graph.add_node(());

        graph.add_edge(a, b);
        graph.add_edge(b, c);
        graph.add_edge(c, a);
        graph.add_edge(d, a);
        graph.add_edge(e, e);

        let mut cycles = graph.cycles();
        for cycle in &mut cycles {
            cycle.sort();
        }
        cycles.sort();

        assert_eq!(cycles, vec![vec![a, b, c], vec![e]]);
    }

    #[test]
    fn long_chains_do_not_recurse() {
        let mut graph = DependencyGraph::new();
        let mut prev = graph.add_node(0);
        for i in 1..100_000 {
            let node = graph.add_node(i);
            graph.add_edge(node, prev);
            prev = node;
        }

        assert!(graph.cycles().is_empty());
    }
}
