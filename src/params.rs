//! Named, gradient-bearing parameters arranged in a tree of nodes.
//!
//! Nodes live in an arena owned by [`ParamTree`] and refer to their children
//! by [`NodeId`]. Traversal is an explicit pre-order stack walk, so the order
//! in which `finish_update` visits parameters is deterministic.

use std::fmt;
use std::ops::{Index, IndexMut};
use std::sync::atomic::{AtomicU64, Ordering};

use ndarray::{ArrayD, ArrayView1, ArrayView2, ArrayViewMut1, ArrayViewMut2, ArrayViewMutD, Ix1, Ix2};

use crate::error::{LstmError, Result};

/// The closed set of parameter slots a node can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParamName {
    /// Gate weights, (4·nO, nO+nI).
    W,
    /// Gate bias, (4·nO,).
    B,
    /// Learned initial hidden state, (nO,).
    InitialHiddens,
    /// Learned initial cell state, (nO,).
    InitialCells,
}

impl ParamName {
    pub const ALL: [ParamName; 4] = [
        ParamName::W,
        ParamName::B,
        ParamName::InitialHiddens,
        ParamName::InitialCells,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ParamName::W => "W",
            ParamName::B => "b",
            ParamName::InitialHiddens => "initial_hiddens",
            ParamName::InitialCells => "initial_cells",
        }
    }

    fn slot(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ParamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static NEXT_TREE_ID: AtomicU64 = AtomicU64::new(0);

/// Address of a node: the owning [`ParamTree`] plus its slot in the arena.
///
/// Ids from different trees never compare equal, so keys stay distinct when
/// one optimizer serves several layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    tree: u64,
    index: usize,
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}/{}", self.tree, self.index)
    }
}

/// Identity of one parameter in a tree, handed to optimizer callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamKey {
    pub node: NodeId,
    pub param: ParamName,
}

impl fmt::Display for ParamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node, self.param)
    }
}

/// A value buffer together with its gradient accumulator.
///
/// Both buffers always have the same shape: the public API only hands out
/// views, never the owned arrays.
#[derive(Clone, Debug)]
pub struct Parameter {
    value: ArrayD<f64>,
    grad: ArrayD<f64>,
}

impl Parameter {
    pub fn new(value: ArrayD<f64>) -> Self {
        let grad = ArrayD::zeros(value.raw_dim());
        Parameter { value, grad }
    }

    pub fn value(&self) -> &ArrayD<f64> {
        &self.value
    }

    pub fn grad(&self) -> &ArrayD<f64> {
        &self.grad
    }

    pub fn value_mut(&mut self) -> ArrayViewMutD<'_, f64> {
        self.value.view_mut()
    }

    pub fn grad_mut(&mut self) -> ArrayViewMutD<'_, f64> {
        self.grad.view_mut()
    }
}

/// One node of the parameter tree.
#[derive(Clone, Debug)]
pub struct ParamNode {
    id: NodeId,
    name: String,
    params: [Option<Parameter>; 4],
    children: Vec<NodeId>,
}

impl ParamNode {
    fn new(id: NodeId, name: String) -> Self {
        ParamNode {
            id,
            name,
            params: [None, None, None, None],
            children: Vec::new(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// Allocates `name` with the given initial value and a zeroed gradient.
    pub fn declare(&mut self, name: ParamName, value: ArrayD<f64>) {
        self.params[name.slot()] = Some(Parameter::new(value));
    }

    pub fn has_param(&self, name: ParamName) -> bool {
        self.params[name.slot()].is_some()
    }

    /// Declared parameters in slot order.
    pub fn params(&self) -> impl Iterator<Item = (ParamName, &Parameter)> + '_ {
        ParamName::ALL
            .into_iter()
            .filter_map(move |name| self.params[name.slot()].as_ref().map(|p| (name, p)))
    }

    pub fn parameter(&self, name: ParamName) -> Result<&Parameter> {
        self.params[name.slot()]
            .as_ref()
            .ok_or_else(|| self.unallocated(name))
    }

    pub fn parameter_mut(&mut self, name: ParamName) -> Result<&mut Parameter> {
        match self.params[name.slot()].as_mut() {
            Some(param) => Ok(param),
            None => Err(LstmError::UnallocatedParameter {
                node: self.name.clone(),
                param: name,
            }),
        }
    }

    pub fn get_param(&self, name: ParamName) -> Result<&ArrayD<f64>> {
        self.parameter(name).map(Parameter::value)
    }

    pub fn get_grad(&self, name: ParamName) -> Result<&ArrayD<f64>> {
        self.parameter(name).map(Parameter::grad)
    }

    /// Value of a 2-d parameter.
    pub fn matrix(&self, name: ParamName) -> Result<ArrayView2<'_, f64>> {
        let value = self.get_param(name)?;
        value
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|_| dimensionality_error(2, value.ndim()))
    }

    /// Value of a 1-d parameter.
    pub fn vector(&self, name: ParamName) -> Result<ArrayView1<'_, f64>> {
        let value = self.get_param(name)?;
        value
            .view()
            .into_dimensionality::<Ix1>()
            .map_err(|_| dimensionality_error(1, value.ndim()))
    }

    pub fn matrix_grad_mut(&mut self, name: ParamName) -> Result<ArrayViewMut2<'_, f64>> {
        let grad = self.parameter_mut(name)?.grad_mut();
        let ndim = grad.ndim();
        grad.into_dimensionality::<Ix2>()
            .map_err(|_| dimensionality_error(2, ndim))
    }

    pub fn vector_grad_mut(&mut self, name: ParamName) -> Result<ArrayViewMut1<'_, f64>> {
        let grad = self.parameter_mut(name)?.grad_mut();
        let ndim = grad.ndim();
        grad.into_dimensionality::<Ix1>()
            .map_err(|_| dimensionality_error(1, ndim))
    }

    fn unallocated(&self, name: ParamName) -> LstmError {
        LstmError::UnallocatedParameter {
            node: self.name.clone(),
            param: name,
        }
    }
}

fn dimensionality_error(expected: usize, got: usize) -> LstmError {
    LstmError::ShapeMismatch {
        context: "parameter dimensionality",
        expected: vec![expected],
        got: vec![got],
    }
}

/// Arena of [`ParamNode`]s rooted at slot 0.
///
/// A clone keeps the original's identity.
#[derive(Clone, Debug)]
pub struct ParamTree {
    id: u64,
    nodes: Vec<ParamNode>,
}

impl ParamTree {
    pub fn new(root_name: impl Into<String>) -> Self {
        let id = NEXT_TREE_ID.fetch_add(1, Ordering::Relaxed);
        ParamTree {
            id,
            nodes: vec![ParamNode::new(NodeId { tree: id, index: 0 }, root_name.into())],
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId { tree: self.id, index: 0 }
    }

    /// Appends a new node under `parent` and returns its id.
    pub fn add_child(&mut self, parent: NodeId, name: impl Into<String>) -> NodeId {
        let id = NodeId {
            tree: self.id,
            index: self.nodes.len(),
        };
        self.nodes.push(ParamNode::new(id, name.into()));
        self[parent].children.push(id);
        id
    }

    /// Fresh pre-order traversal starting at the root.
    pub fn walk(&self) -> Walk<'_> {
        Walk {
            tree: self,
            stack: vec![self.root()],
        }
    }

    /// Presents every (parameter, gradient) pair to `callback` once, in walk
    /// order, then zeroes the gradient. Returns the number of pairs visited.
    pub fn finish_update<F>(&mut self, mut callback: F) -> usize
    where
        F: FnMut(ParamKey, ArrayViewMutD<'_, f64>, ArrayViewMutD<'_, f64>),
    {
        let ids: Vec<NodeId> = self.walk().map(ParamNode::id).collect();
        let mut drained = 0;
        for id in ids {
            for slot in self[id].params.iter_mut().zip(ParamName::ALL) {
                if let (Some(param), name) = slot {
                    let key = ParamKey { node: id, param: name };
                    callback(key, param.value.view_mut(), param.grad.view_mut());
                    param.grad.fill(0.0);
                    drained += 1;
                }
            }
        }
        drained
    }
}

impl Index<NodeId> for ParamTree {
    type Output = ParamNode;

    fn index(&self, id: NodeId) -> &ParamNode {
        debug_assert_eq!(id.tree, self.id, "node {} belongs to another tree", id);
        &self.nodes[id.index]
    }
}

impl IndexMut<NodeId> for ParamTree {
    fn index_mut(&mut self, id: NodeId) -> &mut ParamNode {
        debug_assert_eq!(id.tree, self.id, "node {} belongs to another tree", id);
        &mut self.nodes[id.index]
    }
}

/// Pre-order iterator over the nodes of a [`ParamTree`].
pub struct Walk<'a> {
    tree: &'a ParamTree,
    stack: Vec<NodeId>,
}

impl<'a> Iterator for Walk<'a> {
    type Item = &'a ParamNode;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.stack.pop()?;
        let node = &self.tree[id];
        self.stack.extend(node.children.iter().rev());
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, Array2, IxDyn};

    fn sample_tree() -> ParamTree {
        let mut tree = ParamTree::new("root");
        let root = tree.root();
        let a = tree.add_child(root, "a");
        tree.add_child(a, "a0");
        tree.add_child(a, "a1");
        let b = tree.add_child(root, "b");
        tree[b].declare(ParamName::B, Array1::from(vec![1.0, 2.0]).into_dyn());
        tree
    }

    #[test]
    fn test_walk_is_preorder_and_restartable() {
        let tree = sample_tree();
        let names: Vec<&str> = tree.walk().map(ParamNode::name).collect();
        assert_eq!(names, vec!["root", "a", "a0", "a1", "b"]);
        assert_eq!(tree.walk().count(), 5);
    }

    #[test]
    fn test_unallocated_lookup_is_an_error() {
        let tree = sample_tree();
        let root = &tree[tree.root()];
        assert!(!root.has_param(ParamName::W));
        assert!(matches!(
            root.get_param(ParamName::W),
            Err(LstmError::UnallocatedParameter { param: ParamName::W, .. })
        ));
    }

    #[test]
    fn test_typed_accessors_check_dimensionality() {
        let mut node = ParamNode::new(ParamTree::new("t").root(), "n".to_string());
        node.declare(ParamName::W, Array2::<f64>::zeros((3, 2)).into_dyn());
        assert_eq!(node.matrix(ParamName::W).unwrap().dim(), (3, 2));
        assert!(node.vector(ParamName::W).is_err());
        assert_eq!(node.get_grad(ParamName::W).unwrap().shape(), &[3, 2]);
    }

    #[test]
    fn test_finish_update_visits_each_param_once_and_zeroes() {
        let mut tree = sample_tree();
        let b = tree.walk().nth(4).map(ParamNode::id).unwrap();
        tree[b]
            .vector_grad_mut(ParamName::B)
            .unwrap()
            .fill(0.5);

        let mut seen = Vec::new();
        let drained = tree.finish_update(|key, mut value, grad| {
            value -= &grad;
            seen.push(key);
        });

        assert_eq!(drained, 1);
        assert_eq!(seen, vec![ParamKey { node: b, param: ParamName::B }]);
        let value = tree[b].get_param(ParamName::B).unwrap();
        assert_eq!(value, &ArrayD::from_shape_vec(IxDyn(&[2]), vec![0.5, 1.5]).unwrap());
        assert!(tree[b].get_grad(ParamName::B).unwrap().iter().all(|&g| g == 0.0));
    }

    #[test]
    fn test_node_ids_differ_between_trees() {
        let first = sample_tree();
        let second = sample_tree();
        let keys = |tree: &ParamTree| -> Vec<NodeId> { tree.walk().map(ParamNode::id).collect() };

        assert_eq!(keys(&first).len(), keys(&second).len());
        for (a, b) in keys(&first).into_iter().zip(keys(&second)) {
            assert_ne!(a, b);
        }
        assert_eq!(first.clone().root(), first.root());
    }
}
