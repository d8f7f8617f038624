// BSD 2-Clause License
//
// Copyright (c) 2022, 2023 The atoll developers
//
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
// 1. Redistributions of source code must retain the above copyright
// notice, this list of conditions and the following disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright
// notice, this list of conditions and the following disclaimer in the
// documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT
// LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR
// A PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT
// HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT
// LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE,
// DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY
// THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT
// (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
// OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! Partitions recorded path constraints by input-byte reachability. The
//! forest is a vector indexed by input-byte position; each slot points at
//! the tree holding every constraint that transitively shares an input byte
//! with that position. Adding a constraint that bridges two trees merges
//! them, re-pointing every slot of the absorbed tree.

use std::cell::RefCell;
use std::rc::Rc;

use crate::expr::{DependencySet, Expr};
use crate::log;

pub trait Dependent {
    fn deps(&self) -> &DependencySet;
}

impl Dependent for Expr {
    fn deps(&self) -> &DependencySet {
        Expr::deps(self)
    }
}

pub struct DependencyTree<T> {
    nodes: Vec<Rc<T>>,
    deps: DependencySet,
}

impl<T: Dependent> DependencyTree<T> {
    fn new() -> Self {
        DependencyTree { nodes: Vec::new(), deps: DependencySet::new() }
    }

    fn add_node(&mut self, node: Rc<T>) {
        self.deps.extend(node.deps().iter().copied());
        self.nodes.push(node)
    }

    fn merge(&mut self, other: &DependencyTree<T>) {
        self.nodes.extend(other.nodes.iter().cloned());
        self.deps.extend(other.deps.iter().copied())
    }

    pub fn dependencies(&self) -> &DependencySet {
        &self.deps
    }

    /// Constraints in the order they were recorded.
    pub fn nodes(&self) -> &[Rc<T>] {
        &self.nodes
    }
}

pub type TreeRef<T> = Rc<RefCell<DependencyTree<T>>>;

pub struct DependencyForest<T> {
    forest: Vec<Option<TreeRef<T>>>,
}

impl<T: Dependent> DependencyForest<T> {
    pub fn new(capacity: usize) -> Self {
        let mut forest = Vec::new();
        forest.resize_with(capacity, || None);
        DependencyForest { forest }
    }

    /// The tree covering input byte `index`, creating a fresh one for bytes
    /// not seen before. The forest grows lazily past its initial capacity.
    pub fn find(&mut self, index: usize) -> TreeRef<T> {
        if self.forest.len() <= index {
            self.forest.resize_with(index + 1, || None);
        }
        self.forest[index]
            .get_or_insert_with(|| Rc::new(RefCell::new(DependencyTree::new())))
            .clone()
    }

    pub fn add_node(&mut self, node: Rc<T>) {
        let deps: Vec<usize> = node.deps().iter().copied().collect();
        if deps.is_empty() {
            log!(log::VERBOSE, "dropping constraint with no input dependencies");
            return;
        }

        let mut tree: Option<TreeRef<T>> = None;
        for index in deps {
            let other = self.find(index);
            match &tree {
                None => tree = Some(other),
                Some(tree) if !Rc::ptr_eq(tree, &other) => {
                    tree.borrow_mut().merge(&other.borrow());
                    for &absorbed in other.borrow().dependencies() {
                        self.forest[absorbed] = Some(tree.clone())
                    }
                }
                _ => (),
            }
            self.forest[index] = tree.clone()
        }
        tree.unwrap().borrow_mut().add_node(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeNode {
        deps: DependencySet,
    }

    impl Dependent for FakeNode {
        fn deps(&self) -> &DependencySet {
            &self.deps
        }
    }

    fn node(deps: &[usize]) -> Rc<FakeNode> {
        Rc::new(FakeNode { deps: deps.iter().copied().collect() })
    }

    #[test]
    fn single_tree_per_byte() {
        let mut forest: DependencyForest<FakeNode> = DependencyForest::new(4);
        let n = node(&[1]);
        forest.add_node(n.clone());
        let tree = forest.find(1);
        assert_eq!(tree.borrow().nodes().len(), 1);
        assert!(Rc::ptr_eq(&tree.borrow().nodes()[0], &n));
    }

    #[test]
    fn disjoint_nodes_get_disjoint_trees() {
        let mut forest: DependencyForest<FakeNode> = DependencyForest::new(4);
        forest.add_node(node(&[0]));
        forest.add_node(node(&[2]));
        assert!(!Rc::ptr_eq(&forest.find(0), &forest.find(2)));
    }

    #[test]
    fn bridging_node_merges_trees() {
        let mut forest: DependencyForest<FakeNode> = DependencyForest::new(4);
        forest.add_node(node(&[1]));
        forest.add_node(node(&[2]));
        forest.add_node(node(&[1, 2]));
        let t1 = forest.find(1);
        let t2 = forest.find(2);
        assert!(Rc::ptr_eq(&t1, &t2));
        assert_eq!(t1.borrow().nodes().len(), 3);
        assert!(t1.borrow().dependencies().contains(&1));
        assert!(t1.borrow().dependencies().contains(&2));
    }

    #[test]
    fn forest_grows_lazily() {
        let mut forest: DependencyForest<FakeNode> = DependencyForest::new(1);
        forest.add_node(node(&[100]));
        assert_eq!(forest.find(100).borrow().nodes().len(), 1);
    }

    #[test]
    fn every_slot_of_absorbed_tree_is_repointed() {
        let mut forest: DependencyForest<FakeNode> = DependencyForest::new(8);
        forest.add_node(node(&[0, 1]));
        forest.add_node(node(&[3, 4]));
        forest.add_node(node(&[1, 3]));
        let merged = forest.find(0);
        for index in [0, 1, 3, 4] {
            assert!(Rc::ptr_eq(&merged, &forest.find(index)));
        }
    }
}
