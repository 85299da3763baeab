//! Red-black tree over nodes embedded in an arena.
//!
//! The tree owns no elements. Links live in an [`RbNode`] embedded in the
//! element record, and every operation goes through an [`RbAdapter`] that
//! resolves ids to nodes and keys. This keeps the O(log n) ordered-set
//! behavior of an intrusive tree without reference cycles: the waiter
//! queues, the arbiter/condvar trees and the timer task tree all embed
//! their nodes in the thread arena and address each other by id.
//!
//! Duplicate keys are allowed; an equal key sorts after the nodes already
//! present, so in-order traversal yields equal-keyed nodes in insertion
//! order. The waiter queues rely on this for FIFO behavior at equal
//! priority.

/// Resolves ids to embedded nodes and sort keys.
pub(crate) trait RbAdapter {
	type Id: Copy + PartialEq + core::fmt::Debug;
	type Key: Ord;

	fn node(&self, id: Self::Id) -> &RbNode<Self::Id>;
	fn node_mut(&mut self, id: Self::Id) -> &mut RbNode<Self::Id>;
	fn key(&self, id: Self::Id) -> Self::Key;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
	Red,
	Black,
}

/// Tree links, embedded in the element record.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RbNode<Id> {
	parent: Option<Id>,
	left: Option<Id>,
	right: Option<Id>,
	color: Color,
}

impl<Id> RbNode<Id> {
	pub const fn new() -> Self {
		Self {
			parent: None,
			left: None,
			right: None,
			color: Color::Red,
		}
	}

	fn clear(&mut self) {
		*self = Self::new();
	}
}

impl<Id> Default for RbNode<Id> {
	fn default() -> Self {
		Self::new()
	}
}

/// The tree itself is just a root id and a length; see the module docs.
#[derive(Debug)]
pub(crate) struct RbTree<Id> {
	root: Option<Id>,
	len: usize,
}

impl<Id: Copy + PartialEq + core::fmt::Debug> RbTree<Id> {
	pub const fn new() -> Self {
		Self { root: None, len: 0 }
	}

	pub fn len(&self) -> usize {
		self.len
	}

	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	/// Minimum element.
	pub fn front<A: RbAdapter<Id = Id>>(&self, a: &A) -> Option<Id> {
		self.root.map(|root| Self::subtree_min(a, root))
	}

	/// First element whose key is `>= key`.
	pub fn lower_bound<A: RbAdapter<Id = Id>>(&self, a: &A, key: &A::Key) -> Option<Id> {
		let mut result = None;
		let mut cur = self.root;
		while let Some(c) = cur {
			if a.key(c) < *key {
				cur = a.node(c).right;
			} else {
				result = Some(c);
				cur = a.node(c).left;
			}
		}
		result
	}

	/// In-order successor.
	pub fn next<A: RbAdapter<Id = Id>>(&self, a: &A, id: Id) -> Option<Id> {
		if let Some(right) = a.node(id).right {
			return Some(Self::subtree_min(a, right));
		}

		let mut child = id;
		let mut parent = a.node(id).parent;
		while let Some(p) = parent {
			if a.node(p).left == Some(child) {
				return Some(p);
			}
			child = p;
			parent = a.node(p).parent;
		}
		None
	}

	pub fn insert<A: RbAdapter<Id = Id>>(&mut self, a: &mut A, id: Id) {
		let key = a.key(id);

		// Ordinary binary search tree insertion. An equal key descends to
		// the right, which preserves insertion order among equals.
		let mut parent = None;
		let mut cur = self.root;
		let mut went_left = false;
		while let Some(c) = cur {
			parent = Some(c);
			went_left = key < a.key(c);
			cur = if went_left {
				a.node(c).left
			} else {
				a.node(c).right
			};
		}

		{
			let node = a.node_mut(id);
			node.parent = parent;
			node.left = None;
			node.right = None;
			node.color = Color::Red;
		}
		match parent {
			None => self.root = Some(id),
			Some(p) => {
				if went_left {
					a.node_mut(p).left = Some(id);
				} else {
					a.node_mut(p).right = Some(id);
				}
			}
		}

		self.insert_fixup(a, id);
		self.len += 1;
	}

	pub fn remove<A: RbAdapter<Id = Id>>(&mut self, a: &mut A, z: Id) {
		let (mut x, mut x_parent, removed_color);

		let z_left = a.node(z).left;
		let z_right = a.node(z).right;
		match (z_left, z_right) {
			(None, _) => {
				x = z_right;
				x_parent = a.node(z).parent;
				removed_color = a.node(z).color;
				self.transplant(a, z, z_right);
			}
			(Some(left), None) => {
				x = Some(left);
				x_parent = a.node(z).parent;
				removed_color = a.node(z).color;
				self.transplant(a, z, Some(left));
			}
			(Some(left), Some(right)) => {
				// Two children: splice in the successor.
				let y = Self::subtree_min(a, right);
				removed_color = a.node(y).color;
				x = a.node(y).right;
				if a.node(y).parent == Some(z) {
					x_parent = Some(y);
				} else {
					x_parent = a.node(y).parent;
					self.transplant(a, y, a.node(y).right);
					a.node_mut(y).right = Some(right);
					a.node_mut(right).parent = Some(y);
				}
				self.transplant(a, z, Some(y));
				a.node_mut(y).left = Some(left);
				a.node_mut(left).parent = Some(y);
				a.node_mut(y).color = a.node(z).color;
			}
		}

		if removed_color == Color::Black {
			self.remove_fixup(a, x, x_parent);
		}

		a.node_mut(z).clear();
		self.len -= 1;
	}

	fn subtree_min<A: RbAdapter<Id = Id>>(a: &A, mut id: Id) -> Id {
		while let Some(left) = a.node(id).left {
			id = left;
		}
		id
	}

	/// Replaces the subtree rooted at `u` with the one rooted at `v`.
	fn transplant<A: RbAdapter<Id = Id>>(&mut self, a: &mut A, u: Id, v: Option<Id>) {
		let u_parent = a.node(u).parent;
		match u_parent {
			None => self.root = v,
			Some(p) => {
				if a.node(p).left == Some(u) {
					a.node_mut(p).left = v;
				} else {
					a.node_mut(p).right = v;
				}
			}
		}
		if let Some(v) = v {
			a.node_mut(v).parent = u_parent;
		}
	}

	fn rotate_left<A: RbAdapter<Id = Id>>(&mut self, a: &mut A, x: Id) {
		let y = a.node(x).right.expect("left rotation without right child");
		let y_left = a.node(y).left;

		a.node_mut(x).right = y_left;
		if let Some(yl) = y_left {
			a.node_mut(yl).parent = Some(x);
		}

		let x_parent = a.node(x).parent;
		a.node_mut(y).parent = x_parent;
		match x_parent {
			None => self.root = Some(y),
			Some(p) => {
				if a.node(p).left == Some(x) {
					a.node_mut(p).left = Some(y);
				} else {
					a.node_mut(p).right = Some(y);
				}
			}
		}

		a.node_mut(y).left = Some(x);
		a.node_mut(x).parent = Some(y);
	}

	fn rotate_right<A: RbAdapter<Id = Id>>(&mut self, a: &mut A, x: Id) {
		let y = a.node(x).left.expect("right rotation without left child");
		let y_right = a.node(y).right;

		a.node_mut(x).left = y_right;
		if let Some(yr) = y_right {
			a.node_mut(yr).parent = Some(x);
		}

		let x_parent = a.node(x).parent;
		a.node_mut(y).parent = x_parent;
		match x_parent {
			None => self.root = Some(y),
			Some(p) => {
				if a.node(p).left == Some(x) {
					a.node_mut(p).left = Some(y);
				} else {
					a.node_mut(p).right = Some(y);
				}
			}
		}

		a.node_mut(y).right = Some(x);
		a.node_mut(x).parent = Some(y);
	}

	fn insert_fixup<A: RbAdapter<Id = Id>>(&mut self, a: &mut A, mut z: Id) {
		loop {
			let Some(p) = a.node(z).parent else { break };
			if a.node(p).color == Color::Black {
				break;
			}
			// The parent is red, so it cannot be the root.
			let gp = a.node(p).parent.expect("red node without grandparent");

			if a.node(gp).left == Some(p) {
				let uncle = a.node(gp).right;
				if uncle.is_some_and(|u| a.node(u).color == Color::Red) {
					a.node_mut(p).color = Color::Black;
					a.node_mut(uncle.unwrap()).color = Color::Black;
					a.node_mut(gp).color = Color::Red;
					z = gp;
				} else {
					if a.node(p).right == Some(z) {
						z = p;
						self.rotate_left(a, z);
					}
					let p = a.node(z).parent.unwrap();
					let gp = a.node(p).parent.unwrap();
					a.node_mut(p).color = Color::Black;
					a.node_mut(gp).color = Color::Red;
					self.rotate_right(a, gp);
				}
			} else {
				let uncle = a.node(gp).left;
				if uncle.is_some_and(|u| a.node(u).color == Color::Red) {
					a.node_mut(p).color = Color::Black;
					a.node_mut(uncle.unwrap()).color = Color::Black;
					a.node_mut(gp).color = Color::Red;
					z = gp;
				} else {
					if a.node(p).left == Some(z) {
						z = p;
						self.rotate_right(a, z);
					}
					let p = a.node(z).parent.unwrap();
					let gp = a.node(p).parent.unwrap();
					a.node_mut(p).color = Color::Black;
					a.node_mut(gp).color = Color::Red;
					self.rotate_left(a, gp);
				}
			}
		}

		if let Some(root) = self.root {
			a.node_mut(root).color = Color::Black;
		}
	}

	fn remove_fixup<A: RbAdapter<Id = Id>>(
		&mut self,
		a: &mut A,
		mut x: Option<Id>,
		mut x_parent: Option<Id>,
	) {
		while x != self.root && !x.is_some_and(|n| a.node(n).color == Color::Red) {
			// x is doubly black and not the root, so its parent and a
			// sibling must exist.
			let p = x_parent.expect("doubly black node without parent");
			if a.node(p).left == x {
				let mut w = a.node(p).right.expect("doubly black node without sibling");
				if a.node(w).color == Color::Red {
					a.node_mut(w).color = Color::Black;
					a.node_mut(p).color = Color::Red;
					self.rotate_left(a, p);
					w = a.node(p).right.unwrap();
				}

				let left_black = !a.node(w).left.is_some_and(|n| a.node(n).color == Color::Red);
				let right_black = !a
					.node(w)
					.right
					.is_some_and(|n| a.node(n).color == Color::Red);
				if left_black && right_black {
					a.node_mut(w).color = Color::Red;
					x = Some(p);
					x_parent = a.node(p).parent;
				} else {
					if right_black {
						if let Some(wl) = a.node(w).left {
							a.node_mut(wl).color = Color::Black;
						}
						a.node_mut(w).color = Color::Red;
						self.rotate_right(a, w);
						w = a.node(p).right.unwrap();
					}
					a.node_mut(w).color = a.node(p).color;
					a.node_mut(p).color = Color::Black;
					if let Some(wr) = a.node(w).right {
						a.node_mut(wr).color = Color::Black;
					}
					self.rotate_left(a, p);
					x = self.root;
					x_parent = None;
				}
			} else {
				let mut w = a.node(p).left.expect("doubly black node without sibling");
				if a.node(w).color == Color::Red {
					a.node_mut(w).color = Color::Black;
					a.node_mut(p).color = Color::Red;
					self.rotate_right(a, p);
					w = a.node(p).left.unwrap();
				}

				let left_black = !a.node(w).left.is_some_and(|n| a.node(n).color == Color::Red);
				let right_black = !a
					.node(w)
					.right
					.is_some_and(|n| a.node(n).color == Color::Red);
				if left_black && right_black {
					a.node_mut(w).color = Color::Red;
					x = Some(p);
					x_parent = a.node(p).parent;
				} else {
					if left_black {
						if let Some(wr) = a.node(w).right {
							a.node_mut(wr).color = Color::Black;
						}
						a.node_mut(w).color = Color::Red;
						self.rotate_left(a, w);
						w = a.node(p).left.unwrap();
					}
					a.node_mut(w).color = a.node(p).color;
					a.node_mut(p).color = Color::Black;
					if let Some(wl) = a.node(w).left {
						a.node_mut(wl).color = Color::Black;
					}
					self.rotate_right(a, p);
					x = self.root;
					x_parent = None;
				}
			}
		}

		if let Some(x) = x {
			a.node_mut(x).color = Color::Black;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	struct TestArena {
		nodes: Vec<RbNode<usize>>,
		keys: Vec<u64>,
	}

	impl RbAdapter for TestArena {
		type Id = usize;
		type Key = u64;

		fn node(&self, id: usize) -> &RbNode<usize> {
			&self.nodes[id]
		}

		fn node_mut(&mut self, id: usize) -> &mut RbNode<usize> {
			&mut self.nodes[id]
		}

		fn key(&self, id: usize) -> u64 {
			self.keys[id]
		}
	}

	fn arena(keys: &[u64]) -> TestArena {
		TestArena {
			nodes: vec![RbNode::new(); keys.len()],
			keys: keys.to_vec(),
		}
	}

	fn in_order(tree: &RbTree<usize>, a: &TestArena) -> Vec<usize> {
		let mut out = Vec::new();
		let mut cur = tree.front(a);
		while let Some(id) = cur {
			out.push(id);
			cur = tree.next(a, id);
		}
		out
	}

	/// Checks the red-black invariants: the root is black, no red node has a
	/// red child and every path to a leaf crosses the same number of black
	/// nodes.
	fn check_invariants(tree: &RbTree<usize>, a: &TestArena) {
		fn black_height(a: &TestArena, id: Option<usize>) -> usize {
			let Some(id) = id else { return 1 };
			let node = a.node(id);
			if node.color == Color::Red {
				for child in [node.left, node.right] {
					if let Some(child) = child {
						assert_eq!(a.node(child).color, Color::Black, "red-red violation");
					}
				}
			}
			let lh = black_height(a, node.left);
			let rh = black_height(a, node.right);
			assert_eq!(lh, rh, "black height mismatch at {id}");
			lh + usize::from(node.color == Color::Black)
		}

		if let Some(root) = tree.root {
			assert_eq!(a.node(root).color, Color::Black);
			black_height(a, Some(root));
		}
	}

	#[test]
	fn insert_orders_and_balances() {
		let keys: Vec<u64> = (0..64).map(|i| (i * 2_654_435_761_u64) % 97).collect();
		let mut a = arena(&keys);
		let mut tree = RbTree::new();

		for id in 0..keys.len() {
			tree.insert(&mut a, id);
			check_invariants(&tree, &a);
		}

		let order = in_order(&tree, &a);
		assert_eq!(order.len(), keys.len());
		for pair in order.windows(2) {
			assert!(a.key(pair[0]) <= a.key(pair[1]));
		}
	}

	#[test]
	fn equal_keys_keep_insertion_order() {
		let keys = [5, 5, 5, 3, 5, 7, 5];
		let mut a = arena(&keys);
		let mut tree = RbTree::new();
		for id in 0..keys.len() {
			tree.insert(&mut a, id);
		}

		let fives: Vec<usize> = in_order(&tree, &a)
			.into_iter()
			.filter(|&id| a.key(id) == 5)
			.collect();
		assert_eq!(fives, vec![0, 1, 2, 4, 6]);
	}

	#[test]
	fn remove_keeps_invariants() {
		let keys: Vec<u64> = (0..48).map(|i| (i * 40_503) % 61).collect();
		let mut a = arena(&keys);
		let mut tree = RbTree::new();
		for id in 0..keys.len() {
			tree.insert(&mut a, id);
		}

		// Remove in a scrambled order.
		for step in 0..keys.len() {
			let id = (step * 29) % keys.len();
			tree.remove(&mut a, id);
			check_invariants(&tree, &a);
			assert!(!in_order(&tree, &a).contains(&id));
		}
		assert!(tree.is_empty());
	}

	#[test]
	fn lower_bound_finds_first_match() {
		let keys = [10, 20, 20, 30];
		let mut a = arena(&keys);
		let mut tree = RbTree::new();
		for id in 0..keys.len() {
			tree.insert(&mut a, id);
		}

		assert_eq!(tree.lower_bound(&a, &0), Some(0));
		assert_eq!(tree.lower_bound(&a, &15), Some(1));
		assert_eq!(tree.lower_bound(&a, &20), Some(1));
		assert_eq!(tree.lower_bound(&a, &21), Some(3));
		assert_eq!(tree.lower_bound(&a, &31), None);
	}
}
