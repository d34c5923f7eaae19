//! The parser input queue

use std::collections::VecDeque;

use crate::{
	arena::Arena,
	pool::*,
};



/// A tree waiting in the input queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Queued {
	/// The tree, owning one reference
	pub tree: TreeId,
	/// Whether the tree's generation action, if any, already ran
	pub scanned: bool,
}


/// Pre-tokenized trees waiting to be parsed, plus end of input tracking
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputStream {
	queue: VecDeque<Queued>,
	/// No more input will be appended
	pub eof: bool,
	/// The end of input token is in the parser
	pub eof_sent: bool,
}

impl InputStream {
	/// Create a new empty InputStream
	pub fn new () -> Self { Self::default() }

	/// Get the number of queued trees
	pub fn len (&self) -> usize { self.queue.len() }

	/// Determine if no trees are queued
	pub fn is_empty (&self) -> bool { self.queue.is_empty() }

	/// Add a fresh tree at the back, taking its reference
	pub fn append (&mut self, tree: TreeId) {
		self.queue.push_back(Queued { tree, scanned: false })
	}

	/// Put a tree at the front, taking its reference
	pub fn push_front (&mut self, tree: TreeId, scanned: bool) {
		self.queue.push_front(Queued { tree, scanned })
	}

	/// Look at the front tree
	pub fn front (&self) -> Option<Queued> {
		self.queue.front().copied()
	}

	/// Note that the front tree's generation action has run
	pub fn mark_front_scanned (&mut self) {
		if let Some(front) = self.queue.front_mut() {
			front.scanned = true;
		}
	}

	/// Take the front tree and its reference
	pub fn pull_front (&mut self) -> Option<TreeId> {
		self.queue.pop_front().map(|q| q.tree)
	}

	/// Take the back tree and its reference
	pub fn pop_back (&mut self) -> Option<TreeId> {
		self.queue.pop_back().map(|q| q.tree)
	}

	/// Release every queued tree
	pub fn release (&mut self, arena: &mut Arena) {
		for q in std::mem::take(&mut self.queue) {
			arena.downref(Some(q.tree));
		}
	}
}
