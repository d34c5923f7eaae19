//! The segmented operand stack
//!
//! Slots are addressed by absolute index, so saved frame pointers and
//! iterator roots are plain `usize`s. Segments are only ever appended at
//! a `reserve` boundary, which keeps every frame inside one segment

use crate::{
	arena::Arena,
	pool::*,
	vm::iter::{ TreeIter, RevTreeIter, UserIter },
};



/// Offset of the return value slot from a frame pointer
pub const FR_RV: isize = -4;
/// Offset of the return instruction slot from a frame pointer
pub const FR_RI: isize = -3;
/// Offset of the caller's frame pointer from a frame pointer
pub const FR_RFP: isize = -2;
/// Offset of the caller's frame id from a frame pointer
pub const FR_RFD: isize = -1;
/// Number of header slots between arguments and locals
pub const FR_AA: usize = 4;

/// Offset of a user iterator's record from its frame pointer
pub const IFR_REC: isize = -4;
/// Offset of the instruction a yield returns to
pub const IFR_RIN: isize = -3;
/// Offset of the iframe pointer a yield restores
pub const IFR_RIF: isize = -2;
/// Offset of the frame pointer a yield restores
pub const IFR_RFR: isize = -1;


/// The location a reference addresses: a child link or a stack slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cell {
	/// A child link in the arena
	Kid(KidId),
	/// A stack slot holding a tree, usually a local variable
	Slot(usize),
}

/// A rebindable reference, chained to the reference it was reached from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ref {
	/// The addressed location; empty for an exhausted cursor
	pub kid: Option<Cell>,
	/// Stack index of the parent reference
	pub next: Option<usize>,
}


/// A typed operand stack slot
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
	Nil,
	/// Owns one reference
	Tree(TreeId),
	Int(i64),
	/// A saved instruction pointer; `None` returns to the host
	Code(Option<usize>),
	Ref(Ref),
	TreeIter(TreeIter),
	RevTreeIter(RevTreeIter),
	/// A user iterator record, stored in the stack region it controls
	UserIter(UserIter),
	/// A local's handle on the user iterator record at this index
	UserIterAt(usize),
}

impl Slot {
	/// Wrap an optional tree
	pub fn tree (tree: Option<TreeId>) -> Self {
		match tree {
			Some(t) => Slot::Tree(t),
			None => Slot::Nil,
		}
	}

	/// Get the tree in a slot that must hold a tree or nil
	pub fn as_tree (self) -> Option<TreeId> {
		match self {
			Slot::Tree(t) => Some(t),
			Slot::Nil => None,
			other => panic!("expected a tree slot, found {:?}", other),
		}
	}

	/// Get the integer in a slot that must hold one
	pub fn as_int (self) -> i64 {
		match self {
			Slot::Int(i) => i,
			other => panic!("expected an integer slot, found {:?}", other),
		}
	}
}



/// A linked chain of fixed capacity segments with a one deep spare
#[derive(Debug)]
pub struct VmStack {
	segments: Vec<Vec<Slot>>,
	bases: Vec<usize>,
	spare: Option<Vec<Slot>>,
	segment_slots: usize,
}

impl VmStack {
	/// Create a new VmStack with one empty segment
	pub fn new (segment_slots: usize) -> Self {
		let segment_slots = segment_slots.max(1);

		Self {
			segments: vec![Vec::with_capacity(segment_slots)],
			bases: vec![0],
			spare: None,
			segment_slots,
		}
	}

	/// Get the total number of slots in use
	pub fn len (&self) -> usize {
		self.bases[self.bases.len() - 1] + self.top_segment().len()
	}

	/// Determine if there are no slots in use
	pub fn is_empty (&self) -> bool { self.len() == 0 }

	fn top_segment (&self) -> &Vec<Slot> {
		&self.segments[self.segments.len() - 1]
	}

	fn top_segment_mut (&mut self) -> &mut Vec<Slot> {
		let last = self.segments.len() - 1;
		&mut self.segments[last]
	}

	/// Guarantee `n` contiguous slots above the top
	pub fn reserve (&mut self, n: usize) {
		let top = self.top_segment();
		if top.capacity() - top.len() >= n { return }

		let base = self.len();
		let wanted = n.max(self.segment_slots);

		let segment = match self.spare.take() {
			Some(spare) if spare.capacity() >= wanted => spare,
			_ => Vec::with_capacity(wanted),
		};

		self.segments.push(segment);
		self.bases.push(base);
	}

	/// Push a slot, growing if the top segment is full
	pub fn push (&mut self, slot: Slot) {
		self.reserve(1);
		self.top_segment_mut().push(slot);
	}

	/// Push a tree or nil
	pub fn push_tree (&mut self, tree: Option<TreeId>) {
		self.push(Slot::tree(tree))
	}

	/// Remove the top slot
	///
	/// Popping an empty stack is a stack invariant violation
	pub fn pop (&mut self) -> Slot {
		if self.top_segment().is_empty() && self.segments.len() > 1 {
			self.shrink();
		}

		let slot = match self.top_segment_mut().pop() {
			Some(slot) => slot,
			None => panic!("operand stack underflow"),
		};

		if self.top_segment().is_empty() && self.segments.len() > 1 {
			self.shrink();
		}

		slot
	}

	fn shrink (&mut self) {
		self.bases.pop();
		if let Some(segment) = self.segments.pop() {
			self.spare = Some(segment);
		}
	}

	/// Pop a tree or nil, transferring its reference to the caller
	pub fn pop_tree (&mut self) -> Option<TreeId> {
		self.pop().as_tree()
	}

	/// Pop an integer slot
	pub fn pop_int (&mut self) -> i64 {
		self.pop().as_int()
	}

	/// Discard the top `n` slots
	pub fn popn (&mut self, n: usize) {
		for _ in 0..n {
			self.pop();
		}
	}

	/// Discard the top `n` slots, releasing any trees they own
	pub fn pop_release (&mut self, arena: &mut Arena, n: usize) {
		for _ in 0..n {
			if let Slot::Tree(t) = self.pop() {
				arena.downref(Some(t));
			}
		}
	}

	fn locate (&self, index: usize) -> (usize, usize) {
		let seg = self.bases.partition_point(|&base| base <= index) - 1;
		(seg, index - self.bases[seg])
	}

	/// Read the slot at an absolute index
	pub fn get (&self, index: usize) -> Slot {
		let (seg, offset) = self.locate(index);

		match self.segments[seg].get(offset) {
			Some(slot) => *slot,
			None => panic!("stack index {} is above the top ({})", index, self.len()),
		}
	}

	/// Overwrite the slot at an absolute index
	pub fn set (&mut self, index: usize, slot: Slot) {
		let len = self.len();
		let (seg, offset) = self.locate(index);

		match self.segments[seg].get_mut(offset) {
			Some(s) => *s = slot,
			None => panic!("stack index {} is above the top ({})", index, len),
		}
	}

	/// Read the top slot
	pub fn top (&self) -> Slot {
		self.get(self.len() - 1)
	}

	/// Get the (segment count, top segment length) pair
	pub fn shape (&self) -> (usize, usize) {
		(self.segments.len(), self.top_segment().len())
	}
}

impl Default for VmStack { fn default () -> Self { Self::new(crate::config::Config::DEFAULT_SEGMENT_SLOTS) } }


/// Resolve a frame relative offset to an absolute stack index
pub fn frame_slot (fp: usize, offset: isize) -> usize {
	match fp.checked_add_signed(offset) {
		Some(index) => index,
		None => panic!("frame offset {} below the stack base", offset),
	}
}
