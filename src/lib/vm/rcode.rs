//! The reverse log
//!
//! Every `Wv` instruction records how to undo itself. Records are grouped
//! into units, one per mutating instruction along with the navigation that
//! located its target. The units of one forward parse step are sealed into
//! a block and attached to the parse tree that step produced, so they can
//! be replayed newest first when the parser backtracks over it

use crate::{
	arena::Arena,
	pool::*,
};



/// A single undo record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevOp {
	// Navigation: pushes the object the terminator acts on //

	/// Push the global record
	LoadGlobal,
	/// Replace the top object with attribute `field` of it
	GetField(u16),
	/// Replace the top list with element `field` of it
	GetListMem(u16),
	/// Push the target of a pointer, owned by the record
	PtrDeref(TreeId),


	// Terminators: pop the object and undo //

	/// Put back the previous occupant of an attribute
	SetField {
		/// The attribute
		field: u16,
		/// The previous occupant, owned by the record
		prev: Option<TreeId>,
	},
	/// Put back the previous occupant of a list element
	SetListMem {
		/// The element index
		field: u16,
		/// The previous occupant, owned by the record
		prev: Option<TreeId>,
	},
	/// Remove the appended element
	ListAppend,
	/// Reattach the removed element
	ListRemoveEnd {
		/// Whether anything was removed
		removed: bool,
		/// The removed element, owned by the record
		value: Option<TreeId>,
	},
	/// Remove the inserted entry
	MapInsert {
		/// Whether the insert happened
		inserted: bool,
		/// The key used, owned by the record
		key: Option<TreeId>,
	},
	/// Remove the stored entry, or put back the value it replaced
	MapStore {
		/// The key used, owned by the record
		key: Option<TreeId>,
		/// `Some` with the displaced value if the key was present
		prev: Option<Option<TreeId>>,
	},
	/// Reinsert the removed entry
	MapRemove {
		/// Whether anything was removed
		removed: bool,
		/// The removed key, owned by the record
		key: Option<TreeId>,
		/// The removed value, owned by the record
		value: Option<TreeId>,
	},
	/// Put back the previous token text
	SetTokenData {
		/// The previous text, owned by the record
		prev: Option<HeadId>,
	},
	/// Remove the tree appended to a parser's input
	InputAppend {
		/// The parser, owned by the record
		parser: TreeId,
	},
	/// Put a pulled tree back at the front of a parser's input, unscanned
	InputPull {
		/// The parser, owned by the record
		parser: TreeId,
		/// The pulled tree, owned by the record
		token: Option<TreeId>,
	},
	/// Remove the tree pushed onto the front of a parser's input
	InputPush {
		/// The parser, owned by the record
		parser: TreeId,
	},
	/// Hand the original left hand side of a reduction back to the parser
	RestoreLhs(TreeId),
	/// Drive a nested parser back to an earlier step
	ParseFrag {
		/// The parser, owned by the record
		parser: TreeId,
		/// The step count to return to
		steps: i64,
		/// Whether the end of input was sent
		finish: bool,
	},
}

impl RevOp {
	/// Determine if this op only locates a target for a later terminator
	pub fn is_navigation (&self) -> bool {
		matches!(self, RevOp::LoadGlobal | RevOp::GetField(_) | RevOp::GetListMem(_) | RevOp::PtrDeref(_))
	}

	/// Give up everything the record owns, without undoing anything
	pub fn release (self, arena: &mut Arena) {
		match self {
			RevOp::LoadGlobal | RevOp::GetField(_) | RevOp::GetListMem(_) | RevOp::ListAppend => { }

			RevOp::PtrDeref(ptr) => arena.downref(Some(ptr)),

			RevOp::SetField { prev, .. }
			| RevOp::SetListMem { prev, .. }
			=> arena.downref(prev),

			RevOp::ListRemoveEnd { value, .. } => arena.downref(value),

			RevOp::MapInsert { key, .. } => arena.downref(key),

			RevOp::MapStore { key, prev } => {
				arena.downref(key);
				arena.downref(prev.flatten());
			}

			RevOp::MapRemove { key, value, .. } => {
				arena.downref(key);
				arena.downref(value);
			}

			RevOp::SetTokenData { prev } => if let Some(head) = prev { arena.free_head(head) },

			RevOp::InputAppend { parser }
			| RevOp::InputPush { parser }
			| RevOp::ParseFrag { parser, .. }
			=> arena.downref(Some(parser)),

			RevOp::InputPull { parser, token } => {
				arena.downref(token);
				arena.downref(Some(parser));
			}

			RevOp::RestoreLhs(tree) => arena.downref(Some(tree)),
		}
	}
}


/// A sealed group of records: navigation followed by one terminator
pub type RevUnit = Vec<RevOp>;



/// Collects the units of the forward step in progress
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReverseLog {
	units: Vec<RevUnit>,
	pending: Vec<RevOp>,
}

impl ReverseLog {
	/// Create a new empty ReverseLog
	pub fn new () -> Self { Self::default() }

	/// Begin a unit, dropping navigation no terminator claimed
	pub fn unit_start (&mut self) {
		self.pending.clear();
	}

	/// Determine if navigation from a root is pending
	///
	/// Only targets reached from the global record or a pointer are logged;
	/// anything else is private to the running code
	pub fn is_rooted (&self) -> bool { !self.pending.is_empty() }

	/// Extend the pending unit with a navigation record
	pub fn push_nav (&mut self, op: RevOp) {
		debug_assert!(op.is_navigation());
		tracing::trace!(target: "arbor::rcode", ?op, "nav");
		self.pending.push(op);
	}

	/// Seal the pending unit with its terminator
	pub fn push_term (&mut self, op: RevOp) {
		tracing::trace!(target: "arbor::rcode", ?op, nav = self.pending.len(), "unit");
		let mut unit = std::mem::take(&mut self.pending);
		unit.push(op);
		self.units.push(unit);
	}

	/// Record a terminator that needs no navigation
	pub fn push_alone (&mut self, op: RevOp) {
		self.pending.clear();
		self.push_term(op);
	}

	/// Determine if nothing has been recorded since the last seal
	pub fn is_empty (&self) -> bool { self.units.is_empty() }

	/// Get the number of sealed units
	pub fn len (&self) -> usize { self.units.len() }

	/// Take the sealed units, newest first
	pub fn take_units (&mut self) -> Vec<RevUnit> {
		self.pending.clear();
		let mut units = std::mem::take(&mut self.units);
		units.reverse();
		units
	}

	/// Give up everything recorded so far
	pub fn release (&mut self, arena: &mut Arena) {
		self.pending.clear();
		for op in std::mem::take(&mut self.units).into_iter().flatten() {
			op.release(arena);
		}
	}
}



/// What a parse tree carries to undo the step that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevBlock {
	/// Marks the bottom of one tree's blocks; replaying it ends the on deck phase
	EndDeck,
	/// The units of one forward step, newest first
	Units(Vec<RevUnit>),
}

impl RevBlock {
	/// Give up everything the block owns
	pub fn release (self, arena: &mut Arena) {
		if let RevBlock::Units(units) = self {
			for op in units.into_iter().flatten() {
				op.release(arena);
			}
		}
	}
}


/// The stack of blocks a parser has attached to its parse trees
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReverseCode {
	blocks: Vec<RevBlock>,
}

impl ReverseCode {
	/// Create a new empty ReverseCode
	pub fn new () -> Self { Self::default() }

	/// Add a block on top
	pub fn push (&mut self, block: RevBlock) {
		self.blocks.push(block)
	}

	/// Take the newest block
	///
	/// The parser only asks for a block when a parse tree is marked as
	/// carrying one, so an empty stack is a defect
	pub fn pop (&mut self) -> RevBlock {
		match self.blocks.pop() {
			Some(block) => block,
			None => panic!("reverse code requested, but none was recorded"),
		}
	}

	/// Get the number of blocks held
	pub fn len (&self) -> usize { self.blocks.len() }

	/// Determine if no blocks are held
	pub fn is_empty (&self) -> bool { self.blocks.is_empty() }

	/// Release every block without replaying it
	pub fn downref_all (&mut self, arena: &mut Arena) {
		for block in std::mem::take(&mut self.blocks) {
			block.release(arena);
		}
	}
}



#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_units_seal_navigation () {
		let mut log = ReverseLog::new();

		log.unit_start();
		log.push_nav(RevOp::LoadGlobal);
		log.push_nav(RevOp::GetField(2));
		log.push_term(RevOp::SetField { field: 0, prev: None });

		log.unit_start();
		log.push_nav(RevOp::LoadGlobal);
		log.unit_start();
		log.push_nav(RevOp::LoadGlobal);
		log.push_term(RevOp::ListAppend);

		assert_eq!(log.len(), 2);

		let units = log.take_units();
		assert_eq!(units[0], vec![RevOp::LoadGlobal, RevOp::ListAppend]);
		assert_eq!(units[1], vec![RevOp::LoadGlobal, RevOp::GetField(2), RevOp::SetField { field: 0, prev: None }]);
		assert!(log.is_empty());
	}

	#[test]
	fn test_alone_drops_stray_navigation () {
		let mut log = ReverseLog::new();
		log.push_nav(RevOp::GetField(0));
		assert!(log.is_rooted());

		let mut arena = Arena::default();
		let parser = arena.construct_int(0).unwrap();
		log.push_alone(RevOp::InputPush { parser });

		assert_eq!(log.take_units(), vec![vec![RevOp::InputPush { parser }]]);

		RevOp::InputPush { parser }.release(&mut arena);
		assert!(arena.leak_report().is_clean());
	}

	#[test]
	fn test_downref_all_releases_held_values () {
		let mut arena = Arena::default();
		let prev = arena.construct_str(b"old").unwrap();
		let key = arena.construct_int(4).unwrap();
		let head = arena.alloc_head(b"text", None).unwrap();

		let mut code = ReverseCode::new();
		code.push(RevBlock::EndDeck);
		code.push(RevBlock::Units(vec![
			vec![RevOp::LoadGlobal, RevOp::SetField { field: 1, prev: Some(prev) }],
			vec![RevOp::MapStore { key: Some(key), prev: Some(None) }],
			vec![RevOp::SetTokenData { prev: Some(head) }],
		]));

		assert_eq!(code.len(), 2);
		code.downref_all(&mut arena);

		assert!(code.is_empty());
		assert!(arena.leak_report().is_clean());
	}

	#[test]
	#[should_panic(expected = "none was recorded")]
	fn test_pop_empty () {
		ReverseCode::new().pop();
	}
}
