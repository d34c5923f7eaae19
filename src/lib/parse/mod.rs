//! Incremental, backtracking LR parsing
//!
//! A parser is an ordinary tree value whose payload is a `Parser` record in
//! the arena. It is fed whole token trees through its input queue and can
//! suspend in the middle of a step so the interpreter can run a grammar
//! action; the `Pcr` code says which action and where to resume

use arbor_macros::c_enum;

use crate::{
	arena::Arena,
	error::VmResult,
	pool::*,
	tree::{ Tree, TreeValue, LelId, lel_id },
	vm::runtime::RuntimeData,
};

pub mod input;
pub mod pdarun;

pub use self::{
	input::InputStream,
	pdarun::PdaRun,
};



c_enum! {
	/// Parse tree node flags
	pub pt_flag: u8 {
		/// A whole nonterminal tree standing in for a terminal while on the stack
		TERM_DUP = 1,
		/// Committed; retries below this node were discarded
		COMMITTED = 2,
		/// Sent as a whole tree rather than produced by the parser
		ARTIFICIAL = 4,
		/// A reverse code block is attached
		HAS_RCODE = 8,
	}
}


/// A node of the LR driver's stack and input chain
///
/// The value the grammar sees is the `shadow` tree; the node itself only
/// carries the driver's bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseTree {
	/// The element the driver treats this node as
	pub id: LelId,
	/// `pt_flag` bits
	pub flags: pt_flag::Repr,
	/// The state this node was shifted from, or -1 for none
	pub state: i32,
	/// Number of reductions this node, as lookahead, caused
	pub cause_reduce: u32,
	/// Next alternative to try when this node is shifted again
	pub retry_lower: u32,
	/// Next alternative to try for the reduction that produced this node
	pub retry_upper: u32,
	/// The value, owning one reference
	pub shadow: Option<TreeId>,
	/// The node below on the stack, or after on the input chain
	pub next: Option<ParseTreeId>,
	/// The first child of a reduced node
	pub child: Option<ParseTreeId>,
}

impl ParseTree {
	/// Create a new ParseTree for a value, taking its reference
	pub fn new (id: LelId, shadow: Option<TreeId>) -> Self {
		Self {
			id,
			flags: 0,
			state: -1,
			cause_reduce: 0,
			retry_lower: 0,
			retry_upper: 0,
			shadow,
			next: None,
			child: None,
		}
	}

	/// Determine if a flag is set
	pub fn has (&self, flag: pt_flag::Repr) -> bool {
		self.flags & flag != 0
	}
}



/// Parse continuation codes
///
/// Every suspension point of the driver returns one of these; the
/// interpreter runs the requested action and re-enters with the same code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pcr {
	/// Begin a new step
	Start,
	/// Run a reduction action
	Reduction,
	/// Run a token generation action
	Generation,
	/// Run the action that precedes the end of input
	PreEof,
	/// Replay a reverse code block
	Reverse,
	/// Nothing left to do until more input arrives
	Done,
}

impl Pcr {
	/// Every code, in encoding order
	pub const ALL: [Pcr; 6] = [Pcr::Start, Pcr::Reduction, Pcr::Generation, Pcr::PreEof, Pcr::Reverse, Pcr::Done];

	/// Encode for storage in a stack slot
	pub fn to_int (self) -> i64 {
		self as i64
	}

	/// Decode from a stack slot
	pub fn from_int (value: i64) -> Pcr {
		match usize::try_from(value).ok().and_then(|i| Self::ALL.get(i)) {
			Some(&pcr) => pcr,
			None => panic!("invalid parse continuation code {}", value),
		}
	}
}



/// A parser record: driver state plus its input
#[derive(Debug)]
pub struct Parser {
	/// The LR driver
	pub pda: PdaRun,
	/// Trees waiting to be parsed
	pub input: InputStream,
	/// The tree produced by the last finish
	pub result: Option<TreeId>,
	/// The text of the last parse error, as a string tree
	pub error: Option<TreeId>,
}


/// Everything the driver borrows from the program while it runs
pub struct ParseCx<'a> {
	/// The value arena
	pub arena: &'a mut Arena,
	/// The compiled tables
	pub rtd: &'a RuntimeData,
	/// Whether grammar actions suspend the driver
	pub ctx_dep: bool,
	/// Whether the program is unwinding from `Exit`
	pub induce_exit: bool,
}



impl Arena {
	/// Construct a parser value for entry point `parser` with one reference
	pub fn construct_parser (&mut self, rtd: &RuntimeData, parser: usize) -> VmResult<TreeId> {
		self.parsers.ensure_room()?;
		let pda = PdaRun::new(self, rtd, parser)?;

		let id = self.parsers.alloc(Parser {
			pda,
			input: InputStream::new(),
			result: None,
			error: None,
		})?;

		self.alloc_tree(Tree { refs: 1, value: TreeValue::Parser(id), .. Tree::new(lel_id::PARSER) })
	}

	/// Get the parser record behind a parser value
	pub fn parser_id (&self, tree: TreeId) -> ParserId {
		match self.trees[tree].value {
			TreeValue::Parser(id) => id,
			other => panic!("expected a parser, found {:?}", other),
		}
	}

	/// Release a parse tree node, everything below it, and their values
	pub(crate) fn free_parse_tree (&mut self, node: Option<ParseTreeId>) {
		let mut work: Vec<ParseTreeId> = node.into_iter().collect();

		while let Some(id) = work.pop() {
			let pt = self.parse_trees.free(id);
			self.downref(pt.shadow);

			let mut child = pt.child;
			while let Some(c) = child {
				work.push(c);
				child = self.parse_trees[c].next;
			}
		}
	}

	/// Release a chain of parse tree nodes linked through `next`
	pub(crate) fn free_parse_tree_chain (&mut self, mut node: Option<ParseTreeId>) {
		while let Some(id) = node {
			node = self.parse_trees[id].next;
			self.free_parse_tree(Some(id));
		}
	}

	/// Release a parser record and everything it holds
	pub(crate) fn free_parser (&mut self, id: ParserId) {
		let Parser { mut pda, mut input, result, error } = self.parsers.free(id);

		pda.release(self);
		input.release(self);
		self.downref(result);
		self.downref(error);
	}
}
