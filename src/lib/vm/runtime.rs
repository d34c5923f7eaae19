//! Compiled program side tables
//!
//! Everything in here is produced by the grammar compiler and handed to
//! `Program::new` as an opaque, read only description of the program

use std::collections::BTreeMap;

use crate::{
	error::{ VmError, VmResult },
	tree::{ LelId, lel_id },
};



/// Describes one language element (a type of tree)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LangElInfo {
	/// Display name, used in diagnostics
	pub name: String,
	/// Whether this is a repeat (`x*`) nonterminal
	pub repeat: bool,
	/// Whether this is a list (`x+`) nonterminal
	pub list: bool,
	/// Whether this is a literal token
	pub literal: bool,
	/// Generation action for tokens; attached to tokens only
	pub frame_id: Option<usize>,
	/// Number of attribute slots preceding the syntactic children
	pub object_length: usize,
	/// Nonterminal a terminal stands in for when sent as a whole tree
	pub term_dup_id: Option<LelId>,
}

/// Describes one production of the grammar
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProdInfo {
	/// Display name
	pub name: String,
	/// The nonterminal this production reduces to
	pub lhs_id: LelId,
	/// Index of this production among the alternatives of `lhs_id`
	pub prod_num: u16,
	/// Number of right hand side elements
	pub length: usize,
	/// Reduction action, if any
	pub frame_id: Option<usize>,
	/// Whether the reduction action keeps the original left hand side
	/// so that a replaced one can be restored on backtracking
	pub lhs_upref: bool,
}

/// Describes one compiled function, reduction or generation action
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FrameInfo {
	/// Display name
	pub name: String,
	/// Offset of the committing body in the code block
	pub code_wc: usize,
	/// Offset of the reverting body in the code block
	pub code_wv: usize,
	/// Number of argument slots pushed by the caller
	pub arg_size: usize,
	/// Number of local slots; trees left in them are released when the frame is popped
	pub frame_size: usize,
}

/// Describes one parser entry point
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParserInfo {
	/// Display name
	pub name: String,
	/// The LR start state
	pub start_state: usize,
	/// Id of the end of input token
	pub eof_lel_id: LelId,
	/// Action run before the end of input token is sent
	pub eof_frame_id: Option<usize>,
}

/// Describes one pattern or construction template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PatternInfo {
	/// Root node in `RuntimeData::pattern_nodes`
	pub offset: usize,
	/// Number of binding ids used by the pattern
	pub num_bindings: usize,
}

/// One node of a pattern or template
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PatternNode {
	/// Required type
	pub id: LelId,
	/// Production of constructed nonterminals
	pub prod_num: u16,
	/// Next sibling node
	pub next: Option<usize>,
	/// First child node
	pub child: Option<usize>,
	/// Binding id, or zero
	pub bind_id: usize,
	/// Required (or constructed) token text
	pub data: Option<Vec<u8>>,
	/// Match this node without looking at its children
	pub stop: bool,
}



/// A single parse action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
	/// Push the input onto the stack
	Shift,
	/// Reduce by a production
	Reduce(usize),
	/// Shift, then immediately reduce
	ShiftReduce(usize),
}

impl Action {
	/// Shift bit of an encoded action
	pub const SHIFT_BIT: u32 = 1;
	/// Reduce bit of an encoded action
	pub const REDUCE_BIT: u32 = 2;

	/// Encode an action the way the action table stores it
	pub fn encode (self) -> u32 {
		match self {
			Action::Shift => Self::SHIFT_BIT,
			Action::Reduce(prod) => ((prod as u32) << 2) | Self::REDUCE_BIT,
			Action::ShiftReduce(prod) => ((prod as u32) << 2) | Self::REDUCE_BIT | Self::SHIFT_BIT,
		}
	}
}


/// LR tables in the compressed layout the driver reads
///
/// `keys` holds an inclusive id range per state; `offsets` locates a state's
/// row in `owners`/`indicies`; an index names a transition whose target,
/// alternative action list and commit flag live in `targs`, `act_inds` and
/// `commit_len`. Action lists are zero terminated
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PdaTables {
	pub keys: Vec<LelId>,
	pub offsets: Vec<usize>,
	pub owners: Vec<usize>,
	pub indicies: Vec<i32>,
	pub targs: Vec<usize>,
	pub act_inds: Vec<usize>,
	pub actions: Vec<u32>,
	pub commit_len: Vec<u8>,
	pub num_states: usize,
}

impl PdaTables {
	/// Find the transition index for `id` in `state`, if there is one
	pub fn transition (&self, state: usize, id: LelId) -> Option<usize> {
		let (low, high) = (self.keys[state * 2], self.keys[state * 2 + 1]);
		if id < low || id > high { return None }

		let ind_pos = self.offsets[state] + (id - low) as usize;
		if self.owners[ind_pos] != state { return None }

		usize::try_from(self.indicies[ind_pos]).ok()
	}
}


#[derive(Debug, Clone)]
struct Transition {
	target: usize,
	actions: Vec<Action>,
	commit: bool,
}

/// Builds `PdaTables` from explicit transitions
#[derive(Debug, Clone, Default)]
pub struct PdaTablesBuilder {
	transitions: BTreeMap<(usize, LelId), Transition>,
	num_states: usize,
}

impl PdaTablesBuilder {
	/// Create a new empty PdaTablesBuilder
	pub fn new () -> Self { Self::default() }

	/// Add a transition on `id` out of `state` with ordered alternative actions
	pub fn transition (&mut self, state: usize, id: LelId, target: usize, actions: &[Action]) -> &mut Self {
		self.num_states = self.num_states.max(state + 1).max(target + 1);
		self.transitions.insert((state, id), Transition { target, actions: actions.to_vec(), commit: false });
		self
	}

	/// Shorthand for a shift-only transition
	pub fn shift (&mut self, state: usize, id: LelId, target: usize) -> &mut Self {
		self.transition(state, id, target, &[Action::Shift])
	}

	/// Shorthand for a reduce-only transition
	pub fn reduce (&mut self, state: usize, id: LelId, prod: usize) -> &mut Self {
		self.transition(state, id, state, &[Action::Reduce(prod)])
	}

	/// Mark an existing transition as a commit point
	pub fn commit (&mut self, state: usize, id: LelId) -> &mut Self {
		if let Some(trans) = self.transitions.get_mut(&(state, id)) {
			trans.commit = true;
		}

		self
	}

	/// Lay the transitions out into tables
	pub fn build (&self) -> PdaTables {
		let mut tables = PdaTables { num_states: self.num_states, .. PdaTables::default() };

		for state in 0..self.num_states {
			let row: Vec<(LelId, &Transition)> = self.transitions
				.range((state, 0)..=(state, LelId::MAX))
				.map(|(&(_, id), trans)| (id, trans))
				.collect();

			tables.offsets.push(tables.indicies.len());

			let (low, high) = match (row.first(), row.last()) {
				(Some(&(low, _)), Some(&(high, _))) => (low, high),
				_ => {
					// an empty range: low > high
					tables.keys.extend_from_slice(&[1, 0]);
					continue
				}
			};

			tables.keys.extend_from_slice(&[low, high]);

			let start = tables.indicies.len();
			tables.indicies.resize(start + (high - low) as usize + 1, -1);
			tables.owners.resize(start + (high - low) as usize + 1, state);

			for (id, trans) in row {
				let pos = tables.targs.len();
				tables.indicies[start + (id - low) as usize] = pos as i32;
				tables.targs.push(trans.target);
				tables.act_inds.push(tables.actions.len());
				tables.actions.extend(trans.actions.iter().map(|a| a.encode()));
				tables.actions.push(0);
				tables.commit_len.push(trans.commit as u8);
			}
		}

		tables
	}
}



/// The complete static description of a compiled program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeData {
	/// Language elements, indexed by id
	pub lel_info: Vec<LangElInfo>,
	/// Productions, indexed by reduction number
	pub prod_info: Vec<ProdInfo>,
	/// Functions and actions, indexed by frame id
	pub frame_info: Vec<FrameInfo>,
	/// Parser entry points
	pub parsers: Vec<ParserInfo>,
	/// LR tables shared by all parsers
	pub pda: PdaTables,
	/// Pattern and template roots
	pub patterns: Vec<PatternInfo>,
	/// Pattern and template nodes
	pub pattern_nodes: Vec<PatternNode>,
	/// String literals referenced by `LoadStr`
	pub literals: Vec<Vec<u8>>,
	/// The instruction stream
	pub code: Vec<u8>,
	/// Offset of the root code block
	pub root_code: usize,
	/// Frame describing the root code block's locals
	pub root_frame_id: usize,
	/// Ids below this are terminals
	pub first_non_term_id: LelId,
	/// Id matching every type in searches and iterators
	pub any_id: LelId,
	/// Id of the global record
	pub global_id: LelId,
}

impl RuntimeData {
	/// Create a new RuntimeData holding only the reserved language elements
	pub fn new () -> Self {
		let reserved = [
			(lel_id::PTR, "ptr"),
			(lel_id::BOOL, "bool"),
			(lel_id::INT, "int"),
			(lel_id::STR, "str"),
			(lel_id::IGNORE, "il"),
			(lel_id::LIST, "list"),
			(lel_id::MAP, "map"),
			(lel_id::PARSER, "parser"),
			(lel_id::GLOBAL, "global"),
			(lel_id::ANY, "any"),
		];

		let mut lel_info = vec![LangElInfo::default(); lel_id::FIRST_USER as usize];
		for &(id, name) in reserved.iter() {
			lel_info[id as usize].name = name.into();
		}

		Self {
			lel_info,
			prod_info: Vec::new(),
			frame_info: Vec::new(),
			parsers: Vec::new(),
			pda: PdaTables::default(),
			patterns: Vec::new(),
			pattern_nodes: Vec::new(),
			literals: Vec::new(),
			code: Vec::new(),
			root_code: 0,
			root_frame_id: 0,
			first_non_term_id: lel_id::FIRST_USER,
			any_id: lel_id::ANY,
			global_id: lel_id::GLOBAL,
		}
	}

	/// Describe language element `id`, growing the table as needed
	pub fn define_lel (&mut self, id: LelId, info: LangElInfo) {
		let index = id as usize;
		if self.lel_info.len() <= index {
			self.lel_info.resize(index + 1, LangElInfo::default());
		}

		self.lel_info[index] = info;
	}

	/// Get the number of attribute slots of type `id`
	pub fn object_length (&self, id: LelId) -> usize {
		self.lel_info.get(id as usize).map_or(0, |info| info.object_length)
	}

	/// Set the number of slots in the global record
	pub fn set_global_size (&mut self, size: usize) {
		let id = self.global_id;
		if self.lel_info.len() <= id as usize {
			self.lel_info.resize(id as usize + 1, LangElInfo::default());
		}

		self.lel_info[id as usize].object_length = size;
	}

	/// Get the name of language element `id`, for diagnostics
	pub fn lel_name (&self, id: LelId) -> &str {
		self.lel_info.get(id as usize).map_or("?", |info| info.name.as_str())
	}

	/// Check the tables for internal consistency
	pub fn validate (&self) -> VmResult<()> {
		let invalid = |msg: String| Err(VmError::InvalidProgram(msg));

		if self.frame_info.is_empty() {
			return invalid("no frames".into())
		}

		if self.root_frame_id >= self.frame_info.len() {
			return invalid(format!("root frame {} does not exist", self.root_frame_id))
		}

		if self.root_code >= self.code.len() {
			return invalid(format!("root code offset {} is out of range", self.root_code))
		}

		for (id, frame) in self.frame_info.iter().enumerate() {
			if frame.code_wc >= self.code.len() || frame.code_wv >= self.code.len() {
				return invalid(format!("frame {} ({}) has code out of range", id, frame.name))
			}
		}

		let frame_ok = |frame: Option<usize>| frame.map_or(true, |f| f < self.frame_info.len());

		for prod in self.prod_info.iter() {
			if !frame_ok(prod.frame_id) {
				return invalid(format!("production {} names a missing frame", prod.name))
			}
		}

		for lel in self.lel_info.iter() {
			if !frame_ok(lel.frame_id) {
				return invalid(format!("language element {} names a missing frame", lel.name))
			}
		}

		for parser in self.parsers.iter() {
			if !frame_ok(parser.eof_frame_id) {
				return invalid(format!("parser {} names a missing frame", parser.name))
			}

			if parser.start_state >= self.pda.num_states {
				return invalid(format!("parser {} starts in a missing state", parser.name))
			}
		}

		for pattern in self.patterns.iter() {
			if pattern.offset >= self.pattern_nodes.len() {
				return invalid(format!("pattern root {} is out of range", pattern.offset))
			}
		}

		Ok(())
	}
}

impl Default for RuntimeData { fn default () -> Self { Self::new() } }



#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_tables_lookup () {
		let mut builder = PdaTablesBuilder::new();
		builder
			.shift(0, 12, 1)
			.transition(0, 14, 2, &[Action::Shift, Action::Reduce(3)])
			.reduce(1, 13, 0)
			.commit(1, 13);

		let tables = builder.build();

		assert_eq!(tables.num_states, 3);
		assert_eq!(tables.transition(0, 11), None);
		assert_eq!(tables.transition(0, 13), None);
		assert_eq!(tables.transition(2, 12), None);

		let pos = tables.transition(0, 14).unwrap();
		assert_eq!(tables.targs[pos], 2);
		let acts = &tables.actions[tables.act_inds[pos]..];
		assert_eq!(acts[0], Action::Shift.encode());
		assert_eq!(acts[1] >> 2, 3);
		assert_eq!(acts[2], 0);

		let pos = tables.transition(1, 13).unwrap();
		assert_eq!(tables.commit_len[pos], 1);
		assert_eq!(tables.actions[tables.act_inds[pos]] & Action::REDUCE_BIT, Action::REDUCE_BIT);
	}

	#[test]
	fn test_validate () {
		let mut rtd = RuntimeData::new();
		assert!(rtd.validate().is_err());

		rtd.code = vec![0; 4];
		rtd.frame_info.push(FrameInfo { name: "root".into(), .. FrameInfo::default() });
		assert_eq!(rtd.validate(), Ok(()));

		rtd.prod_info.push(ProdInfo { name: "p".into(), frame_id: Some(5), .. ProdInfo::default() });
		assert!(matches!(rtd.validate(), Err(VmError::InvalidProgram(_))));
	}

	#[test]
	fn test_reserved_names () {
		let mut rtd = RuntimeData::default();
		assert_eq!(rtd.lel_name(lel_id::INT), "int");
		assert_eq!(rtd.object_length(40), 0);

		rtd.set_global_size(3);
		assert_eq!(rtd.object_length(lel_id::GLOBAL), 3);
	}
}
