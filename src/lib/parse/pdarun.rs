//! The LR driver
//!
//! A generalized, backtracking LR(1) run over the shared tables. Every
//! transition may carry an ordered list of alternative actions; the retry
//! counters on the parse tree nodes remember which alternative to take
//! next when a later parse error forces the driver back over them

use crate::{
	arena::Arena,
	error::VmResult,
	pool::*,
	tree::{ Tree, LelId },
	vm::{
		rcode::{ ReverseLog, ReverseCode, RevBlock, RevOp },
		runtime::{ RuntimeData, Action },
	},
};

use super::{ Parser, ParseTree, ParseCx, Pcr, pt_flag };



/// State of one LR run
#[derive(Debug)]
pub struct PdaRun {
	/// Index of the parser entry point in the compiled tables
	pub parser: usize,
	/// Element that ends a fragment parse once it is alone on the stack
	pub stop_target: LelId,
	/// Whether reverse code must be kept across commits
	pub revert_on: bool,
	/// Step count an undo is driving back to, or -1
	pub target_steps: i64,
	/// Tokens sent plus reverse code blocks made
	pub steps: i64,
	/// The current state; `None` after a failed parse
	pub cs: Option<usize>,
	/// The state the current action was taken from
	pub cur_state: usize,
	/// Top of the parse stack; the bottom is a sentinel node
	pub stack_top: ParseTreeId,
	/// Shifted terminals, newest last
	pub token_list: Vec<ParseTreeId>,
	/// Tokens that were on top when a parse error occured, each owning a reference
	pub bt_points: Vec<TreeId>,
	/// Head of the input chain: reduced nodes in front of the lookahead
	pub input: Option<ParseTreeId>,
	/// The node the current action looks at
	pub lel: Option<ParseTreeId>,
	/// The node produced by the reduction whose action is running
	pub red_lel: Option<ParseTreeId>,
	/// The production being reduced
	pub reduction: usize,
	/// Number of pending alternatives anywhere in the run
	pub num_retry: i64,
	/// Sticky failure flag
	pub parse_error: bool,
	/// Drive the run backwards instead of forwards
	pub trigger_undo: bool,
	/// The undo target was reached
	pub stop: bool,
	/// The stop target was reached
	pub stop_parsing: bool,
	/// Test `stop` on the next backtracking iteration
	pub check_stop: bool,
	/// Reverse code blocks are being replayed
	pub on_deck: bool,
	/// Acquired original left hand side of the current reduction
	pub parsed: Option<TreeId>,
	/// Original left hand side to put back when the next reduction is undone
	pub restore_lhs: Option<TreeId>,
	/// The current reduction action asked for a parse error
	pub reject: bool,
	/// Frame of the action the run is suspended for; `None` for reverse code
	pub frame_id: Option<usize>,
	/// Entry point of that action
	pub code: usize,
	/// The block a `Reverse` suspension asks to replay
	pub rev_block: Option<RevBlock>,
	/// Units recorded by actions since the last block was made
	pub rcode_collect: ReverseLog,
	/// Blocks attached to parse tree nodes
	pub reverse_code: ReverseCode,
	/// Blocks made since the last transfer to a node
	pub rc_block_count: usize,
}

impl PdaRun {
	/// Create a new PdaRun for a parser entry point, with an empty stack
	pub fn new (arena: &mut Arena, rtd: &RuntimeData, parser: usize) -> VmResult<Self> {
		let start = match rtd.parsers.get(parser) {
			Some(info) => info.start_state,
			None => panic!("no parser with id {}", parser),
		};

		let sentinel = arena.parse_trees.alloc(ParseTree::new(0, None))?;

		Ok(Self {
			parser,
			stop_target: 0,
			revert_on: false,
			target_steps: -1,
			steps: 0,
			cs: Some(start),
			cur_state: start,
			stack_top: sentinel,
			token_list: Vec::new(),
			bt_points: Vec::new(),
			input: None,
			lel: None,
			red_lel: None,
			reduction: 0,
			num_retry: 0,
			parse_error: false,
			trigger_undo: false,
			stop: false,
			stop_parsing: false,
			check_stop: false,
			on_deck: false,
			parsed: None,
			restore_lhs: None,
			reject: false,
			frame_id: None,
			code: 0,
			rev_block: None,
			rcode_collect: ReverseLog::new(),
			reverse_code: ReverseCode::new(),
			rc_block_count: 0,
		})
	}

	/// Give up the stack, the input chain and all recorded reverse code
	pub(crate) fn release (&mut self, arena: &mut Arena) {
		arena.free_parse_tree_chain(Some(self.stack_top));
		arena.free_parse_tree_chain(self.input.take());
		arena.free_parse_tree(self.red_lel.take());
		self.token_list.clear();

		for tree in std::mem::take(&mut self.bt_points) {
			arena.downref(Some(tree));
		}

		self.reverse_code.downref_all(arena);
		self.rcode_collect.release(arena);
		if let Some(block) = self.rev_block.take() {
			block.release(arena);
		}

		arena.downref(self.parsed.take());
		arena.downref(self.restore_lhs.take());
	}

	fn increment_steps (&mut self) {
		self.steps += 1;
		tracing::trace!(target: "arbor::parse", steps = self.steps, "steps up");
	}

	/// Count one step undone, flagging the stop once an undo reaches its target
	pub fn decrement_steps (&mut self) {
		self.steps -= 1;
		tracing::trace!(target: "arbor::parse", steps = self.steps, "steps down");

		if self.steps == self.target_steps {
			tracing::debug!(target: "arbor::parse", steps = self.steps, "undo target reached");
			self.stop = true;
		}
	}

	/// Seal the units collected since the last call into a block
	///
	/// The first block made for a node is preceded by an end of deck marker
	pub fn make_reverse_code (&mut self) {
		if self.rcode_collect.is_empty() { return }

		if self.rc_block_count == 0 {
			self.reverse_code.push(RevBlock::EndDeck);
			self.increment_steps();
		}

		let units = self.rcode_collect.take_units();
		tracing::trace!(target: "arbor::rcode", units = units.len(), "block made");

		self.reverse_code.push(RevBlock::Units(units));
		self.increment_steps();
		self.rc_block_count += 1;
	}

	/// Attach the blocks made since the last transfer to a node
	pub fn transfer_reverse_code (&mut self, arena: &mut Arena, node: ParseTreeId) {
		if self.rc_block_count > 0 {
			arena.parse_trees[node].flags |= pt_flag::HAS_RCODE;
			self.rc_block_count = 0;
		}
	}
}



#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
	Again,
	ParseError,
	Backtrack,
	Fail,
	Out,
}

enum Flow {
	Go(Phase),
	Suspend(Pcr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scan {
	Undo,
	TryAgainLater,
	Eof,
	Generation(usize),
	Tree,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopPhase {
	Scan,
	Send,
	Token(Pcr),
	Check,
}


fn term_dup (rtd: &RuntimeData, id: LelId) -> Option<LelId> {
	rtd.lel_info.get(id as usize).and_then(|info| info.term_dup_id)
}


impl Parser {
	/// Determine if a node counts as a terminal for backtracking
	fn effective_terminal (cx: &ParseCx, node: &ParseTree) -> bool {
		node.id < cx.rtd.first_non_term_id || node.has(pt_flag::TERM_DUP)
	}

	/// The state the driver is in with the current stack top
	fn stack_top_target (&self, cx: &ParseCx) -> usize {
		let top = cx.arena.parse_trees[self.pda.stack_top];
		if top.state < 0 {
			return cx.rtd.parsers[self.pda.parser].start_state
		}

		// the transition was taken on the terminal a duplicate stands in for
		let id = match (top.has(pt_flag::TERM_DUP), term_dup(cx.rtd, top.id)) {
			(true, Some(term)) => term,
			_ => top.id,
		};

		match cx.rtd.pda.transition(top.state as usize, id) {
			Some(pos) => cx.rtd.pda.targs[pos],
			None => panic!("no transition recorded for {} out of state {}", cx.rtd.lel_name(id), top.state),
		}
	}

	fn push_bt_point (&mut self, cx: &mut ParseCx) {
		let tree = self.pda.token_list.last().and_then(|&node| cx.arena.parse_trees[node].shadow);

		if let Some(tree) = tree {
			cx.arena.upref(Some(tree));
			self.pda.bt_points.push(tree);
		}
	}


	fn scan (&self, cx: &ParseCx) -> Scan {
		if self.pda.trigger_undo { return Scan::Undo }

		match self.input.front() {
			Some(front) => {
				if !front.scanned && cx.ctx_dep {
					let id = cx.arena.trees[front.tree].id;
					if let Some(frame) = cx.rtd.lel_info.get(id as usize).and_then(|info| info.frame_id) {
						return Scan::Generation(frame)
					}
				}

				Scan::Tree
			}

			None if self.input.eof && !self.input.eof_sent => Scan::Eof,
			None => Scan::TryAgainLater,
		}
	}

	fn send_tree (&mut self, cx: &mut ParseCx) -> VmResult<ParseTreeId> {
		cx.arena.parse_trees.ensure_room()?;

		let tree = match self.input.pull_front() {
			Some(tree) => tree,
			None => panic!("send from an empty input queue"),
		};

		let mut node = ParseTree::new(cx.arena.trees[tree].id, Some(tree));
		node.flags = pt_flag::ARTIFICIAL;

		if node.id >= cx.rtd.first_non_term_id {
			match term_dup(cx.rtd, node.id) {
				Some(term) => node.id = term,
				None => node.flags |= pt_flag::TERM_DUP,
			}
		}

		tracing::debug!(target: "arbor::parse", token = cx.rtd.lel_name(node.id), "sending tree");
		self.pda.increment_steps();

		cx.arena.parse_trees.alloc(node)
	}

	fn send_eof (&mut self, cx: &mut ParseCx) -> VmResult<ParseTreeId> {
		let id = cx.rtd.parsers[self.pda.parser].eof_lel_id;
		cx.arena.parse_trees.ensure_room()?;
		tracing::debug!(target: "arbor::parse", "sending end of input");

		self.pda.increment_steps();

		let tree = cx.arena.construct_token(cx.rtd, id, b"", None)?;
		cx.arena.parse_trees.alloc(ParseTree::new(id, Some(tree)))
	}

	fn send_back (&mut self, cx: &mut ParseCx, node: ParseTreeId) {
		let node = cx.arena.parse_trees.free(node);
		tracing::debug!(target: "arbor::parse", token = cx.rtd.lel_name(node.id), "sending back");

		if node.has(pt_flag::HAS_RCODE) {
			tracing::debug!(target: "arbor::parse", "token has reverse code, setting on deck");
			self.pda.on_deck = true;
		}

		if node.retry_lower > 0 {
			self.pda.num_retry -= 1;
		}

		if node.has(pt_flag::ARTIFICIAL) {
			if let Some(tree) = node.shadow {
				self.input.push_front(tree, true);
			}
		} else {
			// only the end of input token is made by the driver itself
			self.input.eof_sent = false;
			cx.arena.downref(node.shadow);
		}

		self.pda.decrement_steps();
	}


	fn commit_full (&mut self, cx: &mut ParseCx) {
		tracing::debug!(target: "arbor::parse", revert = self.pda.revert_on, "commit");

		let mut work = Vec::new();
		let mut node = Some(self.pda.stack_top);
		while let Some(id) = node {
			if cx.arena.parse_trees[id].has(pt_flag::COMMITTED) { break }
			work.push(id);
			node = cx.arena.parse_trees[id].next;
		}

		while let Some(id) = work.pop() {
			let pt = &mut cx.arena.parse_trees[id];

			if pt.retry_lower > 0 {
				self.pda.num_retry -= 1;
				pt.retry_lower = 0;
			}

			if pt.retry_upper > 0 {
				self.pda.num_retry -= 1;
				pt.retry_upper = 0;
			}

			pt.flags |= pt_flag::COMMITTED;
			if !self.pda.revert_on {
				pt.flags &= !pt_flag::HAS_RCODE;
			}

			if pt.has(pt_flag::TERM_DUP) { continue }

			let mut child = pt.child;
			while let Some(c) = child {
				if !cx.arena.parse_trees[c].has(pt_flag::COMMITTED) {
					work.push(c);
				}
				child = cx.arena.parse_trees[c].next;
			}
		}

		if !self.pda.revert_on {
			self.pda.reverse_code.downref_all(cx.arena);
		}
	}


	/// Build the value of a reduced node: attributes, then the children's values
	fn build_lhs (cx: &mut ParseCx, lhs: LelId, prod_num: u16, children: &[ParseTreeId]) -> VmResult<TreeId> {
		let mut head = None;
		for &c in children.iter().rev() {
			let value = cx.arena.upref(cx.arena.parse_trees[c].shadow);
			head = Some(cx.arena.alloc_kid(value, head)?);
		}

		for _ in 0..cx.rtd.object_length(lhs) {
			head = Some(cx.arena.alloc_kid(None, head)?);
		}

		cx.arena.alloc_tree(Tree { refs: 1, prod_num, child: head, .. Tree::new(lhs) })
	}

	/// Take one action on the head of the input chain
	fn step (&mut self, cx: &mut ParseCx) -> VmResult<Flow> {
		let lel = match self.pda.input {
			Some(lel) => lel,
			None => return Ok(Flow::Go(Phase::Out)),
		};

		let cur_state = match self.pda.cs {
			Some(cs) => cs,
			None => panic!("parser stepped after failing"),
		};

		let rtd = cx.rtd;
		self.pda.lel = Some(lel);
		self.pda.cur_state = cur_state;

		let node = cx.arena.parse_trees[lel];
		let pos = match rtd.pda.transition(cur_state, node.id) {
			Some(pos) => pos,
			None => {
				tracing::debug!(target: "arbor::parse", state = cur_state, token = rtd.lel_name(node.id), "no transition");
				self.push_bt_point(cx);
				return Ok(Flow::Go(Phase::ParseError))
			}
		};

		let tables = &rtd.pda;
		self.pda.cs = Some(tables.targs[pos]);

		let at = tables.act_inds[pos] + node.retry_lower as usize;
		let action = tables.actions[at];
		let more = tables.actions[at + 1] != 0;

		if action & Action::SHIFT_BIT != 0 {
			tracing::debug!(target: "arbor::parse", token = rtd.lel_name(node.id), "shifted");

			self.pda.input = node.next;

			let pt = &mut cx.arena.parse_trees[lel];
			pt.state = cur_state as i32;
			pt.next = Some(self.pda.stack_top);
			self.pda.stack_top = lel;

			if pt.id < rtd.first_non_term_id || pt.has(pt_flag::TERM_DUP) {
				self.pda.token_list.push(lel);

				if let Some(dup) = term_dup(rtd, pt.id) {
					pt.id = dup;
					pt.flags |= pt_flag::TERM_DUP;
				}
			}

			if more {
				pt.retry_lower += 1;
				self.pda.num_retry += 1;
			} else {
				pt.retry_lower = 0;
			}
		}

		if tables.commit_len[pos] != 0 {
			self.commit_full(cx);
		}

		if action & Action::REDUCE_BIT != 0 {
			let reduction = (action >> 2) as usize;
			let prod = &rtd.prod_info[reduction];
			self.pda.reduction = reduction;

			let mut children = Vec::with_capacity(prod.length);
			let mut below = self.pda.stack_top;
			for _ in 0..prod.length {
				children.push(below);
				below = match cx.arena.parse_trees[below].next {
					Some(below) => below,
					None => panic!("reduction by {} reached the stack sentinel", prod.name),
				};
			}
			children.reverse();

			// nothing is unlinked until every allocation has succeeded
			cx.arena.parse_trees.ensure_room()?;
			let lhs = Self::build_lhs(cx, prod.lhs_id, prod.prod_num, &children)?;

			if let Some(input) = self.pda.input {
				cx.arena.parse_trees[input].cause_reduce += 1;
			}

			self.pda.stack_top = below;
			for pair in children.windows(2) {
				cx.arena.parse_trees[pair[0]].next = Some(pair[1]);
			}
			if let Some(&last) = children.last() {
				cx.arena.parse_trees[last].next = None;
			}
			let first = children.first().copied();

			let mut red = ParseTree::new(prod.lhs_id, Some(lhs));
			red.child = first;
			red.retry_upper = cx.arena.parse_trees[lel].retry_lower;
			cx.arena.parse_trees[lel].retry_lower = 0;

			if more {
				red.retry_upper += 1;
				self.pda.num_retry += 1;
			} else {
				red.retry_upper = 0;
			}

			self.pda.cs = Some(match first {
				Some(first) => cx.arena.parse_trees[first].state as usize,
				None => cur_state,
			});

			tracing::debug!(target: "arbor::parse", production = prod.name.as_str(), length = prod.length, "reduced");

			let red = cx.arena.parse_trees.alloc(red)?;
			self.pda.red_lel = Some(red);

			if let (true, Some(frame)) = (cx.ctx_dep, prod.frame_id) {
				self.pda.frame_id = Some(frame);
				self.pda.code = rtd.frame_info[frame].code_wv;
				self.pda.reject = false;
				self.pda.parsed = None;
				return Ok(Flow::Suspend(Pcr::Reduction))
			}

			return Ok(Flow::Go(self.reduction_done(cx, false)))
		}

		Ok(Flow::Go(Phase::Again))
	}

	/// Finish a reduction once its action, if any, has run
	fn reduction_done (&mut self, cx: &mut ParseCx, from_action: bool) -> Phase {
		let red = match self.pda.red_lel.take() {
			Some(red) => red,
			None => panic!("reduction resumed without a reduced node"),
		};

		let mut reject = false;

		if from_action {
			if cx.induce_exit {
				cx.arena.parse_trees[red].next = self.pda.input;
				self.pda.input = Some(red);
				return Phase::Fail
			}

			if let Some(parsed) = self.pda.parsed.take() {
				if Some(parsed) != cx.arena.parse_trees[red].shadow {
					tracing::debug!(target: "arbor::parse", "left hand side was replaced, recording a restore");
					self.pda.rcode_collect.push_alone(RevOp::RestoreLhs(parsed));
				} else {
					cx.arena.downref(Some(parsed));
				}
			}

			self.pda.make_reverse_code();
			self.pda.transfer_reverse_code(cx.arena, red);
			reject = self.pda.reject;
		}

		if reject {
			tracing::debug!(target: "arbor::parse", "reduction rejected by its action");

			let pt = &mut cx.arena.parse_trees[red];
			pt.state = self.pda.cur_state as i32;
			pt.next = Some(self.pda.stack_top);
			self.pda.stack_top = red;

			self.push_bt_point(cx);
			return Phase::ParseError
		}

		cx.arena.parse_trees[red].next = self.pda.input;
		self.pda.input = Some(red);
		Phase::Again
	}

	/// One iteration of the backtracking loop
	fn backtrack (&mut self, cx: &mut ParseCx) -> Flow {
		if self.pda.on_deck {
			tracing::debug!(target: "arbor::parse", "dropping out to replay reverse code");
			self.pda.frame_id = None;
			self.pda.rev_block = Some(self.pda.reverse_code.pop());
			return Flow::Suspend(Pcr::Reverse)
		}

		if self.pda.check_stop {
			self.pda.check_stop = false;

			if self.pda.stop {
				tracing::debug!(target: "arbor::parse", steps = self.pda.steps, "backtracking stopped");
				self.pda.cs = Some(self.stack_top_target(cx));
				return Flow::Go(Phase::Out)
			}

			return Flow::Go(Phase::Backtrack)
		}

		match self.pda.input {
			Some(input) => {
				let node = cx.arena.parse_trees[input];

				if Self::effective_terminal(cx, &node) {
					if node.retry_lower != 0 && !self.pda.trigger_undo {
						tracing::debug!(target: "arbor::parse", token = cx.rtd.lel_name(node.id), "found retry target");
						self.pda.num_retry -= 1;
						self.pda.cs = Some(node.state as usize);
						return Flow::Go(Phase::Again)
					}

					if node.cause_reduce != 0 {
						let undo = self.pda.stack_top;
						let below = match cx.arena.parse_trees[undo].next {
							Some(below) => below,
							None => return Flow::Go(Phase::Fail),
						};

						tracing::debug!(target: "arbor::parse", "backing up over a nonterminal");
						self.pda.stack_top = below;
						cx.arena.parse_trees[undo].next = Some(input);
						self.pda.input = Some(undo);
					} else {
						self.pda.check_stop = true;
						self.pda.input = node.next;
						self.send_back(cx, input);
					}
				} else if node.has(pt_flag::HAS_RCODE) {
					tracing::debug!(target: "arbor::parse", "tree has reverse code, setting on deck");
					self.pda.on_deck = true;
					cx.arena.parse_trees[input].flags &= !pt_flag::HAS_RCODE;
				} else {
					self.unreduce(cx, input);
				}
			}

			None => {
				let undo = self.pda.stack_top;
				let node = cx.arena.parse_trees[undo];
				let below = match node.next {
					Some(below) => below,
					None => return Flow::Go(Phase::Fail),
				};

				self.pda.stack_top = below;

				if Self::effective_terminal(cx, &node) {
					tracing::debug!(target: "arbor::parse", token = cx.rtd.lel_name(node.id), "backing up over a terminal");

					if node.has(pt_flag::TERM_DUP) {
						if let Some(term) = term_dup(cx.rtd, node.id) {
							let pt = &mut cx.arena.parse_trees[undo];
							pt.id = term;
							pt.flags &= !pt_flag::TERM_DUP;
						}
					}

					self.pda.token_list.pop();
				} else {
					tracing::debug!(target: "arbor::parse", "backing up over a nonterminal");
				}

				cx.arena.parse_trees[undo].next = self.pda.input;
				self.pda.input = Some(undo);
			}
		}

		Flow::Go(Phase::Backtrack)
	}

	/// Take apart a reduced node at the head of the input, returning its children to the stack
	fn unreduce (&mut self, cx: &mut ParseCx, undo: ParseTreeId) {
		let mut node = cx.arena.parse_trees.free(undo);
		self.pda.input = node.next;

		if let Some(original) = self.pda.restore_lhs.take() {
			tracing::debug!(target: "arbor::parse", "restoring the original left hand side");
			cx.arena.downref(node.shadow);
			node.shadow = Some(original);
		}

		let mut child = node.child;
		while let Some(c) = child {
			child = cx.arena.parse_trees[c].next;
			cx.arena.parse_trees[c].next = Some(self.pda.stack_top);
			self.pda.stack_top = c;
		}

		if let Some(next) = self.pda.input {
			cx.arena.parse_trees[next].cause_reduce -= 1;
		}

		if node.retry_upper != 0 {
			let next = match self.pda.input {
				Some(next) => next,
				None => panic!("reduction alternative without a lookahead"),
			};

			let target = self.stack_top_target(cx);
			let pt = &mut cx.arena.parse_trees[next];
			pt.retry_lower = node.retry_upper;
			pt.retry_upper = 0;
			pt.state = target as i32;
		}

		cx.arena.downref(node.shadow);
	}

	fn fail (&mut self, cx: &mut ParseCx) {
		tracing::debug!(target: "arbor::parse", "out of alternatives, parse failed");

		self.pda.cs = None;
		self.pda.parse_error = true;
		cx.arena.free_parse_tree_chain(self.pda.input.take());
	}


	/// Run the driver over the input chain until it needs more input or an action
	pub fn parse_token (&mut self, cx: &mut ParseCx, entry: Pcr) -> VmResult<Pcr> {
		let mut phase = match entry {
			Pcr::Start => match (self.pda.input, self.pda.cs) {
				(None, _) => Phase::ParseError,
				(Some(_), None) => return Ok(Pcr::Done),
				(Some(input), Some(cs)) => {
					cx.arena.parse_trees[input].state = cs as i32;
					Phase::Again
				}
			}

			Pcr::Reduction => self.reduction_done(cx, true),

			Pcr::Reverse => {
				self.pda.decrement_steps();
				Phase::Backtrack
			}

			other => panic!("parse step entered with {:?}", other),
		};

		loop {
			phase = match phase {
				Phase::Again => match self.step(cx)? {
					Flow::Go(phase) => phase,
					Flow::Suspend(pcr) => return Ok(pcr),
				}

				Phase::ParseError => {
					tracing::debug!(target: "arbor::parse", retries = self.pda.num_retry, "hit error, backtracking");
					if self.pda.num_retry == 0 { Phase::Fail } else { Phase::Backtrack }
				}

				Phase::Backtrack => match self.backtrack(cx) {
					Flow::Go(phase) => phase,
					Flow::Suspend(pcr) => return Ok(pcr),
				}

				Phase::Fail => {
					self.fail(cx);
					return Ok(Pcr::Done)
				}

				Phase::Out => return Ok(Pcr::Done),
			}
		}
	}

	fn is_parser_stop_finished (&self, cx: &ParseCx) -> bool {
		let top = cx.arena.parse_trees[self.pda.stack_top];

		match top.next {
			Some(below) => cx.arena.parse_trees[below].next.is_none() && top.id == self.pda.stop_target,
			None => false,
		}
	}

	fn report_parse_error (&mut self, cx: &mut ParseCx) -> VmResult<()> {
		let deepest = self.pda.bt_points.iter()
			.filter_map(|&tree| {
				let head = cx.arena.trees[tree].tokdata?;
				let location = cx.arena.head_location(head)?;
				Some((head, location.clone()))
			})
			.max_by_key(|(_, location)| location.byte);

		let (line, column) = match deepest {
			None => (1, 1),
			Some((head, location)) => {
				cx.arena.head_data(head).iter().fold((location.line, location.column), |(line, column), &b| {
					if b == b'\n' { (line + 1, 1) } else { (line, column + 1) }
				})
			}
		};

		let text = format!("{}:{}: parse error", line, column);
		tracing::debug!(target: "arbor::parse", error = text.as_str(), "parse error");

		let tree = cx.arena.construct_str(text.as_bytes())?;
		cx.arena.downref(self.error.replace(tree));

		Ok(())
	}

	fn handle_error (&mut self, cx: &mut ParseCx) -> VmResult<()> {
		if self.pda.parse_error {
			self.report_parse_error(cx)?;
		} else if !self.pda.trigger_undo && self.is_parser_stop_finished(cx) {
			tracing::debug!(target: "arbor::parse", "stop target reached");
			self.pda.stop_parsing = true;
		}

		Ok(())
	}

	/// Feed queued input through the driver
	///
	/// Returns a suspension code when an action must run; the caller runs it
	/// and re-enters with the same code
	pub fn parse_loop (&mut self, cx: &mut ParseCx, entry: Pcr) -> VmResult<Pcr> {
		let mut phase = match entry {
			Pcr::Start => {
				if self.pda.parse_error { return Ok(Pcr::Done) }
				self.pda.stop = false;
				LoopPhase::Scan
			}

			Pcr::PreEof => {
				self.pda.make_reverse_code();
				LoopPhase::Send
			}

			Pcr::Generation => {
				self.pda.make_reverse_code();
				LoopPhase::Check
			}

			Pcr::Reduction | Pcr::Reverse => LoopPhase::Token(entry),

			Pcr::Done => return Ok(Pcr::Done),
		};

		loop {
			phase = match phase {
				LoopPhase::Scan => match self.scan(cx) {
					Scan::TryAgainLater => return Ok(Pcr::Done),

					Scan::Undo => {
						self.pda.input = None;
						LoopPhase::Token(Pcr::Start)
					}

					Scan::Eof => {
						self.input.eof_sent = true;
						self.pda.input = Some(self.send_eof(cx)?);

						match cx.rtd.parsers[self.pda.parser].eof_frame_id {
							Some(frame) if cx.ctx_dep => {
								self.pda.frame_id = Some(frame);
								self.pda.code = cx.rtd.frame_info[frame].code_wv;
								return Ok(Pcr::PreEof)
							}

							_ => LoopPhase::Send,
						}
					}

					Scan::Generation(frame) => {
						self.input.mark_front_scanned();
						self.pda.frame_id = Some(frame);
						self.pda.code = cx.rtd.frame_info[frame].code_wv;
						return Ok(Pcr::Generation)
					}

					Scan::Tree => {
						self.pda.input = Some(self.send_tree(cx)?);
						LoopPhase::Send
					}
				}

				LoopPhase::Send => {
					if let Some(input) = self.pda.input {
						self.pda.transfer_reverse_code(cx.arena, input);
					}

					LoopPhase::Token(Pcr::Start)
				}

				LoopPhase::Token(entry) => {
					let pcr = self.parse_token(cx, entry)?;
					if pcr != Pcr::Done { return Ok(pcr) }

					self.handle_error(cx)?;
					LoopPhase::Check
				}

				LoopPhase::Check => {
					let stopped = self.pda.trigger_undo
						|| self.input.eof_sent
						|| self.pda.stop_parsing
						|| self.pda.stop
						|| cx.induce_exit
						|| self.pda.parse_error;

					if stopped { return Ok(Pcr::Done) }
					LoopPhase::Scan
				}
			}
		}
	}


	/// Get the tree a finished parse produced, without acquiring it
	pub fn get_parsed_root (&self, cx: &ParseCx, stop: bool) -> Option<TreeId> {
		if self.pda.parse_error { return None }

		let top = cx.arena.parse_trees[self.pda.stack_top];
		if stop {
			top.shadow
		} else {
			top.next.and_then(|below| cx.arena.parse_trees[below].shadow)
		}
	}

	/// Parse whatever input is queued, stopping early at `stop` if nonzero
	pub fn parse_frag (&mut self, cx: &mut ParseCx, stop: LelId, entry: Pcr) -> VmResult<Pcr> {
		if entry == Pcr::Start {
			self.pda.stop_target = stop;
		}

		self.parse_loop(cx, entry)
	}

	/// Send the end of input, then commit and record the result
	pub fn parse_finish (&mut self, cx: &mut ParseCx, stop: LelId, entry: Pcr) -> VmResult<Pcr> {
		let pcr = match entry {
			Pcr::Start => {
				self.pda.stop_target = stop;

				if stop == 0 {
					self.input.eof = true;
					self.parse_loop(cx, Pcr::Start)?
				} else {
					Pcr::Done
				}
			}

			other => self.parse_loop(cx, other)?,
		};

		if pcr != Pcr::Done { return Ok(pcr) }

		if !self.pda.revert_on {
			self.commit_full(cx);
		}

		let root = self.get_parsed_root(cx, self.pda.stop_target > 0);
		let root = cx.arena.upref(root);
		cx.arena.downref(std::mem::replace(&mut self.result, root));

		Ok(Pcr::Done)
	}

	/// Drive the parser back until its step count is `steps`
	///
	/// Suspends with `Reverse` whenever a block must be replayed
	pub fn undo_parse_frag (&mut self, cx: &mut ParseCx, steps: i64, entry: Pcr) -> VmResult<Pcr> {
		let pcr = match entry {
			Pcr::Start => {
				if steps >= self.pda.steps || self.pda.parse_error { return Ok(Pcr::Done) }

				tracing::debug!(target: "arbor::parse", from = self.pda.steps, to = steps, "undoing parse");
				self.pda.num_retry += 1;
				self.pda.target_steps = steps;
				self.pda.trigger_undo = true;
				self.parse_loop(cx, Pcr::Start)?
			}

			other => self.parse_loop(cx, other)?,
		};

		if pcr != Pcr::Done { return Ok(pcr) }

		assert!(self.pda.parse_error || self.pda.steps == steps, "parse undo stopped at step {} instead of {}", self.pda.steps, steps);

		self.pda.trigger_undo = false;
		self.pda.target_steps = -1;
		self.pda.num_retry -= 1;

		Ok(Pcr::Done)
	}
}



#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		tree::{ Location, lel_id::FIRST_USER },
		vm::runtime::{ LangElInfo, ProdInfo, ParserInfo, PdaTablesBuilder },
	};

	const WORD: LelId = FIRST_USER;
	const NUM: LelId = FIRST_USER + 1;
	const EOF: LelId = FIRST_USER + 2;
	const LIST: LelId = FIRST_USER + 3;
	const START: LelId = FIRST_USER + 4;

	/// start: list, list: list WORD | WORD
	fn word_list () -> RuntimeData {
		let mut rtd = RuntimeData::new();
		rtd.first_non_term_id = LIST;

		for (id, name) in [(WORD, "word"), (NUM, "num"), (EOF, "eof"), (LIST, "list"), (START, "start")] {
			rtd.define_lel(id, LangElInfo { name: name.into(), .. LangElInfo::default() });
		}

		let prod = |name: &str, lhs_id, length| ProdInfo {
			name: name.into(), lhs_id, prod_num: 0, length, frame_id: None, lhs_upref: false,
		};

		rtd.prod_info = vec![
			prod("list_more", LIST, 2),
			prod("list_one", LIST, 1),
			prod("start", START, 1),
		];

		rtd.pda = PdaTablesBuilder::new()
			.shift(0, WORD, 2).shift(0, LIST, 1).shift(0, START, 4)
			.shift(1, WORD, 3).reduce(1, EOF, 2)
			.reduce(2, WORD, 1).reduce(2, EOF, 1)
			.reduce(3, WORD, 0).reduce(3, EOF, 0)
			.shift(4, EOF, 5)
			.build();

		rtd.parsers = vec![ParserInfo { name: "start".into(), start_state: 0, eof_lel_id: EOF, eof_frame_id: None }];
		rtd
	}

	fn append (arena: &mut Arena, rtd: &RuntimeData, parser: TreeId, id: LelId, text: &[u8], column: u32) {
		let location = Location { name: None, line: 1, column, byte: column as u64 - 1 };
		let token = arena.construct_token(rtd, id, text, Some(location)).unwrap();

		let pid = arena.parser_id(parser);
		arena.parsers[pid].input.append(token);
	}

	fn drive (arena: &mut Arena, rtd: &RuntimeData, parser: TreeId, f: impl FnOnce(&mut Parser, &mut ParseCx) -> VmResult<Pcr>) -> Pcr {
		let pid = arena.parser_id(parser);

		arena.with_parser(pid, |p, arena| {
			let mut cx = ParseCx { arena, rtd, ctx_dep: true, induce_exit: false };
			f(p, &mut cx).unwrap()
		})
	}

	fn printed (arena: &Arena, rtd: &RuntimeData, tree: Option<TreeId>) -> Vec<u8> {
		let mut out = Vec::new();
		arena.print_tree(rtd, tree, &mut out);
		out
	}

	#[test]
	fn test_parse_in_fragments () {
		let rtd = word_list();
		let mut arena = Arena::new(None);
		let parser = arena.construct_parser(&rtd, 0).unwrap();

		append(&mut arena, &rtd, parser, WORD, b"a", 1);
		assert_eq!(drive(&mut arena, &rtd, parser, |p, cx| p.parse_frag(cx, 0, Pcr::Start)), Pcr::Done);
		assert_eq!(arena.parsers[arena.parser_id(parser)].result, None);

		append(&mut arena, &rtd, parser, WORD, b"b", 2);
		append(&mut arena, &rtd, parser, WORD, b"c", 3);
		assert_eq!(drive(&mut arena, &rtd, parser, |p, cx| p.parse_finish(cx, 0, Pcr::Start)), Pcr::Done);

		let parsed = &arena.parsers[arena.parser_id(parser)];
		assert!(!parsed.pda.parse_error);
		assert_eq!(parsed.error, None);

		let result = parsed.result;
		assert_eq!(arena.trees[result.unwrap()].id, START);
		assert_eq!(printed(&arena, &rtd, result), b"abc");

		arena.downref(Some(parser));
		assert!(arena.leak_report().is_clean(), "{}", arena.leak_report());
	}

	#[test]
	fn test_parse_error_location () {
		let rtd = word_list();
		let mut arena = Arena::new(None);
		let parser = arena.construct_parser(&rtd, 0).unwrap();

		append(&mut arena, &rtd, parser, WORD, b"ab", 1);
		append(&mut arena, &rtd, parser, NUM, b"7", 4);
		assert_eq!(drive(&mut arena, &rtd, parser, |p, cx| p.parse_finish(cx, 0, Pcr::Start)), Pcr::Done);

		let parsed = &arena.parsers[arena.parser_id(parser)];
		assert!(parsed.pda.parse_error);
		assert_eq!(parsed.result, None);
		assert_eq!(printed(&arena, &rtd, parsed.error), b"1:3: parse error");

		// a failed parser accepts no more input
		append(&mut arena, &rtd, parser, WORD, b"c", 5);
		assert_eq!(drive(&mut arena, &rtd, parser, |p, cx| p.parse_frag(cx, 0, Pcr::Start)), Pcr::Done);
		assert_eq!(arena.parsers[arena.parser_id(parser)].input.len(), 1);

		arena.downref(Some(parser));
		assert!(arena.leak_report().is_clean(), "{}", arena.leak_report());
	}

	#[test]
	fn test_undo_returns_tokens_to_input () {
		let rtd = word_list();
		let mut arena = Arena::new(None);
		let parser = arena.construct_parser(&rtd, 0).unwrap();

		append(&mut arena, &rtd, parser, WORD, b"a", 1);
		drive(&mut arena, &rtd, parser, |p, cx| p.parse_frag(cx, 0, Pcr::Start));
		let steps = arena.parsers[arena.parser_id(parser)].pda.steps;

		append(&mut arena, &rtd, parser, WORD, b"b", 2);
		append(&mut arena, &rtd, parser, WORD, b"c", 3);
		drive(&mut arena, &rtd, parser, |p, cx| p.parse_frag(cx, 0, Pcr::Start));
		assert!(arena.parsers[arena.parser_id(parser)].pda.steps > steps);
		assert!(arena.parsers[arena.parser_id(parser)].input.is_empty());

		assert_eq!(drive(&mut arena, &rtd, parser, |p, cx| p.undo_parse_frag(cx, steps, Pcr::Start)), Pcr::Done);

		let undone = &arena.parsers[arena.parser_id(parser)];
		assert_eq!(undone.pda.steps, steps);
		assert!(!undone.pda.trigger_undo);
		assert_eq!(undone.pda.num_retry, 0);
		assert_eq!(undone.input.len(), 2);

		let front = undone.input.front().unwrap().tree;
		assert_eq!(printed(&arena, &rtd, Some(front)), b"b");

		// undoing forward is a no op
		assert_eq!(drive(&mut arena, &rtd, parser, |p, cx| p.undo_parse_frag(cx, steps + 5, Pcr::Start)), Pcr::Done);

		assert_eq!(drive(&mut arena, &rtd, parser, |p, cx| p.parse_finish(cx, 0, Pcr::Start)), Pcr::Done);
		let result = arena.parsers[arena.parser_id(parser)].result;
		assert_eq!(printed(&arena, &rtd, result), b"abc");

		arena.downref(Some(parser));
		assert!(arena.leak_report().is_clean(), "{}", arena.leak_report());
	}
}
