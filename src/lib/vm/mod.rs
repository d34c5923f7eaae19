//! The main vm data structure

pub mod runtime;
pub mod stack;
pub mod instruction;
pub mod rcode;
pub mod revert;
pub mod exec;
pub mod iter;

pub use self::{
	runtime::RuntimeData,
	stack::{ VmStack, Slot },
	instruction::{ Opcode, CodeBuilder },
	exec::Execution,
};

use std::rc::Rc;

use crate::{
	arena::{ Arena, LeakReport },
	config::Config,
	error::{ VmError, VmResult },
	pool::*,
	tree::{ Tree, TreeValue, lel_id },
};



/// What a program leaves behind when it is torn down
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Teardown {
	/// The status passed to `Exit`, or 0
	pub exit_status: i64,
	/// Objects that were never released
	pub leaks: LeakReport,
}


/// A loaded program: its tables, value arena, operand stack and global state
pub struct Program {
	pub(crate) rtd: Rc<RuntimeData>,
	pub(crate) config: Config,
	/// All values the program creates
	pub arena: Arena,
	pub(crate) stack: VmStack,
	pub(crate) true_val: TreeId,
	pub(crate) false_val: TreeId,
	pub(crate) global: TreeId,
	/// Kids holding the targets of pointer values
	pub(crate) heap: Vec<KidId>,
	/// The last parse error any parser reported
	pub(crate) error: Option<TreeId>,
	pub(crate) return_val: Option<TreeId>,
	pub(crate) induce_exit: bool,
	pub(crate) exit_status: i64,
	pub(crate) args: Vec<Vec<u8>>,
	pub(crate) output: Vec<u8>,
}

impl Program {
	/// Create a new Program from compiled tables
	pub fn new (rtd: RuntimeData, config: Config) -> VmResult<Self> {
		rtd.validate()?;

		let mut arena = Arena::new(config.pool_limit);

		let true_val = arena.alloc_tree(Tree { refs: 1, value: TreeValue::Int(1), .. Tree::new(lel_id::BOOL) })?;
		let false_val = arena.alloc_tree(Tree { refs: 1, value: TreeValue::Int(0), .. Tree::new(lel_id::BOOL) })?;
		let global = arena.construct_object(&rtd, rtd.global_id)?;

		tracing::debug!(
			target: "arbor::program",
			frames = rtd.frame_info.len(),
			parsers = rtd.parsers.len(),
			code = rtd.code.len(),
			"program created"
		);

		Ok(Self {
			stack: VmStack::new(config.stack_segment_slots),
			rtd: Rc::new(rtd),
			config,
			arena,
			true_val,
			false_val,
			global,
			heap: Vec::new(),
			error: None,
			return_val: None,
			induce_exit: false,
			exit_status: 0,
			args: Vec::new(),
			output: Vec::new(),
		})
	}


	/// Get one of the boolean singletons, without acquiring it
	pub fn bool_val (&self, value: bool) -> TreeId {
		if value { self.true_val } else { self.false_val }
	}

	/// Push an acquired boolean singleton
	pub(crate) fn push_bool (&mut self, value: bool) {
		let tree = self.arena.upref(Some(self.bool_val(value)));
		self.stack.push_tree(tree);
	}

	/// Determine if a value counts as false: nil, `false` or integer 0
	pub fn test_false (&self, tree: Option<TreeId>) -> bool {
		match tree {
			None => true,
			Some(t) => self.arena.trees[t].value == TreeValue::Int(0),
		}
	}


	/// Push the header of a frame that returns to the host
	fn push_host_frame (&mut self, frame_id: usize) -> Execution {
		let frame_size = self.rtd.frame_info[frame_id].frame_size;

		self.stack.reserve(stack::FR_AA + frame_size);
		self.stack.push(Slot::Nil);
		self.stack.push(Slot::Code(None));
		self.stack.push(Slot::Int(0));
		self.stack.push(Slot::Int(-1));

		let exec = Execution { fp: self.stack.len(), frame_id: Some(frame_id), .. Execution::new() };
		for _ in 0..frame_size { self.stack.push(Slot::Nil) }

		exec
	}

	/// Run the root code with `args` visible through `LoadArgv`
	///
	/// The value the root code saves with `SaveRet` is kept as the program's return value
	pub fn run_program (&mut self, args: &[&[u8]]) -> VmResult<()> {
		self.args = args.iter().map(|a| a.to_vec()).collect();

		let base = self.stack.len();
		let mut exec = self.push_host_frame(self.rtd.root_frame_id);
		let fp = exec.fp;

		tracing::debug!(target: "arbor::program", args = args.len(), "running root code");
		let result = self.execute(&mut exec, self.rtd.root_code);

		let parser = exec.parser.take();
		self.arena.downref(parser);

		// Stop and Exit leave the root frame in place, Ret leaves only its value
		if self.stack.len() >= fp {
			let above = self.stack.len() - fp;
			self.stack.pop_release(&mut self.arena, above);
			self.stack.popn(stack::FR_AA - 1);
		}

		let rv = self.stack.pop_tree();
		let old = std::mem::replace(&mut self.return_val, rv);
		self.arena.downref(old);

		let above = self.stack.len() - base;
		self.stack.pop_release(&mut self.arena, above);

		tracing::debug!(target: "arbor::program", exit_status = self.exit_status, "root code finished");
		result
	}

	/// Call a single frame with string arguments, returning its acquired result
	///
	/// Returns `None` if the function produced nil or the program exited
	pub fn run_function (&mut self, frame_id: usize, args: &[&[u8]]) -> VmResult<Option<TreeId>> {
		let info = match self.rtd.frame_info.get(frame_id) {
			Some(info) => info,
			None => return Err(VmError::UnknownFrame(frame_id)),
		};

		if info.arg_size != args.len() {
			return Err(VmError::ArgumentCount { frame: frame_id, expected: info.arg_size, given: args.len() })
		}

		let code = info.code_wc;
		let base = self.stack.len();

		self.stack.reserve(args.len());
		for arg in args {
			let s = self.arena.construct_str(arg)?;
			self.stack.push(Slot::Tree(s));
		}

		let mut exec = self.push_host_frame(frame_id);

		tracing::debug!(target: "arbor::program", frame = self.rtd.frame_info[frame_id].name.as_str(), "running function");

		let result = self.execute(&mut exec, code);

		let parser = exec.parser.take();
		self.arena.downref(parser);

		if result.is_err() || self.induce_exit || self.stack.len() != base + 1 {
			let above = self.stack.len() - base;
			self.stack.pop_release(&mut self.arena, above);
			return result.map(|_| None)
		}

		Ok(self.stack.pop_tree())
	}

	/// Release everything the program holds and report what was never released
	pub fn delete_program (mut self) -> Teardown {
		let depth = self.stack.len();
		self.stack.pop_release(&mut self.arena, depth);

		let roots = [self.return_val.take(), Some(self.global), self.error.take(), Some(self.true_val), Some(self.false_val)];
		for root in roots {
			self.arena.downref(root);
		}

		for kid in std::mem::take(&mut self.heap) {
			let kid = self.arena.kids.free(kid);
			self.arena.downref(kid.tree);
		}

		let leaks = self.arena.leak_report();

		if self.config.report_leaks {
			for &(pool, lost) in leaks.pools.iter().filter(|&&(_, lost)| lost != 0) {
				tracing::warn!(target: "arbor::program", pool, lost, "objects were never released");
			}
		}

		tracing::debug!(target: "arbor::program", exit_status = self.exit_status, clean = leaks.is_clean(), "program deleted");

		Teardown { exit_status: self.exit_status, leaks }
	}


	/// Get the bytes written by `Print`
	pub fn output (&self) -> &[u8] {
		&self.output
	}

	/// Get the status passed to `Exit`, or 0
	pub fn exit_status (&self) -> i64 {
		self.exit_status
	}

	/// Get the value the root code returned, without acquiring it
	pub fn return_value (&self) -> Option<TreeId> {
		self.return_val
	}

	/// Get the last parse error, without acquiring it
	pub fn error (&self) -> Option<TreeId> {
		self.error
	}

	/// Get the compiled tables
	pub fn runtime (&self) -> &RuntimeData {
		&self.rtd
	}
}
