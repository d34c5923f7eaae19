//! The dispatch loop
//!
//! Execution is flat: calls, grammar actions and generators all push frames
//! onto the one operand stack and jump, and returning to the host is a
//! saved instruction pointer of `None`. Parse instructions re-enter the LR
//! driver, which suspends whenever it needs an action run; the following
//! `PcrCall` runs it and jumps back to the parse instruction

use std::cmp::Ordering;

use crate::{
	error::{ VmError, VmResult },
	parse::{ ParseCx, Pcr },
	pool::*,
	tree::{ Tree, TreeValue, LelId, lel_id, map::MapStored },
	vm::{
		Program,
		instruction::{ Codable, Opcode, jump_target },
		iter::IterMode,
		rcode::RevOp,
		stack::*,
	},
};



/// The interpreter registers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Execution {
	/// Index of the first local of the running frame
	pub fp: usize,
	/// Frame pointer of the innermost running generator
	pub ifp: usize,
	/// The running frame, if it has a descriptor
	pub frame_id: Option<usize>,
	/// The parser whose actions are running, owning one reference
	pub parser: Option<TreeId>,
	/// That parser's step count when it was entered
	pub steps: i64,
	/// That parser's continuation code
	pub pcr: Pcr,
}

impl Execution {
	/// Create a new Execution with empty registers
	pub fn new () -> Self {
		Self {
			fp: 0,
			ifp: 0,
			frame_id: None,
			parser: None,
			steps: 0,
			pcr: Pcr::Start,
		}
	}
}

impl Default for Execution { fn default () -> Self { Self::new() } }


fn frame_id_from (value: i64) -> Option<usize> {
	usize::try_from(value).ok()
}

fn frame_id_to (frame_id: Option<usize>) -> i64 {
	frame_id.map_or(-1, |f| f as i64)
}

fn operand (tree: Option<TreeId>, op: Opcode) -> TreeId {
	match tree {
		Some(tree) => tree,
		None => panic!("{:?} applied to nil", op),
	}
}

fn atoi (data: &[u8]) -> i64 {
	let mut bytes = data.iter().copied().skip_while(u8::is_ascii_whitespace).peekable();

	let negative = match bytes.peek() {
		Some(b'-') => { bytes.next(); true }
		Some(b'+') => { bytes.next(); false }
		_ => false,
	};

	let value = bytes
		.take_while(u8::is_ascii_digit)
		.fold(0i64, |acc, b| acc.wrapping_mul(10).wrapping_add((b - b'0') as i64));

	if negative { value.wrapping_neg() } else { value }
}



impl Program {
	fn local_index (exec: &Execution, local: i16) -> usize {
		frame_slot(exec.fp, local as isize)
	}

	fn set_local (&mut self, index: usize, value: Option<TreeId>) {
		let old = self.stack.get(index).as_tree();
		self.stack.set(index, Slot::tree(value));
		self.arena.downref(old);
	}

	fn local_ref (&self, index: usize) -> Ref {
		match self.stack.get(index) {
			Slot::Ref(r) => r,
			other => panic!("expected a reference local at {}, found {:?}", index, other),
		}
	}

	fn running_frame (exec: &Execution) -> usize {
		match exec.frame_id {
			Some(frame) => frame,
			None => panic!("frame operation outside of a frame"),
		}
	}

	/// Pop two operands, returning them in push order
	fn pop_two (&mut self) -> (Option<TreeId>, Option<TreeId>) {
		let b = self.stack.pop_tree();
		let a = self.stack.pop_tree();
		(a, b)
	}

	/// Pop `n` operands, returning them in push order
	fn pop_args (&mut self, n: usize) -> Vec<Option<TreeId>> {
		let mut args: Vec<Option<TreeId>> = (0..n).map(|_| self.stack.pop_tree()).collect();
		args.reverse();
		args
	}

	fn release_all (&mut self, trees: Vec<Option<TreeId>>) {
		for tree in trees {
			self.arena.downref(tree);
		}
	}

	/// Release the operands an instruction popped if it failed
	fn release_on_err<T> (&mut self, result: VmResult<T>, held: &[Option<TreeId>]) -> VmResult<T> {
		if result.is_err() {
			for &tree in held {
				self.arena.downref(tree);
			}
		}

		result
	}

	fn str_data (&self, tree: Option<TreeId>) -> Vec<u8> {
		tree.map_or_else(Vec::new, |t| self.arena.tree_data(t).to_vec())
	}

	fn push_int (&mut self, value: i64) -> VmResult<()> {
		let tree = self.arena.construct_int(value)?;
		self.stack.push(Slot::Tree(tree));
		Ok(())
	}

	fn push_str (&mut self, data: &[u8]) -> VmResult<()> {
		let tree = self.arena.construct_str(data)?;
		self.stack.push(Slot::Tree(tree));
		Ok(())
	}

	pub(crate) fn ptr_kid (&self, ptr: TreeId) -> KidId {
		match self.arena.trees[ptr].value {
			TreeValue::Ptr(kid) => kid,
			other => panic!("expected a pointer, found {:?}", other),
		}
	}

	fn active_parser (exec: &Execution) -> TreeId {
		match exec.parser {
			Some(parser) => parser,
			None => panic!("parser instruction outside of a parse"),
		}
	}

	fn reduced_node (&self, exec: &Execution) -> (ParserId, ParseTreeId) {
		let pid = self.arena.parser_id(Self::active_parser(exec));

		match self.arena.parsers[pid].pda.red_lel {
			Some(red) => (pid, red),
			None => panic!("reduction instruction outside of a reduction action"),
		}
	}


	fn log_parser (&self, exec: &Execution) -> Option<ParserId> {
		exec.parser.map(|parser| self.arena.parser_id(parser))
	}

	/// Begin a unit at a root the undo can reach again
	fn log_root (&mut self, exec: &Execution, op: RevOp) {
		match self.log_parser(exec) {
			Some(pid) => {
				let log = &mut self.arena.parsers[pid].pda.rcode_collect;
				log.unit_start();
				log.push_nav(op);
			}

			None => op.release(&mut self.arena),
		}
	}

	fn log_nav (&mut self, exec: &Execution, op: RevOp) {
		match self.log_parser(exec) {
			Some(pid) if self.arena.parsers[pid].pda.rcode_collect.is_rooted() => {
				self.arena.parsers[pid].pda.rcode_collect.push_nav(op)
			}

			_ => op.release(&mut self.arena),
		}
	}

	fn log_term (&mut self, exec: &Execution, op: RevOp) {
		match self.log_parser(exec) {
			Some(pid) if self.arena.parsers[pid].pda.rcode_collect.is_rooted() => {
				self.arena.parsers[pid].pda.rcode_collect.push_term(op)
			}

			_ => op.release(&mut self.arena),
		}
	}

	fn log_alone (&mut self, exec: &Execution, op: RevOp) {
		match self.log_parser(exec) {
			Some(pid) => self.arena.parsers[pid].pda.rcode_collect.push_alone(op),
			None => op.release(&mut self.arena),
		}
	}


	/// Push a call frame header and zeroed locals
	fn push_frame (&mut self, exec: &mut Execution, saved: Slot, ret: usize, frame: usize) {
		let frame_size = self.rtd.frame_info[frame].frame_size;

		self.stack.reserve(FR_AA + frame_size);
		self.stack.push(saved);
		self.stack.push(Slot::Code(Some(ret)));
		self.stack.push(Slot::Int(exec.fp as i64));
		self.stack.push(Slot::Int(frame_id_to(exec.frame_id)));

		exec.fp = self.stack.len();
		exec.frame_id = Some(frame);

		for _ in 0..frame_size { self.stack.push(Slot::Nil) }
	}

	fn pop_locals (&mut self, exec: &Execution) {
		let frame = Self::running_frame(exec);
		let info = &self.rtd.frame_info[frame];

		assert_eq!(self.stack.len(), exec.fp + info.frame_size, "stack does not match frame {} at return", info.name);

		let frame_size = info.frame_size;
		self.stack.pop_release(&mut self.arena, frame_size);
	}

	/// Release every frame up to the one the host entered, leaving its header
	fn unwind (&mut self, exec: &mut Execution) {
		loop {
			let above = self.stack.len() - exec.fp;
			self.stack.pop_release(&mut self.arena, above);

			if let Slot::UserIter(iter) = self.stack.get(frame_slot(exec.fp, IFR_REC)) {
				let ifp = self.stack.get(frame_slot(exec.fp, IFR_RIF)).as_int() as usize;
				let fp = self.stack.get(frame_slot(exec.fp, IFR_RFR)).as_int() as usize;
				self.stack.popn(FR_AA);

				exec.fp = fp;
				exec.ifp = ifp;
				exec.frame_id = iter.ret_frame_id;
				continue
			}

			match self.stack.get(frame_slot(exec.fp, FR_RI)) {
				Slot::Code(None) => break,
				Slot::Code(Some(_)) => { }
				other => panic!("expected a frame header while unwinding, found {:?}", other),
			}

			exec.frame_id = frame_id_from(self.stack.pop_int());
			exec.fp = self.stack.pop_int() as usize;
			self.stack.pop();

			match self.stack.pop() {
				Slot::Int(ifp) => exec.ifp = ifp as usize,
				Slot::Tree(rv) => self.arena.downref(Some(rv)),
				_ => { }
			}
		}

		let parser = exec.parser.take();
		self.arena.downref(parser);
	}


	fn parse_step (&mut self, exec: &Execution, op: Opcode, stop: LelId) -> VmResult<Pcr> {
		let pid = self.arena.parser_id(Self::active_parser(exec));
		let rtd = self.rtd.clone();
		let (ctx_dep, induce_exit) = (self.config.ctx_dep_parsing, self.induce_exit);
		let revert = matches!(op, Opcode::ParseFragWv | Opcode::ParseFinishWv);
		let entry = exec.pcr;

		self.arena.with_parser(pid, |parser, arena| {
			if entry == Pcr::Start {
				parser.pda.revert_on = revert;
			}

			let mut cx = ParseCx { arena, rtd: &rtd, ctx_dep, induce_exit };

			match op {
				Opcode::ParseFragWc | Opcode::ParseFragWv => parser.parse_frag(&mut cx, stop, entry),
				_ => parser.parse_finish(&mut cx, stop, entry),
			}
		})
	}

	fn parse_exit (&mut self, exec: &mut Execution, op: Opcode) {
		let finish = matches!(op, Opcode::ParseFinishExitWc | Opcode::ParseFinishExitWv);

		let pcr = Pcr::from_int(self.stack.pop_int());
		let steps = self.stack.pop_int();
		let outer = self.stack.pop_tree();

		let parser = Self::active_parser(exec);
		let pid = self.arena.parser_id(parser);

		let error = self.arena.parsers[pid].error;
		if error.is_some() {
			let error = self.arena.upref(error);
			let old = std::mem::replace(&mut self.error, error);
			self.arena.downref(old);
		}

		let result = if finish { self.arena.parsers[pid].result.take() } else { None };
		let record = RevOp::ParseFrag { parser, steps: exec.steps, finish };

		exec.parser = outer;
		exec.steps = steps;
		exec.pcr = pcr;

		match op {
			Opcode::ParseFragExitWv | Opcode::ParseFinishExitWv => self.log_alone(exec, record),
			_ => record.release(&mut self.arena),
		}

		if finish {
			self.stack.push_tree(result);
		}
	}


	/// Run instructions from `ip` until the frame the host entered returns,
	/// or until `Stop` or `Exit`
	pub fn execute (&mut self, exec: &mut Execution, mut ip: usize) -> VmResult<()> {
		let rtd = self.rtd.clone();
		let code = &rtd.code[..];

		loop {
			let at = ip;
			let op = Opcode::decode(&mut ip, code);
			tracing::trace!(target: "arbor::bytecode", ip = at, ?op, depth = self.stack.len());

			match op {
				Opcode::LoadNil => self.stack.push(Slot::Nil),
				Opcode::LoadTrue => self.push_bool(true),
				Opcode::LoadFalse => self.push_bool(false),

				Opcode::LoadInt => {
					let value = i64::decode(&mut ip, code);
					self.push_int(value)?;
				}

				Opcode::LoadStr => {
					let literal = u16::decode(&mut ip, code) as usize;
					self.push_str(&rtd.literals[literal])?;
				}


				Opcode::Pop => self.stack.pop_release(&mut self.arena, 1),

				Opcode::PopN => {
					let n = u16::decode(&mut ip, code) as usize;
					self.stack.pop_release(&mut self.arena, n);
				}

				Opcode::DupTop => {
					let top = self.arena.upref(self.stack.top().as_tree());
					self.stack.push_tree(top);
				}


				Opcode::AddInt | Opcode::SubInt | Opcode::MultInt | Opcode::DivInt => {
					let (a, b) = self.pop_two();
					let (x, y) = (self.arena.int_value(a), self.arena.int_value(b));
					self.arena.downref(a);
					self.arena.downref(b);

					let value = match op {
						Opcode::AddInt => x.wrapping_add(y),
						Opcode::SubInt => x.wrapping_sub(y),
						Opcode::MultInt => x.wrapping_mul(y),
						_ => {
							if y == 0 { return Err(VmError::DivisionByZero { ip: at }) }
							x.wrapping_div(y)
						}
					};

					self.push_int(value)?;
				}


				Opcode::TstEql | Opcode::TstNotEql
				| Opcode::TstLess | Opcode::TstLessEql
				| Opcode::TstGrtr | Opcode::TstGrtrEql
				=> {
					let (a, b) = self.pop_two();
					let ord = self.arena.cmp_tree(&rtd, a, b);
					self.arena.downref(a);
					self.arena.downref(b);

					self.push_bool(match op {
						Opcode::TstEql => ord == Ordering::Equal,
						Opcode::TstNotEql => ord != Ordering::Equal,
						Opcode::TstLess => ord == Ordering::Less,
						Opcode::TstLessEql => ord != Ordering::Greater,
						Opcode::TstGrtr => ord == Ordering::Greater,
						_ => ord != Ordering::Less,
					});
				}

				Opcode::TstLogicalAnd | Opcode::TstLogicalOr => {
					let (a, b) = self.pop_two();
					let (x, y) = (!self.test_false(a), !self.test_false(b));
					self.arena.downref(a);
					self.arena.downref(b);

					self.push_bool(if op == Opcode::TstLogicalAnd { x && y } else { x || y });
				}

				Opcode::Not => {
					let a = self.stack.pop_tree();
					let value = self.test_false(a);
					self.arena.downref(a);
					self.push_bool(value);
				}


				Opcode::ConcatStr => {
					let (a, b) = self.pop_two();
					let mut data = self.str_data(a);
					data.extend_from_slice(&self.str_data(b));
					self.arena.downref(a);
					self.arena.downref(b);
					self.push_str(&data)?;
				}

				Opcode::StrLength | Opcode::StrAtoi => {
					let s = self.stack.pop_tree();
					let data = self.str_data(s);
					self.arena.downref(s);

					self.push_int(if op == Opcode::StrLength { data.len() as i64 } else { atoi(&data) })?;
				}

				Opcode::IntToStr => {
					let i = self.stack.pop_tree();
					let value = self.arena.int_value(i);
					self.arena.downref(i);
					self.push_str(value.to_string().as_bytes())?;
				}

				Opcode::ToUpper | Opcode::ToLower => {
					let s = self.stack.pop_tree();
					let mut data = self.str_data(s);
					self.arena.downref(s);

					if op == Opcode::ToUpper {
						data.make_ascii_uppercase()
					} else {
						data.make_ascii_lowercase()
					}

					self.push_str(&data)?;
				}


				Opcode::Jmp => {
					let offset = i16::decode(&mut ip, code);
					ip = jump_target(ip, offset);
				}

				Opcode::JmpFalse | Opcode::JmpTrue => {
					let offset = i16::decode(&mut ip, code);
					let cond = self.stack.pop_tree();
					let is_false = self.test_false(cond);
					self.arena.downref(cond);

					if is_false == (op == Opcode::JmpFalse) {
						ip = jump_target(ip, offset);
					}
				}

				Opcode::CallWc | Opcode::CallWv => {
					let frame = u16::decode(&mut ip, code) as usize;
					let info = &rtd.frame_info[frame];

					self.push_frame(exec, Slot::Nil, ip, frame);
					ip = if op == Opcode::CallWv { info.code_wv } else { info.code_wc };
				}

				Opcode::Ret => {
					let frame = Self::running_frame(exec);
					self.pop_locals(exec);

					exec.frame_id = frame_id_from(self.stack.pop_int());
					exec.fp = self.stack.pop_int() as usize;

					let ret = match self.stack.pop() {
						Slot::Code(ret) => ret,
						other => panic!("expected a return instruction, found {:?}", other),
					};

					let rv = self.stack.pop_tree();
					self.stack.pop_release(&mut self.arena, rtd.frame_info[frame].arg_size);
					self.stack.push_tree(rv);

					match ret {
						Some(ret) => ip = ret,
						None => return Ok(()),
					}
				}

				Opcode::Stop => return Ok(()),

				Opcode::Exit => {
					let status = self.stack.pop_tree();
					self.exit_status = self.arena.int_value(status);
					self.arena.downref(status);
					self.induce_exit = true;

					tracing::debug!(target: "arbor::program", status = self.exit_status, "exit requested, unwinding");
					self.unwind(exec);
					return Ok(())
				}


				Opcode::InitLocals => {
					let size = u16::decode(&mut ip, code) as usize;
					self.stack.reserve(size);
					exec.fp = self.stack.len();

					for _ in 0..size { self.stack.push(Slot::Nil) }
				}

				Opcode::PopLocals => {
					let size = u16::decode(&mut ip, code) as usize;
					self.stack.pop_release(&mut self.arena, size);
				}

				Opcode::GetLocalR => {
					let index = Self::local_index(exec, i16::decode(&mut ip, code));
					let value = self.arena.upref(self.stack.get(index).as_tree());
					self.stack.push_tree(value);
				}

				Opcode::GetLocalWc => {
					let index = Self::local_index(exec, i16::decode(&mut ip, code));

					if let Some(tree) = self.stack.get(index).as_tree() {
						let private = self.arena.split(tree)?;
						self.stack.set(index, Slot::Tree(private));
					}

					let value = self.arena.upref(self.stack.get(index).as_tree());
					self.stack.push_tree(value);
				}

				Opcode::SetLocalWc => {
					let index = Self::local_index(exec, i16::decode(&mut ip, code));
					let value = self.stack.pop_tree();
					self.set_local(index, value);
				}

				Opcode::SaveRet => {
					let value = self.stack.pop_tree();
					self.set_local(frame_slot(exec.fp, FR_RV), value);
				}

				Opcode::RefFromLocal => {
					let index = Self::local_index(exec, i16::decode(&mut ip, code));
					self.stack.push(Slot::Ref(Ref { kid: Some(Cell::Slot(index)), next: None }));
				}

				Opcode::RefFromRef => {
					let index = Self::local_index(exec, i16::decode(&mut ip, code));
					let r = self.local_ref(index);
					self.stack.push(Slot::Ref(Ref { kid: r.kid, next: Some(index) }));
				}

				Opcode::GetLocalRefR => {
					let index = Self::local_index(exec, i16::decode(&mut ip, code));
					let r = self.local_ref(index);
					let value = self.arena.upref(self.cell_tree(r.kid));
					self.stack.push_tree(value);
				}

				Opcode::GetLocalRefWc => {
					let index = Self::local_index(exec, i16::decode(&mut ip, code));
					let mut r = self.local_ref(index);
					self.split_ref(&mut r)?;
					self.stack.set(index, Slot::Ref(r));

					let value = self.arena.upref(self.cell_tree(r.kid));
					self.stack.push_tree(value);
				}

				Opcode::SetLocalRefWc => {
					let index = Self::local_index(exec, i16::decode(&mut ip, code));
					let mut r = self.local_ref(index);
					self.split_ref(&mut r)?;
					self.stack.set(index, Slot::Ref(r));

					let value = self.stack.pop_tree();
					self.ref_set_value(r, value);
				}


				Opcode::GetFieldR => {
					let field = u16::decode(&mut ip, code);
					let obj = self.stack.pop_tree();
					let value = self.arena.get_field(operand(obj, op), field as usize);
					let value = self.arena.upref(value);
					self.stack.push_tree(value);
					self.arena.downref(obj);
				}

				Opcode::GetFieldWc | Opcode::GetFieldWv => {
					let field = u16::decode(&mut ip, code);
					let obj = self.stack.pop_tree();
					let value = self.arena.get_field_split(operand(obj, op), field as usize);
					let value = self.release_on_err(value, &[obj])?;
					let value = self.arena.upref(value);
					self.stack.push_tree(value);
					self.arena.downref(obj);

					if op == Opcode::GetFieldWv {
						self.log_nav(exec, RevOp::GetField(field));
					}
				}

				Opcode::SetFieldWc | Opcode::SetFieldWv => {
					let field = u16::decode(&mut ip, code);
					let obj = self.stack.pop_tree();
					let value = self.stack.pop_tree();
					let prev = self.arena.set_field(operand(obj, op), field as usize, value);

					if op == Opcode::SetFieldWv {
						self.log_term(exec, RevOp::SetField { field, prev });
					} else {
						self.arena.downref(prev);
					}

					self.arena.downref(obj);
				}

				Opcode::SetFieldLeaveWc => {
					let field = u16::decode(&mut ip, code);
					let obj = self.stack.pop_tree();
					let value = self.arena.upref(self.stack.top().as_tree());
					let prev = self.arena.set_field(operand(obj, op), field as usize, value);
					self.arena.downref(prev);
					self.arena.downref(obj);
				}

				Opcode::LoadGlobalR | Opcode::LoadGlobalWc | Opcode::LoadGlobalWv => {
					let global = self.arena.upref(Some(self.global));
					self.stack.push_tree(global);

					if op == Opcode::LoadGlobalWv {
						self.log_root(exec, RevOp::LoadGlobal);
					}
				}


				Opcode::TreeNew => {
					let value = self.stack.pop_tree();
					let kid = self.arena.alloc_kid(value, None)?;
					self.heap.push(kid);

					let ptr = self.arena.alloc_tree(Tree { refs: 1, value: TreeValue::Ptr(kid), .. Tree::new(lel_id::PTR) })?;
					self.stack.push(Slot::Tree(ptr));
				}

				Opcode::PtrDerefR => {
					let ptr = self.stack.pop_tree();
					let kid = self.ptr_kid(operand(ptr, op));
					let value = self.arena.upref(self.arena.kids[kid].tree);
					self.stack.push_tree(value);
					self.arena.downref(ptr);
				}

				Opcode::PtrDerefWc | Opcode::PtrDerefWv => {
					let ptr = operand(self.stack.pop_tree(), op);
					let kid = self.ptr_kid(ptr);
					let value = self.arena.split_kid(kid);
					let value = self.release_on_err(value, &[Some(ptr)])?;
					let value = self.arena.upref(value);
					self.stack.push_tree(value);

					if op == Opcode::PtrDerefWv {
						self.log_root(exec, RevOp::PtrDeref(ptr));
					} else {
						self.arena.downref(Some(ptr));
					}
				}


				Opcode::TreeSearch => {
					let id = u16::decode(&mut ip, code);
					let tree = self.stack.pop_tree();
					let found = tree.and_then(|t| self.arena.tree_search(&rtd, t, id));
					let found = self.arena.upref(found);
					self.stack.push_tree(found);
					self.arena.downref(tree);
				}

				Opcode::GetTokenDataR => {
					let tree = self.stack.pop_tree();
					let data = self.str_data(tree);
					self.arena.downref(tree);
					self.push_str(&data)?;
				}

				Opcode::SetTokenDataWc | Opcode::SetTokenDataWv => {
					let obj = operand(self.stack.pop_tree(), op);
					let value = self.stack.pop_tree();
					let data = self.str_data(value);

					let head = self.arena.alloc_head(&data, None);
					let head = self.release_on_err(head, &[value, Some(obj)])?;
					let prev = self.arena.trees[obj].tokdata.replace(head);

					if op == Opcode::SetTokenDataWv {
						self.log_term(exec, RevOp::SetTokenData { prev });
					} else if let Some(prev) = prev {
						self.arena.free_head(prev);
					}

					self.arena.downref(value);
					self.arena.downref(Some(obj));
				}

				Opcode::GetTokenPos => {
					let tree = self.stack.pop_tree();
					let byte = tree
						.and_then(|t| self.arena.trees[t].tokdata)
						.and_then(|head| self.arena.head_location(head))
						.map(|location| location.byte as i64);
					self.arena.downref(tree);

					match byte {
						Some(byte) => self.push_int(byte)?,
						None => self.stack.push(Slot::Nil),
					}
				}

				Opcode::ConstructTerm => {
					let id = u16::decode(&mut ip, code);
					let text = self.stack.pop_tree();
					let data = self.str_data(text);
					self.arena.downref(text);

					let token = self.arena.construct_token(&rtd, id, &data, None)?;
					self.stack.push(Slot::Tree(token));
				}

				Opcode::MakeToken => {
					let n = u16::decode(&mut ip, code) as usize;
					let args = self.pop_args(n);
					let id = self.arena.int_value(args[0]) as LelId;
					let data = self.str_data(args[1]);

					let token = self.arena.construct_token(&rtd, id, &data, None);
					let token = self.release_on_err(token, &args)?;
					for (field, &attr) in args[2..].iter().enumerate() {
						let attr = self.arena.upref(attr);
						let prev = self.arena.set_field(token, field, attr);
						self.arena.downref(prev);
					}

					self.release_all(args);
					self.stack.push(Slot::Tree(token));
				}

				Opcode::MakeTree => {
					let n = u16::decode(&mut ip, code) as usize;
					let args = self.pop_args(n);
					let id = self.arena.int_value(args[0]) as LelId;

					let tree = self.arena.construct_tree(&rtd, id, &args[1..]);
					let tree = self.release_on_err(tree, &args)?;
					self.release_all(args);
					self.stack.push(Slot::Tree(tree));
				}

				Opcode::Match => {
					let pattern = u16::decode(&mut ip, code) as usize;
					let tree = self.stack.pop_tree();

					match self.arena.match_pattern(&rtd, pattern, tree) {
						Some(bindings) => {
							self.push_bool(true);
							for bound in bindings {
								let bound = self.arena.upref(Some(bound));
								self.stack.push_tree(bound);
							}
						}

						None => {
							self.push_bool(false);
							for _ in 0..rtd.patterns[pattern].num_bindings {
								self.stack.push(Slot::Nil);
							}
						}
					}

					self.arena.downref(tree);
				}

				Opcode::Construct => {
					let pattern = u16::decode(&mut ip, code) as usize;
					let n = rtd.patterns[pattern].num_bindings;
					let bindings: Vec<Option<TreeId>> = (0..n).map(|_| self.stack.pop_tree()).collect();

					let tree = self.arena.construct_pattern(&rtd, pattern, &bindings);
					let tree = self.release_on_err(tree, &bindings)?;
					self.release_all(bindings);
					self.stack.push_tree(tree);
				}


				Opcode::ConsList => {
					let list = self.arena.construct_list()?;
					self.stack.push(Slot::Tree(list));
				}

				Opcode::ConsMap => {
					let map = self.arena.construct_map()?;
					self.stack.push(Slot::Tree(map));
				}

				Opcode::ConsParser => {
					let parser = u16::decode(&mut ip, code) as usize;
					let tree = self.arena.construct_parser(&rtd, parser)?;
					self.stack.push(Slot::Tree(tree));
				}

				Opcode::ListLength | Opcode::MapLength => {
					let obj = self.stack.pop_tree();
					let len = if op == Opcode::ListLength {
						self.arena.list_length(operand(obj, op))
					} else {
						self.arena.map_length(operand(obj, op))
					};

					self.arena.downref(obj);
					self.push_int(len as i64)?;
				}

				Opcode::ListAppendWc | Opcode::ListAppendWv => {
					let list = self.stack.pop_tree();
					let value = self.stack.pop_tree();
					let appended = self.arena.list_append(operand(list, op), value);
					self.release_on_err(appended, &[list])?;

					if op == Opcode::ListAppendWv {
						self.log_term(exec, RevOp::ListAppend);
					}

					self.arena.downref(list);
				}

				Opcode::ListRemoveEndWc | Opcode::ListRemoveEndWv => {
					let list = self.stack.pop_tree();
					let removed = self.arena.list_remove_end(operand(list, op));

					if op == Opcode::ListRemoveEndWv {
						let value = self.arena.upref(removed.flatten());
						self.log_term(exec, RevOp::ListRemoveEnd { removed: removed.is_some(), value });
					}

					match removed {
						Some(value) => self.stack.push_tree(value),
						None => self.push_bool(false),
					}

					self.arena.downref(list);
				}

				Opcode::GetListMemR => {
					let field = u16::decode(&mut ip, code);
					let list = self.stack.pop_tree();
					let value = self.arena.get_list_mem(operand(list, op), field as usize);
					let value = self.arena.upref(value);
					self.stack.push_tree(value);
					self.arena.downref(list);
				}

				Opcode::GetListMemWc | Opcode::GetListMemWv => {
					let field = u16::decode(&mut ip, code);
					let list = self.stack.pop_tree();
					let value = self.arena.get_list_mem_split(operand(list, op), field as usize);
					let value = self.release_on_err(value, &[list])?;
					let value = self.arena.upref(value);
					self.stack.push_tree(value);
					self.arena.downref(list);

					if op == Opcode::GetListMemWv {
						self.log_nav(exec, RevOp::GetListMem(field));
					}
				}

				Opcode::SetListMemWc | Opcode::SetListMemWv => {
					let field = u16::decode(&mut ip, code);
					let list = self.stack.pop_tree();
					let value = self.stack.pop_tree();
					let prev = self.arena.set_list_mem(operand(list, op), field as usize, value);

					if op == Opcode::SetListMemWv {
						self.log_term(exec, RevOp::SetListMem { field, prev });
					} else {
						self.arena.downref(prev);
					}

					self.arena.downref(list);
				}

				Opcode::MapFind => {
					let map = self.stack.pop_tree();
					let key = self.stack.pop_tree();
					let value = self.arena.map_find(&rtd, operand(map, op), key);
					let value = self.arena.upref(value);
					self.stack.push_tree(value);
					self.arena.downref(key);
					self.arena.downref(map);
				}

				Opcode::MapInsertWc | Opcode::MapInsertWv => {
					let map = self.stack.pop_tree();
					let value = self.stack.pop_tree();
					let key = self.stack.pop_tree();
					let inserted = self.arena.map_insert(&rtd, operand(map, op), key, value);
					let inserted = self.release_on_err(inserted, &[map])?;

					if !inserted {
						self.arena.downref(key);
						self.arena.downref(value);
					}

					if op == Opcode::MapInsertWv {
						let key = if inserted { self.arena.upref(key) } else { None };
						self.log_term(exec, RevOp::MapInsert { inserted, key });
					}

					self.push_bool(inserted);
					self.arena.downref(map);
				}

				Opcode::MapStoreWc | Opcode::MapStoreWv => {
					let map = self.stack.pop_tree();
					let value = self.stack.pop_tree();
					let key = self.stack.pop_tree();
					let stored = self.arena.map_store(&rtd, operand(map, op), key, value);
					let stored = self.release_on_err(stored, &[map])?;

					match (stored, op == Opcode::MapStoreWv) {
						(MapStored::Inserted, true) => {
							let key = self.arena.upref(key);
							self.log_term(exec, RevOp::MapStore { key, prev: None });
						}

						(MapStored::Replaced(prev), true) => {
							self.log_term(exec, RevOp::MapStore { key, prev: Some(prev) });
						}

						(MapStored::Inserted, false) => { }

						(MapStored::Replaced(prev), false) => {
							self.arena.downref(key);
							self.arena.downref(prev);
						}
					}

					self.arena.downref(map);
				}

				Opcode::MapRemoveWc | Opcode::MapRemoveWv => {
					let map = self.stack.pop_tree();
					let key = self.stack.pop_tree();
					let removed = self.arena.map_remove(&rtd, operand(map, op), key);

					match removed {
						Some((k, v)) => {
							if op == Opcode::MapRemoveWv {
								let value = self.arena.upref(v);
								self.log_term(exec, RevOp::MapRemove { removed: true, key: k, value });
							} else {
								self.arena.downref(k);
							}

							self.stack.push_tree(v);
						}

						None => {
							if op == Opcode::MapRemoveWv {
								self.log_term(exec, RevOp::MapRemove { removed: false, key: None, value: None });
							}

							self.push_bool(false);
						}
					}

					self.arena.downref(key);
					self.arena.downref(map);
				}


				Opcode::TriterFromRef | Opcode::RevTriterFromRef => {
					let local = i16::decode(&mut ip, code);
					let args = u16::decode(&mut ip, code) as usize;
					let search = u16::decode(&mut ip, code);

					if op == Opcode::TriterFromRef {
						self.triter_from_ref(exec, local, args, search);
					} else {
						self.rev_triter_from_ref(exec, local, args, search);
					}
				}

				Opcode::TriterAdvance => {
					let local = i16::decode(&mut ip, code);
					self.triter_advance(exec, local, IterMode::All);
				}

				Opcode::TriterNextRepeat => {
					let local = i16::decode(&mut ip, code);
					self.triter_advance(exec, local, IterMode::NextRepeat);
				}

				Opcode::TriterPrevRepeat => {
					let local = i16::decode(&mut ip, code);
					self.triter_advance(exec, local, IterMode::PrevRepeat);
				}

				Opcode::TriterNextChild => {
					let local = i16::decode(&mut ip, code);
					self.triter_next_child(exec, local);
				}

				Opcode::TriterGetCurR | Opcode::UiterGetCurR => {
					let local = i16::decode(&mut ip, code);
					self.iter_get_cur_r(exec, local);
				}

				Opcode::TriterGetCurWc | Opcode::UiterGetCurWc => {
					let local = i16::decode(&mut ip, code);
					self.iter_get_cur_wc(exec, local)?;
				}

				Opcode::TriterSetCurWc | Opcode::UiterSetCurWc => {
					let local = i16::decode(&mut ip, code);
					self.iter_set_cur_wc(exec, local)?;
				}

				Opcode::TriterDestroy => {
					let local = i16::decode(&mut ip, code);
					self.triter_destroy(exec, local);
				}

				Opcode::RevTriterPrevChild => {
					let local = i16::decode(&mut ip, code);
					self.rev_triter_prev_child(exec, local);
				}

				Opcode::RevTriterDestroy => {
					let local = i16::decode(&mut ip, code);
					self.rev_triter_destroy(exec, local);
				}

				Opcode::UiterCreateWc | Opcode::UiterCreateWv => {
					let local = i16::decode(&mut ip, code);
					let frame = u16::decode(&mut ip, code) as usize;
					let search = u16::decode(&mut ip, code);
					self.uiter_create(exec, local, frame, search, op == Opcode::UiterCreateWv);
				}

				Opcode::UiterAdvance => {
					let local = i16::decode(&mut ip, code);
					ip = self.uiter_advance(exec, local, ip);
				}

				Opcode::UiterDestroy => {
					let local = i16::decode(&mut ip, code);
					self.uiter_destroy(exec, local);
				}

				Opcode::Yield => ip = self.uiter_yield(exec, ip),


				Opcode::ParseSaveSteps => {
					let parser = operand(self.stack.pop_tree(), op);
					let pid = self.arena.parser_id(parser);

					self.stack.push_tree(exec.parser);
					self.stack.push(Slot::Int(exec.steps));
					self.stack.push(Slot::Int(exec.pcr.to_int()));

					exec.parser = Some(parser);
					exec.steps = self.arena.parsers[pid].pda.steps;
					exec.pcr = Pcr::Start;
				}

				Opcode::ParseFragWc | Opcode::ParseFragWv | Opcode::ParseFinishWc | Opcode::ParseFinishWv => {
					let stop = u16::decode(&mut ip, code);
					exec.pcr = self.parse_step(exec, op, stop)?;

					if exec.pcr == Pcr::Done {
						// step over the PcrCall
						ip += 1;
					}
				}

				Opcode::ParseFragExitWc | Opcode::ParseFragExitWv | Opcode::ParseFinishExitWc | Opcode::ParseFinishExitWv => {
					self.parse_exit(exec, op);
				}

				Opcode::PcrCall => {
					// back to the parse instruction: an opcode and a half
					let return_to = at - 1 - u16::SIZE;
					let parser = Self::active_parser(exec);
					let pid = self.arena.parser_id(parser);

					let pda = &mut self.arena.parsers[pid].pda;
					match pda.frame_id {
						Some(frame) => {
							let entry = pda.code;
							tracing::trace!(target: "arbor::bytecode", frame = rtd.frame_info[frame].name.as_str(), pcr = ?exec.pcr, "running action");

							let ifp = Slot::Int(exec.ifp as i64);
							self.push_frame(exec, ifp, return_to, frame);
							ip = entry;
						}

						None => {
							let block = match pda.rev_block.take() {
								Some(block) => block,
								None => panic!("reverse continuation without a block to replay"),
							};

							self.revert_block(parser, block)?;
							ip = return_to;
						}
					}
				}

				Opcode::PcrRet => {
					self.pop_locals(exec);

					exec.frame_id = frame_id_from(self.stack.pop_int());
					exec.fp = self.stack.pop_int() as usize;

					ip = match self.stack.pop() {
						Slot::Code(Some(ret)) => ret,
						other => panic!("expected an action return instruction, found {:?}", other),
					};

					exec.ifp = self.stack.pop_int() as usize;
				}

				Opcode::InitRhsEl => {
					let position = u16::decode(&mut ip, code) as usize;
					let index = Self::local_index(exec, i16::decode(&mut ip, code));
					let (_, red) = self.reduced_node(exec);

					let value = self.arena.parse_trees[red].shadow
						.and_then(|lhs| self.arena.get_rhs_el(&rtd, lhs, position));
					let value = self.arena.upref(value);
					self.set_local(index, value);
				}

				Opcode::InitLhsEl => {
					let index = Self::local_index(exec, i16::decode(&mut ip, code));
					let (pid, red) = self.reduced_node(exec);

					let lhs = self.arena.parse_trees[red].shadow.take();
					let parsed = self.arena.upref(lhs);
					let old = std::mem::replace(&mut self.arena.parsers[pid].pda.parsed, parsed);
					self.arena.downref(old);

					self.set_local(index, lhs);
				}

				Opcode::StoreLhsEl => {
					let index = Self::local_index(exec, i16::decode(&mut ip, code));
					let (_, red) = self.reduced_node(exec);

					let lhs = self.stack.get(index).as_tree();
					self.stack.set(index, Slot::Nil);

					let old = std::mem::replace(&mut self.arena.parse_trees[red].shadow, lhs);
					self.arena.downref(old);
				}

				Opcode::Reject => {
					let pid = self.arena.parser_id(Self::active_parser(exec));
					self.arena.parsers[pid].pda.reject = true;
				}

				Opcode::InputAppendWc | Opcode::InputAppendWv
				| Opcode::InputPushWc | Opcode::InputPushWv
				=> {
					let parser = operand(self.stack.pop_tree(), op);
					let value = self.stack.pop_tree();
					let pid = self.arena.parser_id(parser);

					if let Some(value) = value {
						let append = matches!(op, Opcode::InputAppendWc | Opcode::InputAppendWv);
						let input = &mut self.arena.parsers[pid].input;

						if append { input.append(value) } else { input.push_front(value, false) }

						match op {
							Opcode::InputAppendWv => {
								self.arena.upref(Some(parser));
								self.log_alone(exec, RevOp::InputAppend { parser });
							}

							Opcode::InputPushWv => {
								self.arena.upref(Some(parser));
								self.log_alone(exec, RevOp::InputPush { parser });
							}

							_ => { }
						}
					}

					self.arena.downref(Some(parser));
				}

				Opcode::InputPullWc | Opcode::InputPullWv => {
					let parser = operand(self.stack.pop_tree(), op);
					let pid = self.arena.parser_id(parser);
					let token = self.arena.parsers[pid].input.pull_front();

					if op == Opcode::InputPullWv {
						self.arena.upref(Some(parser));
						let token = self.arena.upref(token);
						self.log_alone(exec, RevOp::InputPull { parser, token });
					}

					self.stack.push_tree(token);
					self.arena.downref(Some(parser));
				}

				Opcode::GetParserError => {
					let parser = operand(self.stack.pop_tree(), op);
					let pid = self.arena.parser_id(parser);
					let error = self.arena.upref(self.arena.parsers[pid].error);
					self.stack.push_tree(error);
					self.arena.downref(Some(parser));
				}


				Opcode::LoadArgv => {
					let list = self.arena.construct_list()?;

					for i in 0..self.args.len() {
						let appended = match self.arena.construct_str(&self.args[i]) {
							Ok(s) => self.arena.list_append(list, Some(s)),
							Err(e) => Err(e),
						};
						self.release_on_err(appended, &[Some(list)])?;
					}

					self.stack.push(Slot::Tree(list));
				}

				Opcode::Print => {
					let n = u16::decode(&mut ip, code) as usize;
					let args = self.pop_args(n);

					for &arg in args.iter() {
						self.arena.print_tree(&rtd, arg, &mut self.output);
					}

					self.release_all(args);
				}
			}
		}
	}
}



#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		config::Config,
		vm::{
			instruction::CodeBuilder,
			runtime::{ RuntimeData, FrameInfo, LangElInfo, ParserInfo, ProdInfo, PdaTablesBuilder, Action },
		},
	};
	use rstest::rstest;

	fn frame (name: &str, code: usize, arg_size: usize, frame_size: usize) -> FrameInfo {
		FrameInfo { name: name.into(), code_wc: code, code_wv: code, arg_size, frame_size }
	}

	fn program (code: Vec<u8>, frames: Vec<FrameInfo>, literals: &[&[u8]]) -> Program {
		let mut rtd = RuntimeData::new();
		rtd.code = code;
		rtd.frame_info = frames;
		rtd.literals = literals.iter().map(|l| l.to_vec()).collect();
		Program::new(rtd, Config::new().with_stack_segment_slots(16)).unwrap()
	}

	fn finish (prg: Program) {
		let teardown = prg.delete_program();
		assert!(teardown.leaks.is_clean(), "{}", teardown.leaks);
	}

	#[rstest]
	#[case(Opcode::AddInt, 3, 4, 7)]
	#[case(Opcode::SubInt, 3, 4, -1)]
	#[case(Opcode::MultInt, -6, 7, -42)]
	#[case(Opcode::DivInt, 9, 2, 4)]
	#[case(Opcode::AddInt, i64::MAX, 1, i64::MIN)]
	fn test_integer_arithmetic (#[case] op: Opcode, #[case] a: i64, #[case] b: i64, #[case] expected: i64) {
		let mut code = CodeBuilder::new();
		code.op(Opcode::LoadInt).word(a).op(Opcode::LoadInt).word(b).op(op).op(Opcode::SaveRet).op(Opcode::Ret);

		let mut prg = program(code.finish(), vec![frame("f", 0, 0, 0)], &[]);
		let result = prg.run_function(0, &[]).unwrap();

		assert_eq!(prg.arena.int_value(result), expected);
		assert_eq!(result.map(|t| prg.arena.trees[t].refs), Some(1));
		assert_eq!(prg.arena.trees.live(), 3 + 1, "only the singletons, the global and the result stay alive");

		prg.arena.downref(result);
		finish(prg);
	}

	#[test]
	fn test_division_by_zero () {
		let mut b = CodeBuilder::new();
		b.op(Opcode::LoadInt).word(1).op(Opcode::LoadInt).word(0).op(Opcode::DivInt).op(Opcode::Ret);

		let mut prg = program(b.finish(), vec![frame("f", 0, 0, 0)], &[]);
		assert_eq!(prg.run_function(0, &[]), Err(VmError::DivisionByZero { ip: 18 }));
		finish(prg);
	}

	#[rstest]
	#[case(Opcode::TstEql, 2, 2, true)]
	#[case(Opcode::TstNotEql, 2, 2, false)]
	#[case(Opcode::TstLess, 1, 2, true)]
	#[case(Opcode::TstLessEql, 3, 2, false)]
	#[case(Opcode::TstGrtr, 3, 2, true)]
	#[case(Opcode::TstGrtrEql, 2, 2, true)]
	#[case(Opcode::TstLogicalAnd, 1, 0, false)]
	#[case(Opcode::TstLogicalOr, 1, 0, true)]
	fn test_comparisons (#[case] op: Opcode, #[case] a: i64, #[case] b: i64, #[case] expected: bool) {
		let mut code = CodeBuilder::new();
		code.op(Opcode::LoadInt).word(a).op(Opcode::LoadInt).word(b).op(op).op(Opcode::SaveRet).op(Opcode::Ret);

		let mut prg = program(code.finish(), vec![frame("f", 0, 0, 0)], &[]);
		let result = prg.run_function(0, &[]).unwrap();

		assert_eq!(!prg.test_false(result), expected);
		assert_eq!(result, Some(prg.bool_val(expected)));

		prg.arena.downref(result);
		finish(prg);
	}

	#[test]
	fn test_strings () {
		let mut b = CodeBuilder::new();
		b.op(Opcode::LoadStr).half(0).op(Opcode::StrAtoi)
			.op(Opcode::LoadInt).word(30).op(Opcode::AddInt)
			.op(Opcode::IntToStr)
			.op(Opcode::LoadStr).half(1).op(Opcode::ToUpper)
			.op(Opcode::ConcatStr)
			.op(Opcode::DupTop).op(Opcode::StrLength)
			.op(Opcode::Print).half(2)
			.op(Opcode::Ret);

		let mut prg = program(b.finish(), vec![frame("f", 0, 0, 0)], &[b"  12xyz", b"ab"]);
		let result = prg.run_function(0, &[]).unwrap();

		assert_eq!(result, None);
		assert_eq!(prg.output(), b"42AB4");
		finish(prg);
	}

	#[test]
	fn test_calls_and_arguments () {
		let mut b = CodeBuilder::new();

		let add_one = b.pos();
		b.op(Opcode::GetLocalR).local(-5)
			.op(Opcode::LoadInt).word(1)
			.op(Opcode::AddInt)
			.op(Opcode::SaveRet)
			.op(Opcode::Ret);

		let main = b.pos();
		b.op(Opcode::LoadInt).word(41)
			.op(Opcode::CallWc).half(1)
			.op(Opcode::SetLocalWc).local(0)
			.op(Opcode::GetLocalR).local(0)
			.op(Opcode::SaveRet)
			.op(Opcode::Ret);

		let frames = vec![frame("main", main, 0, 1), frame("add_one", add_one, 1, 0)];
		let mut prg = program(b.finish(), frames, &[]);
		let result = prg.run_function(0, &[]).unwrap();

		assert_eq!(prg.arena.int_value(result), 42);
		prg.arena.downref(result);
		finish(prg);
	}

	#[test]
	fn test_string_arguments () {
		let mut b = CodeBuilder::new();
		b.op(Opcode::GetLocalR).local(-6)
			.op(Opcode::GetLocalR).local(-5)
			.op(Opcode::ConcatStr)
			.op(Opcode::SaveRet)
			.op(Opcode::Ret);

		let mut prg = program(b.finish(), vec![frame("f", 0, 2, 0)], &[]);

		assert_eq!(prg.run_function(0, &[b"x"]), Err(VmError::ArgumentCount { frame: 0, expected: 2, given: 1 }));
		assert_eq!(prg.run_function(7, &[]), Err(VmError::UnknownFrame(7)));

		let result = prg.run_function(0, &[b"ab", b"cd"]).unwrap();
		assert_eq!(result.map(|t| prg.arena.tree_data(t).to_vec()), Some(b"abcd".to_vec()));

		prg.arena.downref(result);
		finish(prg);
	}

	#[test]
	fn test_exit_unwinds_nested_frames () {
		let mut b = CodeBuilder::new();

		let inner = b.pos();
		b.op(Opcode::LoadStr).half(0).op(Opcode::SetLocalWc).local(0)
			.op(Opcode::LoadStr).half(0)
			.op(Opcode::LoadInt).word(3)
			.op(Opcode::Exit);

		let main = b.pos();
		b.op(Opcode::LoadStr).half(0).op(Opcode::SetLocalWc).local(0)
			.op(Opcode::LoadStr).half(0)
			.op(Opcode::CallWc).half(1)
			.op(Opcode::Ret);

		let frames = vec![frame("main", main, 0, 1), frame("inner", inner, 1, 1)];
		let mut prg = program(b.finish(), frames, &[b"held"]);

		assert_eq!(prg.run_function(0, &[]), Ok(None));
		assert!(prg.stack.is_empty());

		let teardown = prg.delete_program();
		assert_eq!(teardown.exit_status, 3);
		assert!(teardown.leaks.is_clean(), "{}", teardown.leaks);
	}

	#[test]
	fn test_fields_and_globals () {
		let mut b = CodeBuilder::new();
		b.op(Opcode::LoadInt).word(5)
			.op(Opcode::LoadGlobalWc).op(Opcode::SetFieldWc).half(0)
			.op(Opcode::LoadInt).word(6)
			.op(Opcode::LoadGlobalWc).op(Opcode::SetFieldLeaveWc).half(1)
			.op(Opcode::Pop)
			.op(Opcode::LoadGlobalR).op(Opcode::GetFieldR).half(0)
			.op(Opcode::LoadGlobalR).op(Opcode::GetFieldR).half(1)
			.op(Opcode::MultInt)
			.op(Opcode::SaveRet)
			.op(Opcode::Ret);

		let mut rtd = RuntimeData::new();
		rtd.set_global_size(2);
		rtd.code = b.finish();
		rtd.frame_info = vec![frame("f", 0, 0, 0)];

		let mut prg = Program::new(rtd, Config::new()).unwrap();
		let result = prg.run_function(0, &[]).unwrap();

		assert_eq!(prg.arena.int_value(result), 30);
		prg.arena.downref(result);
		finish(prg);
	}

	#[test]
	fn test_lists_and_maps () {
		let mut b = CodeBuilder::new();
		// local 0: list, local 1: map
		b.op(Opcode::ConsList).op(Opcode::SetLocalWc).local(0)
			.op(Opcode::ConsMap).op(Opcode::SetLocalWc).local(1)
			.op(Opcode::LoadInt).word(1).op(Opcode::GetLocalWc).local(0).op(Opcode::ListAppendWc)
			.op(Opcode::LoadInt).word(2).op(Opcode::GetLocalWc).local(0).op(Opcode::ListAppendWc)
			.op(Opcode::GetLocalWc).local(0).op(Opcode::ListRemoveEndWc)
			.op(Opcode::LoadStr).half(0).op(Opcode::LoadInt).word(10).op(Opcode::GetLocalWc).local(1).op(Opcode::MapInsertWc)
			.op(Opcode::LoadStr).half(0).op(Opcode::LoadInt).word(11).op(Opcode::GetLocalWc).local(1).op(Opcode::MapInsertWc)
			.op(Opcode::LoadStr).half(0).op(Opcode::LoadInt).word(12).op(Opcode::GetLocalWc).local(1).op(Opcode::MapStoreWc)
			.op(Opcode::LoadStr).half(0).op(Opcode::GetLocalR).local(1).op(Opcode::MapFind)
			.op(Opcode::GetLocalR).local(0).op(Opcode::ListLength)
			.op(Opcode::LoadStr).half(1).op(Opcode::GetLocalWc).local(1).op(Opcode::MapRemoveWc)
			.op(Opcode::GetLocalR).local(1).op(Opcode::MapLength)
			.op(Opcode::Print).half(7)
			.op(Opcode::Ret);

		let mut prg = program(b.finish(), vec![frame("f", 0, 0, 2)], &[b"k", b"missing"]);
		prg.run_function(0, &[]).unwrap();

		// removed 2, inserted, refused, found 12, one element, nothing removed, one entry
		assert_eq!(prg.output(), b"2truefalse121false1");
		finish(prg);
	}

	#[test]
	fn test_pointers_and_tokens () {
		let mut b = CodeBuilder::new();
		b.op(Opcode::LoadInt).word(11).op(Opcode::LoadStr).half(0).op(Opcode::MakeToken).half(2)
			.op(Opcode::TreeNew).op(Opcode::SetLocalWc).local(0)
			.op(Opcode::LoadStr).half(1)
			.op(Opcode::GetLocalR).local(0).op(Opcode::PtrDerefWc)
			.op(Opcode::SetTokenDataWc)
			.op(Opcode::GetLocalR).local(0).op(Opcode::PtrDerefR).op(Opcode::GetTokenDataR)
			.op(Opcode::GetLocalR).local(0).op(Opcode::PtrDerefR).op(Opcode::GetTokenPos)
			.op(Opcode::Print).half(2)
			.op(Opcode::Ret);

		let mut prg = program(b.finish(), vec![frame("f", 0, 0, 1)], &[b"old", b"new"]);
		prg.run_function(0, &[]).unwrap();

		assert_eq!(prg.output(), b"newNIL");
		finish(prg);
	}

	#[test]
	fn test_tree_iterator () {
		let mut b = CodeBuilder::new();
		b.op(Opcode::LoadInt).word(20)
			.op(Opcode::LoadInt).word(11).op(Opcode::LoadStr).half(0).op(Opcode::MakeToken).half(2)
			.op(Opcode::LoadInt).word(12).op(Opcode::LoadStr).half(1).op(Opcode::MakeToken).half(2)
			.op(Opcode::LoadInt).word(11).op(Opcode::LoadStr).half(2).op(Opcode::MakeToken).half(2)
			.op(Opcode::MakeTree).half(4)
			.op(Opcode::SetLocalWc).local(0)
			.op(Opcode::RefFromLocal).local(0)
			.op(Opcode::TriterFromRef).local(1).half(0).half(11);

		let top = b.pos();
		b.op(Opcode::TriterAdvance).local(1);
		let done = b.jump(Opcode::JmpFalse);
		b.op(Opcode::TriterGetCurR).local(1).op(Opcode::Print).half(1);
		b.jump_to(Opcode::Jmp, top);
		b.patch(done);
		b.op(Opcode::TriterDestroy).local(1).op(Opcode::Ret);

		let mut prg = program(b.finish(), vec![frame("f", 0, 0, 2)], &[b"a", b"-", b"c"]);
		prg.run_function(0, &[]).unwrap();

		assert_eq!(prg.output(), b"ac");
		finish(prg);
	}

	#[test]
	fn test_user_iterator () {
		let mut b = CodeBuilder::new();

		let gen = b.pos();
		b.op(Opcode::LoadStr).half(0).op(Opcode::SetLocalWc).local(0)
			.op(Opcode::RefFromLocal).local(0).op(Opcode::Yield)
			.op(Opcode::LoadStr).half(1).op(Opcode::SetLocalWc).local(0)
			.op(Opcode::RefFromLocal).local(0).op(Opcode::Yield);
		let exhausted = b.pos();
		b.op(Opcode::LoadNil).op(Opcode::Yield);
		b.jump_to(Opcode::Jmp, exhausted);

		let main = b.pos();
		b.op(Opcode::UiterCreateWc).local(0).half(1).half(lel_id::STR);
		let top = b.pos();
		b.op(Opcode::UiterAdvance).local(0);
		let done = b.jump(Opcode::JmpFalse);
		b.op(Opcode::UiterGetCurR).local(0).op(Opcode::Print).half(1);
		b.jump_to(Opcode::Jmp, top);
		b.patch(done);
		b.op(Opcode::UiterDestroy).local(0).op(Opcode::Ret);

		let frames = vec![frame("main", main, 0, 1), frame("gen", gen, 0, 1)];
		let mut prg = program(b.finish(), frames, &[b"x", b"y"]);
		prg.run_function(0, &[]).unwrap();

		assert_eq!(prg.output(), b"xy");
		finish(prg);
	}


	#[test]
	fn test_make_tree_at_kid_limit_releases_operands () {
		let mut b = CodeBuilder::new();
		b.op(Opcode::LoadInt).word(lel_id::FIRST_USER as i64)
			.op(Opcode::LoadInt).word(5).op(Opcode::LoadInt).word(6)
			.op(Opcode::MakeTree).half(3)
			.op(Opcode::SaveRet).op(Opcode::Ret);

		let mut rtd = RuntimeData::new();
		rtd.set_global_size(7);
		rtd.code = b.finish();
		rtd.frame_info = vec![frame("f", 0, 0, 0)];

		let mut prg = Program::new(rtd, Config::new().with_pool_limit(8)).unwrap();
		assert_eq!(prg.arena.kids.live(), 7);

		assert_eq!(prg.run_function(0, &[]), Err(VmError::PoolExhausted { pool: "kids", limit: 8 }));
		assert!(prg.stack.is_empty());
		assert_eq!(prg.arena.trees.live(), 3);
		assert_eq!(prg.arena.kids.live(), 7);
		finish(prg);
	}

	const WORD: LelId = 11;
	const X: LelId = 12;
	const Y: LelId = 13;
	const EOF: LelId = 14;
	const A: LelId = 15;
	const B: LelId = 16;
	const S: LelId = 17;

	/// S -> A X | B Y, A -> WORD, B -> WORD, with the A/B choice left to backtracking.
	/// Reducing A appends 1 to the global list, reducing B appends 2
	fn backtracking_program (input: &[LelId], finish_wv: bool) -> Program {
		let mut b = CodeBuilder::new();

		fn action (b: &mut CodeBuilder, value: i64) -> usize {
			let at = b.pos();
			b.op(Opcode::LoadInt).word(value)
				.op(Opcode::LoadGlobalWv).op(Opcode::GetFieldWv).half(0)
				.op(Opcode::ListAppendWv)
				.op(Opcode::PcrRet);
			at
		}

		let reduce_a = action(&mut b, 1);
		let reduce_b = action(&mut b, 2);

		let main = b.pos();
		b.op(Opcode::ConsList).op(Opcode::LoadGlobalWc).op(Opcode::SetFieldWc).half(0)
			.op(Opcode::ConsParser).half(0).op(Opcode::SetLocalWc).local(0);

		for &id in input {
			b.op(Opcode::LoadInt).word(id as i64).op(Opcode::LoadStr).half(0).op(Opcode::MakeToken).half(2)
				.op(Opcode::GetLocalR).local(0).op(Opcode::InputAppendWc);
		}

		let (fin, exit) = if finish_wv {
			(Opcode::ParseFinishWv, Opcode::ParseFinishExitWv)
		} else {
			(Opcode::ParseFinishWc, Opcode::ParseFinishExitWc)
		};

		b.op(Opcode::GetLocalR).local(0).op(Opcode::ParseSaveSteps)
			.op(fin).half(0).op(Opcode::PcrCall).op(exit)
			.op(Opcode::SaveRet)
			.op(Opcode::LoadGlobalR).op(Opcode::GetFieldR).half(0).op(Opcode::Print).half(1)
			.op(Opcode::GetLocalR).local(0).op(Opcode::GetParserError).op(Opcode::Print).half(1)
			.op(Opcode::Ret);

		let mut rtd = RuntimeData::new();
		rtd.set_global_size(1);
		rtd.first_non_term_id = A;

		for (id, name) in [(WORD, "word"), (X, "x"), (Y, "y"), (EOF, "eof"), (A, "a"), (B, "b"), (S, "s")] {
			rtd.define_lel(id, LangElInfo { name: name.into(), .. LangElInfo::default() });
		}

		let prod = |name: &str, lhs_id, length, frame_id| ProdInfo {
			name: name.into(), lhs_id, prod_num: 0, length, frame_id, lhs_upref: false,
		};

		rtd.prod_info = vec![
			prod("a", A, 1, Some(1)),
			prod("b", B, 1, Some(2)),
			prod("s_a", S, 2, None),
			prod("s_b", S, 2, None),
		];

		let ambiguous = [Action::Reduce(0), Action::Reduce(1)];
		rtd.pda = PdaTablesBuilder::new()
			.shift(0, WORD, 1).shift(0, A, 2).shift(0, B, 3).shift(0, S, 6)
			.transition(1, X, 1, &ambiguous).transition(1, Y, 1, &ambiguous)
			.shift(2, X, 4)
			.shift(3, Y, 5)
			.reduce(4, EOF, 2)
			.reduce(5, EOF, 3)
			.shift(6, EOF, 7)
			.build();

		rtd.parsers = vec![ParserInfo { name: "s".into(), start_state: 0, eof_lel_id: EOF, eof_frame_id: None }];
		rtd.literals = vec![b"t".to_vec()];
		rtd.code = b.finish();
		rtd.frame_info = vec![
			frame("main", main, 0, 1),
			frame("reduce_a", reduce_a, 0, 0),
			frame("reduce_b", reduce_b, 0, 0),
		];

		Program::new(rtd, Config::new()).unwrap()
	}

	#[rstest]
	#[case(&[WORD, X], b"1NIL", A)]
	#[case(&[WORD, Y], b"2NIL", B)]
	fn test_backtracking_reverts_actions (#[case] input: &[LelId], #[case] output: &[u8], #[case] first: LelId) {
		let mut prg = backtracking_program(input, true);
		let result = prg.run_function(0, &[]).unwrap();

		assert_eq!(prg.output(), output);

		let root = result.expect("parse produced a tree");
		assert_eq!(prg.arena.trees[root].id, S);
		let child = prg.arena.get_rhs_el(&prg.rtd, root, 0).map(|t| prg.arena.trees[t].id);
		assert_eq!(child, Some(first));

		prg.arena.downref(result);
		finish(prg);
	}

	#[test]
	fn test_parse_error_is_reported () {
		let mut prg = backtracking_program(&[WORD, WORD], false);
		let result = prg.run_function(0, &[]).unwrap();

		assert_eq!(result, None);
		assert_eq!(prg.output(), b"1:1: parse error");
		assert!(prg.error.is_some());
		finish(prg);
	}
}
