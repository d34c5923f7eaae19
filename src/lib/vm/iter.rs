//! Structural, reverse and user iterators
//!
//! Iterators live in a local slot and keep their traversal state on the
//! operand stack above `root_size`. The stack growth between yields is
//! recorded in `yield_size`, and must match when the iterator is advanced
//! or destroyed

use crate::{
	error::VmResult,
	pool::*,
	tree::LelId,
	vm::{
		Program,
		exec::Execution,
		stack::*,
	},
};



/// A depth first iterator over the subtree behind a reference
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeIter {
	pub root_ref: Ref,
	pub search_id: LelId,
	pub root_size: usize,
	pub yield_size: usize,
	pub arg_size: usize,
	pub cur: Ref,
}

/// Walks the children of a tree from last to first
///
/// The root reference is kept on the stack below a copy of every child link,
/// so the current reference can be split like any other
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevTreeIter {
	pub search_id: LelId,
	pub root_size: usize,
	pub yield_size: usize,
	pub arg_size: usize,
	pub children: usize,
	pub cur: Ref,
	/// Detects a split of the iterated tree between yields
	pub kid_at_yield: Option<Cell>,
}

/// The record of a user defined generator
///
/// Stored on the stack directly below the generator's frame header
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserIter {
	pub search_id: LelId,
	pub root_size: usize,
	pub yield_size: usize,
	pub arg_size: usize,
	pub frame_id: usize,
	pub frame: usize,
	/// Where the generator continues on the next advance
	pub resume: usize,
	/// The frame id of the code that advanced the generator
	pub ret_frame_id: Option<usize>,
	pub cur: Ref,
}



impl Program {
	/// Read the tree a cell holds
	pub(crate) fn cell_tree (&self, cell: Option<Cell>) -> Option<TreeId> {
		match cell? {
			Cell::Kid(kid) => self.arena.kids[kid].tree,
			Cell::Slot(index) => self.stack.get(index).as_tree(),
		}
	}

	/// Overwrite the tree a cell holds, without touching reference counts
	pub(crate) fn set_cell (&mut self, cell: Cell, tree: Option<TreeId>) {
		match cell {
			Cell::Kid(kid) => self.arena.kids[kid].tree = tree,
			Cell::Slot(index) => self.stack.set(index, Slot::tree(tree)),
		}
	}

	fn next_sibling (&self, cell: Option<Cell>) -> Option<Cell> {
		match cell? {
			Cell::Kid(kid) => self.arena.kids[kid].next.map(Cell::Kid),
			Cell::Slot(_) => None,
		}
	}

	fn first_child (&self, cell: Option<Cell>) -> Option<Cell> {
		let tree = self.cell_tree(cell)?;
		self.arena.tree_child(&self.rtd, tree).map(Cell::Kid)
	}

	fn matches_search (&self, cell: Option<Cell>, search_id: LelId) -> bool {
		match self.cell_tree(cell) {
			Some(tree) => search_id == self.rtd.any_id || self.arena.trees[tree].id == search_id,
			None => false,
		}
	}

	fn stack_ref (&self, index: usize) -> Ref {
		match self.stack.get(index) {
			Slot::Ref(r) => r,
			other => panic!("expected a reference at stack index {}, found {:?}", index, other),
		}
	}

	fn pop_ref (&mut self) -> Ref {
		match self.stack.pop() {
			Slot::Ref(r) => r,
			other => panic!("expected a reference on the stack, found {:?}", other),
		}
	}


	/// Make every tree on the path from the root of a reference chain down to
	/// `start` private, rebinding the cells along the way
	///
	/// The chain links are cleared afterwards, since the path above is now unshared
	pub(crate) fn split_ref (&mut self, start: &mut Ref) -> VmResult<()> {
		// index None is `start` itself
		let mut chain: Vec<Option<usize>> = vec![None];
		let mut next = start.next;
		while let Some(index) = next {
			chain.push(Some(index));
			next = self.stack_ref(index).next;
		}
		chain.reverse();

		let get = |prg: &Program, start: &Ref, at: Option<usize>| match at {
			Some(index) => prg.stack_ref(index),
			None => *start,
		};

		let put = |prg: &mut Program, start: &mut Ref, at: Option<usize>, r: Ref| match at {
			Some(index) => prg.stack.set(index, Slot::Ref(r)),
			None => *start = r,
		};

		let mut i = 0;
		while i < chain.len() {
			let r = get(self, &*start, chain[i]);
			let shared = match (r.kid, self.cell_tree(r.kid)) {
				(Some(cell), Some(tree)) if self.arena.trees[tree].refs > 1 => Some((cell, tree)),
				_ => None,
			};

			let (cell, tree) = match shared {
				Some(shared) => shared,
				None => {
					put(self, start, chain[i], Ref { next: None, .. r });
					i += 1;
					continue
				}
			};

			let mut j = i + 1;
			while j < chain.len() && get(self, &*start, chain[j]).kid == r.kid {
				j += 1;
			}

			let old_next_down = match chain.get(j).map(|&at| get(self, &*start, at).kid) {
				Some(Some(Cell::Kid(kid))) => Some(kid),
				_ => None,
			};

			let (copy, new_next_down) = self.arena.copy_tree(tree, old_next_down)?;
			self.arena.trees[copy].refs = 1;
			self.arena.trees[tree].refs -= 1;
			self.set_cell(cell, Some(copy));

			for &at in chain[i..j].iter() {
				let r = get(self, &*start, at);
				put(self, start, at, Ref { next: None, .. r });
			}

			let mut m = j;
			while m < chain.len() && old_next_down.is_some() {
				let r = get(self, &*start, chain[m]);
				if r.kid != old_next_down.map(Cell::Kid) { break }

				put(self, start, chain[m], Ref { kid: new_next_down.map(Cell::Kid), .. r });
				m += 1;
			}

			i = j;
		}

		Ok(())
	}

	/// Replace the tree a reference addresses, moving `value`'s reference in
	pub(crate) fn ref_set_value (&mut self, r: Ref, value: Option<TreeId>) {
		let cell = match r.kid {
			Some(cell) => cell,
			None => panic!("assignment through an empty reference"),
		};

		let old = self.cell_tree(Some(cell));
		self.set_cell(cell, value);
		self.arena.downref(old);
	}


	fn local_slot (&self, exec: &Execution, local: i16) -> usize {
		frame_slot(exec.fp, local as isize)
	}

	fn tree_iter (&self, index: usize) -> TreeIter {
		match self.stack.get(index) {
			Slot::TreeIter(iter) => iter,
			other => panic!("expected a tree iterator, found {:?}", other),
		}
	}

	fn rev_tree_iter (&self, index: usize) -> RevTreeIter {
		match self.stack.get(index) {
			Slot::RevTreeIter(iter) => iter,
			other => panic!("expected a reverse tree iterator, found {:?}", other),
		}
	}

	/// Locate the record of the user iterator a local refers to
	fn user_iter (&self, exec: &Execution, local: i16) -> (usize, UserIter) {
		let at = match self.stack.get(self.local_slot(exec, local)) {
			Slot::UserIterAt(at) => at,
			other => panic!("expected a user iterator, found {:?}", other),
		};

		match self.stack.get(at) {
			Slot::UserIter(iter) => (at, iter),
			other => panic!("user iterator record at {} is {:?}", at, other),
		}
	}


	/// Start a structural iterator from the reference on the top of the stack
	pub(crate) fn triter_from_ref (&mut self, exec: &Execution, local: i16, arg_size: usize, search_id: LelId) {
		let root_ref = self.pop_ref();

		let iter = TreeIter {
			root_ref,
			search_id,
			root_size: self.stack.len(),
			yield_size: 0,
			arg_size,
			cur: Ref::default(),
		};

		let slot = self.local_slot(exec, local);
		self.stack.set(slot, Slot::TreeIter(iter));
	}

	fn iter_find (&mut self, iter: &mut TreeIter, mut try_first: bool, repeat: bool) {
		let mut descend = true;

		loop {
			if descend {
				if try_first && self.matches_search(iter.cur.kid, iter.search_id) { return }

				let enter = !repeat
					|| self.stack.len() == iter.root_size
					|| self.next_sibling(iter.cur.kid).is_none();

				let child = if enter { self.first_child(iter.cur.kid) } else { None };
				if let Some(child) = child {
					self.stack.push(Slot::Ref(iter.cur));
					iter.cur = Ref { kid: Some(child), next: Some(self.stack.len() - 1) };
					try_first = true;
					continue
				}
			} else {
				iter.cur.kid = self.next_sibling(iter.cur.kid);
				if iter.cur.kid.is_some() {
					try_first = true;
					descend = true;
					continue
				}

				iter.cur = self.pop_ref();
			}

			if self.stack.len() == iter.root_size {
				iter.cur.kid = None;
				return
			}

			descend = false;
		}
	}

	fn iter_find_rev_repeat (&mut self, iter: &mut TreeIter, try_first: bool) {
		if try_first {
			loop {
				if self.stack.len() == iter.root_size || self.next_sibling(iter.cur.kid).is_none() {
					let child = match self.first_child(iter.cur.kid) {
						Some(child) => child,
						None => break,
					};

					self.stack.push(Slot::Ref(iter.cur));
					iter.cur = Ref { kid: Some(child), next: Some(self.stack.len() - 1) };
				} else {
					iter.cur.kid = self.next_sibling(iter.cur.kid);
				}
			}

			if self.matches_search(iter.cur.kid, iter.search_id) { return }
		}

		loop {
			if self.stack.len() == iter.root_size {
				iter.cur.kid = None;
				return
			}

			if self.next_sibling(iter.cur.kid).is_none() {
				// the chain above may have been split, so walk down from the parent on the stack
				let parent = self.stack_ref(self.stack.len() - 1);
				iter.cur.kid = self.first_child(parent.kid);
			} else {
				iter.cur = self.pop_ref();
			}

			if self.matches_search(iter.cur.kid, iter.search_id) { return }
		}
	}

	/// Move a structural iterator to its next match, pushing whether there was one
	pub(crate) fn triter_advance (&mut self, exec: &Execution, local: i16, mode: IterMode) {
		let slot = self.local_slot(exec, local);
		let mut iter = self.tree_iter(slot);

		assert_eq!(iter.yield_size, self.stack.len() - iter.root_size, "tree iterator stack mismatch at advance");

		let try_first = iter.cur.kid.is_none();
		if try_first { iter.cur = iter.root_ref }

		match mode {
			IterMode::All => self.iter_find(&mut iter, try_first, false),
			IterMode::NextRepeat => self.iter_find(&mut iter, try_first, true),
			IterMode::PrevRepeat => self.iter_find_rev_repeat(&mut iter, try_first),
		}

		iter.yield_size = self.stack.len() - iter.root_size;
		self.stack.set(slot, Slot::TreeIter(iter));
		self.push_bool(iter.cur.kid.is_some());
	}

	/// Move a structural iterator to the next matching child of its root
	pub(crate) fn triter_next_child (&mut self, exec: &Execution, local: i16) {
		let slot = self.local_slot(exec, local);
		let mut iter = self.tree_iter(slot);

		let mut kid = match iter.cur.kid {
			None => match self.first_child(iter.root_ref.kid) {
				None => {
					iter.cur.next = None;
					None
				}

				Some(child) => {
					self.stack.push(Slot::Ref(iter.root_ref));
					iter.cur.next = Some(self.stack.len() - 1);
					Some(child)
				}
			}

			cur => self.next_sibling(cur),
		};

		if iter.search_id != self.rtd.any_id {
			while kid.is_some() && !self.matches_search(kid, iter.search_id) {
				kid = self.next_sibling(kid);
			}
		}

		iter.cur.kid = kid;
		iter.yield_size = self.stack.len() - iter.root_size;
		self.stack.set(slot, Slot::TreeIter(iter));
		self.push_bool(kid.is_some());
	}

	/// Tear down a structural iterator, popping its traversal state and arguments
	pub(crate) fn triter_destroy (&mut self, exec: &Execution, local: i16) {
		let slot = self.local_slot(exec, local);
		let iter = self.tree_iter(slot);

		assert_eq!(iter.yield_size, self.stack.len() - iter.root_size, "tree iterator stack mismatch at destroy");

		self.stack.pop_release(&mut self.arena, iter.yield_size);
		self.stack.pop_release(&mut self.arena, iter.arg_size);
		self.stack.set(slot, Slot::Nil);
	}


	/// Start a reverse child iterator from the reference on the top of the stack
	pub(crate) fn rev_triter_from_ref (&mut self, exec: &Execution, local: i16, arg_size: usize, search_id: LelId) {
		let root_ref = self.pop_ref();
		let root_size = self.stack.len();

		self.stack.push(Slot::Ref(root_ref));

		let mut children = 0;
		let mut kid = self.first_child(root_ref.kid);
		while let Some(cell) = kid {
			self.stack.push(Slot::Ref(Ref { kid: Some(cell), next: None }));
			children += 1;
			kid = self.next_sibling(kid);
		}

		let iter = RevTreeIter {
			search_id,
			root_size,
			yield_size: children + 1,
			arg_size,
			children,
			cur: Ref::default(),
			kid_at_yield: None,
		};

		let slot = self.local_slot(exec, local);
		self.stack.set(slot, Slot::RevTreeIter(iter));
	}

	/// Move a reverse iterator to the previous matching child
	pub(crate) fn rev_triter_prev_child (&mut self, exec: &Execution, local: i16) {
		let slot = self.local_slot(exec, local);
		let mut iter = self.rev_tree_iter(slot);

		if iter.kid_at_yield != iter.cur.kid {
			// the root was split since the last yield; reload the child links
			self.stack.popn(iter.children);

			let root = self.stack_ref(iter.root_size);
			let mut kid = self.first_child(root.kid);
			for _ in 0..iter.children {
				self.stack.push(Slot::Ref(Ref { kid, next: None }));
				kid = self.next_sibling(kid);
			}
		}

		if iter.cur.kid.is_some() {
			self.stack.pop();
			iter.children -= 1;
		}

		if iter.search_id != self.rtd.any_id {
			while iter.children > 0 && !self.matches_search(self.stack_ref(self.stack.len() - 1).kid, iter.search_id) {
				self.stack.pop();
				iter.children -= 1;
			}
		}

		iter.cur = if iter.children == 0 {
			Ref::default()
		} else {
			Ref { kid: self.stack_ref(self.stack.len() - 1).kid, next: Some(iter.root_size) }
		};

		iter.kid_at_yield = iter.cur.kid;
		iter.yield_size = self.stack.len() - iter.root_size;
		self.stack.set(slot, Slot::RevTreeIter(iter));
		self.push_bool(iter.cur.kid.is_some());
	}

	/// Tear down a reverse iterator
	pub(crate) fn rev_triter_destroy (&mut self, exec: &Execution, local: i16) {
		let slot = self.local_slot(exec, local);
		let iter = self.rev_tree_iter(slot);

		assert_eq!(iter.yield_size, self.stack.len() - iter.root_size, "reverse iterator stack mismatch at destroy");

		self.stack.pop_release(&mut self.arena, iter.yield_size);
		self.stack.pop_release(&mut self.arena, iter.arg_size);
		self.stack.set(slot, Slot::Nil);
	}


	fn any_iter_cur (&self, exec: &Execution, local: i16) -> Ref {
		match self.stack.get(self.local_slot(exec, local)) {
			Slot::TreeIter(iter) => iter.cur,
			Slot::RevTreeIter(iter) => iter.cur,
			Slot::UserIterAt(_) => self.user_iter(exec, local).1.cur,
			other => panic!("expected an iterator, found {:?}", other),
		}
	}

	fn store_iter_cur (&mut self, exec: &Execution, local: i16, cur: Ref) {
		let slot = self.local_slot(exec, local);

		match self.stack.get(slot) {
			Slot::TreeIter(iter) => self.stack.set(slot, Slot::TreeIter(TreeIter { cur, .. iter })),
			Slot::RevTreeIter(iter) => self.stack.set(slot, Slot::RevTreeIter(RevTreeIter { cur, .. iter })),
			Slot::UserIterAt(_) => {
				let (at, iter) = self.user_iter(exec, local);
				self.stack.set(at, Slot::UserIter(UserIter { cur, .. iter }));
			}
			other => panic!("expected an iterator, found {:?}", other),
		}
	}

	/// Push the current element of any iterator, acquired
	pub(crate) fn iter_get_cur_r (&mut self, exec: &Execution, local: i16) {
		let cur = self.any_iter_cur(exec, local);
		let tree = self.cell_tree(cur.kid);
		let tree = self.arena.upref(tree);
		self.stack.push_tree(tree);
	}

	/// Push the current element of any iterator for writing
	pub(crate) fn iter_get_cur_wc (&mut self, exec: &Execution, local: i16) -> VmResult<()> {
		let mut cur = self.any_iter_cur(exec, local);
		self.split_ref(&mut cur)?;
		self.store_iter_cur(exec, local, cur);

		let tree = self.cell_tree(cur.kid);
		let tree = self.arena.upref(tree);
		self.stack.push_tree(tree);
		Ok(())
	}

	/// Overwrite the current element of any iterator with the top of the stack
	pub(crate) fn iter_set_cur_wc (&mut self, exec: &Execution, local: i16) -> VmResult<()> {
		let mut cur = self.any_iter_cur(exec, local);
		self.split_ref(&mut cur)?;
		self.store_iter_cur(exec, local, cur);

		let value = self.stack.pop_tree();
		self.ref_set_value(cur, value);
		Ok(())
	}


	/// Lay out a generator's record and frame above the arguments already on the stack
	pub(crate) fn uiter_create (&mut self, exec: &Execution, local: i16, frame_id: usize, search_id: LelId, revert: bool) {
		let info = &self.rtd.frame_info[frame_id];
		let (arg_size, frame_size) = (info.arg_size, info.frame_size);
		let resume = if revert { info.code_wv } else { info.code_wc };

		self.stack.reserve(FR_AA + frame_size);

		let at = self.stack.len();
		let frame = at + FR_AA;
		let iter = UserIter {
			search_id,
			root_size: at + 1,
			yield_size: 0,
			arg_size,
			frame_id,
			frame,
			resume,
			ret_frame_id: None,
			cur: Ref::default(),
		};

		self.stack.push(Slot::UserIter(iter));
		self.stack.push(Slot::Code(None));
		self.stack.push(Slot::Int(exec.ifp as i64));
		self.stack.push(Slot::Int(exec.fp as i64));
		for _ in 0..frame_size { self.stack.push(Slot::Nil) }

		let yield_size = self.stack.len() - iter.root_size;
		self.stack.set(at, Slot::UserIter(UserIter { yield_size, .. iter }));

		let slot = self.local_slot(exec, local);
		self.stack.set(slot, Slot::UserIterAt(at));
	}

	/// Resume a generator, returning the instruction to continue at
	pub(crate) fn uiter_advance (&mut self, exec: &mut Execution, local: i16, next_ip: usize) -> usize {
		let (at, mut iter) = self.user_iter(exec, local);

		assert_eq!(iter.yield_size, self.stack.len() - iter.root_size, "user iterator stack mismatch at advance");

		self.stack.set(frame_slot(iter.frame, IFR_RIN), Slot::Code(Some(next_ip)));
		self.stack.set(frame_slot(iter.frame, IFR_RIF), Slot::Int(exec.ifp as i64));
		self.stack.set(frame_slot(iter.frame, IFR_RFR), Slot::Int(exec.fp as i64));

		iter.ret_frame_id = exec.frame_id;
		self.stack.set(at, Slot::UserIter(iter));

		exec.fp = iter.frame;
		exec.ifp = iter.frame;
		exec.frame_id = Some(iter.frame_id);

		iter.resume
	}

	/// Hand a value back from a generator
	///
	/// Returns the instruction to continue at: the advancing code if the value
	/// matched the search, otherwise the generator itself
	pub(crate) fn uiter_yield (&mut self, exec: &mut Execution, ip: usize) -> usize {
		let yielded = match self.stack.pop() {
			Slot::Ref(r) => r,
			Slot::Nil => Ref::default(),
			other => panic!("yield of a non reference {:?}", other),
		};

		let at = frame_slot(exec.ifp, IFR_REC);
		let iter = match self.stack.get(at) {
			Slot::UserIter(iter) => iter,
			other => panic!("yield outside of a generator: {:?}", other),
		};

		let found = yielded.kid.is_none()
			|| self.cell_tree(yielded.kid).is_none()
			|| self.matches_search(yielded.kid, iter.search_id);

		if !found { return ip }

		let ret = match self.stack.get(frame_slot(exec.ifp, IFR_RIN)) {
			Slot::Code(Some(ret)) => ret,
			other => panic!("generator was not advanced: {:?}", other),
		};

		let ifp = self.stack.get(frame_slot(exec.ifp, IFR_RIF)).as_int() as usize;
		let fp = self.stack.get(frame_slot(exec.ifp, IFR_RFR)).as_int() as usize;

		let iter = UserIter {
			cur: yielded,
			yield_size: self.stack.len() - iter.root_size,
			resume: ip,
			.. iter
		};
		self.stack.set(at, Slot::UserIter(iter));

		exec.fp = fp;
		exec.ifp = ifp;
		exec.frame_id = iter.ret_frame_id;

		self.push_bool(yielded.kid.is_some());
		ret
	}

	/// Tear down a generator, releasing everything above its record and its arguments
	pub(crate) fn uiter_destroy (&mut self, exec: &Execution, local: i16) {
		let (_, iter) = self.user_iter(exec, local);

		assert_eq!(iter.yield_size, self.stack.len() - iter.root_size, "user iterator stack mismatch at destroy");

		self.stack.pop_release(&mut self.arena, iter.yield_size);
		self.stack.pop();
		self.stack.pop_release(&mut self.arena, iter.arg_size);

		let slot = self.local_slot(exec, local);
		self.stack.set(slot, Slot::Nil);
	}
}


/// Traversal order for `triter_advance`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IterMode {
	/// Every node, depth first, left to right
	All,
	/// Elements of a right recursive repeat, first to last
	NextRepeat,
	/// Elements of a right recursive repeat, last to first
	PrevRepeat,
}


#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		config::Config,
		tree::lel_id,
		vm::{
			instruction::{ CodeBuilder, Opcode },
			runtime::{ RuntimeData, FrameInfo },
		},
	};
	use rstest::rstest;

	const TOKEN: u16 = 11;
	const OTHER: u16 = 12;

	fn frame (name: &str, code: usize, frame_size: usize) -> FrameInfo {
		FrameInfo { name: name.into(), code_wc: code, code_wv: code, arg_size: 0, frame_size }
	}

	fn program (code: Vec<u8>, frames: Vec<FrameInfo>) -> Program {
		let mut rtd = RuntimeData::new();
		rtd.code = code;
		rtd.frame_info = frames;
		rtd.literals = vec![b"a".to_vec(), b"-".to_vec(), b"c".to_vec()];
		Program::new(rtd, Config::new().with_stack_segment_slots(8)).unwrap()
	}

	fn finish (prg: Program) {
		assert!(prg.stack.is_empty());
		let teardown = prg.delete_program();
		assert!(teardown.leaks.is_clean(), "{}", teardown.leaks);
	}

	fn run_clean (mut prg: Program) {
		prg.run_function(0, &[]).unwrap();
		finish(prg);
	}

	/// Store a tree of three tokens in local 0 and push a reference to it
	fn tree_in_local (b: &mut CodeBuilder) {
		b.op(Opcode::LoadInt).word(20);
		for (id, text) in [(TOKEN, 0), (OTHER, 1), (TOKEN, 2)] {
			b.op(Opcode::LoadInt).word(id as i64).op(Opcode::LoadStr).half(text).op(Opcode::MakeToken).half(2);
		}
		b.op(Opcode::MakeTree).half(4)
			.op(Opcode::SetLocalWc).local(0)
			.op(Opcode::RefFromLocal).local(0);
	}

	fn tree_iter_program (advances: usize, extra: bool) -> Program {
		let mut b = CodeBuilder::new();
		tree_in_local(&mut b);
		b.op(Opcode::TriterFromRef).local(1).half(0).half(TOKEN);

		for _ in 0..advances {
			b.op(Opcode::TriterAdvance).local(1).op(Opcode::Pop);
		}
		if extra { b.op(Opcode::LoadInt).word(0); }

		b.op(Opcode::TriterDestroy).local(1).op(Opcode::Ret);
		program(b.finish(), vec![frame("f", 0, 2)])
	}

	fn rev_iter_program (advances: usize, extra: bool) -> Program {
		let mut b = CodeBuilder::new();
		tree_in_local(&mut b);
		b.op(Opcode::RevTriterFromRef).local(1).half(0).half(TOKEN);

		for _ in 0..advances {
			b.op(Opcode::RevTriterPrevChild).local(1).op(Opcode::Pop);
		}
		if extra { b.op(Opcode::LoadInt).word(0); }

		b.op(Opcode::RevTriterDestroy).local(1).op(Opcode::Ret);
		program(b.finish(), vec![frame("f", 0, 2)])
	}

	/// A generator yielding two strings, then nil forever
	fn user_iter_program (advances: usize, extra: bool) -> Program {
		let mut b = CodeBuilder::new();

		let gen = b.pos();
		b.op(Opcode::LoadStr).half(0).op(Opcode::SetLocalWc).local(0)
			.op(Opcode::RefFromLocal).local(0).op(Opcode::Yield)
			.op(Opcode::LoadStr).half(2).op(Opcode::SetLocalWc).local(0)
			.op(Opcode::RefFromLocal).local(0).op(Opcode::Yield);
		let exhausted = b.pos();
		b.op(Opcode::LoadNil).op(Opcode::Yield);
		b.jump_to(Opcode::Jmp, exhausted);

		let main = b.pos();
		b.op(Opcode::UiterCreateWc).local(0).half(1).half(lel_id::STR);
		for _ in 0..advances {
			b.op(Opcode::UiterAdvance).local(0).op(Opcode::Pop);
		}
		if extra { b.op(Opcode::LoadInt).word(0); }

		b.op(Opcode::UiterDestroy).local(0).op(Opcode::Ret);
		program(b.finish(), vec![frame("main", main, 1), frame("gen", gen, 1)])
	}

	#[rstest]
	fn test_tree_iterator_balances_stack (#[values(0, 1, 2, 3, 4)] advances: usize) {
		run_clean(tree_iter_program(advances, false));
	}

	#[rstest]
	fn test_reverse_iterator_balances_stack (#[values(0, 1, 2, 3, 4)] advances: usize) {
		run_clean(rev_iter_program(advances, false));
	}

	#[rstest]
	fn test_user_iterator_balances_stack (#[values(0, 1, 2, 3, 4)] advances: usize) {
		run_clean(user_iter_program(advances, false));
	}

	#[test]
	fn test_tree_iterator_visits_matches_in_order () {
		let mut b = CodeBuilder::new();
		tree_in_local(&mut b);
		b.op(Opcode::TriterFromRef).local(1).half(0).half(TOKEN);

		let top = b.pos();
		b.op(Opcode::TriterAdvance).local(1);
		let done = b.jump(Opcode::JmpFalse);
		b.op(Opcode::TriterGetCurR).local(1).op(Opcode::Print).half(1);
		b.jump_to(Opcode::Jmp, top);
		b.patch(done);
		b.op(Opcode::TriterDestroy).local(1).op(Opcode::Ret);

		let mut prg = program(b.finish(), vec![frame("f", 0, 2)]);
		prg.run_function(0, &[]).unwrap();
		assert_eq!(prg.output(), b"ac");
		finish(prg);
	}

	#[test]
	fn test_reverse_iterator_visits_last_first () {
		let mut b = CodeBuilder::new();
		tree_in_local(&mut b);
		b.op(Opcode::RevTriterFromRef).local(1).half(0).half(lel_id::ANY);

		let top = b.pos();
		b.op(Opcode::RevTriterPrevChild).local(1);
		let done = b.jump(Opcode::JmpFalse);
		b.op(Opcode::TriterGetCurR).local(1).op(Opcode::Print).half(1);
		b.jump_to(Opcode::Jmp, top);
		b.patch(done);
		b.op(Opcode::RevTriterDestroy).local(1).op(Opcode::Ret);

		let mut prg = program(b.finish(), vec![frame("f", 0, 2)]);
		prg.run_function(0, &[]).unwrap();
		assert_eq!(prg.output(), b"c-a");
		finish(prg);
	}

	#[test]
	#[should_panic(expected = "stack mismatch")]
	fn test_tree_iterator_destroy_checks_stack () {
		let mut prg = tree_iter_program(1, true);
		let _ = prg.run_function(0, &[]);
	}

	#[test]
	#[should_panic(expected = "stack mismatch")]
	fn test_reverse_iterator_destroy_checks_stack () {
		let mut prg = rev_iter_program(1, true);
		let _ = prg.run_function(0, &[]);
	}

	#[test]
	#[should_panic(expected = "stack mismatch")]
	fn test_user_iterator_destroy_checks_stack () {
		let mut prg = user_iter_program(1, true);
		let _ = prg.run_function(0, &[]);
	}
}
