//! Replaying reverse code
//!
//! A unit is replayed by walking its navigation forward from the root it
//! was recorded at, which leaves the modified object on the stack, then
//! inverting its terminator against that object

use crate::{
	error::VmResult,
	parse::{ ParseCx, Pcr },
	pool::*,
	vm::{
		Program,
		rcode::{ RevBlock, RevOp, RevUnit },
	},
};



impl Program {
	fn pop_target (&mut self, op: &RevOp) -> TreeId {
		match self.stack.pop_tree() {
			Some(tree) => tree,
			None => panic!("reverse code {:?} found no object to undo", op),
		}
	}

	/// Undo one block of the reverse code of `parser`
	pub(crate) fn revert_block (&mut self, parser: TreeId, block: RevBlock) -> VmResult<()> {
		let pid = self.arena.parser_id(parser);

		match block {
			RevBlock::EndDeck => {
				tracing::trace!(target: "arbor::rcode", "end of deck");
				self.arena.parsers[pid].pda.on_deck = false;
			}

			RevBlock::Units(units) => {
				tracing::trace!(target: "arbor::rcode", units = units.len(), "reverting block");

				for unit in units {
					self.revert_unit(Some(pid), unit)?;
				}
			}
		}

		Ok(())
	}

	/// Undo a single unit, consuming the references it holds
	pub(crate) fn revert_unit (&mut self, owner: Option<ParserId>, unit: RevUnit) -> VmResult<()> {
		let rtd = self.rtd.clone();
		let base = self.stack.len();

		for op in unit {
			tracing::trace!(target: "arbor::rcode", ?op);

			match op {
				RevOp::LoadGlobal => {
					let global = self.arena.upref(Some(self.global));
					self.stack.push_tree(global);
				}

				RevOp::GetField(field) => {
					let obj = self.pop_target(&op);
					let value = self.arena.get_field_split(obj, field as usize)?;
					let value = self.arena.upref(value);
					self.stack.push_tree(value);
					self.arena.downref(Some(obj));
				}

				RevOp::GetListMem(field) => {
					let obj = self.pop_target(&op);
					let value = self.arena.get_list_mem_split(obj, field as usize)?;
					let value = self.arena.upref(value);
					self.stack.push_tree(value);
					self.arena.downref(Some(obj));
				}

				RevOp::PtrDeref(ptr) => {
					let kid = self.ptr_kid(ptr);
					let value = self.arena.split_kid(kid)?;
					let value = self.arena.upref(value);
					self.stack.push_tree(value);
					self.arena.downref(Some(ptr));
				}


				RevOp::SetField { field, prev } => {
					let obj = self.pop_target(&op);
					let displaced = self.arena.set_field(obj, field as usize, prev);
					self.arena.downref(displaced);
					self.arena.downref(Some(obj));
				}

				RevOp::SetListMem { field, prev } => {
					let obj = self.pop_target(&op);
					let displaced = self.arena.set_list_mem(obj, field as usize, prev);
					self.arena.downref(displaced);
					self.arena.downref(Some(obj));
				}

				RevOp::ListAppend => {
					let obj = self.pop_target(&op);
					let appended = self.arena.list_remove_end(obj);
					self.arena.downref(appended.flatten());
					self.arena.downref(Some(obj));
				}

				RevOp::ListRemoveEnd { removed, value } => {
					let obj = self.pop_target(&op);

					if removed {
						self.arena.list_append(obj, value)?;
					} else {
						self.arena.downref(value);
					}

					self.arena.downref(Some(obj));
				}

				RevOp::MapInsert { inserted, key } => {
					let obj = self.pop_target(&op);

					if inserted {
						if let Some((k, v)) = self.arena.map_remove(&rtd, obj, key) {
							self.arena.downref(k);
							self.arena.downref(v);
						}
					}

					self.arena.downref(key);
					self.arena.downref(Some(obj));
				}

				RevOp::MapStore { key, prev } => {
					let obj = self.pop_target(&op);

					match prev {
						None => {
							if let Some((k, v)) = self.arena.map_remove(&rtd, obj, key) {
								self.arena.downref(k);
								self.arena.downref(v);
							}
						}

						Some(prev) => {
							let displaced = self.arena.map_restore(&rtd, obj, key, prev);
							self.arena.downref(displaced);
						}
					}

					self.arena.downref(key);
					self.arena.downref(Some(obj));
				}

				RevOp::MapRemove { removed, key, value } => {
					let obj = self.pop_target(&op);

					if !removed || !self.arena.map_insert(&rtd, obj, key, value)? {
						self.arena.downref(key);
						self.arena.downref(value);
					}

					self.arena.downref(Some(obj));
				}

				RevOp::SetTokenData { prev } => {
					let obj = self.pop_target(&op);
					let current = std::mem::replace(&mut self.arena.trees[obj].tokdata, prev);

					if let Some(head) = current {
						self.arena.free_head(head);
					}

					self.arena.downref(Some(obj));
				}


				RevOp::InputAppend { parser } => {
					let pid = self.arena.parser_id(parser);
					let appended = self.arena.parsers[pid].input.pop_back();
					self.arena.downref(appended);
					self.arena.downref(Some(parser));
				}

				RevOp::InputPull { parser, token } => {
					let pid = self.arena.parser_id(parser);

					if let Some(token) = token {
						self.arena.parsers[pid].input.push_front(token, false);
					}

					self.arena.downref(Some(parser));
				}

				RevOp::InputPush { parser } => {
					let pid = self.arena.parser_id(parser);
					let pushed = self.arena.parsers[pid].input.pull_front();
					self.arena.downref(pushed);
					self.arena.downref(Some(parser));
				}

				RevOp::RestoreLhs(lhs) => {
					let pid = match owner {
						Some(pid) => pid,
						None => panic!("left hand side restore outside of a parser"),
					};

					let old = self.arena.parsers[pid].pda.restore_lhs.replace(lhs);
					self.arena.downref(old);
				}

				RevOp::ParseFrag { parser, steps, finish } => {
					self.undo_parse(parser, steps, finish)?;
					self.arena.downref(Some(parser));
				}
			}
		}

		assert_eq!(self.stack.len(), base, "reverse unit left the stack unbalanced");

		Ok(())
	}

	/// Run `parser` backwards until it is back at `steps`, replaying the
	/// reverse code of everything it undoes
	fn undo_parse (&mut self, parser: TreeId, steps: i64, finish: bool) -> VmResult<()> {
		let pid = self.arena.parser_id(parser);
		let rtd = self.rtd.clone();
		let (ctx_dep, induce_exit) = (self.config.ctx_dep_parsing, self.induce_exit);

		tracing::debug!(target: "arbor::rcode", steps, finish, "undoing parse");

		let mut entry = Pcr::Start;
		loop {
			let pcr = self.arena.with_parser(pid, |p, arena| {
				let mut cx = ParseCx { arena, rtd: &rtd, ctx_dep, induce_exit };
				p.undo_parse_frag(&mut cx, steps, entry)
			})?;

			match pcr {
				Pcr::Done => break,

				Pcr::Reverse => {
					let block = match self.arena.parsers[pid].pda.rev_block.take() {
						Some(block) => block,
						None => panic!("reverse continuation without a block to replay"),
					};

					self.revert_block(parser, block)?;
					entry = Pcr::Reverse;
				}

				other => panic!("parse undo suspended with {:?}", other),
			}
		}

		if finish {
			let p = &mut self.arena.parsers[pid];
			p.input.eof = false;

			let result = p.result.take();
			self.arena.downref(result);
		}

		Ok(())
	}
}



#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		config::Config,
		tree::{ Tree, TreeValue, LelId, lel_id },
		vm::{
			exec::Execution,
			instruction::{ CodeBuilder, Opcode },
			runtime::{ RuntimeData, FrameInfo, LangElInfo, ParserInfo, ProdInfo, PdaTablesBuilder },
		},
	};
	use proptest::prelude::*;

	const NODE: u16 = lel_id::FIRST_USER;

	/// A program whose global has three fields, with a parser to collect reverse code into
	fn program (code: Vec<u8>, literals: &[&[u8]]) -> (Program, TreeId) {
		let mut rtd = RuntimeData::new();
		rtd.set_global_size(3);
		rtd.define_lel(NODE, LangElInfo { name: "node".into(), object_length: 1, .. LangElInfo::default() });
		rtd.pda = PdaTablesBuilder::new().shift(0, NODE, 0).build();
		rtd.parsers = vec![ParserInfo { name: "p".into(), .. ParserInfo::default() }];
		rtd.frame_info = vec![FrameInfo { name: "f".into(), .. FrameInfo::default() }];
		rtd.code = code;
		rtd.literals = literals.iter().map(|l| l.to_vec()).collect();

		let mut prg = Program::new(rtd, Config::new()).unwrap();
		let rtd = prg.rtd.clone();
		let parser = prg.arena.construct_parser(&rtd, 0).unwrap();

		(prg, parser)
	}

	fn run_logged (prg: &mut Program, parser: TreeId) -> Vec<RevUnit> {
		let mut exec = Execution { parser: Some(parser), .. Execution::new() };
		prg.execute(&mut exec, 0).unwrap();

		let pid = prg.arena.parser_id(parser);
		prg.arena.parsers[pid].pda.rcode_collect.take_units()
	}

	fn finish (mut prg: Program, parser: TreeId) {
		prg.arena.downref(Some(parser));
		let teardown = prg.delete_program();
		assert!(teardown.leaks.is_clean(), "{}", teardown.leaks);
	}

	#[test]
	fn test_revert_write_through_shared_node () {
		let mut b = CodeBuilder::new();
		b.op(Opcode::LoadInt).word(9)
			.op(Opcode::LoadGlobalWv).op(Opcode::GetFieldWv).half(0)
			.op(Opcode::SetFieldWv).half(0)
			.op(Opcode::Stop);

		let (mut prg, parser) = program(b.finish(), &[]);
		let rtd = prg.rtd.clone();

		let five = prg.arena.construct_int(5).unwrap();
		let shared = prg.arena.construct_object(&rtd, NODE).unwrap();
		prg.arena.set_field(shared, 0, Some(five));
		let held = prg.arena.upref(Some(shared));
		prg.arena.set_field(prg.global, 0, held);

		let units = run_logged(&mut prg, parser);
		assert_eq!(units.len(), 1);
		assert_eq!(units[0].len(), 3);

		let copy = prg.arena.get_field(prg.global, 0).unwrap();
		assert_ne!(copy, shared, "the write went to a private copy");
		assert_eq!(prg.arena.int_value(prg.arena.get_field(copy, 0)), 9);
		assert_eq!(prg.arena.int_value(prg.arena.get_field(shared, 0)), 5);

		for unit in units {
			prg.revert_unit(None, unit).unwrap();
		}

		let restored = prg.arena.get_field(prg.global, 0).unwrap();
		assert_eq!(prg.arena.int_value(prg.arena.get_field(restored, 0)), 5);
		assert_eq!(prg.arena.int_value(prg.arena.get_field(shared, 0)), 5);

		prg.arena.downref(Some(shared));
		finish(prg, parser);
	}

	#[test]
	fn test_revert_collections () {
		let mut b = CodeBuilder::new();
		b.op(Opcode::ConsMap).op(Opcode::LoadGlobalWc).op(Opcode::SetFieldWc).half(0)
			.op(Opcode::LoadStr).half(0).op(Opcode::LoadInt).word(1)
			.op(Opcode::LoadGlobalWv).op(Opcode::GetFieldWv).half(0).op(Opcode::MapInsertWv).op(Opcode::Pop)
			.op(Opcode::LoadStr).half(0).op(Opcode::LoadInt).word(2)
			.op(Opcode::LoadGlobalWv).op(Opcode::GetFieldWv).half(0).op(Opcode::MapStoreWv)
			.op(Opcode::LoadStr).half(1).op(Opcode::LoadInt).word(3)
			.op(Opcode::LoadGlobalWv).op(Opcode::GetFieldWv).half(0).op(Opcode::MapStoreWv)
			.op(Opcode::LoadStr).half(1)
			.op(Opcode::LoadGlobalWv).op(Opcode::GetFieldWv).half(0).op(Opcode::MapRemoveWv).op(Opcode::Pop)
			.op(Opcode::Stop);

		let (mut prg, parser) = program(b.finish(), &[b"a", b"b"]);

		let units = run_logged(&mut prg, parser);
		assert_eq!(units.len(), 4);

		let map = prg.arena.get_field(prg.global, 0).unwrap();
		assert_eq!(prg.arena.map_length(map), 1);

		let mut units = units.into_iter();
		let remove = units.next().unwrap();
		prg.revert_unit(None, remove).unwrap();
		assert_eq!(prg.arena.map_length(map), 2);

		for unit in units {
			prg.revert_unit(None, unit).unwrap();
		}

		assert_eq!(prg.arena.map_length(map), 0);
		finish(prg, parser);
	}

	#[test]
	fn test_unrooted_writes_are_not_logged () {
		let mut b = CodeBuilder::new();
		b.op(Opcode::LoadInt).word(1)
			.op(Opcode::ConsList).op(Opcode::ListAppendWv)
			.op(Opcode::Stop);

		let (mut prg, parser) = program(b.finish(), &[]);
		assert!(run_logged(&mut prg, parser).is_empty());
		finish(prg, parser);
	}

	#[test]
	fn test_revert_input_and_token_data () {
		let mut b = CodeBuilder::new();
		b.op(Opcode::LoadStr).half(0)
			.op(Opcode::LoadGlobalWv).op(Opcode::GetFieldWv).half(0)
			.op(Opcode::SetTokenDataWv)
			.op(Opcode::Stop);

		let (mut prg, parser) = program(b.finish(), &[b"new"]);

		let token = prg.arena.construct_str(b"old").unwrap();
		prg.arena.set_field(prg.global, 0, Some(token));

		let units = run_logged(&mut prg, parser);
		assert_eq!(prg.arena.tree_data(token), b"new");

		for unit in units {
			prg.revert_unit(None, unit).unwrap();
		}

		assert_eq!(prg.arena.tree_data(token), b"old");

		let pid = prg.arena.parser_id(parser);
		let queued = prg.arena.alloc_tree(Tree { refs: 1, value: TreeValue::Int(4), .. Tree::new(lel_id::INT) }).unwrap();
		prg.arena.parsers[pid].input.append(queued);

		prg.arena.upref(Some(parser));
		prg.revert_unit(None, vec![RevOp::InputAppend { parser }]).unwrap();
		assert!(prg.arena.parsers[pid].input.is_empty());

		finish(prg, parser);
	}

	/// A logged edit of the global: field 0 holds a list, field 1 a map, field 2 an integer
	#[derive(Debug, Clone)]
	enum Edit {
		Append(i64),
		RemoveEnd,
		Insert(i64, i64),
		Store(i64, i64),
		Remove(i64),
		SetField(i64),
	}

	fn edit () -> impl Strategy<Value = Edit> {
		prop_oneof![
			(0..4i64).prop_map(Edit::Append),
			Just(Edit::RemoveEnd),
			(0..4i64, 0..4i64).prop_map(|(k, v)| Edit::Insert(k, v)),
			(0..4i64, 0..4i64).prop_map(|(k, v)| Edit::Store(k, v)),
			(0..4i64).prop_map(Edit::Remove),
			(0..4i64).prop_map(Edit::SetField),
		]
	}

	fn emit (b: &mut CodeBuilder, edit: &Edit) {
		let field = |b: &mut CodeBuilder, n: u16| { b.op(Opcode::LoadGlobalWv).op(Opcode::GetFieldWv).half(n); };

		match *edit {
			Edit::Append(v) => {
				b.op(Opcode::LoadInt).word(v);
				field(b, 0);
				b.op(Opcode::ListAppendWv);
			}

			Edit::RemoveEnd => {
				field(b, 0);
				b.op(Opcode::ListRemoveEndWv).op(Opcode::Pop);
			}

			Edit::Insert(k, v) => {
				b.op(Opcode::LoadInt).word(k).op(Opcode::LoadInt).word(v);
				field(b, 1);
				b.op(Opcode::MapInsertWv).op(Opcode::Pop);
			}

			Edit::Store(k, v) => {
				b.op(Opcode::LoadInt).word(k).op(Opcode::LoadInt).word(v);
				field(b, 1);
				b.op(Opcode::MapStoreWv);
			}

			Edit::Remove(k) => {
				b.op(Opcode::LoadInt).word(k);
				field(b, 1);
				b.op(Opcode::MapRemoveWv).op(Opcode::Pop);
			}

			Edit::SetField(v) => {
				b.op(Opcode::LoadInt).word(v).op(Opcode::LoadGlobalWv).op(Opcode::SetFieldWv).half(2);
			}
		}
	}

	/// Values and reference counts of everything the edits can reach
	#[derive(Debug, PartialEq)]
	struct Shape {
		list: (TreeId, u32, Vec<(i64, u32)>),
		map: (TreeId, u32, Vec<(i64, u32, i64, u32)>),
		field: Option<(i64, u32)>,
	}

	fn shape (prg: &Program) -> Shape {
		let arena = &prg.arena;
		let node = |t: Option<TreeId>| t.map(|t| (arena.int_value(Some(t)), arena.trees[t].refs));

		let list = arena.get_field(prg.global, 0).unwrap();
		let map = arena.get_field(prg.global, 1).unwrap();

		Shape {
			list: (list, arena.trees[list].refs, arena.list_values(list).into_iter().filter_map(node).collect()),
			map: (map, arena.trees[map].refs, arena.map_entries(map).into_iter()
				.filter_map(|(k, v)| Some((node(k)?, node(v)?)))
				.map(|((k, kr), (v, vr))| (k, kr, v, vr))
				.collect()),
			field: node(arena.get_field(prg.global, 2)),
		}
	}

	proptest! {
		#[test]
		fn prop_replaying_every_unit_restores_the_global (
			setup in proptest::collection::vec(edit(), 0..8),
			edits in proptest::collection::vec(edit(), 0..24),
		) {
			let mut b = CodeBuilder::new();
			b.op(Opcode::ConsList).op(Opcode::LoadGlobalWc).op(Opcode::SetFieldWc).half(0)
				.op(Opcode::ConsMap).op(Opcode::LoadGlobalWc).op(Opcode::SetFieldWc).half(1);
			for e in &setup { emit(&mut b, e); }
			b.op(Opcode::Stop);

			let start = b.pos();
			for e in &edits { emit(&mut b, e); }
			b.op(Opcode::Stop);

			let (mut prg, parser) = program(b.finish(), &[]);

			let mut exec = Execution::new();
			prg.execute(&mut exec, 0).unwrap();
			let before = shape(&prg);

			let mut exec = Execution { parser: Some(parser), .. Execution::new() };
			prg.execute(&mut exec, start).unwrap();

			let pid = prg.arena.parser_id(parser);
			let units = prg.arena.parsers[pid].pda.rcode_collect.take_units();
			for unit in units {
				prg.revert_unit(None, unit).unwrap();
			}

			prop_assert_eq!(shape(&prg), before);
			prop_assert!(prg.stack.is_empty());
			finish(prg, parser);
		}
	}


	const WORD: LelId = lel_id::FIRST_USER;
	const EOF: LelId = lel_id::FIRST_USER + 1;
	const LIST: LelId = lel_id::FIRST_USER + 2;
	const START: LelId = lel_id::FIRST_USER + 3;

	const FRAG: usize = 0;
	const FINISH: usize = 1;

	/// start: list, list: list WORD | WORD
	///
	/// Global field 0 is a list the reductions append to: 1 for the first word,
	/// 2 for every later one. Field 1 holds the parser
	fn fragment_program () -> (Program, TreeId) {
		let mut b = CodeBuilder::new();

		let action = |b: &mut CodeBuilder, value: i64| {
			let at = b.pos();
			b.op(Opcode::LoadInt).word(value)
				.op(Opcode::LoadGlobalWv).op(Opcode::GetFieldWv).half(0)
				.op(Opcode::ListAppendWv)
				.op(Opcode::PcrRet);
			at
		};

		let more = action(&mut b, 2);
		let one = action(&mut b, 1);

		let frag = b.pos();
		b.op(Opcode::LoadGlobalR).op(Opcode::GetFieldR).half(1).op(Opcode::ParseSaveSteps)
			.op(Opcode::ParseFragWv).half(0).op(Opcode::PcrCall).op(Opcode::ParseFragExitWv)
			.op(Opcode::Ret);

		let fin = b.pos();
		b.op(Opcode::LoadGlobalR).op(Opcode::GetFieldR).half(1).op(Opcode::ParseSaveSteps)
			.op(Opcode::ParseFinishWv).half(0).op(Opcode::PcrCall).op(Opcode::ParseFinishExitWv)
			.op(Opcode::SaveRet).op(Opcode::Ret);

		let mut rtd = RuntimeData::new();
		rtd.set_global_size(2);
		rtd.first_non_term_id = LIST;

		for (id, name) in [(WORD, "word"), (EOF, "eof"), (LIST, "list"), (START, "start")] {
			rtd.define_lel(id, LangElInfo { name: name.into(), .. LangElInfo::default() });
		}

		let prod = |name: &str, lhs_id, length, frame_id| ProdInfo {
			name: name.into(), lhs_id, prod_num: 0, length, frame_id, lhs_upref: false,
		};

		rtd.prod_info = vec![
			prod("list_more", LIST, 2, Some(2)),
			prod("list_one", LIST, 1, Some(3)),
			prod("start", START, 1, None),
		];

		rtd.pda = PdaTablesBuilder::new()
			.shift(0, WORD, 2).shift(0, LIST, 1).shift(0, START, 4)
			.shift(1, WORD, 3).reduce(1, EOF, 2)
			.reduce(2, WORD, 1).reduce(2, EOF, 1)
			.reduce(3, WORD, 0).reduce(3, EOF, 0)
			.shift(4, EOF, 5)
			.build();

		rtd.parsers = vec![ParserInfo { name: "start".into(), start_state: 0, eof_lel_id: EOF, eof_frame_id: None }];
		rtd.code = b.finish();
		rtd.frame_info = vec![
			FrameInfo { name: "frag".into(), code_wc: frag, code_wv: frag, .. FrameInfo::default() },
			FrameInfo { name: "finish".into(), code_wc: fin, code_wv: fin, .. FrameInfo::default() },
			FrameInfo { name: "list_more".into(), code_wc: more, code_wv: more, .. FrameInfo::default() },
			FrameInfo { name: "list_one".into(), code_wc: one, code_wv: one, .. FrameInfo::default() },
		];

		let mut prg = Program::new(rtd, Config::new()).unwrap();
		let rtd = prg.rtd.clone();

		let list = prg.arena.construct_list().unwrap();
		prg.arena.set_field(prg.global, 0, Some(list));
		let parser = prg.arena.construct_parser(&rtd, 0).unwrap();
		prg.arena.set_field(prg.global, 1, Some(parser));

		(prg, parser)
	}

	fn feed (prg: &mut Program, parser: TreeId, text: &[u8]) {
		let rtd = prg.rtd.clone();
		let pid = prg.arena.parser_id(parser);

		for &c in text {
			let token = prg.arena.construct_token(&rtd, WORD, &[c], None).unwrap();
			prg.arena.parsers[pid].input.append(token);
		}
	}

	fn appended (prg: &Program) -> Vec<i64> {
		let list = prg.arena.get_field(prg.global, 0).unwrap();
		prg.arena.list_values(list).into_iter().map(|v| prg.arena.int_value(v)).collect()
	}

	fn printed (prg: &Program, tree: Option<TreeId>) -> Vec<u8> {
		let mut out = Vec::new();
		prg.arena.print_tree(&prg.rtd, tree, &mut out);
		out
	}

	fn teardown (mut prg: Program, result: Option<TreeId>) {
		prg.arena.downref(result);
		let teardown = prg.delete_program();
		assert!(teardown.leaks.is_clean(), "{}", teardown.leaks);
	}

	#[test]
	fn test_undone_fragment_parses_again_the_same () {
		let (mut straight, straight_parser) = fragment_program();
		feed(&mut straight, straight_parser, b"a");
		straight.run_function(FRAG, &[]).unwrap();
		feed(&mut straight, straight_parser, b"bc");
		let expected = straight.run_function(FINISH, &[]).unwrap();

		let (mut prg, parser) = fragment_program();
		let pid = prg.arena.parser_id(parser);

		feed(&mut prg, parser, b"a");
		prg.run_function(FRAG, &[]).unwrap();
		let steps = prg.arena.parsers[pid].pda.steps;
		assert!(appended(&prg).is_empty());

		feed(&mut prg, parser, b"bc");
		prg.run_function(FRAG, &[]).unwrap();
		assert_eq!(appended(&prg), [1, 2]);
		assert!(prg.arena.parsers[pid].pda.steps > steps);

		prg.arena.upref(Some(parser));
		prg.revert_unit(None, vec![RevOp::ParseFrag { parser, steps, finish: false }]).unwrap();

		assert_eq!(prg.arena.parsers[pid].pda.steps, steps);
		assert!(appended(&prg).is_empty(), "the reductions were reverted");
		assert_eq!(prg.arena.parsers[pid].input.len(), 2);

		let result = prg.run_function(FINISH, &[]).unwrap();

		assert_eq!(appended(&prg), appended(&straight));
		assert_eq!(appended(&prg), [1, 2, 2]);
		assert_eq!(printed(&prg, result), printed(&straight, expected));
		assert_eq!(printed(&prg, result), b"abc");

		let straight_pid = straight.arena.parser_id(straight_parser);
		assert_eq!(prg.arena.parsers[pid].pda.steps, straight.arena.parsers[straight_pid].pda.steps);

		teardown(straight, expected);
		teardown(prg, result);
	}
}
