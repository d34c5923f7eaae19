//! The instruction set
//!
//! An instruction is one opcode byte followed by a fixed number of little
//! endian operands: halves (2 bytes) and words (8 bytes). Jump offsets are
//! signed halves relative to the start of the next instruction

use arbor_macros::{ opcodes, static_assert };



opcodes! {
	/// Every opcode the interpreter understands
	///
	/// Operands are listed after each opcode as `(H ..)` for halves and
	/// `(W ..)` for words. Mutating opcodes come in read (`R`), committing
	/// (`Wc`) and reverting (`Wv`) forms; only `Wv` forms write the reverse log
	pub enum Opcode {
		// Constants //

		/// Push nil
		LoadNil,
		/// Push `true`
		LoadTrue,
		/// Push `false`
		LoadFalse,
		/// (W value)
		LoadInt,
		/// (H literal)
		LoadStr,


		// Stack //

		/// Release the top value
		Pop,
		/// (H count)
		PopN,
		/// Push another reference to the top value
		DupTop,


		// Integers //

		/// Pop two integers, push their wrapping sum
		AddInt,
		/// Pop two integers, push their wrapping difference
		SubInt,
		/// Pop two integers, push their wrapping product
		MultInt,
		/// Pop two integers, push their quotient; a zero divisor is an error
		DivInt,


		// Comparison //

		/// Push whether two values compare equal
		TstEql,
		/// Push whether two values differ
		TstNotEql,
		/// Push whether the first value orders before the second
		TstLess,
		/// Push whether the first value orders before or equal to the second
		TstLessEql,
		/// Push whether the first value orders after the second
		TstGrtr,
		/// Push whether the first value orders after or equal to the second
		TstGrtrEql,
		/// Push whether both values are true
		TstLogicalAnd,
		/// Push whether either value is true
		TstLogicalOr,
		/// Push whether the value is false
		Not,


		// Strings //

		/// Concatenate two strings
		ConcatStr,
		/// Push the byte length of a string
		StrLength,
		/// Parse a string as a decimal integer
		StrAtoi,
		/// Format an integer as a string
		IntToStr,
		/// Uppercase a string
		ToUpper,
		/// Lowercase a string
		ToLower,


		// Control flow //

		/// (H offset)
		Jmp,
		/// (H offset)
		JmpFalse,
		/// (H offset)
		JmpTrue,
		/// (H frame)
		CallWc,
		/// (H frame)
		CallWv,
		/// Return from the running frame
		Ret,
		/// Halt, leaving the frame in place
		Stop,
		/// Pop a status and unwind every frame
		Exit,


		// Locals and references //

		/// (H size)
		InitLocals,
		/// (H size)
		PopLocals,
		/// (H local)
		GetLocalR,
		/// (H local)
		GetLocalWc,
		/// (H local)
		SetLocalWc,
		/// Pop the value the frame returns
		SaveRet,
		/// (H local)
		RefFromLocal,
		/// (H local)
		RefFromRef,
		/// (H local)
		GetLocalRefR,
		/// (H local)
		GetLocalRefWc,
		/// (H local)
		SetLocalRefWc,


		// Fields and globals //

		/// (H field)
		GetFieldR,
		/// (H field)
		GetFieldWc,
		/// (H field)
		GetFieldWv,
		/// (H field)
		SetFieldWc,
		/// (H field)
		SetFieldWv,
		/// (H field)
		SetFieldLeaveWc,
		/// Push the global record for reading
		LoadGlobalR,
		/// Push the global record for writing
		LoadGlobalWc,
		/// Push the global record for logged writing
		LoadGlobalWv,


		// Pointers //

		/// Move a tree into a heap cell and push a pointer to it
		TreeNew,
		/// Read through a pointer
		PtrDerefR,
		/// Read through a pointer for writing
		PtrDerefWc,
		/// Read through a pointer for logged writing
		PtrDerefWv,


		// Tokens and trees //

		/// (H id)
		TreeSearch,
		/// Push the text of a token as a string
		GetTokenDataR,
		/// Replace the text of a token
		SetTokenDataWc,
		/// Replace the text of a token, logged
		SetTokenDataWv,
		/// Push the byte offset of a token
		GetTokenPos,
		/// (H id)
		ConstructTerm,
		/// (H args)
		MakeToken,
		/// (H args)
		MakeTree,
		/// (H pattern)
		Match,
		/// (H pattern)
		Construct,


		// Generics //

		/// Push a new empty list
		ConsList,
		/// Push a new empty map
		ConsMap,
		/// (H parser)
		ConsParser,
		/// Push the length of a list
		ListLength,
		/// Append a value to a list
		ListAppendWc,
		/// Append a value to a list, logged
		ListAppendWv,
		/// Remove the last list element
		ListRemoveEndWc,
		/// Remove the last list element, logged
		ListRemoveEndWv,
		/// (H field)
		GetListMemR,
		/// (H field)
		GetListMemWc,
		/// (H field)
		GetListMemWv,
		/// (H field)
		SetListMemWc,
		/// (H field)
		SetListMemWv,
		/// Push the number of map entries
		MapLength,
		/// Look a key up in a map
		MapFind,
		/// Insert a key and value if the key is absent
		MapInsertWc,
		/// Insert a key and value if the key is absent, logged
		MapInsertWv,
		/// Insert or replace a map entry
		MapStoreWc,
		/// Insert or replace a map entry, logged
		MapStoreWv,
		/// Remove a map entry
		MapRemoveWc,
		/// Remove a map entry, logged
		MapRemoveWv,


		// Iterators //

		/// (H local, H args, H search)
		TriterFromRef,
		/// (H local)
		TriterAdvance,
		/// (H local)
		TriterNextChild,
		/// (H local)
		TriterNextRepeat,
		/// (H local)
		TriterPrevRepeat,
		/// (H local)
		TriterGetCurR,
		/// (H local)
		TriterGetCurWc,
		/// (H local)
		TriterSetCurWc,
		/// (H local)
		TriterDestroy,
		/// (H local, H args, H search)
		RevTriterFromRef,
		/// (H local)
		RevTriterPrevChild,
		/// (H local)
		RevTriterDestroy,
		/// (H local, H frame, H search)
		UiterCreateWc,
		/// (H local, H frame, H search)
		UiterCreateWv,
		/// (H local)
		UiterAdvance,
		/// (H local)
		UiterGetCurR,
		/// (H local)
		UiterGetCurWc,
		/// (H local)
		UiterSetCurWc,
		/// (H local)
		UiterDestroy,
		/// Suspend a generator, handing its current value to the iterator
		Yield,


		// Parsing //

		/// Remember the parser's step count before a parse
		ParseSaveSteps,
		/// (H stop id)
		ParseFragWc,
		/// (H stop id)
		ParseFragWv,
		/// Finish a fragment parse
		ParseFragExitWc,
		/// Finish a fragment parse, logging it for undo
		ParseFragExitWv,
		/// (H stop id)
		ParseFinishWc,
		/// (H stop id)
		ParseFinishWv,
		/// Finish a final parse and push its result
		ParseFinishExitWc,
		/// Finish a final parse, push its result and log it for undo
		ParseFinishExitWv,
		/// Run the action a suspended parse asked for, or replay reverse code
		PcrCall,
		/// Return from a parser action
		PcrRet,
		/// (H position, H local)
		InitRhsEl,
		/// (H local)
		InitLhsEl,
		/// (H local)
		StoreLhsEl,
		/// Make the running reduction fail
		Reject,
		/// Queue a token on a parser's input
		InputAppendWc,
		/// Queue a token on a parser's input, logged
		InputAppendWv,
		/// Take the next token from a parser's input
		InputPullWc,
		/// Take the next token from a parser's input, logged
		InputPullWv,
		/// Put a token back at the front of a parser's input
		InputPushWc,
		/// Put a token back at the front of a parser's input, logged
		InputPushWv,
		/// Push a parser's last error text
		GetParserError,


		// Host //

		/// Push the program arguments as a list of strings
		LoadArgv,
		/// (H count)
		Print,
	}
}



/// Allows encoding and decoding a value from an instruction stream
pub trait Codable: Copy {
	/// Number of bytes this value occupies in the stream
	const SIZE: usize;

	/// Append this value to an instruction stream
	fn encode (self, code: &mut Vec<u8>);

	/// Read a value at `ip`, advancing it past the value
	///
	/// A truncated stream means the bytecode does not match the
	/// interpreter and is a fatal defect
	fn decode (ip: &mut usize, code: &[u8]) -> Self;
}

macro_rules! codable_int {
	($($ty:ty),* $(,)?) => { $(
		impl Codable for $ty {
			const SIZE: usize = std::mem::size_of::<$ty>();

			fn encode (self, code: &mut Vec<u8>) {
				code.extend_from_slice(&self.to_le_bytes());
			}

			fn decode (ip: &mut usize, code: &[u8]) -> Self {
				let bytes = match code.get(*ip..*ip + Self::SIZE) {
					Some(bytes) => bytes,
					None => panic!("instruction stream truncated at {}", ip),
				};

				let mut buf = [0u8; std::mem::size_of::<$ty>()];
				buf.copy_from_slice(bytes);
				*ip += Self::SIZE;

				<$ty>::from_le_bytes(buf)
			}
		}
	)* };
}

codable_int!(u8, u16, i16, u64, i64);

static_assert!(std::mem::size_of::<Opcode>() == 1);

impl Codable for Opcode {
	const SIZE: usize = 1;

	fn encode (self, code: &mut Vec<u8>) {
		code.push(self.to_byte())
	}

	fn decode (ip: &mut usize, code: &[u8]) -> Self {
		let byte = u8::decode(ip, code);

		match Opcode::from_byte(byte) {
			Some(op) => op,
			None => panic!("unknown opcode 0x{:02x} at {}", byte, *ip - 1),
		}
	}
}



/// Assembles an instruction stream, with forward jump patching
#[derive(Debug, Clone, Default)]
pub struct CodeBuilder {
	code: Vec<u8>,
}

impl CodeBuilder {
	/// Create a new empty CodeBuilder
	pub fn new () -> Self { Self::default() }

	/// Get the offset the next byte will be written at
	pub fn pos (&self) -> usize { self.code.len() }

	/// Append an opcode
	pub fn op (&mut self, op: Opcode) -> &mut Self {
		op.encode(&mut self.code);
		self
	}

	/// Append a half operand
	pub fn half (&mut self, value: u16) -> &mut Self {
		value.encode(&mut self.code);
		self
	}

	/// Append a local offset operand, which may be negative for arguments
	pub fn local (&mut self, offset: i16) -> &mut Self {
		offset.encode(&mut self.code);
		self
	}

	/// Append a word operand
	pub fn word (&mut self, value: i64) -> &mut Self {
		value.encode(&mut self.code);
		self
	}

	/// Append a jump with a placeholder offset, returning the patch site
	pub fn jump (&mut self, op: Opcode) -> usize {
		self.op(op);
		let at = self.pos();
		self.local(0);
		at
	}

	/// Point a placeholder jump at the current position
	pub fn patch (&mut self, at: usize) {
		let offset = self.pos() as isize - (at + i16::SIZE) as isize;
		self.code[at..at + i16::SIZE].copy_from_slice(&(offset as i16).to_le_bytes());
	}

	/// Append a jump to an already emitted position
	pub fn jump_to (&mut self, op: Opcode, target: usize) -> &mut Self {
		self.op(op);
		let next = self.pos() + i16::SIZE;
		self.local((target as isize - next as isize) as i16)
	}

	/// Take the assembled bytes
	pub fn finish (self) -> Vec<u8> { self.code }
}


/// Apply a decoded jump offset to the position after the jump
pub fn jump_target (next: usize, offset: i16) -> usize {
	match next.checked_add_signed(offset as isize) {
		Some(target) => target,
		None => panic!("jump to before the start of the code block"),
	}
}
