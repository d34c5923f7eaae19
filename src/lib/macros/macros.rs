/// Compile time assert!
#[macro_export]
macro_rules! static_assert {
	($cond:expr) => {
		const _: [();0] = [(); 0 - (!($cond) as usize)];
	}
}


/// Sort of a c-like enum builder for when you need to do arithmetic on enums and have unnamed variants
#[macro_export]
macro_rules! c_enum {
	( $(
		$(#[$meta:meta])*
		$vis:vis $name:ident : $repr:ty {
			$( $(#[$vmeta:meta])* $vars:ident = $vals:expr ),* $(,)?
		}
	)* ) => { $(
		$(#[$meta])*
		#[allow(non_snake_case)]
		$vis mod $name {
			#![allow(non_upper_case_globals)]
			/// The type representing a c_enum
			pub type Repr = $repr;
			$( $(#[$vmeta])* pub const $vars: $repr = $vals; )*
		}
	)* };
}


/// Builds a dense `#[repr(u8)]` opcode enum along with a checked byte decoder
///
/// Variants are numbered in declaration order starting at zero,
/// so `from_byte` is a single table lookup
#[macro_export]
macro_rules! opcodes {
	(
		$(#[$meta:meta])*
		$vis:vis enum $name:ident {
			$( $(#[$vmeta:meta])* $var:ident ),* $(,)?
		}
	) => {
		$(#[$meta])*
		#[repr(u8)]
		#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
		$vis enum $name {
			$( $(#[$vmeta])* $var ),*
		}

		impl $name {
			/// Every variant, indexed by its byte encoding
			pub const ALL: &'static [$name] = &[ $( $name::$var ),* ];

			/// Decode a byte into a variant, if it names one
			pub fn from_byte (byte: u8) -> Option<$name> {
				Self::ALL.get(byte as usize).copied()
			}

			/// Get the byte encoding of a variant
			pub fn to_byte (self) -> u8 {
				self as u8
			}
		}
	};
}
