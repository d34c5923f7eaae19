//! Rendering trees as text

use std::io::Write;

use crate::{
  arena::Arena,
  pool::*,
  vm::runtime::RuntimeData,
};

use super::{ TreeValue, lel_id };


impl Arena {
  /// Append the text of a tree to `out`
  ///
  /// Tokens print their text, nonterminals the text of their leaves in order,
  /// lists and maps their elements; nil prints as `NIL`
  pub fn print_tree (&self, rtd: &RuntimeData, tree: Option<TreeId>, out: &mut Vec<u8>) {
    let mut work = vec![tree];

    while let Some(next) = work.pop() {
      let id = match next {
        Some(id) => id,
        None => {
          out.extend_from_slice(b"NIL");
          continue
        }
      };

      let t = &self.trees[id];

      match (t.id, t.value) {
        (lel_id::BOOL, TreeValue::Int(v)) => out.extend_from_slice(if v != 0 { b"true" } else { b"false" }),
        (_, TreeValue::Int(v)) => { let _ = write!(out, "{}", v); }
        (_, TreeValue::Ptr(kid)) => { let _ = write!(out, "#<{:x}>", kid.0); }
        (_, TreeValue::Parser(parser)) => { let _ = write!(out, "#parser<{:x}>", parser.0); }
        (_, TreeValue::List(_)) => work.extend(self.list_values(id).into_iter().rev()),
        (_, TreeValue::Map(_)) => {
          for (_, value) in self.map_entries(id).into_iter().rev() {
            work.push(value);
          }
        }

        (_, TreeValue::None) => {
          out.extend_from_slice(self.tree_data(id));

          let mut children = Vec::new();
          let mut cur = self.tree_child(rtd, id);
          while let Some(kid) = cur {
            // Unset children print nothing rather than NIL
            if let Some(child) = self.kids[kid].tree {
              children.push(Some(child));
            }
            cur = self.kids[kid].next;
          }

          work.extend(children.into_iter().rev());
        }
      }
    }
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_print_values () {
    let rtd = RuntimeData::default();
    let mut arena = Arena::default();

    let list = arena.construct_list().unwrap();
    let a = arena.construct_str(b"a").unwrap();
    let n = arena.construct_int(42).unwrap();
    arena.list_append(list, Some(a)).unwrap();
    arena.list_append(list, Some(n)).unwrap();
    arena.list_append(list, None).unwrap();

    let mut out = Vec::new();
    arena.print_tree(&rtd, Some(list), &mut out);
    assert_eq!(out, b"a42NIL");

    arena.downref(Some(list));
  }
}
