//! Doubly linked list values

use crate::{
  arena::Arena,
  error::VmResult,
  pool::*,
};

use super::{ Tree, TreeValue, ListEl, lel_id };


/// The inline payload of a list tree
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ListValue {
  pub head: Option<ListElId>,
  pub tail: Option<ListElId>,
  pub len: usize,
}


impl Arena {
  /// Construct an empty list with one reference
  pub fn construct_list (&mut self) -> VmResult<TreeId> {
    self.alloc_tree(Tree { refs: 1, value: TreeValue::List(ListValue::default()), .. Tree::new(lel_id::LIST) })
  }

  fn list_value (&self, list: TreeId) -> ListValue {
    match self.trees[list].value {
      TreeValue::List(value) => value,
      other => panic!("expected a list, found {:?}", other),
    }
  }

  fn set_list_value (&mut self, list: TreeId, value: ListValue) {
    self.trees[list].value = TreeValue::List(value);
  }

  /// Get the number of elements in a list
  pub fn list_length (&self, list: TreeId) -> usize {
    self.list_value(list).len
  }

  /// Append a value to a list, moving the caller's reference into it
  ///
  /// If the pool is full the value is released
  pub fn list_append (&mut self, list: TreeId, value: Option<TreeId>) -> VmResult<()> {
    let mut lv = self.list_value(list);
    let el = match self.list_els.alloc(ListEl { value, next: None, prev: lv.tail }) {
      Ok(el) => el,
      Err(e) => {
        self.downref(value);
        return Err(e)
      }
    };

    match lv.tail {
      Some(tail) => self.list_els[tail].next = Some(el),
      None => lv.head = Some(el),
    }

    lv.tail = Some(el);
    lv.len += 1;
    self.set_list_value(list, lv);

    Ok(())
  }

  /// Detach the last element of a list, moving its reference to the caller
  ///
  /// Returns `None` if the list was empty
  pub fn list_remove_end (&mut self, list: TreeId) -> Option<Option<TreeId>> {
    let mut lv = self.list_value(list);
    let tail = lv.tail?;
    let el = self.list_els.free(tail);

    lv.tail = el.prev;
    match el.prev {
      Some(prev) => self.list_els[prev].next = None,
      None => lv.head = None,
    }

    lv.len -= 1;
    self.set_list_value(list, lv);

    Some(el.value)
  }

  /// Get the head (`field` 0) or tail (`field` 1) cell of a list
  pub fn list_mem (&self, list: TreeId, field: usize) -> Option<ListElId> {
    let lv = self.list_value(list);

    match field {
      0 => lv.head,
      1 => lv.tail,
      _ => panic!("list member {} out of range", field),
    }
  }

  /// Read the head or tail value of a list without acquiring it
  pub fn get_list_mem (&self, list: TreeId, field: usize) -> Option<TreeId> {
    self.list_mem(list, field).and_then(|el| self.list_els[el].value)
  }

  /// Read the head or tail value of a list for writing, splitting it if shared
  pub fn get_list_mem_split (&mut self, list: TreeId, field: usize) -> VmResult<Option<TreeId>> {
    let el = match self.list_mem(list, field) {
      Some(el) => el,
      None => return Ok(None)
    };

    match self.list_els[el].value {
      Some(value) => {
        let private = self.split(value)?;
        self.list_els[el].value = Some(private);
        Ok(Some(private))
      }

      None => Ok(None)
    }
  }

  /// Overwrite the head or tail value of a list, returning the previous reference
  pub fn set_list_mem (&mut self, list: TreeId, field: usize, value: Option<TreeId>) -> Option<TreeId> {
    match self.list_mem(list, field) {
      Some(el) => std::mem::replace(&mut self.list_els[el].value, value),
      None => panic!("set of member {} in an empty list", field),
    }
  }

  /// Collect the element values of a list, in order, without acquiring them
  pub fn list_values (&self, list: TreeId) -> Vec<Option<TreeId>> {
    let mut out = Vec::with_capacity(self.list_length(list));
    let mut cur = self.list_value(list).head;

    while let Some(el) = cur {
      let el = self.list_els[el];
      out.push(el.value);
      cur = el.next;
    }

    out
  }

  pub(crate) fn copy_list (&mut self, src: ListValue) -> VmResult<ListValue> {
    let mut out = ListValue::default();
    let mut cur = src.head;

    while let Some(el) = cur {
      let ListEl { value, next, .. } = self.list_els[el];

      let copy = match self.list_els.alloc(ListEl { value, next: None, prev: out.tail }) {
        Ok(copy) => copy,
        Err(e) => {
          let mut work = Vec::new();
          self.free_list_els(out, &mut work);
          self.release_queue(work);
          return Err(e)
        }
      };

      self.upref(value);
      match out.tail {
        Some(tail) => self.list_els[tail].next = Some(copy),
        None => out.head = Some(copy),
      }

      out.tail = Some(copy);
      out.len += 1;
      cur = next;
    }

    Ok(out)
  }

  pub(crate) fn free_list_els (&mut self, list: ListValue, work: &mut Vec<TreeId>) {
    let mut cur = list.head;

    while let Some(el) = cur {
      let el = self.list_els.free(el);
      work.extend(el.value);
      cur = el.next;
    }
  }
}
