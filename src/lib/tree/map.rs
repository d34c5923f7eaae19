//! Sorted map values keyed by tree comparison

use std::cmp::Ordering;

use crate::{
  arena::Arena,
  error::VmResult,
  pool::*,
  vm::runtime::RuntimeData,
};

use super::{ Tree, TreeValue, MapEl, lel_id };


/// The inline payload of a map tree
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MapValue {
  pub head: Option<MapElId>,
  pub len: usize,
}

/// The outcome of `map_store`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapStored {
  /// The key was new and both references moved into the map
  Inserted,
  /// The key existed; the value moved in, and the displaced value is
  /// returned. The caller keeps its key reference
  Replaced(Option<TreeId>),
}

struct Slot {
  prev: Option<MapElId>,
  found: Option<MapElId>,
}


impl Arena {
  /// Construct an empty map with one reference
  pub fn construct_map (&mut self) -> VmResult<TreeId> {
    self.alloc_tree(Tree { refs: 1, value: TreeValue::Map(MapValue::default()), .. Tree::new(lel_id::MAP) })
  }

  fn map_value (&self, map: TreeId) -> MapValue {
    match self.trees[map].value {
      TreeValue::Map(value) => value,
      other => panic!("expected a map, found {:?}", other),
    }
  }

  fn set_map_value (&mut self, map: TreeId, value: MapValue) {
    self.trees[map].value = TreeValue::Map(value);
  }

  fn map_locate (&self, rtd: &RuntimeData, map: TreeId, key: Option<TreeId>) -> Slot {
    let mut prev = None;
    let mut cur = self.map_value(map).head;

    while let Some(el) = cur {
      match self.cmp_tree(rtd, self.map_els[el].key, key) {
        Ordering::Less => {
          prev = Some(el);
          cur = self.map_els[el].next;
        }
        Ordering::Equal => return Slot { prev, found: Some(el) },
        Ordering::Greater => break,
      }
    }

    Slot { prev, found: None }
  }

  fn map_link (&mut self, map: TreeId, prev: Option<MapElId>, key: Option<TreeId>, value: Option<TreeId>) -> VmResult<()> {
    let mut mv = self.map_value(map);

    let next = match prev {
      Some(prev) => self.map_els[prev].next,
      None => mv.head,
    };

    let el = match self.map_els.alloc(MapEl { key, value, next }) {
      Ok(el) => el,
      Err(e) => {
        self.downref(key);
        self.downref(value);
        return Err(e)
      }
    };

    match prev {
      Some(prev) => self.map_els[prev].next = Some(el),
      None => mv.head = Some(el),
    }

    mv.len += 1;
    self.set_map_value(map, mv);

    Ok(())
  }

  fn map_unlink (&mut self, map: TreeId, slot: Slot) -> Option<(Option<TreeId>, Option<TreeId>)> {
    let found = slot.found?;
    let el = self.map_els.free(found);
    let mut mv = self.map_value(map);

    match slot.prev {
      Some(prev) => self.map_els[prev].next = el.next,
      None => mv.head = el.next,
    }

    mv.len -= 1;
    self.set_map_value(map, mv);

    Some((el.key, el.value))
  }

  /// Get the number of entries in a map
  pub fn map_length (&self, map: TreeId) -> usize {
    self.map_value(map).len
  }

  /// Look up a key without acquiring the result
  pub fn map_find (&self, rtd: &RuntimeData, map: TreeId, key: Option<TreeId>) -> Option<TreeId> {
    self.map_locate(rtd, map, key).found.and_then(|el| self.map_els[el].value)
  }

  /// Insert a new entry
  ///
  /// Returns false without touching the map if the key is present,
  /// in which case the caller keeps both references. If the pool is full
  /// both references are released
  pub fn map_insert (&mut self, rtd: &RuntimeData, map: TreeId, key: Option<TreeId>, value: Option<TreeId>) -> VmResult<bool> {
    let slot = self.map_locate(rtd, map, key);

    if slot.found.is_some() { return Ok(false) }

    self.map_link(map, slot.prev, key, value)?;

    Ok(true)
  }

  /// Remove an entry, moving its key and value references to the caller
  pub fn map_remove (&mut self, rtd: &RuntimeData, map: TreeId, key: Option<TreeId>) -> Option<(Option<TreeId>, Option<TreeId>)> {
    let slot = self.map_locate(rtd, map, key);
    self.map_unlink(map, slot)
  }

  /// Insert or overwrite an entry
  ///
  /// A new entry that cannot be allocated releases the key and value
  pub fn map_store (&mut self, rtd: &RuntimeData, map: TreeId, key: Option<TreeId>, value: Option<TreeId>) -> VmResult<MapStored> {
    let slot = self.map_locate(rtd, map, key);

    match slot.found {
      Some(el) => Ok(MapStored::Replaced(std::mem::replace(&mut self.map_els[el].value, value))),
      None => {
        self.map_link(map, slot.prev, key, value)?;
        Ok(MapStored::Inserted)
      }
    }
  }

  /// Put a displaced value back under an existing key, returning the value it replaces
  pub fn map_restore (&mut self, rtd: &RuntimeData, map: TreeId, key: Option<TreeId>, value: Option<TreeId>) -> Option<TreeId> {
    match self.map_locate(rtd, map, key).found {
      Some(el) => std::mem::replace(&mut self.map_els[el].value, value),
      None => panic!("restore of a map key that is not present"),
    }
  }

  /// Collect the entries of a map in key order, without acquiring them
  pub fn map_entries (&self, map: TreeId) -> Vec<(Option<TreeId>, Option<TreeId>)> {
    let mut out = Vec::with_capacity(self.map_length(map));
    let mut cur = self.map_value(map).head;

    while let Some(el) = cur {
      let el = self.map_els[el];
      out.push((el.key, el.value));
      cur = el.next;
    }

    out
  }

  pub(crate) fn copy_map (&mut self, src: MapValue) -> VmResult<MapValue> {
    let mut out = MapValue { head: None, len: src.len };
    let mut last: Option<MapElId> = None;
    let mut cur = src.head;

    while let Some(el) = cur {
      let MapEl { key, value, next } = self.map_els[el];

      let copy = match self.map_els.alloc(MapEl { key, value, next: None }) {
        Ok(copy) => copy,
        Err(e) => {
          let mut work = Vec::new();
          self.free_map_els(out, &mut work);
          self.release_queue(work);
          return Err(e)
        }
      };

      self.upref(key);
      self.upref(value);
      match last {
        Some(last) => self.map_els[last].next = Some(copy),
        None => out.head = Some(copy),
      }

      last = Some(copy);
      cur = next;
    }

    Ok(out)
  }

  pub(crate) fn free_map_els (&mut self, map: MapValue, work: &mut Vec<TreeId>) {
    let mut cur = map.head;

    while let Some(el) = cur {
      let el = self.map_els.free(el);
      work.extend(el.key);
      work.extend(el.value);
      cur = el.next;
    }
  }
}
