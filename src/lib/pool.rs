//! Typed index pools with free lists
//!
//! Every object the VM allocates lives in one of these. Ids are plain
//! indices, so handles are `Copy` and stay valid across pool growth

use std::{
  fmt,
  marker::PhantomData,
  ops::{ Index, IndexMut },
};

use crate::error::{ VmError, VmResult };


/// A typed index into a Pool
pub trait PoolId: Copy + Eq + fmt::Debug {
  /// Wrap a raw slot index
  fn from_index (index: usize) -> Self;
  /// Get the raw slot index
  fn index (self) -> usize;
}

macro_rules! pool_id {
  ($( $(#[$meta:meta])* $name:ident ),* $(,)?) => { $(
    $(#[$meta])*
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct $name(pub(crate) u32);

    impl $name {
      /// The maximum number of live objects of this kind
      pub const MAX: usize = u32::MAX as _;
    }

    impl PoolId for $name {
      fn from_index (index: usize) -> Self { Self(index as u32) }
      fn index (self) -> usize { self.0 as usize }
    }
  )* };
}

pool_id! {
  /// Identifies a value node
  TreeId,
  /// Identifies a child-link cell
  KidId,
  /// Identifies a parse-tree node used by the LR driver
  ParseTreeId,
  /// Identifies a list cell
  ListElId,
  /// Identifies a map cell
  MapElId,
  /// Identifies a token buffer
  HeadId,
  /// Identifies a source location record
  LocationId,
  /// Identifies a parser record
  ParserId,
}


enum Entry<T> {
  Free,
  Live(T),
  /// Temporarily moved out by `checkout`; still counted as live
  Out,
}


/// A growable slab of `T` addressed by `I`, with allocation accounting
pub struct Pool<I, T> {
  name: &'static str,
  entries: Vec<Entry<T>>,
  free_list: Vec<usize>,
  limit: Option<usize>,
  allocated: usize,
  released: usize,
  _id: PhantomData<I>,
}

impl<I: PoolId, T> Pool<I, T> {
  /// Create a new Pool, optionally bounding the number of live objects
  pub fn new (name: &'static str, limit: Option<usize>) -> Self {
    Self {
      name,
      entries: Vec::new(),
      free_list: Vec::new(),
      limit,
      allocated: 0,
      released: 0,
      _id: PhantomData,
    }
  }

  /// The name used in diagnostics and leak reports
  pub fn name (&self) -> &'static str { self.name }

  /// Number of objects currently live
  pub fn live (&self) -> usize { self.allocated - self.released }

  /// Total number of allocations over the pool's lifetime
  pub fn allocated (&self) -> usize { self.allocated }

  /// Total number of releases over the pool's lifetime
  pub fn released (&self) -> usize { self.released }

  /// Check that one more object fits under the pool's limit
  pub fn ensure_room (&self) -> VmResult<()> {
    if let Some(limit) = self.limit {
      if self.live() >= limit {
        return Err(VmError::PoolExhausted { pool: self.name, limit })
      }
    }

    if self.free_list.is_empty() && self.entries.len() >= u32::MAX as usize {
      return Err(VmError::PoolExhausted { pool: self.name, limit: u32::MAX as usize })
    }

    Ok(())
  }

  /// Store a value, reusing a freed slot when one is available
  ///
  /// If the pool is full the value is dropped; callers holding references
  /// through it release them first or check `ensure_room`
  pub fn alloc (&mut self, value: T) -> VmResult<I> {
    self.ensure_room()?;

    let index = match self.free_list.pop() {
      Some(index) => {
        self.entries[index] = Entry::Live(value);
        index
      }

      None => {
        self.entries.push(Entry::Live(value));
        self.entries.len() - 1
      }
    };

    self.allocated += 1;

    Ok(I::from_index(index))
  }

  /// Release a slot, returning the value it held
  ///
  /// Freeing a slot that is not live is an invariant violation
  pub fn free (&mut self, id: I) -> T {
    let entry = self.entries.get_mut(id.index()).map(|e| std::mem::replace(e, Entry::Free));

    match entry {
      Some(Entry::Live(value)) => {
        self.free_list.push(id.index());
        self.released += 1;
        value
      }

      Some(other) => {
        self.entries[id.index()] = other;
        panic!("{} pool: free of {:?}, which is not live", self.name, id)
      }

      None => panic!("{} pool: free of out of range {:?}", self.name, id),
    }
  }

  /// Get a reference to a live value
  pub fn get (&self, id: I) -> Option<&T> {
    match self.entries.get(id.index()) {
      Some(Entry::Live(value)) => Some(value),
      _ => None
    }
  }

  /// Get a mutable reference to a live value
  pub fn get_mut (&mut self, id: I) -> Option<&mut T> {
    match self.entries.get_mut(id.index()) {
      Some(Entry::Live(value)) => Some(value),
      _ => None
    }
  }

  /// Move a live value out without releasing its slot
  ///
  /// The slot must be returned with `checkin` before it is used again
  pub fn checkout (&mut self, id: I) -> T {
    let entry = self.entries.get_mut(id.index()).map(|e| std::mem::replace(e, Entry::Out));

    match entry {
      Some(Entry::Live(value)) => value,
      Some(other) => {
        self.entries[id.index()] = other;
        panic!("{} pool: checkout of {:?}, which is not live", self.name, id)
      }
      None => panic!("{} pool: checkout of out of range {:?}", self.name, id),
    }
  }

  /// Return a value moved out with `checkout`
  pub fn checkin (&mut self, id: I, value: T) {
    match self.entries.get_mut(id.index()) {
      Some(entry @ Entry::Out) => *entry = Entry::Live(value),
      _ => panic!("{} pool: checkin of {:?}, which was not checked out", self.name, id),
    }
  }

  /// Iterate the ids of every live value
  pub fn live_ids (&self) -> impl Iterator<Item = I> + '_ {
    self.entries.iter().enumerate().filter_map(|(i, e)| match e {
      Entry::Live(_) | Entry::Out => Some(I::from_index(i)),
      Entry::Free => None
    })
  }
}

impl<I: PoolId, T> Index<I> for Pool<I, T> {
  type Output = T;

  fn index (&self, id: I) -> &T {
    match self.get(id) {
      Some(value) => value,
      None => panic!("{} pool: access to dead {:?}", self.name, id),
    }
  }
}

impl<I: PoolId, T> IndexMut<I> for Pool<I, T> {
  fn index_mut (&mut self, id: I) -> &mut T {
    let name = self.name;
    match self.get_mut(id) {
      Some(value) => value,
      None => panic!("{} pool: access to dead {:?}", name, id),
    }
  }
}

impl<I, T> fmt::Debug for Pool<I, T> {
  fn fmt (&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_struct("Pool")
      .field("name", &self.name)
      .field("allocated", &self.allocated)
      .field("released", &self.released)
      .finish()
  }
}
