//! Reference counted, copy-on-write value nodes
//!
//! A tree is an arena cell with an explicit reference count. Every owner
//! (a stack slot, a parent's child link, a saved frame slot, a log entry)
//! holds exactly one reference; `upref` and `downref` move the count and
//! `split` produces a private copy before an in-place write

use std::{
  cmp::Ordering,
  rc::Rc,
};

use arbor_macros::c_enum;

use crate::{
  arena::Arena,
  error::VmResult,
  pool::*,
  vm::runtime::RuntimeData,
};

pub mod list;
pub mod map;
pub mod pattern;
pub mod print;

pub use self::{
  list::ListValue,
  map::MapValue,
};


/// A language element id: the type of a tree
pub type LelId = u16;

c_enum! {
  /// Language element ids reserved by the VM
  pub lel_id: u16 {
    /// Pointer to a program heap cell
    PTR = 1,
    /// Boolean singleton
    BOOL = 2,
    /// Integer
    INT = 3,
    /// String
    STR = 4,
    /// Ignored token
    IGNORE = 5,
    /// List
    LIST = 6,
    /// Ordered map
    MAP = 7,
    /// Parser handle
    PARSER = 8,
    /// The global record
    GLOBAL = 9,
    /// Matches any element in a search
    ANY = 10,
    /// First id available to grammars
    FIRST_USER = 11,
  }
}


/// The inline payload of a tree
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeValue {
  None,
  Int(i64),
  /// Points at a program heap cell
  Ptr(KidId),
  List(ListValue),
  Map(MapValue),
  Parser(ParserId),
}

/// A value node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tree {
  /// The language element this tree is an instance of
  pub id: LelId,
  /// The production that built it, for nonterminals
  pub prod_num: u16,
  /// Number of live owners
  pub refs: u32,
  /// Token text, for tokens and strings
  pub tokdata: Option<HeadId>,
  /// Attribute kids followed by syntactic children
  pub child: Option<KidId>,
  /// Inline payload
  pub value: TreeValue,
}

impl Tree {
  /// Create an unreferenced tree of the given type
  pub fn new (id: LelId) -> Self {
    Self { id, prod_num: 0, refs: 0, tokdata: None, child: None, value: TreeValue::None }
  }
}

/// A child link; also the target cell of references and cursors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Kid {
  /// The owned tree, if any
  pub tree: Option<TreeId>,
  /// The next sibling
  pub next: Option<KidId>,
}

/// A token buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Head {
  /// Raw bytes, shared between copies until replaced
  pub data: Rc<[u8]>,
  /// Where the text came from
  pub location: Option<LocationId>,
}

/// A source location record
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Location {
  /// Name of the input the text was read from
  pub name: Option<Rc<str>>,
  /// One based line number
  pub line: u32,
  /// One based column number
  pub column: u32,
  /// Byte offset into the input
  pub byte: u64,
}

/// A list cell
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListEl {
  pub value: Option<TreeId>,
  pub next: Option<ListElId>,
  pub prev: Option<ListElId>,
}

/// A map cell; cells are kept sorted by key
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapEl {
  pub key: Option<TreeId>,
  pub value: Option<TreeId>,
  pub next: Option<MapElId>,
}



impl Arena {
  /// Store a tree, taking ownership of its links
  ///
  /// If the pool is full the links are released
  pub fn alloc_tree (&mut self, tree: Tree) -> VmResult<TreeId> {
    self.trees.alloc(tree).map_err(|e| {
      self.release_links(tree);
      e
    })
  }

  /// Increment the reference count of a tree, returning the same reference
  pub fn upref (&mut self, tree: Option<TreeId>) -> Option<TreeId> {
    if let Some(id) = tree {
      self.trees[id].refs += 1;
    }

    tree
  }

  /// Decrement the reference count of a tree, releasing it and everything
  /// it exclusively owns when the count reaches zero
  pub fn downref (&mut self, tree: Option<TreeId>) {
    let mut work: Vec<TreeId> = tree.into_iter().collect();

    while let Some(id) = work.pop() {
      let tree = &mut self.trees[id];
      assert!(tree.refs > 0, "release of {:?}, which has no references", id);

      tree.refs -= 1;
      if tree.refs == 0 {
        self.free_tree(id, &mut work);
      }
    }
  }

  fn free_tree (&mut self, id: TreeId, work: &mut Vec<TreeId>) {
    let tree = self.trees.free(id);
    self.free_links(tree, work);
  }

  /// Release everything a tree that was never stored links to
  pub(crate) fn release_links (&mut self, tree: Tree) {
    let mut work = Vec::new();
    self.free_links(tree, &mut work);
    self.release_queue(work);
  }

  pub(crate) fn release_queue (&mut self, work: Vec<TreeId>) {
    for tree in work {
      self.downref(Some(tree));
    }
  }

  fn free_links (&mut self, tree: Tree, work: &mut Vec<TreeId>) {
    if let Some(head) = tree.tokdata {
      self.free_head(head);
    }

    self.free_kid_list(tree.child, work);

    match tree.value {
      TreeValue::List(list) => self.free_list_els(list, work),
      TreeValue::Map(map) => self.free_map_els(map, work),
      TreeValue::Parser(parser) => self.free_parser(parser),
      TreeValue::None | TreeValue::Int(_) | TreeValue::Ptr(_) => { }
    }
  }

  /// Free a chain of kids, queueing their trees for release
  pub(crate) fn free_kid_list (&mut self, mut kid: Option<KidId>, work: &mut Vec<TreeId>) {
    while let Some(id) = kid {
      let k = self.kids.free(id);
      work.extend(k.tree);
      kid = k.next;
    }
  }


  /// Allocate a kid, taking ownership of `tree` and the chain at `next`
  ///
  /// If the pool is full both are released
  pub fn alloc_kid (&mut self, tree: Option<TreeId>, next: Option<KidId>) -> VmResult<KidId> {
    self.kids.alloc(Kid { tree, next }).map_err(|e| {
      self.release_kid_list(next);
      self.downref(tree);
      e
    })
  }

  /// Free a chain of kids and release their trees
  pub(crate) fn release_kid_list (&mut self, kid: Option<KidId>) {
    let mut work = Vec::new();
    self.free_kid_list(kid, &mut work);
    self.release_queue(work);
  }

  /// Allocate a chain of `n` empty attribute kids
  pub fn alloc_attrs (&mut self, n: usize) -> VmResult<Option<KidId>> {
    let mut head = None;

    for _ in 0..n {
      head = Some(self.alloc_kid(None, head)?);
    }

    Ok(head)
  }

  /// Walk `n` links along a kid chain
  pub fn kid_at (&self, mut kid: Option<KidId>, n: usize) -> Option<KidId> {
    for _ in 0..n {
      kid = kid.and_then(|k| self.kids[k].next);
    }

    kid
  }

  /// Get the first syntactic child of a tree, skipping its attributes
  pub fn tree_child (&self, rtd: &RuntimeData, tree: TreeId) -> Option<KidId> {
    let t = &self.trees[tree];
    self.kid_at(t.child, rtd.object_length(t.id))
  }

  /// Get the kid holding attribute `field` of a tree
  pub fn field_kid (&self, tree: TreeId, field: usize) -> KidId {
    match self.kid_at(self.trees[tree].child, field) {
      Some(kid) => kid,
      None => panic!("field {} out of range for {:?}", field, tree),
    }
  }

  /// Read an attribute without acquiring it
  pub fn get_field (&self, tree: TreeId, field: usize) -> Option<TreeId> {
    self.kids[self.field_kid(tree, field)].tree
  }

  /// Overwrite an attribute, returning the previous occupant's reference
  pub fn set_field (&mut self, tree: TreeId, field: usize, value: Option<TreeId>) -> Option<TreeId> {
    let kid = self.field_kid(tree, field);
    std::mem::replace(&mut self.kids[kid].tree, value)
  }

  /// Read an attribute for writing, splitting it first if it is shared
  pub fn get_field_split (&mut self, tree: TreeId, field: usize) -> VmResult<Option<TreeId>> {
    let kid = self.field_kid(tree, field);
    self.split_kid(kid)
  }

  /// Make the tree held by a kid private to it
  pub fn split_kid (&mut self, kid: KidId) -> VmResult<Option<TreeId>> {
    match self.kids[kid].tree {
      Some(tree) => {
        let private = self.split(tree)?;
        self.kids[kid].tree = Some(private);
        Ok(Some(private))
      }

      None => Ok(None)
    }
  }

  /// Get the syntactic child at `position`
  pub fn get_rhs_el (&self, rtd: &RuntimeData, tree: TreeId, position: usize) -> Option<TreeId> {
    let kid = self.kid_at(self.tree_child(rtd, tree), position);
    kid.and_then(|k| self.kids[k].tree)
  }


  /// Copy-on-write entry point
  ///
  /// If the tree has more than one owner, the caller's reference is moved
  /// to a fresh shallow copy, which is returned. Otherwise the tree itself
  /// is returned. Either way the caller must rebind to the result
  pub fn split (&mut self, tree: TreeId) -> VmResult<TreeId> {
    if self.trees[tree].refs > 1 {
      let (copy, _) = self.copy_tree(tree, None)?;
      self.trees[copy].refs = 1;
      self.trees[tree].refs -= 1;
      Ok(copy)
    } else {
      Ok(tree)
    }
  }

  /// Shallow copy of a tree with zero references
  ///
  /// Children and list or map elements are shared by acquiring them.
  /// If `old_next_down` is one of the copied kids, the returned kid is its copy.
  /// On failure everything copied so far is released again
  pub fn copy_tree (&mut self, tree: TreeId, old_next_down: Option<KidId>) -> VmResult<(TreeId, Option<KidId>)> {
    let src = self.trees[tree];

    let tokdata = match src.tokdata {
      Some(head) => Some(self.copy_head(head)?),
      None => None
    };

    let mut copy = Tree { refs: 0, tokdata, child: None, value: TreeValue::None, .. src };

    let new_next_down = match self.copy_links(&src, &mut copy, old_next_down) {
      Ok(kid) => kid,
      Err(e) => {
        self.release_links(copy);
        return Err(e)
      }
    };

    Ok((self.alloc_tree(copy)?, new_next_down))
  }

  /// Fill in the kids and value of a copy, leaving it consistent if an allocation fails
  fn copy_links (&mut self, src: &Tree, copy: &mut Tree, old_next_down: Option<KidId>) -> VmResult<Option<KidId>> {
    let mut new_next_down = None;
    let mut last: Option<KidId> = None;
    let mut cur = src.child;

    while let Some(kid) = cur {
      let k = self.kids[kid];

      let kid_copy = self.kids.alloc(Kid { tree: k.tree, next: None })?;
      self.upref(k.tree);

      match last {
        Some(last) => self.kids[last].next = Some(kid_copy),
        None => copy.child = Some(kid_copy),
      }
      last = Some(kid_copy);

      if Some(kid) == old_next_down {
        new_next_down = Some(kid_copy);
      }

      cur = k.next;
    }

    copy.value = match src.value {
      TreeValue::List(list) => TreeValue::List(self.copy_list(list)?),
      TreeValue::Map(map) => TreeValue::Map(self.copy_map(map)?),
      TreeValue::Parser(_) => panic!("parser values cannot be copied"),
      other => other,
    };

    Ok(new_next_down)
  }


  /// Allocate a token buffer
  ///
  /// Takes ownership of `location`, which is freed if the pool is full
  pub fn alloc_head (&mut self, data: &[u8], location: Option<LocationId>) -> VmResult<HeadId> {
    self.store_head(Head { data: data.into(), location })
  }

  fn store_head (&mut self, head: Head) -> VmResult<HeadId> {
    let location = head.location;

    self.heads.alloc(head).map_err(|e| {
      if let Some(loc) = location {
        self.locations.free(loc);
      }
      e
    })
  }

  /// Duplicate a token buffer along with its location
  pub fn copy_head (&mut self, head: HeadId) -> VmResult<HeadId> {
    let Head { data, location } = self.heads[head].clone();

    let location = match location {
      Some(loc) => {
        let loc = self.locations[loc].clone();
        Some(self.locations.alloc(loc)?)
      }
      None => None
    };

    self.store_head(Head { data, location })
  }

  /// Release a token buffer and its location
  pub fn free_head (&mut self, head: HeadId) {
    let head = self.heads.free(head);

    if let Some(loc) = head.location {
      self.locations.free(loc);
    }
  }

  /// Get the bytes of a token buffer
  pub fn head_data (&self, head: HeadId) -> &[u8] {
    &self.heads[head].data
  }

  /// Get the location of a token buffer, if it has one
  pub fn head_location (&self, head: HeadId) -> Option<&Location> {
    self.heads[head].location.map(|loc| &self.locations[loc])
  }

  /// Get the token text of a tree, or an empty slice
  pub fn tree_data (&self, tree: TreeId) -> &[u8] {
    match self.trees[tree].tokdata {
      Some(head) => self.head_data(head),
      None => &[]
    }
  }


  /// Construct an integer tree with one reference
  pub fn construct_int (&mut self, value: i64) -> VmResult<TreeId> {
    self.alloc_tree(Tree { refs: 1, value: TreeValue::Int(value), .. Tree::new(lel_id::INT) })
  }

  /// Construct a string tree with one reference
  pub fn construct_str (&mut self, data: &[u8]) -> VmResult<TreeId> {
    let head = self.alloc_head(data, None)?;
    self.construct_str_head(head)
  }

  /// Construct a string tree that takes ownership of a buffer
  pub fn construct_str_head (&mut self, head: HeadId) -> VmResult<TreeId> {
    self.alloc_tree(Tree { refs: 1, tokdata: Some(head), .. Tree::new(lel_id::STR) })
  }

  /// Construct a token of type `id` with one reference and empty attributes
  pub fn construct_token (&mut self, rtd: &RuntimeData, id: LelId, data: &[u8], location: Option<Location>)
    -> VmResult<TreeId>
  {
    let location = match location {
      Some(loc) => Some(self.locations.alloc(loc)?),
      None => None
    };

    let head = self.alloc_head(data, location)?;
    let child = match self.alloc_attrs(rtd.object_length(id)) {
      Ok(child) => child,
      Err(e) => {
        self.free_head(head);
        return Err(e)
      }
    };

    self.alloc_tree(Tree { refs: 1, tokdata: Some(head), child, .. Tree::new(id) })
  }

  /// Construct a tree of type `id` with empty attributes followed by `children`
  ///
  /// The children are acquired; nothing is left acquired if an allocation fails
  pub fn construct_tree (&mut self, rtd: &RuntimeData, id: LelId, children: &[Option<TreeId>]) -> VmResult<TreeId> {
    let mut child = None;

    for &c in children.iter().rev() {
      let c = self.upref(c);
      child = Some(self.alloc_kid(c, child)?);
    }

    for _ in 0..rtd.object_length(id) {
      child = Some(self.alloc_kid(None, child)?);
    }

    self.alloc_tree(Tree { refs: 1, child, .. Tree::new(id) })
  }

  /// Construct a record of type `id` with one reference and empty attributes
  pub fn construct_object (&mut self, rtd: &RuntimeData, id: LelId) -> VmResult<TreeId> {
    let child = self.alloc_attrs(rtd.object_length(id))?;
    self.alloc_tree(Tree { refs: 1, child, .. Tree::new(id) })
  }


  /// Get the integer payload of an integer or boolean tree
  ///
  /// Asking any other kind of tree is a bytecode defect
  pub fn int_value (&self, tree: Option<TreeId>) -> i64 {
    match tree.map(|t| self.trees[t].value) {
      Some(TreeValue::Int(value)) => value,
      other => panic!("expected an integer value, found {:?}", other),
    }
  }


  /// Total order over trees: by type, payload, token text, then children
  pub fn cmp_tree (&self, rtd: &RuntimeData, a: Option<TreeId>, b: Option<TreeId>) -> Ordering {
    let mut pending: Vec<(Option<KidId>, Option<KidId>)> = Vec::new();
    let mut next = Some((a, b));

    loop {
      if let Some((a, b)) = next.take() {
        let ord = self.cmp_node(a, b);
        if ord != Ordering::Equal { return ord }

        if let (Some(a), Some(b)) = (a, b) {
          pending.push((self.tree_child(rtd, a), self.tree_child(rtd, b)));
        }
      }

      match pending.pop() {
        None => return Ordering::Equal,
        Some((None, None)) => { }
        Some((None, Some(_))) => return Ordering::Less,
        Some((Some(_), None)) => return Ordering::Greater,
        Some((Some(ka), Some(kb))) => {
          let (ka, kb) = (self.kids[ka], self.kids[kb]);
          pending.push((ka.next, kb.next));
          next = Some((ka.tree, kb.tree));
        }
      }
    }
  }

  fn cmp_node (&self, a: Option<TreeId>, b: Option<TreeId>) -> Ordering {
    let (a, b) = match (a, b) {
      (None, None) => return Ordering::Equal,
      (None, Some(_)) => return Ordering::Less,
      (Some(_), None) => return Ordering::Greater,
      (Some(a), Some(b)) => (&self.trees[a], &self.trees[b]),
    };

    a.id.cmp(&b.id).then_with(|| match (a.value, b.value) {
      (TreeValue::Int(x), TreeValue::Int(y)) => x.cmp(&y),
      (TreeValue::Ptr(x), TreeValue::Ptr(y)) => x.cmp(&y),
      _ => match (a.tokdata, b.tokdata) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => self.head_data(x).cmp(self.head_data(y)),
      }
    })
  }

  /// Depth first search for the first tree of type `id`
  pub fn tree_search (&self, rtd: &RuntimeData, tree: TreeId, id: LelId) -> Option<TreeId> {
    if self.trees[tree].id == id { return Some(tree) }

    let mut cursors = vec![self.tree_child(rtd, tree)];

    while let Some(cursor) = cursors.pop() {
      let kid = match cursor {
        Some(kid) => self.kids[kid],
        None => continue
      };

      cursors.push(kid.next);

      if let Some(child) = kid.tree {
        if self.trees[child].id == id { return Some(child) }
        cursors.push(self.tree_child(rtd, child));
      }
    }

    None
  }
}
