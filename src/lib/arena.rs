//! The Value Arena: one pool per kind of VM object

use std::fmt;

use crate::{
  pool::*,
  tree::{ Tree, Kid, Head, Location, ListEl, MapEl },
  parse::{ Parser, ParseTree },
};


/// Owns the storage for every tree, link, buffer and parser record
///
/// Everything else in the VM holds ids into these pools
#[derive(Debug)]
pub struct Arena {
  /// Value nodes
  pub trees: Pool<TreeId, Tree>,
  /// Child-link cells
  pub kids: Pool<KidId, Kid>,
  /// Parse-tree nodes of the LR driver
  pub parse_trees: Pool<ParseTreeId, ParseTree>,
  /// List cells
  pub list_els: Pool<ListElId, ListEl>,
  /// Map cells
  pub map_els: Pool<MapElId, MapEl>,
  /// Token buffers
  pub heads: Pool<HeadId, Head>,
  /// Source locations
  pub locations: Pool<LocationId, Location>,
  /// Parser records
  pub parsers: Pool<ParserId, Parser>,
}

impl Arena {
  /// Create a new Arena, optionally bounding every pool
  pub fn new (limit: Option<usize>) -> Self {
    Self {
      trees: Pool::new("trees", limit),
      kids: Pool::new("kids", limit),
      parse_trees: Pool::new("parse trees", limit),
      list_els: Pool::new("list elements", limit),
      map_els: Pool::new("map elements", limit),
      heads: Pool::new("heads", limit),
      locations: Pool::new("locations", limit),
      parsers: Pool::new("parsers", limit),
    }
  }

  /// Run `f` with a parser record moved out of its pool,
  /// so the parser and the rest of the arena can be borrowed together
  pub fn with_parser<R> (&mut self, id: ParserId, f: impl FnOnce(&mut Parser, &mut Arena) -> R) -> R {
    let mut parser = self.parsers.checkout(id);
    let out = f(&mut parser, self);
    self.parsers.checkin(id, parser);
    out
  }

  /// Compare allocation and release counts in every pool
  pub fn leak_report (&self) -> LeakReport {
    LeakReport {
      pools: vec![
        (self.kids.name(), self.kids.live()),
        (self.trees.name(), self.trees.live()),
        (self.parse_trees.name(), self.parse_trees.live()),
        (self.list_els.name(), self.list_els.live()),
        (self.map_els.name(), self.map_els.live()),
        (self.heads.name(), self.heads.live()),
        (self.locations.name(), self.locations.live()),
        (self.parsers.name(), self.parsers.live()),
      ]
    }
  }
}

impl Default for Arena { fn default () -> Self { Self::new(None) } }


/// Objects still allocated in each pool at teardown
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeakReport {
  /// Pool name and number of objects never released
  pub pools: Vec<(&'static str, usize)>,
}

impl LeakReport {
  /// Determine if every pool released everything it allocated
  pub fn is_clean (&self) -> bool {
    self.pools.iter().all(|&(_, lost)| lost == 0)
  }

  /// Get the number of lost objects in a named pool
  pub fn lost (&self, pool: &str) -> usize {
    self.pools.iter().find(|(name, _)| *name == pool).map_or(0, |&(_, lost)| lost)
  }
}

impl fmt::Display for LeakReport {
  fn fmt (&self, f: &mut fmt::Formatter) -> fmt::Result {
    for (name, lost) in self.pools.iter() {
      writeln!(f, "lost {}: {}", name, lost)?;
    }

    Ok(())
  }
}
