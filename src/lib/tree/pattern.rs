//! Matching trees against compiled patterns, and building trees from templates
//!
//! Patterns and templates share one node table in `RuntimeData`. Binding ids
//! start at one; zero marks a node that binds nothing

use crate::{
  arena::Arena,
  error::VmResult,
  pool::*,
  vm::runtime::RuntimeData,
};

use super::Tree;


impl Arena {
  /// Match `tree` against pattern `pattern`
  ///
  /// On success returns the bound trees in binding order, not acquired
  pub fn match_pattern (&self, rtd: &RuntimeData, pattern: usize, tree: Option<TreeId>) -> Option<Vec<TreeId>> {
    let info = &rtd.patterns[pattern];
    let mut bindings = vec![None; info.num_bindings + 1];

    let matched = match tree {
      Some(tree) => self.match_node(rtd, &mut bindings, Some(info.offset), Some(tree), None, false),
      None => false
    };

    if !matched { return None }

    bindings.into_iter().skip(1).map(|b| {
      debug_assert!(b.is_some(), "pattern {} left a binding unset", pattern);
      b
    }).collect()
  }

  fn match_node (
    &self, rtd: &RuntimeData, bindings: &mut [Option<TreeId>],
    mut pat: Option<usize>, mut tree: Option<TreeId>, mut next: Option<KidId>, check_next: bool
  ) -> bool {
    loop {
      let (node, t) = match (pat, tree) {
        (None, None) => return true,
        (Some(p), Some(t)) => (&rtd.pattern_nodes[p], t),
        _ => return false,
      };

      if node.id != self.trees[t].id { return false }

      if let Some(data) = &node.data {
        if data[..] != *self.tree_data(t) { return false }
      }

      if node.bind_id > 0 {
        bindings[node.bind_id] = Some(t);
      }

      if !node.stop {
        let child = self.tree_child(rtd, t);
        let first = child.and_then(|k| self.kids[k].tree);
        let rest = child.and_then(|k| self.kids[k].next);

        let matched = match child {
          Some(_) => self.match_node(rtd, bindings, node.child, first, rest, true),
          None => node.child.is_none(),
        };

        if !matched { return false }
      }

      if !check_next { return true }

      pat = node.next;
      match next {
        Some(kid) => {
          tree = self.kids[kid].tree;
          next = self.kids[kid].next;
          if tree.is_none() { return false }
        }
        None => tree = None,
      }
    }
  }


  /// Build a tree from template `pattern`
  ///
  /// Each use of a binding acquires it; the caller keeps its own references
  pub fn construct_pattern (&mut self, rtd: &RuntimeData, pattern: usize, bindings: &[Option<TreeId>]) -> VmResult<Option<TreeId>> {
    let root = rtd.patterns[pattern].offset;
    self.construct_node(rtd, root, bindings)
  }

  fn construct_node (&mut self, rtd: &RuntimeData, pat: usize, bindings: &[Option<TreeId>]) -> VmResult<Option<TreeId>> {
    let node = &rtd.pattern_nodes[pat];

    if node.bind_id > 0 {
      return Ok(self.upref(bindings[node.bind_id - 1]))
    }

    let mut children = Vec::new();
    let mut cur = node.child;
    while let Some(c) = cur {
      match self.construct_node(rtd, c, bindings) {
        Ok(tree) => children.push(tree),
        Err(e) => {
          children.into_iter().for_each(|tree| self.downref(tree));
          return Err(e)
        }
      }
      cur = rtd.pattern_nodes[c].next;
    }

    let mut child = None;
    while let Some(tree) = children.pop() {
      child = match self.alloc_kid(tree, child) {
        Ok(kid) => Some(kid),
        Err(e) => {
          children.into_iter().for_each(|tree| self.downref(tree));
          return Err(e)
        }
      };
    }

    for _ in 0..rtd.object_length(node.id) {
      child = Some(self.alloc_kid(None, child)?);
    }

    let tokdata = match &node.data {
      Some(data) => match self.alloc_head(data, None) {
        Ok(head) => Some(head),
        Err(e) => {
          self.release_kid_list(child);
          return Err(e)
        }
      }
      None => None
    };

    Ok(Some(self.alloc_tree(Tree { refs: 1, prod_num: node.prod_num, tokdata, child, .. Tree::new(node.id) })?))
  }
}


#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    tree::lel_id,
    vm::runtime::{ LangElInfo, PatternInfo, PatternNode },
  };

  const PAIR: u16 = lel_id::FIRST_USER;
  const WORD: u16 = lel_id::FIRST_USER + 1;

  // pair( word "x", $1 )
  fn pattern_rtd () -> RuntimeData {
    let mut rtd = RuntimeData::default();
    rtd.define_lel(PAIR, LangElInfo { name: "pair".into(), .. LangElInfo::default() });
    rtd.define_lel(WORD, LangElInfo { name: "word".into(), .. LangElInfo::default() });

    rtd.pattern_nodes = vec![
      PatternNode { id: PAIR, child: Some(1), .. PatternNode::default() },
      PatternNode { id: WORD, data: Some(b"x".to_vec()), next: Some(2), .. PatternNode::default() },
      PatternNode { id: WORD, bind_id: 1, .. PatternNode::default() },
    ];
    rtd.patterns = vec![ PatternInfo { offset: 0, num_bindings: 1 } ];
    rtd
  }

  fn pair (arena: &mut Arena, rtd: &RuntimeData, a: &[u8], b: &[u8]) -> TreeId {
    let x = arena.construct_token(rtd, WORD, a, None).unwrap();
    let y = arena.construct_token(rtd, WORD, b, None).unwrap();
    let ky = arena.alloc_kid(Some(y), None).unwrap();
    let kx = arena.alloc_kid(Some(x), Some(ky)).unwrap();
    arena.alloc_tree(Tree { refs: 1, child: Some(kx), .. Tree::new(PAIR) }).unwrap()
  }

  #[test]
  fn test_match_binds () {
    let rtd = pattern_rtd();
    let mut arena = Arena::default();

    let hit = pair(&mut arena, &rtd, b"x", b"y");
    let miss = pair(&mut arena, &rtd, b"z", b"y");

    let bindings = arena.match_pattern(&rtd, 0, Some(hit)).unwrap();
    assert_eq!(bindings.len(), 1);
    assert_eq!(arena.tree_data(bindings[0]), b"y");

    assert!(arena.match_pattern(&rtd, 0, Some(miss)).is_none());
    assert!(arena.match_pattern(&rtd, 0, None).is_none());

    arena.downref(Some(hit));
    arena.downref(Some(miss));
    assert!(arena.leak_report().is_clean());
  }

  #[test]
  fn test_construct_uses_bindings () {
    let rtd = pattern_rtd();
    let mut arena = Arena::default();

    let bound = arena.construct_token(&rtd, WORD, b"w", None).unwrap();
    let built = arena.construct_pattern(&rtd, 0, &[Some(bound)]).unwrap().unwrap();

    assert_eq!(arena.trees[bound].refs, 2);
    assert_eq!(arena.get_rhs_el(&rtd, built, 1), Some(bound));
    assert_eq!(arena.tree_data(arena.get_rhs_el(&rtd, built, 0).unwrap()), b"x");

    let bindings = arena.match_pattern(&rtd, 0, Some(built)).unwrap();
    assert_eq!(bindings, vec![bound]);

    arena.downref(Some(built));
    arena.downref(Some(bound));
    assert!(arena.leak_report().is_clean());
  }
}
