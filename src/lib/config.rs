//! Runtime knobs for a Program

/// Runtime configuration for a Program
///
/// The defaults match what a compiled grammar expects; hosts mostly
/// touch `pool_limit` to bound memory and `report_leaks` in tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
  /// Number of slots in each operand stack segment
  pub stack_segment_slots: usize,
  /// Maximum number of live objects in any single arena pool, if any
  pub pool_limit: Option<usize>,
  /// Whether grammar elements with attached frames suspend the parser
  /// to run generation, pre-eof and reduction actions
  pub ctx_dep_parsing: bool,
  /// Whether `delete_program` emits a warning per leaking pool
  pub report_leaks: bool,
}

impl Config {
  /// The default number of slots in a stack segment
  pub const DEFAULT_SEGMENT_SLOTS: usize = 8192;

  /// Create a new Config with default values
  pub fn new () -> Self {
    Self {
      stack_segment_slots: Self::DEFAULT_SEGMENT_SLOTS,
      pool_limit: None,
      ctx_dep_parsing: true,
      report_leaks: cfg!(debug_assertions),
    }
  }

  /// Set the number of slots in each operand stack segment
  pub fn with_stack_segment_slots (mut self, slots: usize) -> Self {
    self.stack_segment_slots = slots.max(1);
    self
  }

  /// Bound the number of live objects in each arena pool
  pub fn with_pool_limit (mut self, limit: usize) -> Self {
    self.pool_limit = Some(limit);
    self
  }

  /// Enable or disable suspension for context dependent actions
  pub fn with_ctx_dep_parsing (mut self, enabled: bool) -> Self {
    self.ctx_dep_parsing = enabled;
    self
  }

  /// Enable or disable leak warnings at teardown
  pub fn with_report_leaks (mut self, enabled: bool) -> Self {
    self.report_leaks = enabled;
    self
  }
}

impl Default for Config { fn default () -> Self { Self::new() } }
