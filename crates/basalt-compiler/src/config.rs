// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Compiler options.

use bitflags::bitflags;

use crate::compiler::code::CodeFlags;

/// How hard the backend optimizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum OptimizeLevel {
    /// Only the passes needed for a correct artifact
    None,
    /// The CFG optimizer runs
    #[default]
    Basic,
    /// Also strips `assert` statements and docstrings
    Full,
}

impl OptimizeLevel {
    /// Parses a numeric level (`0`, `1` or `2`).
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(OptimizeLevel::None),
            1 => Some(OptimizeLevel::Basic),
            2 => Some(OptimizeLevel::Full),
            _ => None,
        }
    }

    /// The numeric level.
    pub fn level(self) -> u8 {
        match self {
            OptimizeLevel::None => 0,
            OptimizeLevel::Basic => 1,
            OptimizeLevel::Full => 2,
        }
    }

    /// Whether the CFG optimizer runs.
    pub fn optimizes_cfg(self) -> bool {
        self >= OptimizeLevel::Basic
    }

    /// Whether `assert` statements and docstrings are dropped.
    pub fn strips_asserts(self) -> bool {
        self >= OptimizeLevel::Full
    }
}

bitflags! {
    /// Language feature flags active for a compilation.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
    pub struct FeatureFlags: u32 {
        /// Annotations are never evaluated or stored
        const ANNOTATIONS = 1;
        /// `StopIteration` leaking out of a generator becomes `RuntimeError`
        const GENERATOR_STOP = 1 << 1;
    }
}

impl FeatureFlags {
    /// The code flags every unit records for these features.
    pub fn code_flags(self) -> CodeFlags {
        let mut flags = CodeFlags::empty();
        if self.contains(FeatureFlags::ANNOTATIONS) {
            flags |= CodeFlags::FUTURE_ANNOTATIONS;
        }
        if self.contains(FeatureFlags::GENERATOR_STOP) {
            flags |= CodeFlags::FUTURE_GENERATOR_STOP;
        }
        flags
    }
}

/// Options for one compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOptions {
    /// Optimization level
    pub optimize: OptimizeLevel,
    /// Active feature flags
    pub flags: FeatureFlags,
    /// Escalate warnings to errors
    pub warnings_as_errors: bool,
    /// File name reported in diagnostics and stored in code objects
    pub filename: String,
    /// Largest exit block copied by tail inlining
    pub max_inline_size: usize,
    /// Tail-inlining sweeps per optimizer iteration
    pub max_inline_passes: usize,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            optimize: OptimizeLevel::default(),
            flags: FeatureFlags::empty(),
            warnings_as_errors: false,
            filename: "<unknown>".to_string(),
            max_inline_size: 4,
            max_inline_passes: 2,
        }
    }
}

impl CompileOptions {
    /// Creates the default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the optimization level.
    pub fn with_optimize(mut self, optimize: OptimizeLevel) -> Self {
        self.optimize = optimize;
        self
    }

    /// Sets the feature flags.
    pub fn with_flags(mut self, flags: FeatureFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Escalates warnings to errors.
    pub fn with_warnings_as_errors(mut self, enabled: bool) -> Self {
        self.warnings_as_errors = enabled;
        self
    }

    /// Sets the file name.
    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = filename.into();
        self
    }

    /// Sets the tail-inlining bounds.
    pub fn with_inline_limits(mut self, max_size: usize, max_passes: usize) -> Self {
        self.max_inline_size = max_size;
        self.max_inline_passes = max_passes;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = CompileOptions::default();
        assert_eq!(options.optimize, OptimizeLevel::Basic);
        assert_eq!(options.max_inline_size, 4);
        assert_eq!(options.max_inline_passes, 2);
        assert!(!options.warnings_as_errors);

        let tuned = options.with_inline_limits(0, 1);
        assert_eq!(tuned.max_inline_size, 0);
        assert_eq!(tuned.max_inline_passes, 1);
    }

    #[test]
    fn test_levels() {
        assert_eq!(OptimizeLevel::from_level(2), Some(OptimizeLevel::Full));
        assert_eq!(OptimizeLevel::from_level(3), None);
        assert!(!OptimizeLevel::None.optimizes_cfg());
        assert!(OptimizeLevel::Full.strips_asserts());
        assert!(!OptimizeLevel::Basic.strips_asserts());
    }

    #[test]
    fn test_feature_code_flags() {
        let flags = FeatureFlags::ANNOTATIONS | FeatureFlags::GENERATOR_STOP;
        assert_eq!(
            flags.code_flags(),
            CodeFlags::FUTURE_ANNOTATIONS | CodeFlags::FUTURE_GENERATOR_STOP
        );
    }
}
