// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Instruction set definitions.
//!
//! Two opcode families exist. [`Opcode`] is the closed set of real
//! instructions that can appear in an assembled [`CodeObject`]. [`PseudoOp`]
//! holds the optimizer-only operations (abstract jumps, handler push/pop
//! markers, closure loads) that the assembler lowers before emitting bytes.
//! The control-flow graph stores [`AnyOp`], which is either of the two.
//!
//! [`CodeObject`]: crate::compiler::code::CodeObject

use std::fmt;

use crate::error::{CompileError, Result};

/// Opcodes at or above this value carry a meaningful operand.
pub const HAVE_ARGUMENT: u8 = 90;

/// First numeric code assigned to pseudo operations in flattened listings.
pub const PSEUDO_BASE: u16 = 256;

macro_rules! define_opcodes {
    ($( $(#[$attr:meta])* $variant:ident = $value:literal => $name:literal, )*) => {
        /// A real virtual-machine instruction.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u8)]
        pub enum Opcode {
            $( $(#[$attr])* $variant = $value, )*
        }

        impl Opcode {
            /// Every real opcode, in numeric order.
            pub const ALL: &'static [Opcode] = &[$(Opcode::$variant,)*];

            /// The canonical upper-case mnemonic.
            pub fn name(self) -> &'static str {
                match self {
                    $(Opcode::$variant => $name,)*
                }
            }

            /// Decodes an opcode byte.
            pub fn from_byte(byte: u8) -> Option<Opcode> {
                match byte {
                    $($value => Some(Opcode::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

define_opcodes! {
    // Stack manipulation
    /// Discard the top of stack
    PopTop = 1 => "POP_TOP",
    /// Push the null sentinel used by the calling convention
    PushNull = 2 => "PUSH_NULL",
    /// Do nothing (carries a line number)
    Nop = 9 => "NOP",

    // Unary operations
    /// `+x`
    UnaryPositive = 10 => "UNARY_POSITIVE",
    /// `-x`
    UnaryNegative = 11 => "UNARY_NEGATIVE",
    /// `not x`
    UnaryNot = 12 => "UNARY_NOT",
    /// `~x`
    UnaryInvert = 15 => "UNARY_INVERT",

    // Subscripts
    /// `a[b]`
    BinarySubscr = 25 => "BINARY_SUBSCR",
    /// `a[b:c]`
    BinarySlice = 26 => "BINARY_SLICE",
    /// `a[b:c] = v`
    StoreSlice = 27 => "STORE_SLICE",

    // Pattern matching
    /// Push `len(tos)`
    GetLen = 30 => "GET_LEN",
    /// Push whether tos is a mapping
    MatchMapping = 31 => "MATCH_MAPPING",
    /// Push whether tos is a sequence
    MatchSequence = 32 => "MATCH_SEQUENCE",
    /// Push the values for a tuple of keys, or None
    MatchKeys = 33 => "MATCH_KEYS",

    // Exception handling
    /// Save the current exception and make tos current
    PushExcInfo = 35 => "PUSH_EXC_INFO",
    /// Test the exception below tos against the type at tos
    CheckExcMatch = 36 => "CHECK_EXC_MATCH",
    /// Call `__exit__` with the live exception
    WithExceptStart = 49 => "WITH_EXCEPT_START",

    // Asynchronous protocol
    /// `aiter(tos)`
    GetAiter = 50 => "GET_AITER",
    /// Push `anext(tos)` awaitable
    GetAnext = 51 => "GET_ANEXT",
    /// Resolve `__aenter__`/`__aexit__`
    BeforeAsyncWith = 52 => "BEFORE_ASYNC_WITH",
    /// Resolve `__enter__`/`__exit__`
    BeforeWith = 53 => "BEFORE_WITH",
    /// Terminate an `async for` loop on `StopAsyncIteration`
    EndAsyncFor = 54 => "END_ASYNC_FOR",
    /// Handle an exception thrown into a delegated generator
    CleanupThrow = 55 => "CLEANUP_THROW",
    /// Drop the receiver below the send result
    EndSend = 56 => "END_SEND",

    // Stores through subscripts
    /// `a[b] = v`
    StoreSubscr = 60 => "STORE_SUBSCR",
    /// `del a[b]`
    DeleteSubscr = 61 => "DELETE_SUBSCR",

    // Iteration
    /// `iter(tos)`
    GetIter = 68 => "GET_ITER",
    /// Iterator for `yield from`
    GetYieldFromIter = 69 => "GET_YIELD_FROM_ITER",

    // Miscellaneous
    /// Push `builtins.__build_class__`
    LoadBuildClass = 71 => "LOAD_BUILD_CLASS",
    /// Push `AssertionError`
    LoadAssertionError = 74 => "LOAD_ASSERTION_ERROR",
    /// Create a generator object from the current frame
    ReturnGenerator = 75 => "RETURN_GENERATOR",
    /// Return tos to the caller
    ReturnValue = 83 => "RETURN_VALUE",
    /// Create `__annotations__` if missing
    SetupAnnotations = 85 => "SETUP_ANNOTATIONS",
    /// Push the locals mapping
    LoadLocals = 87 => "LOAD_LOCALS",
    /// Restore the previous exception state
    PopExcept = 89 => "POP_EXCEPT",

    // Name operations (arguments index `names`)
    /// Store tos into a name
    StoreName = 90 => "STORE_NAME",
    /// Delete a name
    DeleteName = 91 => "DELETE_NAME",
    /// Unpack tos into `arg` values
    UnpackSequence = 92 => "UNPACK_SEQUENCE",
    /// Advance the iterator at tos, jumping forward when exhausted
    ForIter = 93 => "FOR_ITER",
    /// Unpack with a starred target (`low byte` before, `high byte` after)
    UnpackEx = 94 => "UNPACK_EX",
    /// `tos.name = tos1`
    StoreAttr = 95 => "STORE_ATTR",
    /// `del tos.name`
    DeleteAttr = 96 => "DELETE_ATTR",
    /// Store a global
    StoreGlobal = 97 => "STORE_GLOBAL",
    /// Delete a global
    DeleteGlobal = 98 => "DELETE_GLOBAL",
    /// Swap tos with the `arg`-th item (1-based)
    Swap = 99 => "SWAP",
    /// Push `consts[arg]`
    LoadConst = 100 => "LOAD_CONST",
    /// Load a name through the locals/globals/builtins chain
    LoadName = 101 => "LOAD_NAME",
    /// Build a tuple from `arg` items
    BuildTuple = 102 => "BUILD_TUPLE",
    /// Build a list from `arg` items
    BuildList = 103 => "BUILD_LIST",
    /// Build a set from `arg` items
    BuildSet = 104 => "BUILD_SET",
    /// Build a dict from `arg` key/value pairs
    BuildMap = 105 => "BUILD_MAP",
    /// Load an attribute; low bit requests a method load
    LoadAttr = 106 => "LOAD_ATTR",
    /// Rich comparison
    CompareOp = 107 => "COMPARE_OP",
    /// Import a module
    ImportName = 108 => "IMPORT_NAME",
    /// Load an attribute from a module
    ImportFrom = 109 => "IMPORT_FROM",

    // Jumps (arguments are relative deltas in code units)
    /// Unconditional forward jump
    JumpForward = 110 => "JUMP_FORWARD",
    /// Jump forward keeping tos if false, else pop
    JumpIfFalseOrPop = 111 => "JUMP_IF_FALSE_OR_POP",
    /// Jump forward keeping tos if true, else pop
    JumpIfTrueOrPop = 112 => "JUMP_IF_TRUE_OR_POP",
    /// Pop tos, jump forward if false
    PopJumpForwardIfFalse = 114 => "POP_JUMP_FORWARD_IF_FALSE",
    /// Pop tos, jump forward if true
    PopJumpForwardIfTrue = 115 => "POP_JUMP_FORWARD_IF_TRUE",
    /// Load a global; low bit also pushes null
    LoadGlobal = 116 => "LOAD_GLOBAL",
    /// `is` / `is not`
    IsOp = 117 => "IS_OP",
    /// `in` / `not in`
    ContainsOp = 118 => "CONTAINS_OP",
    /// Re-raise tos; a nonzero argument also restores `f_lasti`
    Reraise = 119 => "RERAISE",
    /// Push a copy of the `arg`-th item (1-based)
    Copy = 120 => "COPY",
    /// Return `consts[arg]`
    ReturnConst = 121 => "RETURN_CONST",
    /// Binary or in-place operator
    BinaryOp = 122 => "BINARY_OP",
    /// Send a value into a sub-iterator, jumping forward when it returns
    Send = 123 => "SEND",

    // Fast locals
    /// Push a local known to be bound
    LoadFast = 124 => "LOAD_FAST",
    /// Store a local
    StoreFast = 125 => "STORE_FAST",
    /// Delete a local
    DeleteFast = 126 => "DELETE_FAST",
    /// Push a local, raising if unbound
    LoadFastCheck = 127 => "LOAD_FAST_CHECK",
    /// Pop tos, jump forward if not None
    PopJumpForwardIfNotNone = 128 => "POP_JUMP_FORWARD_IF_NOT_NONE",
    /// Pop tos, jump forward if None
    PopJumpForwardIfNone = 129 => "POP_JUMP_FORWARD_IF_NONE",
    /// `raise` with 0, 1 or 2 operands
    RaiseVarargs = 130 => "RAISE_VARARGS",
    /// Make tos awaitable
    GetAwaitable = 131 => "GET_AWAITABLE",
    /// Build a function from a code object and flagged extras
    MakeFunction = 132 => "MAKE_FUNCTION",
    /// Build a slice from 2 or 3 values
    BuildSlice = 133 => "BUILD_SLICE",
    /// Unconditional backward jump without an interrupt check
    JumpBackwardNoInterrupt = 134 => "JUMP_BACKWARD_NO_INTERRUPT",

    // Cells and free variables (arguments index local-plus slots)
    /// Create a cell in a slot
    MakeCell = 135 => "MAKE_CELL",
    /// Push the contents of a cell
    LoadDeref = 137 => "LOAD_DEREF",
    /// Store into a cell
    StoreDeref = 138 => "STORE_DEREF",
    /// Empty a cell
    DeleteDeref = 139 => "DELETE_DEREF",
    /// Unconditional backward jump
    JumpBackward = 140 => "JUMP_BACKWARD",
    /// Call with an argument tuple and optional keyword dict
    CallFunctionEx = 142 => "CALL_FUNCTION_EX",
    /// Prefix supplying the high bits of the next operand
    ExtendedArg = 144 => "EXTENDED_ARG",

    // Comprehension helpers
    /// `list.append` into the `arg`-th item
    ListAppend = 145 => "LIST_APPEND",
    /// `set.add` into the `arg`-th item
    SetAdd = 146 => "SET_ADD",
    /// `dict[k] = v` into the `arg`-th item
    MapAdd = 147 => "MAP_ADD",
    /// Load a free variable from a class body, locals first
    LoadClassderef = 148 => "LOAD_CLASSDEREF",
    /// Copy the closure cells into the frame
    CopyFreeVars = 149 => "COPY_FREE_VARS",
    /// Suspend, yielding tos
    YieldValue = 150 => "YIELD_VALUE",
    /// Resume point marker
    Resume = 151 => "RESUME",
    /// Match a class pattern with `arg` positional sub-patterns
    MatchClass = 152 => "MATCH_CLASS",

    // String building
    /// Format a value with an optional conversion and spec
    FormatValue = 155 => "FORMAT_VALUE",
    /// Build a dict from values and a constant key tuple
    BuildConstKeyMap = 156 => "BUILD_CONST_KEY_MAP",
    /// Concatenate `arg` strings
    BuildString = 157 => "BUILD_STRING",

    // Container updates
    /// `list.extend` into the `arg`-th item
    ListExtend = 162 => "LIST_EXTEND",
    /// `set.update` into the `arg`-th item
    SetUpdate = 163 => "SET_UPDATE",
    /// Merge a mapping for `**` call arguments
    DictMerge = 164 => "DICT_MERGE",
    /// `dict.update` into the `arg`-th item
    DictUpdate = 165 => "DICT_UPDATE",

    // Calls
    /// Call with `arg` positional arguments
    Call = 171 => "CALL",
    /// Record the keyword names tuple for the next call
    KwNames = 172 => "KW_NAMES",
    /// Call a one-operand intrinsic
    CallIntrinsic1 = 173 => "CALL_INTRINSIC_1",
    /// Call a two-operand intrinsic
    CallIntrinsic2 = 174 => "CALL_INTRINSIC_2",

    // Backward conditional jumps
    /// Pop tos, jump backward if false
    PopJumpBackwardIfFalse = 175 => "POP_JUMP_BACKWARD_IF_FALSE",
    /// Pop tos, jump backward if true
    PopJumpBackwardIfTrue = 176 => "POP_JUMP_BACKWARD_IF_TRUE",
    /// Pop tos, jump backward if None
    PopJumpBackwardIfNone = 177 => "POP_JUMP_BACKWARD_IF_NONE",
    /// Pop tos, jump backward if not None
    PopJumpBackwardIfNotNone = 178 => "POP_JUMP_BACKWARD_IF_NOT_NONE",
}

/// Direction of a relative jump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpDirection {
    /// Target lies after the instruction
    Forward,
    /// Target lies at or before the instruction
    Backward,
}

impl Opcode {
    /// Whether the operand is meaningful.
    pub fn has_arg(self) -> bool {
        (self as u8) >= HAVE_ARGUMENT
    }

    /// Direction of a relative jump, or `None` for non-jumps.
    pub fn jump_direction(self) -> Option<JumpDirection> {
        use Opcode::*;
        match self {
            JumpForward | JumpIfFalseOrPop | JumpIfTrueOrPop | PopJumpForwardIfFalse
            | PopJumpForwardIfTrue | PopJumpForwardIfNone | PopJumpForwardIfNotNone | ForIter
            | Send => Some(JumpDirection::Forward),
            JumpBackward | JumpBackwardNoInterrupt | PopJumpBackwardIfFalse
            | PopJumpBackwardIfTrue | PopJumpBackwardIfNone | PopJumpBackwardIfNotNone => {
                Some(JumpDirection::Backward)
            }
            _ => None,
        }
    }

    /// Whether execution never continues to the next instruction.
    pub fn is_scope_exit(self) -> bool {
        matches!(
            self,
            Opcode::ReturnValue | Opcode::ReturnConst | Opcode::RaiseVarargs | Opcode::Reraise
        )
    }

    /// Whether the opcode is an unconditional jump.
    pub fn is_unconditional_jump(self) -> bool {
        matches!(
            self,
            Opcode::JumpForward | Opcode::JumpBackward | Opcode::JumpBackwardNoInterrupt
        )
    }

    /// Whether the operand indexes the constant table.
    pub fn has_const(self) -> bool {
        matches!(self, Opcode::LoadConst | Opcode::ReturnConst | Opcode::KwNames)
    }

    /// Whether the operand indexes the name table.
    pub fn has_name(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            StoreName
                | DeleteName
                | StoreAttr
                | DeleteAttr
                | StoreGlobal
                | DeleteGlobal
                | LoadName
                | LoadAttr
                | ImportName
                | ImportFrom
                | LoadGlobal
        )
    }

    /// Whether the operand indexes the local-plus slots.
    pub fn has_local(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            LoadFast
                | StoreFast
                | DeleteFast
                | LoadFastCheck
                | MakeCell
                | LoadDeref
                | StoreDeref
                | DeleteDeref
                | LoadClassderef
        )
    }

    /// Net stack effect of the instruction.
    ///
    /// `jump` selects the branch-taken edge for opcodes that branch.
    pub fn stack_effect(self, arg: u32, jump: bool) -> Result<i32> {
        use Opcode::*;
        let arg = i32::try_from(arg)
            .map_err(|_| CompileError::internal(format!("operand {arg} out of range")))?;
        let effect = match self {
            Nop | ExtendedArg | Resume | ReturnGenerator | SetupAnnotations | UnaryPositive
            | UnaryNegative | UnaryNot | UnaryInvert | GetIter | GetYieldFromIter | GetAiter
            | CheckExcMatch | Swap | DeleteName | DeleteGlobal | DeleteFast | DeleteDeref
            | MakeCell | CopyFreeVars | YieldValue | KwNames | CallIntrinsic1 | GetAwaitable
            | ReturnConst => 0,
            JumpForward | JumpBackward | JumpBackwardNoInterrupt => 0,

            PopTop | ReturnValue | PopExcept | EndSend | CleanupThrow | StoreName
            | StoreGlobal | StoreFast | StoreDeref | DeleteAttr | BinarySubscr | CompareOp
            | IsOp | ContainsOp | BinaryOp | ImportName | Reraise | ListAppend | SetAdd
            | ListExtend | SetUpdate | DictMerge | DictUpdate | CallIntrinsic2 => -1,
            PopJumpForwardIfFalse | PopJumpForwardIfTrue | PopJumpForwardIfNone
            | PopJumpForwardIfNotNone | PopJumpBackwardIfFalse | PopJumpBackwardIfTrue
            | PopJumpBackwardIfNone | PopJumpBackwardIfNotNone => -1,

            PushNull | GetLen | MatchMapping | MatchSequence | MatchKeys | PushExcInfo
            | WithExceptStart | GetAnext | BeforeAsyncWith | BeforeWith | LoadBuildClass
            | LoadAssertionError | LoadLocals | LoadConst | LoadName | ImportFrom | Copy
            | LoadFast | LoadFastCheck | LoadDeref | LoadClassderef => 1,

            BinarySlice | StoreAttr | DeleteSubscr | EndAsyncFor | MapAdd | MatchClass => -2,
            StoreSubscr => -3,
            StoreSlice => -4,

            JumpIfFalseOrPop | JumpIfTrueOrPop => {
                if jump {
                    0
                } else {
                    -1
                }
            }
            ForIter => {
                if jump {
                    -1
                } else {
                    1
                }
            }
            Send => 0,

            UnpackSequence => arg - 1,
            UnpackEx => (arg & 0xff) + (arg >> 8),
            BuildTuple | BuildList | BuildSet | BuildString => 1 - arg,
            BuildMap => 1 - 2 * arg,
            BuildConstKeyMap => -arg,
            BuildSlice => {
                if arg != 2 && arg != 3 {
                    return Err(CompileError::internal(format!(
                        "BUILD_SLICE with {arg} operands"
                    )));
                }
                1 - arg
            }
            LoadAttr | LoadGlobal => {
                let base = if self == LoadGlobal { 1 } else { 0 };
                base + (arg & 1)
            }
            RaiseVarargs => {
                if arg > 2 {
                    return Err(CompileError::internal(format!(
                        "RAISE_VARARGS with {arg} operands"
                    )));
                }
                -arg
            }
            MakeFunction => -((arg & 0x0f).count_ones() as i32),
            FormatValue => {
                if arg & FORMAT_WITH_SPEC != 0 {
                    -1
                } else {
                    0
                }
            }
            Call => -arg - 1,
            CallFunctionEx => -2 - (arg & 1),
        };
        Ok(effect)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Optimizer-only operations. None of these survive assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PseudoOp {
    /// Unconditional jump, direction decided by the assembler
    Jump,
    /// Unconditional jump that skips the interrupt check
    JumpNoInterrupt,
    /// Pop tos, jump if false
    PopJumpIfFalse,
    /// Pop tos, jump if true
    PopJumpIfTrue,
    /// Pop tos, jump if None
    PopJumpIfNone,
    /// Pop tos, jump if not None
    PopJumpIfNotNone,
    /// Push an exception handler
    SetupFinally,
    /// Push a handler that also preserves `f_lasti`
    SetupCleanup,
    /// Push the handler of a `with` block
    SetupWith,
    /// Pop the innermost handler
    PopBlock,
    /// Push a cell object for closure construction
    LoadClosure,
}

impl PseudoOp {
    /// Every pseudo operation, in code order.
    pub const ALL: &'static [PseudoOp] = &[
        PseudoOp::Jump,
        PseudoOp::JumpNoInterrupt,
        PseudoOp::PopJumpIfFalse,
        PseudoOp::PopJumpIfTrue,
        PseudoOp::PopJumpIfNone,
        PseudoOp::PopJumpIfNotNone,
        PseudoOp::SetupFinally,
        PseudoOp::SetupCleanup,
        PseudoOp::SetupWith,
        PseudoOp::PopBlock,
        PseudoOp::LoadClosure,
    ];

    /// The canonical upper-case mnemonic.
    pub fn name(self) -> &'static str {
        match self {
            PseudoOp::Jump => "JUMP",
            PseudoOp::JumpNoInterrupt => "JUMP_NO_INTERRUPT",
            PseudoOp::PopJumpIfFalse => "POP_JUMP_IF_FALSE",
            PseudoOp::PopJumpIfTrue => "POP_JUMP_IF_TRUE",
            PseudoOp::PopJumpIfNone => "POP_JUMP_IF_NONE",
            PseudoOp::PopJumpIfNotNone => "POP_JUMP_IF_NOT_NONE",
            PseudoOp::SetupFinally => "SETUP_FINALLY",
            PseudoOp::SetupCleanup => "SETUP_CLEANUP",
            PseudoOp::SetupWith => "SETUP_WITH",
            PseudoOp::PopBlock => "POP_BLOCK",
            PseudoOp::LoadClosure => "LOAD_CLOSURE",
        }
    }

    fn index(self) -> u16 {
        PseudoOp::ALL.iter().position(|op| *op == self).unwrap_or(0) as u16
    }

    /// Stack effect; block pushes report the handler-entry effect on `jump`.
    pub fn stack_effect(self, jump: bool) -> i32 {
        match self {
            PseudoOp::Jump | PseudoOp::JumpNoInterrupt | PseudoOp::PopBlock => 0,
            PseudoOp::PopJumpIfFalse
            | PseudoOp::PopJumpIfTrue
            | PseudoOp::PopJumpIfNone
            | PseudoOp::PopJumpIfNotNone => -1,
            PseudoOp::SetupFinally | PseudoOp::SetupWith => {
                if jump {
                    1
                } else {
                    0
                }
            }
            PseudoOp::SetupCleanup => {
                if jump {
                    2
                } else {
                    0
                }
            }
            PseudoOp::LoadClosure => 1,
        }
    }
}

/// Either a real opcode or a pseudo operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnyOp {
    /// A real instruction
    Real(Opcode),
    /// An optimizer-only operation
    Pseudo(PseudoOp),
}

impl From<Opcode> for AnyOp {
    fn from(op: Opcode) -> Self {
        AnyOp::Real(op)
    }
}

impl From<PseudoOp> for AnyOp {
    fn from(op: PseudoOp) -> Self {
        AnyOp::Pseudo(op)
    }
}

impl AnyOp {
    /// The canonical mnemonic.
    pub fn name(self) -> &'static str {
        match self {
            AnyOp::Real(op) => op.name(),
            AnyOp::Pseudo(op) => op.name(),
        }
    }

    /// Looks an operation up by mnemonic.
    pub fn from_name(name: &str) -> Option<AnyOp> {
        Opcode::ALL
            .iter()
            .find(|op| op.name() == name)
            .map(|op| AnyOp::Real(*op))
            .or_else(|| {
                PseudoOp::ALL
                    .iter()
                    .find(|op| op.name() == name)
                    .map(|op| AnyOp::Pseudo(*op))
            })
    }

    /// Numeric code used by flattened listings.
    pub fn code(self) -> u16 {
        match self {
            AnyOp::Real(op) => op as u16,
            AnyOp::Pseudo(op) => PSEUDO_BASE + op.index(),
        }
    }

    /// Inverse of [`AnyOp::code`].
    pub fn from_code(code: u16) -> Option<AnyOp> {
        if code >= PSEUDO_BASE {
            PseudoOp::ALL
                .get(usize::from(code - PSEUDO_BASE))
                .map(|op| AnyOp::Pseudo(*op))
        } else {
            u8::try_from(code)
                .ok()
                .and_then(Opcode::from_byte)
                .map(AnyOp::Real)
        }
    }

    /// The real opcode, if this is one.
    pub fn real(self) -> Option<Opcode> {
        match self {
            AnyOp::Real(op) => Some(op),
            AnyOp::Pseudo(_) => None,
        }
    }

    /// Whether this is the given real opcode.
    pub fn is(self, op: Opcode) -> bool {
        self == AnyOp::Real(op)
    }

    /// Whether this is the given pseudo operation.
    pub fn is_pseudo(self, op: PseudoOp) -> bool {
        self == AnyOp::Pseudo(op)
    }

    /// Whether the operand is meaningful.
    pub fn has_arg(self) -> bool {
        match self {
            AnyOp::Real(op) => op.has_arg(),
            AnyOp::Pseudo(op) => op == PseudoOp::LoadClosure,
        }
    }

    /// Whether the instruction branches to a block.
    pub fn is_jump(self) -> bool {
        match self {
            AnyOp::Real(op) => op.jump_direction().is_some(),
            AnyOp::Pseudo(op) => !matches!(
                op,
                PseudoOp::SetupFinally
                    | PseudoOp::SetupCleanup
                    | PseudoOp::SetupWith
                    | PseudoOp::PopBlock
                    | PseudoOp::LoadClosure
            ),
        }
    }

    /// Whether the instruction pushes an exception handler.
    pub fn is_block_push(self) -> bool {
        matches!(
            self,
            AnyOp::Pseudo(PseudoOp::SetupFinally | PseudoOp::SetupCleanup | PseudoOp::SetupWith)
        )
    }

    /// Whether the instruction refers to a target block.
    pub fn has_target(self) -> bool {
        self.is_jump() || self.is_block_push()
    }

    /// Whether the instruction always transfers control elsewhere.
    pub fn is_unconditional_jump(self) -> bool {
        match self {
            AnyOp::Real(op) => op.is_unconditional_jump(),
            AnyOp::Pseudo(op) => matches!(op, PseudoOp::Jump | PseudoOp::JumpNoInterrupt),
        }
    }

    /// Whether the instruction leaves the scope.
    pub fn is_scope_exit(self) -> bool {
        self.real().is_some_and(Opcode::is_scope_exit)
    }

    /// Whether the instruction must end its basic block.
    pub fn is_terminator(self) -> bool {
        self.is_jump() || self.is_scope_exit()
    }

    /// Whether a block ending in this instruction can fall through.
    pub fn has_fallthrough(self) -> bool {
        !(self.is_unconditional_jump() || self.is_scope_exit())
    }

    /// Net stack effect; see [`Opcode::stack_effect`].
    pub fn stack_effect(self, arg: u32, jump: bool) -> Result<i32> {
        match self {
            AnyOp::Real(op) => op.stack_effect(arg, jump),
            AnyOp::Pseudo(op) => Ok(op.stack_effect(jump)),
        }
    }
}

impl fmt::Display for AnyOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// `FORMAT_VALUE` flag: a format spec is on the stack.
pub const FORMAT_WITH_SPEC: i32 = 0x04;

/// `MAKE_FUNCTION` flags.
pub mod make_function {
    /// Positional defaults tuple
    pub const DEFAULTS: u32 = 0x01;
    /// Keyword-only defaults dict
    pub const KW_DEFAULTS: u32 = 0x02;
    /// Annotations tuple
    pub const ANNOTATIONS: u32 = 0x04;
    /// Closure cells tuple
    pub const CLOSURE: u32 = 0x08;
}

/// Operands of `CALL_INTRINSIC_1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Intrinsic1 {
    /// `from module import *`
    ImportStar = 2,
    /// Convert a leaked `StopIteration` into `RuntimeError`
    StopIterationError = 3,
    /// Wrap a value yielded from an async generator
    AsyncGenWrap = 4,
    /// `tuple(list)`
    ListToTuple = 6,
}

/// Operands of `COMPARE_OP`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ComparisonOperator {
    /// `<`
    Less = 0,
    /// `<=`
    LessOrEqual = 1,
    /// `==`
    Equal = 2,
    /// `!=`
    NotEqual = 3,
    /// `>`
    Greater = 4,
    /// `>=`
    GreaterOrEqual = 5,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_bytes_round_trip() {
        for op in Opcode::ALL {
            assert_eq!(Opcode::from_byte(*op as u8), Some(*op));
        }
        assert_eq!(Opcode::from_byte(0), None);
    }

    #[test]
    fn test_names_are_unique() {
        let mut names: Vec<&str> = Opcode::ALL.iter().map(|op| op.name()).collect();
        names.extend(PseudoOp::ALL.iter().map(|op| op.name()));
        let total = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), total);
    }

    #[test]
    fn test_any_op_codes() {
        let op = AnyOp::Pseudo(PseudoOp::SetupCleanup);
        assert_eq!(AnyOp::from_code(op.code()), Some(op));
        assert_eq!(AnyOp::from_code(100), Some(AnyOp::Real(Opcode::LoadConst)));
        assert_eq!(AnyOp::from_name("POP_BLOCK"), Some(AnyOp::Pseudo(PseudoOp::PopBlock)));
    }

    #[test]
    fn test_classification() {
        assert!(AnyOp::Pseudo(PseudoOp::PopJumpIfFalse).is_terminator());
        assert!(AnyOp::Pseudo(PseudoOp::PopJumpIfFalse).has_fallthrough());
        assert!(!AnyOp::Pseudo(PseudoOp::Jump).has_fallthrough());
        assert!(AnyOp::Pseudo(PseudoOp::SetupWith).has_target());
        assert!(!AnyOp::Pseudo(PseudoOp::SetupWith).is_terminator());
        assert!(AnyOp::Real(Opcode::Reraise).is_scope_exit());
        assert!(!Opcode::PopTop.has_arg());
        assert!(Opcode::LoadConst.has_arg());
    }

    #[test]
    fn test_stack_effects() {
        assert_eq!(Opcode::BuildTuple.stack_effect(3, false).unwrap(), -2);
        assert_eq!(Opcode::UnpackEx.stack_effect(1 | (2 << 8), false).unwrap(), 3);
        assert_eq!(Opcode::ForIter.stack_effect(0, true).unwrap(), -1);
        assert_eq!(Opcode::Call.stack_effect(2, false).unwrap(), -3);
        assert_eq!(Opcode::LoadGlobal.stack_effect(1, false).unwrap(), 2);
        assert_eq!(PseudoOp::SetupCleanup.stack_effect(true), 2);
        assert!(Opcode::BuildSlice.stack_effect(4, false).is_err());
    }
}
