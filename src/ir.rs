//! The view of a function's instructions that the planner works on.
//!
//! A host IR framework (see the `llvm` module for the llvm-ir one) lowers each
//! of its instructions into an [`IrInstruction`], in program order, and the
//! planner never looks at the host's own data structures. `V` is the host's
//! handle for a value; it is what the injector eventually passes to the
//! trace entry point.

use std::fmt::Debug;
use std::hash::Hash;

/// The only distinctions between value types that matter for recording
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum ValueClass {
    /// No value (e.g., the type of a `ret void`)
    Void,
    /// An integer of any width, recorded with `%u`
    Integer,
    /// A pointer, recorded with `%p`
    Pointer,
    /// Anything else (floats, aggregates, vectors, ...). Cannot be recorded.
    Unsupported,
}

impl ValueClass {
    /// The format marker used for a value of this class, or `None` if values
    /// of this class can't be recorded
    pub fn format_marker(self) -> Option<&'static str> {
        match self {
            ValueClass::Void => Some(""),
            ValueClass::Integer => Some("%u"),
            ValueClass::Pointer => Some("%p"),
            ValueClass::Unsupported => None,
        }
    }
}

/// One value defined or used by an instruction
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct IrValue<V> {
    /// The host's handle for the value. Two `IrValue`s with equal handles are
    /// the same value.
    pub handle: V,
    /// Source-level name, if the value has one
    pub name: Option<String>,
    pub class: ValueClass,
}

impl<V> IrValue<V> {
    pub fn new(handle: V, name: Option<String>, class: ValueClass) -> Self {
        Self { handle, name, class }
    }

    /// An unnamed value
    pub fn unnamed(handle: V, class: ValueClass) -> Self {
        Self::new(handle, None, class)
    }

    /// A value with a source-level name
    pub fn named(handle: V, name: impl Into<String>, class: ValueClass) -> Self {
        Self::new(handle, Some(name.into()), class)
    }
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum InstKind {
    Return,
    Call,
    Other,
}

/// One instruction, as seen by the planner
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct IrInstruction<V> {
    pub kind: InstKind,
    /// The value the instruction defines, if it has a capturable result
    pub def: Option<IrValue<V>>,
    /// The values the instruction uses, in operand order.
    /// For a call these are the arguments, so use `i` is argument `i + 1`.
    pub uses: Vec<IrValue<V>>,
}

impl<V> IrInstruction<V> {
    pub fn new(kind: InstKind, def: Option<IrValue<V>>, uses: Vec<IrValue<V>>) -> Self {
        Self { kind, def, uses }
    }

    /// An instruction which isn't a call or a return
    pub fn other(def: Option<IrValue<V>>, uses: Vec<IrValue<V>>) -> Self {
        Self::new(InstKind::Other, def, uses)
    }

    pub fn call(def: Option<IrValue<V>>, args: Vec<IrValue<V>>) -> Self {
        Self::new(InstKind::Call, def, args)
    }

    pub fn ret(value: Option<IrValue<V>>) -> Self {
        Self::new(InstKind::Return, None, value.into_iter().collect())
    }

    pub fn is_return(&self) -> bool {
        self.kind == InstKind::Return
    }
}

/// Bounds every value handle must satisfy
pub trait ValueHandle: Clone + Eq + Hash + Debug {}

impl<T: Clone + Eq + Hash + Debug> ValueHandle for T {}
