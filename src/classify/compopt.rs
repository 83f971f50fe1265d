// SPDX-License-Identifier: GPL-3.0-or-later

//! The compiler option table.
//!
//! Each recognized option carries a set of traits describing how it consumes
//! arguments and how it influences compilation output. The classifier and
//! the hashing pipeline both consult this table: whether an option takes a
//! separate or glued argument, whether it only affects preprocessing (and so
//! can be dropped from the preprocessor-mode hash), and whether its presence
//! makes the invocation uncacheable.

use std::sync::LazyLock;

/// Behavior traits of a compiler option.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptTraits(u32);

impl OptTraits {
    /// Consumes the following argument.
    pub const TAKES_ARG: OptTraits = OptTraits(1 << 0);
    /// The argument may also be glued to the option (`-Ifoo`).
    pub const TAKES_CONCAT_ARG: OptTraits = OptTraits(1 << 1);
    /// The argument is a path, subject to base directory rewriting.
    pub const TAKES_PATH: OptTraits = OptTraits(1 << 2);
    /// Affects preprocessor output only; dropped from the preprocessor-mode
    /// hash since any effect already shows up in the preprocessed text.
    pub const AFFECTS_CPP: OptTraits = OptTraits(1 << 3);
    /// Makes the invocation impossible to cache.
    pub const TOO_HARD: OptTraits = OptTraits(1 << 4);
    /// Makes only direct mode unreliable.
    pub const TOO_HARD_DIRECT: OptTraits = OptTraits(1 << 5);

    pub const fn union(self, other: OptTraits) -> OptTraits {
        OptTraits(self.0 | other.0)
    }

    pub fn contains(self, other: OptTraits) -> bool {
        self.0 & other.0 == other.0
    }
}

/// One entry in the option table.
#[derive(Debug, Clone, Copy)]
pub struct OptRule {
    pub name: &'static str,
    pub traits: OptTraits,
}

impl OptRule {
    const fn new(name: &'static str, traits: OptTraits) -> Self {
        OptRule { name, traits }
    }
}

const TAKES_ARG: OptTraits = OptTraits::TAKES_ARG;
const TAKES_CONCAT_ARG: OptTraits = OptTraits::TAKES_CONCAT_ARG;
const TAKES_PATH: OptTraits = OptTraits::TAKES_PATH;
const AFFECTS_CPP: OptTraits = OptTraits::AFFECTS_CPP;
const TOO_HARD: OptTraits = OptTraits::TOO_HARD;
const TOO_HARD_DIRECT: OptTraits = OptTraits::TOO_HARD_DIRECT;

/// Option table, sorted by name length descending so that the longest
/// matching entry wins for glued forms.
///
/// https://gcc.gnu.org/onlinedocs/gcc/Option-Summary.html
static RULES: LazyLock<Vec<OptRule>> = LazyLock::new(|| {
    let mut rules = vec![
        OptRule::new("--param", TAKES_ARG),
        OptRule::new("--save-temps", TOO_HARD),
        OptRule::new("--serialize-diagnostics", TAKES_ARG.union(TAKES_PATH)),
        OptRule::new("-A", TAKES_ARG.union(TAKES_CONCAT_ARG).union(AFFECTS_CPP)),
        OptRule::new(
            "-B",
            TAKES_ARG.union(TAKES_CONCAT_ARG).union(TAKES_PATH),
        ),
        OptRule::new(
            "-D",
            TAKES_ARG.union(TAKES_CONCAT_ARG).union(AFFECTS_CPP),
        ),
        OptRule::new("-E", TOO_HARD),
        OptRule::new(
            "-F",
            TAKES_ARG
                .union(TAKES_CONCAT_ARG)
                .union(TAKES_PATH)
                .union(AFFECTS_CPP),
        ),
        OptRule::new("-G", TAKES_ARG),
        OptRule::new(
            "-I",
            TAKES_ARG
                .union(TAKES_CONCAT_ARG)
                .union(TAKES_PATH)
                .union(AFFECTS_CPP),
        ),
        OptRule::new("-L", TAKES_ARG.union(TAKES_CONCAT_ARG)),
        OptRule::new("-M", TOO_HARD),
        OptRule::new("-MF", TAKES_ARG.union(TAKES_CONCAT_ARG)),
        OptRule::new("-MM", TOO_HARD),
        OptRule::new("-MQ", TAKES_ARG.union(TAKES_CONCAT_ARG)),
        OptRule::new("-MT", TAKES_ARG.union(TAKES_CONCAT_ARG)),
        OptRule::new("-P", TOO_HARD),
        OptRule::new(
            "-U",
            TAKES_ARG.union(TAKES_CONCAT_ARG).union(AFFECTS_CPP),
        ),
        OptRule::new("-V", TAKES_ARG),
        OptRule::new("-Xassembler", TAKES_ARG),
        OptRule::new("-Xclang", TAKES_ARG),
        OptRule::new("-Xlinker", TAKES_ARG),
        OptRule::new(
            "-Xpreprocessor",
            TAKES_ARG.union(AFFECTS_CPP).union(TOO_HARD_DIRECT),
        ),
        OptRule::new("-arch", TAKES_ARG),
        OptRule::new("-aux-info", TAKES_ARG),
        OptRule::new("-b", TAKES_ARG),
        OptRule::new("-ccbin", TAKES_ARG.union(TAKES_PATH)),
        OptRule::new("--compiler-bindir", TAKES_ARG.union(TAKES_PATH)),
        OptRule::new("-idirafter", TAKES_ARG.union(TAKES_PATH).union(AFFECTS_CPP)),
        OptRule::new("-iframework", TAKES_ARG.union(TAKES_PATH).union(AFFECTS_CPP)),
        OptRule::new("-imacros", TAKES_ARG.union(TAKES_PATH).union(AFFECTS_CPP)),
        OptRule::new("-imultilib", TAKES_ARG.union(TAKES_PATH).union(AFFECTS_CPP)),
        OptRule::new("-include", TAKES_ARG.union(TAKES_PATH).union(AFFECTS_CPP)),
        OptRule::new("-include-pch", TAKES_ARG.union(TAKES_PATH).union(AFFECTS_CPP)),
        OptRule::new("-install_name", TAKES_ARG),
        OptRule::new("-iprefix", TAKES_ARG.union(TAKES_PATH).union(AFFECTS_CPP)),
        OptRule::new("-iquote", TAKES_ARG.union(TAKES_PATH).union(AFFECTS_CPP)),
        OptRule::new("-isysroot", TAKES_ARG.union(TAKES_PATH).union(AFFECTS_CPP)),
        OptRule::new("-isystem", TAKES_ARG.union(TAKES_PATH).union(AFFECTS_CPP)),
        OptRule::new("-iwithprefix", TAKES_ARG.union(TAKES_PATH).union(AFFECTS_CPP)),
        OptRule::new(
            "-iwithprefixbefore",
            TAKES_ARG.union(TAKES_PATH).union(AFFECTS_CPP),
        ),
        OptRule::new("-nostdinc", AFFECTS_CPP),
        OptRule::new("-nostdinc++", AFFECTS_CPP),
        OptRule::new("-remap", AFFECTS_CPP),
        OptRule::new("--sysroot", TAKES_ARG.union(TAKES_PATH)),
        OptRule::new("-stdlib", TAKES_CONCAT_ARG.union(AFFECTS_CPP)),
        OptRule::new("-trigraphs", AFFECTS_CPP),
        OptRule::new("-u", TAKES_ARG.union(TAKES_CONCAT_ARG)),
        OptRule::new("-z", TAKES_ARG),
    ];
    rules.sort_by(|a, b| b.name.len().cmp(&a.name.len()));
    rules
});

/// Exact lookup of an option.
pub fn lookup(argument: &str) -> Option<&'static OptRule> {
    // Everything up to a '=' counts as the option name.
    let name = argument.split('=').next().unwrap_or(argument);
    RULES.iter().find(|rule| rule.name == name)
}

/// Lookup for a glued form like `-DNAME` or `-Ipath`. The longest matching
/// entry that accepts concatenated arguments wins.
pub fn lookup_glued(argument: &str) -> Option<&'static OptRule> {
    RULES.iter().find(|rule| {
        rule.traits.contains(OptTraits::TAKES_CONCAT_ARG)
            && argument.len() > rule.name.len()
            && argument.starts_with(rule.name)
    })
}

pub fn takes_arg(argument: &str) -> bool {
    lookup(argument).is_some_and(|rule| rule.traits.contains(OptTraits::TAKES_ARG))
}

pub fn affects_cpp(argument: &str) -> bool {
    lookup(argument).is_some_and(|rule| rule.traits.contains(OptTraits::AFFECTS_CPP))
}

/// Whether a glued-form argument only affects preprocessing.
pub fn affects_cpp_glued(argument: &str) -> bool {
    lookup_glued(argument).is_some_and(|rule| rule.traits.contains(OptTraits::AFFECTS_CPP))
}

pub fn too_hard(argument: &str) -> bool {
    lookup(argument).is_some_and(|rule| rule.traits.contains(OptTraits::TOO_HARD))
}

pub fn too_hard_direct(argument: &str) -> bool {
    lookup(argument).is_some_and(|rule| rule.traits.contains(OptTraits::TOO_HARD_DIRECT))
}
