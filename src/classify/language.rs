// SPDX-License-Identifier: GPL-3.0-or-later

//! Source language detection.
//!
//! The language decides whether an invocation is cacheable at all, which
//! extension the preprocessed output gets, and whether the input is already
//! preprocessed so the preprocessor stage can be skipped.

/// Map a file extension to the language the compiler would infer.
pub fn language_for_extension(extension: &str) -> Option<&'static str> {
    let language = match extension {
        "c" => "c",
        "C" | "cc" | "CC" | "cp" | "CP" | "cxx" | "CXX" | "cpp" | "CPP" | "c++" | "C++" => "c++",
        "m" => "objective-c",
        "M" | "mm" => "objective-c++",
        "cu" => "cu",
        "i" => "cpp-output",
        "ii" => "c++-cpp-output",
        "mi" => "objective-c-cpp-output",
        "mii" => "objective-c++-cpp-output",
        "h" | "H" | "hp" | "hxx" | "hpp" | "HPP" | "h++" | "H++" | "hh" => "c-header",
        "tcc" | "hs" => "c++-header",
        "s" | "S" => "assembler",
        _ => return None,
    };
    Some(language)
}

/// The already-preprocessed form of a language, or the language itself if it
/// is one.
pub fn preprocessed_language(language: &str) -> Option<&'static str> {
    match language {
        "c" | "cpp-output" => Some("cpp-output"),
        "c++" | "c++-cpp-output" => Some("c++-cpp-output"),
        "objective-c" | "objective-c-cpp-output" => Some("objective-c-cpp-output"),
        "objective-c++" | "objective-c++-cpp-output" => Some("objective-c++-cpp-output"),
        "cu" => Some("cpp-output"),
        _ => None,
    }
}

/// Whether the input already is preprocessor output.
pub fn language_is_preprocessed(language: &str) -> bool {
    language.ends_with("-cpp-output") || language == "cpp-output"
}

/// Whether the cache knows how to handle this language at all.
pub fn language_is_supported(language: &str) -> bool {
    preprocessed_language(language).is_some() || language_is_header(language)
}

/// Header languages indicate precompiled header generation.
pub fn language_is_header(language: &str) -> bool {
    language.ends_with("-header")
}

/// The file extension used for preprocessed output of a language.
pub fn extension_for_preprocessed(language: &str) -> &'static str {
    match preprocessed_language(language) {
        Some("c++-cpp-output") => "ii",
        Some("objective-c-cpp-output") => "mi",
        Some("objective-c++-cpp-output") => "mii",
        _ => "i",
    }
}
