// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

/// Quotes `p` as a single POSIX shell word. Everything inside single quotes is literal,
/// so the only character needing care is the quote itself.
pub fn sh_escape(p: &str) -> String {
    let mut out = String::with_capacity(p.len() + 2);
    out.push('\'');
    out.push_str(&p.replace('\'', r"'\''"));
    out.push('\'');
    out
}
