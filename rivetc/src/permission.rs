//! Capability-style permissions.
//!
//! Scripts start with no capabilities. `allow exec "git*"` statements (the
//! `Allow` opcode) and the `--allow-all` flag grant them; natives consult
//! the set before every sensitive operation. Targets are matched with `*`
//! globs.

use rivet_syntax::ast::PermKind;

#[derive(Debug, Clone)]
pub struct Permission {
    pub kind: PermKind,
    pub target: String,
}

#[derive(Debug, Default)]
pub struct PermissionSet {
    permissions: Vec<Permission>,
    pub allow_all: bool,
}

impl PermissionSet {
    pub fn new() -> PermissionSet {
        PermissionSet::default()
    }

    pub fn add(&mut self, kind: PermKind, target: &str) {
        self.permissions.push(Permission {
            kind,
            target: target.to_string(),
        });
    }

    pub fn check(&self, kind: PermKind, target: &str) -> bool {
        if self.allow_all {
            return true;
        }
        self.permissions
            .iter()
            .any(|perm| perm.kind == kind && glob_match(&perm.target, target))
    }
}

pub fn perm_kind_name(kind: PermKind) -> &'static str {
    match kind {
        PermKind::Exec => "exec",
        PermKind::Net => "net",
        PermKind::Read => "read",
        PermKind::Write => "write",
        PermKind::Env => "env",
    }
}

pub fn perm_kind_from_byte(byte: u8) -> PermKind {
    match byte {
        0 => PermKind::Exec,
        1 => PermKind::Net,
        2 => PermKind::Read,
        3 => PermKind::Write,
        _ => PermKind::Env,
    }
}

pub fn perm_kind_to_byte(kind: PermKind) -> u8 {
    match kind {
        PermKind::Exec => 0,
        PermKind::Net => 1,
        PermKind::Read => 2,
        PermKind::Write => 3,
        PermKind::Env => 4,
    }
}

/// `*` matches any run of characters (including empty).
fn glob_match(pattern: &str, text: &str) -> bool {
    glob_match_bytes(pattern.as_bytes(), text.as_bytes())
}

fn glob_match_bytes(pattern: &[u8], text: &[u8]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some(b'*') => {
            let rest = &pattern[1..];
            if rest.is_empty() {
                return true;
            }
            for start in 0..=text.len() {
                if glob_match_bytes(rest, &text[start..]) {
                    return true;
                }
            }
            false
        }
        Some(&c) => match text.first() {
            Some(&t) if t == c => glob_match_bytes(&pattern[1..], &text[1..]),
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match() {
        assert!(glob_match("git", "git"));
        assert!(!glob_match("git", "gi"));
        assert!(!glob_match("git", "gits"));
    }

    #[test]
    fn star_matches_any_run() {
        assert!(glob_match("git*", "git status"));
        assert!(glob_match("git*", "git"));
        assert!(glob_match("*.log", "build.log"));
        assert!(glob_match("/tmp/*", "/tmp/x/y"));
        assert!(!glob_match("/tmp/*", "/var/x"));
        assert!(glob_match("*", ""));
        assert!(glob_match("a*b*c", "aXXbYYc"));
        assert!(!glob_match("a*b*c", "aXXbYY"));
    }

    #[test]
    fn set_checks_kind_and_pattern() {
        let mut set = PermissionSet::new();
        set.add(PermKind::Exec, "git*");
        assert!(set.check(PermKind::Exec, "git log"));
        assert!(!set.check(PermKind::Exec, "rm -rf /"));
        assert!(!set.check(PermKind::Read, "git log"));
    }

    #[test]
    fn allow_all_bypasses_patterns() {
        let mut set = PermissionSet::new();
        set.allow_all = true;
        assert!(set.check(PermKind::Net, "anything"));
    }
}
