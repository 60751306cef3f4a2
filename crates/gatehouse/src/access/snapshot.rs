//! Immutable access policy snapshot and the access-file parser.
//!
//! File format, one entry per line (surrounding whitespace is trimmed):
//! - blank lines are ignored
//! - `#` starts a comment line
//! - `%token` adds `token` to the bypass-token set
//! - anything else is an allowed subject identifier

use std::collections::HashSet;

use subtle::{Choice, ConstantTimeEq};

/// Prefix marking a comment line.
const COMMENT_PREFIX: char = '#';

/// Prefix marking a bypass token line.
const BYPASS_PREFIX: char = '%';

/// Point-in-time copy of the access policy.
///
/// Keeps the entries in file order (for change detection) alongside a
/// hashed index for membership checks. Never mutated after construction.
#[derive(Debug, Clone, Default)]
pub struct AccessSnapshot {
    allowed_subjects: Vec<String>,
    bypass_tokens: Vec<String>,
    subject_index: HashSet<String>,
}

impl AccessSnapshot {
    /// Build a snapshot from already-separated entries.
    pub fn new(allowed_subjects: Vec<String>, bypass_tokens: Vec<String>) -> Self {
        let subject_index = allowed_subjects.iter().cloned().collect();
        Self {
            allowed_subjects,
            bypass_tokens,
            subject_index,
        }
    }

    /// Parse the text of an access file.
    pub fn parse(content: &str) -> Self {
        let mut allowed_subjects = Vec::new();
        let mut bypass_tokens = Vec::new();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with(COMMENT_PREFIX) {
                continue;
            }
            if let Some(token) = line.strip_prefix(BYPASS_PREFIX) {
                bypass_tokens.push(token.to_string());
            } else {
                allowed_subjects.push(line.to_string());
            }
        }

        Self::new(allowed_subjects, bypass_tokens)
    }

    /// Allowed subjects in file order (duplicates preserved).
    pub fn allowed_subjects(&self) -> &[String] {
        &self.allowed_subjects
    }

    /// Bypass tokens in file order (duplicates preserved).
    pub fn bypass_tokens(&self) -> &[String] {
        &self.bypass_tokens
    }

    /// Exact, case-sensitive membership check on the allow-list.
    pub fn is_subject_allowed(&self, subject: &str) -> bool {
        self.subject_index.contains(subject)
    }

    /// Check a presented bypass token against every configured token.
    ///
    /// Every candidate is compared in constant time and the scan never
    /// exits early, so timing does not reveal which token (if any) matched.
    pub fn is_bypass_token(&self, presented: &[u8]) -> bool {
        let mut found = Choice::from(0u8);
        for token in &self.bypass_tokens {
            found |= token.as_bytes().ct_eq(presented);
        }
        found.into()
    }

    /// Order-sensitive comparison with another snapshot.
    ///
    /// Two files listing the same entries in a different order count as
    /// changed.
    pub fn differs_from(&self, other: &AccessSnapshot) -> bool {
        self.allowed_subjects != other.allowed_subjects
            || self.bypass_tokens != other.bypass_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_separates_subjects_tokens_and_comments() {
        let snapshot = AccessSnapshot::parse("# comment\nalice\n%secret123\n");
        assert_eq!(snapshot.allowed_subjects(), ["alice"]);
        assert_eq!(snapshot.bypass_tokens(), ["secret123"]);
    }

    #[test]
    fn parse_trims_and_skips_blank_lines() {
        let snapshot = AccessSnapshot::parse("\n   \n  bob  \r\n\t%tok \n");
        assert_eq!(snapshot.allowed_subjects(), ["bob"]);
        assert_eq!(snapshot.bypass_tokens(), ["tok"]);
    }

    #[test]
    fn indented_comment_is_never_an_entry() {
        let snapshot = AccessSnapshot::parse("   # alice\n\t#%secret\n#\n");
        assert!(snapshot.allowed_subjects().is_empty());
        assert!(snapshot.bypass_tokens().is_empty());
        assert!(!snapshot.is_subject_allowed("# alice"));
        assert!(!snapshot.is_bypass_token(b"secret"));
    }

    #[test]
    fn hash_inside_a_line_is_part_of_the_entry() {
        let snapshot = AccessSnapshot::parse("auth0|abc#1\n%to#ken\n");
        assert!(snapshot.is_subject_allowed("auth0|abc#1"));
        assert!(snapshot.is_bypass_token(b"to#ken"));
    }

    #[test]
    fn subject_lookup_is_exact_and_case_sensitive() {
        let snapshot = AccessSnapshot::parse("Alice\n");
        assert!(snapshot.is_subject_allowed("Alice"));
        assert!(!snapshot.is_subject_allowed("alice"));
        assert!(!snapshot.is_subject_allowed("Alic"));
    }

    #[test]
    fn bypass_token_must_match_exactly() {
        let snapshot = AccessSnapshot::parse("%secret123\n%other\n");
        assert!(snapshot.is_bypass_token(b"secret123"));
        assert!(snapshot.is_bypass_token(b"other"));
        assert!(!snapshot.is_bypass_token(b"secret12"));
        assert!(!snapshot.is_bypass_token(b"secret1234"));
        assert!(!snapshot.is_bypass_token(b""));
    }

    #[test]
    fn subjects_are_not_bypass_tokens() {
        let snapshot = AccessSnapshot::parse("alice\n%secret\n");
        assert!(!snapshot.is_bypass_token(b"alice"));
        assert!(!snapshot.is_subject_allowed("secret"));
        assert!(!snapshot.is_subject_allowed("%secret"));
    }

    #[test]
    fn duplicates_are_kept_in_order() {
        let snapshot = AccessSnapshot::parse("alice\nalice\n");
        assert_eq!(snapshot.allowed_subjects(), ["alice", "alice"]);
        assert!(snapshot.is_subject_allowed("alice"));
    }

    #[test]
    fn change_detection_is_order_sensitive() {
        let a = AccessSnapshot::parse("alice\nbob\n%t1\n");
        let same = AccessSnapshot::parse("# reworded comment\nalice\n\nbob\n%t1\n");
        let reordered = AccessSnapshot::parse("bob\nalice\n%t1\n");
        let new_token = AccessSnapshot::parse("alice\nbob\n%t2\n");

        assert!(!a.differs_from(&same));
        assert!(a.differs_from(&reordered));
        assert!(a.differs_from(&new_token));
    }

    #[test]
    fn bypass_token_matches_any_position_in_list() {
        let snapshot = AccessSnapshot::parse("%first
%second
%third
");
        assert!(snapshot.is_bypass_token(b"first"));
        assert!(snapshot.is_bypass_token(b"third"));
        assert!(!snapshot.is_bypass_token(b"fourth"));
        assert!(!AccessSnapshot::default().is_bypass_token(b"first"));
    }
}
