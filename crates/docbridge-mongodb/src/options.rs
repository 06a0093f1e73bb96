//! Option-string parsing.
//!
//! Flags keep the numeric values of the legacy C driver so option masks
//! stay interchangeable with existing callers.

use docbridge_common::{BridgeError, Result};
use std::fmt;

pub const MONGO_CONTINUE_ON_ERROR: u32 = 0x1;

pub const MONGO_UPDATE_UPSERT: u32 = 0x1;
pub const MONGO_UPDATE_MULTI: u32 = 0x2;
pub const MONGO_UPDATE_BASIC: u32 = 0x4;

pub const MONGO_TAILABLE: u32 = 0x2;
pub const MONGO_SLAVE_OK: u32 = 0x4;
pub const MONGO_NO_CURSOR_TIMEOUT: u32 = 0x10;
pub const MONGO_AWAIT_DATA: u32 = 0x20;
pub const MONGO_EXHAUST: u32 = 0x40;
pub const MONGO_PARTIAL: u32 = 0x80;

pub const MONGO_INDEX_UNIQUE: u32 = 0x1;
pub const MONGO_INDEX_DROP_DUPS: u32 = 0x4;
pub const MONGO_INDEX_BACKGROUND: u32 = 0x8;
pub const MONGO_INDEX_SPARSE: u32 = 0x10;

/// Operation kinds that accept an option string; each has its own symbols
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    Insert,
    Update,
    Retrieve,
    CreateIndex,
}

impl OptionKind {
    pub fn name(&self) -> &'static str {
        match self {
            OptionKind::Insert => "insert",
            OptionKind::Update => "update",
            OptionKind::Retrieve => "retrieve",
            OptionKind::CreateIndex => "create_index",
        }
    }

    fn symbols(&self) -> &'static [(&'static str, u32)] {
        match self {
            OptionKind::Insert => &[("MONGO_CONTINUE_ON_ERROR", MONGO_CONTINUE_ON_ERROR)],
            OptionKind::Update => &[
                ("MONGO_UPDATE_UPSERT", MONGO_UPDATE_UPSERT),
                ("MONGO_UPDATE_MULTI", MONGO_UPDATE_MULTI),
                ("MONGO_UPDATE_BASIC", MONGO_UPDATE_BASIC),
            ],
            OptionKind::Retrieve => &[
                ("MONGO_TAILABLE", MONGO_TAILABLE),
                ("MONGO_SLAVE_OK", MONGO_SLAVE_OK),
                ("MONGO_NO_CURSOR_TIMEOUT", MONGO_NO_CURSOR_TIMEOUT),
                ("MONGO_AWAIT_DATA", MONGO_AWAIT_DATA),
                ("MONGO_EXHAUST", MONGO_EXHAUST),
                ("MONGO_PARTIAL", MONGO_PARTIAL),
            ],
            OptionKind::CreateIndex => &[
                ("MONGO_INDEX_UNIQUE", MONGO_INDEX_UNIQUE),
                ("MONGO_INDEX_DROP_DUPS", MONGO_INDEX_DROP_DUPS),
                ("MONGO_INDEX_BACKGROUND", MONGO_INDEX_BACKGROUND),
                ("MONGO_INDEX_SPARSE", MONGO_INDEX_SPARSE),
            ],
        }
    }

    fn lookup(&self, symbol: &str) -> Option<u32> {
        self.symbols()
            .iter()
            .find(|(name, _)| *name == symbol)
            .map(|(_, bit)| *bit)
    }
}

impl fmt::Display for OptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Parse an option string into a bitmask.
///
/// Tokens are maximal runs of `[A-Za-z0-9_]`. A token may also be several
/// symbols joined by single underscores, in which case their flags are
/// combined. The first unknown token stops parsing.
pub fn parse_options(kind: OptionKind, text: &str) -> Result<u32> {
    let mut mask = 0;
    for token in text
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
    {
        match decompose(kind, token) {
            Some(bits) => mask |= bits,
            None => {
                return Err(BridgeError::Argument(format!(
                    "Invalid Option ({}) supplied to {} method",
                    token, kind
                )))
            }
        }
    }
    Ok(mask)
}

/// Split a token into known symbols joined by single underscores.
///
/// `reach[i]` holds the mask of some split of `token[..i]` that ends on a
/// symbol boundary. Runs in one pass over the token.
fn decompose(kind: OptionKind, token: &str) -> Option<u32> {
    if let Some(bit) = kind.lookup(token) {
        return Some(bit);
    }
    let bytes = token.as_bytes();
    let mut reach: Vec<Option<u32>> = vec![None; bytes.len() + 1];
    reach[0] = Some(0);

    for start in 0..bytes.len() {
        let Some(mask) = reach[start] else { continue };
        let rest = &token[start..];
        for (name, bit) in kind.symbols() {
            if !rest.starts_with(name) {
                continue;
            }
            let end = start + name.len();
            if end == bytes.len() {
                return Some(mask | bit);
            }
            if bytes[end] == b'_' && reach[end + 1].is_none() {
                reach[end + 1] = Some(mask | bit);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_symbol() {
        assert_eq!(parse_options(OptionKind::Update, "MONGO_UPDATE_UPSERT").unwrap(), 0x1);
        assert_eq!(parse_options(OptionKind::Insert, "MONGO_CONTINUE_ON_ERROR").unwrap(), 0x1);
    }

    #[test]
    fn test_separators() {
        let mask = parse_options(OptionKind::Retrieve, "MONGO_TAILABLE | MONGO_AWAIT_DATA,MONGO_PARTIAL").unwrap();
        assert_eq!(mask, MONGO_TAILABLE | MONGO_AWAIT_DATA | MONGO_PARTIAL);
    }

    #[test]
    fn test_empty_string() {
        assert_eq!(parse_options(OptionKind::CreateIndex, "").unwrap(), 0);
        assert_eq!(parse_options(OptionKind::CreateIndex, " ,| ").unwrap(), 0);
    }

    #[test]
    fn test_concatenated_symbols() {
        let mask = parse_options(OptionKind::Update, "MONGO_UPDATE_UPSERT_MONGO_UPDATE_MULTI").unwrap();
        assert_eq!(mask, MONGO_UPDATE_UPSERT | MONGO_UPDATE_MULTI);
    }

    #[test]
    fn test_unknown_token_names_token_and_kind() {
        let err = parse_options(OptionKind::Update, "MONGO_BOGUS").unwrap_err();
        assert_eq!(err.to_string(), "Invalid Option (MONGO_BOGUS) supplied to update method");
        assert!(err.is_fault());
    }

    #[test]
    fn test_symbol_from_other_kind_is_rejected() {
        let err = parse_options(OptionKind::CreateIndex, "MONGO_INDEX_UNIQUE MONGO_TAILABLE").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid Option (MONGO_TAILABLE) supplied to create_index method"
        );
    }

    #[test]
    fn test_long_concatenated_token() {
        let text = vec!["MONGO_UPDATE_UPSERT"; 20_000].join("_");
        assert_eq!(parse_options(OptionKind::Update, &text).unwrap(), MONGO_UPDATE_UPSERT);

        let mixed = format!("{}_MONGO_UPDATE_MULTI", vec!["MONGO_UPDATE_BASIC"; 50_000].join("_"));
        assert_eq!(
            parse_options(OptionKind::Update, &mixed).unwrap(),
            MONGO_UPDATE_BASIC | MONGO_UPDATE_MULTI
        );

        let bad = format!("{}_MONGO_BOGUS", vec!["MONGO_UPDATE_UPSERT"; 20_000].join("_"));
        assert!(parse_options(OptionKind::Update, &bad).is_err());
    }

    #[test]
    fn test_dangling_underscore_is_rejected() {
        assert!(parse_options(OptionKind::Update, "MONGO_UPDATE_UPSERT_").is_err());
    }
}
