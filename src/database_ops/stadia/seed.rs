//! Keys the spider starts from on an empty database, plus optional extra keys
//! loaded from a JSON file.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

pub const PLAYERS: &[&str] = &[
    "5478196876050978967",
    "956082794034380385",
    "5904879799764",
    "13541093767486303504",
];

pub const GAMES: &[&str] = &[
    // many associated skus
    "20e792017ab34ad89b70dc17a5c72d68rcp1",
    // no associated skus
    "c911998e4f8d4c6ea6712c5ad33e4a54rcp1",
    // unlisted in most countries
    "6d92431b6ca24d69a771cf136a2a231frcp1",
    // delisted
    "8a3cc52ad2334b1e91ded77bc43644e0rcp1",
    // very many associated skus
    "b17f16d4a4f94c0a85e07f54dbdedbb6rcp1",
];

pub const SKUS: &[&str] = &[
    // subscriptions
    "59c8314ac82a456ba61d08988b15b550",
    "6ed658c7e6564de6acf724f979172bb6p",
    // delisted bundle, bonus, add-on and preorder bonus
    "2f112e5ba3d544d69bb1d537c5c4ae5c",
    "5ce9f4c1253047dda226a982fc3dc866",
    "69f80c302be14b8284ba84d1229848e8",
    "2e51be1b06974b81bcf0b4767b4c63dfp",
];

pub const STORE_LISTS: &[u64] = &[3];

pub const SUBSCRIPTIONS: &[u64] = &[];

/// Every two-character search prefix.
pub fn player_searches() -> Vec<String> {
    const FIRST: &str = "abcdefghijklmnopqrstuvwxyz";
    const SECOND: &str = "abcdefghijklmnopqrstuvwxyz0123456789";
    FIRST
        .chars()
        .flat_map(|a| SECOND.chars().map(move |b| format!("{a}{b}")))
        .collect()
}

/// Parse a list of built-in keys, dropping (and logging) any that do not parse.
pub fn parse_all<K, S>(keys: &[S]) -> Vec<K>
where
    K: FromStr,
    K::Err: std::fmt::Display,
    S: AsRef<str>,
{
    keys.iter()
        .filter_map(|key| match key.as_ref().parse() {
            Ok(parsed) => Some(parsed),
            Err(err) => {
                warn!(key = key.as_ref(), error = %err, "skipping invalid seed key");
                None
            }
        })
        .collect()
}

/// Extra seed keys by table name, e.g. `{"Game": ["...rcp1"], "StoreList": [3]}`.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(transparent)]
pub struct SeedFile {
    pub tables: BTreeMap<String, Vec<serde_json::Value>>,
}

impl SeedFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading seed file {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("parsing seed file {}", path.display()))
    }

    pub fn keys(&self, table: &str) -> &[serde_json::Value] {
        self.tables
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(table))
            .map(|(_, keys)| keys.as_slice())
            .unwrap_or(&[])
    }
}
