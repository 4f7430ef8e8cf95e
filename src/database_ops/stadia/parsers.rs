//! Pure parsers from positional response protos to validated models.
//!
//! Offsets are the wire format. They are collected in the `*_offsets`
//! modules below and must only change when the service's responses do.
//! Extra trailing elements are ignored; a required element with the wrong
//! shape is a [`ParseError::Validation`].

use thiserror::Error;

use super::models::{Capture, Player, Sku, SkuCommon, SkuType, SubscriptionSku};
use super::scalars::{
    CaptureId, GameId, OrganizationId, PlayerId, PlayerName, PlayerNumber, ScalarError, SkuId,
    SubscriptionId,
};
use crate::util::proto::Proto;

const MAX_FOUND_LEN: usize = 200;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("expected {expected} at {path}, found {found}")]
    Validation {
        path: String,
        expected: String,
        found: String,
    },
    #[error("unknown sku type id {0}")]
    UnknownSkuType(String),
    #[error("{what} responses are not understood yet")]
    Unsupported { what: &'static str },
}

impl ParseError {
    pub fn invalid(path: &[usize], expected: impl Into<String>, found: &Proto) -> Self {
        let mut found = found.to_json_string();
        if found.len() > MAX_FOUND_LEN {
            let mut cut = MAX_FOUND_LEN;
            while !found.is_char_boundary(cut) {
                cut -= 1;
            }
            found.truncate(cut);
            found.push('…');
        }
        ParseError::Validation {
            path: render_path(path),
            expected: expected.into(),
            found,
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, ParseError::Validation { .. })
    }
}

fn render_path(path: &[usize]) -> String {
    if path.is_empty() {
        return "$".to_string();
    }
    path.iter().map(|i| format!("[{i}]")).collect()
}

/// Offsets into a sku proto.
pub mod sku_offsets {
    pub const SKU_ID: usize = 0;
    pub const NAME: usize = 1;
    pub const IMAGES: usize = 2;
    pub const GAME_ID: usize = 4;
    pub const INTERNAL_NAME: usize = 5;
    pub const TYPE_ID: usize = 6;
    pub const DESCRIPTION: usize = 9;
    /// `[timestamp]` or null.
    pub const TIMESTAMP_A: usize = 10;
    pub const PUBLISHER_ORGANIZATION_ID: usize = 15;
    pub const DEVELOPER_ORGANIZATION_IDS: usize = 16;
    /// `[timestamp]` or null.
    pub const TIMESTAMP_B: usize = 26;
    pub const SUBSCRIPTION_ID: usize = 27;
    /// Cover art URL inside the images element; sizing options follow an `=`.
    pub const COVER_IMAGE_URL: [usize; 5] = [IMAGES, 1, 0, 0, 1];
}

/// Offsets into the shallow player block shared by profiles, friend lists and search results.
pub mod player_offsets {
    pub const NAME: [usize; 2] = [0, 0];
    pub const NUMBER: [usize; 2] = [0, 1];
    pub const AVATAR_IMAGE_URL: [usize; 2] = [1, 1];
    pub const PLAYER_ID: usize = 5;
}

/// Offsets into a capture entry.
pub mod capture_offsets {
    pub const CAPTURE_ID: usize = 1;
    pub const GAME_ID: [usize; 2] = [2, 0];
    pub const GAME_NAME: usize = 3;
    pub const TIMESTAMP: [usize; 2] = [4, 0];
    pub const IMAGE_URL: [usize; 2] = [7, 1];
    pub const VIDEO_URL: [usize; 2] = [8, 1];
}

/// Closed mapping of wire discriminators to sku types.
pub const SKU_TYPES_BY_ID: [(u64, SkuType); 8] = [
    (1, SkuType::Game),
    (2, SkuType::Addon),
    (3, SkuType::Bundle),
    (4, SkuType::ExternalSubscription),
    (5, SkuType::StadiaSubscription),
    (6, SkuType::AddonSubscription),
    (9, SkuType::AddonBundle),
    (10, SkuType::PreorderBundle),
];

pub fn sku_type_from_id(id: u64) -> Result<SkuType, ParseError> {
    SKU_TYPES_BY_ID
        .iter()
        .find(|(known, _)| *known == id)
        .map(|(_, sku_type)| *sku_type)
        .ok_or_else(|| ParseError::UnknownSkuType(id.to_string()))
}

fn scalar<T>(proto: &Proto, path: &[usize]) -> Result<T, ParseError>
where
    T: TryFrom<String, Error = ScalarError>,
{
    let node = proto.path(path);
    let text = node
        .as_str()
        .ok_or_else(|| ParseError::invalid(path, "string", node))?;
    T::try_from(text.to_string()).map_err(|err| ParseError::invalid(path, err.kind, node))
}

fn optional_scalar<T>(proto: &Proto, path: &[usize]) -> Result<Option<T>, ParseError>
where
    T: TryFrom<String, Error = ScalarError>,
{
    if proto.path(path).is_null() {
        Ok(None)
    } else {
        scalar(proto, path).map(Some)
    }
}

fn optional_string(proto: &Proto, path: &[usize]) -> Result<Option<String>, ParseError> {
    let node = proto.path(path);
    match node {
        Proto::Null => Ok(None),
        Proto::String(s) => Ok(Some(s.clone())),
        other => Err(ParseError::invalid(path, "string or null", other)),
    }
}

/// `[timestamp]`, `[]` or null.
fn optional_timestamp(proto: &Proto, path: &[usize]) -> Result<Option<i64>, ParseError> {
    let node = proto.path(path);
    match node {
        Proto::Null => Ok(None),
        Proto::Array(items) if items.is_empty() => Ok(None),
        Proto::Array(items) => match items[0].as_i64() {
            Some(ts) if ts > 0 => Ok(Some(ts)),
            _ => Err(ParseError::invalid(path, "[positive integer]", node)),
        },
        other => Err(ParseError::invalid(path, "[timestamp] or null", other)),
    }
}

fn scalar_list<T>(proto: &Proto, path: &[usize]) -> Result<Option<Vec<T>>, ParseError>
where
    T: TryFrom<String, Error = ScalarError>,
{
    let node = proto.path(path);
    if node.is_null() {
        return Ok(None);
    }
    let items = node
        .as_array()
        .ok_or_else(|| ParseError::invalid(path, "array or null", node))?;
    let mut out = Vec::with_capacity(items.len());
    for i in 0..items.len() {
        let mut item_path = path.to_vec();
        item_path.push(i);
        out.push(scalar(proto, &item_path)?);
    }
    Ok(Some(out))
}

/// An array of id strings; null reads as empty.
pub fn id_list<T>(proto: &Proto) -> Result<Vec<T>, ParseError>
where
    T: TryFrom<String, Error = ScalarError>,
{
    Ok(scalar_list(proto, &[])?.unwrap_or_default())
}

/// Parse one sku tuple, dispatching on its type discriminator.
pub fn sku_from_proto(proto: &Proto) -> Result<Sku, ParseError> {
    use sku_offsets::*;

    if proto.as_array().is_none() {
        return Err(ParseError::invalid(&[], "sku array", proto));
    }

    let type_node = proto.at(TYPE_ID);
    let type_id = type_node
        .as_u64()
        .ok_or_else(|| ParseError::invalid(&[TYPE_ID], "sku type id", type_node))?;
    let sku_type = sku_type_from_id(type_id)?;

    let common = SkuCommon {
        sku_id: scalar::<SkuId>(proto, &[SKU_ID])?,
        game_id: optional_scalar::<GameId>(proto, &[GAME_ID])?,
        name: optional_string(proto, &[NAME])?,
        internal_name: optional_string(proto, &[INTERNAL_NAME])?,
        description: optional_string(proto, &[DESCRIPTION])?,
        cover_image_url: proto
            .path(&COVER_IMAGE_URL)
            .as_str()
            .and_then(|url| url.split('=').next())
            .map(str::to_string),
        timestamp_a: optional_timestamp(proto, &[TIMESTAMP_A])?,
        timestamp_b: optional_timestamp(proto, &[TIMESTAMP_B])?,
        publisher_organization_id: optional_scalar::<OrganizationId>(
            proto,
            &[PUBLISHER_ORGANIZATION_ID],
        )?,
        developer_organization_ids: scalar_list::<OrganizationId>(
            proto,
            &[DEVELOPER_ORGANIZATION_IDS],
        )?,
    };

    let subscription = |common: SkuCommon| -> Result<SubscriptionSku, ParseError> {
        let node = proto.at(SUBSCRIPTION_ID);
        let subscription_id = node
            .as_u64()
            .and_then(|id| SubscriptionId::try_from(id).ok())
            .ok_or_else(|| ParseError::invalid(&[SUBSCRIPTION_ID], "subscription id", node))?;
        Ok(SubscriptionSku {
            common,
            subscription_id,
        })
    };

    Ok(match sku_type {
        SkuType::Game => Sku::Game(common),
        SkuType::Addon => Sku::Addon(common),
        SkuType::Bundle => Sku::Bundle(common),
        SkuType::ExternalSubscription => Sku::ExternalSubscription(subscription(common)?),
        SkuType::StadiaSubscription => Sku::StadiaSubscription(subscription(common)?),
        SkuType::AddonSubscription => Sku::AddonSubscription(common),
        SkuType::AddonBundle => Sku::AddonBundle(common),
        SkuType::PreorderBundle => Sku::PreorderBundle(common),
    })
}

/// Parse the shallow player block (name, number, avatar, id).
pub fn shallow_player_from_proto(proto: &Proto) -> Result<Player, ParseError> {
    use player_offsets::*;

    if proto.as_array().is_none() {
        return Err(ParseError::invalid(&[], "player array", proto));
    }
    let avatar = proto.path(&AVATAR_IMAGE_URL);
    let avatar_image_url = avatar
        .as_str()
        .filter(|url| url::Url::parse(url).is_ok())
        .ok_or_else(|| ParseError::invalid(&AVATAR_IMAGE_URL, "avatar url", avatar))?
        .to_string();

    Ok(Player {
        player_id: scalar::<PlayerId>(proto, &[PLAYER_ID])?,
        name: scalar::<PlayerName>(proto, &NAME)?,
        number: scalar::<PlayerNumber>(proto, &NUMBER)?,
        avatar_image_url,
        played_game_ids: None,
        friend_player_ids: None,
    })
}

/// Parse one capture entry as returned by the capture listing and lookup calls.
pub fn capture_from_proto(proto: &Proto) -> Result<Capture, ParseError> {
    use capture_offsets::*;

    let timestamp_node = proto.path(&TIMESTAMP);
    let timestamp = timestamp_node
        .as_i64()
        .ok_or_else(|| ParseError::invalid(&TIMESTAMP, "timestamp", timestamp_node))?;

    Ok(Capture {
        capture_id: scalar::<CaptureId>(proto, &[CAPTURE_ID])?,
        game_id: scalar::<GameId>(proto, &GAME_ID)?,
        game_name: optional_string(proto, &[GAME_NAME])?,
        timestamp,
        image_url: optional_string(proto, &IMAGE_URL)?,
        video_url: optional_string(proto, &VIDEO_URL)?,
        state_id: None,
    })
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Synthetic protos shaped like real responses.

    use crate::util::proto::Proto;
    use serde_json::json;

    pub fn sku(sku_id: &str, game_id: &str, type_id: u64) -> Proto {
        let mut items = vec![json!(null); 28];
        items[0] = json!(sku_id);
        items[1] = json!(format!("Sku {sku_id}"));
        items[2] = json!([null, [[[null, "https://lh3.googleusercontent.com/cover=w100"]]]]);
        items[4] = json!(game_id);
        items[5] = json!(format!("internal_{sku_id}"));
        items[6] = json!(type_id);
        items[9] = json!("A description");
        items[10] = json!([1600000000]);
        items[15] = json!("abcdefpup1");
        items[16] = json!(["abcdefpup1", "012345pup1"]);
        items[26] = json!([]);
        if matches!(type_id, 4 | 5) {
            items[27] = json!(42);
        }
        serde_json::from_value(json!(items)).unwrap()
    }

    pub fn player(player_id: &str, name: &str, number: &str) -> Proto {
        serde_json::from_value(json!([
            [name, number],
            ["s00001", "https://lh3.googleusercontent.com/avatar.png"],
            null,
            name.to_uppercase(),
            null,
            player_id
        ]))
        .unwrap()
    }
}
