//! Cached value types, one per table (or shared between tables).

use serde::{Deserialize, Serialize};

use super::scalars::{
    CaptureId, GameId, OrganizationId, PlayerId, PlayerName, PlayerNumber, SkuId, StateId,
    SubscriptionId,
};

/// Purchasable sku kinds as reported by the store. `Alias` and `Deleted` are
/// local-only and never appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SkuType {
    Game,
    Addon,
    Bundle,
    ExternalSubscription,
    StadiaSubscription,
    AddonSubscription,
    AddonBundle,
    PreorderBundle,
}

impl SkuType {
    pub fn as_str(self) -> &'static str {
        match self {
            SkuType::Game => "Game",
            SkuType::Addon => "Addon",
            SkuType::Bundle => "Bundle",
            SkuType::ExternalSubscription => "ExternalSubscription",
            SkuType::StadiaSubscription => "StadiaSubscription",
            SkuType::AddonSubscription => "AddonSubscription",
            SkuType::AddonBundle => "AddonBundle",
            SkuType::PreorderBundle => "PreorderBundle",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkuCommon {
    pub sku_id: SkuId,
    pub game_id: Option<GameId>,
    pub name: Option<String>,
    pub internal_name: Option<String>,
    pub description: Option<String>,
    pub cover_image_url: Option<String>,
    pub timestamp_a: Option<i64>,
    pub timestamp_b: Option<i64>,
    pub publisher_organization_id: Option<OrganizationId>,
    pub developer_organization_ids: Option<Vec<OrganizationId>>,
}

impl SkuCommon {
    /// A common block with every content field null.
    pub fn empty(sku_id: SkuId) -> Self {
        Self {
            sku_id,
            game_id: None,
            name: None,
            internal_name: None,
            description: None,
            cover_image_url: None,
            timestamp_a: None,
            timestamp_b: None,
            publisher_organization_id: None,
            developer_organization_ids: None,
        }
    }

    fn is_empty(&self) -> bool {
        *self == Self::empty(self.sku_id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSku {
    #[serde(flatten)]
    pub common: SkuCommon,
    pub subscription_id: SubscriptionId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AliasSku {
    #[serde(flatten)]
    pub common: SkuCommon,
    pub target_sku_id: SkuId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "skuType")]
pub enum Sku {
    Game(SkuCommon),
    Addon(SkuCommon),
    Bundle(SkuCommon),
    StadiaSubscription(SubscriptionSku),
    ExternalSubscription(SubscriptionSku),
    AddonSubscription(SkuCommon),
    AddonBundle(SkuCommon),
    PreorderBundle(SkuCommon),
    /// The id now resolves to a different sku.
    Alias(AliasSku),
    /// The store no longer knows this id.
    Deleted(SkuCommon),
}

impl Sku {
    pub fn deleted(sku_id: SkuId) -> Self {
        Sku::Deleted(SkuCommon::empty(sku_id))
    }

    pub fn alias(sku_id: SkuId, target_sku_id: SkuId) -> Self {
        Sku::Alias(AliasSku {
            common: SkuCommon::empty(sku_id),
            target_sku_id,
        })
    }

    pub fn common(&self) -> &SkuCommon {
        match self {
            Sku::Game(c)
            | Sku::Addon(c)
            | Sku::Bundle(c)
            | Sku::AddonSubscription(c)
            | Sku::AddonBundle(c)
            | Sku::PreorderBundle(c)
            | Sku::Deleted(c) => c,
            Sku::StadiaSubscription(s) | Sku::ExternalSubscription(s) => &s.common,
            Sku::Alias(a) => &a.common,
        }
    }

    pub fn sku_id(&self) -> &SkuId {
        &self.common().sku_id
    }

    pub fn game_id(&self) -> Option<&GameId> {
        self.common().game_id.as_ref()
    }

    pub fn name(&self) -> Option<&str> {
        self.common().name.as_deref()
    }

    pub fn sku_type(&self) -> &'static str {
        match self {
            Sku::Game(_) => SkuType::Game.as_str(),
            Sku::Addon(_) => SkuType::Addon.as_str(),
            Sku::Bundle(_) => SkuType::Bundle.as_str(),
            Sku::StadiaSubscription(_) => SkuType::StadiaSubscription.as_str(),
            Sku::ExternalSubscription(_) => SkuType::ExternalSubscription.as_str(),
            Sku::AddonSubscription(_) => SkuType::AddonSubscription.as_str(),
            Sku::AddonBundle(_) => SkuType::AddonBundle.as_str(),
            Sku::PreorderBundle(_) => SkuType::PreorderBundle.as_str(),
            Sku::Alias(_) => "Alias",
            Sku::Deleted(_) => "Deleted",
        }
    }

    /// Degenerate variants must not carry content.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Sku::Alias(AliasSku { common, .. }) | Sku::Deleted(common) if !common.is_empty() => Err(
                format!("{} sku {} has content fields set", self.sku_type(), common.sku_id),
            ),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    pub player_id: PlayerId,
    pub name: PlayerName,
    pub number: PlayerNumber,
    pub avatar_image_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub played_game_ids: Option<Vec<GameId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub friend_player_ids: Option<Vec<PlayerId>>,
}

/// A game's primary sku plus every sku listed for it, in listing order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameValue {
    pub sku_id: SkuId,
    pub sku_ids: Vec<SkuId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListedSku {
    pub sku_id: SkuId,
    pub game_id: GameId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendList {
    pub player_ids: Vec<PlayerId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentPlayer {
    pub player_id: PlayerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_id: Option<GameId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capture {
    pub capture_id: CaptureId,
    pub game_id: GameId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_name: Option<String>,
    /// Capture time as reported by the service (epoch seconds).
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_id: Option<StateId>,
}

/// Placeholder for responses that are fetched and kept raw but not yet interpreted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unparsed {}
