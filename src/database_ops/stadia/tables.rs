//! The spider's tables: key and value types, projected columns, cache policy,
//! and how to request and parse each record.

use std::fmt;
use std::str::FromStr;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::batch::RpcCall;
use super::context::{RequestContext, UpdateOptions};
use super::models::{
    Capture, FriendList, GameValue, ListedSku, Player, RecentPlayer, Sku, Unparsed,
};
use super::parsers::{
    capture_from_proto, id_list, shallow_player_from_proto, sku_from_proto, ParseError,
};
use super::scalars::{
    CaptureId, GameId, GamertagPrefix, MyFriendsKey, MyGamesKey, MyPurchasesKey,
    MyRecentPlayersKey, PlayerId, ScalarError, SkuId, StoreListId, SubscriptionId,
};
use super::seed;
use super::StadiaError;
use crate::database_ops::store::{ColumnKind, ColumnSpec, Document};
use crate::util::proto::Proto;
use crate::util::sql::SqlValue;

/// Advisory freshness policy for a table's records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheControl {
    MaxAge(u64),
    /// Fetched for the side effects of parsing; the value itself is never cached.
    NoStore,
}

impl CacheControl {
    pub fn max_age_secs(self) -> u64 {
        match self {
            CacheControl::MaxAge(secs) => secs,
            CacheControl::NoStore => 0,
        }
    }

    pub fn is_cacheable(self) -> bool {
        matches!(self, CacheControl::MaxAge(_))
    }
}

impl fmt::Display for CacheControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheControl::MaxAge(secs) => write!(f, "max-age={secs}"),
            CacheControl::NoStore => f.write_str("no-store,max-age=0"),
        }
    }
}

pub trait RecordKey:
    Serialize
    + DeserializeOwned
    + FromStr<Err = ScalarError>
    + Clone
    + PartialEq
    + fmt::Debug
    + fmt::Display
    + Send
    + Sync
    + 'static
{
    fn to_sql(&self) -> SqlValue;
    fn to_proto(&self) -> Proto;
}

macro_rules! record_keys {
    ($($key:ty),* $(,)?) => {
        $(
            impl RecordKey for $key {
                fn to_sql(&self) -> SqlValue {
                    SqlValue::from(self)
                }

                fn to_proto(&self) -> Proto {
                    Proto::from(self)
                }
            }
        )*
    };
}

record_keys!(
    PlayerId,
    GameId,
    SkuId,
    SubscriptionId,
    StoreListId,
    GamertagPrefix,
    CaptureId,
    MyGamesKey,
    MyPurchasesKey,
    MyFriendsKey,
    MyRecentPlayersKey,
);

pub trait TableValue: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static {
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

impl TableValue for Player {}
impl TableValue for GameValue {}
impl TableValue for Sku {
    fn validate(&self) -> Result<(), String> {
        Sku::validate(self)
    }
}
impl TableValue for Unparsed {}
impl TableValue for Vec<ListedSku> {}
impl TableValue for Vec<PlayerId> {}
impl TableValue for Vec<SkuId> {}
impl TableValue for Vec<RecentPlayer> {}
impl TableValue for FriendList {}
impl TableValue for Capture {}

/// One cached row. Timestamps are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record<K, V> {
    pub key: K,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<V>,
    #[serde(rename = "_request", default, skip_serializing_if = "Option::is_none")]
    pub request: Option<Proto>,
    #[serde(rename = "_response", default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Proto>,
    #[serde(
        rename = "_lastUpdatedTimestamp",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub last_updated_timestamp: Option<i64>,
    #[serde(
        rename = "_lastUpdateAttemptedTimestamp",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub last_update_attempted_timestamp: Option<i64>,
}

impl<K, V> Record<K, V> {
    /// A row that only knows its key. `last_updated_timestamp` stays null until
    /// a value is written, so stubs sort by insertion order in `stalest`.
    pub fn stub(key: K) -> Self {
        Self {
            key,
            value: None,
            request: None,
            response: None,
            last_updated_timestamp: None,
            last_update_attempted_timestamp: None,
        }
    }
}

impl<K: RecordKey, V: TableValue> Document for Record<K, V> {
    fn validate(&self) -> Result<(), String> {
        for timestamp in [self.last_updated_timestamp, self.last_update_attempted_timestamp]
            .into_iter()
            .flatten()
        {
            if timestamp <= 0 {
                return Err(format!("timestamp {timestamp} is not positive"));
            }
        }
        match &self.value {
            Some(value) => value.validate(),
            None => Ok(()),
        }
    }
}

/// A cache table: what it stores and how to fetch it.
pub trait TableDef: 'static {
    const NAME: TableName;
    const CACHE_CONTROL: CacheControl;
    /// Projected paths into `value`, as `(path, kind)`.
    const COLUMNS: &'static [(&'static str, ColumnKind)];

    type Key: RecordKey;
    type Value: TableValue;

    fn seed_keys() -> Vec<Self::Key> {
        Vec::new()
    }

    fn make_request<C: RequestContext>(
        key: &Self::Key,
        context: &C,
    ) -> Result<Vec<RpcCall>, StadiaError>;

    fn parse_response<C: RequestContext>(
        responses: &[Proto],
        key: &Self::Key,
        context: &C,
    ) -> Result<Self::Value, StadiaError>;
}

/// Every table gets these in addition to its own value columns.
const RECORD_COLUMNS: [(&str, ColumnKind); 6] = [
    ("key", ColumnKind::Unique),
    ("_lastUpdatedTimestamp", ColumnKind::Indexed),
    ("_lastUpdateAttemptedTimestamp", ColumnKind::Indexed),
    ("value", ColumnKind::Virtual),
    ("_request", ColumnKind::Virtual),
    ("_response", ColumnKind::Virtual),
];

pub fn column_specs<T: TableDef>() -> Vec<ColumnSpec> {
    T::COLUMNS
        .iter()
        .map(|(path, kind)| ColumnSpec::new(format!("value.{path}"), *kind))
        .chain(
            RECORD_COLUMNS
                .iter()
                .map(|(path, kind)| ColumnSpec::new(*path, *kind)),
        )
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableName {
    Player,
    Game,
    Sku,
    Subscription,
    StoreList,
    PlayerProgression,
    PlayerSearch,
    MyGames,
    MyPurchases,
    MyFriends,
    MyRecentPlayers,
    Capture,
}

impl TableName {
    pub const ALL: [TableName; 12] = [
        TableName::Player,
        TableName::Game,
        TableName::Sku,
        TableName::Subscription,
        TableName::StoreList,
        TableName::PlayerProgression,
        TableName::PlayerSearch,
        TableName::MyGames,
        TableName::MyPurchases,
        TableName::MyFriends,
        TableName::MyRecentPlayers,
        TableName::Capture,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TableName::Player => "Player",
            TableName::Game => "Game",
            TableName::Sku => "Sku",
            TableName::Subscription => "Subscription",
            TableName::StoreList => "StoreList",
            TableName::PlayerProgression => "PlayerProgression",
            TableName::PlayerSearch => "PlayerSearch",
            TableName::MyGames => "MyGames",
            TableName::MyPurchases => "MyPurchases",
            TableName::MyFriends => "MyFriends",
            TableName::MyRecentPlayers => "MyRecentPlayers",
            TableName::Capture => "Capture",
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TableName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TableName::ALL
            .into_iter()
            .find(|name| name.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown table {s:?}"))
    }
}

/// Run `$body` with `$t` bound to the [`TableDef`] type for a runtime [`TableName`].
macro_rules! with_table {
    ($name:expr, $t:ident => $body:expr) => {{
        use $crate::database_ops::stadia::tables::*;
        match $name {
            TableName::Player => {
                type $t = PlayerTable;
                $body
            }
            TableName::Game => {
                type $t = GameTable;
                $body
            }
            TableName::Sku => {
                type $t = SkuTable;
                $body
            }
            TableName::Subscription => {
                type $t = SubscriptionTable;
                $body
            }
            TableName::StoreList => {
                type $t = StoreListTable;
                $body
            }
            TableName::PlayerProgression => {
                type $t = PlayerProgressionTable;
                $body
            }
            TableName::PlayerSearch => {
                type $t = PlayerSearchTable;
                $body
            }
            TableName::MyGames => {
                type $t = MyGamesTable;
                $body
            }
            TableName::MyPurchases => {
                type $t = MyPurchasesTable;
                $body
            }
            TableName::MyFriends => {
                type $t = MyFriendsTable;
                $body
            }
            TableName::MyRecentPlayers => {
                type $t = MyRecentPlayersTable;
                $body
            }
            TableName::Capture => {
                type $t = CaptureTable;
                $body
            }
        }
    }};
}
pub(crate) use with_table;

fn response(responses: &[Proto], index: usize) -> &Proto {
    responses.get(index).unwrap_or(&Proto::Null)
}

fn complete() -> UpdateOptions {
    UpdateOptions::default()
}

fn incomplete() -> UpdateOptions {
    UpdateOptions { incomplete: true }
}

/// Record a sku and make sure its game is known.
fn discover_sku<C: RequestContext>(context: &C, sku: &Sku) -> Result<(), StadiaError> {
    context.update::<SkuTable>(sku.sku_id(), Some(sku), complete())?;
    if let Some(game_id) = sku.game_id() {
        context.update::<GameTable>(game_id, None, complete())?;
    }
    Ok(())
}

fn listed_sku(sku: &Sku, path: &[usize], proto: &Proto) -> Result<ListedSku, ParseError> {
    let game_id = sku
        .game_id()
        .cloned()
        .ok_or_else(|| ParseError::invalid(path, "sku with a GameId", proto))?;
    Ok(ListedSku {
        sku_id: sku.sku_id().clone(),
        game_id,
    })
}

pub struct PlayerTable;

impl TableDef for PlayerTable {
    const NAME: TableName = TableName::Player;
    const CACHE_CONTROL: CacheControl = CacheControl::MaxAge(11_059_200);
    const COLUMNS: &'static [(&'static str, ColumnKind)] = &[
        ("name", ColumnKind::Indexed),
        ("number", ColumnKind::Virtual),
        ("friendPlayerIds", ColumnKind::Virtual),
        ("playedGameIds", ColumnKind::Virtual),
        ("avatarImageUrl", ColumnKind::Indexed),
    ];

    type Key = PlayerId;
    type Value = Player;

    fn seed_keys() -> Vec<PlayerId> {
        seed::parse_all(seed::PLAYERS)
    }

    fn make_request<C: RequestContext>(key: &PlayerId, _: &C) -> Result<Vec<RpcCall>, StadiaError> {
        let id = key.to_proto();
        Ok(vec![
            // profile
            RpcCall::new(
                "D0Amud",
                vec![Proto::Null, true.into(), Proto::Null, Proto::Null, id.clone()],
            ),
            // friends
            RpcCall::new("Z5HRnb", vec![Proto::Null, true.into(), id.clone()]),
            // played games
            RpcCall::new("Q6jt8c", vec![Proto::Null, Proto::Null, Proto::Null, id]),
        ])
    }

    fn parse_response<C: RequestContext>(
        responses: &[Proto],
        key: &PlayerId,
        context: &C,
    ) -> Result<Player, StadiaError> {
        let profile = response(responses, 0);
        let friends = response(responses, 1);
        let games = response(responses, 2);

        let mut player = shallow_player_from_proto(profile.at(5))?;
        if &player.player_id != key {
            return Err(StadiaError::KeyMismatch {
                table: Self::NAME,
                requested: key.to_string(),
                found: player.player_id.to_string(),
            });
        }

        let played_game_ids: Vec<GameId> = id_list(games.at(0))?;

        let mut friend_player_ids = Vec::new();
        for friend in friends.at(0).items() {
            let friend = shallow_player_from_proto(friend)?;
            context.update::<PlayerTable>(&friend.player_id, Some(&friend), incomplete())?;
            friend_player_ids.push(friend.player_id);
        }

        for game_id in &played_game_ids {
            context.update::<GameTable>(game_id, None, complete())?;
        }
        context.update::<PlayerProgressionTable>(key, None, complete())?;

        player.played_game_ids = Some(played_game_ids);
        player.friend_player_ids = Some(friend_player_ids);
        Ok(player)
    }
}

pub struct GameTable;

impl TableDef for GameTable {
    const NAME: TableName = TableName::Game;
    const CACHE_CONTROL: CacheControl = CacheControl::MaxAge(57_600);
    const COLUMNS: &'static [(&'static str, ColumnKind)] = &[("skuId", ColumnKind::Indexed)];

    type Key = GameId;
    type Value = GameValue;

    fn seed_keys() -> Vec<GameId> {
        seed::parse_all(seed::GAMES)
    }

    fn make_request<C: RequestContext>(key: &GameId, _: &C) -> Result<Vec<RpcCall>, StadiaError> {
        let id = key.to_proto();
        let sections: Vec<Proto> = [1u64, 2, 3, 4, 6, 7, 8, 9, 10]
            .into_iter()
            .map(Proto::from)
            .collect();
        Ok(vec![
            // store listing of every sku for the game
            RpcCall::new("ZAm7We", vec![id.clone(), Proto::from(sections)]),
            // game details, including its primary sku
            RpcCall::new(
                "LrvzJb",
                vec![
                    Proto::Null,
                    Proto::Null,
                    Proto::array([Proto::array([id])]),
                ],
            ),
        ])
    }

    fn parse_response<C: RequestContext>(
        responses: &[Proto],
        key: &GameId,
        context: &C,
    ) -> Result<GameValue, StadiaError> {
        let listing = response(responses, 0);
        let details = response(responses, 1);

        if listing.at(0).is_null() && details.items().is_empty() {
            return Err(ParseError::Unsupported {
                what: "Game without skus",
            }
            .into());
        }

        // details[1][0][1][9] is the game's own sku
        let game_sku = sku_from_proto(details.path(&[1, 0, 1, 9]))?;
        if game_sku.game_id() != Some(key) {
            return Err(StadiaError::KeyMismatch {
                table: Self::NAME,
                requested: key.to_string(),
                found: game_sku
                    .game_id()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "no game".to_string()),
            });
        }

        let skus = match listing.at(0).as_array() {
            Some(entries) => entries
                .iter()
                .map(|entry| sku_from_proto(entry.at(9)))
                .collect::<Result<Vec<_>, _>>()?,
            None => {
                info!(game_id = %key, name = ?game_sku.name(), "stadia: no skus listed for game");
                vec![game_sku.clone()]
            }
        };

        for sku in &skus {
            context.update::<SkuTable>(sku.sku_id(), Some(sku), complete())?;
        }

        Ok(GameValue {
            sku_id: game_sku.sku_id().clone(),
            sku_ids: skus.iter().map(|sku| sku.sku_id().clone()).collect(),
        })
    }
}

pub struct SkuTable;

impl TableDef for SkuTable {
    const NAME: TableName = TableName::Sku;
    const CACHE_CONTROL: CacheControl = CacheControl::MaxAge(1_382_400);
    const COLUMNS: &'static [(&'static str, ColumnKind)] = &[
        ("gameId", ColumnKind::Indexed),
        ("skuType", ColumnKind::Indexed),
        ("name", ColumnKind::Indexed),
        ("description", ColumnKind::Virtual),
    ];

    type Key = SkuId;
    type Value = Sku;

    fn seed_keys() -> Vec<SkuId> {
        seed::parse_all(seed::SKUS)
    }

    fn make_request<C: RequestContext>(key: &SkuId, _: &C) -> Result<Vec<RpcCall>, StadiaError> {
        Ok(vec![RpcCall::new("FWhQV", vec![Proto::Null, key.to_proto()])])
    }

    fn parse_response<C: RequestContext>(
        responses: &[Proto],
        key: &SkuId,
        context: &C,
    ) -> Result<Sku, StadiaError> {
        let detail = response(responses, 0);
        if detail.is_null() {
            warn!(sku_id = %key, "stadia: requested sku appears to have been deleted");
            return Ok(Sku::deleted(key.clone()));
        }

        let sku = sku_from_proto(detail.at(16))?;
        if sku.sku_id() != key {
            warn!(
                requested = %key,
                found = %sku.sku_id(),
                "stadia: sku response describes a different sku; recording an alias"
            );
            context.update::<SkuTable>(sku.sku_id(), Some(&sku), complete())?;
            return Ok(Sku::alias(key.clone(), sku.sku_id().clone()));
        }

        if let Some(game_id) = sku.game_id() {
            context.update::<GameTable>(game_id, None, complete())?;
        }
        Ok(sku)
    }
}

pub struct SubscriptionTable;

impl TableDef for SubscriptionTable {
    const NAME: TableName = TableName::Subscription;
    const CACHE_CONTROL: CacheControl = CacheControl::MaxAge(14_400);
    const COLUMNS: &'static [(&'static str, ColumnKind)] = &[];

    type Key = SubscriptionId;
    type Value = Unparsed;

    fn seed_keys() -> Vec<SubscriptionId> {
        seed::SUBSCRIPTIONS
            .iter()
            .filter_map(|id| SubscriptionId::try_from(*id).ok())
            .collect()
    }

    fn make_request<C: RequestContext>(
        key: &SubscriptionId,
        _: &C,
    ) -> Result<Vec<RpcCall>, StadiaError> {
        Ok(vec![RpcCall::new("Z5yYme", vec![key.to_proto()])])
    }

    fn parse_response<C: RequestContext>(
        responses: &[Proto],
        key: &SubscriptionId,
        _: &C,
    ) -> Result<Unparsed, StadiaError> {
        info!(subscription_id = %key, response = %Proto::array(responses.to_vec()), "stadia: subscription response kept raw");
        Ok(Unparsed::default())
    }
}

pub struct PlayerProgressionTable;

impl TableDef for PlayerProgressionTable {
    const NAME: TableName = TableName::PlayerProgression;
    const CACHE_CONTROL: CacheControl = CacheControl::MaxAge(115_200);
    const COLUMNS: &'static [(&'static str, ColumnKind)] = &[];

    type Key = PlayerId;
    type Value = Unparsed;

    fn make_request<C: RequestContext>(
        key: &PlayerId,
        context: &C,
    ) -> Result<Vec<RpcCall>, StadiaError> {
        let player = context.get_dependency::<PlayerTable>(key)?;
        Ok(player
            .played_game_ids
            .unwrap_or_default()
            .iter()
            .map(|game_id| {
                RpcCall::new(
                    "e7h9qd",
                    vec![Proto::Null, game_id.to_proto(), key.to_proto()],
                )
            })
            .collect())
    }

    fn parse_response<C: RequestContext>(
        responses: &[Proto],
        key: &PlayerId,
        _: &C,
    ) -> Result<Unparsed, StadiaError> {
        info!(player_id = %key, games = responses.len(), "stadia: progression response kept raw");
        Ok(Unparsed::default())
    }
}

pub struct StoreListTable;

impl TableDef for StoreListTable {
    const NAME: TableName = TableName::StoreList;
    const CACHE_CONTROL: CacheControl = CacheControl::MaxAge(1_920);
    const COLUMNS: &'static [(&'static str, ColumnKind)] = &[];

    type Key = StoreListId;
    type Value = Vec<ListedSku>;

    fn seed_keys() -> Vec<StoreListId> {
        seed::STORE_LISTS
            .iter()
            .filter_map(|id| StoreListId::try_from(*id).ok())
            .collect()
    }

    fn make_request<C: RequestContext>(
        key: &StoreListId,
        _: &C,
    ) -> Result<Vec<RpcCall>, StadiaError> {
        let mut request = vec![Proto::Null; 5];
        request.push(key.to_proto());
        Ok(vec![RpcCall::new("ZAm7We", request)])
    }

    fn parse_response<C: RequestContext>(
        responses: &[Proto],
        _: &StoreListId,
        context: &C,
    ) -> Result<Vec<ListedSku>, StadiaError> {
        let listing = response(responses, 0);
        let mut entries = Vec::new();
        for (i, entry) in listing.at(0).items().iter().enumerate() {
            let sku_proto = entry.at(9);
            if sku_proto.is_null() {
                return Err(ParseError::invalid(&[0, 0, i, 9], "sku", sku_proto).into());
            }
            let sku = sku_from_proto(sku_proto)?;
            let listed = listed_sku(&sku, &[0, 0, i, 9, 4], sku_proto.at(4))?;
            discover_sku(context, &sku)?;
            entries.push(listed);
        }
        Ok(entries)
    }
}

/// Prefixes that narrow a search which hit the result cap.
pub fn search_refinements(prefix: &str) -> Vec<String> {
    const LETTERS_AND_DIGITS: &str = "abcdefghijklmnopqrstuvwxyz0123456789";
    const NONZERO_DIGITS: &str = "123456789";
    const MAX_NAME_LEN: usize = 15;
    const MAX_NUMBER_DIGITS: usize = 4;

    let mut suffixes: Vec<char> = Vec::new();
    match prefix.find('#') {
        Some(hash) => {
            let digits = prefix.len() - hash - 1;
            if digits < MAX_NUMBER_DIGITS {
                if digits > 0 {
                    suffixes.push('0');
                }
                suffixes.extend(NONZERO_DIGITS.chars());
            }
        }
        None => {
            if prefix.len() < MAX_NAME_LEN {
                suffixes.extend(LETTERS_AND_DIGITS.chars());
            }
            if prefix.len() >= 3 {
                suffixes.push('#');
            }
        }
    }
    suffixes
        .into_iter()
        .map(|suffix| format!("{prefix}{suffix}"))
        .collect()
}

/// Search results are capped at this many players.
pub const SEARCH_RESULT_CAP: usize = 100;

pub struct PlayerSearchTable;

impl TableDef for PlayerSearchTable {
    const NAME: TableName = TableName::PlayerSearch;
    const CACHE_CONTROL: CacheControl = CacheControl::MaxAge(5_529_600);
    const COLUMNS: &'static [(&'static str, ColumnKind)] = &[];

    type Key = GamertagPrefix;
    type Value = Vec<PlayerId>;

    fn seed_keys() -> Vec<GamertagPrefix> {
        seed::parse_all(&seed::player_searches())
    }

    fn make_request<C: RequestContext>(
        key: &GamertagPrefix,
        _: &C,
    ) -> Result<Vec<RpcCall>, StadiaError> {
        // The endpoint wants a space after the first character.
        let prefix = key.as_str();
        let (first, rest) = prefix.split_at(1);
        Ok(vec![RpcCall::new(
            "FdyJ0",
            vec![Proto::from(format!("{first} {rest}"))],
        )])
    }

    fn parse_response<C: RequestContext>(
        responses: &[Proto],
        key: &GamertagPrefix,
        context: &C,
    ) -> Result<Vec<PlayerId>, StadiaError> {
        let results = response(responses, 0).at(1).items();
        if results.is_empty() {
            debug!(prefix = %key, "stadia: no results for player search");
            return Ok(Vec::new());
        }

        let mut player_ids = Vec::with_capacity(results.len());
        for result in results {
            let player = shallow_player_from_proto(result.at(0))?;
            context.update::<PlayerTable>(&player.player_id, Some(&player), incomplete())?;
            player_ids.push(player.player_id);
        }
        debug!(prefix = %key, count = player_ids.len(), "stadia: player search results");

        if player_ids.len() >= SEARCH_RESULT_CAP {
            let refinements = search_refinements(key.as_str());
            if refinements.is_empty() {
                return Err(ParseError::Validation {
                    path: "[0][1]".to_string(),
                    expected: format!("fewer than {SEARCH_RESULT_CAP} results for a complete gamertag"),
                    found: format!("{} results for {key}", player_ids.len()),
                }
                .into());
            }
            for refinement in refinements {
                match GamertagPrefix::try_from(refinement) {
                    Ok(prefix) => {
                        context.update::<PlayerSearchTable>(&prefix, None, complete())?;
                    }
                    Err(err) => debug!(error = %err, "stadia: skipping unsearchable refinement"),
                }
            }
        }
        Ok(player_ids)
    }
}

pub struct MyGamesTable;

impl TableDef for MyGamesTable {
    const NAME: TableName = TableName::MyGames;
    const CACHE_CONTROL: CacheControl = CacheControl::NoStore;
    const COLUMNS: &'static [(&'static str, ColumnKind)] = &[];

    type Key = MyGamesKey;
    type Value = Vec<ListedSku>;

    fn seed_keys() -> Vec<MyGamesKey> {
        vec![MyGamesKey]
    }

    fn make_request<C: RequestContext>(_: &MyGamesKey, _: &C) -> Result<Vec<RpcCall>, StadiaError> {
        Ok(vec![RpcCall::bare("T2ZnGf")])
    }

    fn parse_response<C: RequestContext>(
        responses: &[Proto],
        _: &MyGamesKey,
        context: &C,
    ) -> Result<Vec<ListedSku>, StadiaError> {
        let mut owned = Vec::new();
        for (i, entry) in response(responses, 0).at(2).items().iter().enumerate() {
            let sku_proto = entry.at(1);
            let sku = sku_from_proto(sku_proto)?;
            let listed = listed_sku(&sku, &[0, 2, i, 1, 4], sku_proto.at(4))?;
            discover_sku(context, &sku)?;
            owned.push(listed);
        }
        Ok(owned)
    }
}

pub struct MyPurchasesTable;

impl TableDef for MyPurchasesTable {
    const NAME: TableName = TableName::MyPurchases;
    const CACHE_CONTROL: CacheControl = CacheControl::NoStore;
    const COLUMNS: &'static [(&'static str, ColumnKind)] = &[];

    type Key = MyPurchasesKey;
    type Value = Vec<SkuId>;

    fn seed_keys() -> Vec<MyPurchasesKey> {
        vec![MyPurchasesKey]
    }

    fn make_request<C: RequestContext>(
        _: &MyPurchasesKey,
        _: &C,
    ) -> Result<Vec<RpcCall>, StadiaError> {
        Ok(vec![RpcCall::bare("uwn0Ob")])
    }

    fn parse_response<C: RequestContext>(
        responses: &[Proto],
        _: &MyPurchasesKey,
        _: &C,
    ) -> Result<Vec<SkuId>, StadiaError> {
        info!(response = %Proto::array(responses.to_vec()), "stadia: unsupported purchases response");
        Err(ParseError::Unsupported { what: "MyPurchases" }.into())
    }
}

pub struct MyFriendsTable;

impl TableDef for MyFriendsTable {
    const NAME: TableName = TableName::MyFriends;
    const CACHE_CONTROL: CacheControl = CacheControl::NoStore;
    const COLUMNS: &'static [(&'static str, ColumnKind)] = &[];

    type Key = MyFriendsKey;
    type Value = FriendList;

    fn seed_keys() -> Vec<MyFriendsKey> {
        vec![MyFriendsKey]
    }

    fn make_request<C: RequestContext>(
        _: &MyFriendsKey,
        _: &C,
    ) -> Result<Vec<RpcCall>, StadiaError> {
        Ok(vec![RpcCall::bare("Z5HRnb")])
    }

    fn parse_response<C: RequestContext>(
        responses: &[Proto],
        _: &MyFriendsKey,
        context: &C,
    ) -> Result<FriendList, StadiaError> {
        let mut player_ids = Vec::new();
        for friend in response(responses, 0).at(0).items() {
            let friend = shallow_player_from_proto(friend)?;
            context.update::<PlayerTable>(&friend.player_id, Some(&friend), incomplete())?;
            player_ids.push(friend.player_id);
        }
        Ok(FriendList { player_ids })
    }
}

pub struct MyRecentPlayersTable;

impl TableDef for MyRecentPlayersTable {
    const NAME: TableName = TableName::MyRecentPlayers;
    const CACHE_CONTROL: CacheControl = CacheControl::NoStore;
    const COLUMNS: &'static [(&'static str, ColumnKind)] = &[];

    type Key = MyRecentPlayersKey;
    type Value = Vec<RecentPlayer>;

    fn seed_keys() -> Vec<MyRecentPlayersKey> {
        vec![MyRecentPlayersKey]
    }

    fn make_request<C: RequestContext>(
        _: &MyRecentPlayersKey,
        _: &C,
    ) -> Result<Vec<RpcCall>, StadiaError> {
        Ok(vec![RpcCall::bare("nsSFNb")])
    }

    fn parse_response<C: RequestContext>(
        responses: &[Proto],
        _: &MyRecentPlayersKey,
        _: &C,
    ) -> Result<Vec<RecentPlayer>, StadiaError> {
        info!(response = %Proto::array(responses.to_vec()), "stadia: unsupported recent players response");
        Err(ParseError::Unsupported {
            what: "MyRecentPlayers",
        }
        .into())
    }
}

pub struct CaptureTable;

impl TableDef for CaptureTable {
    const NAME: TableName = TableName::Capture;
    const CACHE_CONTROL: CacheControl = CacheControl::MaxAge(44_236_800);
    const COLUMNS: &'static [(&'static str, ColumnKind)] = &[
        ("gameId", ColumnKind::Indexed),
        ("timestamp", ColumnKind::Indexed),
    ];

    type Key = CaptureId;
    type Value = Capture;

    fn make_request<C: RequestContext>(key: &CaptureId, _: &C) -> Result<Vec<RpcCall>, StadiaError> {
        Ok(vec![RpcCall::new("g6aH1", vec![key.to_proto()])])
    }

    fn parse_response<C: RequestContext>(
        responses: &[Proto],
        key: &CaptureId,
        context: &C,
    ) -> Result<Capture, StadiaError> {
        let capture = capture_from_proto(response(responses, 0))?;
        if &capture.capture_id != key {
            return Err(StadiaError::KeyMismatch {
                table: Self::NAME,
                requested: key.to_string(),
                found: capture.capture_id.to_string(),
            });
        }
        context.update::<GameTable>(&capture.game_id, None, complete())?;
        Ok(capture)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::stadia::context::RecordingContext;
    use crate::database_ops::stadia::parsers::fixtures;
    use serde_json::json;

    fn proto(value: serde_json::Value) -> Proto {
        serde_json::from_value(value).unwrap()
    }

    fn wrap_sku(sku: &Proto) -> Proto {
        let mut entry = vec![Proto::Null; 9];
        entry.push(sku.clone());
        Proto::from(entry)
    }

    #[test]
    fn game_response_discovers_listed_skus_in_order() {
        let context = RecordingContext::new();
        let game = GameId::try_from("abc1rcp1").unwrap();
        let s1 = fixtures::sku("a1", "abc1rcp1", 1);
        let s2 = fixtures::sku("a2", "abc1rcp1", 2);
        let listing = Proto::array([Proto::array([wrap_sku(&s1), wrap_sku(&s2)])]);
        let details = Proto::array([
            Proto::Null,
            Proto::array([Proto::array([Proto::Null, wrap_sku(&s1)])]),
        ]);

        let value = GameTable::parse_response(&[listing, details], &game, &context).unwrap();

        let ids: Vec<_> = value.sku_ids.iter().map(|id| id.as_str()).collect();
        assert_eq!(ids, vec!["a1", "a2"]);
        assert_eq!(value.sku_id.as_str(), "a1");
        let written = context.written_keys(TableName::Sku);
        assert_eq!(written, vec!["a1", "a2"]);
    }

    #[test]
    fn game_without_listing_falls_back_to_its_own_sku() {
        let context = RecordingContext::new();
        let game = GameId::try_from("abc1rcp1").unwrap();
        let s1 = fixtures::sku("a1", "abc1rcp1", 1);
        let details = Proto::array([
            Proto::Null,
            Proto::array([Proto::array([Proto::Null, wrap_sku(&s1)])]),
        ]);

        let value =
            GameTable::parse_response(&[Proto::array([]), details], &game, &context).unwrap();
        assert_eq!(value.sku_ids.len(), 1);
    }

    #[test]
    fn game_response_for_another_game_is_rejected() {
        let context = RecordingContext::new();
        let game = GameId::try_from("ffffrcp1").unwrap();
        let s1 = fixtures::sku("a1", "abc1rcp1", 1);
        let details = Proto::array([
            Proto::Null,
            Proto::array([Proto::array([Proto::Null, wrap_sku(&s1)])]),
        ]);
        let err = GameTable::parse_response(&[Proto::array([]), details], &game, &context)
            .unwrap_err();
        assert!(matches!(err, StadiaError::KeyMismatch { .. }));
        assert!(context.written_keys(TableName::Sku).is_empty());
    }

    #[test]
    fn deleted_sku_has_no_content() {
        let context = RecordingContext::new();
        let key = SkuId::try_from("dead").unwrap();
        let sku = SkuTable::parse_response(&[Proto::Null], &key, &context).unwrap();
        assert_eq!(sku, Sku::deleted(key));
        let common = sku.common();
        assert!(common.name.is_none() && common.game_id.is_none() && common.description.is_none());
    }

    #[test]
    fn sku_answered_by_another_id_becomes_an_alias() {
        let context = RecordingContext::new();
        let key = SkuId::try_from("a0").unwrap();
        let mut detail = vec![Proto::Null; 16];
        detail.push(fixtures::sku("a1", "abc1rcp1", 1));

        let sku = SkuTable::parse_response(&[Proto::from(detail)], &key, &context).unwrap();
        match sku {
            Sku::Alias(alias) => assert_eq!(alias.target_sku_id.as_str(), "a1"),
            other => panic!("expected alias, got {other:?}"),
        }
        assert_eq!(context.written_keys(TableName::Sku), vec!["a1"]);
    }

    #[test]
    fn player_response_registers_friends_games_and_progression() {
        let context = RecordingContext::new();
        let key = PlayerId::try_from("1000001").unwrap();
        let mut profile = vec![Proto::Null; 5];
        profile.push(fixtures::player("1000001", "spiderfan", "1001"));
        let friends = Proto::array([Proto::array([fixtures::player("1234", "pal", "1000")])]);
        let games = proto(json!([["abc1rcp1", "abc2rcp1"]]));

        let player =
            PlayerTable::parse_response(&[Proto::from(profile), friends, games], &key, &context)
                .unwrap();

        assert_eq!(player.friend_player_ids.as_ref().unwrap()[0].as_str(), "1234");
        assert_eq!(player.played_game_ids.as_ref().unwrap().len(), 2);
        assert_eq!(context.written_keys(TableName::Game), vec!["abc1rcp1", "abc2rcp1"]);
        assert_eq!(context.written_keys(TableName::PlayerProgression), vec!["1000001"]);
        let writes = context.writes();
        let friend_write = writes
            .iter()
            .find(|w| w.table == TableName::Player)
            .unwrap();
        assert!(friend_write.options.incomplete);
        assert!(friend_write.has_value);
    }

    #[test]
    fn player_progression_needs_the_player() {
        let context = RecordingContext::new();
        let key = PlayerId::try_from("1000001").unwrap();
        assert!(matches!(
            PlayerProgressionTable::make_request(&key, &context),
            Err(StadiaError::DependencyMissing { .. })
        ));

        let player = Player {
            played_game_ids: Some(vec![GameId::try_from("abc1rcp1").unwrap()]),
            ..shallow_player_from_proto(&fixtures::player("1000001", "spiderfan", "1001")).unwrap()
        };
        context.insert::<PlayerTable>(&key, &player);
        let calls = PlayerProgressionTable::make_request(&key, &context).unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].method, "e7h9qd");
        assert_eq!(
            calls[0].request_or_empty().to_json_string(),
            r#"[null,"abc1rcp1","1000001"]"#
        );
    }

    #[test]
    fn store_list_registers_skus_and_games() {
        let context = RecordingContext::new();
        let listing = Proto::array([Proto::array([
            wrap_sku(&fixtures::sku("a1", "abc1rcp1", 1)),
            wrap_sku(&fixtures::sku("a2", "abc2rcp1", 3)),
        ])]);
        let key = StoreListId::try_from(3u64).unwrap();
        let entries = StoreListTable::parse_response(&[listing], &key, &context).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].game_id.as_str(), "abc2rcp1");
        assert_eq!(context.written_keys(TableName::Sku), vec!["a1", "a2"]);
        assert_eq!(context.written_keys(TableName::Game), vec!["abc1rcp1", "abc2rcp1"]);
    }

    #[test]
    fn search_requests_split_the_first_character() {
        let context = RecordingContext::new();
        let key = GamertagPrefix::try_from("spider").unwrap();
        let calls = PlayerSearchTable::make_request(&key, &context).unwrap();
        assert_eq!(calls[0].request_or_empty().to_json_string(), r#"["s pider"]"#);
    }

    #[test]
    fn full_search_registers_refinements() {
        let context = RecordingContext::new();
        let key = GamertagPrefix::try_from("abc#12").unwrap();
        let results: Vec<Proto> = (0..100)
            .map(|i| {
                Proto::array([fixtures::player(&format!("{}", 10_000 + i), "abcdef", "1200")])
            })
            .collect();
        let response = Proto::array([Proto::Null, Proto::from(results)]);

        let ids = PlayerSearchTable::parse_response(&[response], &key, &context).unwrap();
        assert_eq!(ids.len(), 100);
        let refinements = context.written_keys(TableName::PlayerSearch);
        assert_eq!(refinements.len(), 10);
        assert_eq!(refinements[0], "abc#120");
        assert_eq!(refinements[9], "abc#129");
    }

    #[test]
    fn refinements_follow_prefix_shape() {
        assert_eq!(search_refinements("ab").len(), 36);
        assert_eq!(search_refinements("abc").len(), 37);
        assert_eq!(search_refinements("abc").last().unwrap(), "abc#");
        assert_eq!(search_refinements("abc#").len(), 9);
        assert!(search_refinements("abc#1234").is_empty());
        assert!(search_refinements("abcdefghijklmno#1234").is_empty());
        assert_eq!(search_refinements("abcdefghijklmno"), vec!["abcdefghijklmno#"]);
    }

    #[test]
    fn unsupported_singletons_fail_locally() {
        let context = RecordingContext::new();
        let err = MyPurchasesTable::parse_response(&[Proto::Null], &MyPurchasesKey, &context)
            .unwrap_err();
        assert!(err.is_record_local());
    }

    #[test]
    fn record_json_uses_underscored_bookkeeping_fields() {
        let record: Record<StoreListId, Vec<ListedSku>> = Record {
            last_updated_timestamp: Some(5),
            ..Record::stub(StoreListId::try_from(9u64).unwrap())
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value, json!({"key": 9, "_lastUpdatedTimestamp": 5}));
        assert_eq!(
            column_specs::<SkuTable>()
                .iter()
                .map(|c| c.path.as_str())
                .take(2)
                .collect::<Vec<_>>(),
            vec!["value.gameId", "value.skuType"]
        );
        assert_eq!(CacheControl::NoStore.to_string(), "no-store,max-age=0");
        assert_eq!("storelist".parse::<TableName>().unwrap(), TableName::StoreList);
    }

    #[test]
    fn stub_documents_load_without_a_value() {
        let record: Record<SkuId, Sku> = serde_json::from_str(r#"{"key": "a1"}"#).unwrap();
        assert!(record.value.is_none());
        assert!(record.validate().is_ok());
        assert_eq!(record, Record::stub(SkuId::try_from("a1").unwrap()));
    }
}
