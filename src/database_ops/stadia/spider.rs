//! The crawl loop: refresh the stalest record, follow what its response
//! reveals, repeat.

use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Utc;
use rand::Rng;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::batch::{method_ids, RpcCall};
use super::context::{DatabaseRequestContext, RequestContext};
use super::database::{StadiaDatabase, TableRecord};
use super::provider::StadiaClient;
use super::tables::{with_table, Record, TableDef, TableName};
use super::StadiaError;
use crate::util::env::{env_list, env_parse};
use crate::util::proto::Proto;

const DEFAULT_TABLES: [TableName; 3] = [TableName::Game, TableName::Sku, TableName::StoreList];

#[derive(Debug, Clone)]
pub struct SpiderOptions {
    /// Floor applied to every table's max-age.
    pub min_max_age: Duration,
    /// Sleep when nothing is stale.
    pub idle_delay: Duration,
    /// Upper bound of the random sleep after a record fails to parse.
    pub error_delay: Duration,
    pub tables: Vec<TableName>,
}

impl Default for SpiderOptions {
    fn default() -> Self {
        Self {
            min_max_age: Duration::from_secs(7 * 24 * 60 * 60),
            idle_delay: Duration::from_secs(960),
            error_delay: Duration::from_secs(60),
            tables: DEFAULT_TABLES.to_vec(),
        }
    }
}

impl SpiderOptions {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let tables = match env_list("SPIDER_TABLES") {
            Some(names) => names
                .iter()
                .map(|name| name.parse::<TableName>().map_err(|err| anyhow!(err)))
                .collect::<Result<Vec<_>>>()?,
            None => defaults.tables,
        };
        Ok(Self {
            min_max_age: Duration::from_secs(env_parse(
                "SPIDER_MIN_MAX_AGE_SECS",
                defaults.min_max_age.as_secs(),
            )),
            idle_delay: Duration::from_secs(env_parse(
                "SPIDER_IDLE_DELAY_SECS",
                defaults.idle_delay.as_secs(),
            )),
            error_delay: Duration::from_secs(env_parse(
                "SPIDER_ERROR_DELAY_SECS",
                defaults.error_delay.as_secs(),
            )),
            tables,
        })
    }
}

#[derive(Debug)]
pub enum StepOutcome {
    /// Every record of the configured tables is fresh.
    Idle,
    Fetched { table: TableName, key: String },
    /// The record's response could not be used; its attempt was still recorded.
    RecordError {
        table: TableName,
        key: String,
        error: StadiaError,
    },
}

pub struct Spider {
    client: StadiaClient,
    db: StadiaDatabase,
    options: SpiderOptions,
}

impl Spider {
    pub fn new(client: StadiaClient, db: StadiaDatabase, options: SpiderOptions) -> Self {
        Self {
            client,
            db,
            options,
        }
    }

    pub fn client(&self) -> &StadiaClient {
        &self.client
    }

    pub fn database(&self) -> &StadiaDatabase {
        &self.db
    }

    pub fn options(&self) -> &SpiderOptions {
        &self.options
    }

    fn max_age_ms<T: TableDef>(&self) -> i64 {
        let secs = T::CACHE_CONTROL
            .max_age_secs()
            .max(self.options.min_max_age.as_secs());
        i64::try_from(secs.saturating_mul(1000)).unwrap_or(i64::MAX)
    }

    /// The attempt timestamp of `T`'s stalest record, if that record is due.
    fn due_attempt<T: TableDef>(&self, now: i64) -> Result<Option<Option<i64>>, StadiaError> {
        let Some(record) = self.db.stalest::<T>()? else {
            return Ok(None);
        };
        let attempted = record.last_update_attempted_timestamp;
        let due = match attempted {
            None => true,
            Some(at) => at.saturating_add(self.max_age_ms::<T>()) < now,
        };
        Ok(due.then_some(attempted))
    }

    /// Refresh the single stalest due record across the configured tables.
    pub async fn step(&self) -> Result<StepOutcome, StadiaError> {
        let now = Utc::now().timestamp_millis();
        let mut stalest: Option<(TableName, Option<i64>)> = None;
        for &name in &self.options.tables {
            let due = with_table!(name, T => self.due_attempt::<T>(now)?);
            if let Some(attempted) = due {
                if stalest.map_or(true, |(_, best)| attempted < best) {
                    stalest = Some((name, attempted));
                }
            }
        }
        let Some((name, _)) = stalest else {
            return Ok(StepOutcome::Idle);
        };
        with_table!(name, T => self.refresh_stalest::<T>().await)
    }

    async fn refresh_stalest<T: TableDef>(&self) -> Result<StepOutcome, StadiaError> {
        let Some(record) = self.db.stalest::<T>()? else {
            return Ok(StepOutcome::Idle);
        };
        let key = record.key;
        match self.fetch_record::<T>(&key).await {
            Ok(_) => Ok(StepOutcome::Fetched {
                table: T::NAME,
                key: key.to_string(),
            }),
            Err(error) if error.is_record_local() => {
                warn!(table = %T::NAME, %key, %error, "stadia: skipping record");
                Ok(StepOutcome::RecordError {
                    table: T::NAME,
                    key: key.to_string(),
                    error,
                })
            }
            Err(error) => Err(error),
        }
    }

    fn stamp_attempt<T: TableDef>(&self, key: &T::Key, timestamp: i64) -> Result<(), StadiaError> {
        let record = self
            .db
            .record::<T>(key)?
            .unwrap_or_else(|| Record::stub(key.clone()));
        self.db.table::<T>()?.update(&Record {
            last_update_attempted_timestamp: Some(timestamp),
            ..record
        })?;
        Ok(())
    }

    /// Fetch one record now, regardless of freshness, and write everything its
    /// response reveals. The attempt is recorded even when parsing fails.
    pub async fn fetch_record<T: TableDef>(
        &self,
        key: &T::Key,
    ) -> Result<TableRecord<T>, StadiaError> {
        let context = DatabaseRequestContext::new(&self.db);
        self.stamp_attempt::<T>(key, context.request_timestamp())?;

        let calls = T::make_request(key, &context)?;
        debug!(table = %T::NAME, %key, rpc_ids = %method_ids(&calls), "stadia: fetching record");
        let responses = self.client.fetch_batch(&calls).await?;
        let request = request_log(&calls);
        let response = Proto::array(responses.iter().cloned());

        self.db.database().savepoint("fetch", || {
            let value = T::parse_response(&responses, key, &context).map_err(|error| {
                if error.is_record_local() {
                    warn!(table = %T::NAME, %key, %error, response = %response, "stadia: unusable response");
                }
                error
            })?;

            let mut record = self
                .db
                .record::<T>(key)?
                .unwrap_or_else(|| Record::stub(key.clone()));
            record.value = Some(value);
            if T::CACHE_CONTROL.is_cacheable() {
                record.last_updated_timestamp = Some(context.request_timestamp());
                record.request = Some(request);
                record.response = Some(response.clone());
                self.db.table::<T>()?.update(&record)?;
                info!(table = %T::NAME, %key, "stadia: record updated");
            } else {
                info!(table = %T::NAME, %key, cache_control = %T::CACHE_CONTROL, "stadia: not caching record");
            }
            Ok::<_, StadiaError>(record)
        })
    }

    /// Step until `cancel` becomes true. Record-level failures are logged and
    /// skipped; anything else stops the loop and is returned.
    pub async fn run(&self, mut cancel: watch::Receiver<bool>) -> Result<(), StadiaError> {
        info!(tables = ?self.options.tables, "stadia: spider started");
        while !*cancel.borrow() {
            let delay = match self.step().await? {
                StepOutcome::Idle => {
                    info!(delay = ?self.options.idle_delay, "stadia: nothing stale; sleeping");
                    Some(self.options.idle_delay)
                }
                StepOutcome::Fetched { .. } => None,
                StepOutcome::RecordError { .. } => Some(self.error_delay()),
            };
            if let Some(delay) = delay {
                tokio::select! {
                    _ = sleep(delay) => {}
                    changed = cancel.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        info!("stadia: spider stopped");
        Ok(())
    }

    fn error_delay(&self) -> Duration {
        let max_ms = u64::try_from(self.options.error_delay.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}

/// `[[method, request], ...]` as stored in `_request`.
fn request_log(calls: &[RpcCall]) -> Proto {
    Proto::array(calls.iter().map(|call| {
        Proto::array([Proto::from(call.method.as_str()), Proto::from(call.request.clone())])
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::stadia::batch::wire;
    use crate::database_ops::stadia::parsers::fixtures;
    use crate::database_ops::stadia::provider::test_server::{serve, Recorded};
    use crate::database_ops::stadia::provider::ClientConfig;
    use crate::database_ops::stadia::scalars::{GameId, MyGamesKey, PlayerId, SkuId};
    use crate::database_ops::stadia::session::{pages, GoogleCookies, GoogleSession};
    use crate::database_ops::stadia::tables::{
        GameTable, MyGamesTable, PlayerProgressionTable, PlayerTable, SkuTable,
    };
    use serde_json::{json, Value};

    fn sku_json(sku_id: &str, game_id: &str) -> Value {
        serde_json::to_value(fixtures::sku(sku_id, game_id, 1)).unwrap()
    }

    fn listed(sku: Value) -> Value {
        let mut entry = vec![Value::Null; 9];
        entry.push(sku);
        Value::Array(entry)
    }

    /// Answers the settings page and every batch call via `payload(method)`.
    fn responder(
        payload: impl Fn(&str) -> Value + Send + Sync + 'static,
    ) -> impl Fn(&Recorded) -> (u16, String) + Send + Sync + 'static {
        move |request: &Recorded| {
            if request.target.starts_with("/settings") {
                return (200, pages::settings_page());
            }
            let f_req = url::form_urlencoded::parse(request.body.as_bytes())
                .find(|(k, _)| k == "f.req")
                .map(|(_, v)| v.into_owned())
                .unwrap_or_default();
            let calls: Value = serde_json::from_str(&f_req).unwrap();
            let envelopes: Vec<Value> = calls[0]
                .as_array()
                .unwrap()
                .iter()
                .map(|call| {
                    let method = call[0].as_str().unwrap();
                    let index: usize = call[3].as_str().unwrap().parse().unwrap();
                    wire::envelope(method, &payload(method), index)
                })
                .collect();
            (200, wire::response_body(&envelopes))
        }
    }

    fn game_payload(details_game: &'static str) -> impl Fn(&str) -> Value + Send + Sync + 'static {
        move |method| match method {
            "ZAm7We" => json!([[
                listed(sku_json("a1", "abc1rcp1")),
                listed(sku_json("a2", "abc1rcp1"))
            ]]),
            "LrvzJb" => json!([null, [[null, listed(sku_json("a1", details_game))]]]),
            "T2ZnGf" => json!([null, null, [[null, sku_json("b1", "bbbbrcp1")]]]),
            _ => Value::Null,
        }
    }

    async fn spider(
        payload: impl Fn(&str) -> Value + Send + Sync + 'static,
        tables: Vec<TableName>,
    ) -> (Spider, crate::database_ops::stadia::provider::test_server::Log) {
        let (addr, log) = serve(responder(payload)).await;
        let session = GoogleSession {
            google_id: "100000000000000000001".into(),
            cookies: GoogleCookies::new("sid", "ssid", "hsid"),
        };
        let config = ClientConfig {
            base_url: format!("http://{addr}/"),
            request_interval: Duration::ZERO,
            ..ClientConfig::default()
        };
        let client = StadiaClient::new(session, config).unwrap();
        let options = SpiderOptions {
            tables,
            idle_delay: Duration::from_secs(3600),
            error_delay: Duration::from_millis(1),
            ..SpiderOptions::default()
        };
        let db = StadiaDatabase::open_in_memory().unwrap();
        (Spider::new(client, db, options), log)
    }

    fn game_key() -> GameId {
        GameId::try_from("abc1rcp1").unwrap()
    }

    #[tokio::test]
    async fn step_refreshes_stale_game_and_discovers_skus() {
        let (spider, _log) = spider(game_payload("abc1rcp1"), vec![TableName::Game]).await;
        let games = spider.database().table::<GameTable>().unwrap();
        games.insert(&Record::stub(game_key())).unwrap();

        let outcome = spider.step().await.unwrap();
        assert!(matches!(outcome, StepOutcome::Fetched { table: TableName::Game, .. }));

        let game = spider.database().record::<GameTable>(&game_key()).unwrap().unwrap();
        let value = game.value.unwrap();
        assert_eq!(value.sku_ids.len(), 2);
        assert!(game.last_updated_timestamp.is_some());
        assert_eq!(game.last_update_attempted_timestamp, game.last_updated_timestamp);
        let request = game.request.unwrap();
        assert_eq!(request.path(&[0, 0]).as_str(), Some("ZAm7We"));
        assert_eq!(request.path(&[1, 0]).as_str(), Some("LrvzJb"));
        assert_eq!(game.response.unwrap().items().len(), 2);

        for sku in ["a1", "a2"] {
            let sku = spider
                .database()
                .record::<SkuTable>(&SkuId::try_from(sku).unwrap())
                .unwrap()
                .unwrap();
            assert!(sku.value.is_some());
        }

        assert!(matches!(spider.step().await.unwrap(), StepOutcome::Idle));
    }

    #[tokio::test]
    async fn unusable_response_is_skipped_but_attempted() {
        let (spider, _log) = spider(game_payload("ffffrcp1"), vec![TableName::Game]).await;
        let games = spider.database().table::<GameTable>().unwrap();
        games.insert(&Record::stub(game_key())).unwrap();

        let outcome = spider.step().await.unwrap();
        assert!(matches!(outcome, StepOutcome::RecordError { .. }));

        let game = spider.database().record::<GameTable>(&game_key()).unwrap().unwrap();
        assert!(game.value.is_none());
        assert!(game.last_updated_timestamp.is_none());
        assert!(game.last_update_attempted_timestamp.is_some());
        assert_eq!(spider.database().table::<SkuTable>().unwrap().count(None).unwrap(), 0);
        assert!(matches!(spider.step().await.unwrap(), StepOutcome::Idle));
    }

    #[tokio::test]
    async fn no_store_records_cascade_without_caching_their_value() {
        let (spider, log) = spider(game_payload("abc1rcp1"), vec![TableName::MyGames]).await;

        let record = spider.fetch_record::<MyGamesTable>(&MyGamesKey).await.unwrap();
        assert_eq!(record.value.unwrap().len(), 1);

        let stored = spider
            .database()
            .record::<MyGamesTable>(&MyGamesKey)
            .unwrap()
            .unwrap();
        assert!(stored.value.is_none());
        assert!(stored.last_update_attempted_timestamp.is_some());
        let sku = spider
            .database()
            .record::<SkuTable>(&SkuId::try_from("b1").unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(sku.value.unwrap().game_id().unwrap().as_str(), "bbbbrcp1");
        assert!(spider
            .database()
            .record::<GameTable>(&GameId::try_from("bbbbrcp1").unwrap())
            .unwrap()
            .is_some());
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn run_stops_when_cancelled() {
        let (spider, log) = spider(game_payload("abc1rcp1"), vec![TableName::Game]).await;
        let (cancel, cancelled) = watch::channel(false);

        let stop = async {
            sleep(Duration::from_millis(50)).await;
            cancel.send(true).unwrap();
        };
        let (result, ()) = tokio::join!(spider.run(cancelled), stop);

        result.unwrap();
        assert!(log.lock().unwrap().is_empty(), "an empty database needs no requests");
    }

    #[tokio::test]
    async fn freshness_uses_the_larger_max_age() {
        use crate::database_ops::stadia::tables::{CaptureTable, StoreListTable};
        let (spider, _log) = spider(game_payload("abc1rcp1"), DEFAULT_TABLES.to_vec()).await;
        let week_ms = 7 * 24 * 60 * 60 * 1000;
        assert_eq!(spider.max_age_ms::<StoreListTable>(), week_ms);
        assert_eq!(spider.max_age_ms::<MyGamesTable>(), week_ms);
        assert_eq!(spider.max_age_ms::<CaptureTable>(), 44_236_800 * 1000);
    }

    #[tokio::test]
    async fn seeded_database_fetches_players_before_their_progression() {
        let seeded_player = crate::database_ops::stadia::seed::PLAYERS[0];
        let payload = move |method: &str| match method {
            "D0Amud" => {
                let player = fixtures::player(seeded_player, "spiderfan", "1001");
                json!([null, null, null, null, null, serde_json::to_value(player).unwrap()])
            }
            _ => Value::Null,
        };
        let (spider, _log) =
            spider(payload, vec![TableName::PlayerProgression, TableName::Player]).await;
        spider.database().seed(None).unwrap();
        let progressions = spider.database().table::<PlayerProgressionTable>().unwrap();
        assert_eq!(progressions.count(None).unwrap(), 0);

        let outcome = spider.step().await.unwrap();
        assert!(matches!(outcome, StepOutcome::Fetched { table: TableName::Player, .. }));

        let key = PlayerId::try_from(seeded_player).unwrap();
        assert!(spider.database().record::<PlayerTable>(&key).unwrap().unwrap().value.is_some());
        assert_eq!(progressions.count(None).unwrap(), 1);
        let progression = spider.fetch_record::<PlayerProgressionTable>(&key).await.unwrap();
        assert!(progression.value.is_some());
    }
}
