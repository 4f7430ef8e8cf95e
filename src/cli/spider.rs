//! Commands that talk to the service: the crawl loop, one-off record fetches,
//! raw RPCs and the capture listing.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::info;

use crate::database_ops::stadia::context::{DatabaseRequestContext, RequestContext, UpdateOptions};
use crate::database_ops::stadia::seed::SeedFile;
use crate::database_ops::stadia::tables::{with_table, CaptureTable, GameTable};
use crate::database_ops::stadia::{
    ClientConfig, EnvSessionSource, SessionSource, Spider, SpiderOptions, StadiaClient,
    StadiaDatabase, StadiaError, TableName,
};
use crate::util::env::env_opt;
use crate::util::proto::Proto;

#[derive(Debug, Clone, Default)]
pub struct SpiderConfig {
    pub sqlite: Option<String>,
    /// Extra seed keys; falls back to `STADIA_SEED_FILE`.
    pub seed_file: Option<PathBuf>,
}

impl SpiderConfig {
    fn open_database(&self) -> Result<StadiaDatabase> {
        match self.sqlite.as_deref() {
            Some(path) => StadiaDatabase::open(path),
            None => StadiaDatabase::from_env(),
        }
        .context("opening spider database")
    }

    fn seed_file(&self) -> Result<Option<SeedFile>> {
        self.seed_file
            .clone()
            .or_else(|| env_opt("STADIA_SEED_FILE").map(PathBuf::from))
            .map(SeedFile::load)
            .transpose()
    }
}

/// A client for the first signed-in session found in the environment.
pub fn open_client() -> Result<StadiaClient> {
    let session = EnvSessionSource
        .discover_sessions()
        .context("discovering google session")?
        .into_iter()
        .next()
        .context("no signed-in google session found")?;
    info!(google_id = %session.google_id, "stadia: using session");
    StadiaClient::new(session, ClientConfig::from_env()).context("building stadia client")
}

/// Seed the database and crawl until ctrl-c.
pub async fn run(cfg: SpiderConfig) -> Result<()> {
    let db = cfg.open_database()?;
    let seed = cfg.seed_file()?;
    db.seed(seed.as_ref()).context("seeding database")?;

    let spider = Spider::new(open_client()?, db, SpiderOptions::from_env()?);
    let (cancel, cancelled) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested; finishing current step");
            let _ = cancel.send(true);
        }
    });
    spider.run(cancelled).await?;
    Ok(())
}

/// Fetch one record now and print the stored document.
pub async fn fetch(cfg: SpiderConfig, table: TableName, key: &str) -> Result<()> {
    let spider = Spider::new(open_client()?, cfg.open_database()?, SpiderOptions::default());
    let json = with_table!(table, T => {
        let key: <T as TableDef>::Key = key
            .parse()
            .with_context(|| format!("invalid {} key {key:?}", T::NAME))?;
        let record = spider.fetch_record::<T>(&key).await?;
        serde_json::to_string_pretty(&record)?
    });
    println!("{json}");
    Ok(())
}

/// Call one RPC method with a JSON request (default `[]`) and print the response.
pub async fn rpc(method: &str, request: Option<&str>) -> Result<()> {
    let request = match request {
        Some(text) => Proto::from_json_str(text).context("request is not valid JSON")?,
        None => Proto::array(Vec::<Proto>::new()),
    };
    let response = open_client()?.fetch_rpc(method, request).await?;
    println!("{}", response.to_json_string());
    Ok(())
}

/// List every capture on the account, print them, and record them in the cache.
pub async fn captures(cfg: SpiderConfig) -> Result<()> {
    let captures = open_client()?.fetch_captures().await?;
    let db = cfg.open_database()?;
    let context = DatabaseRequestContext::new(&db);
    let written = db.database().savepoint("captures", || {
        let mut written = 0usize;
        for capture in &captures {
            if context.update::<CaptureTable>(
                &capture.capture_id,
                Some(capture),
                UpdateOptions::default(),
            )? {
                written += 1;
            }
            context.update::<GameTable>(&capture.game_id, None, UpdateOptions::default())?;
        }
        Ok::<_, StadiaError>(written)
    })?;
    for capture in &captures {
        println!("{}", serde_json::to_string(capture)?);
    }
    info!(count = captures.len(), written, "stadia: captures listed");
    Ok(())
}
