//! Satbridge - value bridge between Hive and a Lightning node

use clap::Parser;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use satbridge::config::Args;
use satbridge::db::schemas::{
    BlockMarker, ErrorCodeDoc, LedgerEntry, LightningCursor, PendingRebalance, RatePoint,
    RebalanceResultDoc, TrackedOp, BLOCK_MARKERS_COLLECTION, ERROR_CODES_COLLECTION,
    LEDGER_COLLECTION, PENDING_REBALANCES_COLLECTION, RATES_COLLECTION,
    REBALANCE_RESULTS_COLLECTION, TRACKED_OPS_COLLECTION, WATCH_CURSORS_COLLECTION,
};
use satbridge::db::MongoClient;
use satbridge::engine::policy::AccountMetadataFetcher;
use satbridge::engine::{
    BridgeAccounts, ConversionEngine, FixedQuote, PolicyStore, QuoteSource, RebalanceSink,
};
use satbridge::money::MarketQuote;
use satbridge::hive::{HiveRpc, HiveWatcher, OpFilter, SigningServiceWallet};
use satbridge::ledger::{BalanceCache, Ledger};
use satbridge::lightning::{LightningWatcher, LndRest};
use satbridge::logging;
use satbridge::logging::error_codes::ErrorCodeRegistry;
use satbridge::notify::{NotificationDispatcher, NotificationTransport, TelegramBot};
use satbridge::rebalance::{BinanceSpot, Rebalancer};
use satbridge::router::{run_journal_writer, Router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    if let Err(e) = args.validate() {
        eprintln!("Configuration error: {e}");
        std::process::exit(1);
    }

    // Notification transports exist before logging so the notify layer
    // can capture startup problems
    let mut transports: Vec<Arc<dyn NotificationTransport>> = Vec::new();
    if let (Some(token), Some(chat_id)) = (&args.telegram_bot_token, args.telegram_chat_id) {
        match TelegramBot::new("telegram", token, chat_id) {
            Ok(bot) => transports.push(Arc::new(bot)),
            Err(e) => eprintln!("Telegram transport unavailable: {e}"),
        }
    }
    let dispatcher = NotificationDispatcher::new(transports, args.silenced_components());
    // The runtime is live inside tokio::main: re-point the dispatcher at
    // it immediately so nothing ever falls back to a blocking path
    dispatcher.bind_runtime(&tokio::runtime::Handle::current());

    let error_codes = ErrorCodeRegistry::new(
        &args.node_id.to_string(),
        std::time::Duration::from_secs(args.error_realert_secs),
    );
    logging::init(
        &args.log_level,
        Some(dispatcher.clone()),
        Some(error_codes.clone()),
    );

    info!("======================================");
    info!("  Satbridge - Hive <-> Lightning");
    info!("======================================");
    info!("Node ID: {}", args.node_id);
    info!("Mode: {}", if args.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" });
    info!("Message prefix: {}", args.message_prefix());
    info!("Hive API: {}", args.hive_api_url);
    info!("Server account: {}", args.hive_server_account);
    info!("LND REST: {}", args.lnd_rest_url);
    info!("MongoDB: {}", args.mongodb_uri);
    info!("Exchange: {}", args.exchange_name);
    info!("======================================");

    // MongoDB is the single point of serialization; no store, no bridge
    let mongo =
        match MongoClient::new(&args.mongodb_uri, &args.mongodb_db, args.store_timeout()).await {
        Ok(client) => client,
        Err(e) => {
            error!("MongoDB connection failed: {e}");
            std::process::exit(1);
        }
    };

    // Redis is optional: the cache degrades to direct ledger reads
    let cache = match &args.redis_url {
        Some(url) => match BalanceCache::connect(url).await {
            Ok(cache) => {
                info!("Redis balance cache connected");
                Some(cache)
            }
            Err(e) => {
                warn!("Redis unavailable, balances read from the ledger: {e}");
                None
            }
        },
        None => None,
    };

    // Collections (indexes applied on open)
    let journal = mongo.collection::<TrackedOp>(TRACKED_OPS_COLLECTION).await?;
    let ledger_coll = mongo.collection::<LedgerEntry>(LEDGER_COLLECTION).await?;
    let markers = mongo.collection::<BlockMarker>(BLOCK_MARKERS_COLLECTION).await?;
    let cursors = mongo
        .collection::<LightningCursor>(WATCH_CURSORS_COLLECTION)
        .await?;
    let pending = mongo
        .collection::<PendingRebalance>(PENDING_REBALANCES_COLLECTION)
        .await?;
    let rebalance_results = mongo
        .collection::<RebalanceResultDoc>(REBALANCE_RESULTS_COLLECTION)
        .await?;
    let error_code_coll = mongo.collection::<ErrorCodeDoc>(ERROR_CODES_COLLECTION).await?;
    error_codes.attach_store(error_code_coll);

    let ledger = Arc::new(Ledger::new(ledger_coll, journal.clone(), cache));
    ledger.log_totals().await?;

    // External collaborators
    let hive_rpc = HiveRpc::new(&args.hive_api_url)?;
    let node = Arc::new(LndRest::new(&args.lnd_rest_url, &args.lnd_macaroon_hex)?);
    let wallet: Option<Arc<dyn satbridge::hive::HiveWallet>> = match &args.hive_wallet_url {
        Some(url) => Some(Arc::new(SigningServiceWallet::new(url)?)),
        None => {
            warn!("No wallet URL configured; outbound broadcasts disabled");
            None
        }
    };

    let policy = Arc::new(PolicyStore::new(Arc::new(AccountMetadataFetcher::new(
        hive_rpc.clone(),
        args.policy_account(),
    ))));

    // The exchange adapter doubles as the market quote source
    let exchange = match (&args.exchange_api_key, &args.exchange_api_secret) {
        (Some(key), Some(secret)) => {
            Some(Arc::new(BinanceSpot::new(&args.exchange_api_url, key, secret)?))
        }
        _ => {
            warn!("Exchange keys not configured; rebalancer disabled");
            None
        }
    };
    let quotes: Arc<dyn QuoteSource> = match exchange.clone() {
        Some(adapter) => adapter,
        None if args.dev_mode => {
            warn!("Dev mode without exchange access; using a fixed market quote");
            Arc::new(FixedQuote(MarketQuote {
                sats_per_hive: 200.0,
                sats_per_hbd: 700.0,
                usd_per_hive: 0.25,
                usd_per_hbd: 1.0,
                fetched_at: chrono::Utc::now(),
                source: "fixed".to_string(),
            }))
        }
        None => {
            error!("A market quote source is required; configure exchange API access");
            std::process::exit(1);
        }
    };

    let rebalancer: Option<Arc<dyn RebalanceSink>> = exchange.clone().map(|adapter| {
        Arc::new(Rebalancer::new(
            pending,
            rebalance_results,
            ledger.clone(),
            adapter as Arc<dyn satbridge::rebalance::ExchangeAdapter>,
            "HIVE",
            &args.exchange_quote_asset,
        )) as Arc<dyn RebalanceSink>
    });

    // Rate time series: persist the market quote on a fixed cadence so
    // historical entries can be valued near their timestamps
    let rates = mongo.collection::<RatePoint>(RATES_COLLECTION).await?;
    {
        let quotes = quotes.clone();
        tokio::spawn(async move {
            loop {
                match quotes.market_quote().await {
                    Ok(q) => {
                        let hive = RatePoint::new("HIVEBTC", q.sats_per_hive / 1e8, &q.source);
                        let hbd = RatePoint::new("HBDBTC", q.sats_per_hbd / 1e8, &q.source);
                        for point in [hive, hbd] {
                            if let Err(e) = rates.insert_one(point).await {
                                warn!("Rate point save failed: {e}");
                            }
                        }
                    }
                    Err(e) => warn!("Market quote fetch failed: {e}"),
                }
                tokio::time::sleep(std::time::Duration::from_secs(300)).await;
            }
        });
    }

    let engine = Arc::new(ConversionEngine::new(
        ledger.clone(),
        policy,
        node.clone(),
        wallet,
        quotes,
        rebalancer,
        BridgeAccounts::from_args(&args),
        args.dev_mode,
        args.dev_allowlist(),
        args.blocked_accounts(),
    ));

    // Watchers feed the journal writer over a bounded channel; the
    // router consumes the journal itself
    let (op_tx, op_rx) = mpsc::channel::<TrackedOp>(1024);
    tokio::spawn(run_journal_writer(journal.clone(), op_rx));

    let mut filter = OpFilter::default();
    filter.accounts = args.watched_accounts().into_iter().collect();
    filter.message_ids = args.tracked_message_ids().into_iter().collect();
    filter.witness = args.watched_witness.clone();

    let hive_watcher = HiveWatcher::new(
        Arc::new(hive_rpc),
        Arc::new(markers),
        filter,
        args.hive_start_block,
        op_tx.clone(),
    );
    tokio::spawn(async move {
        loop {
            match hive_watcher.run().await {
                Ok(()) => break,
                Err(e) => {
                    error!(
                        notify = true,
                        error_code = "hive_watcher_desync",
                        "Hive watcher out of sync, restarting from marker: {e}"
                    );
                    tokio::time::sleep(std::time::Duration::from_secs(10)).await;
                }
            }
        }
    });

    let ln_watcher = Arc::new(LightningWatcher::new(
        node,
        Arc::new(cursors),
        &args.ln_node_name,
        op_tx,
    ));
    if let Err(e) = ln_watcher.start().await {
        error!("Lightning watcher failed to start: {e}");
        std::process::exit(1);
    }

    let router = Router::new(journal, engine);
    tokio::spawn(async move { router.run().await });

    info!(notify = true, "Satbridge started");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    Ok(())
}
