use anyhow::{Context, Result};
use std::{path::PathBuf, sync::Arc};
use teloxide::prelude::*;
use tracing::{info, warn};

use tg_like_guard::{
    bot::{schema, BotState},
    config::{load_config, validate_config},
    gate::Owner,
    store::{JsonFileStore, StateStore, Table},
    upstream::{Dispatcher as LikeDispatcher, HttpTransport},
    LikeService,
};

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let config_path = parse_config_arg(&args).unwrap_or_else(|| PathBuf::from("config.yaml"));

    let mut cfg = load_config(&config_path)?;
    cfg.apply_env_overrides(|k| std::env::var(k).ok());
    validate_config(&cfg)?;

    tracing_subscriber::fmt().with_env_filter(cfg.log_level()).init();

    let data_dir = cfg.data_dir();
    let store = JsonFileStore::new(&data_dir).with_strict_reads(cfg.strict_reads());
    for table in [Table::Usage, Table::Vip, Table::Groups] {
        if let Err(e) = store.get(table) {
            warn!("{} table unreadable at startup: {}", table, e);
        }
    }
    let store: Arc<dyn StateStore> = Arc::new(store);

    let policy = cfg.dispatch_policy();
    let transport = HttpTransport::new(cfg.upstream.url.trim(), policy.timeout)
        .context("build http client")?;
    let dispatcher = LikeDispatcher::new(Arc::new(transport), policy);

    let quota = cfg.quota_policy();
    let service = LikeService::new(store, Owner::new(cfg.owner_id()), quota, dispatcher);

    let bot = Bot::new(cfg.bot.token.clone());
    let me = bot.get_me().await.context("get_me")?;
    let bot_username = me.user.username.clone().unwrap_or_else(|| "bot".into());

    info!(
        "Start polling as @{} (daily limit {}, retries {}, data dir {})",
        bot_username, quota.daily_limit, policy.retry_budget, data_dir
    );

    let state = Arc::new(BotState {
        service: Arc::new(service),
        bot_username,
    });

    Dispatcher::builder(bot, schema())
        .dependencies(dptree::deps![state])
        .default_handler(|upd| async move {
            let _ = upd;
        })
        .error_handler(LoggingErrorHandler::with_custom_text("Dispatcher error"))
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    info!("shut down");
    Ok(())
}

fn parse_config_arg(args: &[String]) -> Option<PathBuf> {
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--config" && i + 1 < args.len() {
            return Some(PathBuf::from(&args[i + 1]));
        }
        i += 1;
    }
    None
}
