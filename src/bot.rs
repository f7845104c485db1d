//! Telegram side: command parsing, reply rendering and the dptree schema.

use anyhow::{Context, Result};
use chrono::Utc;
use regex::Regex;
use std::sync::{Arc, OnceLock};
use teloxide::{
    dispatching::UpdateHandler,
    dptree,
    prelude::*,
    requests::{HasPayload, Payload},
    types::{Message, ReplyParameters},
};
use tracing::{info, warn};

use crate::gate::{DenyReason, Request as LikeRequest};
use crate::service::{AdminOutcome, LikeService, Outcome, QuotaStatus};

pub struct BotState {
    pub service: Arc<LikeService>,
    pub bot_username: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Like { region: String, target_id: String },
    Quota,
    AddGroup(Option<String>),
    RemoveGroup(Option<String>),
    AddVip(String),
    RemoveVip(String),
    Vips,
    Groups,
    Help,
    /// Known command, wrong arguments. Carries the usage line.
    Usage(&'static str),
}

const LIKE_USAGE: &str = "❌ Wrong format!\n\nUse: /like ind 123456789";
const ADDVIP_USAGE: &str = "Use: /addvip <user_id>";
const REMOVEVIP_USAGE: &str = "Use: /removevip <user_id>";

fn command_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^/([A-Za-z_]+)(?:@([A-Za-z0-9_]+))?(?:\s+(.*))?$")
            .expect("command regex compiles")
    })
}

/// Parse a message text into a command. Returns `None` for plain text,
/// unknown commands, and commands addressed to some other bot.
pub fn parse_command(text: &str, bot_username: &str) -> Option<Command> {
    let caps = command_regex().captures(text.trim())?;
    let name = caps.get(1)?.as_str().to_lowercase();
    if let Some(mention) = caps.get(2) {
        if !mention.as_str().eq_ignore_ascii_case(bot_username) {
            return None;
        }
    }
    let args: Vec<&str> = caps
        .get(3)
        .map(|m| m.as_str().split_whitespace().collect())
        .unwrap_or_default();
    let one = |usage: &'static str, mk: fn(String) -> Command| match args.as_slice() {
        [id] => mk(id.to_string()),
        _ => Command::Usage(usage),
    };

    let cmd = match name.as_str() {
        "like" => match args.as_slice() {
            [region, target] => Command::Like {
                region: region.to_string(),
                target_id: target.to_string(),
            },
            _ => Command::Usage(LIKE_USAGE),
        },
        "quota" => Command::Quota,
        "addgroup" => Command::AddGroup(args.first().map(|s| s.to_string())),
        "removegroup" => Command::RemoveGroup(args.first().map(|s| s.to_string())),
        "addvip" => one(ADDVIP_USAGE, Command::AddVip),
        "removevip" => one(REMOVEVIP_USAGE, Command::RemoveVip),
        "vips" => Command::Vips,
        "groups" => Command::Groups,
        "start" | "help" => Command::Help,
        _ => return None,
    };
    Some(cmd)
}

pub fn help_text(daily_limit: usize) -> String {
    format!(
        "👋 Like bot\n\n\
         /like <region> <uid> - send likes to a player (e.g. /like ind 123456789)\n\
         /quota - show how many likes you have left today\n\n\
         Every user can boost {} different UIDs per day. Requests only work in approved groups.",
        daily_limit
    )
}

pub fn render_deny(reason: DenyReason) -> String {
    match reason {
        DenyReason::GroupNotAllowed => "❌ This group is not allowed to use the bot.".into(),
        DenyReason::TargetAlreadyUsed => {
            "⚠️ You already sent likes to this UID today. Try again tomorrow.".into()
        }
        DenyReason::DailyLimitReached => {
            "⛔ You have reached your daily limit. Try again tomorrow.".into()
        }
        DenyReason::NotAuthorized => "❌ You are not authorized to use this command.".into(),
        DenyReason::MissingTarget => LIKE_USAGE.into(),
    }
}

pub fn render_outcome(outcome: &Outcome, daily_limit: usize) -> String {
    match outcome {
        Outcome::Granted { receipt, remaining } => {
            let mut text = format!(
                "✅ Likes sent successfully!\n\n\
                 👤 Name: {}\n\
                 🎯 UID: {}\n\
                 🌍 Region: {}\n\
                 👍 Likes Before: {}\n\
                 🚀 Added: {}\n\
                 📊 Likes After: {}",
                receipt.nickname,
                receipt.target_id,
                receipt.region,
                receipt.before,
                receipt.added,
                receipt.after
            );
            if let Some(left) = remaining {
                text.push_str(&format!("\n\n📅 Remaining today: {}/{}", left, daily_limit));
            }
            text
        }
        Outcome::Denied { reason } => render_deny(*reason),
        Outcome::UpstreamRejected { detail } => {
            format!("⚠️ Like request was rejected: {}", detail)
        }
        Outcome::TransportError { .. } => {
            "❌ The like service is not responding right now. Please try again later.".into()
        }
        Outcome::StorageUnavailable { .. } => {
            "❌ The bot cannot read its data right now. Please try again later.".into()
        }
    }
}

pub fn render_admin(outcome: &AdminOutcome, subject: &str) -> String {
    match outcome {
        AdminOutcome::Added => format!("✅ {} added.", subject),
        AdminOutcome::AlreadyPresent => format!("ℹ️ {} is already in the list.", subject),
        AdminOutcome::Removed => format!("✅ {} removed.", subject),
        AdminOutcome::NotPresent => format!("ℹ️ {} was not in the list.", subject),
        AdminOutcome::Listed(ids) if ids.is_empty() => format!("{}: (none)", subject),
        AdminOutcome::Listed(ids) => format!("{}:\n{}", subject, ids.join("\n")),
        AdminOutcome::Denied(reason) => render_deny(*reason),
        AdminOutcome::Failed(e) => format!("❌ Could not update {}: {}", subject, e),
    }
}

pub fn render_quota(status: &QuotaStatus) -> String {
    match status {
        QuotaStatus::Vip => "💎 You are VIP: no daily limit.".into(),
        QuotaStatus::Remaining {
            used,
            remaining,
            limit,
        } => format!(
            "📅 Used today: {}/{}\n🎟 Remaining: {}",
            used, limit, remaining
        ),
        QuotaStatus::Unavailable(_) => {
            "❌ The bot cannot read its data right now. Please try again later.".into()
        }
    }
}

async fn api_log<R>(ctx: &str, req: R) -> Option<<R::Payload as Payload>::Output>
where
    R: teloxide::requests::Request + HasPayload,
{
    match req.send().await {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("API call failed ({ctx}): {:?}", e);
            None
        }
    }
}

async fn reply(bot: &Bot, msg: &Message, text: String) -> Option<Message> {
    api_log(
        "send_message",
        bot.send_message(msg.chat.id, text)
            .reply_parameters(ReplyParameters::new(msg.id)),
    )
    .await
}

async fn handle_like(
    bot: &Bot,
    state: &BotState,
    msg: &Message,
    requester_id: String,
    region: String,
    target_id: String,
) -> Result<()> {
    let req = LikeRequest {
        requester_id,
        chat_id: msg.chat.id.0.to_string(),
        target_id,
        region,
    };

    let status = reply(bot, msg, "⏳ Processing your like request...".into()).await;

    let outcome = state.service.handle_like_request(&req, Utc::now()).await;
    let text = render_outcome(&outcome, state.service.daily_limit());

    match status {
        Some(status) => {
            let edited = api_log(
                "edit_message_text",
                bot.edit_message_text(status.chat.id, status.id, text.clone()),
            )
            .await;
            if edited.is_none() {
                reply(bot, msg, text).await;
            }
        }
        None => {
            reply(bot, msg, text).await;
        }
    }
    Ok(())
}

pub async fn handle_message(bot: &Bot, state: &BotState, msg: &Message) -> Result<()> {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let Some(cmd) = parse_command(text, &state.bot_username) else {
        return Ok(());
    };
    let from = msg.from.as_ref().context("message without sender")?;
    let caller = from.id.0.to_string();
    let here = msg.chat.id.0.to_string();
    let svc = &state.service;

    info!("command {:?} from {} in {}", cmd, caller, here);

    let answer = match cmd {
        Command::Like { region, target_id } => {
            return handle_like(bot, state, msg, caller, region, target_id).await;
        }
        Command::Quota => render_quota(&svc.quota_status(&caller, Utc::now()).await),
        Command::AddGroup(chat) => {
            let chat = chat.unwrap_or(here);
            render_admin(&svc.add_allowed_group(&caller, &chat).await, &format!("Group {}", chat))
        }
        Command::RemoveGroup(chat) => {
            let chat = chat.unwrap_or(here);
            render_admin(
                &svc.remove_allowed_group(&caller, &chat).await,
                &format!("Group {}", chat),
            )
        }
        Command::AddVip(user) => {
            render_admin(&svc.add_vip(&caller, &user).await, &format!("VIP {}", user))
        }
        Command::RemoveVip(user) => {
            render_admin(&svc.remove_vip(&caller, &user).await, &format!("VIP {}", user))
        }
        Command::Vips => render_admin(&svc.list_vips(&caller).await, "VIP users"),
        Command::Groups => render_admin(&svc.list_allowed_groups(&caller).await, "Allowed groups"),
        Command::Help => help_text(svc.daily_limit()),
        Command::Usage(usage) => usage.to_string(),
    };

    reply(bot, msg, answer).await;
    Ok(())
}

pub fn schema() -> UpdateHandler<anyhow::Error> {
    dptree::entry().branch(Update::filter_message().endpoint(
        |bot: Bot, state: Arc<BotState>, msg: Message| async move {
            if let Err(e) = handle_message(&bot, &state, &msg).await {
                warn!("handle_message failed: {:?}", e);
            }
            Ok(())
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::LikeReceipt;

    #[test]
    fn parses_like_with_and_without_mention() {
        let want = Some(Command::Like {
            region: "ind".into(),
            target_id: "123456789".into(),
        });
        assert_eq!(parse_command("/like ind 123456789", "LikeBot"), want);
        assert_eq!(parse_command("  /like@likebot   ind  123456789 ", "LikeBot"), want);
        assert_eq!(parse_command("/like@otherbot ind 123456789", "LikeBot"), None);
    }

    #[test]
    fn wrong_argument_count_yields_usage() {
        assert_eq!(parse_command("/like ind", "b"), Some(Command::Usage(LIKE_USAGE)));
        assert_eq!(
            parse_command("/like ind 1 2", "b"),
            Some(Command::Usage(LIKE_USAGE))
        );
        assert_eq!(parse_command("/addvip", "b"), Some(Command::Usage(ADDVIP_USAGE)));
    }

    #[test]
    fn admin_commands_and_plain_text() {
        assert_eq!(parse_command("/addgroup", "b"), Some(Command::AddGroup(None)));
        assert_eq!(
            parse_command("/removegroup -1001", "b"),
            Some(Command::RemoveGroup(Some("-1001".into())))
        );
        assert_eq!(parse_command("/addvip 42", "b"), Some(Command::AddVip("42".into())));
        assert_eq!(parse_command("/START", "b"), Some(Command::Help));
        assert_eq!(parse_command("hello /like ind 1", "b"), None);
        assert_eq!(parse_command("/unknown", "b"), None);
    }

    #[test]
    fn granted_reply_shows_counts_and_remaining() {
        let out = Outcome::Granted {
            receipt: LikeReceipt {
                nickname: "Neo".into(),
                target_id: "123".into(),
                region: "IND".into(),
                before: 10,
                after: 110,
                added: 100,
            },
            remaining: Some(1),
        };
        let text = render_outcome(&out, 3);
        assert!(text.contains("Name: Neo"));
        assert!(text.contains("Added: 100"));
        assert!(text.contains("Remaining today: 1/3"));
    }

    #[test]
    fn failures_do_not_leak_internal_details() {
        let text = render_outcome(
            &Outcome::TransportError {
                detail: "http error: connection refused to 10.0.0.3".into(),
            },
            3,
        );
        assert!(!text.contains("10.0.0.3"));
        assert_eq!(
            render_admin(&AdminOutcome::Denied(DenyReason::NotAuthorized), "VIP 1"),
            "❌ You are not authorized to use this command."
        );
    }
}
